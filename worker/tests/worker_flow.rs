use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use gpu_worker::{
    config::{ConfigContext, Paths, WorkerConfig},
    restful::{FetchOutcome, ServerAPI, WorkApi},
    runner::{Invocation, RunOutcome, SearchRunner},
    status::{StatusChannel, StatusReporter},
    worker::{Outcome, Worker},
};
use serde_json::json;
use shared::{
    errors::{ChannelError, FetchError, SubmitError},
    types::{Keyspace, PendingKey, WorkBlock},
};
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

/// In-memory pool: scripted fetch answers, then `AllSolved` forever.
struct FakePool {
    answers: Mutex<VecDeque<Result<FetchOutcome, FetchError>>>,
    accept: bool,
    submitted: Mutex<Vec<Vec<PendingKey>>>,
}

impl FakePool {
    fn new(answers: Vec<Result<FetchOutcome, FetchError>>, accept: bool) -> Arc<Self> {
        Arc::new(FakePool {
            answers: Mutex::new(answers.into()),
            accept,
            submitted: Mutex::new(vec![]),
        })
    }

    fn submitted(&self) -> Vec<Vec<PendingKey>> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkApi for FakePool {
    async fn fetch_block(&self, _cfg: &WorkerConfig) -> Result<FetchOutcome, FetchError> {
        self.answers.lock().unwrap().pop_front().unwrap_or(Ok(FetchOutcome::AllSolved))
    }

    async fn submit_batch(
        &self,
        _cfg: &WorkerConfig,
        keys: &[PendingKey],
        required: usize,
    ) -> Result<(), SubmitError> {
        if keys.len() != required {
            return Err(SubmitError::BatchSize { expected: required, got: keys.len() });
        }
        self.submitted.lock().unwrap().push(keys.to_vec());
        if self.accept {
            Ok(())
        } else {
            Err(SubmitError::Status { code: 500, body: String::new() })
        }
    }
}

/// Writes a canned result file instead of running a GPU program.
struct FakeSearch {
    output: Vec<u8>,
    runs: Mutex<Vec<Invocation>>,
}

impl FakeSearch {
    fn new(output: &str) -> Arc<Self> {
        Self::with_bytes(output.as_bytes().to_vec())
    }

    fn with_bytes(output: Vec<u8>) -> Arc<Self> {
        Arc::new(FakeSearch { output, runs: Mutex::new(vec![]) })
    }

    fn runs(&self) -> Vec<Invocation> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchRunner for FakeSearch {
    async fn run(&self, invocation: &Invocation) -> RunOutcome {
        self.runs.lock().unwrap().push(invocation.clone());
        std::fs::write(&invocation.output_file, &self.output).unwrap();
        RunOutcome::Success
    }
}

/// Keeps every text sent to the notification service.
#[derive(Clone, Default)]
struct Recording(Arc<Mutex<Vec<String>>>);

impl Recording {
    fn last(&self) -> String {
        self.0.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl StatusChannel for Recording {
    async fn create(&self, text: &str, _html: bool) -> Result<i64, ChannelError> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(7)
    }

    async fn edit(&self, _message_id: i64, text: &str) -> Result<(), ChannelError> {
        self.0.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

fn config(watch: &[&str], one_shot: bool) -> WorkerConfig {
    WorkerConfig {
        api_url: "http://pool.invalid/api/block".into(),
        watch_addresses: watch.iter().map(|a| a.to_string()).collect(),
        vanity_path: "vanitysearch".into(),
        one_shot,
        post_block_delay: Duration::ZERO,
        retry_delay: Duration::ZERO,
        ..WorkerConfig::default()
    }
}

fn block(cfg: &WorkerConfig, addresses: usize, start: &str, end: &str) -> FetchOutcome {
    FetchOutcome::Block(WorkBlock {
        keyspace: Keyspace::new(start, end),
        watch_addresses: cfg.watch_addresses.clone(),
        candidate_addresses: (0..addresses).map(|i| format!("1Addr{i}")).collect(),
    })
}

fn hex_key(value: u64) -> String {
    format!("{value:064x}")
}

fn worker(
    cfg: WorkerConfig,
    paths: Paths,
    api: Arc<dyn WorkApi>,
    search: Arc<dyn SearchRunner>,
) -> Worker {
    worker_with_channel(cfg, paths, api, search, None)
}

fn worker_with_channel(
    cfg: WorkerConfig,
    paths: Paths,
    api: Arc<dyn WorkApi>,
    search: Arc<dyn SearchRunner>,
    channel: Option<Recording>,
) -> Worker {
    let channel = channel.map(|c| Box::new(c) as Box<dyn StatusChannel>);
    let reporter = StatusReporter::new(channel, paths.status_state_file.clone(), &cfg);
    Worker::new(ConfigContext::fixed(cfg), paths, api, search, reporter)
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn watched_address_hit_is_recorded_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let cfg = WorkerConfig {
        telegram_token: "t".into(),
        telegram_chat_id: "42".into(),
        ..config(&["A1"], false)
    };
    let answer = FetchOutcome::Block(WorkBlock {
        keyspace: Keyspace::new("0x00", "0x10"),
        watch_addresses: cfg.watch_addresses.clone(),
        candidate_addresses: vec!["A1".into()],
    });
    let pool = FakePool::new(vec![Ok(answer)], true);
    let search = FakeSearch::new(&format!("Pub Addr: A1\nPriv (HEX): {}\n", hex_key(1)));

    let channel = Recording::default();

    let mut worker =
        worker_with_channel(cfg, paths.clone(), pool.clone(), search.clone(), Some(channel.clone()));
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::KeyFound);
    assert_eq!(read(&paths.keyfound_file), format!("A1:{}\n", hex_key(1)));
    assert_eq!(read(&paths.address_file), "A1\n");
    assert!(worker.queue().is_empty());
    assert!(pool.submitted().is_empty());
    assert_eq!(worker.reporter().snapshot().keyfound, "1 saved to KEYFOUND.txt");
    assert!(channel.last().contains("<b>Keyfound</b>: <code>1 saved to KEYFOUND.txt</code>"));
    assert!(channel.last().contains("<b>Range</b>: <code>00:10</code>"));
    assert_eq!(read(&paths.status_state_file), r#"{"42::default":7}"#);

    let runs = search.runs();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].args.ends_with(&["--keyspace".to_string(), "00:10".to_string()]));
}

#[tokio::test]
async fn garbled_output_line_does_not_hide_a_hit() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let cfg = config(&["A1"], false);
    let answer = block(&cfg, 4, "0x00", "0x10");
    let pool = FakePool::new(vec![Ok(answer)], true);

    let mut output = b"progress \xff\xfe garbage\n".to_vec();
    output.extend_from_slice(format!("Pub Addr: A1\nPriv (HEX): {}\n", hex_key(1)).as_bytes());
    let search = FakeSearch::with_bytes(output);

    let mut worker = worker(cfg, paths.clone(), pool.clone(), search);
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::KeyFound);
    assert_eq!(read(&paths.keyfound_file), format!("A1:{}\n", hex_key(1)));
    assert!(pool.submitted().is_empty());
}

#[tokio::test]
async fn repeated_keyspace_is_searched_but_announced_once() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let cfg = WorkerConfig {
        telegram_token: "t".into(),
        telegram_chat_id: "42".into(),
        ..config(&[], false)
    };
    let answers = vec![
        Ok(block(&cfg, 3, "0x00", "0x10")),
        Ok(block(&cfg, 5, "0x00", "0x10")),
    ];
    let pool = FakePool::new(answers, true);
    let search = FakeSearch::new("");
    let channel = Recording::default();

    let mut worker =
        worker_with_channel(cfg, paths, pool, search.clone(), Some(channel.clone()));
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::AllSolved);
    assert_eq!(search.runs().len(), 2);
    assert_eq!(worker.reporter().snapshot().address_count, 3);
    let sent = channel.0.lock().unwrap().clone();
    assert!(sent.iter().any(|text| text.contains("<b>Addresses</b>: <code>3</code>")));
    assert!(!sent.iter().any(|text| text.contains("<b>Addresses</b>: <code>5</code>")));
}

#[tokio::test]
async fn all_solved_conflict_ends_without_searching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "error": "All work is solved" })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let cfg = WorkerConfig { api_url: format!("{}/api/block", server.uri()), ..config(&[], false) };
    let search = FakeSearch::new("");

    let mut worker = worker(cfg, paths, Arc::new(ServerAPI::new().unwrap()), search.clone());
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::AllSolved);
    assert!(search.runs().is_empty());
    assert!(worker.reporter().snapshot().all_solved);
    assert_eq!(worker.reporter().snapshot().next_fetch_in, 0);
}

#[tokio::test]
async fn one_shot_pads_short_remainder_and_exits() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let cfg = config(&[], true);
    let answer = block(&cfg, 12, "0x1000", "0x2000");
    let pool = FakePool::new(vec![Ok(answer)], true);
    let found: Vec<String> = (0..5).map(|i| hex_key(0x1100 + i)).collect();
    let search = FakeSearch::new(&found.join("\n"));

    let mut worker = worker(cfg, paths.clone(), pool.clone(), search);
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::Success);
    let submitted = pool.submitted();
    assert_eq!(submitted.len(), 1);
    let batch = &submitted[0];
    assert_eq!(batch.len(), 12);
    let real: Vec<String> = batch[..5].iter().map(|k| k.to_string()).collect();
    assert_eq!(real, found);
    for filler in &batch[5..] {
        let value = u64::from_str_radix(filler.as_str().trim_start_matches("0x"), 16).unwrap();
        assert!((0x1000..0x2000).contains(&value));
    }

    assert!(worker.queue().is_empty());
    assert_eq!(read(&paths.queue_file), "[]");
    assert_eq!(read(&paths.output_file), "");
    assert_eq!(worker.reporter().snapshot().last_batch, "Sent 12 keys");
}

#[tokio::test]
async fn transient_fetch_failure_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let cfg = config(&[], true);
    let answers = vec![
        Err(FetchError::Transport("Timeout".into())),
        Err(FetchError::NoRange("No available random range".into())),
        Ok(block(&cfg, 3, "0x00", "")),
        Ok(block(&cfg, 0, "0x00", "0x10")),
        Ok(block(&cfg, 3, "0x00", "0x10")),
    ];
    let pool = FakePool::new(answers, true);
    let search = FakeSearch::new("");

    let mut worker = worker(cfg, paths, pool.clone(), search.clone());
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(search.runs().len(), 1);
    assert!(pool.submitted().is_empty());
    assert_eq!(worker.reporter().snapshot().range, "00:10");
    assert_eq!(
        worker.reporter().snapshot().last_error,
        "No range available: `No available random range`"
    );
}

#[tokio::test]
async fn rejected_batch_stays_queued_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let cfg = config(&[], false);
    let answer = block(&cfg, 10, "0x1000", "0x2000");
    let pool = FakePool::new(vec![Ok(answer)], false);
    let found: Vec<String> = (0..3).map(|i| hex_key(0x1500 + i)).collect();
    let search = FakeSearch::new(&found.join("\n"));

    let mut worker = worker(cfg, paths.clone(), pool.clone(), search);
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::AllSolved);
    // one padded attempt after parsing, one more from the idle drain
    assert_eq!(pool.submitted().len(), 2);
    let kept: Vec<String> = worker.queue().keys().iter().map(|k| k.to_string()).collect();
    assert_eq!(kept, found);

    let on_disk: Vec<String> = serde_json::from_str(&read(&paths.queue_file)).unwrap();
    assert_eq!(on_disk, found);
    assert_eq!(worker.reporter().snapshot().last_batch, "Failed status 500");
}

#[tokio::test]
async fn restored_queue_is_flushed_before_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let stored: Vec<String> = (0..10).map(|i| hex_key(0x10 + i)).collect();
    std::fs::write(&paths.queue_file, serde_json::to_string(&stored).unwrap()).unwrap();

    let pool = FakePool::new(vec![], true);
    let search = FakeSearch::new("");
    let mut worker = worker(config(&[], false), paths.clone(), pool.clone(), search.clone());
    let outcome = worker.run().await.unwrap();

    assert_eq!(outcome, Outcome::AllSolved);
    let submitted = pool.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].iter().map(|k| k.to_string()).collect::<Vec<_>>(), stored);
    assert!(search.runs().is_empty());
    assert_eq!(read(&paths.queue_file), "[]");
}

#[tokio::test]
async fn unwritable_address_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths {
        address_file: dir.path().join("missing").join("in.txt"),
        ..Paths::in_dir(dir.path())
    };
    let cfg = config(&[], false);
    let answer = block(&cfg, 2, "0x00", "0x10");
    let pool = FakePool::new(vec![Ok(answer)], true);
    let search = FakeSearch::new("");

    let mut worker = worker(cfg, paths, pool, search.clone());
    assert!(worker.run().await.is_err());
    assert!(search.runs().is_empty());
}
