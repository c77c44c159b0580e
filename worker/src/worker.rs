use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};

use anyhow::anyhow;
use async_trait::async_trait;
use colored::Colorize;
use shared::{
    errors::FetchError,
    types::{FoundPair, Keyspace, PendingKey, WorkBlock},
};
use tokio::time;
use tracing::*;

use crate::{
    config::{ConfigContext, Paths, WorkerConfig},
    files::{clear_file, read_output_lines, write_address_file, write_found_keys},
    parser::{ParseResult, ResultParser},
    queue::{BatchSink, DrainMode, PendingQueue},
    restful::{FetchOutcome, WorkApi},
    runner::{keyspace_length, select_tool, Invocation, RunOutcome, SearchRunner},
    status::{StatusReporter, StatusUpdate, RATE_LIMIT},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkStep {
    Idle,
    Fetching,
    Preparing,
    Searching,
    Parsing,
    Reporting,
    Waiting,
}

/// How a run ended, short of a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// one-shot mode finished its block
    Success,
    AllSolved,
    /// a watched address was cracked
    KeyFound,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::AllSolved => write!(f, "all blocks solved"),
            Outcome::KeyFound => write!(f, "key found"),
        }
    }
}

/// Submits batches through the pool api and mirrors the result into the status message.
struct PoolSink<'a> {
    api: &'a dyn WorkApi,
    cfg: &'a WorkerConfig,
    reporter: &'a mut StatusReporter,
}

#[async_trait]
impl BatchSink for PoolSink<'_> {
    async fn submit(&mut self, batch: &[PendingKey], required: usize) -> bool {
        match self.api.submit_batch(self.cfg, batch, required).await {
            Ok(()) => {
                let update = StatusUpdate {
                    last_batch: Some(format!("Sent {} keys", batch.len())),
                    ..Default::default()
                };
                self.reporter.report(update).await;
                true
            }
            Err(err) => {
                let update = StatusUpdate { last_batch: Some(err.status_text()), ..Default::default() };
                self.reporter.report_rate_limited(update, err.category(), RATE_LIMIT).await;
                false
            }
        }
    }
}

pub struct Worker {
    config: ConfigContext,
    cfg: Arc<WorkerConfig>,
    paths: Paths,
    api: Arc<dyn WorkApi>,
    runner: Arc<dyn SearchRunner>,
    queue: PendingQueue,
    reporter: StatusReporter,
    step: WorkStep,
    block: Option<WorkBlock>,
    previous_keyspace: Option<Keyspace>,
    processed_block: bool,
}

impl Worker {
    pub fn new(
        config: ConfigContext,
        paths: Paths,
        api: Arc<dyn WorkApi>,
        runner: Arc<dyn SearchRunner>,
        reporter: StatusReporter,
    ) -> Self {
        let cfg = config.current();
        let mut queue = PendingQueue::new(&paths.queue_file);
        queue.configure(&cfg);
        Worker {
            config,
            cfg,
            paths,
            api,
            runner,
            queue,
            reporter,
            step: WorkStep::Idle,
            block: None,
            previous_keyspace: None,
            processed_block: false,
        }
    }

    pub fn step(&self) -> WorkStep {
        self.step
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn reporter(&self) -> &StatusReporter {
        &self.reporter
    }

    async fn drain(&mut self, mode: DrainMode) -> bool {
        let mut sink = PoolSink { api: self.api.as_ref(), cfg: &self.cfg, reporter: &mut self.reporter };
        self.queue.drain(&mut sink, mode).await
    }

    async fn retry_later(&self) {
        time::sleep(self.cfg.retry_delay).await;
    }

    /// Runs cycles until a terminal state. `Err` only for the fatal address file case.
    pub async fn run(&mut self) -> anyhow::Result<Outcome> {
        clear_file(&self.paths.address_file).await;
        clear_file(&self.paths.output_file).await;
        self.queue.restore().await;

        loop {
            trace!("step: {:?}", self.step);
            match self.step {
                WorkStep::Idle => {
                    self.cfg = self.config.reload();
                    self.queue.configure(&self.cfg);
                    self.reporter.configure(&self.cfg);

                    self.drain(DrainMode::Blocking).await;
                    if self.cfg.one_shot && self.processed_block {
                        info!("one-shot mode enabled, exiting after first block");
                        return Ok(Outcome::Success);
                    }
                    self.step = WorkStep::Fetching;
                }

                WorkStep::Fetching => {
                    let block = match self.api.fetch_block(&self.cfg).await {
                        Ok(FetchOutcome::Block(block)) => block,
                        Ok(FetchOutcome::AllSolved) => {
                            let update = StatusUpdate {
                                all_solved: Some(true),
                                next_fetch_in: Some(0),
                                ..Default::default()
                            };
                            self.reporter.report(update).await;
                            info!("{}", "all blocks solved, shutting down".green());
                            return Ok(Outcome::AllSolved);
                        }
                        Err(err) => {
                            self.report_fetch_error(&err).await;
                            error!(
                                "could not fetch block data, retrying in {} seconds",
                                self.cfg.retry_delay.as_secs()
                            );
                            self.retry_later().await;
                            continue;
                        }
                    };

                    if block.candidate_addresses.is_empty() {
                        warn!(
                            "no addresses found in block, retrying in {} seconds",
                            self.cfg.retry_delay.as_secs()
                        );
                        self.retry_later().await;
                        continue;
                    }
                    if !block.keyspace.is_complete() {
                        error!(
                            "key range (start/end) missing, retrying in {} seconds",
                            self.cfg.retry_delay.as_secs()
                        );
                        self.retry_later().await;
                        continue;
                    }

                    if self.previous_keyspace.as_ref() != Some(&block.keyspace) {
                        self.previous_keyspace = Some(block.keyspace.clone());
                        let update = StatusUpdate {
                            range: Some(block.keyspace.to_string()),
                            address_count: Some(block.candidate_addresses.len()),
                            gpu: Some(self.cfg.gpu_index.clone()),
                            ..Default::default()
                        };
                        self.reporter.report(update).await;
                        info!("new block: {}", block.keyspace);
                    }

                    self.queue.set_block(block.candidate_addresses.len(), &block.keyspace);
                    self.block = Some(block);
                    self.step = WorkStep::Preparing;
                }

                WorkStep::Preparing => {
                    let Some(block) = &self.block else {
                        self.step = WorkStep::Fetching;
                        continue;
                    };
                    let addresses = block.combined_addresses();
                    if let Err(err) = write_address_file(&self.paths.address_file, &addresses).await {
                        error!("fail to save addresses to '{}': {err}", self.paths.address_file.display());
                        return Err(anyhow!(
                            "cannot write address file {}: {err}",
                            self.paths.address_file.display()
                        ));
                    }
                    self.step = WorkStep::Searching;
                }

                WorkStep::Searching => {
                    let Some(block) = &self.block else {
                        self.step = WorkStep::Fetching;
                        continue;
                    };
                    let length = keyspace_length(&self.cfg, &block.keyspace);
                    let tool = select_tool(
                        length.as_ref(),
                        self.cfg.gpu_count,
                        self.cfg.auto_switch,
                        self.cfg.bitcrack_path.is_some(),
                    );
                    let invocation = Invocation::build(
                        tool,
                        &self.cfg,
                        &self.paths.address_file,
                        &self.paths.output_file,
                        &block.keyspace,
                    );
                    info!(
                        "running {} with keyspace: {}",
                        invocation.tool,
                        block.keyspace.to_string().green()
                    );

                    if let RunOutcome::Failure(reason) = self.runner.run(&invocation).await {
                        warn!("search did not complete ({reason}), parsing whatever it left");
                    }
                    self.step = WorkStep::Parsing;
                }

                WorkStep::Parsing => {
                    let lines = read_output_lines(&self.paths.output_file).await.unwrap_or_default();
                    let ParseResult { hits, keys } =
                        ResultParser::new(&self.cfg.watch_addresses).parse(&lines);
                    self.processed_block = true;
                    self.block = None;

                    if !hits.is_empty() {
                        return Ok(self.key_found(hits, keys).await);
                    }

                    if !keys.is_empty() {
                        self.queue.enqueue(keys).await;
                        let update =
                            StatusUpdate { pending_count: Some(self.queue.len()), ..Default::default() };
                        self.reporter.report(update).await;
                    }
                    self.drain(DrainMode::NonBlocking).await;

                    clear_file(&self.paths.output_file).await;
                    debug!("file '{}' cleared for next cycle", self.paths.output_file.display());
                    self.step = WorkStep::Reporting;
                }

                WorkStep::Reporting => {
                    let update = StatusUpdate {
                        pending_count: Some(self.queue.len()),
                        next_fetch_in: Some(self.cfg.post_block_delay.as_secs()),
                        ..Default::default()
                    };
                    self.reporter.report(update).await;
                    self.step = WorkStep::Waiting;
                }

                WorkStep::Waiting => {
                    if self.cfg.one_shot {
                        self.drain(DrainMode::Blocking).await;
                        info!("one-shot mode enabled, exiting after first block");
                        return Ok(Outcome::Success);
                    }
                    info!(
                        "no critical solution this round, waiting {} seconds for next fetch",
                        self.cfg.post_block_delay.as_secs()
                    );
                    time::sleep(self.cfg.post_block_delay).await;
                    self.step = WorkStep::Idle;
                }
            }
        }
    }

    async fn report_fetch_error(&mut self, err: &FetchError) {
        let update = StatusUpdate { last_error: Some(err.status_text()), ..Default::default() };
        self.reporter.report_rate_limited(update, err.category(), RATE_LIMIT).await;
    }

    async fn key_found(
        &mut self,
        hits: Vec<FoundPair>,
        keys: Vec<PendingKey>,
    ) -> Outcome {
        warn!(
            "{} {} key(s) for watched addresses found, stopping",
            "KEYFOUND".bold().magenta(),
            hits.len()
        );

        let record = &self.paths.keyfound_file;
        match write_found_keys(record, &hits).await {
            Ok(()) => info!("{} private key saved in '{}'", "KEYFOUND".bold().magenta(), record.display()),
            Err(err) => error!("fail to save private key to '{}': {err}", record.display()),
        }

        self.queue.enqueue(keys).await;
        let file_name = record.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let update = StatusUpdate {
            keyfound: Some(format!("{} saved to {file_name}", hits.len())),
            pending_count: Some(self.queue.len()),
            ..Default::default()
        };
        self.reporter.report(update).await;

        self.drain(DrainMode::Blocking).await;
        Outcome::KeyFound
    }
}
