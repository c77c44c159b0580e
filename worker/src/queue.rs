use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use shared::{
    types::{Keyspace, PendingKey},
    utils::strip_hex_prefix,
};
use tokio::{fs, time};
use tracing::*;

use crate::config::{WorkerConfig, DEFAULT_MAX_BATCH, DEFAULT_MIN_BATCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// stop at the first failed submission
    NonBlocking,
    /// back off and retry until every full batch is accepted
    Blocking,
}

/// Where batches go. Returns `true` once the pool accepted the batch.
#[async_trait]
pub trait BatchSink: Send {
    async fn submit(&mut self, batch: &[PendingKey], required: usize) -> bool;
}

pub fn required_batch_size(address_count: Option<usize>, min: usize, max: usize) -> usize {
    address_count.unwrap_or(min).max(min).min(max)
}

fn key_value(key: &str) -> Option<BigUint> {
    BigUint::parse_bytes(strip_hex_prefix(key.trim()).as_bytes(), 16)
}

/// Random keys drawn uniformly from `[start, end)`, none equal to a key in `exclude`
/// or to each other. May return fewer than `count` if the range is too crowded.
pub fn generate_filler_keys(
    count: usize,
    start: &BigUint,
    end: &BigUint,
    exclude: &[PendingKey],
) -> Vec<PendingKey> {
    if count == 0 || end <= start {
        return vec![];
    }
    let span = end - start;
    let mut taken: HashSet<BigUint> = exclude.iter().filter_map(|k| key_value(k.as_str())).collect();
    let mut rng = OsRng;
    let mut out = Vec::with_capacity(count);
    let mut attempts = 0;

    while out.len() < count && attempts < count * 100 {
        attempts += 1;
        let value = start + rng.gen_biguint_below(&span);
        if taken.insert(value.clone()) {
            out.push(PendingKey(format!("0x{value:064x}")));
        }
    }
    out
}

/// Candidate keys waiting for the pool, mirrored to a JSON file after every change.
#[derive(Debug)]
pub struct PendingQueue {
    keys: Vec<PendingKey>,
    path: PathBuf,
    min_batch: usize,
    max_batch: usize,
    backoff: Duration,
    address_count: Option<usize>,
    bounds: Option<(BigUint, BigUint)>,
}

impl PendingQueue {
    /// An empty queue backed by `path`; nothing is read until `restore`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        PendingQueue {
            keys: vec![],
            path: path.as_ref().to_path_buf(),
            min_batch: DEFAULT_MIN_BATCH,
            max_batch: DEFAULT_MAX_BATCH,
            backoff: Duration::from_secs(30),
            address_count: None,
            bounds: None,
        }
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Self {
        let mut queue = Self::new(path);
        queue.restore().await;
        queue
    }

    /// Replaces the keys with the file's content. A missing or unreadable file means empty.
    pub async fn restore(&mut self) {
        self.keys = match fs::read_to_string(&self.path).await {
            Ok(text) => match serde_json::from_str::<Vec<PendingKey>>(&text) {
                Ok(keys) => keys,
                Err(err) => {
                    warn!("ignoring malformed {}: {err}", self.path.display());
                    vec![]
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => vec![],
            Err(err) => {
                warn!("fail to read {}: {err}", self.path.display());
                vec![]
            }
        };
        if !self.keys.is_empty() {
            info!("restored {} pending keys", self.keys.len());
        }
    }

    /// picks up batch bounds and backoff from the cycle's snapshot
    pub fn configure(&mut self, cfg: &WorkerConfig) {
        self.min_batch = cfg.min_batch_size;
        self.max_batch = cfg.max_batch_size;
        self.backoff = cfg.retry_delay;
    }

    /// remembers the current block, it drives batch size and filler range
    pub fn set_block(&mut self, address_count: usize, keyspace: &Keyspace) {
        self.address_count = Some(address_count);
        self.bounds = keyspace.bounds().filter(|(start, end)| end > start);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[PendingKey] {
        &self.keys
    }

    pub fn required_batch_size(&self) -> usize {
        required_batch_size(self.address_count, self.min_batch, self.max_batch)
    }

    pub async fn enqueue(&mut self, keys: Vec<PendingKey>) {
        if keys.is_empty() {
            return;
        }
        self.keys.extend(keys);
        info!("accumulated {} keys for posting", self.keys.len());
        self.save().await;
    }

    pub async fn persist(&self) -> io::Result<()> {
        let json = serde_json::to_string(&self.keys)?;
        fs::write(&self.path, json).await
    }

    async fn save(&self) {
        if let Err(err) = self.persist().await {
            error!("fail to persist pending keys to {}: {err}", self.path.display());
        }
    }

    /// Submits every full batch, then pads a short remainder with filler keys when
    /// nothing was posted and the block range is known. Returns whether anything
    /// was accepted.
    pub async fn drain<S>(&mut self, sink: &mut S, mode: DrainMode) -> bool
    where
        S: BatchSink + ?Sized, {
        let required = self.required_batch_size();
        let mut posted = false;

        while self.keys.len() >= required {
            let batch = self.keys[..required].to_vec();
            if sink.submit(&batch, required).await {
                self.keys.drain(..required);
                posted = true;
                self.save().await;
                continue;
            }
            self.save().await;
            match mode {
                DrainMode::NonBlocking => {
                    warn!("pool unavailable, keeping {} keys for the next attempt", self.keys.len());
                    break;
                }
                DrainMode::Blocking => {
                    warn!(
                        "pool unavailable, keeping {} keys, retrying in {}s",
                        self.keys.len(),
                        self.backoff.as_secs()
                    );
                    time::sleep(self.backoff).await;
                }
            }
        }

        if posted || self.keys.is_empty() || self.keys.len() >= required {
            return posted;
        }
        let Some((start, end)) = &self.bounds else {
            return posted;
        };

        let fillers = generate_filler_keys(required - self.keys.len(), start, end, &self.keys);
        let mut batch = self.keys.clone();
        batch.extend(fillers);
        if batch.len() != required {
            warn!("could not pad {} keys to a batch of {required}", self.keys.len());
            return posted;
        }

        debug!("padding {} keys with {} fillers", self.keys.len(), required - self.keys.len());
        if sink.submit(&batch, required).await {
            self.keys.clear();
            self.save().await;
            return true;
        }
        if mode == DrainMode::Blocking {
            time::sleep(self.backoff).await;
        }
        posted
    }
}
