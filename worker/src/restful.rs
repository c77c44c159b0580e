use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::{
    errors::{FetchError, SubmitError},
    interaction::{BlockResponse, ErrorResponse, SubmitBatch},
    types::{PendingKey, WorkBlock},
    utils::snippet,
};
use tracing::*;
use url::Url;

use crate::{config::WorkerConfig, USER_AGENT};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
const NO_RANGE_MESSAGE: &str = "No available random range";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Block(WorkBlock),
    /// the pool has nothing left to hand out
    AllSolved,
}

/// The pool: hands out work blocks and takes result batches.
#[async_trait]
pub trait WorkApi: Send + Sync {
    async fn fetch_block(&self, cfg: &WorkerConfig) -> Result<FetchOutcome, FetchError>;

    /// `keys.len()` must equal `required`, anything else is refused without a request.
    async fn submit_batch(
        &self,
        cfg: &WorkerConfig,
        keys: &[PendingKey],
        required: usize,
    ) -> Result<(), SubmitError>;
}

pub struct ServerAPI {
    fetch_client: Client,
    submit_client: Client,
}

impl ServerAPI {
    pub fn new() -> anyhow::Result<Self> {
        let fetch_client = Client::builder().user_agent(USER_AGENT).timeout(FETCH_TIMEOUT).build()?;
        let submit_client =
            Client::builder().user_agent(USER_AGENT).timeout(SUBMIT_TIMEOUT).build()?;
        Ok(ServerAPI { fetch_client, submit_client })
    }
}

fn is_all_solved(message: &str) -> bool {
    let message = message.trim().to_lowercase();
    message == "all blocks are solved" || message == "all work is solved"
}

/// The block endpoint and `<base>/submit`, both validated before any request goes out.
pub fn endpoints(api_url: &str) -> Result<(Url, Url), url::ParseError> {
    let fetch = Url::parse(api_url.trim())?;
    let submit = Url::parse(&format!("{}/submit", api_url.trim().trim_end_matches('/')))?;
    Ok((fetch, submit))
}

/// short name for a transport failure, shown in the status message
pub fn error_kind(err: &reqwest::Error) -> String {
    let kind = if err.is_timeout() {
        "Timeout"
    } else if err.is_connect() {
        "ConnectionError"
    } else if err.is_builder() {
        "InvalidRequest"
    } else if err.is_decode() || err.is_body() {
        "ReadError"
    } else {
        "RequestError"
    };
    kind.to_string()
}

async fn read_body(response: Response) -> (u16, String) {
    let status = response.status().as_u16();
    match response.text().await {
        Ok(text) => (status, text),
        Err(err) => {
            debug!("fail to read response content: {err:#}");
            (status, String::new())
        }
    }
}

#[async_trait]
impl WorkApi for ServerAPI {
    async fn fetch_block(&self, cfg: &WorkerConfig) -> Result<FetchOutcome, FetchError> {
        info!("fetching block from {}", cfg.api_url);
        let (url, _) = endpoints(&cfg.api_url).map_err(|err| {
            error!("invalid api url `{}`: {err}", cfg.api_url);
            FetchError::Transport("InvalidURL".to_string())
        })?;

        let mut request = self
            .fetch_client
            .get(url)
            .header("pool-token", &cfg.pool_token)
            .header("ngrok-skip-browser-warning", "true");
        if let Some(length) = &cfg.block_length {
            request = request.query(&[("length", length)]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                error!("fail to send request: {err}");
                return Err(FetchError::Transport(error_kind(&err)));
            }
        };

        let (status, text) = read_body(response).await;
        match status {
            200 => {
                let block: BlockResponse = serde_json::from_str(&text).map_err(|err| {
                    error!("fail to deserialize block: {err:#}, response: {}", snippet(&text, 200));
                    FetchError::Decode(err.to_string())
                })?;
                Ok(FetchOutcome::Block(WorkBlock::from_response(block, &cfg.watch_addresses)))
            }
            409 => {
                let message = serde_json::from_str::<ErrorResponse>(&text)
                    .map(|e| e.error)
                    .unwrap_or_else(|_| text.clone());
                let message = message.trim();
                if is_all_solved(message) {
                    return Ok(FetchOutcome::AllSolved);
                }
                error!("error fetching block: 409 - {}", snippet(&text, 200));
                let message = if message.is_empty() { NO_RANGE_MESSAGE } else { message };
                Err(FetchError::NoRange(message.to_string()))
            }
            code => {
                error!("error fetching block: {code} - {}", snippet(&text, 200));
                Err(FetchError::Status { code, body: snippet(&text, 120) })
            }
        }
    }

    async fn submit_batch(
        &self,
        cfg: &WorkerConfig,
        keys: &[PendingKey],
        required: usize,
    ) -> Result<(), SubmitError> {
        if keys.len() != required {
            error!("refusing to post {} keys, the pool expects exactly {required}", keys.len());
            return Err(SubmitError::BatchSize { expected: required, got: keys.len() });
        }

        info!("posting batch of {} private keys", keys.len());
        let (_, url) = endpoints(&cfg.api_url).map_err(|err| {
            error!("invalid api url `{}`: {err}", cfg.api_url);
            SubmitError::Transport("InvalidURL".to_string())
        })?;
        let payload = SubmitBatch { private_keys: keys.to_vec() };

        let response = self
            .submit_client
            .post(url)
            .header("pool-token", &cfg.pool_token)
            .header("ngrok-skip-browser-warning", "true")
            .json(&payload)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                error!("connection error while sending batch: {err}");
                return Err(SubmitError::Transport(error_kind(&err)));
            }
        };

        let (status, text) = read_body(response).await;
        if status == 200 {
            info!("private keys posted successfully");
            return Ok(());
        }
        let body = snippet(&text, 120);
        error!("fail to send batch: status {status}");
        if !body.is_empty() {
            debug!("detail: {body}");
        }
        Err(SubmitError::Status { code: status, body })
    }
}
