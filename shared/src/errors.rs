use thiserror::Error;

pub const CATEGORY_NO_RANGE: &str = "no_range";
pub const CATEGORY_FETCH: &str = "api_fetch_error";
pub const CATEGORY_POST: &str = "post_error";
pub const CATEGORY_POST_NETWORK: &str = "post_network_error";

/// Why a work block could not be obtained. `AllSolved` is not an error and
/// never shows up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("no range available: {0}")]
    NoRange(String),
    #[error("status code: {code}, response: {body}")]
    Status { code: u16, body: String },
    #[error("request error: {0}")]
    Transport(String),
    #[error("fail to decode block: {0}")]
    Decode(String),
}

impl FetchError {
    /// status update category used for rate limiting
    pub fn category(&self) -> &'static str {
        match self {
            FetchError::NoRange(_) => CATEGORY_NO_RANGE,
            _ => CATEGORY_FETCH,
        }
    }

    /// text for the `last error` status field
    pub fn status_text(&self) -> String {
        match self {
            FetchError::NoRange(msg) => format!("No range available: `{msg}`"),
            FetchError::Status { code, .. } => format!("API error `{code}`"),
            FetchError::Transport(kind) => format!("API connection error `{kind}`"),
            FetchError::Decode(_) => "API error `invalid body`".to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("batch size mismatch: expected {expected}, got {got}")]
    BatchSize { expected: usize, got: usize },
    #[error("status code: {code}, response: {body}")]
    Status { code: u16, body: String },
    #[error("request error: {0}")]
    Transport(String),
}

impl SubmitError {
    pub fn category(&self) -> &'static str {
        match self {
            SubmitError::Transport(_) => CATEGORY_POST_NETWORK,
            _ => CATEGORY_POST,
        }
    }

    /// text for the `last batch` status field
    pub fn status_text(&self) -> String {
        match self {
            SubmitError::BatchSize { got, .. } => format!("Rejected batch of {got}"),
            SubmitError::Status { code, .. } => format!("Failed status {code}"),
            SubmitError::Transport(kind) => format!("Connection error {kind}"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("notification channel is not configured")]
    NotConfigured,
    #[error("status code: {code}, response: {body}")]
    Status { code: u16, body: String },
    #[error("request error: {0}")]
    Transport(String),
    #[error("fail to decode response: {0}")]
    Decode(String),
}
