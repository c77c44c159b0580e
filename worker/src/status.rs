use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    errors::ChannelError,
    interaction::{EditMessage, MessageResult, SendMessage, TelegramResponse},
    local_time,
    utils::{escape_html, snippet, strip_tags},
};
use tokio::fs;
use tracing::*;

use crate::{config::WorkerConfig, restful::error_kind, USER_AGENT};

/// Minimum spacing between two status updates of the same failure category.
pub const RATE_LIMIT: Duration = Duration::from_secs(300);

const TELEGRAM_API: &str = "https://api.telegram.org";
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub gpu: String,
    pub range: String,
    pub address_count: usize,
    pub pending_count: usize,
    pub last_batch: String,
    pub last_error: String,
    pub keyfound: String,
    pub next_fetch_in: u64,
    pub all_solved: bool,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        StatusSnapshot {
            gpu: String::new(),
            range: String::new(),
            address_count: 0,
            pending_count: 0,
            last_batch: "-".into(),
            last_error: "-".into(),
            keyfound: "-".into(),
            next_fetch_in: 0,
            all_solved: false,
        }
    }
}

/// Fields to change; `None` leaves the current value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub gpu: Option<String>,
    pub range: Option<String>,
    pub address_count: Option<usize>,
    pub pending_count: Option<usize>,
    pub last_batch: Option<String>,
    pub last_error: Option<String>,
    pub keyfound: Option<String>,
    pub next_fetch_in: Option<u64>,
    pub all_solved: Option<bool>,
}

impl StatusSnapshot {
    pub fn merge(&mut self, update: StatusUpdate) {
        if let Some(v) = update.gpu {
            self.gpu = v;
        }
        if let Some(v) = update.range {
            self.range = v;
        }
        if let Some(v) = update.address_count {
            self.address_count = v;
        }
        if let Some(v) = update.pending_count {
            self.pending_count = v;
        }
        if let Some(v) = update.last_batch {
            self.last_batch = v;
        }
        if let Some(v) = update.last_error {
            self.last_error = v;
        }
        if let Some(v) = update.keyfound {
            self.keyfound = v;
        }
        if let Some(v) = update.next_fetch_in {
            self.next_fetch_in = v;
        }
        if let Some(v) = update.all_solved {
            self.all_solved = v;
        }
    }

    /// Telegram HTML. Every free-text field is escaped.
    pub fn render_html(&self, worker_name: &str, updated_at: &str) -> String {
        let mut lines = vec![];
        if !worker_name.is_empty() {
            lines.push(format!("👷 <b>Worker</b>: <code>{}</code>", escape_html(worker_name)));
            lines.push(String::new());
        }
        lines.extend([
            "📊 <b>Status</b>".to_string(),
            format!("⚙️ <b>GPU</b>: <code>{}</code>", escape_html(&self.gpu)),
            format!("🧭 <b>Range</b>: <code>{}</code>", escape_html(&self.range)),
            format!("📫 <b>Addresses</b>: <code>{}</code>", self.address_count),
            format!("📦 <b>Pending Keys</b>: <code>{}</code>", self.pending_count),
            format!("📤 <b>Last Batch</b>: <code>{}</code>", escape_html(&self.last_batch)),
            format!("❗ <b>Last Error</b>: <i>{}</i>", escape_html(&self.last_error)),
            format!("🔑 <b>Keyfound</b>: <code>{}</code>", escape_html(&self.keyfound)),
            format!("⏱️ <b>Next Fetch</b>: <code>{}s</code>", self.next_fetch_in),
            format!("🕒 <i>Updated {}</i>", escape_html(updated_at)),
        ]);
        if self.all_solved {
            lines.push("🏁 <b>All blocks solved</b> ✅".to_string());
        }
        lines.join("\n")
    }
}

/// The notification service holding the status message.
#[async_trait]
pub trait StatusChannel: Send + Sync {
    /// posts a new message and returns its id
    async fn create(&self, text: &str, html: bool) -> Result<i64, ChannelError>;

    async fn edit(&self, message_id: i64, text: &str) -> Result<(), ChannelError>;
}

pub struct TelegramChannel {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn with_base_url(base_url: &str, token: &str, chat_id: &str) -> anyhow::Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).timeout(STATUS_TIMEOUT).build()?;
        Ok(TelegramChannel {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }
}

#[async_trait]
impl StatusChannel for TelegramChannel {
    async fn create(&self, text: &str, html: bool) -> Result<i64, ChannelError> {
        let payload = SendMessage {
            chat_id: &self.chat_id,
            text,
            parse_mode: html.then_some("HTML"),
            disable_web_page_preview: true,
        };
        let response = self
            .client
            .post(self.endpoint("sendMessage"))
            .form(&payload)
            .send()
            .await
            .map_err(|err| ChannelError::Transport(error_kind(&err)))?;

        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        if status != 200 {
            return Err(ChannelError::Status { code: status, body: snippet(&text, 200) });
        }
        serde_json::from_str::<TelegramResponse<MessageResult>>(&text)
            .map_err(|err| ChannelError::Decode(err.to_string()))?
            .result
            .map(|m| m.message_id)
            .ok_or_else(|| ChannelError::Decode("missing message_id".to_string()))
    }

    async fn edit(&self, message_id: i64, text: &str) -> Result<(), ChannelError> {
        let payload = EditMessage {
            chat_id: &self.chat_id,
            message_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };
        let response = self
            .client
            .post(self.endpoint("editMessageText"))
            .form(&payload)
            .send()
            .await
            .map_err(|err| ChannelError::Transport(error_kind(&err)))?;

        let status = response.status().as_u16();
        if status == 200 {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(ChannelError::Status { code: status, body: snippet(&text, 120) })
    }
}

async fn load_state(path: &Path) -> HashMap<String, i64> {
    fs::read_to_string(path)
        .await
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

async fn save_state(path: &Path, state: &HashMap<String, i64>) -> io::Result<()> {
    fs::write(path, serde_json::to_string(state)?).await
}

fn telegram_channel(api_base: &str, cfg: &WorkerConfig) -> Option<Box<dyn StatusChannel>> {
    if !cfg.telegram_enabled() {
        return None;
    }
    match TelegramChannel::with_base_url(api_base, &cfg.telegram_token, &cfg.telegram_chat_id) {
        Ok(channel) => Some(Box::new(channel)),
        Err(err) => {
            error!("fail to build telegram client: {err:#}");
            None
        }
    }
}

/// Keeps one status message per chat and worker up to date.
pub struct StatusReporter {
    channel: Option<Box<dyn StatusChannel>>,
    api_base: String,
    state_file: PathBuf,
    token: String,
    chat_id: String,
    worker_name: String,
    gpu_index: String,
    snapshot: StatusSnapshot,
    message_id: Option<i64>,
    last_text: Option<String>,
    last_sent: HashMap<String, Instant>,
}

impl StatusReporter {
    pub fn new<P: Into<PathBuf>>(
        channel: Option<Box<dyn StatusChannel>>,
        state_file: P,
        cfg: &WorkerConfig,
    ) -> Self {
        StatusReporter {
            channel,
            api_base: TELEGRAM_API.to_string(),
            state_file: state_file.into(),
            token: cfg.telegram_token.clone(),
            chat_id: cfg.telegram_chat_id.clone(),
            worker_name: cfg.worker_name.clone(),
            gpu_index: cfg.gpu_index.clone(),
            snapshot: StatusSnapshot::default(),
            message_id: None,
            last_text: None,
            last_sent: HashMap::new(),
        }
    }

    /// Telegram when configured, otherwise a reporter that only logs.
    pub fn from_config<P: Into<PathBuf>>(state_file: P, cfg: &WorkerConfig) -> Self {
        Self::from_config_with_api(TELEGRAM_API, state_file, cfg)
    }

    pub fn from_config_with_api<P: Into<PathBuf>>(
        api_base: &str,
        state_file: P,
        cfg: &WorkerConfig,
    ) -> Self {
        let mut reporter = Self::new(telegram_channel(api_base, cfg), state_file, cfg);
        reporter.api_base = api_base.to_string();
        reporter
    }

    /// Follows credential, chat and worker name changes between cycles. New
    /// credentials replace the channel, empty ones switch reporting off.
    pub fn configure(&mut self, cfg: &WorkerConfig) {
        let credentials_changed =
            cfg.telegram_token != self.token || cfg.telegram_chat_id != self.chat_id;
        if credentials_changed || cfg.worker_name != self.worker_name {
            self.message_id = None;
            self.last_text = None;
        }
        if credentials_changed {
            self.channel = telegram_channel(&self.api_base, cfg);
            info!(
                "telegram settings changed, status messages {}",
                if self.channel.is_some() { "enabled" } else { "disabled" }
            );
        }
        self.token = cfg.telegram_token.clone();
        self.chat_id = cfg.telegram_chat_id.clone();
        self.worker_name = cfg.worker_name.clone();
        self.gpu_index = cfg.gpu_index.clone();
    }

    pub fn snapshot(&self) -> &StatusSnapshot {
        &self.snapshot
    }

    fn state_key(&self) -> String {
        let worker = if self.worker_name.is_empty() { "default" } else { &self.worker_name };
        format!("{}::{worker}", self.chat_id)
    }

    pub async fn report(&mut self, update: StatusUpdate) {
        self.snapshot.merge(update);
        if self.snapshot.gpu.is_empty() {
            self.snapshot.gpu = self.gpu_index.clone();
        }
        let text = self.snapshot.render_html(&self.worker_name, &local_time());
        self.deliver(text).await;
    }

    /// Like `report`, but dropped entirely when `category` went out less than
    /// `min_interval` ago. Returns whether the update was applied.
    pub async fn report_rate_limited(
        &mut self,
        update: StatusUpdate,
        category: &str,
        min_interval: Duration,
    ) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_sent.get(category) {
            if now.duration_since(*last) < min_interval {
                debug!("status update `{category}` suppressed");
                return false;
            }
        }
        self.last_sent.insert(category.to_string(), now);
        self.report(update).await;
        true
    }

    async fn deliver(&mut self, text: String) {
        let Some(channel) = self.channel.as_deref() else {
            debug!("telegram settings missing, status not sent");
            return;
        };
        if self.last_text.as_deref() == Some(text.as_str()) {
            return;
        }

        let key = self.state_key();
        let known = match self.message_id {
            Some(id) => Some(id),
            None => load_state(&self.state_file).await.get(&key).copied(),
        };
        let Some(message_id) = known else {
            if let Some(id) = create_message(channel, &text).await {
                self.message_id = Some(id);
                self.last_text = Some(text);
                let mut state = load_state(&self.state_file).await;
                state.insert(key, id);
                if let Err(err) = save_state(&self.state_file, &state).await {
                    warn!("fail to persist status message id: {err}");
                }
            }
            return;
        };

        self.message_id = Some(message_id);
        match channel.edit(message_id, &text).await {
            Ok(()) => {
                debug!("telegram status updated");
                self.last_text = Some(text);
            }
            Err(err) => {
                warn!("status edit failed ({err}), a new message will be created");
                self.message_id = None;
                self.last_text = None;
                let mut state = load_state(&self.state_file).await;
                if state.remove(&key).is_some() {
                    if let Err(err) = save_state(&self.state_file, &state).await {
                        warn!("fail to persist status state: {err}");
                    }
                }
            }
        }
    }
}

/// HTML first; if the service rejects it, retry once as plain text.
async fn create_message(channel: &dyn StatusChannel, text: &str) -> Option<i64> {
    match channel.create(text, true).await {
        Ok(id) => Some(id),
        Err(ChannelError::Status { code, body }) => {
            error!("error creating telegram status message: {code} {body}");
            match channel.create(&strip_tags(text), false).await {
                Ok(id) => Some(id),
                Err(err) => {
                    error!("plain text status message failed too: {err}");
                    None
                }
            }
        }
        Err(err) => {
            error!("request error while creating telegram status message: {err}");
            None
        }
    }
}
