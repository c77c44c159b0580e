use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{interaction::string_or_number, utils::{parse_length_to_count, split_args}};
use tracing::*;

pub const DEFAULT_MIN_BATCH: usize = 10;
pub const DEFAULT_MAX_BATCH: usize = 30;
const DEFAULT_POST_BLOCK_DELAY: u64 = 10;
const DEFAULT_RETRY_DELAY: u64 = 30;

/// `settings.json` as written by the operator.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub user_token: String,
    #[serde(default)]
    pub telegram_accesstoken: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub telegram_chatid: String,
    pub worker_name: Option<String>,
    pub workername: Option<String>,
    #[serde(default)]
    pub additional_addresses: Vec<Value>,
    pub additional_address: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub block_length: String,
    pub vanitysearch_path: Option<String>,
    pub app_path: Option<String>,
    pub vanitysearch_arguments: Option<String>,
    pub app_arguments: Option<String>,
    pub bitcrack_path: Option<String>,
    pub bitcrack_arguments: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub gpu_index: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub gpu_count: String,
    #[serde(default)]
    pub auto_switch: bool,
    #[serde(default)]
    pub oneshot: bool,
    pub post_block_delay_enabled: Option<bool>,
    pub post_block_delay_minutes: Option<Value>,
    pub min_batch_size: Option<usize>,
    pub max_batch_size: Option<usize>,
    pub retry_delay_seconds: Option<u64>,
}

/// Immutable run parameters for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub api_url: String,
    pub pool_token: String,
    pub telegram_token: String,
    pub telegram_chat_id: String,
    pub worker_name: String,
    pub watch_addresses: Vec<String>,
    pub block_length: Option<String>,
    pub vanity_path: String,
    pub vanity_args: Vec<String>,
    pub bitcrack_path: Option<String>,
    pub bitcrack_args: Vec<String>,
    pub gpu_index: String,
    pub gpu_count: u32,
    pub auto_switch: bool,
    pub one_shot: bool,
    pub post_block_delay: Duration,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Settings::default().into()
    }
}

impl WorkerConfig {
    /// key count requested through `block_length`, if it parses
    pub fn requested_length(&self) -> Option<u128> {
        self.block_length.as_deref().and_then(parse_length_to_count)
    }

    pub fn telegram_enabled(&self) -> bool {
        !self.telegram_token.is_empty() && !self.telegram_chat_id.is_empty()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn post_block_delay(enabled: Option<bool>, minutes: Option<Value>) -> Duration {
    if !enabled.unwrap_or(true) {
        return Duration::ZERO;
    }
    let minutes = match minutes {
        None | Some(Value::Null) => return Duration::from_secs(DEFAULT_POST_BLOCK_DELAY),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match minutes {
        Some(m) if m.is_finite() => Duration::from_secs((m.max(0.0) * 60.0) as u64),
        _ => Duration::from_secs(DEFAULT_POST_BLOCK_DELAY),
    }
}

impl From<Settings> for WorkerConfig {
    fn from(s: Settings) -> Self {
        let mut watch_addresses: Vec<String> = s
            .additional_addresses
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|a| !a.trim().is_empty())
            .map(str::to_string)
            .collect();
        if let Some(legacy) = non_empty(s.additional_address) {
            if !watch_addresses.contains(&legacy) {
                watch_addresses.push(legacy);
            }
        }

        let min_batch_size = s.min_batch_size.filter(|n| *n > 0).unwrap_or(DEFAULT_MIN_BATCH);
        let max_batch_size = s.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH).max(min_batch_size);

        WorkerConfig {
            api_url: s.api_url.trim().to_string(),
            pool_token: s.user_token,
            telegram_token: s.telegram_accesstoken,
            telegram_chat_id: s.telegram_chatid,
            worker_name: non_empty(s.worker_name).or(non_empty(s.workername)).unwrap_or_default(),
            watch_addresses,
            block_length: non_empty(Some(s.block_length)),
            vanity_path: non_empty(s.vanitysearch_path).or(s.app_path).unwrap_or_default(),
            vanity_args: split_args(
                &non_empty(s.vanitysearch_arguments).or(s.app_arguments).unwrap_or_default(),
            ),
            bitcrack_path: non_empty(s.bitcrack_path),
            bitcrack_args: split_args(&s.bitcrack_arguments.unwrap_or_default()),
            gpu_index: if s.gpu_index.trim().is_empty() { "0".to_string() } else { s.gpu_index },
            gpu_count: s.gpu_count.trim().parse::<u32>().ok().filter(|n| *n > 0).unwrap_or(1),
            auto_switch: s.auto_switch,
            one_shot: s.oneshot,
            post_block_delay: post_block_delay(s.post_block_delay_enabled, s.post_block_delay_minutes),
            min_batch_size,
            max_batch_size,
            retry_delay: Duration::from_secs(s.retry_delay_seconds.unwrap_or(DEFAULT_RETRY_DELAY)),
        }
    }
}

pub fn load_config_file<P>(config_file: P) -> Result<WorkerConfig, io::Error>
where
    P: AsRef<Path>, {
    let file = File::open(config_file.as_ref()).map_err(|err| {
        io::Error::new(err.kind(), format!("{}: {err}", config_file.as_ref().display()))
    })?;
    let settings: Settings = serde_json::from_reader(file)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, format!("{err:?}")))?;
    Ok(settings.into())
}

/// Where the worker keeps its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub address_file: PathBuf,
    pub output_file: PathBuf,
    pub keyfound_file: PathBuf,
    pub queue_file: PathBuf,
    pub status_state_file: PathBuf,
}

impl Paths {
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Paths {
            address_file: dir.join("in.txt"),
            output_file: dir.join("out.txt"),
            keyfound_file: dir.join("KEYFOUND.txt"),
            queue_file: dir.join("pending_keys.json"),
            status_state_file: dir.join("telegram_state.json"),
        }
    }
}

/// Holds the current snapshot and produces a fresh one per cycle.
#[derive(Debug)]
pub struct ConfigContext {
    path: Option<PathBuf>,
    force_one_shot: bool,
    current: Arc<WorkerConfig>,
}

impl ConfigContext {
    /// loads the file once; failing here is fatal for the caller
    pub fn load<P: Into<PathBuf>>(path: P, force_one_shot: bool) -> io::Result<Self> {
        let path = path.into();
        let mut config = load_config_file(&path)?;
        config.one_shot |= force_one_shot;
        Ok(ConfigContext {
            path: Some(path),
            force_one_shot,
            current: Arc::new(config),
        })
    }

    /// a context that never touches the disk
    pub fn fixed(config: WorkerConfig) -> Self {
        ConfigContext {
            path: None,
            force_one_shot: false,
            current: Arc::new(config),
        }
    }

    pub fn current(&self) -> Arc<WorkerConfig> {
        self.current.clone()
    }

    /// Re-reads the settings file. A broken file keeps the previous snapshot.
    pub fn reload(&mut self) -> Arc<WorkerConfig> {
        if let Some(path) = &self.path {
            match load_config_file(path) {
                Ok(mut config) => {
                    config.one_shot |= self.force_one_shot;
                    if config != *self.current {
                        debug!("settings reloaded: {config:?}");
                    }
                    self.current = Arc::new(config);
                }
                Err(err) => warn!("fail to reload settings, keeping previous: {err}"),
            }
        }
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(json: &str) -> WorkerConfig {
        serde_json::from_str::<Settings>(json).unwrap().into()
    }

    #[test]
    fn defaults() {
        let cfg = parse("{}");
        assert_eq!(cfg.gpu_index, "0");
        assert_eq!(cfg.gpu_count, 1);
        assert_eq!(cfg.min_batch_size, 10);
        assert_eq!(cfg.max_batch_size, 30);
        assert_eq!(cfg.post_block_delay, Duration::from_secs(10));
        assert_eq!(cfg.retry_delay, Duration::from_secs(30));
        assert!(!cfg.auto_switch);
        assert!(!cfg.one_shot);
        assert!(cfg.block_length.is_none());
        assert!(!cfg.telegram_enabled());
    }

    #[test]
    fn legacy_keys_and_aliases() {
        let cfg = parse(
            r#"{
                "telegram_accesstoken": "t",
                "telegram_chatid": -100123,
                "workername": "rig-1",
                "additional_addresses": ["A", "", 5, "B"],
                "additional_address": "C",
                "app_path": "/opt/vs",
                "app_arguments": "-b 0 --name 'x y'",
                "gpu_index": 2,
                "gpu_count": 0,
                "block_length": "500B"
            }"#,
        );
        assert_eq!(cfg.telegram_chat_id, "-100123");
        assert!(cfg.telegram_enabled());
        assert_eq!(cfg.worker_name, "rig-1");
        assert_eq!(cfg.watch_addresses, vec!["A", "B", "C"]);
        assert_eq!(cfg.vanity_path, "/opt/vs");
        assert_eq!(cfg.vanity_args, vec!["-b", "0", "--name", "x y"]);
        assert_eq!(cfg.gpu_index, "2");
        assert_eq!(cfg.gpu_count, 1);
        assert_eq!(cfg.requested_length(), Some(500_000_000_000));
    }

    #[test]
    fn gpu_count_accepts_text() {
        assert_eq!(parse(r#"{"gpu_count": "2"}"#).gpu_count, 2);
        assert_eq!(parse(r#"{"gpu_count": 3}"#).gpu_count, 3);
        assert_eq!(parse(r#"{"gpu_count": " 4 "}"#).gpu_count, 4);
        assert_eq!(parse(r#"{"gpu_count": "many"}"#).gpu_count, 1);
    }

    #[test]
    fn post_block_delay_rules() {
        assert_eq!(parse(r#"{"post_block_delay_minutes": 2}"#).post_block_delay, Duration::from_secs(120));
        assert_eq!(parse(r#"{"post_block_delay_minutes": "0.5"}"#).post_block_delay, Duration::from_secs(30));
        assert_eq!(parse(r#"{"post_block_delay_minutes": -3}"#).post_block_delay, Duration::ZERO);
        assert_eq!(parse(r#"{"post_block_delay_minutes": "soon"}"#).post_block_delay, Duration::from_secs(10));
        assert_eq!(
            parse(r#"{"post_block_delay_enabled": false, "post_block_delay_minutes": 5}"#).post_block_delay,
            Duration::ZERO
        );
    }

    #[test]
    fn batch_bounds_stay_ordered() {
        let cfg = parse(r#"{"min_batch_size": 40, "max_batch_size": 30}"#);
        assert_eq!((cfg.min_batch_size, cfg.max_batch_size), (40, 40));
    }

    #[test]
    fn reload_keeps_previous_snapshot_on_broken_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"api_url": "http://pool", "oneshot": false}}"#).unwrap();
        let mut ctx = ConfigContext::load(file.path(), true).unwrap();
        assert!(ctx.current().one_shot);
        assert_eq!(ctx.current().api_url, "http://pool");

        std::fs::write(file.path(), "{ not json").unwrap();
        let cfg = ctx.reload();
        assert_eq!(cfg.api_url, "http://pool");

        std::fs::write(file.path(), r#"{"api_url": "http://other"}"#).unwrap();
        let cfg = ctx.reload();
        assert_eq!(cfg.api_url, "http://other");
        assert!(cfg.one_shot);
    }
}
