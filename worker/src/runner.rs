use std::{
    fmt::{Display, Formatter},
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use colored::Colorize;
use futures_util::{stream, Stream, StreamExt};
use num_bigint::BigUint;
use shared::types::Keyspace;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc,
};
use tracing::*;

use crate::config::WorkerConfig;

/// Below this many keys the secondary program is the better fit.
pub const SECONDARY_MAX_LENGTH: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    /// VanitySearch
    Primary,
    /// BitCrack, single device only
    Secondary,
}

impl Display for Tool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Tool::Primary => write!(f, "vanitysearch"),
            Tool::Secondary => write!(f, "bitcrack"),
        }
    }
}

/// Picks the search program for a block. `keyspace_length` of `None` means unknown.
pub fn select_tool(
    keyspace_length: Option<&BigUint>,
    gpu_count: u32,
    auto_switch: bool,
    secondary_configured: bool,
) -> Tool {
    let chosen = if !auto_switch || gpu_count > 1 {
        Tool::Primary
    } else {
        match keyspace_length {
            Some(len) if *len < BigUint::from(SECONDARY_MAX_LENGTH) && secondary_configured => {
                Tool::Secondary
            }
            _ => Tool::Primary,
        }
    };

    if chosen == Tool::Secondary && !secondary_configured {
        return Tool::Primary;
    }
    chosen
}

/// The requested length hint wins over the actual range size.
pub fn keyspace_length(cfg: &WorkerConfig, keyspace: &Keyspace) -> Option<BigUint> {
    cfg.requested_length().map(BigUint::from).or_else(|| keyspace.length())
}

/// A fully built command line for one search run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    pub program: String,
    pub args: Vec<String>,
    pub output_file: PathBuf,
}

impl Invocation {
    pub fn build(
        tool: Tool,
        cfg: &WorkerConfig,
        address_file: &Path,
        output_file: &Path,
        keyspace: &Keyspace,
    ) -> Self {
        let input = address_file.to_string_lossy().to_string();
        let output = output_file.to_string_lossy().to_string();

        let (program, mut args) = match (tool, &cfg.bitcrack_path) {
            (Tool::Secondary, Some(path)) => {
                let mut args = vec!["-i".to_string(), input, "-o".to_string(), output];
                args.extend(["-d".to_string(), cfg.gpu_index.clone()]);
                args.extend(cfg.bitcrack_args.iter().cloned());
                (path.clone(), args)
            }
            _ => {
                let mut args: Vec<String> =
                    ["-t", "0", "-gpu", "-i"].iter().map(|s| s.to_string()).collect();
                args.extend([input, "-o".to_string(), output]);
                if cfg.gpu_count <= 1 {
                    args.extend(["-gpuId".to_string(), cfg.gpu_index.clone()]);
                }
                args.extend(cfg.vanity_args.iter().cloned());
                (cfg.vanity_path.clone(), args)
            }
        };
        args.extend(["--keyspace".to_string(), keyspace.to_string()]);

        let tool = if cfg.bitcrack_path.is_some() { tool } else { Tool::Primary };
        Invocation { tool, program, args, output_file: output_file.to_path_buf() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    #[error("nonzero exit ({0:?})")]
    NonZeroExit(Option<i32>),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure(RunFailure),
}

/// Runs the external search program to completion.
#[async_trait]
pub trait SearchRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> RunOutcome;
}

#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static, {
    tokio::spawn(async move {
        // the pipe is drained to EOF even when nobody listens, a closed pipe kills the program
        let mut segments = BufReader::new(reader).split(b'\n');
        let mut forwarding = true;
        while let Ok(Some(segment)) = segments.next_segment().await {
            if !forwarding {
                continue;
            }
            let line = String::from_utf8_lossy(&segment).trim_end_matches('\r').to_string();
            if tx.send(line).await.is_err() {
                forwarding = false;
            }
        }
    });
}

impl ProcessRunner {
    /// Spawns the program with stdout and stderr merged into one line stream.
    /// The stream ends once both pipes are closed.
    pub fn spawn(
        &self,
        invocation: &Invocation,
    ) -> io::Result<(Child, impl Stream<Item = String> + Send + Unpin)> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx);
        }

        let lines = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) });
        Ok((child, Box::pin(lines)))
    }
}

#[async_trait]
impl SearchRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> RunOutcome {
        if let Err(err) = tokio::fs::write(&invocation.output_file, b"").await {
            warn!("fail to clear {}: {err}", invocation.output_file.display());
        }

        debug!("starting {}: {} {:?}", invocation.tool, invocation.program, invocation.args);
        let (mut child, mut lines) = match self.spawn(invocation) {
            Ok(spawned) => spawned,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                error!("external program not found, check path and permissions: {}", invocation.program);
                return RunOutcome::Failure(RunFailure::NotFound);
            }
            Err(err) => {
                error!("exception while executing {}: {err}", invocation.program);
                return RunOutcome::Failure(RunFailure::Io(err.to_string()));
            }
        };

        while let Some(line) = lines.next().await {
            info!("{}", format!("  > {}", line.trim()).cyan());
        }

        match child.wait().await {
            Ok(status) if status.success() => {
                info!("{}", "external program finished successfully".green());
                RunOutcome::Success
            }
            Ok(status) => {
                error!("external program failed with return code: {:?}", status.code());
                RunOutcome::Failure(RunFailure::NonZeroExit(status.code()))
            }
            Err(err) => {
                error!("fail to wait for external program: {err}");
                RunOutcome::Failure(RunFailure::Io(err.to_string()))
            }
        }
    }
}
