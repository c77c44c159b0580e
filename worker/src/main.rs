use std::{path::PathBuf, process::exit, sync::Arc};

use anyhow::Context;
use clap::Parser;
use gpu_worker::{
    config::{ConfigContext, Paths},
    restful::ServerAPI,
    runner::ProcessRunner,
    status::StatusReporter,
    worker::{Outcome, Worker},
    VERSION,
};
use shared::log::init_log;
use tracing::*;

#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    #[arg(
        long,
        value_name = "PATH",
        help = "Settings file, re-read before every block",
        default_value = "./settings.json"
    )]
    config: PathBuf,

    #[arg(long, help = "Stop after the first processed block")]
    oneshot: bool,

    #[arg(
        long,
        value_name = "DIR",
        help = "Directory for address, result, queue and state files",
        default_value = "."
    )]
    workdir: PathBuf,
}

async fn run(args: Args) -> anyhow::Result<Outcome> {
    let config = ConfigContext::load(&args.config, args.oneshot)
        .with_context(|| format!("cannot load settings from {}", args.config.display()))?;

    let cfg = config.current();
    info!(
        "pool: {}, gpu: {}, watching {} address(es), one-shot: {}",
        cfg.api_url,
        cfg.gpu_index,
        cfg.watch_addresses.len(),
        cfg.one_shot
    );
    if !cfg.telegram_enabled() {
        warn!("telegram settings missing, status messages disabled");
    }

    let paths = Paths::in_dir(&args.workdir);
    let api = Arc::new(ServerAPI::new()?);
    let reporter = StatusReporter::from_config(&paths.status_state_file, &cfg);

    let mut worker = Worker::new(config, paths, api, Arc::new(ProcessRunner), reporter);
    worker.run().await
}

#[tokio::main]
async fn main() {
    init_log();

    info!("VERSION:{VERSION}");

    let args = Args::parse();

    match run(args).await {
        Ok(outcome) => {
            info!("worker finished: {outcome}");
        }
        Err(err) => {
            error!("{err:#}");
            exit(1);
        }
    }
}
