mod cli;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use console::Style;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, RunArgs};
use genbatch::checkpoint::CheckpointStore;
use genbatch::config::GenbatchConfig;
use genbatch::input::{
    self, InputFormat, JsonlRejectionSink, NullRejectionSink, REJECTED_FILE_NAME, RejectionSink,
};
use genbatch::ui::{self, BatchProgress};
use genbatch::{BatchOrchestrator, HttpExecutor};

const EXIT_JOB_FAILURES: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", Style::new().red().bold().apply_to("error:"));
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "genbatch=debug" } else { "genbatch=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let mut config = GenbatchConfig::load(cli.config.as_deref())?;
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    match cli.command {
        Command::Run(args) => run(config, args, cli.verbose).await,
        Command::Status { output_dir } => {
            let output_dir = output_dir.unwrap_or(config.output_dir);
            let path = CheckpointStore::path_in(&output_dir);
            if !path.exists() {
                println!("No checkpoint at {}", path.display());
                return Ok(ExitCode::SUCCESS);
            }
            let report = CheckpointStore::load_report(&path).await?;
            ui::print_report(&path, &report);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(mut config: GenbatchConfig, args: RunArgs, verbose: bool) -> Result<ExitCode> {
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.rate_limit = rate_limit;
    }
    if args.burst_capacity.is_some() {
        config.burst_capacity = args.burst_capacity;
    }
    if args.endpoint.is_some() {
        config.endpoint = args.endpoint;
    }
    config.validate()?;

    let endpoint = match config.endpoint.clone() {
        Some(endpoint) => endpoint,
        None if args.dry_run => String::new(),
        None => bail!(
            "no endpoint configured: pass --endpoint, set GENBATCH_ENDPOINT \
             or add `endpoint` to genbatch.toml"
        ),
    };
    let executor = HttpExecutor::new(endpoint, &config.output_dir, config.request_timeout())?;

    let rejects: Arc<dyn RejectionSink> = if args.dry_run {
        Arc::new(NullRejectionSink)
    } else {
        Arc::new(JsonlRejectionSink::new(config.output_dir.join(REJECTED_FILE_NAME)))
    };
    let format = args.format.map(InputFormat::from);
    let jobs = input::open_jobs(&args.input, format, Arc::clone(&rejects))
        .await
        .with_context(|| format!("cannot read jobs from {}", args.input.display()))?;

    let progress = Arc::new(BatchProgress::start(&args.input.display().to_string()));
    let settings = config.batch_settings(args.resume, args.dry_run);
    let orchestrator = BatchOrchestrator::new(executor, settings)
        .with_rejection_sink(rejects)
        .with_observer(progress.clone());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Received Ctrl-C, stopping dispatch");
                on_signal.cancel();
            }
            Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
        }
    });

    let result = orchestrator.run(jobs, cancel).await;
    progress.finish();
    let summary = result?;
    ui::print_summary(&summary, verbose);

    let code = if summary.interrupted {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if summary.failed > 0 {
        info!(failed = summary.failed, "Some jobs failed; rerun with --resume to retry them");
        ExitCode::from(EXIT_JOB_FAILURES)
    } else {
        ExitCode::SUCCESS
    };
    Ok(code)
}
