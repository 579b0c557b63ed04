use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use std::sync::Arc;
use triage::ControlResult;

/// triage-agent watches for on-call alerts, gathers evidence for each, and
/// asks an agent CLI to produce a triage report.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    config: triage::Config,
    /// Emit logs as JSON lines rather than human-readable text.
    #[clap(long = "log-json", env = "TRIAGE_LOG_JSON")]
    log_json: bool,
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run scheduler ticks every poll interval until interrupted. The default.
    Serve,
    /// Run a single scheduler tick and print its report.
    Tick,
    /// Continue a run, resuming its provider session with its evidence.
    Continue { run_id: i64 },
    /// Re-run the alert of a run with fresh evidence.
    Rerun { run_id: i64 },
    /// Re-run the most recently failed run.
    ReprocessLastError,
    /// Fail every run which is still running.
    ForceClearRunning,
    /// Print the health of the scheduler.
    Health,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    // Use reasonable defaults for printing structured logs to stderr.
    let builder = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr);
    let installed = if args.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.expect("setting tracing default failed");

    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let Args {
        config, command, ..
    } = args;

    let store = triage_sql::Store::open(&config.scheduler.database)
        .with_context(|| format!("opening database {}", config.scheduler.database.display()))?;
    let http = reqwest::Client::builder()
        .user_agent(concat!("triage-agent/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("building HTTP client")?;
    let monitors = Arc::new(triage::monitor::DatadogMonitors::new(
        http.clone(),
        &config.credentials,
    ));

    let control = triage::build(
        config,
        &triage::providers::Registry::builtin(),
        monitors,
        store,
        http,
    )?;

    let result = match command.unwrap_or(Command::Serve) {
        Command::Serve => {
            // Future which completes when the agent should exit.
            let shutdown = tokio::signal::ctrl_c().map(|_| ());
            control.scheduler().serve(shutdown).await?;
            control.wait_idle().await;
            return Ok(());
        }
        Command::Health => return print(&control.health()),
        Command::Tick => control.run_scheduler_tick().await,
        Command::Continue { run_id } => control.continue_run(run_id),
        Command::Rerun { run_id } => control.rerun_run(run_id),
        Command::ReprocessLastError => control.reprocess_last_error(),
        Command::ForceClearRunning => control.force_clear_running(),
    };
    control.wait_idle().await;

    print(&result)?;
    if let ControlResult::Error { error } = result {
        anyhow::bail!(error);
    }
    Ok(())
}

fn print<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
