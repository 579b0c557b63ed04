pub mod alerts;
pub mod config;
pub mod control;
pub mod evidence;
pub mod monitor;
pub mod prompt;
pub mod providers;
pub mod repo;
pub mod runs;
pub mod scheduler;


pub use config::Config;
pub use control::{Control, ControlResult};
pub use scheduler::{Scheduler, TickReport};

use std::sync::Arc;

/// Wire up a Control, with its Scheduler and Runner, from `config`.
pub fn build(
    config: Config,
    providers: &providers::Registry,
    monitors: Arc<dyn monitor::MonitorSource>,
    store: triage_sql::Store,
    http: reqwest::Client,
) -> anyhow::Result<Control> {
    let Config {
        scheduler,
        alerts,
        evidence,
        provider,
        credentials,
    } = config;

    let provider_impl = providers.build(&provider)?;
    let resolver = repo::RepoResolver::load(&alerts)?;
    let orchestrator = evidence::Orchestrator::new(evidence, credentials, http);

    let runner = Arc::new(runs::Runner::new(
        store.clone(),
        provider_impl,
        Arc::new(orchestrator),
        scheduler.runs_dir.clone(),
        provider.model.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        scheduler,
        alerts,
        store.clone(),
        monitors,
        resolver,
        runner.clone(),
    ));

    tracing::info!(
        provider = runner.provider_name(),
        owner_id = scheduler.owner_id(),
        "built triage agent"
    );
    Ok(Control::new(scheduler, runner, store))
}
