use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use api_types::Eid;
use clap::Parser;
use envisor::app::ApplicationBuilder;
use envisor::config::daemon::DaemonArgs;
use envisor::config::fleet::OutputFormat;
use envisor::config::query::DiscardArgs;
use envisor::config::query::EnvironmentsArgs;
use envisor::config::query::SnapshotArgs;
use envisor::config::Cli;
use envisor::config::Commands;
use envisor::config::FleetArgs;
use envisor::config::LockArgs;
use envisor::domain::device_lock;
use envisor::domain::fleet::FleetAggregator;
use envisor::infrastructure::hostname;
use envisor::infrastructure::logging;
use utils::process::ProcfsProbe;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::Snapshot(args) => run_snapshot(args),
        Commands::Environments(args) => run_environments(args),
        Commands::Discard(args) => run_discard(args),
        Commands::Fleet(args) => run_fleet(args).await,
        Commands::Lock(args) => run_lock(args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.violation_log.as_deref())?;

    tracing::info!("Starting envisor daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build()?;
    app.run().await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_snapshot(args: SnapshotArgs) -> Result<()> {
    utils::logging::init();

    let registry = args.registry.open();
    let snapshot = registry
        .snapshot(hostname())
        .with_context(|| format!("failed to read {}", registry.path().display()))?;
    print_json(&snapshot)
}

fn run_environments(args: EnvironmentsArgs) -> Result<()> {
    utils::logging::init();

    let registry = args.registry.open();
    let environments = registry
        .list_environments(&args.filter())
        .with_context(|| format!("failed to read {}", registry.path().display()))?;
    print_json(&environments)
}

fn run_discard(args: DiscardArgs) -> Result<()> {
    utils::logging::init();

    let registry = args.registry.open();
    let eid = Eid::from(args.eid);
    if !registry.discard_quarantined(&eid)? {
        anyhow::bail!("no quarantined record for environment {eid}");
    }
    tracing::info!(eid = %eid, "Quarantined record discarded");
    Ok(())
}

async fn run_fleet(args: FleetArgs) -> Result<()> {
    utils::logging::init();

    let (hosts, user) = args.targets()?;
    let aggregator = FleetAggregator::new(Arc::new(args.transport(user)), args.options());
    let results = aggregator.query(&hosts, &args.request()).await;

    let failed = results.values().filter(|outcome| outcome.result.is_err()).count();
    if failed > 0 {
        tracing::warn!(failed, total = results.len(), "Some hosts did not answer");
    }

    match args.output {
        OutputFormat::Json => print_json(&results),
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(&results)?);
            Ok(())
        }
    }
}

fn run_lock(args: LockArgs) -> Result<()> {
    utils::logging::init();

    let registry = args.registry.open();
    let target = args.target();
    let devices = device_lock::devices_of(&registry, &target, &ProcfsProbe)
        .with_context(|| format!("failed to resolve the devices of {target:?}"))?;
    let status = device_lock::run_locked(&registry, &devices, args.lock_options(), &args.command)?;
    std::process::exit(device_lock::exit_code(status));
}
