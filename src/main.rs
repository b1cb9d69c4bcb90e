use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crucible::config::Settings;
use crucible::db::{Db, DbHandle};
use crucible::dispatch::WsTransport;
use crucible::generation::HttpGenerationBackend;
use crucible::models::{PipelineConfig, ServiceType};
use crucible::orchestrator::TaskOrchestrator;
use crucible::pool::{EndpointPool, PoolConfig, Probe};
use crucible::reservation::ReservationStore;
use crucible::scheduler::{JobScheduler, SchedulerConfig};
use crucible::sweep::{MaintenanceSweep, SweepConfig};

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Research-platform orchestration core")]
pub struct Cli {
    /// Path to the TOML config file (defaults to ./crucible.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a pipeline definition to a terminal status
    Run {
        /// Path to the pipeline definition (JSON)
        #[arg(long)]
        pipeline: PathBuf,
    },
    /// Run one maintenance sweep pass and exit
    Sweep,
    /// Probe every configured worker endpoint and print its health
    Endpoints,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { pipeline } => cmd_run(&settings, &pipeline).await,
        Commands::Sweep => cmd_sweep(&settings).await,
        Commands::Endpoints => cmd_endpoints(&settings).await,
    }
}

async fn cmd_run(settings: &Settings, pipeline_path: &std::path::Path) -> Result<()> {
    let raw = std::fs::read_to_string(pipeline_path).with_context(|| {
        format!("Failed to read pipeline definition {}", pipeline_path.display())
    })?;
    let pipeline: PipelineConfig =
        serde_json::from_str(&raw).context("Failed to parse pipeline definition")?;

    let db = DbHandle::new(Db::new(&settings.database.path)?);
    let transport = Arc::new(WsTransport::new(
        settings.dispatch_timeout(),
        settings.probe_timeout(),
    ));

    let pool = Arc::new(EndpointPool::new(
        PoolConfig {
            cooldown: settings.cooldown(),
            probe_timeout: settings.probe_timeout(),
            strategy: settings.pool.strategy,
        },
        transport.clone(),
    ));
    for service in ServiceType::ALL {
        for url in settings.endpoints.for_service(service) {
            pool.register(service, url).await;
        }
    }

    let reservations = ReservationStore::new(
        db.clone(),
        settings.database.lock_dir.clone(),
        std::time::Duration::from_secs(30),
    );
    let generator = Arc::new(HttpGenerationBackend::new(
        settings.generator.gateway_url.clone(),
        std::time::Duration::from_secs(settings.generator.timeout_secs),
    )?);
    let orchestrator = Arc::new(TaskOrchestrator::new(
        db.clone(),
        pool,
        transport,
        settings.dispatch.max_retries,
    ));

    // Stream progress events as JSON lines.
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    let scheduler = JobScheduler::new(
        SchedulerConfig {
            max_concurrent_generation: settings.pipeline.max_concurrent_generation,
            max_concurrent_analysis: settings.pipeline.max_concurrent_analysis,
            poll_interval: settings.poll_interval(),
        },
        reservations,
        generator,
        orchestrator,
    )
    .with_event_channel(event_tx);

    // Reconcile anything a previous process left behind before taking on
    // new work, then keep sweeping while the run executes.
    let mut sweep = MaintenanceSweep::new(
        db,
        SweepConfig {
            interval: std::time::Duration::from_secs(settings.sweep.interval_secs),
            running_timeout: std::time::Duration::from_secs(settings.sweep.running_timeout_secs),
            pending_timeout: std::time::Duration::from_secs(settings.sweep.pending_timeout_secs),
            grace_period: std::time::Duration::from_secs(settings.sweep.grace_period_secs),
        },
    );
    sweep.start();

    let run_id = scheduler.submit(pipeline).await?;
    let run = scheduler.execute(run_id).await?;

    sweep.stop().await;
    drop(scheduler);
    let _ = printer.await;

    println!(
        "{}",
        serde_json::to_string_pretty(&run).context("Failed to render run summary")?
    );
    Ok(())
}

async fn cmd_sweep(settings: &Settings) -> Result<()> {
    let db = DbHandle::new(Db::new(&settings.database.path)?);
    let sweep = MaintenanceSweep::new(
        db,
        SweepConfig {
            interval: std::time::Duration::from_secs(settings.sweep.interval_secs),
            running_timeout: std::time::Duration::from_secs(settings.sweep.running_timeout_secs),
            pending_timeout: std::time::Duration::from_secs(settings.sweep.pending_timeout_secs),
            grace_period: std::time::Duration::from_secs(settings.sweep.grace_period_secs),
        },
    );
    let report = sweep.run_once().await?;
    println!(
        "reclaimed {} running, {} pending",
        report.running_reclaimed, report.pending_reclaimed
    );
    Ok(())
}

async fn cmd_endpoints(settings: &Settings) -> Result<()> {
    let transport = WsTransport::new(settings.dispatch_timeout(), settings.probe_timeout());
    let mut any = false;
    for service in ServiceType::ALL {
        for url in settings.endpoints.for_service(service) {
            any = true;
            let alive = transport.probe(url, service).await;
            println!(
                "{:<18} {:<40} {}",
                service.as_str(),
                url,
                if alive { "healthy" } else { "unreachable" }
            );
        }
    }
    if !any {
        println!("no endpoints configured");
    }
    Ok(())
}
