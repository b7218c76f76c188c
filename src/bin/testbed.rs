//! testbed - IoT security testbed
//!
//! Usage:
//!   testbed serve                               ingestion + control API
//!   testbed run scenarios/ddos.json             one headless run, then exit
//!   testbed check scenarios/ddos.json           validate a scenario
//!
//! Global flags override the JSON config file, `PORT` overrides the control
//! API port.

use clap::{Parser, Subcommand};
use iot_testbed::api::{self, AppState};
use iot_testbed::config::RunConfig;
use iot_testbed::{
    IngestServer, Recorder, Scenario, SensorFactory, TestbedConfig, TestbedController, metrics,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "testbed")]
#[command(about = "IoT security testbed: scenario playback, sensor simulation, telemetry capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Ingestion listen address (e.g. 0.0.0.0:9000)
    #[arg(long, global = true)]
    ingest_addr: Option<String>,

    /// Control API listen address (e.g. 0.0.0.0:5000)
    #[arg(long, global = true)]
    http_addr: Option<String>,

    /// Directory for run logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// trace, debug, info, warn, error
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start ingestion and the HTTP control API
    Serve,

    /// Start ingestion and play one scenario to completion
    Run {
        /// Scenario document
        scenario: PathBuf,
    },

    /// Parse a scenario and report its timeline
    Check {
        /// Scenario document
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match TestbedConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("testbed: {}", e);
            return ExitCode::from(2);
        }
    };
    config.apply_env();
    apply_overrides(&mut config, &cli);

    tracing_subscriber::fmt()
        .with_max_level(config.logging.max_level())
        .init();

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run { scenario } => run_headless(config, scenario).await,
        Commands::Check { scenario } => check(&scenario),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(code = e.code(), error = %e, "Testbed exited with error");
            ExitCode::FAILURE
        }
    }
}

fn apply_overrides(config: &mut TestbedConfig, cli: &Cli) {
    if let Some(addr) = &cli.ingest_addr {
        config.ingest.bind_addr = addr.clone();
        // Local sensors follow the ingestion port
        if let Some((_, port)) = addr.rsplit_once(':') {
            config.run.sensor_target = format!("127.0.0.1:{}", port);
        }
    }
    if let Some(addr) = &cli.http_addr {
        config.control.bind_addr = addr.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.run.data_dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
}

fn build_controller(run: &RunConfig, recorder: Arc<Recorder>) -> Arc<TestbedController> {
    let factory = SensorFactory::new(
        run.sensor_target.clone(),
        run.sensors.clone(),
        run.connect_timeout(),
    );
    Arc::new(TestbedController::new(
        recorder,
        Arc::new(factory),
        run.tick_interval(),
    ))
}

/// Ingestion is started once; bind failure ends the process
async fn start_ingest(config: &TestbedConfig) -> iot_testbed::Result<Arc<Recorder>> {
    metrics::init();
    let recorder = Arc::new(Recorder::new(config.run.data_dir.clone()));
    let server = IngestServer::bind(&config.ingest, recorder.clone()).await?;
    server.spawn();
    Ok(recorder)
}

async fn serve(config: TestbedConfig) -> iot_testbed::Result<()> {
    let recorder = start_ingest(&config).await?;
    let controller = build_controller(&config.run, recorder.clone());

    let app = api::router(AppState::new(controller.clone(), config.control.clone()));
    let listener = TcpListener::bind(&config.control.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "Control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("Shutting down... (stopping any active run)");
        })
        .await?;

    shutdown(controller, recorder).await;
    Ok(())
}

async fn run_headless(config: TestbedConfig, scenario: PathBuf) -> iot_testbed::Result<()> {
    let recorder = start_ingest(&config).await?;
    let controller = build_controller(&config.run, recorder.clone());

    let run_id = controller.start_from_path(&scenario)?;
    info!(run = %run_id, scenario = %scenario.display(), "Headless run started");

    let waiter = controller.clone();
    tokio::select! {
        _ = tokio::task::spawn_blocking(move || while !waiter.wait(Duration::from_secs(1)) {}) => {
            info!(run = %run_id, "Scenario complete");
        }
        _ = shutdown_signal() => {
            info!(run = %run_id, "Interrupted");
        }
    }

    shutdown(controller, recorder).await;
    Ok(())
}

async fn shutdown(controller: Arc<TestbedController>, recorder: Arc<Recorder>) {
    let stopper = controller.clone();
    match tokio::task::spawn_blocking(move || stopper.stop()).await {
        Ok(Ok(report)) => info!(
            run = %report.run_id,
            ticks = report.ticks,
            send_failures = report.send_failures,
            "Run stopped"
        ),
        Ok(Err(_)) => {}
        Err(e) => warn!(error = %e, "Stop task failed"),
    }
    if let Some(summary) = recorder.close_current() {
        info!(path = %summary.info.path.display(), "Closed dangling session");
    }

    let stats = recorder.stats();
    info!(
        written = stats.written,
        dropped = stats.dropped_no_session,
        sessions = stats.sessions_opened,
        "Recorder totals"
    );
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}

fn check(path: &Path) -> iot_testbed::Result<()> {
    let scenario = Scenario::load(path)?;

    println!("Scenario:   {}", path.display());
    println!("Duration:   {}s", scenario.duration_seconds);
    println!(
        "Subsystems: {}",
        scenario
            .known_subsystems()
            .into_iter()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();
    println!("{:>6} {:>6}  Modes", "Start", "End");
    for phase in &scenario.phases {
        let modes: Vec<String> = phase
            .modes
            .iter()
            .map(|(subsystem, mode)| format!("{}={}", subsystem, mode))
            .collect();
        println!("{:>6} {:>6}  {}", phase.start, phase.end, modes.join(" "));
    }

    let issues = scenario.validate();
    if !issues.is_empty() {
        println!();
        for issue in &issues {
            println!("warning: {}", issue);
        }
    }
    Ok(())
}
