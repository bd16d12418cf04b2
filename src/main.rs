//! SAFLA - Entry Point
//!
//! Runs the feedback loop against a synthetic task whose reward peaks at a
//! known parameter setting, so adaptation can be watched from the shell.
//!
//! Options:
//! - --fresh / -f: ignore persisted history
//! - --help / -h

use std::sync::Arc;

use anyhow::Context;
use safla::{
    restore_store, Controller, FnRunner, PolicyPersistence, PolicyStore, PolicyVersion,
    SaflaConfig, SqlitePersistence, TaskOutcome, TracingSink,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Parameters the synthetic task rewards most
const TARGET: [(&str, f64); 2] = [("temperature", 0.7), ("exploration", 0.25)];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let fresh = args.iter().any(|a| a == "--fresh" || a == "-f");
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");

    if help_mode {
        println!("SAFLA feedback loop v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: safla [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --fresh, -f   Start from a new root policy");
        println!("  --help, -h    Show this help");
        println!();
        println!("Environment variables:");
        println!("  SAFLA_CONFIG       TOML config file");
        println!("  SAFLA_SEED         Adaptation seed");
        println!("  SAFLA_MAX_CYCLES   Cycle budget (0 = unbounded)");
        println!("  SAFLA_EPSILON      Improvement threshold");
        println!("  SAFLA_DB_PATH      SQLite history database");
        println!("  SAFLA_LOG_JSON     Log JSON to stderr when set to 1");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    // stdout is reserved for the summary
    if std::env::var("SAFLA_LOG_JSON").map(|v| v == "1").unwrap_or(false) {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("SAFLA feedback loop v{}", env!("CARGO_PKG_VERSION"));

    let config = SaflaConfig::from_env()?;

    let persistence: Option<Arc<dyn PolicyPersistence>> = match &config.persistence.db_path {
        Some(path) => {
            if fresh && path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to reset {}", path.display()))?;
            }
            let db = SqlitePersistence::open(path)?;
            Some(Arc::new(db))
        }
        None => None,
    };

    let store = match &persistence {
        Some(p) => match restore_store(p.as_ref())? {
            Some(store) => {
                info!("Restored {} policy versions (active {})", store.len(), store.active_id());
                store
            }
            None => PolicyStore::new(root_parameters()),
        },
        None => PolicyStore::new(root_parameters()),
    };

    let runner = Arc::new(FnRunner::new(synthetic_task));
    let mut builder = Controller::builder(runner, store)
        .config(config.controller.clone())
        .objective(config.objective.clone())
        .strategy(Box::new(safla::PerturbationStrategy::new(config.adapter.clone())?))
        .sink(Arc::new(TracingSink));
    if let Some(p) = persistence {
        builder = builder.persistence(p);
    }
    let mut controller = builder.build()?;

    let stop = controller.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current cycle");
            stop.stop();
        }
    });

    let summary = controller.run().await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

fn root_parameters() -> safla::ParameterMap {
    TARGET.iter().map(|(name, _)| (name.to_string(), 0.0)).collect()
}

/// Reward falls off quadratically from `TARGET`; latency grows with distance
fn synthetic_task(policy: &PolicyVersion) -> Result<TaskOutcome, safla::TaskError> {
    let distance: f64 = TARGET
        .iter()
        .map(|(name, target)| {
            let value = policy.param(name).unwrap_or_default();
            (value - target) * (value - target)
        })
        .sum();

    Ok(TaskOutcome::new()
        .with_scalar("task_success", 1.0 - distance)
        .with_scalar("error_rate", (distance / 4.0).min(1.0))
        .with_scalar("latency_ms", 100.0 + 50.0 * distance)
        .with_scalar("resource_cost", 1.0))
}
