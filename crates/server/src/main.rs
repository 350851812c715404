//! Stowage server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stowage_core::RequestKind;
use stowage_core::config::AppConfig;
use stowage_server::engine::events::BroadcastPublisher;
use stowage_server::engine::jobs::{JobDispatcher, JobTaskRegistry, StoreJobRunner};
use stowage_server::engine::lock::LockOutcome;
use stowage_server::engine::session::InMemorySessionNotifier;
use stowage_server::{AppState, Engine, EngineResult, create_router};
use stowage_storage::LocationRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Capacity of the in-process event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Stowage - file request orchestration server
#[derive(Parser, Debug)]
#[command(name = "stowaged")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "STOWAGE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Load configuration from the optional TOML file, then `STOWAGE_` variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("STOWAGE_") && key != "STOWAGE_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: stowaged --config /path/to/config.toml\n  \
             2. Environment variables: STOWAGE_SERVER__BIND=0.0.0.0:8080 stowaged\n\n\
             Set STOWAGE_CONFIG env var to specify a default config file path."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("STOWAGE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

/// Run `tick` every `period` seconds for the life of the process.
fn spawn_ticker<T, F, Fut>(name: &'static str, period_secs: u64, engine: Arc<Engine>, tick: F)
where
    T: std::fmt::Debug + Send + 'static,
    F: Fn(Arc<Engine>) -> Fut + Send + 'static,
    Fut: Future<Output = EngineResult<LockOutcome<T>>> + Send,
{
    let period = Duration::from_secs(period_secs);
    tokio::spawn(async move {
        tracing::info!(sweep = name, interval_secs = period_secs, "Sweep ticker started");
        loop {
            tokio::time::sleep(period).await;
            match tick(engine.clone()).await {
                Ok(LockOutcome::Executed(result)) => {
                    tracing::trace!(sweep = name, ?result, "Sweep finished");
                }
                Ok(LockOutcome::Skipped) => {}
                Err(e) => tracing::error!(sweep = name, error = %e, "Sweep failed"),
            }
        }
    });
}

fn sweep_interval(config: &AppConfig, kind: RequestKind) -> u64 {
    match kind {
        RequestKind::Storage => config.scheduler.storage_interval_secs,
        RequestKind::Deletion => config.scheduler.deletion_interval_secs,
        RequestKind::Cache => config.scheduler.cache_interval_secs,
        RequestKind::Copy => config.scheduler.copy_interval_secs,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Stowage v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(load_config(&args.config)?);

    stowage_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let metadata = stowage_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let locations = Arc::new(
        LocationRegistry::from_config(&config.locations)
            .await
            .context("failed to initialize storage locations")?,
    );
    // Refuse to start with unreachable locations rather than failing every job later.
    locations
        .health_check()
        .await
        .context("storage location health check failed")?;
    tracing::info!(locations = ?locations.names(), "Storage locations initialized");

    let tasks = Arc::new(JobTaskRegistry::new());
    let engine = Arc::new(Engine::new(
        config.clone(),
        metadata.clone(),
        locations,
        Arc::new(BroadcastPublisher::new(EVENT_CHANNEL_CAPACITY)),
        Arc::new(InMemorySessionNotifier::new()),
        Arc::new(StoreJobRunner::new(metadata, tasks.clone())),
    ));

    let dispatcher = Arc::new(JobDispatcher::new(engine.clone(), tasks));
    let recovered = dispatcher
        .recover_orphans()
        .await
        .context("failed to recover orphaned jobs")?;
    if recovered > 0 {
        tracing::warn!(recovered, "Jobs left running by a previous process crashed");
    }
    let _dispatch_handle = dispatcher.clone().spawn_dispatch_loop();
    let _watchdog_handle = dispatcher.spawn_watchdog();
    tracing::info!("Job dispatcher and watchdog spawned");

    for kind in RequestKind::ALL {
        spawn_ticker(
            kind.as_str(),
            sweep_interval(&config, kind),
            engine.clone(),
            move |engine| async move { engine.scheduler().run_sweep(kind).await },
        );
    }
    spawn_ticker(
        "undelay",
        config.scheduler.undelay_interval_secs,
        engine.clone(),
        |engine| async move { engine.scheduler().run_undelay().await },
    );
    spawn_ticker(
        "groups",
        config.groups.check_interval_secs,
        engine.clone(),
        |engine| async move { engine.scheduler().run_groups_check().await },
    );
    spawn_ticker(
        "expiry",
        config.groups.expiry_interval_secs,
        engine.clone(),
        |engine| async move { engine.scheduler().run_expiry().await },
    );

    let state = AppState::new(engine);
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_from_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("server.toml");
        std::fs::write(
            &path,
            r#"
[server]
bind = "0.0.0.0:9090"

[scheduler]
page_size = 25

[[locations]]
name = "tape"
storage_type = "nearline"
type = "filesystem"
path = "/srv/tape"
"#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9090");
        assert_eq!(config.scheduler.page_size, 25);
        assert_eq!(config.locations.len(), 1);
        assert_eq!(config.locations[0].name, "tape");
    }

    #[test]
    fn load_config_rejects_invalid_values() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("server.toml");
        std::fs::write(&path, "[scheduler]\npage_size = 0\n").unwrap();

        let err = load_config(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("page_size"));
    }

    #[test]
    fn sweep_intervals_follow_kind() {
        let mut config = AppConfig::for_testing();
        config.scheduler.copy_interval_secs = 7;
        assert_eq!(sweep_interval(&config, RequestKind::Copy), 7);
    }
}
