//! protoscribe: task pipeline server.
//!
//! Subcommands:
//!   serve    (default) run the HTTP/WebSocket server
//!   migrate  create the Postgres tables (feature `postgres`)
//!
//! Config path from `--config` or `CONFIG_PATH`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use protoscribe_core::blob::{BlobGateway, LocalBlobStore};
use protoscribe_core::broker::{BrokerConnector, BrokerGateway, ConnectionSupervisor, MemoryBroker};
use protoscribe_core::store::{
    AudioLinkStore, FeedbackStore, MemoryTaskStore, ProtocolStore, TaskStatusStore,
};
use protoscribe_core::TaskOrchestrator;
use protoscribe_server::config::{self, Backend, ServiceConfig};
use protoscribe_server::{build_router, logging, AppState};

#[derive(Parser)]
#[command(name = "protoscribe")]
#[command(about = "Audio to transcript to protocol task pipeline")]
struct Cli {
    /// Path to the YAML service config
    #[arg(long, env = "CONFIG_PATH", default_value = "config/protoscribe.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server
    Serve,
    /// Create the task store and queue tables
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::load(&cli.config)?;

    config::load_env_file(config.env);
    logging::init_tracing(config.env);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => migrate(config).await,
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    tracing::info!(env = config.env.as_str(), "Starting protoscribe");

    let blobs: Arc<dyn BlobGateway> = Arc::new(LocalBlobStore::new(&config.storage.blob_dir));
    let connector = broker_connector(&config).await?;
    let gateway = Arc::new(BrokerGateway::new(
        connector,
        config.broker.retry_policy(),
        config.pipeline.call_timeout(),
    ));

    // Unreachable broker at startup is fatal.
    gateway
        .run()
        .await
        .context("Broker unavailable at startup")?;

    let (orchestrator, feedback) = match config.storage.backend {
        Backend::Memory => {
            tracing::warn!("Using in-memory task store; tasks are lost on restart");
            wire(MemoryTaskStore::new(), blobs, gateway.clone(), &config)
        }
        Backend::Postgres => wire(pg_task_store(&config).await?, blobs, gateway.clone(), &config),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = ConnectionSupervisor::new(gateway.clone(), config.broker.supervisor_interval());
    let supervisor_handle = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    let state = AppState::new(orchestrator, feedback, config.http.max_upload_bytes);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.http.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.http.bind_addr))?;
    tracing::info!(addr = %config.http.bind_addr, "protoscribe listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    let _ = shutdown_tx.send(true);
    let _ = supervisor_handle.await;
    gateway.stop().await;
    tracing::info!("protoscribe stopped");
    Ok(())
}

fn wire<S>(
    store: Arc<S>,
    blobs: Arc<dyn BlobGateway>,
    gateway: Arc<BrokerGateway>,
    config: &ServiceConfig,
) -> (Arc<TaskOrchestrator>, Arc<dyn FeedbackStore>)
where
    S: TaskStatusStore + AudioLinkStore + ProtocolStore + FeedbackStore + 'static,
{
    let orchestrator = Arc::new(TaskOrchestrator::with_store(
        store.clone(),
        blobs,
        gateway,
        config.pipeline.orchestrator_config(),
    ));
    let feedback: Arc<dyn FeedbackStore> = store;
    (orchestrator, feedback)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn broker_connector(config: &ServiceConfig) -> Result<Arc<dyn BrokerConnector>> {
    match config.broker.backend {
        Backend::Memory => {
            tracing::warn!("Using in-memory broker; stage requests stay in this process");
            let broker: Arc<dyn BrokerConnector> = MemoryBroker::new();
            Ok(broker)
        }
        Backend::Postgres => pg_connector(config).await,
    }
}

#[cfg(feature = "postgres")]
async fn pg_pool(var: &str) -> Result<sqlx::PgPool> {
    let url = config::secret_from_env(var)?;
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .with_context(|| format!("Failed to connect to database from {}", var))
}

#[cfg(feature = "postgres")]
async fn pg_task_store(config: &ServiceConfig) -> Result<Arc<protoscribe_core::store::PgTaskStore>> {
    let pool = pg_pool(&config.storage.connection_string_env).await?;
    Ok(Arc::new(protoscribe_core::store::PgTaskStore::new(pool)))
}

#[cfg(not(feature = "postgres"))]
async fn pg_task_store(_config: &ServiceConfig) -> Result<Arc<MemoryTaskStore>> {
    anyhow::bail!("storage.backend = postgres requires the `postgres` feature")
}

#[cfg(feature = "postgres")]
async fn pg_connector(config: &ServiceConfig) -> Result<Arc<dyn BrokerConnector>> {
    let pool = pg_pool(&config.broker.connection_string_env).await?;
    let connector: Arc<dyn BrokerConnector> =
        Arc::new(protoscribe_core::broker::PgQueueConnector::new(pool));
    Ok(connector)
}

#[cfg(not(feature = "postgres"))]
async fn pg_connector(_config: &ServiceConfig) -> Result<Arc<dyn BrokerConnector>> {
    anyhow::bail!("broker.backend = postgres requires the `postgres` feature")
}

#[cfg(feature = "postgres")]
async fn migrate(config: ServiceConfig) -> Result<()> {
    if config.storage.backend == Backend::Postgres {
        let pool = pg_pool(&config.storage.connection_string_env).await?;
        protoscribe_core::store::PgTaskStore::new(pool)
            .migrate()
            .await
            .context("Task store migration failed")?;
    }
    if config.broker.backend == Backend::Postgres {
        let pool = pg_pool(&config.broker.connection_string_env).await?;
        protoscribe_core::broker::PgQueueConnector::new(pool)
            .migrate()
            .await
            .context("Queue migration failed")?;
    }
    tracing::info!("Migration complete");
    Ok(())
}

#[cfg(not(feature = "postgres"))]
async fn migrate(_config: ServiceConfig) -> Result<()> {
    anyhow::bail!("migrate requires the `postgres` feature")
}
