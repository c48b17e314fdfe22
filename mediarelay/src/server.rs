//! Server assembly
//!
//! Wires the stores, relay process manager, orchestrator, cross-server
//! client and downstream consumer together, then waits for a shutdown
//! signal or runs a single operator command.

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use mediarelay_cluster::{
    Broker, CorrelationRegistry, MemoryBroker, RedisBroker, RequestDeduplicator,
};
use mediarelay_core::{
    models::downstream_topic,
    repository::{PgCameraRepository, PgStreamStore, StreamStore},
    Config,
};
use mediarelay_relay::{
    DownstreamConsumer, OrchestratorSettings, RelayProcessManager, RemoteStreams,
    StoreStatusProvider, StreamOrchestrator,
};

/// Initialize the database connection pool
pub async fn init_database(config: &Config) -> Result<PgPool> {
    info!("Connecting to database");

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_seconds))
        .connect(&config.database.url)
        .await
        .map_err(|e| {
            error!("Failed to connect to database: {}", e);
            anyhow::anyhow!("Database connection failed: {e}")
        })?;

    info!("Database connected successfully");
    Ok(pool)
}

/// Concrete broker kept for shutdown; everything else sees `dyn Broker`.
pub enum BrokerHandle {
    Memory(Arc<MemoryBroker>),
    Redis(Arc<RedisBroker>),
}

impl BrokerHandle {
    pub fn shared(&self) -> Arc<dyn Broker> {
        match self {
            Self::Memory(broker) => broker.clone() as Arc<dyn Broker>,
            Self::Redis(broker) => broker.clone(),
        }
    }

    fn shutdown(&self) {
        if let Self::Redis(broker) = self {
            broker.shutdown();
        }
    }
}

pub struct RelayServer {
    processes: Arc<RelayProcessManager>,
    remote: RemoteStreams,
    consumer: Arc<DownstreamConsumer>,
    broker: BrokerHandle,
}

impl RelayServer {
    pub fn build(
        config: &Config,
        pool: PgPool,
        shared: Arc<dyn Broker>,
        broker: BrokerHandle,
    ) -> Self {
        let server_id = config.server.server_id.clone();

        let store: Arc<dyn StreamStore> = Arc::new(PgStreamStore::new(pool.clone()));
        let cameras = Arc::new(PgCameraRepository::new(pool));
        let processes = Arc::new(RelayProcessManager::new(&config.relay));
        let status = Arc::new(StoreStatusProvider::new(store.clone()));

        let orchestrator = Arc::new(StreamOrchestrator::new(
            OrchestratorSettings::new(&server_id, config.server.role, config.rtmp.clone()),
            store.clone(),
            cameras,
            processes.clone(),
            status,
        ));
        let registry = Arc::new(CorrelationRegistry::new(
            shared.clone(),
            downstream_topic(&server_id),
        ));
        let remote = RemoteStreams::new(
            orchestrator.clone(),
            registry.clone(),
            store,
            config.cluster.request_timeout(),
        );
        let consumer = Arc::new(
            DownstreamConsumer::new(
                server_id,
                shared,
                registry,
                orchestrator,
                RequestDeduplicator::new(config.cluster.dedup_window()),
            )
            .with_fallback_reply_topic(config.cluster.fallback_reply_topic.clone()),
        );

        info!(
            relay_program = %config.relay.program,
            request_timeout_ms = config.cluster.request_timeout_ms,
            "Stream orchestrator initialized"
        );

        Self {
            processes,
            remote,
            consumer,
            broker,
        }
    }

    /// Client for registration and playback requests sent to other servers.
    pub fn remote(&self) -> &RemoteStreams {
        &self.remote
    }

    pub async fn start_consumer(&self, cleanup_interval: Duration) -> Result<JoinHandle<()>> {
        let handle = Arc::clone(&self.consumer).start(cleanup_interval).await?;
        Ok(handle)
    }

    /// Wait for the consumer to stop or a shutdown signal, then shut down.
    pub async fn run(&self, mut consumer_task: JoinHandle<()>) {
        tokio::select! {
            result = &mut consumer_task => {
                if let Err(e) = result {
                    error!("Downstream consumer task failed: {}", e);
                } else {
                    warn!("Downstream consumer stopped unexpectedly");
                }
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                self.consumer.shutdown();
                let _ = consumer_task.await;
            }
        }

        self.shutdown().await;
    }

    /// Stop the consumer, the relay children and the broker.
    pub async fn stop(&self, consumer_task: JoinHandle<()>) {
        self.consumer.shutdown();
        let _ = consumer_task.await;
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        self.processes.shutdown().await;
        self.broker.shutdown();
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
