mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use mediarelay_cluster::{Broker, MemoryBroker, RedisBroker};
use mediarelay_core::{
    logging,
    models::{RegisterDraft, StreamType},
    Config,
};
use mediarelay_relay::PlaybackKind;

use server::{BrokerHandle, RelayServer};

#[derive(Debug, Parser)]
#[command(name = "mediarelay", version, about = "Camera stream relay orchestrator")]
struct Cli {
    /// Path to a TOML config file; environment variables override it.
    #[arg(short, long, env = "MEDIARELAY_CONFIG")]
    config: Option<String>,

    /// Run one request against the cluster instead of serving.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a camera stream on a local server and mirror it here.
    Register {
        /// Server that owns the camera.
        #[arg(long)]
        server: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        camera: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        public: bool,
    },
    /// Resolve playback of a stream, relaying it here when needed.
    Playback {
        stream_id: String,
        #[arg(long, default_value = "cloud")]
        kind: PlaybackKind,
    },
}

impl Command {
    async fn run(self, server: &RelayServer) -> Result<String> {
        match self {
            Self::Register {
                server: target,
                user,
                camera,
                name,
                url,
                public,
            } => {
                let draft = RegisterDraft {
                    camera_id: camera,
                    stream_name: name,
                    stream_url: url,
                    is_public: public,
                    stream_type: StreamType::Rtsp,
                };
                let lineage = server.remote().register_remote(&target, &user, &draft).await?;
                let printed = serde_json::json!({
                    "origin": lineage.origin,
                    "hop": lineage.hop,
                });
                Ok(serde_json::to_string_pretty(&printed)?)
            }
            Self::Playback { stream_id, kind } => {
                let answer = server.remote().request_playback(&stream_id, kind).await?;
                Ok(serde_json::to_string_pretty(&answer)?)
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = Config::load(cli.config.as_deref())?;
    if let Err(problems) = config.validate() {
        for problem in &problems {
            eprintln!("Config validation error: {problem}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            problems.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        server_id = %config.server.server_id,
        role = %config.server.role,
        "mediarelay starting"
    );

    // 3. Database
    let pool = server::init_database(&config).await?;

    info!("Running database migrations...");
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .map_err(|e| {
            error!("Failed to run migrations: {}", e);
            anyhow::anyhow!("Migration failed: {e}")
        })?;
    info!("Migrations completed");

    // 4. Broker
    let broker = if config.redis.url.is_empty() {
        info!("Redis not configured, using in-process broker (single node)");
        BrokerHandle::Memory(Arc::new(MemoryBroker::new()))
    } else {
        let redis = RedisBroker::new(&config.redis.url)?;
        info!("Using Redis broker");
        BrokerHandle::Redis(Arc::new(redis))
    };
    let shared: Arc<dyn Broker> = broker.shared();

    // 5. Orchestration and inbound consumer
    let server = RelayServer::build(&config, pool, shared, broker);
    let consumer_task = server
        .start_consumer(Duration::from_secs(config.cluster.dedup_window_secs.max(1)))
        .await?;

    // 6. Serve, or answer a single command
    let Some(command) = cli.command else {
        info!(server_id = %config.server.server_id, "mediarelay ready");
        server.run(consumer_task).await;
        info!("mediarelay stopped");
        return Ok(());
    };

    let result = command.run(&server).await;
    server.stop(consumer_task).await;
    println!("{}", result?);
    Ok(())
}
