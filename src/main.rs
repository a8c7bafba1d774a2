use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use roomhub_core::{MessageStore, PresenceCache};
use roomhub_server::{Collaborators, ShutdownCoordinator};
use roomhub_settings::RoomhubSettings;
use roomhub_store::{Database, MemoryMessageStore, MemoryPresenceCache, SqliteMessageStore};
use roomhub_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "roomhub")]
#[command(about = "Real-time chat room hub over WebSocket")]
#[command(version)]
struct Args {
    /// Settings file (defaults to ~/.roomhub/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// SQLite file for message history
    #[arg(long)]
    database: Option<PathBuf>,

    /// Keep message history in memory only
    #[arg(long)]
    memory_store: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, settings: &mut RoomhubSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(path) = &self.database {
            settings.storage.database_path = path.display().to_string();
        }
        if self.memory_store {
            settings.storage.in_memory = true;
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn load_settings(args: &Args) -> anyhow::Result<RoomhubSettings> {
    let mut settings = match &args.config {
        Some(path) => roomhub_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => roomhub_settings::load_settings().context("loading settings")?,
    };
    args.apply(&mut settings);
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

fn open_store(settings: &RoomhubSettings) -> anyhow::Result<Arc<dyn MessageStore>> {
    if settings.storage.in_memory {
        tracing::info!("message history kept in memory");
        return Ok(Arc::new(MemoryMessageStore::new()));
    }
    let path = settings.storage.resolved_database_path();
    let db = Database::open(&path)
        .with_context(|| format!("opening database at {}", path.display()))?;
    Ok(Arc::new(SqliteMessageStore::new(db)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;

    let telemetry = init_telemetry(TelemetryConfig::from_names(
        &settings.logging.level,
        settings
            .logging
            .module_levels
            .iter()
            .map(|(module, level)| (module.as_str(), level.as_str())),
        settings.logging.json,
    ));

    tracing::info!("starting roomhub");

    let presence: Arc<dyn PresenceCache> = Arc::new(MemoryPresenceCache::new());
    let collaborators = Collaborators {
        store: Some(open_store(&settings)?),
        presence: Some(presence),
    };

    let shutdown = ShutdownCoordinator::new();
    let handle = roomhub_server::start(&settings, collaborators, telemetry.metrics(), shutdown.token())
        .await
        .context("starting server")?;

    tracing::info!(addr = %handle.local_addr, "roomhub ready");

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    tracing::info!("shutting down");
    let aborted = shutdown.graceful_shutdown(handle.into_tasks(), None).await;
    if aborted > 0 {
        tracing::warn!(aborted, "forced shutdown");
    }
    Ok(())
}
