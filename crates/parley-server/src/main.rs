//! # Parley Server
//!
//! Runs the voice signaling service:
//! - WebSocket signaling relay on `/voice`
//! - Voice stats, ICE server list and channel rosters over HTTP
//!
//! Media never flows through this process. Clients connect to each other
//! directly once the relay has exchanged their offers and candidates.

use clap::Parser;
use parley_common::permissions::Permissions;
use parley_voice::access::{AllowAll, JwtAuthenticator, PermissionTable, VoiceAccess};
use parley_voice::VoiceServer;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Parley voice signaling server")]
struct Cli {
    /// Config file base name (`config` loads `config.toml`, `config.yaml`, ...).
    #[arg(long, env = "PARLEY_CONFIG", default_value = "config")]
    config: String,

    /// Skip channel permission checks and let every participant join any channel.
    #[arg(long, env = "PARLEY_OPEN_ACCESS")]
    open_access: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "PARLEY_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = parley_common::config::init(&cli.config)?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "parley=debug,tower_http=debug".into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    tracing::info!("Starting Parley v{} ({})", env!("CARGO_PKG_VERSION"), config.server.name);

    let access: Arc<dyn VoiceAccess> = if cli.open_access {
        tracing::warn!("Open access: channel permissions are not checked");
        Arc::new(AllowAll)
    } else {
        Arc::new(PermissionTable::new(Permissions::default_everyone()))
    };
    let authenticator = Arc::new(JwtAuthenticator::new(config.auth.jwt_secret.clone()));

    let voice_server = VoiceServer::new(config.voice.clone(), authenticator, access);
    let router = voice_server
        .build_router()
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!(
        max_roster_size = config.voice.max_roster_size,
        ring_timeout_secs = config.voice.ring_timeout_secs,
        "Voice server listening on ws://{addr}/voice"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
