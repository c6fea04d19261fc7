//! push-receiver
//!
//! Background companion for a desktop app: registers with a push backend,
//! keeps the push socket alive, and relays events to the foreground.
//!
//! ## Modes
//!
//! **Bridge** (default): reads start requests as JSON lines on stdin and
//! writes service events as JSON lines on stdout. Runs until stdin closes.
//!
//! **Start** (`push-receiver start ...`): starts the service directly with an
//! identity given on the command line; events go to stdout.

use clap::{Args, Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use push_receiver::{
    bridge::{self, Bridge},
    config::{ConfigError, ReceiverConfig},
    events::{ChannelSink, EventSink},
    protocol::Identity,
    registrar::{HttpRegistrar, RegistrarError},
    socket::WsConnector,
    store::{CredentialStore, FileStore, StoreError},
    supervisor::{Collaborators, Supervisor, SupervisorSettings, SupervisorState},
};

/// push-receiver - push notification companion process
#[derive(ClapParser, Debug)]
#[command(name = "push-receiver", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Path to the TOML config file
    #[arg(long, global = true, env = "PUSH_RECEIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the credential store (overrides config)
    #[arg(long, global = true, env = "PUSH_RECEIVER_STORE")]
    store: Option<PathBuf>,

    /// Registration endpoint (overrides config)
    #[arg(long, global = true, env = "PUSH_RECEIVER_REGISTRAR_URL")]
    registrar_url: Option<String>,

    /// Push socket endpoint (overrides config)
    #[arg(long, global = true, env = "PUSH_RECEIVER_SOCKET_URL")]
    socket_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the stdio JSON-lines bridge (default)
    Bridge,

    /// Start the service with an identity from the command line
    Start {
        #[arg(long)]
        app_id: String,
        #[arg(long)]
        project_id: String,
        #[arg(long, env = "PUSH_RECEIVER_API_KEY")]
        api_key: String,
        #[arg(long)]
        vapid_key: String,
    },

    /// Print the stored registration
    Show,

    /// Delete the stored registration
    Forget,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registrar error: {0}")]
    Registrar(#[from] RegistrarError),

    #[error("invalid identity: {0}")]
    Identity(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli
        .global
        .config
        .clone()
        .unwrap_or_else(ReceiverConfig::default_path);
    let config = ReceiverConfig::load(&config_path)?.unwrap_or_default();
    tracing::debug!(path = %config_path.display(), "config resolved");

    let store_path = cli
        .global
        .store
        .clone()
        .or_else(|| config.store.path.clone())
        .unwrap_or_else(FileStore::default_path);
    let store = Arc::new(FileStore::new(store_path));

    match cli.command {
        None | Some(Commands::Bridge) => run_bridge(&cli.global, &config, store).await,
        Some(Commands::Start {
            app_id,
            project_id,
            api_key,
            vapid_key,
        }) => {
            let identity = Identity::new(app_id, project_id, api_key, vapid_key);
            identity.validate().map_err(AppError::Identity)?;
            run_start(&cli.global, &config, store, identity).await
        }
        Some(Commands::Show) => run_show(store.as_ref()),
        Some(Commands::Forget) => run_forget(store.as_ref()),
    }
}

/// Tracing goes to stderr: stdout carries the bridge protocol.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "push_receiver=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_supervisor(
    global: &GlobalArgs,
    config: &ReceiverConfig,
    store: Arc<FileStore>,
    sink: Arc<dyn EventSink>,
) -> Result<Supervisor, AppError> {
    let registrar_url = global
        .registrar_url
        .clone()
        .or_else(|| config.registrar.endpoint.clone())
        .ok_or(ConfigError::Missing("registrar.endpoint"))?;
    let socket_url = global
        .socket_url
        .clone()
        .or_else(|| config.socket.endpoint.clone())
        .ok_or(ConfigError::Missing("socket.endpoint"))?;

    let connector = WsConnector::new(socket_url)
        .with_ping_interval(Duration::from_secs(config.socket.ping_interval_secs.max(1)));
    let settings = SupervisorSettings::from(&config.supervisor);
    tracing::debug!(?settings, "supervisor configured");

    Ok(Supervisor::new(
        Collaborators {
            registrar: Arc::new(HttpRegistrar::new(registrar_url)?),
            connector: Arc::new(connector),
            store,
            sink,
        },
        settings,
    ))
}

// ── Bridge mode ────────────────────────────────────────────────────

async fn run_bridge(
    global: &GlobalArgs,
    config: &ReceiverConfig,
    store: Arc<FileStore>,
) -> Result<(), AppError> {
    let (sink, events) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let supervisor = build_supervisor(global, config, store, sink.clone())?;
    let writer = tokio::spawn(bridge::forward_events(events, tokio::io::stdout()));

    tracing::info!("push-receiver bridge ready");
    let bridge = Bridge::new(supervisor, sink);
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());

    tokio::select! {
        result = bridge.serve(stdin) => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "bridge input failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C");
        }
    }

    bridge.close(writer, Duration::from_secs(5)).await;
    tracing::info!("push-receiver exiting");
    Ok(())
}

// ── Start mode ─────────────────────────────────────────────────────

async fn run_start(
    global: &GlobalArgs,
    config: &ReceiverConfig,
    store: Arc<FileStore>,
    identity: Identity,
) -> Result<(), AppError> {
    let (sink, events) = ChannelSink::new();
    let supervisor = build_supervisor(global, config, store, Arc::new(sink))?;
    let writer = tokio::spawn(bridge::forward_events(events, tokio::io::stdout()));

    supervisor.start(identity).await;
    if supervisor.state() != SupervisorState::Failed {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received Ctrl+C");
        supervisor.shutdown().await;
    }

    // Dropping the last sink handle closes the event channel, so the writer
    // drains what is queued and exits.
    drop(supervisor);
    if let Err(e) = writer.await {
        tracing::warn!(?e, "event writer task panicked");
    }
    Ok(())
}

// ── Store maintenance ──────────────────────────────────────────────

fn run_show(store: &FileStore) -> Result<(), AppError> {
    let stored = store.load()?;
    match (stored.credentials, stored.app_id) {
        (Some(credentials), app_id) => {
            println!("store:  {}", store.path().display());
            println!("appID:  {}", app_id.as_deref().unwrap_or("-"));
            println!("token:  {}", credentials.token);
            println!("acg.id: {}", credentials.acg.id);
        }
        (None, _) => println!("no stored registration in {}", store.path().display()),
    }
    Ok(())
}

fn run_forget(store: &FileStore) -> Result<(), AppError> {
    store.clear()?;
    println!("cleared stored registration in {}", store.path().display());
    Ok(())
}
