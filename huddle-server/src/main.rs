//! Huddle daemon: web chat surface, peer transport, LAN discovery.

mod admin;
mod config;
mod discovery;
mod files;
mod http;
mod pages;
mod peer;
mod registry;
mod store;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use huddle_core::room::ChatCore;

use crate::admin::{AdminGate, SharedSecretEngine};
use crate::files::FileStore;
use crate::pages::{BuiltinPages, StaticContent};
use crate::registry::ChatState;
use crate::store::Store;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("huddle-server {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cfg = Arc::new(config::load());
    info!("starting huddle-server v{VERSION}");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = Arc::new(Store::open(&cfg.data_dir).await?);
        let files = Arc::new(FileStore::open(&cfg.uploads_dir).await?);

        let mut core = ChatCore::new(
            &cfg.admin_username,
            &cfg.public_host,
            cfg.history_replay_limit,
        );
        let rooms = store.load_rooms().await;
        let mut messages = Vec::with_capacity(rooms.len());
        for room in &rooms {
            messages.push((room.id, store.load_messages(room.id).await));
        }
        core.restore(
            rooms,
            messages,
            store.load_links().await,
            store.load_attachments().await,
        );
        // First boot persists the bootstrapped Lobby.
        store.save_rooms(&core.rooms_snapshot()).await?;
        info!(
            "restored {} rooms from {}",
            core.rooms_snapshot().len(),
            cfg.data_dir.display()
        );

        let state = Arc::new(Mutex::new(ChatState::new(core, cfg.max_envelope_bytes)));
        let admin = Arc::new(AdminGate::new(
            Box::new(SharedSecretEngine::new(cfg.admin_secret.clone())),
            &cfg.admin_username,
            cfg.admin_session_ttl_secs,
        ));
        let pages: Arc<dyn StaticContent> = Arc::new(BuiltinPages);

        // Periodic sweep of expired admin sessions.
        let sweeper = admin.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(300));
            loop {
                tick.tick().await;
                sweeper.cleanup().await;
            }
        });

        let http_ctx = http::HttpContext {
            state: state.clone(),
            store: store.clone(),
            files,
            admin,
            pages,
            config: cfg.clone(),
        };
        let bind: SocketAddr = format!("0.0.0.0:{}", cfg.http_port).parse()?;
        tokio::spawn(http::run_http(http_ctx, bind));

        let (connect_tx, connect_rx) = mpsc::unbounded_channel();
        let peer_ctx = peer::PeerContext {
            state,
            store,
            config: cfg.clone(),
        };
        tokio::spawn(peer::run_transport(peer_ctx, connect_rx));

        let instance_id = Uuid::new_v4();
        let disc_cfg = cfg.clone();
        tokio::spawn(async move {
            let _ = discovery::run_discovery(disc_cfg, instance_id, connect_tx).await;
        });

        shutdown_signal().await
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix); tasks die with the runtime.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("signal received, shutting down");
    Ok(())
}
