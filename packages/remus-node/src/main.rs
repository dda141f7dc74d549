//! Remus community node.
//!
//! A single-guild chat server: REST control plane, realtime WebSocket
//! gateway, and voice SFU signaling, backed by a SQLite store. Identity
//! is federated to an external authority; everything else lives here.

mod auth;
mod config;
mod error;
mod gateway;
mod http;
mod moderation;
mod rate_limit;
mod state;
mod views;
mod voice;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use remus_core::Store;

use crate::auth::IdentityResolver;
use crate::config::{Args, NodeConfig};
use crate::gateway::rooms::RoomIndex;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;
use crate::voice::media::{media_codecs, MediaEngine, NullMediaEngine, TransportOptions};
use crate::voice::VoiceCoordinator;

// Exit codes, mirrored in deployment tooling.
const EXIT_CONFIG: i32 = 1;
const EXIT_BIND: i32 = 2;
const EXIT_WORKER_DIED: i32 = 3;
const EXIT_BAD_DATABASE: i32 = 4;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let verbose = args.debug
        || std::env::var("NODE_ENV").is_ok_and(|v| v == "development");
    let default_filter = if verbose {
        "remus_node=debug,remus_core=debug,tower_http=info"
    } else {
        "remus_node=info,remus_core=info,tower_http=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    tracing::info!("starting remus-node v{}", env!("CARGO_PKG_VERSION"));

    // ── Configuration ────────────────────────────────────────────────────

    let config = match NodeConfig::from_args(args) {
        Ok(config) => Arc::new(config),
        Err(errors) => {
            for error in &errors {
                eprintln!("configuration error: {error}");
            }
            std::process::exit(EXIT_CONFIG);
        }
    };
    tracing::info!(
        port = config.port,
        backend = %config.main_backend_url,
        region = %config.region,
        admin_enabled = config.admin_key.is_some(),
        "configuration loaded"
    );

    // ── Store ────────────────────────────────────────────────────────────

    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(remus_core::Error::InvalidDatabase(msg)) => {
            tracing::error!(error = %msg, "database cannot be salvaged");
            std::process::exit(EXIT_BAD_DATABASE);
        }
        Err(e) => {
            tracing::error!(error = %e, "store bring-up failed");
            std::process::exit(EXIT_BAD_DATABASE);
        }
    };
    for dir in [&config.uploads_dir, &config.role_icons_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::error!(dir = %dir.display(), error = %e, "runtime directory unavailable");
            std::process::exit(EXIT_CONFIG);
        }
    }

    // ── Media worker ─────────────────────────────────────────────────────

    let engine = NullMediaEngine;
    let worker = match engine.create_worker().await {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!(error = %e, "media worker failed to start");
            std::process::exit(EXIT_WORKER_DIED);
        }
    };
    let media_router = match worker.create_router(media_codecs()).await {
        Ok(router) => router,
        Err(e) => {
            tracing::error!(error = %e, "media router creation failed");
            std::process::exit(EXIT_WORKER_DIED);
        }
    };

    // Worker death is the one fatal runtime event: fail fast.
    {
        let worker = worker.clone();
        tokio::spawn(async move {
            worker.wait_died().await;
            tracing::error!("media worker died, shutting down");
            std::process::exit(EXIT_WORKER_DIED);
        });
    }

    // ── Shared state ─────────────────────────────────────────────────────

    let rooms = RoomIndex::new();
    let voice = Arc::new(VoiceCoordinator::new(
        media_router,
        rooms.clone(),
        store.clone(),
        TransportOptions {
            listen_ip: config.media_listen_ip.clone(),
            announced_ip: config.media_announced_ip.clone(),
            min_port: config.media_min_port,
            max_port: config.media_max_port,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        },
    ));
    let resolver = Arc::new(IdentityResolver::new(
        &config.main_backend_url,
        config.backend_is_loopback(),
    ));
    let state = AppState {
        store: store.clone(),
        config: config.clone(),
        resolver: resolver.clone(),
        rooms,
        voice,
        rate: RateLimiter::new(),
    };

    // ── Background tasks ─────────────────────────────────────────────────

    {
        let resolver = resolver.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                resolver.sweep_expired();
            }
        });
    }
    {
        let rate = state.rate.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                rate.purge_stale(Duration::from_secs(600));
            }
        });
    }
    moderation::spawn_heartbeat(config.clone(), store);

    // ── Serve ────────────────────────────────────────────────────────────

    let app = http::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "failed to bind listen port");
            std::process::exit(EXIT_BIND);
        }
    };
    tracing::info!(addr = %addr, "community node listening");

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        tracing::error!(error = %e, "server error");
        std::process::exit(EXIT_BIND);
    }
}
