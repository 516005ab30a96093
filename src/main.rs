//! Signet daemon entry point (§5 concurrency model).
//!
//! Loads config, opens the database, wires the core services together, and
//! spawns: the relay notification/health/pump loops, one NIP-46 backend
//! task per key the vault activates, the HTTP control plane, and a 60s
//! janitor sweeping expired requests, expired tokens, and old log rows.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nostr::prelude::*;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use signet::acl::AclEvaluator;
use signet::backend::Nip46Backend;
use signet::bus::EventBus;
use signet::config::{Config, ConfiguredKey};
use signet::db;
use signet::http::{self, AppState};
use signet::queue::PendingQueue;
use signet::relay::subscription::{HeartbeatOutcome, SubscriptionManager, HEARTBEAT_INTERVAL};
use signet::relay::{NostrSdkTransport, RelayPool};
use signet::tokens::TokenStore;
use signet::vault::KeyVault;

#[derive(Parser)]
#[command(name = "signetd", version, about = "NIP-46 remote signing daemon for Nostr")]
struct Cli {
    /// Path to the JSON config document; defaults to the platform config dir.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "signet=info".into()))
        .init();

    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => Config::default_path().context("resolving default config path")?,
    };
    let config = Config::load(&config_path).await.context("loading config")?;
    info!(path = %config_path.display(), "configuration loaded");

    let database_url = match std::env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => Config::default_database_path()
            .context("resolving default database path")?
            .to_string_lossy()
            .into_owned(),
    };
    let pool = db::connect(&database_url).await.context("connecting to database")?;
    info!(database_url, "database ready");

    let bus = Arc::new(EventBus::new());
    let vault = Arc::new(KeyVault::new(pool.clone()));
    let acl = Arc::new(AclEvaluator::new(pool.clone()));
    let queue = Arc::new(PendingQueue::new(pool.clone(), bus.clone()));
    let tokens = Arc::new(TokenStore::new(pool.clone()));

    // The underlying nostr-sdk client needs *a* signer to construct, but
    // every event we publish through it already arrives pre-signed by the
    // relevant custodied key (see relay::NostrSdkTransport::publish) — this
    // one never signs anything itself.
    let transport = Arc::new(NostrSdkTransport::new(nostr_sdk::Client::new(Keys::generate())));
    let relay_pool = Arc::new(RelayPool::new(transport.clone()));
    let subscriptions = Arc::new(SubscriptionManager::new(relay_pool.clone()));

    for relay in &config.relays {
        if let Err(e) = relay_pool.add_relay(relay).await {
            warn!(relay, error = %e, "failed to connect relay at startup");
        }
    }

    tokio::spawn({
        let transport = transport.clone();
        async move { transport.run_notification_loop().await }
    });
    tokio::spawn({
        let relay_pool = relay_pool.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                relay_pool.health_check_once().await;
            }
        }
    });
    tokio::spawn({
        let relay_pool = relay_pool.clone();
        async move {
            loop {
                if !relay_pool.pump_once().await {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    });
    tokio::spawn({
        let subscriptions = subscriptions.clone();
        async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                match subscriptions.heartbeat_tick(tokio::time::Instant::now()).await {
                    HeartbeatOutcome::Healthy => {}
                    outcome => warn!(?outcome, "subscription heartbeat detected trouble, subscriptions restarted"),
                }
            }
        }
    });

    {
        let pool = pool.clone();
        let vault_for_cb = vault.clone();
        let acl = acl.clone();
        let queue = queue.clone();
        let tokens = tokens.clone();
        let relay_pool = relay_pool.clone();
        let subscriptions = subscriptions.clone();
        let bus = bus.clone();
        let admin_secret = config.admin_secret.clone();
        vault.register_activation_callback(Arc::new(move |name, _keys| {
            let backend = Arc::new(Nip46Backend::new(
                name.clone(),
                pool.clone(),
                vault_for_cb.clone(),
                acl.clone(),
                queue.clone(),
                tokens.clone(),
                relay_pool.clone(),
                subscriptions.clone(),
                bus.clone(),
                admin_secret.clone(),
            ));
            Box::pin(async move {
                if let Err(e) = backend.start().await {
                    error!(key = name, error = %e, "failed to start NIP-46 backend");
                }
            })
        }));
    }

    // Bootstrap plaintext keys declared in the config that aren't yet in the
    // vault. Encrypted entries wait for an operator to hit the unlock route.
    for (name, configured) in &config.keys {
        match configured {
            ConfiguredKey::Plain { key } => {
                if db::key_repo::find(&pool, name).await?.is_none() {
                    vault.create(name, None, Some(key)).await.context("bootstrapping configured key")?;
                }
            }
            ConfiguredKey::Encrypted { .. } => {
                info!(key = name, "configured key is encrypted, waiting for an unlock call");
            }
        }
    }

    let state = AppState {
        pool: pool.clone(),
        vault: vault.clone(),
        acl: acl.clone(),
        queue: queue.clone(),
        tokens: tokens.clone(),
        relay_pool: relay_pool.clone(),
        bus: bus.clone(),
        admin_secret: config.admin_secret.clone(),
        base_url: config.base_url.clone(),
    };
    let app = http::router(state).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind).await.context("binding HTTP listener")?;
    info!(bind = %config.bind, "HTTP control plane listening");

    tokio::spawn(janitor(pool.clone(), queue.clone(), tokens.clone()));

    axum::serve(listener, app).await.context("HTTP server exited")?;
    Ok(())
}

/// Background sweep (§4.4 `cleanup`, §4.8, §3 log retention): every 60s,
/// prune expired pending requests, expired tokens, and month-old log rows.
async fn janitor(pool: sqlx::SqlitePool, queue: Arc<PendingQueue>, tokens: Arc<TokenStore>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        if let Err(e) = queue.cleanup().await {
            warn!(error = %e, "pending-request cleanup failed");
        }
        if let Err(e) = tokens.cleanup().await {
            warn!(error = %e, "token cleanup failed");
        }
        let cutoff = chrono::Utc::now() - chrono::Duration::days(30);
        if let Err(e) = db::log_repo::prune(&pool, cutoff).await {
            warn!(error = %e, "log prune failed");
        }
    }
}
