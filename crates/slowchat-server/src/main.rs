mod cleanup;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use slowchat_api::AppStateInner;
use slowchat_db::Database;
use slowchat_gateway::dispatcher::Dispatcher;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "slowchat_server=debug,slowchat_api=debug,slowchat_gateway=debug,slowchat_db=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    let config = Config::from_env()?;
    if config.uses_dev_secret() {
        warn!("SLOWCHAT_JWT_SECRET is not set; using the development secret. Do not run like this in production.");
    }

    let db = Arc::new(Database::open(&config.db_path)?);
    info!("Database ready at {}", config.db_path.display());

    tokio::spawn(cleanup::run_session_cleanup(db.clone(), config.session_cleanup_secs));

    let state = AppStateInner::new(db, Dispatcher::new(), config.auth_settings(), config.oauth_providers());
    for (name, enabled) in [("Google", config.google.is_some()), ("GitHub", config.github.is_some())] {
        if enabled {
            info!("{} sign-in enabled", name);
        }
    }

    let app = slowchat_api::app(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("SlowChat server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Could not install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
