use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use notify_hub::config::{self, Config};
use notify_hub::gateway::tasks::BackgroundTasks;
use notify_hub::gateway::Hub;
use notify_hub::AppState;

const DEFAULT_LOG_FILTER: &str = "notify_hub=info,tower_http=info";

fn init_tracing(log_file: Option<PathBuf>) {
    let file_layer = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            Err(err) => {
                eprintln!("cannot open log file {}: {err}", path.display());
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
}

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    init_tracing(config::log_file_from_env());

    let config = Config::from_env();
    let port = config.port;

    let hub = match Hub::from_config(&config) {
        Ok(hub) => Arc::new(hub),
        Err(err) => {
            tracing::error!(%err, "failed to initialise hub");
            std::process::exit(1);
        }
    };

    // A missing bus is not fatal; publishes retry and the spool covers the gap.
    hub.bridge().connect().await;

    let tasks = BackgroundTasks::spawn(hub.clone(), &config);

    let state = AppState {
        hub,
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(notify_hub::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, %err, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "notify-hub listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    tasks.abort_all();
    if let Err(err) = served {
        tracing::error!(%err, "server error");
        std::process::exit(1);
    }
    tracing::info!("notify-hub stopped");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "cannot listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
