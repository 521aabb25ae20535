use anyhow::{Context, Result};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use reauth_proxy::auth::ReauthEngine;
use reauth_proxy::config::Config;
use reauth_proxy::http_client::ReqwestTransport;
use reauth_proxy::log_buffer::LogBuffer;
use reauth_proxy::observer::BroadcastObserver;
use reauth_proxy::{middleware, routes};

/// Buffered engine events per SSE subscriber
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Console logging plus the engine log buffer shown by the UI
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let logs = LogBuffer::new(config.engine_log_level, config.max_log_entries);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_filter(env_filter),
        )
        .with(logs.layer())
        .init();

    tracing::info!("Re-authentication engine starting...");
    tracing::info!(
        "Control API configured: {}:{}",
        config.server_host,
        config.server_port
    );

    // Refresh transport
    let transport = Arc::new(ReqwestTransport::new(
        config.http_connect_timeout,
        config.http_request_timeout,
    )?);
    tracing::info!("HTTP client initialized");

    // Engine
    let settings = config.engine_settings()?;
    let engine = ReauthEngine::new(settings, transport).context("Failed to create engine")?;
    for rule in config.scope_rules() {
        engine.add_scope_rule(rule);
    }

    let events = Arc::new(BroadcastObserver::new(EVENT_CHANNEL_CAPACITY));
    engine.subscribe(events.clone());
    engine.start();

    let app_state = routes::AppState {
        control_api_key: config.control_api_key.clone(),
        engine: engine.clone(),
        logs,
        events,
    };

    let app = build_app(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    print_startup_banner(&config);

    tracing::info!("Control API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.shutdown();
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Build the application with all routes and middleware
fn build_app(state: routes::AppState) -> axum::Router {
    use axum::Router;

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::control_routes(state))
        // Control key is per-route; CORS and tracing wrap everything
        .layer(middleware::cors_layer())
        .layer(TraceLayer::new_for_http())
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    println!();
    println!("  reauth-proxy {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Control API:    http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Auth URL:       {}", config.auth_url);
    println!(
        "  Header:         {}: {}<token>",
        config.header_name, config.header_value_prefix
    );
    println!(
        "  Listening:      {}",
        if config.listen { "on" } else { "off" }
    );
    println!(
        "  Control key:    {}",
        if config.control_api_key.is_some() {
            "required"
        } else {
            "disabled"
        }
    );
    println!("  Log Level:      {}", config.log_level);
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
