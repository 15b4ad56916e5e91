//! LogChef query gateway service
//! Multi-tenant log exploration over ClickHouse and VictoriaLogs.

use anyhow::{Context, Result};
use clap::{Arg, Command};
use logchef::config::Config;
use logchef::state::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let matches = Command::new("logchef")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Log exploration gateway for ClickHouse and VictoriaLogs")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Override the server bind host"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Override the server port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("validate-config")
                .long("validate-config")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").unwrap();
    info!("loading configuration from {config_path}");
    let mut config = Config::from_file(config_path)
        .with_context(|| format!("failed to load configuration from {config_path}"))?;

    if let Some(host) = matches.get_one::<String>("host") {
        config.server.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.server.port = *port;
    }

    config.validate().context("configuration validation failed")?;
    if matches.get_flag("validate-config") {
        info!("configuration is valid");
        return Ok(());
    }

    let (state, scheduler) = AppState::build(config)
        .await
        .context("failed to initialise services")?;

    state
        .manager
        .start_health_checks(Duration::from_secs(state.config.health.check_interval_secs));
    let janitor_stop = tokio_util::sync::CancellationToken::new();
    let _janitor = state.tracker.start_janitor(
        Duration::from_secs(state.config.query.sweep_interval_secs),
        Duration::from_secs(state.config.query.stale_query_secs),
        janitor_stop.clone(),
    );
    let scheduler_handle = if state.config.alerts.enabled {
        Some(scheduler.start())
    } else {
        info!("alert scheduler disabled");
        None
    };

    let mut app = logchef::api::router(state.clone()).layer(TraceLayer::new_for_http());
    if state.config.server.enable_cors {
        // origins come from config; empty list means any
        let cors = if state.config.server.cors_origins.is_empty() {
            CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
        } else {
            let origins: Vec<_> = state
                .config
                .server
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
        };
        app = app.layer(cors);
    }
    app = app.layer(TimeoutLayer::new(Duration::from_secs(
        state.config.server.request_timeout_secs,
    )));

    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "logchef listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down");
    janitor_stop.cancel();
    scheduler.shutdown();
    if let Some(handle) = scheduler_handle {
        if tokio::time::timeout(scheduler.grace(), handle).await.is_err() {
            warn!("alert scheduler did not drain in time");
        }
    }
    state.manager.close().await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,logchef=debug"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
