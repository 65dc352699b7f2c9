use std::net::SocketAddr;
use std::process::ExitCode as StdExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signing_coordinator::config::Config;
use signing_coordinator::error::ExitCode;
use signing_coordinator::ledger::{self, NoopLedgerClient};
use signing_coordinator::manager::SessionManager;
use signing_coordinator::protocol::ShareString;
use signing_coordinator::rate_limit::RateLimiter;
use signing_coordinator::server::{self, AppState};
use signing_coordinator::session::{CreateSessionConfig, SessionStore};
use signing_coordinator::timer::TimerRegistry;
use signing_coordinator::{middleware, routes};

#[tokio::main]
async fn main() -> StdExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "signing_coordinator=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(addr = %config.addr(), "starting signing coordinator");

    let timers = TimerRegistry::new();
    let rate_limiter = RateLimiter::new();
    let store = SessionStore::new();

    // Ledger/tunnel/persistence are out of scope to implement for real
    // (§6) — the no-op and in-memory defaults keep the rest of the
    // pipeline exercisable end to end without an external system wired in.
    let ledger: Arc<dyn ledger::LedgerClient> = Arc::new(NoopLedgerClient);
    let (manager, events_rx) = SessionManager::new(Arc::clone(&store), Arc::clone(&timers), ledger);

    let initial_session = store.create_session(CreateSessionConfig {
        threshold: config.threshold,
        eligible_keys: config.eligible_keys.clone(),
        expected_participants: config.expected_participants,
        auth_token: config.auth_token.clone(),
        timeout: config.session_timeout,
        frozen_transaction: None,
    });
    let (session_id, auth_token) = {
        let session = initial_session.lock().expect("session poisoned");
        (session.session_id.clone(), session.auth_token.clone())
    };

    let public_url = resolve_public_url(&config).await;
    let share = ShareString { server_url: public_url, session_id: session_id.clone(), auth_token };
    tracing::info!(session_id = %session_id, share = %share.encode(), "session ready; distribute the share string to participants");

    manager.spawn_cleanup_loop(config.cleanup_interval);
    {
        let rate_limiter = Arc::clone(&rate_limiter);
        timers.register_periodic("rate_limiter.sweep", "rate_limiter", config.cleanup_interval, move || {
            let rate_limiter = Arc::clone(&rate_limiter);
            async move { rate_limiter.sweep() }
        });
    }

    let state = AppState::new(manager, events_rx, rate_limiter, config.heartbeat_interval, config.heartbeat_timeout);

    let metrics_handle = setup_metrics();
    let cors = CorsLayer::new()
        .allow_origin(config.cors_origins.iter().filter_map(|o| o.parse().ok()).collect::<Vec<_>>())
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(routes::health::router())
        .merge(server::router())
        .route("/metrics", axum::routing::get(move || async move { metrics_handle.render() }))
        .layer(middleware::security::SecurityHeadersLayer)
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state.clone());

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let result = if config.tls_enabled() {
        serve_tls(&config, make_service).await
    } else {
        serve_plain(&config, make_service).await
    };

    state.manager.expire_all_sessions("shutting down");
    state.manager.timers().shutdown();

    match result {
        Ok(()) => StdExitCode::from(ExitCode::Success as u8),
        Err(e) => {
            tracing::error!(error = %e, "server error");
            StdExitCode::from(ExitCode::Network as u8)
        }
    }
}

async fn resolve_public_url(config: &Config) -> String {
    use signing_coordinator::tunnel::{NoTunnel, TunnelProvider};

    if config.tunnel_provider.is_some() {
        // A real provider would be selected by name here; none is wired in
        // by default (§6), so fall through to the bind address.
        if let Err(e) = NoTunnel.public_url(config.addr()).await {
            tracing::warn!(error = %e, "tunnel provider unavailable, falling back to bind address");
        }
    }
    let scheme = if config.tls_enabled() { "wss" } else { "ws" };
    format!("{scheme}://{}:{}/ws", config.bind_host, config.bind_port)
}

fn setup_metrics() -> metrics_exporter_prometheus::PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder().expect("failed to install Prometheus recorder")
}

async fn serve_plain(config: &Config, make_service: axum::extract::connect_info::IntoMakeServiceWithConnectInfo<Router, SocketAddr>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.addr()).await?;
    tracing::info!(addr = %config.addr(), "listening");
    axum::serve(listener, make_service).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn serve_tls(config: &Config, make_service: axum::extract::connect_info::IntoMakeServiceWithConnectInfo<Router, SocketAddr>) -> anyhow::Result<()> {
    let cert_path = config.tls_cert.as_ref().expect("tls_enabled guarantees tls_cert");
    let key_path = config.tls_key.as_ref().expect("tls_enabled guarantees tls_key");
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
    tracing::info!(addr = %config.addr(), "listening (tls)");
    axum_server::bind_rustls(config.addr(), tls_config).serve(make_service).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("ctrl+c received, shutting down"),
        _ = terminate => tracing::info!("sigterm received, shutting down"),
    }
}
