pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod proxy;
pub mod transport;

use crate::auth::{AuthTransport, ProbePolicy};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::metrics::{metrics_handler, MetricsService};
use crate::observability::{request_id_middleware, DumpSink};
use crate::proxy::{proxy_handler, ProxyState};
use crate::transport::{HttpTransport, RoundTrip};
use axum::{
    middleware,
    routing::{any, get},
    Router as AxumRouter,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the authenticating transport described by `config` on top of `inner`
pub fn build_transport<T: RoundTrip + 'static>(
    config: &GatewayConfig,
    inner: T,
) -> Result<AuthTransport<T>> {
    let policy = ProbePolicy::from_config(&config.auth)?;
    let mut transport = AuthTransport::new(inner, policy)
        .with_probe_timeout(Duration::from_secs(config.auth.probe_timeout_secs));

    if config.observability.dump_requests {
        transport = transport.with_sink(Arc::new(DumpSink));
    }

    Ok(transport)
}

/// Build the proxy application; every path is routed to the proxy handler
pub fn build_app(state: ProxyState) -> AxumRouter {
    AxumRouter::new()
        .route("/", any(proxy_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_id_middleware)),
        )
}

/// Initialize the gateway server
pub async fn init_gateway(config: GatewayConfig) -> Result<()> {
    config.validate()?;

    let upstream = config.upstream.parse()?;

    info!("Starting authenticating gateway");
    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );
    info!(
        upstream = %upstream,
        auth_prefix = %config.auth.prefix,
        "Forwarding authorized requests"
    );

    let http = HttpTransport::new(Duration::from_secs(config.server.timeout_secs))?;
    let transport = build_transport(&config, http)?;

    let state = ProxyState::new(Arc::new(transport), upstream)
        .with_max_body_bytes(config.server.max_body_bytes);
    let app = build_app(state);

    if let Some(port) = config.observability.metrics_port {
        spawn_metrics_server(&config.server.host, port).await?;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!("Gateway ready to accept connections");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)))?;

    info!("Gateway stopped");

    Ok(())
}

async fn spawn_metrics_server(host: &str, port: u16) -> Result<()> {
    let service = MetricsService::new()?;
    let app = AxumRouter::new()
        .route("/metrics", get(metrics_handler))
        .with_state(service);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!("Metrics endpoint listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Metrics server stopped");
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
