pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod response;

use crate::config::{AppConfig, Policies};
use crate::error::{ApiError, Result};
use crate::metrics::MetricsService;
use crate::rate_limit::{RateLimitMiddleware, RateLimiter};
use crate::response::ApiResponse;
use axum::{
    extract::{OriginalUri, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub policies: Policies,
    pub trust_proxy: bool,
    pub metrics: Option<MetricsService>,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>, policies: Policies, trust_proxy: bool) -> Self {
        Self {
            limiter,
            policies,
            trust_proxy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsService) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Middleware enforcing the standard policy
    pub fn standard_limit(&self) -> RateLimitMiddleware {
        self.limit(self.policies.standard.clone())
    }

    /// Middleware enforcing the strict policy (login, bulk delete)
    pub fn strict_limit(&self) -> RateLimitMiddleware {
        self.limit(self.policies.strict.clone())
    }

    /// Middleware enforcing the API policy
    pub fn api_limit(&self) -> RateLimitMiddleware {
        self.limit(self.policies.api.clone())
    }

    fn limit(&self, policy: rate_limit::Policy) -> RateLimitMiddleware {
        RateLimitMiddleware::new(Arc::clone(&self.limiter), policy, self.trust_proxy)
    }
}

/// Assemble the HTTP application
pub fn build_app(state: AppState) -> Router {
    let health = state
        .standard_limit()
        .apply(Router::new().route("/health", get(health_handler)));

    let api = state
        .api_limit()
        .apply(Router::new().route("/api/v1/test", get(api_test_handler)));

    Router::new()
        .merge(health)
        .merge(api)
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::ok(
        json!({
            "status": "healthy",
            "rateLimiter": state.limiter.state(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
        "Service is healthy",
    )
}

async fn api_test_handler() -> impl IntoResponse {
    ApiResponse::ok(
        json!({ "version": env!("CARGO_PKG_VERSION") }),
        "REST API works fine!",
    )
}

async fn metrics_handler(State(state): State<AppState>, uri: OriginalUri) -> Response {
    match &state.metrics {
        Some(metrics) => metrics.response(),
        None => ApiError::NotFound(uri.path().to_string()).into_response(),
    }
}

async fn not_found_handler(uri: OriginalUri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}

/// Run the server until a shutdown signal arrives, then close the limiter
pub async fn run(config: AppConfig) -> Result<()> {
    config.validate()?;

    info!("Starting Notes API");

    let metrics = MetricsService::new()?;
    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limiting).await?);
    let policies = config.rate_limiting.policies()?;

    let state = AppState::new(
        Arc::clone(&limiter),
        policies,
        config.rate_limiting.trust_proxy,
    )
    .with_metrics(metrics);
    let app = build_app(state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Server listening on {}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    limiter.close().await;
    info!("Cleanup complete");

    served.map_err(ApiError::Io)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received, shutting down gracefully"),
        _ = terminate => info!("SIGTERM received, shutting down gracefully"),
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON output
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Initialize tracing/logging
pub fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "notes_ratelimit=debug,tower_http=debug".into());

    match format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .init(),
    }
}
