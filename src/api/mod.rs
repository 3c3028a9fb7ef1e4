//! HTTP surface: OTP endpoints, gateway callbacks, health probes

pub mod otp;
pub mod payments;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info};

use crate::commerce::CommerceBackend;
use crate::health::{HealthChecker, HealthState, HealthStatus};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::otp::OtpService;
use crate::payments::{ClickHandler, PaymeHandler};

#[derive(Clone)]
pub struct AppState {
    pub otp: Arc<OtpService>,
    pub payme: Arc<PaymeHandler>,
    pub click: Arc<ClickHandler>,
    pub backend: Arc<dyn CommerceBackend>,
    pub health_checker: HealthChecker,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/health/ready", get(readiness))
        .route("/health/live", get(liveness))
        .route("/auth/otp/request", post(otp::request_otp))
        .route("/auth/otp/verify", post(otp::verify_otp))
        .route("/payments/payme", post(payments::payme))
        .route("/payments/click", post(payments::click))
        .route("/payments/click/prepare", post(payments::click_prepare))
        .route("/payments/click/complete", post(payments::click_complete))
        .route("/payments/checkout-link", post(payments::checkout_link))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn root() -> &'static str {
    "uzpay backend"
}

async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let health_status = state.health_checker.check_health().await;

    if health_status.status == HealthState::Unhealthy {
        error!("Health check failed - service unhealthy");
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(health_status)))
    } else {
        Ok(Json(health_status))
    }
}

/// Readiness probe - every dependency must answer
async fn readiness(
    state: State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let result = health(state).await;
    if result.is_ok() {
        info!("Readiness check passed");
    }
    result
}

/// Liveness probe - the process is up
async fn liveness() -> &'static str {
    "OK"
}
