//! Health check endpoints for Kubernetes and monitoring.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;

use crate::{AppState, resilience::CircuitState};

const APPLICATION_NAME: &str = "AD-Auth Service";

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub application: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ReadinessStatus {
    /// "READY" or "NOT_READY"
    pub status: &'static str,
}

/// Liveness. Always `UP` while the process can serve requests.
#[tracing::instrument(name = "health.check")]
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "UP",
        application: APPLICATION_NAME,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Kubernetes readiness check.
///
/// Not ready while the IdP metadata circuit is open: logins would fail fast
/// with 503 until the breaker admits a trial call.
#[tracing::instrument(name = "health.readiness", skip(state))]
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    match state.auth.metadata_circuit_state() {
        CircuitState::Open => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessStatus {
                status: "NOT_READY",
            }),
        ),
        CircuitState::Closed | CircuitState::HalfOpen => {
            (StatusCode::OK, Json(ReadinessStatus { status: "READY" }))
        }
    }
}
