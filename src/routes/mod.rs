pub mod auth;
pub mod health;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

/// `/auth/ad/*`: login, response validation, role mapping and SP metadata.
pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(auth::login))
        .route("/validate", post(auth::validate))
        .route("/acs", post(auth::acs))
        .route("/map-roles", post(auth::map_roles))
        .route("/logout", get(auth::logout).post(auth::logout))
        .route("/metadata", get(auth::metadata))
}

/// `/actuator/health*` checks.
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/readiness", get(health::readiness))
}
