use std::sync::Arc;

use axum::Router;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::{
    cache::{Cache, MemoryCache},
    clock::system_clock,
    config::AdAuthConfig,
    routes,
    services::{AuthService, ServiceInitError},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AdAuthConfig>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub fn new(config: Arc<AdAuthConfig>, auth: Arc<AuthService>) -> Self {
        Self { config, auth }
    }

    /// Wire the production collaborators: in-memory role cache, system clock
    /// and an HTTP client for the federation metadata.
    pub fn from_config(config: AdAuthConfig) -> Result<Self, ServiceInitError> {
        let config = Arc::new(config);
        let role_cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(&config.cache));
        let auth = AuthService::from_config(config.clone(), role_cache, system_clock())?;
        Ok(Self::new(config, Arc::new(auth)))
    }
}

pub fn build_app(config: &AdAuthConfig, state: AppState) -> Router {
    Router::new()
        .nest("/auth/ad", routes::auth_routes())
        .nest("/actuator", routes::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.server.body_limit_bytes))
        .with_state(state)
}
