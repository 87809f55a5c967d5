use std::{sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument};

use crate::{
    cache::{Cache, MemoryCache},
    clock::SharedClock,
    config::AdAuthConfig,
    error::AuthError,
    resilience::CircuitState,
    roles::{RoleMapper, RoleMappingResult},
    saml::{
        AuthnRequestBuilder, IdpMetadataStore, LoginRedirect, MetadataError, ResponseValidator,
        UserAttributes, ValidationFailure, ValidationOutcome, authn_request::AuthnRequestError,
        generate_sp_metadata,
    },
};

#[derive(Debug, Error)]
pub enum ServiceInitError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    AuthnRequest(#[from] AuthnRequestError),
}

/// A validated user and the roles their groups map to.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    pub user_attributes: UserAttributes,
    pub roles: Vec<String>,
}

/// Login, response validation and role mapping behind one facade.
pub struct AuthService {
    config: Arc<AdAuthConfig>,
    metadata: Arc<IdpMetadataStore>,
    requests: AuthnRequestBuilder,
    validator: ResponseValidator,
    roles: RoleMapper,
}

impl AuthService {
    /// `role_cache` holds role mapping results only. Consumed assertion IDs
    /// live in a store of their own, so that filling the role cache through
    /// `map_roles` can never evict them.
    pub fn new(
        config: Arc<AdAuthConfig>,
        role_cache: Arc<dyn Cache>,
        clock: SharedClock,
        metadata: Arc<IdpMetadataStore>,
    ) -> Result<Self, ServiceInitError> {
        let federation = Arc::new(config.federation.clone());
        let requests = AuthnRequestBuilder::new(federation.clone())?;
        let replay_store = Arc::new(MemoryCache::replay_store(config.cache.replay_max_entries));
        let validator = ResponseValidator::new(federation, metadata.clone(), replay_store, clock);
        let roles = RoleMapper::new(
            Arc::new(config.role_mapping.clone()),
            role_cache,
            Duration::from_secs(config.cache.role_mapping_ttl_secs),
        );

        Ok(Self {
            config,
            metadata,
            requests,
            validator,
            roles,
        })
    }

    /// Build every collaborator from configuration, including the metadata
    /// store and its HTTP client.
    pub fn from_config(
        config: Arc<AdAuthConfig>,
        role_cache: Arc<dyn Cache>,
        clock: SharedClock,
    ) -> Result<Self, ServiceInitError> {
        let metadata = IdpMetadataStore::new(
            Arc::new(config.federation.clone()),
            &config.resilience,
            clock.clone(),
        )?;
        Self::new(config, role_cache, clock, Arc::new(metadata))
    }

    /// Redirect URL that starts SP-initiated login at the IdP.
    #[instrument(skip_all)]
    pub async fn initiate_login(
        &self,
        relay_state: Option<&str>,
    ) -> Result<LoginRedirect, AuthError> {
        let sso_url = self.metadata.sso_url().await?;
        let redirect = self
            .requests
            .build(&sso_url, relay_state)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        info!(request_id = %redirect.request_id, "Initiating AD authentication");
        Ok(redirect)
    }

    pub async fn validate(&self, response_b64: &str) -> ValidationOutcome {
        self.validator.validate(response_b64).await
    }

    /// Validate a response and map the user's groups to roles.
    #[instrument(skip_all)]
    pub async fn authenticate(
        &self,
        response_b64: &str,
    ) -> Result<AuthenticatedUser, ValidationFailure> {
        let user_attributes = self.validate(response_b64).await.into_result()?;
        let RoleMappingResult { roles } = self.map_roles(Some(&user_attributes.groups)).await;
        info!(
            principal = %user_attributes.principal_name,
            roles = ?roles,
            "AD authentication succeeded"
        );
        Ok(AuthenticatedUser {
            user_attributes,
            roles,
        })
    }

    pub async fn map_roles(&self, groups: Option<&[String]>) -> RoleMappingResult {
        self.roles.map_roles(groups).await
    }

    pub fn sp_metadata(&self) -> String {
        generate_sp_metadata(&self.config.federation)
    }

    pub fn metadata_circuit_state(&self) -> CircuitState {
        self.metadata.circuit_state()
    }
}
