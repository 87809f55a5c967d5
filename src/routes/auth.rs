//! AD FS login, assertion consumer and role mapping endpoints.
//!
//! Login returns the IdP redirect URL as JSON rather than a 302 so that a
//! single-page frontend can decide when to navigate.

use axum::{
    Form, Json,
    extract::{Query, State},
    http::header,
    response::IntoResponse,
};
use axum_valid::Valid;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    AppState,
    error::AuthError,
    roles::RoleMappingResult,
    saml::LoginRedirect,
    services::AuthenticatedUser,
};

/// Upper bound on a base64 SAML response. AD FS responses with large group
/// lists stay well below this.
const MAX_SAML_RESPONSE_LEN: u64 = 512 * 1024;
const MAX_RELAY_STATE_LEN: u64 = 2048;
const MAX_AD_GROUPS: u64 = 1024;

#[derive(Debug, Deserialize, Validate)]
pub struct LoginQuery {
    /// Where to send the user once authentication completes.
    #[serde(rename = "relayState", default)]
    #[validate(length(max = MAX_RELAY_STATE_LEN))]
    pub relay_state: Option<String>,
}

/// SAML response as posted by a frontend (JSON) or by the IdP (form).
///
/// A missing `SAMLResponse` deserializes to an empty string so that it is
/// rejected by the validator with the same code as an empty one.
#[derive(Debug, Deserialize, Validate)]
pub struct SamlResponseInput {
    #[serde(rename = "SAMLResponse", default)]
    #[validate(length(max = MAX_SAML_RESPONSE_LEN))]
    pub saml_response: String,
    #[serde(rename = "RelayState", default)]
    #[validate(length(max = MAX_RELAY_STATE_LEN))]
    pub relay_state: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MapRolesRequest {
    #[serde(rename = "adGroups", default)]
    #[validate(length(max = MAX_AD_GROUPS))]
    pub ad_groups: Option<Vec<String>>,
}

/// `{"valid": true, "userAttributes": {...}, "roles": [...], "relayState": ...}`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(flatten)]
    pub user: AuthenticatedUser,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub message: &'static str,
}

#[tracing::instrument(name = "auth.ad.login", skip(state))]
pub async fn login(
    State(state): State<AppState>,
    Valid(Query(query)): Valid<Query<LoginQuery>>,
) -> Result<Json<LoginRedirect>, AuthError> {
    let redirect = state.auth.initiate_login(query.relay_state.as_deref()).await?;
    Ok(Json(redirect))
}

/// Validate a SAML response posted as JSON and map the user's groups.
#[tracing::instrument(name = "auth.ad.validate", skip_all)]
pub async fn validate(
    State(state): State<AppState>,
    Valid(Json(input)): Valid<Json<SamlResponseInput>>,
) -> Result<Json<ValidateResponse>, AuthError> {
    consume(&state, input).await
}

/// Assertion consumer service for the IdP's HTTP-POST binding.
#[tracing::instrument(name = "auth.ad.acs", skip_all)]
pub async fn acs(
    State(state): State<AppState>,
    Valid(Form(input)): Valid<Form<SamlResponseInput>>,
) -> Result<Json<ValidateResponse>, AuthError> {
    consume(&state, input).await
}

async fn consume(
    state: &AppState,
    input: SamlResponseInput,
) -> Result<Json<ValidateResponse>, AuthError> {
    let user = state.auth.authenticate(&input.saml_response).await?;
    Ok(Json(ValidateResponse {
        valid: true,
        user,
        relay_state: input.relay_state,
    }))
}

#[tracing::instrument(name = "auth.ad.map_roles", skip_all)]
pub async fn map_roles(
    State(state): State<AppState>,
    Valid(Json(input)): Valid<Json<MapRolesRequest>>,
) -> Json<RoleMappingResult> {
    Json(state.auth.map_roles(input.ad_groups.as_deref()).await)
}

/// Acknowledges logout. Sessions are owned by the caller, so there is
/// nothing to tear down here.
#[tracing::instrument(name = "auth.ad.logout")]
pub async fn logout() -> Json<LogoutResponse> {
    tracing::info!("User logged out");
    Json(LogoutResponse {
        message: "Logged out successfully",
    })
}

#[tracing::instrument(name = "auth.ad.metadata", skip(state))]
pub async fn metadata(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        state.auth.sp_metadata(),
    )
}
