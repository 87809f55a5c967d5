//! SP-initiated login: AuthnRequest over the HTTP-Redirect binding.

use std::sync::Arc;

use openssl::pkey::{PKey, Private};
use rand::Rng;
use samael::{metadata::EntityDescriptor, service_provider::ServiceProviderBuilder};
use serde::Serialize;
use thiserror::Error;

use super::{HTTP_REDIRECT_BINDING, strip_pem_headers};
use crate::config::FederationConfig;

/// RelayState used when the caller supplies none.
pub const DEFAULT_RELAY_STATE: &str = "/";

const DEFAULT_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

#[derive(Debug, Error)]
pub enum AuthnRequestError {
    #[error("invalid SP private key: {0}")]
    InvalidKey(String),

    #[error("failed to build AuthnRequest: {0}")]
    Build(String),

    #[error("failed to encode AuthnRequest: {0}")]
    Encode(String),
}

/// Where to send the browser, plus what was sent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRedirect {
    #[serde(rename = "redirectUrl")]
    pub url: String,
    #[serde(skip)]
    pub request_id: String,
    #[serde(skip)]
    pub relay_state: String,
}

/// Builds AuthnRequest redirect URLs.
///
/// Stateless: request IDs are generated per call and never recorded.
pub struct AuthnRequestBuilder {
    federation: Arc<FederationConfig>,
    signing_key: Option<PKey<Private>>,
}

impl AuthnRequestBuilder {
    pub fn new(federation: Arc<FederationConfig>) -> Result<Self, AuthnRequestError> {
        let signing_key = if federation.sign_requests {
            let pem = federation.sp_private_key.as_deref().ok_or_else(|| {
                AuthnRequestError::InvalidKey(
                    "sign_requests is enabled but sp_private_key is not configured".into(),
                )
            })?;
            // PKCS#8 or PKCS#1
            let key = PKey::private_key_from_pem(pem.as_bytes())
                .map_err(|e| AuthnRequestError::InvalidKey(e.to_string()))?;
            Some(key)
        } else {
            None
        };

        Ok(Self {
            federation,
            signing_key,
        })
    }

    /// Build the redirect URL for `sso_url`.
    ///
    /// `relay_state` is passed through untouched; absent or empty becomes `/`.
    pub fn build(
        &self,
        sso_url: &str,
        relay_state: Option<&str>,
    ) -> Result<LoginRedirect, AuthnRequestError> {
        let relay_state = relay_state
            .filter(|state| !state.is_empty())
            .unwrap_or(DEFAULT_RELAY_STATE)
            .to_string();

        let sp = ServiceProviderBuilder::default()
            .entity_id(self.federation.entity_id.clone())
            .acs_url(self.federation.acs_url.clone())
            .idp_metadata(self.idp_descriptor(sso_url)?)
            .authn_name_id_format(
                self.federation
                    .name_id_format
                    .clone()
                    .unwrap_or_else(|| DEFAULT_NAME_ID_FORMAT.to_string()),
            )
            .force_authn(self.federation.force_authn)
            .build()
            .map_err(|e| AuthnRequestError::Build(e.to_string()))?;

        let mut authn_request = sp
            .make_authentication_request(sso_url)
            .map_err(|e| AuthnRequestError::Build(e.to_string()))?;
        authn_request.id = generate_request_id();
        let request_id = authn_request.id.clone();

        let url = match &self.signing_key {
            Some(key) => authn_request
                .signed_redirect(&relay_state, key.clone())
                .map_err(|e| AuthnRequestError::Encode(e.to_string()))?,
            None => authn_request
                .redirect(&relay_state)
                .map_err(|e| AuthnRequestError::Encode(e.to_string()))?,
        }
        .ok_or_else(|| AuthnRequestError::Encode("AuthnRequest has no destination".into()))?;

        tracing::debug!(request_id = %request_id, signed = self.signing_key.is_some(), "Built AuthnRequest");

        Ok(LoginRedirect {
            url: url.to_string(),
            request_id,
            relay_state,
        })
    }

    /// Minimal IdP descriptor: the SSO endpoint, and the pinned certificate
    /// when there is one.
    fn idp_descriptor(&self, sso_url: &str) -> Result<EntityDescriptor, AuthnRequestError> {
        let key_descriptor = self
            .federation
            .idp_certificate
            .as_deref()
            .map(|pem| {
                format!(
                    r#"<md:KeyDescriptor use="signing"><ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#"><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></md:KeyDescriptor>"#,
                    strip_pem_headers(pem)
                )
            })
            .unwrap_or_default();
        let entity_id = self
            .federation
            .idp_entity_id
            .as_deref()
            .unwrap_or(sso_url);

        let xml = format!(
            r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}"><md:IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">{key_descriptor}<md:SingleSignOnService Binding="{HTTP_REDIRECT_BINDING}" Location="{}"/></md:IDPSSODescriptor></md:EntityDescriptor>"#,
            quick_xml::escape::escape(entity_id),
            quick_xml::escape::escape(sso_url),
        );

        samael::metadata::de::from_str(&xml).map_err(|e| AuthnRequestError::Build(e.to_string()))
    }
}

/// `_` followed by 128 random bits in hex. The leading underscore keeps the
/// value a valid xsd:ID.
fn generate_request_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    format!("_{}", hex::encode(bytes))
}
