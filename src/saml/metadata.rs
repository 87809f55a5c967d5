//! IdP federation metadata and SP metadata.
//!
//! The IdP metadata document supplies the signing certificates, the expected
//! issuer and the SSO endpoint. It is fetched lazily on first use through the
//! retry and circuit breaker wrapper, and the first successful load is kept
//! for the life of the process. A failed load leaves nothing cached, so the
//! next caller tries again (unless the circuit is open).

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::x509::X509;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{DSIG_NS, HTTP_POST_BINDING, HTTP_REDIRECT_BINDING, MD_NS, strip_pem_headers, xml};
use crate::{
    clock::SharedClock,
    config::{FederationConfig, ResilienceConfig, RetryConfig},
    resilience::{
        CircuitBreaker, CircuitBreakerError, CircuitState, ResilientCallError,
        with_circuit_breaker_and_retry,
    },
};

const DEFAULT_SP_NAME_ID_FORMAT: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("metadata request timed out after {0}ms")]
    Timeout(u64),

    #[error("invalid metadata: {0}")]
    Invalid(String),

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),
}

impl MetadataError {
    /// Connection errors, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(error) => {
                error.is_connect()
                    || error.is_timeout()
                    || error.is_request()
                    || error
                        .status()
                        .map(|s| s.is_server_error() || s == reqwest::StatusCode::TOO_MANY_REQUESTS)
                        .unwrap_or(false)
            }
            Self::Timeout(_) => true,
            Self::Invalid(_) | Self::Certificate(_) | Self::CircuitOpen(_) => false,
        }
    }
}

impl From<ResilientCallError<MetadataError>> for MetadataError {
    fn from(error: ResilientCallError<MetadataError>) -> Self {
        match error {
            ResilientCallError::CircuitOpen(open) => Self::CircuitOpen(open),
            ResilientCallError::Operation(error) => error,
        }
    }
}

/// What the IdP publishes about itself.
#[derive(Debug, Clone)]
pub struct IdpMetadata {
    pub entity_id: Option<String>,
    pub signing_certificates: Vec<X509>,
    /// `SingleSignOnService` with the HTTP-Redirect binding.
    pub sso_redirect_url: Option<String>,
}

impl IdpMetadata {
    /// Parse an `EntityDescriptor` (or the first one in an `EntitiesDescriptor`).
    pub fn parse(document: &str) -> Result<Self, MetadataError> {
        let doc = xml::Document::parse(document)
            .map_err(|e| MetadataError::Invalid(e.to_string()))?;
        let root = doc.root();

        let entity = if root.is(MD_NS, "EntityDescriptor") {
            root
        } else if root.is(MD_NS, "EntitiesDescriptor") {
            root.child(MD_NS, "EntityDescriptor")
                .ok_or_else(|| MetadataError::Invalid("no EntityDescriptor".into()))?
        } else {
            return Err(MetadataError::Invalid(format!(
                "unexpected root element <{}>",
                root.local_name()
            )));
        };

        let idp = entity
            .child(MD_NS, "IDPSSODescriptor")
            .ok_or_else(|| MetadataError::Invalid("no IDPSSODescriptor".into()))?;

        let mut signing_certificates = Vec::new();
        for key_descriptor in idp.children_named(MD_NS, "KeyDescriptor") {
            // A descriptor without `use` is valid for both signing and encryption
            if key_descriptor.attribute("use").is_some_and(|u| u != "signing") {
                continue;
            }
            let certificates = key_descriptor
                .child(DSIG_NS, "KeyInfo")
                .into_iter()
                .flat_map(|info| info.children_named(DSIG_NS, "X509Data"))
                .flat_map(|data| data.children_named(DSIG_NS, "X509Certificate"));
            for certificate in certificates {
                signing_certificates.push(certificate_from_base64(&certificate.text())?);
            }
        }

        let sso_redirect_url = idp
            .children_named(MD_NS, "SingleSignOnService")
            .find(|sso| sso.attribute("Binding") == Some(HTTP_REDIRECT_BINDING))
            .and_then(|sso| sso.attribute("Location"))
            .map(str::to_string);

        Ok(Self {
            entity_id: entity.attribute("entityID").map(str::to_string),
            signing_certificates,
            sso_redirect_url,
        })
    }
}

/// Trust material for one validation.
#[derive(Debug, Clone)]
pub struct IdpTrust {
    pub certificates: Vec<X509>,
    /// Required assertion issuer, when known.
    pub expected_issuer: Option<String>,
}

/// Lazily loaded IdP metadata behind retry and a circuit breaker.
pub struct IdpMetadataStore {
    federation: Arc<FederationConfig>,
    http_client: reqwest::Client,
    retry: RetryConfig,
    circuit_breaker: CircuitBreaker,
    pinned_certificate: Option<X509>,
    cache: RwLock<Option<Arc<IdpMetadata>>>,
}

impl IdpMetadataStore {
    pub fn new(
        federation: Arc<FederationConfig>,
        resilience: &ResilienceConfig,
        clock: SharedClock,
    ) -> Result<Self, MetadataError> {
        let http_client = reqwest::Client::builder()
            .timeout(federation.timeout())
            .connect_timeout(federation.timeout())
            .build()?;
        Self::with_client(federation, resilience, clock, http_client)
    }

    /// Create a store with a custom HTTP client.
    pub fn with_client(
        federation: Arc<FederationConfig>,
        resilience: &ResilienceConfig,
        clock: SharedClock,
        http_client: reqwest::Client,
    ) -> Result<Self, MetadataError> {
        let pinned_certificate = federation
            .idp_certificate
            .as_deref()
            .map(|pem| {
                X509::from_pem(pem.as_bytes())
                    .map_err(|e| MetadataError::Certificate(e.to_string()))
            })
            .transpose()?;

        Ok(Self {
            federation,
            http_client,
            retry: resilience.retry.clone(),
            circuit_breaker: CircuitBreaker::new("idp_metadata", &resilience.circuit_breaker, clock),
            pinned_certificate,
            cache: RwLock::new(None),
        })
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    /// Metadata if it has already been loaded. Never touches the network.
    pub async fn cached(&self) -> Option<Arc<IdpMetadata>> {
        self.cache.read().await.clone()
    }

    /// Get the IdP metadata, fetching it on first use.
    pub async fn metadata(&self) -> Result<Arc<IdpMetadata>, MetadataError> {
        if let Some(cached) = self.cached().await {
            return Ok(cached);
        }

        let url = self.federation.metadata_url.as_str();
        debug!(url = %url, "Fetching IdP federation metadata");

        let document = with_circuit_breaker_and_retry(
            Some(&self.circuit_breaker),
            &self.retry,
            "idp_metadata",
            "fetch_metadata",
            MetadataError::is_retryable,
            || self.fetch_once(),
        )
        .await
        .map_err(|e| {
            let error = MetadataError::from(e);
            warn!(url = %url, error = %error, "IdP metadata unavailable");
            error
        })?;

        let metadata = Arc::new(IdpMetadata::parse(&document)?);

        let mut cache = self.cache.write().await;
        // First successful load wins; concurrent loaders reuse it
        let metadata = cache.get_or_insert(metadata).clone();
        info!(
            entity_id = metadata.entity_id.as_deref().unwrap_or("<none>"),
            signing_certificates = metadata.signing_certificates.len(),
            "Loaded IdP federation metadata"
        );
        Ok(metadata)
    }

    /// Certificates and expected issuer for validating a response.
    ///
    /// A pinned certificate is used as-is and the metadata endpoint is not
    /// contacted.
    pub async fn trust(&self) -> Result<IdpTrust, MetadataError> {
        if let Some(pinned) = &self.pinned_certificate {
            return Ok(IdpTrust {
                certificates: vec![pinned.clone()],
                expected_issuer: self.federation.idp_entity_id.clone(),
            });
        }

        let metadata = self.metadata().await?;
        if metadata.signing_certificates.is_empty() {
            return Err(MetadataError::Invalid(
                "metadata lists no signing certificate".into(),
            ));
        }
        Ok(IdpTrust {
            certificates: metadata.signing_certificates.clone(),
            expected_issuer: self
                .federation
                .idp_entity_id
                .clone()
                .or_else(|| metadata.entity_id.clone()),
        })
    }

    /// The IdP single sign-on endpoint for the HTTP-Redirect binding.
    pub async fn sso_url(&self) -> Result<String, MetadataError> {
        if let Some(url) = &self.federation.idp_sso_url {
            return Ok(url.clone());
        }

        let metadata = self.metadata().await?;
        Ok(metadata
            .sso_redirect_url
            .clone()
            .unwrap_or_else(|| derive_sso_url(&self.federation.metadata_url)))
    }

    async fn fetch_once(&self) -> Result<String, MetadataError> {
        let timeout = self.federation.timeout();
        let request = async {
            let response = self
                .http_client
                .get(&self.federation.metadata_url)
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, reqwest::Error>(response.text().await?)
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result.map_err(MetadataError::from),
            Err(_) => Err(MetadataError::Timeout(self.federation.timeout_ms)),
        }
    }
}

/// AD FS serves passive SSO at `/adfs/ls/` next to `/FederationMetadata/...`.
pub fn derive_sso_url(metadata_url: &str) -> String {
    let base = metadata_url
        .find("/FederationMetadata/")
        .map_or(metadata_url, |index| &metadata_url[..index]);
    format!("{}/adfs/ls/", base.trim_end_matches('/'))
}

fn certificate_from_base64(text: &str) -> Result<X509, MetadataError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let der = STANDARD
        .decode(compact)
        .map_err(|e| MetadataError::Certificate(e.to_string()))?;
    X509::from_der(&der).map_err(|e| MetadataError::Certificate(e.to_string()))
}

/// Generate SP metadata XML for IdP relying-party configuration.
///
/// Includes the SP entity ID, the ACS endpoint with the HTTP-POST binding,
/// the NameID format and, when configured, the SP signing certificate.
pub fn generate_sp_metadata(federation: &FederationConfig) -> String {
    let authn_requests_signed = if federation.sign_requests { "true" } else { "false" };
    let mut xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="{}" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">"#,
        quick_xml::escape::escape(federation.entity_id.as_str()),
        authn_requests_signed,
    );

    if let Some(sp_cert) = &federation.sp_certificate {
        xml.push_str(&format!(
            r#"
    <md:KeyDescriptor use="signing">
      <ds:KeyInfo xmlns:ds="http://www.w3.org/2000/09/xmldsig#">
        <ds:X509Data>
          <ds:X509Certificate>{}</ds:X509Certificate>
        </ds:X509Data>
      </ds:KeyInfo>
    </md:KeyDescriptor>"#,
            strip_pem_headers(sp_cert)
        ));
    }

    let name_id_format = federation
        .name_id_format
        .as_deref()
        .unwrap_or(DEFAULT_SP_NAME_ID_FORMAT);
    xml.push_str(&format!(
        r#"
    <md:NameIDFormat>{}</md:NameIDFormat>
    <md:AssertionConsumerService
        Binding="{}"
        Location="{}"
        index="0"
        isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
        quick_xml::escape::escape(name_id_format),
        HTTP_POST_BINDING,
        quick_xml::escape::escape(federation.acs_url.as_str()),
    ));

    xml
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use wiremock::{
        Mock, MockServer, Respond, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::{
        clock::ManualClock,
        config::CircuitBreakerConfig,
        saml::test_support::{IDP_ENTITY_ID, TestIdp, idp_metadata_xml},
    };

    const METADATA_PATH: &str = "/FederationMetadata/2007-06/FederationMetadata.xml";

    fn fast_resilience() -> ResilienceConfig {
        ResilienceConfig {
            retry: RetryConfig {
                enabled: true,
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            circuit_breaker: CircuitBreakerConfig {
                minimum_calls: 2,
                sliding_window_size: 4,
                ..Default::default()
            },
        }
    }

    fn unpinned_config(server: &MockServer) -> Arc<FederationConfig> {
        let mut config = TestIdp::generate().federation_config();
        config.metadata_url = format!("{}{METADATA_PATH}", server.uri());
        config.allow_http_metadata = true;
        config.idp_certificate = None;
        config.idp_entity_id = None;
        config.idp_sso_url = None;
        config.timeout_ms = 500;
        Arc::new(config)
    }

    fn store(config: Arc<FederationConfig>) -> IdpMetadataStore {
        IdpMetadataStore::new(
            config,
            &fast_resilience(),
            Arc::new(ManualClock::new(Utc::now())),
        )
        .unwrap()
    }

    struct CountingResponder {
        calls: Arc<AtomicU32>,
        response: ResponseTemplate,
    }

    impl Respond for CountingResponder {
        fn respond(&self, _: &wiremock::Request) -> ResponseTemplate {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.response.clone()
        }
    }

    #[test]
    fn test_parse_adfs_metadata() {
        let idp = TestIdp::generate();
        let metadata = IdpMetadata::parse(&idp_metadata_xml(
            &idp,
            Some("https://adfs.example.com/adfs/ls/"),
        ))
        .unwrap();

        assert_eq!(metadata.entity_id.as_deref(), Some(IDP_ENTITY_ID));
        assert_eq!(metadata.signing_certificates.len(), 1);
        assert_eq!(
            metadata.signing_certificates[0].to_der().unwrap(),
            idp.cert.to_der().unwrap()
        );
        assert_eq!(
            metadata.sso_redirect_url.as_deref(),
            Some("https://adfs.example.com/adfs/ls/")
        );
    }

    #[test]
    fn test_parse_rejects_non_metadata() {
        assert!(IdpMetadata::parse("<html><body>login</body></html>").is_err());
        assert!(IdpMetadata::parse("not xml").is_err());
    }

    #[test]
    fn test_derive_sso_url() {
        assert_eq!(
            derive_sso_url(
                "https://adfs.example.com/FederationMetadata/2007-06/FederationMetadata.xml"
            ),
            "https://adfs.example.com/adfs/ls/"
        );
        assert_eq!(
            derive_sso_url("https://adfs.example.com/"),
            "https://adfs.example.com/adfs/ls/"
        );
    }

    #[tokio::test]
    async fn test_fetches_once_and_caches() {
        let server = MockServer::start().await;
        let idp = TestIdp::generate();
        let calls = Arc::new(AtomicU32::new(0));
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(CountingResponder {
                calls: calls.clone(),
                response: ResponseTemplate::new(200).set_body_string(idp_metadata_xml(&idp, None)),
            })
            .mount(&server)
            .await;

        let store = store(unpinned_config(&server));
        assert!(store.cached().await.is_none());

        let trust = store.trust().await.unwrap();
        assert_eq!(trust.certificates.len(), 1);
        assert_eq!(trust.expected_issuer.as_deref(), Some(IDP_ENTITY_ID));

        // No Redirect endpoint in metadata: derived from the metadata URL
        let sso = store.sso_url().await.unwrap();
        assert_eq!(sso, format!("{}/adfs/ls/", server.uri()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let server = MockServer::start().await;
        let idp = TestIdp::generate();
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(idp_metadata_xml(&idp, None)))
            .mount(&server)
            .await;

        let store = store(unpinned_config(&server));
        store.metadata().await.unwrap();
        assert_eq!(store.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let server = MockServer::start().await;
        let idp = TestIdp::generate();
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(idp_metadata_xml(&idp, None)))
            .mount(&server)
            .await;

        let store = store(unpinned_config(&server));
        // 404 is not retried
        assert!(matches!(
            store.metadata().await,
            Err(MetadataError::Http(_))
        ));
        store.metadata().await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let store = store(unpinned_config(&server));
        let err = store.metadata().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_network() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicU32::new(0));
        Mock::given(method("GET"))
            .and(path(METADATA_PATH))
            .respond_with(CountingResponder {
                calls: calls.clone(),
                response: ResponseTemplate::new(500),
            })
            .mount(&server)
            .await;

        let store = store(unpinned_config(&server));
        assert!(store.metadata().await.is_err());
        assert!(store.metadata().await.is_err());
        assert_eq!(store.circuit_state(), CircuitState::Open);

        let before = calls.load(Ordering::SeqCst);
        assert!(matches!(
            store.metadata().await,
            Err(MetadataError::CircuitOpen(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_pinned_certificate_skips_metadata() {
        let server = MockServer::start().await;
        let idp = TestIdp::generate();
        let mut config = (*unpinned_config(&server)).clone();
        config.idp_certificate = Some(idp.cert_pem.clone());
        config.idp_entity_id = Some("urn:pinned".into());

        let store = store(Arc::new(config));
        let trust = store.trust().await.unwrap();
        assert_eq!(trust.certificates.len(), 1);
        assert_eq!(trust.expected_issuer.as_deref(), Some("urn:pinned"));
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_pinned_certificate_rejected() {
        let mut config = TestIdp::generate().federation_config();
        config.idp_certificate = Some("not a certificate".into());
        let result = IdpMetadataStore::new(
            Arc::new(config),
            &ResilienceConfig::default(),
            Arc::new(ManualClock::new(Utc::now())),
        );
        assert!(matches!(result, Err(MetadataError::Certificate(_))));
    }

    #[test]
    fn test_generate_sp_metadata_basic() {
        let config = TestIdp::generate().federation_config();
        let metadata = generate_sp_metadata(&config);

        assert!(metadata.contains("<md:EntityDescriptor"));
        assert!(metadata.contains(r#"entityID="https://auth.example.com/saml""#));
        assert!(metadata.contains(r#"Location="https://auth.example.com/auth/ad/acs""#));
        assert!(metadata.contains(HTTP_POST_BINDING));
        assert!(metadata.contains(DEFAULT_SP_NAME_ID_FORMAT));
        assert!(!metadata.contains("<md:KeyDescriptor"));
        xml::Document::parse(&metadata).unwrap();
    }

    #[test]
    fn test_generate_sp_metadata_with_certificate() {
        let idp = TestIdp::generate();
        let mut config = idp.federation_config();
        config.sp_certificate = Some(idp.cert_pem.clone());
        config.name_id_format =
            Some("urn:oasis:names:tc:SAML:2.0:nameid-format:persistent".to_string());

        let metadata = generate_sp_metadata(&config);

        assert!(metadata.contains(r#"<md:KeyDescriptor use="signing">"#));
        assert!(metadata.contains(&idp.cert_base64()));
        assert!(!metadata.contains("BEGIN CERTIFICATE"));
        assert!(metadata.contains("nameid-format:persistent"));
    }
}
