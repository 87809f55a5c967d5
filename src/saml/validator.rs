//! POST-binding SAML response validation.
//!
//! A response passes through a fixed sequence of gates. The first gate that
//! rejects it decides the [`FailureReason`]; the internal detail is logged and
//! never returned to the caller.

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer, ser::SerializeStruct};
use tracing::{debug, info, instrument, warn};

use super::{
    BEARER_METHOD, SAML_NS, SAMLP_NS, STATUS_SUCCESS,
    attributes::{self, UserAttributes},
    metadata::{IdpMetadataStore, IdpTrust},
    signature::{self, SignatureError, VerifyOptions},
    xml::{Document, ElementRef},
};
use crate::{
    cache::{Cache, CacheKeys},
    clock::SharedClock,
    config::FederationConfig,
};

/// Why a response was rejected. Each variant has a stable machine code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    EmptyInput,
    MalformedResponse,
    IdpRejected,
    SignatureInvalid,
    IssuerMismatch,
    AssertionExpired,
    AudienceMismatch,
    ReplayDetected,
    MissingPrincipal,
    IdpUnavailable,
}

impl FailureReason {
    pub fn code(self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::MalformedResponse => "malformed_response",
            Self::IdpRejected => "idp_rejected",
            Self::SignatureInvalid => "signature_invalid",
            Self::IssuerMismatch => "issuer_mismatch",
            Self::AssertionExpired => "assertion_expired",
            Self::AudienceMismatch => "audience_mismatch",
            Self::ReplayDetected => "replay_detected",
            Self::MissingPrincipal => "missing_principal",
            Self::IdpUnavailable => "idp_unavailable",
        }
    }

    /// Caller-facing message. Safe to return; carries no detail.
    pub fn message(self) -> &'static str {
        match self {
            Self::EmptyInput => "empty/invalid encoding",
            Self::MalformedResponse => "malformed response",
            Self::IdpRejected => "authentication rejected by identity provider",
            Self::SignatureInvalid => "signature verification failed",
            Self::IssuerMismatch => "issuer mismatch",
            Self::AssertionExpired => "assertion expired or not yet valid",
            Self::AudienceMismatch => "audience/recipient mismatch",
            Self::ReplayDetected => "replay detected",
            Self::MissingPrincipal => "principal name missing",
            Self::IdpUnavailable => "identity provider unavailable",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A rejected response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationFailure {
    pub reason: FailureReason,
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason.message())
    }
}

impl std::error::Error for ValidationFailure {}

impl Serialize for ValidationFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ValidationFailure", 3)?;
        state.serialize_field("valid", &false)?;
        state.serialize_field("error", self.reason.message())?;
        state.serialize_field("code", self.reason.code())?;
        state.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Success(UserAttributes),
    Failure(ValidationFailure),
}

impl ValidationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure.reason),
        }
    }

    pub fn into_result(self) -> Result<UserAttributes, ValidationFailure> {
        match self {
            Self::Success(attributes) => Ok(attributes),
            Self::Failure(failure) => Err(failure),
        }
    }
}

/// Log `detail` and produce the generic failure for `reason`.
fn reject(reason: FailureReason, detail: impl fmt::Display) -> ValidationFailure {
    warn!(reason = %reason, detail = %detail, "SAML response rejected");
    ValidationFailure { reason }
}

/// Validates SAML responses posted to the ACS endpoint.
pub struct ResponseValidator {
    federation: Arc<FederationConfig>,
    metadata: Arc<IdpMetadataStore>,
    cache: Arc<dyn Cache>,
    clock: SharedClock,
}

impl ResponseValidator {
    pub fn new(
        federation: Arc<FederationConfig>,
        metadata: Arc<IdpMetadataStore>,
        cache: Arc<dyn Cache>,
        clock: SharedClock,
    ) -> Self {
        Self {
            federation,
            metadata,
            cache,
            clock,
        }
    }

    /// Validate a base64 `SAMLResponse` and extract the user's attributes.
    #[instrument(skip_all)]
    pub async fn validate(&self, response_b64: &str) -> ValidationOutcome {
        match self.run(response_b64).await {
            Ok(attributes) => {
                info!(
                    principal = %attributes.principal_name,
                    groups = attributes.groups.len(),
                    "SAML response accepted"
                );
                ValidationOutcome::Success(attributes)
            }
            Err(failure) => ValidationOutcome::Failure(failure),
        }
    }

    async fn run(&self, response_b64: &str) -> Result<UserAttributes, ValidationFailure> {
        let xml = decode(response_b64)?;
        let doc = Document::parse(&xml)
            .map_err(|e| reject(FailureReason::MalformedResponse, e))?;
        let response = doc.root();
        check_root(response)?;
        check_status(response)?;
        let assertion = locate_assertion(response)?;

        let trust = self.metadata.trust().await.map_err(|e| {
            reject(
                FailureReason::IdpUnavailable,
                format_args!("no IdP trust material: {e}"),
            )
        })?;
        let now = self.clock.now();

        self.check_signatures(response, assertion, &trust, now)?;
        let issuer = check_issuer(response, assertion, trust.expected_issuer.as_deref())?;
        let expires_at = self.check_validity_window(assertion, now)?;
        self.check_audience(response, assertion)?;
        self.consume(assertion, issuer.as_deref(), expires_at, now)
            .await?;

        attributes::extract(assertion, &self.federation.attributes)
            .map_err(|e| reject(FailureReason::MissingPrincipal, e))
    }

    /// Every signature present must verify, and at least one of them must
    /// cover the assertion (directly or through the enclosing response).
    fn check_signatures(
        &self,
        response: ElementRef<'_>,
        assertion: ElementRef<'_>,
        trust: &IdpTrust,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationFailure> {
        let options = VerifyOptions {
            allow_sha1: self.federation.allow_sha1,
            now,
        };
        let verify = |element: ElementRef<'_>, what: &str| {
            signature::verify_enveloped(element, &trust.certificates, options).map_err(|e| {
                reject(
                    FailureReason::SignatureInvalid,
                    format_args!("{what} signature: {e}"),
                )
            })
        };

        let mut verified = false;
        for (element, what) in [(response, "response"), (assertion, "assertion")] {
            match signature::signature_of(element) {
                Ok(_) => {
                    verify(element, what)?;
                    verified = true;
                }
                Err(SignatureError::Unsigned) => {}
                Err(e) => {
                    return Err(reject(
                        FailureReason::SignatureInvalid,
                        format_args!("{what} signature: {e}"),
                    ));
                }
            }
        }

        if !verified {
            return Err(reject(
                FailureReason::SignatureInvalid,
                "neither the response nor the assertion is signed",
            ));
        }
        debug!("SAML signature verified");
        Ok(())
    }

    /// Returns the latest `NotOnOrAfter` seen, which bounds how long the
    /// assertion ID must be remembered.
    fn check_validity_window(
        &self,
        assertion: ElementRef<'_>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ValidationFailure> {
        let skew = self.federation.clock_skew();
        let expired = |detail: String| reject(FailureReason::AssertionExpired, detail);

        let mut latest_expiry: Option<DateTime<Utc>> = None;

        if let Some(conditions) = assertion.child(SAML_NS, "Conditions") {
            if let Some(not_before) = instant(conditions, "NotBefore")?
                && not_before > now + skew
            {
                return Err(expired(format!("Conditions NotBefore {not_before} is in the future")));
            }
            if let Some(not_on_or_after) = instant(conditions, "NotOnOrAfter")? {
                if now - skew >= not_on_or_after {
                    return Err(expired(format!(
                        "Conditions NotOnOrAfter {not_on_or_after} has passed"
                    )));
                }
                latest_expiry = Some(not_on_or_after);
            }
        }

        let data = bearer_confirmation_data(assertion)
            .ok_or_else(|| expired("no bearer SubjectConfirmationData".to_string()))?;
        if let Some(not_before) = instant(data, "NotBefore")?
            && not_before > now + skew
        {
            return Err(expired(format!(
                "SubjectConfirmationData NotBefore {not_before} is in the future"
            )));
        }
        let confirmation_expiry = instant(data, "NotOnOrAfter")?.ok_or_else(|| {
            expired("bearer SubjectConfirmationData has no NotOnOrAfter".to_string())
        })?;
        if now - skew >= confirmation_expiry {
            return Err(expired(format!(
                "SubjectConfirmationData NotOnOrAfter {confirmation_expiry} has passed"
            )));
        }

        Ok(latest_expiry.map_or(confirmation_expiry, |e| e.max(confirmation_expiry)))
    }

    fn check_audience(
        &self,
        response: ElementRef<'_>,
        assertion: ElementRef<'_>,
    ) -> Result<(), ValidationFailure> {
        let mismatch = |detail: String| reject(FailureReason::AudienceMismatch, detail);
        let entity_id = self.federation.entity_id.as_str();
        let acs_url = self.federation.acs_url.as_str();

        let restrictions: Vec<ElementRef<'_>> = assertion
            .child(SAML_NS, "Conditions")
            .map(|c| c.children_named(SAML_NS, "AudienceRestriction").collect())
            .unwrap_or_default();
        if restrictions.is_empty() {
            return Err(mismatch("assertion has no AudienceRestriction".to_string()));
        }
        for restriction in restrictions {
            let allowed = restriction
                .children_named(SAML_NS, "Audience")
                .any(|audience| audience.text().trim() == entity_id);
            if !allowed {
                return Err(mismatch(format!("audience restriction excludes {entity_id}")));
            }
        }

        let recipient = bearer_confirmation_data(assertion).and_then(|d| d.attribute("Recipient"));
        if recipient != Some(acs_url) {
            return Err(mismatch(format!(
                "recipient {:?} is not {acs_url}",
                recipient.unwrap_or_default()
            )));
        }

        if let Some(destination) = response.attribute("Destination")
            && destination != acs_url
        {
            return Err(mismatch(format!("destination {destination} is not {acs_url}")));
        }
        Ok(())
    }

    /// Record the assertion ID until it expires. A second presentation, or a
    /// cache that cannot answer, is a replay.
    async fn consume(
        &self,
        assertion: ElementRef<'_>,
        issuer: Option<&str>,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationFailure> {
        let id = assertion
            .attribute("ID")
            .ok_or_else(|| reject(FailureReason::MalformedResponse, "assertion has no ID"))?;
        let key = CacheKeys::consumed_assertion(id, issuer);

        let remaining = (expires_at + self.federation.clock_skew() - now)
            .to_std()
            .unwrap_or_default();
        let ttl = remaining.max(Duration::from_secs(1));

        match self.cache.set_nx(&key, b"1", ttl).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(reject(
                FailureReason::ReplayDetected,
                format_args!("assertion {id} was already consumed"),
            )),
            Err(e) => Err(reject(
                FailureReason::ReplayDetected,
                format_args!("replay cache unavailable: {e}"),
            )),
        }
    }
}

fn decode(response_b64: &str) -> Result<String, ValidationFailure> {
    let compact: String = response_b64
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(reject(FailureReason::EmptyInput, "empty SAMLResponse"));
    }
    let bytes = STANDARD
        .decode(compact)
        .map_err(|e| reject(FailureReason::EmptyInput, e))?;
    String::from_utf8(bytes).map_err(|e| reject(FailureReason::MalformedResponse, e))
}

fn check_root(response: ElementRef<'_>) -> Result<(), ValidationFailure> {
    if !response.is(SAMLP_NS, "Response") {
        return Err(reject(
            FailureReason::MalformedResponse,
            format_args!(
                "root element is <{}>, not samlp:Response",
                response.local_name()
            ),
        ));
    }
    Ok(())
}

/// The one assertion, which must be a direct child of the response. Error
/// responses carry no assertion, so the status is checked first.
fn locate_assertion(response: ElementRef<'_>) -> Result<ElementRef<'_>, ValidationFailure> {
    let malformed = |detail: String| reject(FailureReason::MalformedResponse, detail);

    let descendants = response.descendants();
    let mut seen_ids = HashSet::new();
    for element in std::iter::once(response).chain(descendants.iter().copied()) {
        if let Some(id) = element.attribute("ID")
            && !seen_ids.insert(id)
        {
            return Err(malformed(format!("duplicate ID {id}")));
        }
    }

    if descendants
        .iter()
        .any(|element| element.is(SAML_NS, "EncryptedAssertion"))
    {
        return Err(malformed("encrypted assertions are not supported".to_string()));
    }

    let assertions: Vec<ElementRef<'_>> = descendants
        .into_iter()
        .filter(|element| element.is(SAML_NS, "Assertion"))
        .collect();
    let &[assertion] = assertions.as_slice() else {
        return Err(malformed(format!(
            "expected exactly one assertion, found {}",
            assertions.len()
        )));
    };
    if assertion.parent().map(ElementRef::node_id) != Some(response.node_id()) {
        return Err(malformed("assertion is not a child of the response".to_string()));
    }
    if assertion.attribute("ID").is_none() {
        return Err(malformed("assertion has no ID".to_string()));
    }
    Ok(assertion)
}

fn check_status(response: ElementRef<'_>) -> Result<(), ValidationFailure> {
    let status = response
        .child(SAMLP_NS, "Status")
        .and_then(|status| status.child(SAMLP_NS, "StatusCode"))
        .and_then(|code| code.attribute("Value"))
        .ok_or_else(|| reject(FailureReason::MalformedResponse, "response has no StatusCode"))?;
    if status != STATUS_SUCCESS {
        return Err(reject(
            FailureReason::IdpRejected,
            format_args!("status {status}"),
        ));
    }
    Ok(())
}

/// Returns the assertion issuer.
fn check_issuer(
    response: ElementRef<'_>,
    assertion: ElementRef<'_>,
    expected: Option<&str>,
) -> Result<Option<String>, ValidationFailure> {
    let issuer_of = |element: ElementRef<'_>| {
        element
            .child(SAML_NS, "Issuer")
            .map(|issuer| issuer.text().trim().to_string())
    };
    let assertion_issuer = issuer_of(assertion);

    let Some(expected) = expected else {
        return Ok(assertion_issuer);
    };
    if assertion_issuer.as_deref() != Some(expected) {
        return Err(reject(
            FailureReason::IssuerMismatch,
            format_args!("assertion issuer {assertion_issuer:?}, expected {expected}"),
        ));
    }
    if let Some(response_issuer) = issuer_of(response)
        && response_issuer != expected
    {
        return Err(reject(
            FailureReason::IssuerMismatch,
            format_args!("response issuer {response_issuer}, expected {expected}"),
        ));
    }
    Ok(assertion_issuer)
}

fn bearer_confirmation_data(assertion: ElementRef<'_>) -> Option<ElementRef<'_>> {
    assertion
        .child(SAML_NS, "Subject")?
        .children_named(SAML_NS, "SubjectConfirmation")
        .find(|confirmation| confirmation.attribute("Method") == Some(BEARER_METHOD))?
        .child(SAML_NS, "SubjectConfirmationData")
}

fn instant(
    element: ElementRef<'_>,
    name: &str,
) -> Result<Option<DateTime<Utc>>, ValidationFailure> {
    element
        .attribute(name)
        .map(|value| {
            DateTime::parse_from_rfc3339(value.trim())
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| {
                    reject(
                        FailureReason::MalformedResponse,
                        format_args!("{name} {value:?}: {e}"),
                    )
                })
        })
        .transpose()
}
