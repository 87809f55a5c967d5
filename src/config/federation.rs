use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use super::{ConfigError, default_true};

/// Upper bound for `clock_skew_secs`.
const MAX_CLOCK_SKEW_SECS: u64 = 600;

/// Trust relationship between this service provider and the identity provider.
///
/// Loaded once at startup and read-only afterwards. `entity_id`, `acs_url` and
/// `metadata_url` are required; the IdP signing certificate is either pinned
/// here (`idp_certificate` / `idp_certificate_path`) or taken from the
/// federation metadata published at `metadata_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FederationConfig {
    /// SP entity ID. Assertions must carry this value as their audience.
    pub entity_id: String,

    /// Assertion Consumer Service URL. Assertions must name it as recipient.
    pub acs_url: String,

    /// IdP federation metadata URL (AD FS publishes it under
    /// `/FederationMetadata/2007-06/FederationMetadata.xml`).
    pub metadata_url: String,

    /// Pinned IdP signing certificate (PEM). Takes precedence over metadata.
    #[serde(default)]
    pub idp_certificate: Option<String>,

    /// Path to a PEM file holding the pinned IdP signing certificate.
    /// Read at load time and folded into `idp_certificate`.
    #[serde(default)]
    pub idp_certificate_path: Option<PathBuf>,

    /// Expected assertion issuer. Falls back to the metadata `entityID`.
    #[serde(default)]
    pub idp_entity_id: Option<String>,

    /// IdP single sign-on endpoint. Falls back to the metadata
    /// `SingleSignOnService` with the HTTP-Redirect binding.
    #[serde(default)]
    pub idp_sso_url: Option<String>,

    /// Timeout for each call to the IdP, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Allowed clock difference when checking assertion validity windows.
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    /// Permit plain HTTP metadata URLs (local development and tests only).
    #[serde(default)]
    pub allow_http_metadata: bool,

    /// Accept SHA-1 digests and RSA-SHA1 signatures from older AD FS farms.
    #[serde(default)]
    pub allow_sha1: bool,

    /// SP certificate (PEM) advertised in SP metadata.
    #[serde(default)]
    pub sp_certificate: Option<String>,

    /// SP private key (PEM) used to sign AuthnRequests.
    #[serde(default)]
    pub sp_private_key: Option<String>,

    /// Sign outgoing AuthnRequests. Requires `sp_private_key`.
    #[serde(default)]
    pub sign_requests: bool,

    /// Ask the IdP to re-authenticate the user even with an existing session.
    #[serde(default)]
    pub force_authn: bool,

    /// NameID format to request.
    #[serde(default)]
    pub name_id_format: Option<String>,

    /// Which SAML attributes carry which user claims.
    #[serde(default)]
    pub attributes: AttributeMapping,
}

impl FederationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn clock_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.clock_skew_secs.min(MAX_CLOCK_SKEW_SECS) as i64)
    }

    pub(super) fn validate(&mut self) -> Result<(), ConfigError> {
        require_non_empty("federation.entity_id", &self.entity_id)?;
        require_non_empty("federation.acs_url", &self.acs_url)?;
        require_non_empty("federation.metadata_url", &self.metadata_url)?;

        url::Url::parse(&self.acs_url).map_err(|e| {
            ConfigError::Validation(format!("federation.acs_url is not a valid URL: {e}"))
        })?;

        let metadata_url = url::Url::parse(&self.metadata_url).map_err(|e| {
            ConfigError::Validation(format!("federation.metadata_url is not a valid URL: {e}"))
        })?;
        if metadata_url.scheme() != "https" && !self.allow_http_metadata {
            return Err(ConfigError::Validation(
                "federation.metadata_url must use https (set allow_http_metadata = true for local testing)"
                    .into(),
            ));
        }

        if let Some(sso_url) = &self.idp_sso_url {
            url::Url::parse(sso_url).map_err(|e| {
                ConfigError::Validation(format!("federation.idp_sso_url is not a valid URL: {e}"))
            })?;
        }

        match (&self.idp_certificate, &self.idp_certificate_path) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Validation(
                    "set only one of federation.idp_certificate and federation.idp_certificate_path"
                        .into(),
                ));
            }
            (None, Some(path)) => {
                let pem = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::Io(e, path.clone()))?;
                self.idp_certificate = Some(pem);
            }
            _ => {}
        }
        if let Some(pem) = &self.idp_certificate {
            require_non_empty("federation.idp_certificate", pem)?;
        }

        if self.sign_requests && self.sp_private_key.is_none() {
            return Err(ConfigError::Validation(
                "federation.sign_requests requires federation.sp_private_key".into(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "federation.timeout_ms must be greater than 0".into(),
            ));
        }

        if self.clock_skew_secs > MAX_CLOCK_SKEW_SECS {
            return Err(ConfigError::Validation(format!(
                "federation.clock_skew_secs must be at most {MAX_CLOCK_SKEW_SECS}"
            )));
        }

        self.attributes.validate()
    }
}

/// Attribute names (or friendly names) for each user claim.
///
/// IdPs differ in how they name claims, so the table is configuration. The
/// defaults are the claim types AD FS emits for the standard LDAP claim rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeMapping {
    #[serde(default = "default_principal_attribute")]
    pub principal: String,

    #[serde(default = "default_email_attribute")]
    pub email: String,

    #[serde(default = "default_display_name_attribute")]
    pub display_name: String,

    #[serde(default = "default_first_name_attribute")]
    pub first_name: String,

    #[serde(default = "default_last_name_attribute")]
    pub last_name: String,

    #[serde(default = "default_groups_attribute")]
    pub groups: String,

    /// Use the subject NameID when the principal attribute is absent.
    #[serde(default = "default_true")]
    pub principal_from_name_id: bool,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            principal: default_principal_attribute(),
            email: default_email_attribute(),
            display_name: default_display_name_attribute(),
            first_name: default_first_name_attribute(),
            last_name: default_last_name_attribute(),
            groups: default_groups_attribute(),
            principal_from_name_id: true,
        }
    }
}

impl AttributeMapping {
    fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("federation.attributes.principal", &self.principal)?;
        require_non_empty("federation.attributes.groups", &self.groups)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!(
            "{field} is required and must not be empty"
        )));
    }
    Ok(())
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_clock_skew_secs() -> u64 {
    60
}

fn default_principal_attribute() -> String {
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/upn".to_string()
}

fn default_email_attribute() -> String {
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress".to_string()
}

fn default_display_name_attribute() -> String {
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name".to_string()
}

fn default_first_name_attribute() -> String {
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname".to_string()
}

fn default_last_name_attribute() -> String {
    "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/surname".to_string()
}

fn default_groups_attribute() -> String {
    "http://schemas.xmlsoap.org/claims/Group".to_string()
}
