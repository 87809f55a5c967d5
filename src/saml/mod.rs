//! SAML 2.0 service provider core.
//!
//! - [`authn_request`]: SP-initiated login (HTTP-Redirect binding)
//! - [`validator`]: POST-binding response validation
//! - [`attributes`]: claim extraction from a validated assertion
//! - [`metadata`]: IdP federation metadata and SP metadata
//! - [`signature`] / [`xml`]: enveloped XML-DSig over an owned XML tree

pub mod attributes;
pub mod authn_request;
pub mod metadata;
pub mod signature;
pub mod validator;
pub mod xml;

#[cfg(test)]
pub(crate) mod test_support;

pub use attributes::UserAttributes;
pub use authn_request::{AuthnRequestBuilder, LoginRedirect};
pub use metadata::{IdpMetadata, IdpMetadataStore, IdpTrust, MetadataError, generate_sp_metadata};
pub use validator::{FailureReason, ResponseValidator, ValidationFailure, ValidationOutcome};

pub const SAMLP_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const MD_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const BEARER_METHOD: &str = "urn:oasis:names:tc:SAML:2.0:cm:bearer";
pub const HTTP_REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
pub const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";

/// Strip PEM armour, leaving the base64 body on one line.
pub(crate) fn strip_pem_headers(pem: &str) -> String {
    pem.lines()
        .filter(|line| !line.starts_with("-----BEGIN") && !line.starts_with("-----END"))
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("")
}
