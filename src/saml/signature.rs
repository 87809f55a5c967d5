//! Enveloped XML-DSig verification.
//!
//! Only the shape AD FS produces is accepted: one `Signature` as a direct
//! child of the signed element, one `Reference` pointing at that element's
//! `ID`, the enveloped-signature and exclusive C14N transforms, and RSA
//! signatures. Keys come from the caller; `KeyInfo` in the document is never
//! trusted.

use std::cmp::Ordering;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use openssl::{
    asn1::Asn1Time,
    hash::{MessageDigest, hash},
    sign::Verifier,
    x509::X509,
};
use subtle::{Choice, ConstantTimeEq};
use thiserror::Error;
use tracing::debug;

use super::{
    DSIG_NS,
    xml::{ElementRef, NodeId},
};

pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("element is not signed")]
    Unsigned,

    #[error("element carries more than one signature")]
    MultipleSignatures,

    #[error("signature is missing <{0}>")]
    MissingElement(&'static str),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("reference URI '{found}' does not point at the signed element '#{expected}'")]
    ReferenceMismatch { expected: String, found: String },

    #[error("signed element has no ID")]
    MissingId,

    #[error("invalid base64 in {0}")]
    InvalidEncoding(&'static str),

    #[error("no trusted certificate is currently valid")]
    NoValidCertificate,

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("signature value does not verify against any trusted certificate")]
    BadSignature,

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

/// Policy knobs for [`verify_enveloped`].
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    pub allow_sha1: bool,
    /// Reference time for certificate validity.
    pub now: DateTime<Utc>,
}

/// The single `ds:Signature` child of `element`.
pub fn signature_of(element: ElementRef<'_>) -> Result<ElementRef<'_>, SignatureError> {
    let mut signatures = element.children_named(DSIG_NS, "Signature");
    let signature = signatures.next().ok_or(SignatureError::Unsigned)?;
    if signatures.next().is_some() {
        return Err(SignatureError::MultipleSignatures);
    }
    Ok(signature)
}

/// Verify the enveloped signature of `signed` against `certificates`.
pub fn verify_enveloped(
    signed: ElementRef<'_>,
    certificates: &[X509],
    options: VerifyOptions,
) -> Result<(), SignatureError> {
    let signature = signature_of(signed)?;
    let signed_info = signature
        .child(DSIG_NS, "SignedInfo")
        .ok_or(SignatureError::MissingElement("SignedInfo"))?;

    let c14n_method = signed_info
        .child(DSIG_NS, "CanonicalizationMethod")
        .ok_or(SignatureError::MissingElement("CanonicalizationMethod"))?;
    let c14n_algorithm = c14n_method.attribute("Algorithm").unwrap_or_default();
    if c14n_algorithm != EXC_C14N {
        return Err(SignatureError::UnsupportedAlgorithm(c14n_algorithm.to_string()));
    }
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    let signature_method = signed_info
        .child(DSIG_NS, "SignatureMethod")
        .and_then(|method| method.attribute("Algorithm"))
        .ok_or(SignatureError::MissingElement("SignatureMethod"))?;
    let signature_digest = signature_digest(signature_method, options.allow_sha1)?;

    let mut references = signed_info.children_named(DSIG_NS, "Reference");
    let reference = references
        .next()
        .ok_or(SignatureError::MissingElement("Reference"))?;
    if references.next().is_some() {
        return Err(SignatureError::UnsupportedAlgorithm(
            "multiple references".to_string(),
        ));
    }

    let id = signed.attribute("ID").ok_or(SignatureError::MissingId)?;
    let uri = reference.attribute("URI").unwrap_or_default();
    if uri.strip_prefix('#') != Some(id) {
        return Err(SignatureError::ReferenceMismatch {
            expected: id.to_string(),
            found: uri.to_string(),
        });
    }

    let (exclude, reference_prefixes) = apply_transforms(reference, signature.node_id())?;

    let digest_method = reference
        .child(DSIG_NS, "DigestMethod")
        .and_then(|method| method.attribute("Algorithm"))
        .ok_or(SignatureError::MissingElement("DigestMethod"))?;
    let reference_digest = digest_algorithm(digest_method, options.allow_sha1)?;

    let expected_digest = decode_base64(
        reference
            .child(DSIG_NS, "DigestValue")
            .ok_or(SignatureError::MissingElement("DigestValue"))?,
        "DigestValue",
    )?;
    let signature_value = decode_base64(
        signature
            .child(DSIG_NS, "SignatureValue")
            .ok_or(SignatureError::MissingElement("SignatureValue"))?,
        "SignatureValue",
    )?;

    let valid_certificates: Vec<&X509> = certificates
        .iter()
        .filter(|cert| certificate_is_current(cert, options.now))
        .collect();
    if valid_certificates.is_empty() {
        return Err(SignatureError::NoValidCertificate);
    }

    let canonical = signed.canonicalize(exclude, &reference_prefixes);
    let computed_digest = hash(reference_digest, canonical.as_bytes())?;
    let digest_ok: Choice = computed_digest[..].ct_eq(&expected_digest[..]);

    let canonical_signed_info = signed_info.canonicalize(None, &signed_info_prefixes);
    let signature_ok = valid_certificates.iter().any(|cert| {
        verify_with(cert, signature_digest, &canonical_signed_info, &signature_value)
    });

    // Both checks have run; combine without branching on either alone
    let verified: bool = (digest_ok & Choice::from(u8::from(signature_ok))).into();
    if verified {
        return Ok(());
    }
    if bool::from(digest_ok) {
        Err(SignatureError::BadSignature)
    } else {
        Err(SignatureError::DigestMismatch)
    }
}

/// Returns the subtree to exclude (enveloped transform) and the inclusive
/// namespace prefixes of the exclusive C14N transform.
fn apply_transforms(
    reference: ElementRef<'_>,
    signature_id: NodeId,
) -> Result<(Option<NodeId>, Vec<String>), SignatureError> {
    let transforms = reference
        .child(DSIG_NS, "Transforms")
        .ok_or(SignatureError::MissingElement("Transforms"))?;

    let mut enveloped = false;
    let mut exclusive = None;
    for transform in transforms.children_named(DSIG_NS, "Transform") {
        match transform.attribute("Algorithm").unwrap_or_default() {
            ENVELOPED_SIGNATURE => enveloped = true,
            EXC_C14N => exclusive = Some(inclusive_prefixes(transform)),
            other => return Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    if !enveloped {
        return Err(SignatureError::UnsupportedAlgorithm(
            "reference without enveloped-signature transform".to_string(),
        ));
    }
    let prefixes = exclusive.ok_or_else(|| {
        SignatureError::UnsupportedAlgorithm(
            "reference without exclusive canonicalization".to_string(),
        )
    })?;

    Ok((Some(signature_id), prefixes))
}

fn inclusive_prefixes(algorithm_element: ElementRef<'_>) -> Vec<String> {
    algorithm_element
        .children()
        .find(|child| child.is(EXC_C14N, "InclusiveNamespaces"))
        .and_then(|inclusive| inclusive.attribute("PrefixList"))
        .map(|list| list.split_ascii_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn digest_algorithm(uri: &str, allow_sha1: bool) -> Result<MessageDigest, SignatureError> {
    match uri {
        DIGEST_SHA256 => Ok(MessageDigest::sha256()),
        DIGEST_SHA512 => Ok(MessageDigest::sha512()),
        DIGEST_SHA1 if allow_sha1 => Ok(MessageDigest::sha1()),
        other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn signature_digest(uri: &str, allow_sha1: bool) -> Result<MessageDigest, SignatureError> {
    match uri {
        RSA_SHA256 => Ok(MessageDigest::sha256()),
        RSA_SHA512 => Ok(MessageDigest::sha512()),
        RSA_SHA1 if allow_sha1 => Ok(MessageDigest::sha1()),
        other => Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn decode_base64(element: ElementRef<'_>, what: &'static str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = element
        .text()
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .map_err(|_| SignatureError::InvalidEncoding(what))
}

fn verify_with(cert: &X509, digest: MessageDigest, data: &str, signature: &[u8]) -> bool {
    try_verify(cert, digest, data, signature).unwrap_or_else(|e| {
        debug!(error = %e, "Signature verification error");
        false
    })
}

fn try_verify(
    cert: &X509,
    digest: MessageDigest,
    data: &str,
    signature: &[u8],
) -> Result<bool, openssl::error::ErrorStack> {
    let key = cert.public_key()?;
    if key.rsa().is_err() {
        return Ok(false);
    }
    let mut verifier = Verifier::new(digest, &key)?;
    verifier.update(data.as_bytes())?;
    verifier.verify(signature)
}

/// Whether `now` falls within the certificate's validity window.
pub fn certificate_is_current(cert: &X509, now: DateTime<Utc>) -> bool {
    let Ok(now) = Asn1Time::from_unix(now.timestamp()) else {
        return false;
    };
    let started = matches!(
        cert.not_before().compare(&now),
        Ok(Ordering::Less | Ordering::Equal)
    );
    let not_expired = matches!(
        cert.not_after().compare(&now),
        Ok(Ordering::Greater | Ordering::Equal)
    );
    started && not_expired
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::saml::{
        SAML_NS,
        test_support::{ResponseBuilder, SignTarget, TestIdp},
        xml::Document,
    };

    fn options() -> VerifyOptions {
        VerifyOptions {
            allow_sha1: false,
            now: Utc::now(),
        }
    }

    fn assertion(doc: &Document) -> ElementRef<'_> {
        doc.root().child(SAML_NS, "Assertion").unwrap()
    }

    #[test]
    fn test_signed_assertion_verifies() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new().build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        verify_enveloped(assertion(&doc), &[idp.cert.clone()], options()).unwrap();
    }

    #[test]
    fn test_signed_response_verifies() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new()
            .sign(SignTarget::Response)
            .build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        verify_enveloped(doc.root(), &[idp.cert.clone()], options()).unwrap();
        assert!(matches!(
            verify_enveloped(assertion(&doc), &[idp.cert.clone()], options()),
            Err(SignatureError::Unsigned)
        ));
    }

    #[test]
    fn test_sha512_verifies() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new().sha512().build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        verify_enveloped(assertion(&doc), &[idp.cert.clone()], options()).unwrap();
    }

    #[test]
    fn test_tampered_content_fails_digest() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new()
            .build_xml(&idp)
            .replace("alice@example.com", "mallory@example.com");
        let doc = Document::parse(&xml).unwrap();

        assert!(matches!(
            verify_enveloped(assertion(&doc), &[idp.cert.clone()], options()),
            Err(SignatureError::DigestMismatch)
        ));
    }

    #[test]
    fn test_untrusted_key_fails_signature() {
        let idp = TestIdp::generate();
        let other = TestIdp::generate();
        let xml = ResponseBuilder::new().build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        assert!(matches!(
            verify_enveloped(assertion(&doc), &[other.cert.clone()], options()),
            Err(SignatureError::BadSignature)
        ));
    }

    #[test]
    fn test_any_trusted_certificate_may_verify() {
        let idp = TestIdp::generate();
        let rolled_over = TestIdp::generate();
        let xml = ResponseBuilder::new().build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        verify_enveloped(
            assertion(&doc),
            &[rolled_over.cert.clone(), idp.cert.clone()],
            options(),
        )
        .unwrap();
    }

    #[test]
    fn test_reference_must_point_at_signed_element() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new()
            .build_xml(&idp)
            .replace("URI=\"#_assertion-1\"", "URI=\"#_elsewhere\"");
        let doc = Document::parse(&xml).unwrap();

        assert!(matches!(
            verify_enveloped(assertion(&doc), &[idp.cert.clone()], options()),
            Err(SignatureError::ReferenceMismatch { .. })
        ));
    }

    #[test]
    fn test_sha1_rejected_unless_allowed() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new().sha1().build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        assert!(matches!(
            verify_enveloped(assertion(&doc), &[idp.cert.clone()], options()),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));

        let permissive = VerifyOptions {
            allow_sha1: true,
            ..options()
        };
        verify_enveloped(assertion(&doc), &[idp.cert.clone()], permissive).unwrap();
    }

    #[test]
    fn test_expired_certificate_rejected() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new().build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        let later = VerifyOptions {
            now: Utc::now() + Duration::days(400),
            ..options()
        };
        assert!(matches!(
            verify_enveloped(assertion(&doc), &[idp.cert.clone()], later),
            Err(SignatureError::NoValidCertificate)
        ));
    }

    #[test]
    fn test_unsigned_assertion_rejected() {
        let idp = TestIdp::generate();
        let xml = ResponseBuilder::new()
            .sign(SignTarget::Nothing)
            .build_xml(&idp);
        let doc = Document::parse(&xml).unwrap();

        assert!(matches!(
            verify_enveloped(assertion(&doc), &[idp.cert.clone()], options()),
            Err(SignatureError::Unsigned)
        ));
    }

    #[test]
    fn test_certificate_validity_window() {
        let idp = TestIdp::generate();
        assert!(certificate_is_current(&idp.cert, Utc::now()));
        assert!(!certificate_is_current(
            &idp.cert,
            Utc::now() - Duration::days(2)
        ));
    }
}
