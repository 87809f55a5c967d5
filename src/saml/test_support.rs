//! Throwaway IdP for tests: generates a key pair and signs SAML responses.

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::{MessageDigest, hash},
    pkey::{PKey, Private},
    rsa::Rsa,
    sign::Signer,
    x509::{X509, X509Builder, X509NameBuilder},
};
use quick_xml::escape::escape;

use super::{
    DSIG_NS, SAML_NS, SAMLP_NS, STATUS_SUCCESS,
    signature::{ENVELOPED_SIGNATURE, EXC_C14N},
    strip_pem_headers,
    xml::{Document, ElementRef},
};
use crate::config::{
    AdAuthConfig, AttributeMapping, FederationConfig, MultiGroupStrategy, RoleMappingPolicy,
    RoleMappingRule,
};

pub(crate) const SP_ENTITY_ID: &str = "https://auth.example.com/saml";
pub(crate) const ACS_URL: &str = "https://auth.example.com/auth/ad/acs";
pub(crate) const IDP_ENTITY_ID: &str = "http://adfs.example.com/adfs/services/trust";
pub(crate) const METADATA_URL: &str =
    "https://adfs.example.com/FederationMetadata/2007-06/FederationMetadata.xml";

pub(crate) const ADMINS_DN: &str = "CN=Buerokratt-Admins,OU=Groups,DC=example,DC=com";
pub(crate) const ANALYSTS_DN: &str = "CN=Buerokratt-Analysts,OU=Groups,DC=example,DC=com";

const UPN_CLAIM: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/upn";
const EMAIL_CLAIM: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress";
const NAME_CLAIM: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name";
const GIVEN_NAME_CLAIM: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname";
const SURNAME_CLAIM: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/surname";
const GROUP_CLAIM: &str = "http://schemas.xmlsoap.org/claims/Group";

pub(crate) struct TestIdp {
    pub cert: X509,
    pub cert_pem: String,
    pub key: PKey<Private>,
}

impl TestIdp {
    /// Self-signed RSA 2048 certificate valid from now for a year.
    pub fn generate() -> Self {
        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "ADFS Signing - adfs.example.com")
            .unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let cert_pem = String::from_utf8(cert.to_pem().unwrap()).unwrap();
        Self {
            cert,
            cert_pem,
            key,
        }
    }

    /// Base64 DER, as it appears in metadata and KeyInfo.
    pub fn cert_base64(&self) -> String {
        strip_pem_headers(&self.cert_pem)
    }

    pub fn private_key_pem(&self) -> String {
        String::from_utf8(self.key.private_key_to_pem_pkcs8().unwrap()).unwrap()
    }

    /// Federation config that pins this IdP's certificate.
    pub fn federation_config(&self) -> FederationConfig {
        FederationConfig {
            entity_id: SP_ENTITY_ID.to_string(),
            acs_url: ACS_URL.to_string(),
            metadata_url: METADATA_URL.to_string(),
            idp_certificate: Some(self.cert_pem.clone()),
            idp_certificate_path: None,
            idp_entity_id: Some(IDP_ENTITY_ID.to_string()),
            idp_sso_url: Some("https://adfs.example.com/adfs/ls/".to_string()),
            timeout_ms: 5000,
            clock_skew_secs: 60,
            allow_http_metadata: false,
            allow_sha1: false,
            sp_certificate: None,
            sp_private_key: None,
            sign_requests: false,
            force_authn: false,
            name_id_format: None,
            attributes: AttributeMapping::default(),
        }
    }

    /// Full service config: pinned federation plus Admins (1) and Analysts (3).
    pub fn app_config(&self) -> AdAuthConfig {
        let rule = |ad_group: &str, role: &str, priority: i32| RoleMappingRule {
            ad_group: ad_group.into(),
            role: role.into(),
            priority: Some(priority),
        };
        AdAuthConfig {
            server: Default::default(),
            federation: self.federation_config(),
            role_mapping: RoleMappingPolicy {
                default_role: "ROLE_UNAUTHENTICATED".into(),
                strategy: MultiGroupStrategy::HighestPriority,
                rules: vec![
                    rule("CN=Buerokratt-Admins", "ROLE_ADMINISTRATOR", 1),
                    rule("CN=Buerokratt-Analysts", "ROLE_ANALYST", 3),
                ],
            },
            resilience: Default::default(),
            cache: Default::default(),
            observability: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignTarget {
    Assertion,
    Response,
    Nothing,
}

#[derive(Debug, Clone, Copy)]
enum Algorithms {
    Sha256,
    Sha512,
    Sha1,
}

impl Algorithms {
    fn digest(self) -> MessageDigest {
        match self {
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha512 => MessageDigest::sha512(),
            Self::Sha1 => MessageDigest::sha1(),
        }
    }

    fn digest_uri(self) -> &'static str {
        match self {
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            Self::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
        }
    }

    fn signature_uri(self) -> &'static str {
        match self {
            Self::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            Self::Sha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
        }
    }
}

/// Builds AD FS-shaped SAML responses.
#[derive(Debug, Clone)]
pub(crate) struct ResponseBuilder {
    now: DateTime<Utc>,
    response_id: String,
    assertion_id: String,
    issuer: String,
    destination: Option<String>,
    audience: String,
    recipient: String,
    status: String,
    not_before: Duration,
    not_on_or_after: Duration,
    confirmation_not_on_or_after: Option<Duration>,
    name_id: Option<String>,
    attributes: Vec<(String, Vec<String>)>,
    sign: SignTarget,
    algorithms: Algorithms,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self {
            now: Utc::now(),
            response_id: "_response-1".to_string(),
            assertion_id: "_assertion-1".to_string(),
            issuer: IDP_ENTITY_ID.to_string(),
            destination: Some(ACS_URL.to_string()),
            audience: SP_ENTITY_ID.to_string(),
            recipient: ACS_URL.to_string(),
            status: STATUS_SUCCESS.to_string(),
            not_before: Duration::minutes(-5),
            not_on_or_after: Duration::hours(1),
            confirmation_not_on_or_after: Some(Duration::minutes(5)),
            name_id: Some("alice@example.com".to_string()),
            attributes: vec![
                (UPN_CLAIM.to_string(), vec!["alice@example.com".to_string()]),
                (EMAIL_CLAIM.to_string(), vec!["alice@example.com".to_string()]),
                (NAME_CLAIM.to_string(), vec!["Alice Example".to_string()]),
                (GIVEN_NAME_CLAIM.to_string(), vec!["Alice".to_string()]),
                (SURNAME_CLAIM.to_string(), vec!["Example".to_string()]),
                (
                    GROUP_CLAIM.to_string(),
                    vec![ADMINS_DN.to_string(), ANALYSTS_DN.to_string()],
                ),
            ],
            sign: SignTarget::Assertion,
            algorithms: Algorithms::Sha256,
        }
    }

    /// Reference instant for every timestamp in the response.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn assertion_id(mut self, id: &str) -> Self {
        self.assertion_id = id.to_string();
        self
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.issuer = issuer.to_string();
        self
    }

    pub fn destination(mut self, destination: Option<&str>) -> Self {
        self.destination = destination.map(str::to_string);
        self
    }

    pub fn audience(mut self, audience: &str) -> Self {
        self.audience = audience.to_string();
        self
    }

    pub fn recipient(mut self, recipient: &str) -> Self {
        self.recipient = recipient.to_string();
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }

    /// `Conditions` window relative to `now`.
    pub fn conditions(mut self, not_before: Duration, not_on_or_after: Duration) -> Self {
        self.not_before = not_before;
        self.not_on_or_after = not_on_or_after;
        self
    }

    /// Bearer `SubjectConfirmationData@NotOnOrAfter` relative to `now`.
    pub fn confirmation_expiry(mut self, not_on_or_after: Option<Duration>) -> Self {
        self.confirmation_not_on_or_after = not_on_or_after;
        self
    }

    pub fn name_id(mut self, name_id: Option<&str>) -> Self {
        self.name_id = name_id.map(str::to_string);
        self
    }

    pub fn without_attribute(mut self, name: &str) -> Self {
        self.attributes.retain(|(attr, _)| attr != name);
        self
    }

    pub fn without_principal(self) -> Self {
        self.without_attribute(UPN_CLAIM)
    }

    pub fn groups(mut self, groups: &[&str]) -> Self {
        self.attributes.retain(|(attr, _)| attr != GROUP_CLAIM);
        self.attributes.push((
            GROUP_CLAIM.to_string(),
            groups.iter().map(|g| g.to_string()).collect(),
        ));
        self
    }

    pub fn sign(mut self, target: SignTarget) -> Self {
        self.sign = target;
        self
    }

    pub fn sha512(mut self) -> Self {
        self.algorithms = Algorithms::Sha512;
        self
    }

    pub fn sha1(mut self) -> Self {
        self.algorithms = Algorithms::Sha1;
        self
    }

    pub fn build_base64(&self, idp: &TestIdp) -> String {
        STANDARD.encode(self.build_xml(idp))
    }

    pub fn build_xml(&self, idp: &TestIdp) -> String {
        let unsigned_assertion = self.assertion_xml("");
        let unsigned_response = self.response_xml(&unsigned_assertion, "");

        match self.sign {
            SignTarget::Nothing => unsigned_response,
            SignTarget::Assertion => {
                let doc = Document::parse(&unsigned_response).unwrap();
                let assertion = doc.root().child(SAML_NS, "Assertion").unwrap();
                let signature = self.signature_xml(assertion, &self.assertion_id, idp);
                self.response_xml(&self.assertion_xml(&signature), "")
            }
            SignTarget::Response => {
                let doc = Document::parse(&unsigned_response).unwrap();
                let signature = self.signature_xml(doc.root(), &self.response_id, idp);
                self.response_xml(&unsigned_assertion, &signature)
            }
        }
    }

    fn timestamp(&self, offset: Duration) -> String {
        (self.now + offset).to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn response_xml(&self, assertion: &str, signature: &str) -> String {
        let destination = self
            .destination
            .as_deref()
            .map(|d| format!(r#" Destination="{}""#, escape(d)))
            .unwrap_or_default();
        format!(
            r#"<samlp:Response xmlns:samlp="{SAMLP_NS}" xmlns:saml="{SAML_NS}" ID="{id}" Version="2.0" IssueInstant="{instant}"{destination}><saml:Issuer>{issuer}</saml:Issuer>{signature}<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>{assertion}</samlp:Response>"#,
            id = self.response_id,
            instant = self.timestamp(Duration::zero()),
            issuer = escape(self.issuer.as_str()),
            status = escape(self.status.as_str()),
        )
    }

    fn assertion_xml(&self, signature: &str) -> String {
        let name_id = self
            .name_id
            .as_deref()
            .map(|n| {
                format!(
                    r#"<saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified">{}</saml:NameID>"#,
                    escape(n)
                )
            })
            .unwrap_or_default();
        let confirmation_expiry = self
            .confirmation_not_on_or_after
            .map(|offset| format!(r#" NotOnOrAfter="{}""#, self.timestamp(offset)))
            .unwrap_or_default();
        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, values)| {
                let values: String = values
                    .iter()
                    .map(|v| format!("<saml:AttributeValue>{}</saml:AttributeValue>", escape(v)))
                    .collect();
                format!(r#"<saml:Attribute Name="{}">{values}</saml:Attribute>"#, escape(name))
            })
            .collect();

        format!(
            r#"<saml:Assertion xmlns:saml="{SAML_NS}" ID="{id}" IssueInstant="{instant}" Version="2.0"><saml:Issuer>{issuer}</saml:Issuer>{signature}<saml:Subject>{name_id}<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer"><saml:SubjectConfirmationData{confirmation_expiry} Recipient="{recipient}"/></saml:SubjectConfirmation></saml:Subject><saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}"><saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction></saml:Conditions><saml:AttributeStatement>{attributes}</saml:AttributeStatement><saml:AuthnStatement AuthnInstant="{instant}"><saml:AuthnContext><saml:AuthnContextClassRef>urn:federation:authentication:windows</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement></saml:Assertion>"#,
            id = self.assertion_id,
            instant = self.timestamp(Duration::zero()),
            issuer = escape(self.issuer.as_str()),
            recipient = escape(self.recipient.as_str()),
            not_before = self.timestamp(self.not_before),
            not_on_or_after = self.timestamp(self.not_on_or_after),
            audience = escape(self.audience.as_str()),
        )
    }

    fn signature_xml(&self, element: ElementRef<'_>, id: &str, idp: &TestIdp) -> String {
        let canonical = element.canonicalize(None, &[]);
        let digest = hash(self.algorithms.digest(), canonical.as_bytes()).unwrap();

        let signed_info = format!(
            r##"<ds:SignedInfo xmlns:ds="{DSIG_NS}"><ds:CanonicalizationMethod Algorithm="{EXC_C14N}"/><ds:SignatureMethod Algorithm="{signature_uri}"/><ds:Reference URI="#{id}"><ds:Transforms><ds:Transform Algorithm="{ENVELOPED_SIGNATURE}"/><ds:Transform Algorithm="{EXC_C14N}"/></ds:Transforms><ds:DigestMethod Algorithm="{digest_uri}"/><ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>"##,
            signature_uri = self.algorithms.signature_uri(),
            digest_uri = self.algorithms.digest_uri(),
            digest = STANDARD.encode(&digest[..]),
        );

        let canonical_signed_info = Document::parse(&signed_info)
            .unwrap()
            .root()
            .canonicalize(None, &[]);
        let mut signer = Signer::new(self.algorithms.digest(), &idp.key).unwrap();
        signer.update(canonical_signed_info.as_bytes()).unwrap();
        let signature_value = STANDARD.encode(signer.sign_to_vec().unwrap());

        format!(
            r#"<ds:Signature xmlns:ds="{DSIG_NS}">{signed_info}<ds:SignatureValue>{signature_value}</ds:SignatureValue><ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo></ds:Signature>"#,
            cert = idp.cert_base64(),
        )
    }
}

/// AD FS-style federation metadata for `idp`.
pub(crate) fn idp_metadata_xml(idp: &TestIdp, sso_url: Option<&str>) -> String {
    let sso = sso_url
        .map(|url| {
            format!(
                r#"<SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect" Location="{url}"/><SingleSignOnService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{url}"/>"#
            )
        })
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<EntityDescriptor ID="_metadata" entityID="{IDP_ENTITY_ID}" xmlns="urn:oasis:names:tc:SAML:2.0:metadata">
  <RoleDescriptor xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:fed="http://docs.oasis-open.org/wsfed/federation/200706" xsi:type="fed:SecurityTokenServiceType" protocolSupportEnumeration="http://docs.oasis-open.org/wsfed/federation/200706">
    <KeyDescriptor use="signing"><KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#"><X509Data><X509Certificate>ROLE-DESCRIPTOR-ONLY</X509Certificate></X509Data></KeyInfo></KeyDescriptor>
  </RoleDescriptor>
  <IDPSSODescriptor protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <KeyDescriptor use="encryption"><KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#"><X509Data><X509Certificate>ENCRYPTION-ONLY</X509Certificate></X509Data></KeyInfo></KeyDescriptor>
    <KeyDescriptor use="signing"><KeyInfo xmlns="http://www.w3.org/2000/09/xmldsig#"><X509Data><X509Certificate>
{cert}
    </X509Certificate></X509Data></KeyInfo></KeyDescriptor>
    <NameIDFormat>urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress</NameIDFormat>
    {sso}
  </IDPSSODescriptor>
</EntityDescriptor>"#,
        cert = idp.cert_base64(),
    )
}
