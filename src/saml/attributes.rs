use serde::{Deserialize, Serialize};

use super::{SAML_NS, xml::ElementRef};
use crate::config::AttributeMapping;

/// Claims about the authenticated user, taken from a validated assertion.
///
/// Only ever constructed with a principal name; a missing principal is a
/// validation failure, never a half-filled value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAttributes {
    #[serde(rename = "upn")]
    pub principal_name: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Group identifiers (typically DNs) in the order the IdP sent them.
    #[serde(rename = "memberOf")]
    pub groups: Vec<String>,
}

/// The principal attribute was absent and no NameID fallback applied.
#[derive(Debug, thiserror::Error)]
#[error("principal name missing")]
pub struct MissingPrincipal;

/// Extract user attributes from an assertion using the configured names.
pub fn extract(
    assertion: ElementRef<'_>,
    mapping: &AttributeMapping,
) -> Result<UserAttributes, MissingPrincipal> {
    let statements: Vec<ElementRef<'_>> = assertion
        .children_named(SAML_NS, "AttributeStatement")
        .collect();

    let first = |name: &str| -> Option<String> {
        attribute_values(&statements, name).into_iter().next()
    };

    let principal_name = first(&mapping.principal)
        .or_else(|| {
            mapping
                .principal_from_name_id
                .then(|| name_id(assertion))
                .flatten()
        })
        .ok_or(MissingPrincipal)?;

    Ok(UserAttributes {
        principal_name,
        email: first(&mapping.email),
        display_name: first(&mapping.display_name),
        first_name: first(&mapping.first_name),
        last_name: first(&mapping.last_name),
        groups: attribute_values(&statements, &mapping.groups),
    })
}

/// Non-empty values of every attribute whose `Name` or `FriendlyName`
/// equals `name`, in document order.
fn attribute_values(statements: &[ElementRef<'_>], name: &str) -> Vec<String> {
    statements
        .iter()
        .flat_map(|statement| statement.children_named(SAML_NS, "Attribute"))
        .filter(|attribute| {
            attribute.attribute("Name") == Some(name)
                || attribute.attribute("FriendlyName") == Some(name)
        })
        .flat_map(|attribute| attribute.children_named(SAML_NS, "AttributeValue"))
        .map(|value| value.text().trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn name_id(assertion: ElementRef<'_>) -> Option<String> {
    let name_id = assertion
        .child(SAML_NS, "Subject")?
        .child(SAML_NS, "NameID")?
        .text();
    let name_id = name_id.trim();
    (!name_id.is_empty()).then(|| name_id.to_string())
}
