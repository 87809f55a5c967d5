use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

pub struct CacheKeys;

impl CacheKeys {
    /// Role mapping result for a group set: adauth:roles:{set_hash}
    ///
    /// Sorting and de-duplicating before hashing makes the key a function of
    /// the set, so `[A, B]`, `[B, A]` and `[A, B, A]` share one entry.
    pub fn role_mapping<S: AsRef<str>>(groups: &[S]) -> String {
        format!("adauth:roles:{}", Self::group_set_hash(groups))
    }

    /// Consumed assertion marker for replay detection: adauth:assertion:{hash}
    ///
    /// The assertion ID is attacker-supplied, so it is hashed rather than
    /// embedded to keep keys bounded in size.
    pub fn consumed_assertion(assertion_id: &str, issuer: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(issuer.unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(assertion_id.as_bytes());
        format!("adauth:assertion:{}", hex::encode(hasher.finalize()))
    }

    fn group_set_hash<S: AsRef<str>>(groups: &[S]) -> String {
        let normalized: BTreeSet<&str> = groups.iter().map(AsRef::as_ref).collect();

        // Length-prefix each member so ["a,b"] and ["a", "b"] hash differently
        let mut hasher = Sha256::new();
        hasher.update((normalized.len() as u64).to_be_bytes());
        for group in normalized {
            hasher.update((group.len() as u64).to_be_bytes());
            hasher.update(group.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}
