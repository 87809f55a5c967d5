//! AD group to application role mapping.
//!
//! [`compute`] is the pure policy evaluation. [`RoleMapper`] puts a cache in
//! front of it, keyed by the group *set* so the same groups in any order or
//! with repeats share one entry.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{
    cache::{Cache, CacheExt, CacheKeys},
    config::{MultiGroupStrategy, RoleMappingPolicy, RoleMappingRule},
};

/// Roles granted to a user. Never empty; falls back to the default role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMappingResult {
    pub roles: Vec<String>,
}

impl RoleMappingResult {
    fn default_role(policy: &RoleMappingPolicy) -> Self {
        Self {
            roles: vec![policy.default_role.clone()],
        }
    }
}

/// Evaluate `policy` against `groups`.
pub fn compute(policy: &RoleMappingPolicy, groups: &[String]) -> RoleMappingResult {
    if groups.is_empty() {
        debug!("No AD groups provided, using default role");
        return RoleMappingResult::default_role(policy);
    }
    if policy.rules.is_empty() {
        warn!("No role mapping rules configured, using default role");
        return RoleMappingResult::default_role(policy);
    }

    let roles = match policy.strategy {
        MultiGroupStrategy::HighestPriority => highest_priority(&policy.rules, groups),
        MultiGroupStrategy::Combine => combine(&policy.rules, groups),
        MultiGroupStrategy::FirstMatch => policy
            .rules
            .iter()
            .find(|rule| rule.matches(groups))
            .map(|rule| vec![rule.role.clone()])
            .unwrap_or_default(),
    };

    if roles.is_empty() {
        debug!("No matching AD groups found, using default role");
        return RoleMappingResult::default_role(policy);
    }
    RoleMappingResult { roles }
}

/// Lowest priority value wins; ties keep configured order. Rules without a
/// priority take no part.
fn highest_priority(rules: &[RoleMappingRule], groups: &[String]) -> Vec<String> {
    let mut prioritized: Vec<(i32, &RoleMappingRule)> = rules
        .iter()
        .filter_map(|rule| rule.priority.map(|priority| (priority, rule)))
        .collect();
    // Stable sort
    prioritized.sort_by_key(|(priority, _)| *priority);

    prioritized
        .into_iter()
        .find(|(_, rule)| rule.matches(groups))
        .map(|(priority, rule)| {
            debug!(ad_group = %rule.ad_group, role = %rule.role, priority, "Matched AD group");
            vec![rule.role.clone()]
        })
        .unwrap_or_default()
}

/// Every matching rule's role, in configured order, without repeats.
fn combine(rules: &[RoleMappingRule], groups: &[String]) -> Vec<String> {
    let mut roles: Vec<String> = Vec::new();
    for rule in rules.iter().filter(|rule| rule.matches(groups)) {
        if !roles.contains(&rule.role) {
            roles.push(rule.role.clone());
        }
    }
    roles
}

/// Cached role mapping.
pub struct RoleMapper {
    policy: Arc<RoleMappingPolicy>,
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl RoleMapper {
    pub fn new(policy: Arc<RoleMappingPolicy>, cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { policy, cache, ttl }
    }

    /// Map groups to roles. Never fails: cache problems are logged and the
    /// policy is evaluated directly.
    #[instrument(skip_all, fields(groups = groups.map_or(0, <[String]>::len)))]
    pub async fn map_roles(&self, groups: Option<&[String]>) -> RoleMappingResult {
        let groups = match groups {
            Some(groups) if !groups.is_empty() => groups,
            _ => return RoleMappingResult::default_role(&self.policy),
        };

        let key = CacheKeys::role_mapping(groups);
        match self.cache.get_json::<RoleMappingResult>(&key).await {
            Ok(Some(cached)) if !cached.roles.is_empty() => {
                debug!("Role mapping cache hit");
                return cached;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Role mapping cache read failed"),
        }

        let result = compute(&self.policy, groups);
        if let Err(e) = self.cache.set_json(&key, &result, self.ttl).await {
            warn!(error = %e, "Role mapping cache write failed");
        }
        result
    }
}
