use serde::{Deserialize, Serialize};

use super::ConfigError;

/// How several matching rules are resolved into roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiGroupStrategy {
    /// Lowest `priority` value among the matching rules wins.
    #[default]
    HighestPriority,
    /// Every matching rule contributes its role.
    Combine,
    /// First matching rule in configured order wins.
    FirstMatch,
}

/// A single AD group to application role rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleMappingRule {
    /// Fragment matched as a substring of each group identifier, so both
    /// `Buerokratt-Admins` and `CN=Buerokratt-Admins` match the full DN.
    pub ad_group: String,

    /// Role granted when the rule matches.
    pub role: String,

    /// Lower value means higher precedence. Rules without a priority are
    /// ignored by the `highest_priority` strategy.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl RoleMappingRule {
    pub fn matches(&self, groups: &[String]) -> bool {
        groups.iter().any(|group| group.contains(self.ad_group.as_str()))
    }
}

/// Role mapping policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleMappingPolicy {
    /// Role returned when no groups are supplied or no rule matches.
    #[serde(default = "default_role")]
    pub default_role: String,

    #[serde(default, alias = "multi_group_strategy")]
    pub strategy: MultiGroupStrategy,

    /// Ordered rules. Order matters for `first_match` and breaks ties in
    /// `highest_priority`.
    #[serde(default)]
    pub rules: Vec<RoleMappingRule>,
}

impl Default for RoleMappingPolicy {
    fn default() -> Self {
        Self {
            default_role: default_role(),
            strategy: MultiGroupStrategy::default(),
            rules: Vec::new(),
        }
    }
}

impl RoleMappingPolicy {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.default_role.trim().is_empty() {
            return Err(ConfigError::Validation(
                "role_mapping.default_role must not be empty".into(),
            ));
        }

        for (index, rule) in self.rules.iter().enumerate() {
            // An empty pattern is a substring of every group and would match anything
            if rule.ad_group.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "role_mapping.rules[{index}].ad_group must not be empty"
                )));
            }
            if rule.role.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "role_mapping.rules[{index}].role must not be empty"
                )));
            }
        }

        if self.strategy == MultiGroupStrategy::HighestPriority {
            let unprioritized: Vec<&str> = self
                .rules
                .iter()
                .filter(|rule| rule.priority.is_none())
                .map(|rule| rule.ad_group.as_str())
                .collect();
            if !unprioritized.is_empty() {
                tracing::warn!(
                    rules = ?unprioritized,
                    "Rules without a priority are ignored by the highest_priority strategy"
                );
            }
        }

        Ok(())
    }
}

fn default_role() -> String {
    "ROLE_UNAUTHENTICATED".to_string()
}
