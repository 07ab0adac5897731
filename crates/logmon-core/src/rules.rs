//! Rule definitions
//!
//! A rule binds one regular expression to one log file path. Rules are
//! supplied by the configuration layer; the core only reads them. The
//! position of a rule in the supplied list is its registration order and
//! doubles as its match priority (first registered = 0 = highest).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::PatternError;

/// Stable rule identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(String);

impl RuleId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RuleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RuleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Cosmetic attributes; never consulted by matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleAppearance {
    /// Display color (free-form, e.g. "red" or "#ff0000")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Animation hint for the presentation layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub animation: Option<String>,
}

/// A user-defined regex bound to a log file path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier
    pub id: RuleId,
    /// Display name
    pub name: String,
    /// Regular expression source
    pub regex: String,
    /// Target log file
    pub path: PathBuf,
    /// Disabled rules never match
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub appearance: RuleAppearance,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Create an enabled rule without cosmetic attributes
    #[must_use]
    pub fn new(
        id: impl Into<RuleId>,
        name: impl Into<String>,
        regex: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            regex: regex.into(),
            path: path.into(),
            enabled: true,
            appearance: RuleAppearance::default(),
        }
    }

    /// Builder-style toggle used mostly by tests and the CLI
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Structural validation. Regex syntax is checked by the matcher, not here:
    /// a rule with a broken regex is still a valid rule that never matches.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(PatternError::InvalidRule("rule id cannot be empty".to_string()).into());
        }
        if self.regex.is_empty() {
            return Err(PatternError::InvalidRule(format!(
                "rule '{}' has an empty regex",
                self.id
            ))
            .into());
        }
        if self.path.as_os_str().is_empty() {
            return Err(PatternError::InvalidRule(format!(
                "rule '{}' has an empty path",
                self.id
            ))
            .into());
        }
        Ok(())
    }
}

/// A rule together with its registration-order priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundRule {
    pub rule: Rule,
    pub priority: u32,
}

/// Validate a whole rule list: structure plus unique ids.
pub fn validate_rules(rules: &[Rule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        rule.validate()?;
        if !seen.insert(rule.id.as_str()) {
            return Err(PatternError::InvalidRule(format!(
                "duplicate rule id '{}'",
                rule.id
            ))
            .into());
        }
    }
    Ok(())
}

/// Group enabled rules by target path, preserving registration order.
///
/// Paths with zero enabled rules do not appear in the result.
#[must_use]
pub fn group_enabled_by_path(rules: &[Rule]) -> BTreeMap<PathBuf, Arc<[BoundRule]>> {
    let mut grouped: BTreeMap<PathBuf, Vec<BoundRule>> = BTreeMap::new();
    for (index, rule) in rules.iter().enumerate() {
        if !rule.enabled {
            continue;
        }
        grouped
            .entry(rule.path.clone())
            .or_default()
            .push(BoundRule {
                rule: rule.clone(),
                priority: u32::try_from(index).unwrap_or(u32::MAX),
            });
    }
    grouped
        .into_iter()
        .map(|(path, bound)| (path, Arc::from(bound)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn rule(id: &str, path: &str) -> Rule {
        Rule::new(id, id.to_uppercase(), "ERROR", path)
    }

    #[test]
    fn grouping_skips_disabled_and_keeps_order() {
        let rules = vec![
            rule("a", "/var/log/x.log"),
            rule("b", "/var/log/y.log").with_enabled(false),
            rule("c", "/var/log/x.log"),
            rule("d", "/var/log/z.log"),
        ];
        let grouped = group_enabled_by_path(&rules);

        assert_eq!(grouped.len(), 2);
        let x = &grouped[Path::new("/var/log/x.log")];
        let ids: Vec<&str> = x.iter().map(|b| b.rule.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(x[0].priority, 0);
        assert_eq!(x[1].priority, 2);
        assert_eq!(grouped[Path::new("/var/log/z.log")][0].priority, 3);
        assert!(!grouped.contains_key(Path::new("/var/log/y.log")));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let rules = vec![rule("a", "/x"), rule("a", "/y")];
        let err = validate_rules(&rules).unwrap_err();
        assert!(err.to_string().contains("duplicate rule id 'a'"));
    }

    #[test]
    fn empty_fields_are_rejected() {
        assert!(Rule::new("", "n", "x", "/p").validate().is_err());
        assert!(Rule::new("id", "n", "", "/p").validate().is_err());
        assert!(Rule::new("id", "n", "x", "").validate().is_err());
        assert!(Rule::new("id", "n", "x", "/p").validate().is_ok());
    }

    #[test]
    fn rule_toml_defaults_enabled_and_flattens_appearance() {
        let rule: Rule = toml::from_str(
            r#"
id = "disk"
name = "Disk errors"
regex = "ERROR: (.*)"
path = "/var/log/syslog"
color = "red"
"#,
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.appearance.color.as_deref(), Some("red"));
        assert_eq!(rule.id, RuleId::from("disk"));
    }
}
