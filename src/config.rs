//! Reconciler configuration.
//!
//! Loaded from YAML, e.g.:
//!
//! ```yaml
//! parallelism: 4
//! groups:
//!   teams:
//!     type: ldap
//!     base: ou=Teams,ou=Groups,dc=example,dc=net
//!   teams-mirror:
//!     type: ldap
//!     base: ou=Mirror,ou=Groups,dc=example,dc=net
//!     mirror: teams
//! filters:
//!   contractors:
//!     class: attribute
//!     attribute: employment_type
//!     value: contractor
//!     default: none
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;
use crate::filters::FilterSetting;

fn default_parallelism() -> usize {
    1
}

/// Top-level configuration for one reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    /// Worker pool size for prefetch and validate.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Treat every expiration date as not yet reached.
    #[serde(default)]
    pub ignore_expirations: bool,
    /// Group families keyed by OU key.
    #[serde(default)]
    pub groups: BTreeMap<String, OuConfig>,
    #[serde(default)]
    pub filters: BTreeMap<String, FilterConfig>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            parallelism: default_parallelism(),
            ignore_expirations: false,
            groups: BTreeMap::new(),
            filters: BTreeMap::new(),
        }
    }
}

/// Configuration of one group family (OU).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OuConfig {
    /// Backend type name, e.g. `ldap` or `github_team`.
    #[serde(rename = "type")]
    pub backend: String,
    /// DN suffix for groups in this OU.
    pub base: String,
    /// Rule directory, relative to the rule source root. Defaults to the OU key.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Copy the calculated groups of another OU instead of evaluating rules.
    #[serde(default)]
    pub mirror: Option<String>,
    /// Predicates allowed in this OU's rule files. Defaults to all registered.
    #[serde(default)]
    pub allowed_methods: Option<Vec<String>>,
    /// Rule file extensions allowed in this OU. Defaults to all supported.
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,
    /// File names in the rule directory to skip.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Create the base OU in the backend during pre-apply when it is missing.
    #[serde(default)]
    pub create_if_missing: bool,
}

impl OuConfig {
    pub fn new<B: Into<String>, S: Into<String>>(backend: B, base: S) -> Self {
        OuConfig {
            backend: backend.into(),
            base: base.into(),
            ..OuConfig::default()
        }
    }

    /// The rule directory for `key`.
    pub fn dir_for(&self, key: &str) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| PathBuf::from(key))
    }

    /// The DN a group called `cn` gets in this OU.
    pub fn dn_for(&self, cn: &str) -> String {
        format!("cn={},{}", cn, self.base)
    }
}

/// Kind of test a filter uses to decide who is in its domain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FilterClass {
    /// Members of a calculated group.
    MemberOfGroup,
    /// People whose attribute holds a value.
    Attribute,
}

/// Configuration of one named filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    pub class: FilterClass,
    /// `ou/cn` of the group for `member_of_group`.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    /// Setting used when a rule file does not mention this filter.
    #[serde(default)]
    pub default: FilterSetting,
    #[serde(default)]
    pub included_paths: Vec<String>,
    #[serde(default)]
    pub excluded_paths: Vec<String>,
}

impl ReconcilerConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ReconcileError> {
        let config: ReconcilerConfig = serde_yaml::from_str(text)
            .map_err(|e| ReconcileError::Configuration(format!("unable to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ReconcileError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReconcileError::Configuration(format!("unable to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn ou(&self, key: &str) -> Result<&OuConfig, ReconcileError> {
        self.groups
            .get(key)
            .ok_or_else(|| ReconcileError::Configuration(format!("OU '{key}' is not configured")))
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.parallelism == 0 {
            return Err(ReconcileError::Configuration(
                "parallelism must be at least 1".to_string(),
            ));
        }

        for (key, ou) in &self.groups {
            if ou.backend.trim().is_empty() {
                return Err(ReconcileError::Configuration(format!(
                    "OU '{key}' has no backend type"
                )));
            }
            if ou.base.trim().is_empty() {
                return Err(ReconcileError::Configuration(format!(
                    "OU '{key}' has an empty base"
                )));
            }
            let Some(source) = &ou.mirror else {
                continue;
            };
            if ou.dir.is_some() {
                return Err(ReconcileError::Configuration(format!(
                    "OU '{key}' mirrors '{source}' and cannot also set dir"
                )));
            }
            match self.groups.get(source) {
                None => {
                    return Err(ReconcileError::Configuration(format!(
                        "OU '{key}' mirrors unknown OU '{source}'"
                    )));
                }
                Some(src) if src.mirror.is_some() => {
                    return Err(ReconcileError::Configuration(format!(
                        "OU '{key}' mirrors '{source}', which is itself a mirror"
                    )));
                }
                Some(_) => {}
            }
        }

        for (name, filter) in &self.filters {
            match filter.class {
                FilterClass::MemberOfGroup => {
                    let Some(group) = &filter.group else {
                        return Err(ReconcileError::Configuration(format!(
                            "filter '{name}' needs a group"
                        )));
                    };
                    let Some((ou, _)) = group.rsplit_once('/') else {
                        return Err(ReconcileError::Configuration(format!(
                            "filter '{name}' group '{group}' must be written as ou/cn"
                        )));
                    };
                    if !self.groups.contains_key(ou) {
                        return Err(ReconcileError::Configuration(format!(
                            "filter '{name}' refers to unknown OU '{ou}'"
                        )));
                    }
                }
                FilterClass::Attribute => {
                    if filter.attribute.is_none() || filter.value.is_none() {
                        return Err(ReconcileError::Configuration(format!(
                            "filter '{name}' needs an attribute and a value"
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
