//! Post-evaluation filters.
//!
//! A filter has a domain (e.g. "contractors") and a per-file setting:
//! `all` keeps everyone, `none` removes everyone in the domain, and an
//! allow-list removes everyone in the domain who is not on the list.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{FilterClass, FilterConfig};
use crate::context::EvalContext;
use crate::error::ReconcileError;
use crate::types::PersonSet;

/// How a filter applies to one rule file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSetting", into = "RawSetting")]
pub enum FilterSetting {
    #[default]
    All,
    None,
    AllowList(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSetting {
    One(String),
    Many(Vec<String>),
}

impl TryFrom<RawSetting> for FilterSetting {
    type Error = String;

    fn try_from(raw: RawSetting) -> Result<Self, Self::Error> {
        match raw {
            RawSetting::One(s) if s.eq_ignore_ascii_case("all") => Ok(FilterSetting::All),
            RawSetting::One(s) if s.eq_ignore_ascii_case("none") => Ok(FilterSetting::None),
            RawSetting::One(s) if s.trim().is_empty() => Err("empty filter setting".to_string()),
            RawSetting::One(s) => Ok(FilterSetting::AllowList(
                s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect(),
            )),
            RawSetting::Many(xs) => Ok(FilterSetting::AllowList(xs)),
        }
    }
}

impl From<FilterSetting> for RawSetting {
    fn from(setting: FilterSetting) -> Self {
        match setting {
            FilterSetting::All => RawSetting::One("all".to_string()),
            FilterSetting::None => RawSetting::One("none".to_string()),
            FilterSetting::AllowList(xs) => RawSetting::Many(xs),
        }
    }
}

/// Decides which of a set of people fall within a filter's domain.
pub trait Filter: Send + Sync {
    fn select(
        &self,
        members: &PersonSet,
        ctx: &mut EvalContext<'_>,
    ) -> Result<PersonSet, ReconcileError>;
}

/// Domain: members of a calculated group.
#[derive(Debug, Clone)]
pub struct MemberOfGroupFilter {
    pub group: String,
}

impl Filter for MemberOfGroupFilter {
    fn select(
        &self,
        members: &PersonSet,
        ctx: &mut EvalContext<'_>,
    ) -> Result<PersonSet, ReconcileError> {
        // The group that defines the domain is not filtered by itself.
        if ctx.scope.key() == ctx.group_key(&self.group) {
            return Ok(PersonSet::new());
        }
        let domain = ctx.group_members(&self.group)?;
        Ok(members.intersection(&domain).cloned().collect())
    }
}

/// Domain: people whose attribute holds a value.
#[derive(Debug, Clone)]
pub struct AttributeFilter {
    pub attribute: String,
    pub value: String,
}

impl Filter for AttributeFilter {
    fn select(
        &self,
        members: &PersonSet,
        _ctx: &mut EvalContext<'_>,
    ) -> Result<PersonSet, ReconcileError> {
        Ok(members
            .iter()
            .filter(|p| {
                p.get(&self.attribute)
                    .map(|v| v.contains_insensitive(&self.value))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// A named filter with its default setting and path scoping.
#[derive(Clone)]
pub struct FilterDefinition {
    pub name: String,
    pub filter: Arc<dyn Filter>,
    pub default: FilterSetting,
    pub included_paths: Vec<String>,
    pub excluded_paths: Vec<String>,
}

impl FilterDefinition {
    pub fn new<S: Into<String>>(name: S, filter: Arc<dyn Filter>, default: FilterSetting) -> Self {
        FilterDefinition {
            name: name.into(),
            filter,
            default,
            included_paths: Vec::new(),
            excluded_paths: Vec::new(),
        }
    }

    /// Build a built-in filter from configuration.
    pub fn from_config(name: &str, config: &FilterConfig) -> Result<Self, ReconcileError> {
        let filter: Arc<dyn Filter> = match config.class {
            FilterClass::MemberOfGroup => Arc::new(MemberOfGroupFilter {
                group: config.group.clone().ok_or_else(|| {
                    ReconcileError::Configuration(format!("filter '{name}' needs a group"))
                })?,
            }),
            FilterClass::Attribute => match (&config.attribute, &config.value) {
                (Some(attribute), Some(value)) => Arc::new(AttributeFilter {
                    attribute: attribute.clone(),
                    value: value.clone(),
                }),
                _ => {
                    return Err(ReconcileError::Configuration(format!(
                        "filter '{name}' needs an attribute and a value"
                    )));
                }
            },
        };
        Ok(FilterDefinition {
            name: name.to_string(),
            filter,
            default: config.default.clone(),
            included_paths: config.included_paths.clone(),
            excluded_paths: config.excluded_paths.clone(),
        })
    }

    /// Whether this filter runs for the rule file at `path`.
    pub fn applies_to(&self, path: &str) -> bool {
        if self.excluded_paths.iter().any(|p| path.contains(p.as_str())) {
            return false;
        }
        if !self.included_paths.is_empty() {
            return self.included_paths.iter().any(|p| path.contains(p.as_str()));
        }
        true
    }
}

/// Apply every filter to a raw rule result.
///
/// `settings` holds the rule file's per-filter overrides; a name there that
/// is not a known filter is an error.
pub fn apply_filters(
    mut members: PersonSet,
    settings: &BTreeMap<String, FilterSetting>,
    definitions: &[FilterDefinition],
    ctx: &mut EvalContext<'_>,
) -> Result<PersonSet, ReconcileError> {
    for name in settings.keys() {
        if !definitions.iter().any(|d| &d.name == name) {
            return Err(ReconcileError::rule(
                ctx.origin(),
                format!("unknown filter '{name}'"),
            ));
        }
    }

    let path = ctx.origin();
    for definition in definitions {
        if !definition.applies_to(&path) {
            continue;
        }
        let setting = settings.get(&definition.name).unwrap_or(&definition.default);
        let removed: PersonSet = match setting {
            FilterSetting::All => continue,
            FilterSetting::None => definition.filter.select(&members, ctx)?,
            FilterSetting::AllowList(allowed) => {
                let allowed: BTreeSet<String> = allowed.iter().map(|a| a.to_lowercase()).collect();
                definition
                    .filter
                    .select(&members, ctx)?
                    .into_iter()
                    .filter(|p| !allowed.contains(&p.key()))
                    .collect()
            }
        };
        if !removed.is_empty() {
            debug!(
                event = "Rules",
                phase = "Filter",
                origin = path,
                filter = definition.name,
                removed = removed.len()
            );
            members.retain(|p| !removed.contains(p));
        }
    }
    Ok(members)
}
