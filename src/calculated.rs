//! The calculated-groups registry.
//!
//! Turns each OU's rule directory into concrete [`Group`]s. Every lookup goes
//! through a [`RunContext`], which memoizes per `ou/cn` and detects cycles
//! between rule files that reference each other.

use std::collections::{BTreeMap, BTreeSet};
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, info};

use crate::config::{OuConfig, ReconcilerConfig};
use crate::context::{CacheSlot, EvalContext, FileScope, RunContext};
use crate::error::ReconcileError;
use crate::extensions::Extensions;
use crate::filters::{FilterDefinition, apply_filters};
use crate::loader::{RuleSource, SUPPORTED_EXTENSIONS, parse_rule_file};
use crate::modifiers::apply_modifiers;
use crate::rules::evaluate;
use crate::traits::PeopleSource;
use crate::types::{Group, Member, NO_MEMBERS_OK, PersonSet};

static CN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w-]+$").expect("valid regex"));

/// The people behind a calculated group's members.
pub fn people_of(group: &Group) -> PersonSet {
    group
        .members()
        .iter()
        .filter_map(|m| match m {
            Member::Person(p) => Some(p.clone()),
            Member::Id(_) => None,
        })
        .collect()
}

/// Computes groups from rule files.
///
/// A `Calculator` holds no per-run state and can be shared between runs; all
/// caches live in the [`RunContext`] passed to each call.
pub struct Calculator {
    config: Arc<ReconcilerConfig>,
    people: Arc<dyn PeopleSource>,
    source: Arc<dyn RuleSource>,
    extensions: Arc<Extensions>,
    filters: Vec<FilterDefinition>,
}

impl Calculator {
    pub fn new(
        config: ReconcilerConfig,
        people: Arc<dyn PeopleSource>,
        source: Arc<dyn RuleSource>,
        extensions: Extensions,
    ) -> Result<Self, ReconcileError> {
        config.validate()?;
        let mut filters = config
            .filters
            .iter()
            .map(|(name, filter)| FilterDefinition::from_config(name, filter))
            .collect::<Result<Vec<_>, _>>()?;
        for filter in extensions.filters() {
            filters.retain(|f| f.name != filter.name);
            filters.push(filter.clone());
        }
        Ok(Calculator {
            config: Arc::new(config),
            people,
            source,
            extensions: Arc::new(extensions),
            filters,
        })
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn people(&self) -> &dyn PeopleSource {
        self.people.as_ref()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Calculate every group in an OU, returning their dns.
    ///
    /// Memoized per OU for the run. A mirror OU copies its source instead.
    pub fn read_all(
        &self,
        run: &mut RunContext,
        ou_key: &str,
    ) -> Result<BTreeSet<String>, ReconcileError> {
        if let Some(dns) = run.ou_groups.get(ou_key) {
            return Ok(dns.clone());
        }
        let ou = self.config.ou(ou_key)?;
        if ou.mirror.is_some() {
            return self.read_mirror(run, ou_key);
        }

        let origin = ou.dir_for(ou_key).display().to_string();
        let cns: Vec<String> = self.listing(run, ou_key)?.keys().cloned().collect();
        let mut dns = BTreeSet::new();
        for cn in cns {
            let group = self.calculate_group(run, ou_key, &cn, &origin)?;
            dns.insert(group.dn().to_string());
            run.groups.insert(group.dn().to_string(), group);
        }
        info!(
            event = "Calculated",
            phase = "ReadAll",
            ou = ou_key,
            groups = dns.len()
        );
        run.ou_groups.insert(ou_key.to_string(), dns.clone());
        Ok(dns)
    }

    /// A group registered by an earlier [`Calculator::read_all`].
    pub fn read<'r>(&self, run: &'r RunContext, dn: &str) -> Result<&'r Group, ReconcileError> {
        run.groups.get(dn).ok_or_else(|| {
            ReconcileError::Internal(format!("group {dn} requested before its OU was read"))
        })
    }

    /// Copy the groups of `target`'s source OU under `target`'s base.
    ///
    /// The source OU must already have been read in this run.
    pub fn read_mirror(
        &self,
        run: &mut RunContext,
        target: &str,
    ) -> Result<BTreeSet<String>, ReconcileError> {
        if let Some(dns) = run.ou_groups.get(target) {
            return Ok(dns.clone());
        }
        let ou = self.config.ou(target)?;
        let Some(source) = &ou.mirror else {
            return Err(ReconcileError::Configuration(format!(
                "OU '{target}' is not a mirror"
            )));
        };
        let Some(source_dns) = run.ou_groups.get(source).cloned() else {
            return Err(ReconcileError::Internal(format!(
                "mirror OU '{target}' read before its source '{source}'"
            )));
        };

        let mut dns = BTreeSet::new();
        for source_dn in &source_dns {
            let copy = {
                let group = self.read(run, source_dn)?;
                group.copy_of(ou.dn_for(group.cn()))
            };
            dns.insert(copy.dn().to_string());
            run.groups.insert(copy.dn().to_string(), copy);
        }
        info!(
            event = "Calculated",
            phase = "Mirror",
            ou = target,
            source = source.as_str(),
            groups = dns.len()
        );
        run.ou_groups.insert(target.to_string(), dns.clone());
        Ok(dns)
    }

    /// The OU whose rule files define the groups of `ou_key`: the source for
    /// a mirror, otherwise the OU itself. `None` for an unknown OU.
    pub fn rules_ou<'a>(&'a self, ou_key: &'a str) -> Option<&'a str> {
        match self.config.groups.get(ou_key)? {
            OuConfig {
                mirror: Some(source),
                ..
            } => Some(source.as_str()),
            _ => Some(ou_key),
        }
    }

    /// Calculate one group by OU and cn, memoized for the run.
    ///
    /// `origin` names whoever asked, for error messages.
    pub fn calculate_group(
        &self,
        run: &mut RunContext,
        ou_key: &str,
        cn: &str,
        origin: &str,
    ) -> Result<Group, ReconcileError> {
        let unresolved = || ReconcileError::UnresolvedGroup {
            origin: origin.to_string(),
            reference: format!("{ou_key}/{cn}"),
        };
        let Some(ou_key) = self.rules_ou(ou_key) else {
            return Err(unresolved());
        };
        let key = format!("{ou_key}/{cn}");

        match run.rule_cache.get(&key) {
            Some(CacheSlot::InProgress) => {
                let chain = run
                    .dependency_stack
                    .iter()
                    .chain(iter::once(&key))
                    .join(" -> ");
                let err = ReconcileError::CircularDependency { chain };
                error!(event = "Calculated", phase = "Cycle", origin = origin, "{err}");
                return Err(err);
            }
            Some(CacheSlot::Done(group)) => {
                debug!(event = "Calculated", phase = "CacheHit", group = key);
                return Ok(group.clone());
            }
            None => {}
        }

        let Some(path) = self.listing(run, ou_key)?.get(cn).cloned() else {
            return Err(unresolved());
        };

        run.dependency_stack.push(key.clone());
        run.rule_cache.insert(key.clone(), CacheSlot::InProgress);
        let result = self.evaluate_file(run, ou_key, cn, &path);
        match run.dependency_stack.pop() {
            Some(popped) if popped == key => {}
            popped => {
                return Err(ReconcileError::Internal(format!(
                    "dependency stack out of order: expected {key}, found {popped:?}"
                )));
            }
        }

        match result {
            Ok(group) => {
                run.rule_cache
                    .insert(key.clone(), CacheSlot::Done(group.clone()));
                *run.evaluations.entry(key).or_insert(0) += 1;
                Ok(group)
            }
            Err(e) => {
                run.rule_cache.remove(&key);
                Err(e)
            }
        }
    }

    fn evaluate_file(
        &self,
        run: &mut RunContext,
        ou_key: &str,
        cn: &str,
        path: &Path,
    ) -> Result<Group, ReconcileError> {
        let ou = self.config.ou(ou_key)?;
        let text = self.source.read(path)?;
        let file = parse_rule_file(path, &text)?;

        let scope = FileScope {
            ou: ou_key.to_string(),
            cn: cn.to_string(),
            path: path.to_path_buf(),
            allowed_methods: ou.allowed_methods.as_ref().map(|methods| {
                methods
                    .iter()
                    .map(|m| self.extensions.canonical_method(m).to_string())
                    .collect()
            }),
        };
        let mut ctx = EvalContext {
            calculator: self,
            run,
            scope: &scope,
        };
        let members = evaluate(&file.rules, &mut ctx)?;
        let members = apply_filters(members, &file.filters, &self.filters, &mut ctx)?;
        let outcome = apply_modifiers(members, &file.modifiers, &mut ctx)?;

        let mut metadata = file.metadata;
        if outcome.permits_empty && outcome.members.is_empty() {
            metadata.insert(NO_MEMBERS_OK.to_string(), "true".to_string());
        }
        debug!(
            event = "Calculated",
            phase = "Evaluate",
            group = scope.key(),
            members = outcome.members.len()
        );
        Ok(Group::new(
            ou.dn_for(cn),
            file.description,
            outcome.members.into_iter().map(Member::from),
            metadata,
        ))
    }

    /// Rule files of an OU by cn, listed once per run.
    fn listing<'r>(
        &self,
        run: &'r mut RunContext,
        ou_key: &str,
    ) -> Result<&'r BTreeMap<String, PathBuf>, ReconcileError> {
        if !run.listings.contains_key(ou_key) {
            let listing = self.list_rule_files(ou_key)?;
            run.listings.insert(ou_key.to_string(), listing);
        }
        run.listings.get(ou_key).ok_or_else(|| {
            ReconcileError::Internal(format!("listing for OU '{ou_key}' vanished"))
        })
    }

    fn list_rule_files(&self, ou_key: &str) -> Result<BTreeMap<String, PathBuf>, ReconcileError> {
        let ou = self.config.ou(ou_key)?;
        let dir = ou.dir_for(ou_key);
        let allowed: Option<BTreeSet<String>> = ou.allowed_extensions.as_ref().map(|exts| {
            exts.iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        });

        let mut files = BTreeMap::new();
        for entry in self.source.list(&dir)? {
            if entry.is_dir || entry.name.starts_with('.') || ou.ignore.contains(&entry.name) {
                debug!(event = "Calculated", phase = "Skip", path = %entry.path.display());
                continue;
            }
            let origin = entry.path.display().to_string();
            let name = Path::new(&entry.name);
            let extension = name
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
                return Err(ReconcileError::rule(
                    origin,
                    format!("unsupported file extension '{extension}'"),
                ));
            }
            if let Some(allowed) = &allowed {
                if !allowed.contains(&extension) {
                    return Err(ReconcileError::rule(
                        origin,
                        format!("extension '{extension}' is not allowed in OU '{ou_key}'"),
                    ));
                }
            }
            let cn = name
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if !CN_PATTERN.is_match(&cn) {
                return Err(ReconcileError::InvalidName { origin, name: cn });
            }
            if let Some(previous) = files.insert(cn.clone(), entry.path.clone()) {
                return Err(ReconcileError::rule(
                    origin,
                    format!("duplicate group '{cn}', also defined in {}", previous.display()),
                ));
            }
        }
        Ok(files)
    }
}
