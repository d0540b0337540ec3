//! Per-run state.
//!
//! A [`RunContext`] lives for exactly one reconciliation run. It owns every
//! cache the calculation touches, so two runs never share state and tests get
//! a clean slate by constructing a new one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::calculated::Calculator;
use crate::error::ReconcileError;
use crate::rules::Matcher;
use crate::types::{Group, Person, PersonSet};

/// Rule cache slot for one `ou/cn`.
#[derive(Debug, Clone)]
pub(crate) enum CacheSlot {
    /// Being calculated right now; seeing this again means a cycle.
    InProgress,
    Done(Group),
}

/// Caches and bookkeeping for a single run.
#[derive(Debug)]
pub struct RunContext {
    now: DateTime<Utc>,
    pub(crate) rule_cache: HashMap<String, CacheSlot>,
    pub(crate) dependency_stack: Vec<String>,
    pub(crate) groups: BTreeMap<String, Group>,
    pub(crate) ou_groups: HashMap<String, BTreeSet<String>>,
    pub(crate) listings: HashMap<String, BTreeMap<String, PathBuf>>,
    pub(crate) all_people: Option<PersonSet>,
    pub(crate) evaluations: HashMap<String, usize>,
}

impl Default for RunContext {
    fn default() -> Self {
        RunContext::new(Utc::now())
    }
}

impl RunContext {
    /// A fresh context whose expiration checks use `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        RunContext {
            now,
            rule_cache: HashMap::new(),
            dependency_stack: Vec::new(),
            groups: BTreeMap::new(),
            ou_groups: HashMap::new(),
            listings: HashMap::new(),
            all_people: None,
            evaluations: HashMap::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True once `now` has reached 00:00 UTC on `date`.
    pub fn is_expired(&self, date: NaiveDate) -> bool {
        self.now.date_naive() >= date
    }

    /// How many times the rules of `ou/cn` were evaluated in this run.
    pub fn evaluation_count(&self, key: &str) -> usize {
        self.evaluations.get(key).copied().unwrap_or(0)
    }

    /// The chain of groups currently being calculated, outermost first.
    pub fn dependency_chain(&self) -> &[String] {
        &self.dependency_stack
    }

    /// Every calculated or mirrored group registered so far, by dn.
    pub fn groups(&self) -> &BTreeMap<String, Group> {
        &self.groups
    }
}

/// Identity of the rule file being evaluated.
#[derive(Debug, Clone)]
pub struct FileScope {
    pub ou: String,
    pub cn: String,
    pub path: PathBuf,
    /// Canonical predicate names allowed here; `None` allows all registered.
    pub allowed_methods: Option<BTreeSet<String>>,
}

impl FileScope {
    pub fn key(&self) -> String {
        format!("{}/{}", self.ou, self.cn)
    }

    pub fn origin(&self) -> String {
        self.path.display().to_string()
    }
}

/// What a matcher, filter or modifier sees while a file is evaluated.
pub struct EvalContext<'a> {
    pub calculator: &'a Calculator,
    pub run: &'a mut RunContext,
    pub scope: &'a FileScope,
}

impl EvalContext<'_> {
    pub fn origin(&self) -> String {
        self.scope.origin()
    }

    pub fn path(&self) -> &Path {
        &self.scope.path
    }

    /// Every known person, loaded once per run.
    pub fn all_people(&mut self) -> Result<PersonSet, ReconcileError> {
        if let Some(people) = &self.run.all_people {
            return Ok(people.clone());
        }
        let people: PersonSet = self
            .calculator
            .people()
            .read_all()?
            .into_values()
            .collect();
        self.run.all_people = Some(people.clone());
        Ok(people)
    }

    /// Look up one person by uid, case-insensitively.
    pub fn person(&self, uid: &str) -> Result<Arc<Person>, ReconcileError> {
        self.calculator.people().read(uid)
    }

    /// Whether a date-annotated condition or modifier has lapsed.
    pub fn is_expired(&self, date: NaiveDate) -> bool {
        !self.calculator.config().ignore_expirations && self.run.is_expired(date)
    }

    /// Resolve a predicate for this file, enforcing the allow-list.
    pub fn matcher(&self, method: &str) -> Result<Arc<dyn Matcher>, ReconcileError> {
        let extensions = self.calculator.extensions();
        let canonical = extensions.canonical_method(method);
        let Some(matcher) = extensions.matcher(canonical) else {
            return Err(ReconcileError::rule(
                self.origin(),
                format!("unknown method '{method}'"),
            ));
        };
        if let Some(allowed) = &self.scope.allowed_methods {
            if !allowed.contains(canonical) {
                return Err(ReconcileError::rule(
                    self.origin(),
                    format!("method '{method}' is not allowed in OU '{}'", self.scope.ou),
                ));
            }
        }
        Ok(matcher)
    }

    fn split_reference(&self, reference: &str) -> (String, String) {
        match reference.rsplit_once('/') {
            Some((ou, cn)) => (ou.to_string(), cn.to_string()),
            None => (self.scope.ou.clone(), reference.to_string()),
        }
    }

    /// The `ou/cn` cache key a group reference resolves to, with mirror OUs
    /// mapped onto their source.
    pub fn group_key(&self, reference: &str) -> String {
        let (ou, cn) = self.split_reference(reference);
        let ou = self.calculator.rules_ou(&ou).unwrap_or(&ou);
        format!("{ou}/{cn}")
    }

    /// Members of another calculated group, given as `ou/cn` or a bare `cn` in this OU.
    pub fn group_members(&mut self, reference: &str) -> Result<PersonSet, ReconcileError> {
        let (ou, cn) = self.split_reference(reference);
        let origin = self.origin();
        let group = self
            .calculator
            .calculate_group(self.run, &ou, &cn, &origin)?;
        Ok(crate::calculated::people_of(&group))
    }
}
