//! Shared fixtures for unit tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use crate::calculated::Calculator;
use crate::config::ReconcilerConfig;
use crate::context::{EvalContext, FileScope, RunContext};
use crate::error::ReconcileError;
use crate::extensions::Extensions;
use crate::loader::MemoryRuleSource;
use crate::memory::MemoryPeople;
use crate::rules::{Rule, evaluate};
use crate::types::{AttrValue, Person, PersonSet};

pub(crate) const CONFIG: &str = r#"
groups:
  teams:
    type: ldap
    base: ou=Teams,dc=example,dc=net
  mirror:
    type: github_team
    base: ou=Mirror,dc=example,dc=net
    mirror: teams
"#;

/// 2024-06-15 00:00:01 UTC.
pub(crate) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 1)
        .single()
        .unwrap_or_default()
}

pub(crate) fn run() -> RunContext {
    RunContext::new(now())
}

pub(crate) fn person(uid: &str, attrs: &[(&str, &str)]) -> Person {
    Person::new(
        uid,
        attrs
            .iter()
            .map(|(k, v)| (k.to_string(), AttrValue::String(v.to_string())))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// alice and bob are employees, carol is a contractor.
pub(crate) fn people() -> MemoryPeople {
    MemoryPeople::new([
        person("alice", &[("employment_type", "employee")]),
        person("bob", &[("employment_type", "employee")]),
        person("carol", &[("employment_type", "contractor")]),
    ])
}

pub(crate) struct Harness {
    pub source: Arc<MemoryRuleSource>,
    pub calculator: Calculator,
}

impl Harness {
    pub fn new(config: &str, files: &[(&str, &str)]) -> Self {
        Self::with_extensions(config, files, Extensions::builtin())
    }

    pub fn with_extensions(config: &str, files: &[(&str, &str)], extensions: Extensions) -> Self {
        let config = ReconcilerConfig::from_yaml_str(config).unwrap();
        let source = Arc::new(MemoryRuleSource::with_files(files.iter().copied()));
        let calculator =
            Calculator::new(config, Arc::new(people()), source.clone(), extensions).unwrap();
        Harness { source, calculator }
    }

    /// Evaluate a YAML rule tree as if it were `teams/probe.yaml`.
    pub fn evaluate(&self, run: &mut RunContext, rule: &str) -> Result<PersonSet, ReconcileError> {
        let value: serde_json::Value = serde_yaml::from_str(rule).unwrap();
        let rule = Rule::parse(&value, "teams/probe.yaml")?;
        let scope = FileScope {
            ou: "teams".into(),
            cn: "probe".into(),
            path: PathBuf::from("teams/probe.yaml"),
            allowed_methods: None,
        };
        let mut ctx = EvalContext {
            calculator: &self.calculator,
            run,
            scope: &scope,
        };
        evaluate(&rule, &mut ctx)
    }
}

/// Sorted uids of a person set.
pub(crate) fn uids(set: &PersonSet) -> Vec<String> {
    set.iter().map(|p| p.uid().to_string()).collect()
}
