//! Built-in auditors.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ReconcileError;
use crate::traits::Auditor;
use crate::types::{Action, ActionRecord};

/// What one run did, as written by [`JsonLinesAuditor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actions: Vec<ActionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
}

impl AuditRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        actions: &[Action],
        successful_actions: &BTreeSet<String>,
        provider_error: Option<&ReconcileError>,
    ) -> Self {
        AuditRecord {
            timestamp,
            actions: actions
                .iter()
                .map(|a| a.record(successful_actions.contains(a.dn())))
                .collect(),
            provider_error: provider_error.map(|e| e.to_string()),
        }
    }
}

/// Logs a one-line summary per run and one line per action.
#[derive(Debug, Default)]
pub struct LogAuditor;

impl Auditor for LogAuditor {
    fn setup(&self) -> Result<(), ReconcileError> {
        Ok(())
    }

    fn commit(
        &self,
        actions: &[Action],
        successful_actions: &BTreeSet<String>,
        provider_error: Option<&ReconcileError>,
    ) -> Result<(), ReconcileError> {
        for action in actions {
            info!(
                event = "Audit",
                phase = "Action",
                action = %action,
                succeeded = successful_actions.contains(action.dn())
            );
        }
        match provider_error {
            Some(err) => warn!(
                event = "Audit",
                phase = "Commit",
                actions = actions.len(),
                applied = successful_actions.len(),
                error = %err,
                "run failed"
            ),
            None => info!(
                event = "Audit",
                phase = "Commit",
                actions = actions.len(),
                applied = successful_actions.len()
            ),
        }
        Ok(())
    }

    fn description(&self) -> String {
        "log".to_string()
    }
}

/// Appends one JSON [`AuditRecord`] per run to a file.
#[derive(Debug, Clone)]
pub struct JsonLinesAuditor {
    path: PathBuf,
}

impl JsonLinesAuditor {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        JsonLinesAuditor { path: path.into() }
    }

    fn open(&self) -> Result<std::fs::File, ReconcileError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ReconcileError::Audit(format!("{}: {e}", self.path.display())))
    }
}

impl Auditor for JsonLinesAuditor {
    fn setup(&self) -> Result<(), ReconcileError> {
        self.open().map(|_| ())
    }

    fn commit(
        &self,
        actions: &[Action],
        successful_actions: &BTreeSet<String>,
        provider_error: Option<&ReconcileError>,
    ) -> Result<(), ReconcileError> {
        let record = AuditRecord::new(Utc::now(), actions, successful_actions, provider_error);
        let mut line = serde_json::to_string(&record)
            .map_err(|e| ReconcileError::Audit(format!("unable to encode audit record: {e}")))?;
        line.push('\n');
        self.open()?
            .write_all(line.as_bytes())
            .map_err(|e| ReconcileError::Audit(format!("{}: {e}", self.path.display())))
    }

    fn description(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entry, Group, Member};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn actions() -> Vec<Action> {
        let group = Group::new(
            "cn=a,ou=Teams",
            None,
            [Member::from("alice")],
            BTreeMap::new(),
        );
        vec![
            Action::new("cn=a,ou=Teams", None, Some(Entry::from(group.clone())), "teams"),
            Action::new("cn=b,ou=Teams", Some(Entry::from(group)), None, "teams"),
        ]
    }

    #[test]
    fn test_record_marks_successes() {
        let ts = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let successful = BTreeSet::from(["cn=a,ou=Teams".to_string()]);
        let err = ReconcileError::Provider("ldap down".into());
        let record = AuditRecord::new(ts, &actions(), &successful, Some(&err));
        insta::assert_json_snapshot!(record, @r#"
        {
          "timestamp": "2024-06-15T12:00:00Z",
          "actions": [
            {
              "dn": "cn=a,ou=Teams",
              "ou": "teams",
              "change_type": "add",
              "succeeded": true
            },
            {
              "dn": "cn=b,ou=Teams",
              "ou": "teams",
              "change_type": "delete",
              "succeeded": false
            }
          ],
          "provider_error": "provider error: ldap down"
        }
        "#);
    }

    #[test]
    fn test_json_lines_appends_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let auditor = JsonLinesAuditor::new(&path);
        auditor.setup().unwrap();
        let successful = BTreeSet::new();
        auditor.commit(&actions(), &successful, None).unwrap();
        auditor.commit(&[], &successful, None).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let records: Vec<AuditRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].actions.len(), 2);
        assert!(records[0].actions.iter().all(|a| !a.succeeded));
        assert!(records[1].actions.is_empty());
        assert!(auditor.description().starts_with("jsonl:"));
    }

    #[test]
    fn test_setup_fails_for_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let auditor = JsonLinesAuditor::new(dir.path().join("missing").join("audit.jsonl"));
        assert!(matches!(auditor.setup(), Err(ReconcileError::Audit(_))));
    }

    #[test]
    fn test_log_auditor_never_fails() {
        let err = ReconcileError::Provider("boom".into());
        assert!(
            LogAuditor
                .commit(&actions(), &BTreeSet::new(), Some(&err))
                .is_ok()
        );
        assert_eq!(LogAuditor.description(), "log");
    }
}
