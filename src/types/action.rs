//! Pending changes against a directory backend.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FmtResult};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display as StrumDisplay, EnumString};

use crate::error::ReconcileError;

use super::group::Group;
use super::person::Person;

/// The kind of change an [`Action`] performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, AsRefStr, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Delete,
    Update,
}

/// One side of an action: what exists, or what should exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Entry {
    Group(Box<Group>),
    Person(Box<Person>),
    /// Present but not loaded, for providers that cannot say what is there.
    Unknown,
}

impl Entry {
    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Entry::Group(g) => Some(g),
            _ => None,
        }
    }
}

impl From<Group> for Entry {
    fn from(g: Group) -> Self {
        Entry::Group(Box::new(g))
    }
}

impl From<Person> for Entry {
    fn from(p: Person) -> Self {
        Entry::Person(Box::new(p))
    }
}

/// Member-level difference between the two sides of an update.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl MemberDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A single pending create, update or delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    dn: String,
    existing: Option<Entry>,
    updated: Option<Entry>,
    ou: String,
    implementation: Vec<serde_json::Value>,
}

impl Action {
    pub fn new<S: Into<String>, O: Into<String>>(
        dn: S,
        existing: Option<Entry>,
        updated: Option<Entry>,
        ou: O,
    ) -> Self {
        Action {
            dn: dn.into(),
            existing,
            updated,
            ou: ou.into(),
            implementation: Vec::new(),
        }
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn ou(&self) -> &str {
        &self.ou
    }

    pub fn existing(&self) -> Option<&Entry> {
        self.existing.as_ref()
    }

    pub fn updated(&self) -> Option<&Entry> {
        self.updated.as_ref()
    }

    pub fn change_type(&self) -> ChangeType {
        match (&self.existing, &self.updated) {
            (None, _) => ChangeType::Add,
            (_, None) => ChangeType::Delete,
            _ => ChangeType::Update,
        }
    }

    /// Provider-specific data for backends without a 1:1 dn mapping.
    pub fn implementation(&self) -> &[serde_json::Value] {
        &self.implementation
    }

    pub fn add_implementation(&mut self, data: serde_json::Value) {
        self.implementation.push(data);
    }

    /// Case-insensitive member diff between the existing and updated groups.
    ///
    /// Members listed in `ignore` (compared case-insensitively) are left out.
    pub fn member_diff(&self, ignore: &[&str]) -> Result<MemberDiff, ReconcileError> {
        let (Some(existing), Some(updated)) = (
            self.existing.as_ref().and_then(Entry::as_group),
            self.updated.as_ref().and_then(Entry::as_group),
        ) else {
            return Err(ReconcileError::Internal(format!(
                "member diff requested for {} which is not a group update",
                self.dn
            )));
        };

        let ignore: BTreeSet<String> = ignore.iter().map(|s| s.to_lowercase()).collect();
        let before = existing.raw_member_strings_insensitive();
        let after = updated.raw_member_strings_insensitive();

        Ok(MemberDiff {
            added: after
                .difference(before)
                .filter(|m| !ignore.contains(*m))
                .cloned()
                .collect(),
            removed: before
                .difference(after)
                .filter(|m| !ignore.contains(*m))
                .cloned()
                .collect(),
        })
    }

    /// A flat, serializable summary for auditors.
    pub fn record(&self, succeeded: bool) -> ActionRecord {
        let member_diff = match self.change_type() {
            ChangeType::Update => self.member_diff(&[]).ok(),
            _ => None,
        };
        ActionRecord {
            dn: self.dn.clone(),
            ou: self.ou.clone(),
            change_type: self.change_type(),
            succeeded,
            member_diff,
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} {} ({})", self.change_type(), self.dn, self.ou)
    }
}

/// Serializable summary of an [`Action`] and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRecord {
    pub dn: String,
    pub ou: String,
    pub change_type: ChangeType,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_diff: Option<MemberDiff>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Member;
    use std::collections::BTreeMap;
    use std::str::FromStr;
    use yare::parameterized;

    fn group(members: &[&str]) -> Entry {
        Group::new(
            "cn=x,ou=Groups",
            None,
            members.iter().map(|m| Member::from(*m)),
            BTreeMap::new(),
        )
        .into()
    }

    #[parameterized(
        add = { None, Some(group(&["a"])), ChangeType::Add },
        delete = { Some(group(&["a"])), None, ChangeType::Delete },
        update = { Some(group(&["a"])), Some(group(&["b"])), ChangeType::Update },
        unknown_existing = { Some(Entry::Unknown), Some(group(&["b"])), ChangeType::Update },
    )]
    fn test_change_type(existing: Option<Entry>, updated: Option<Entry>, expected: ChangeType) {
        let action = Action::new("cn=x,ou=Groups", existing, updated, "groups");
        assert_eq!(action.change_type(), expected);
    }

    #[test]
    fn test_change_type_strings() {
        assert_eq!(ChangeType::Add.to_string(), "add");
        assert_eq!(ChangeType::from_str("update").unwrap(), ChangeType::Update);
    }

    #[test]
    fn test_member_diff_ignores_case() {
        let action = Action::new(
            "cn=x,ou=Groups",
            Some(group(&["UID=Bob,ou=People", "alice"])),
            Some(group(&["uid=bob,ou=People", "carol"])),
            "groups",
        );
        let diff = action.member_diff(&[]).unwrap();
        assert_eq!(diff.added.iter().collect::<Vec<_>>(), vec!["carol"]);
        assert_eq!(diff.removed.iter().collect::<Vec<_>>(), vec!["alice"]);
    }

    #[test]
    fn test_member_diff_ignore_list() {
        let action = Action::new(
            "cn=x,ou=Groups",
            Some(group(&["alice", "svc-bot"])),
            Some(group(&["carol"])),
            "groups",
        );
        let diff = action.member_diff(&["SVC-BOT"]).unwrap();
        assert_eq!(diff.removed.iter().collect::<Vec<_>>(), vec!["alice"]);
        assert_eq!(diff.added.iter().collect::<Vec<_>>(), vec!["carol"]);
    }

    #[test]
    fn test_member_diff_requires_update() {
        let action = Action::new("cn=x,ou=Groups", None, Some(group(&["a"])), "groups");
        assert!(matches!(
            action.member_diff(&[]),
            Err(ReconcileError::Internal(_))
        ));
    }

    #[test]
    fn test_record() {
        let mut action = Action::new(
            "cn=x,ou=Groups",
            Some(group(&["alice"])),
            Some(group(&["bob"])),
            "groups",
        );
        action.add_implementation(serde_json::json!({"team_id": 42}));
        assert_eq!(action.implementation().len(), 1);
        insta::assert_json_snapshot!(action.record(true), @r#"
        {
          "dn": "cn=x,ou=Groups",
          "ou": "groups",
          "change_type": "update",
          "succeeded": true,
          "member_diff": {
            "added": [
              "bob"
            ],
            "removed": [
              "alice"
            ]
          }
        }
        "#);
    }

    #[test]
    fn test_display() {
        let action = Action::new("cn=x,ou=Groups", Some(group(&["a"])), None, "groups");
        assert_eq!(action.to_string(), "delete cn=x,ou=Groups (groups)");
    }
}
