//! Directory groups and their members.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

use super::person::Person;

/// Metadata key that lets a group legitimately have zero members.
pub const NO_MEMBERS_OK: &str = "no_members_ok";

/// One member of a group: a resolved person, or a bare identifier that
/// has not been (or cannot be) resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Member {
    Person(Arc<Person>),
    Id(String),
}

impl Member {
    /// The string used for comparisons against a directory: a person's uid, or the raw id.
    pub fn member_string(&self) -> &str {
        match self {
            Member::Person(p) => p.uid(),
            Member::Id(id) => id,
        }
    }
}

impl From<Arc<Person>> for Member {
    fn from(p: Arc<Person>) -> Self {
        Member::Person(p)
    }
}

impl From<&str> for Member {
    fn from(s: &str) -> Self {
        Member::Id(s.to_string())
    }
}

/// A directory group identified by its DN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    dn: String,
    description: Option<String>,
    members: Vec<Member>,
    metadata: BTreeMap<String, String>,
    #[serde(skip)]
    member_strings: OnceCell<BTreeSet<String>>,
    #[serde(skip)]
    member_strings_insensitive: OnceCell<BTreeSet<String>>,
}

impl Group {
    pub fn new<S: Into<String>>(
        dn: S,
        description: Option<String>,
        members: impl IntoIterator<Item = Member>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let mut group = Group {
            dn: dn.into(),
            description: description.filter(|d| !d.is_empty()),
            members: Vec::new(),
            metadata,
            member_strings: OnceCell::new(),
            member_strings_insensitive: OnceCell::new(),
        };
        for member in members {
            group.push_unique(member);
        }
        group
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// The value of the first DN component, e.g. `admins` for `cn=admins,ou=Groups,...`.
    pub fn cn(&self) -> &str {
        let first = self.dn.split(',').next().unwrap_or_default();
        match first.split_once('=') {
            Some((_, value)) => value.trim(),
            None => first.trim(),
        }
    }

    /// The description, falling back to the `cn` when none was given.
    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or_else(|| self.cn())
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    /// Whether metadata explicitly allows this group to be empty.
    pub fn no_members_ok(&self) -> bool {
        self.metadata
            .get(NO_MEMBERS_OK)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
            .unwrap_or(false)
    }

    /// Member strings, failing when the group is empty and metadata does not permit it.
    pub fn member_strings(&self) -> Result<&BTreeSet<String>, ReconcileError> {
        let strings = self.raw_member_strings();
        if strings.is_empty() && !self.no_members_ok() {
            return Err(ReconcileError::EmptyGroup(self.dn.clone()));
        }
        Ok(strings)
    }

    /// Lowercased member strings, failing like [`Group::member_strings`].
    pub fn member_strings_insensitive(&self) -> Result<&BTreeSet<String>, ReconcileError> {
        self.member_strings()?;
        Ok(self.raw_member_strings_insensitive())
    }

    pub(crate) fn raw_member_strings(&self) -> &BTreeSet<String> {
        self.member_strings.get_or_init(|| {
            self.members
                .iter()
                .map(|m| m.member_string().to_string())
                .collect()
        })
    }

    pub(crate) fn raw_member_strings_insensitive(&self) -> &BTreeSet<String> {
        self.member_strings_insensitive.get_or_init(|| {
            self.raw_member_strings()
                .iter()
                .map(|m| m.to_lowercase())
                .collect()
        })
    }

    /// Equality on dn, description and the case-sensitive member string set.
    pub fn equals(&self, other: &Group) -> bool {
        self.dn == other.dn
            && self.description() == other.description()
            && self.raw_member_strings() == other.raw_member_strings()
    }

    /// Add a member. Returns false if a member with the same string (ignoring case) exists.
    pub fn add_member(&mut self, member: Member) -> bool {
        let added = self.push_unique(member);
        if added {
            self.invalidate();
        }
        added
    }

    /// Remove a member by its member string, ignoring case.
    pub fn remove_member(&mut self, member_string: &str) -> bool {
        let before = self.members.len();
        self.members
            .retain(|m| !m.member_string().eq_ignore_ascii_case(member_string));
        let removed = self.members.len() != before;
        if removed {
            self.invalidate();
        }
        removed
    }

    /// Rewrite bare identifier members into the case used by `canonical`.
    ///
    /// Only members that differ from a canonical string by case are touched.
    pub fn update_case<'a>(&mut self, canonical: impl IntoIterator<Item = &'a str>) {
        let by_lower: HashMap<String, &str> = canonical
            .into_iter()
            .map(|s| (s.to_lowercase(), s))
            .collect();
        let mut changed = false;
        for member in self.members.iter_mut() {
            if let Member::Id(id) = member {
                if let Some(wanted) = by_lower.get(&id.to_lowercase()) {
                    if id != wanted {
                        *id = wanted.to_string();
                        changed = true;
                    }
                }
            }
        }
        if changed {
            self.invalidate();
        }
    }

    /// Clone this group under another DN.
    pub fn copy_of<S: Into<String>>(&self, dn: S) -> Group {
        Group::new(
            dn,
            self.description.clone(),
            self.members.clone(),
            self.metadata.clone(),
        )
    }

    fn push_unique(&mut self, member: Member) -> bool {
        let exists = self
            .members
            .iter()
            .any(|m| m.member_string().eq_ignore_ascii_case(member.member_string()));
        if !exists {
            self.members.push(member);
        }
        !exists
    }

    fn invalidate(&mut self) {
        self.member_strings.take();
        self.member_strings_insensitive.take();
    }
}

impl Display for Group {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.dn)
    }
}
