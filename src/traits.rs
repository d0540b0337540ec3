use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::ReconcileError;
use crate::types::{Action, Group, Person};

/// Where people come from (an LDAP people OU, an HR export, ...).
pub trait PeopleSource: Send + Sync {
    /// Every person, keyed by uid.
    fn read_all(&self) -> Result<BTreeMap<String, Arc<Person>>, ReconcileError>;

    /// One person by uid, case-insensitively; `NotFound` when absent.
    fn read(&self, uid: &str) -> Result<Arc<Person>, ReconcileError>;
}

/// A directory backend holding groups (LDAP, GitHub teams, ...).
pub trait Provider: Send + Sync {
    /// DNs of every group currently under `base`.
    fn read_all(&self, base: &str) -> Result<BTreeSet<String>, ReconcileError>;

    fn read(&self, dn: &str) -> Result<Group, ReconcileError>;

    /// Create or replace a group. Returns whether anything was written.
    fn upsert(
        &self,
        group: &Group,
        overrides: &BTreeMap<String, String>,
    ) -> Result<bool, ReconcileError>;

    /// Delete a group. Returns whether it existed.
    fn delete(&self, dn: &str) -> Result<bool, ReconcileError>;

    fn exists(&self, dn: &str) -> Result<bool, ReconcileError>;

    /// Create an organizational unit; backends without OUs refuse.
    fn create_ou(&self, dn: &str) -> Result<bool, ReconcileError> {
        Err(ReconcileError::Provider(format!(
            "this backend cannot create OU {dn}"
        )))
    }
}

/// Records what a run did, whether or not it succeeded.
pub trait Auditor: Send + Sync {
    /// Called once before any change is applied. A failure aborts the run.
    fn setup(&self) -> Result<(), ReconcileError>;

    /// Called exactly once after the apply phase, even when it failed.
    fn commit(
        &self,
        actions: &[Action],
        successful_actions: &BTreeSet<String>,
        provider_error: Option<&ReconcileError>,
    ) -> Result<(), ReconcileError>;

    fn description(&self) -> String;
}
