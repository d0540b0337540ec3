//! In-memory people source and provider.
//!
//! Useful as a dry-run backend and for exercising the reconciler without a
//! real directory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::ReconcileError;
use crate::traits::{PeopleSource, Provider};
use crate::types::{Group, Person};

/// People held in memory, looked up case-insensitively.
#[derive(Debug, Default)]
pub struct MemoryPeople {
    people: BTreeMap<String, Arc<Person>>,
}

impl MemoryPeople {
    pub fn new(people: impl IntoIterator<Item = Person>) -> Self {
        MemoryPeople {
            people: people
                .into_iter()
                .map(|p| (p.key(), Arc::new(p)))
                .collect(),
        }
    }

    /// People with no attributes, by uid.
    pub fn from_uids<'a>(uids: impl IntoIterator<Item = &'a str>) -> Self {
        Self::new(uids.into_iter().map(Person::with_uid))
    }
}

impl PeopleSource for MemoryPeople {
    fn read_all(&self) -> Result<BTreeMap<String, Arc<Person>>, ReconcileError> {
        Ok(self
            .people
            .values()
            .map(|p| (p.uid().to_string(), p.clone()))
            .collect())
    }

    fn read(&self, uid: &str) -> Result<Arc<Person>, ReconcileError> {
        self.people
            .get(&uid.to_lowercase())
            .cloned()
            .ok_or_else(|| ReconcileError::NotFound(format!("person '{uid}'")))
    }
}

/// A directory kept in memory.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    groups: RwLock<BTreeMap<String, Group>>,
    ous: RwLock<BTreeSet<String>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_groups(groups: impl IntoIterator<Item = Group>) -> Self {
        let provider = Self::new();
        if let Ok(mut map) = provider.groups.write() {
            for group in groups {
                map.insert(group.dn().to_string(), group);
            }
        }
        provider
    }

    /// Register an OU so that `exists` reports it.
    pub fn with_ou(self, dn: &str) -> Self {
        if let Ok(mut ous) = self.ous.write() {
            ous.insert(dn.to_lowercase());
        }
        self
    }

    /// A snapshot of every group, by dn.
    pub fn groups(&self) -> Result<BTreeMap<String, Group>, ReconcileError> {
        Ok(self.groups.read()?.clone())
    }
}

fn under_base(dn: &str, base: &str) -> bool {
    let dn = dn.to_lowercase();
    let suffix = format!(",{}", base.to_lowercase());
    dn.ends_with(&suffix)
}

impl Provider for MemoryProvider {
    fn read_all(&self, base: &str) -> Result<BTreeSet<String>, ReconcileError> {
        Ok(self
            .groups
            .read()?
            .keys()
            .filter(|dn| under_base(dn, base))
            .cloned()
            .collect())
    }

    fn read(&self, dn: &str) -> Result<Group, ReconcileError> {
        self.groups
            .read()?
            .get(dn)
            .cloned()
            .ok_or_else(|| ReconcileError::NotFound(format!("group '{dn}'")))
    }

    fn upsert(
        &self,
        group: &Group,
        overrides: &BTreeMap<String, String>,
    ) -> Result<bool, ReconcileError> {
        let mut group = group.clone();
        for (key, value) in overrides {
            group.set_metadata(key, value);
        }
        let mut groups = self.groups.write()?;
        if let Some(existing) = groups.get(group.dn()) {
            if existing.equals(&group) && existing.metadata() == group.metadata() {
                debug!(event = "Provider", phase = "Upsert", dn = group.dn(), "unchanged");
                return Ok(false);
            }
        }
        groups.insert(group.dn().to_string(), group);
        Ok(true)
    }

    fn delete(&self, dn: &str) -> Result<bool, ReconcileError> {
        Ok(self.groups.write()?.remove(dn).is_some())
    }

    fn exists(&self, dn: &str) -> Result<bool, ReconcileError> {
        Ok(self.groups.read()?.contains_key(dn) || self.ous.read()?.contains(&dn.to_lowercase()))
    }

    fn create_ou(&self, dn: &str) -> Result<bool, ReconcileError> {
        Ok(self.ous.write()?.insert(dn.to_lowercase()))
    }
}
