//! Diff calculated groups against what a provider holds.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::ReconcileError;
use crate::types::{Action, Entry, Group};

/// Looks up both sides of a dn during a diff.
pub trait GroupResolver {
    /// The group as the provider currently holds it.
    fn observed(&self, dn: &str) -> Result<Group, ReconcileError>;
    /// The group as calculated from rules.
    fn calculated(&self, dn: &str) -> Result<Group, ReconcileError>;
}

/// Actions produced by [`diff`], by kind.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub added: Vec<Action>,
    pub removed: Vec<Action>,
    pub changed: Vec<Action>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.changed.len()
    }

    /// Adds, then deletes, then updates.
    pub fn into_actions(self) -> Vec<Action> {
        let mut actions = self.added;
        actions.extend(self.removed);
        actions.extend(self.changed);
        actions
    }
}

/// Compare the dns a provider holds with the dns calculated for `ou`.
///
/// Dns in both sets produce an update only when the groups differ after the
/// observed side has been brought into the calculated side's member case.
pub fn diff(
    existing: &BTreeSet<String>,
    proposed: &BTreeSet<String>,
    ou: &str,
    resolver: &dyn GroupResolver,
) -> Result<DiffResult, ReconcileError> {
    let mut result = DiffResult::default();

    for dn in proposed.difference(existing) {
        let calculated = resolver.calculated(dn)?;
        result
            .added
            .push(Action::new(dn, None, Some(Entry::from(calculated)), ou));
    }

    for dn in existing.difference(proposed) {
        let observed = resolver.observed(dn)?;
        result
            .removed
            .push(Action::new(dn, Some(Entry::from(observed)), None, ou));
    }

    for dn in existing.intersection(proposed) {
        let calculated = resolver.calculated(dn)?;
        let mut observed = resolver.observed(dn)?;
        observed.update_case(calculated.members().iter().map(|m| m.member_string()));
        if observed.equals(&calculated) {
            continue;
        }

        if observed.raw_member_strings() == calculated.raw_member_strings() {
            info!(
                event = "Diff",
                phase = "Metadata",
                ou = ou,
                dn = dn.as_str(),
                before = observed.description(),
                after = calculated.description(),
                "description changed, membership did not"
            );
        } else {
            debug!(event = "Diff", phase = "Members", ou = ou, dn = dn.as_str());
        }
        result.changed.push(Action::new(
            dn,
            Some(Entry::from(observed)),
            Some(Entry::from(calculated)),
            ou,
        ));
    }

    info!(
        event = "Diff",
        phase = "Result",
        ou = ou,
        added = result.added.len(),
        removed = result.removed.len(),
        changed = result.changed.len()
    );
    Ok(result)
}
