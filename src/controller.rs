//! Per-OU controllers that connect the calculator to a backend.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::calculated::Calculator;
use crate::config::OuConfig;
use crate::context::RunContext;
use crate::diff::{GroupResolver, diff};
use crate::error::ReconcileError;
use crate::traits::Provider;
use crate::types::{Action, ChangeType, Entry, Group};

/// Hooks the reconciler drives for one OU.
///
/// `prefetch` and `validate` may run on worker threads alongside other
/// controllers; everything else runs on the reconciler's thread.
pub trait BackendController: Send + Sync {
    /// The OU key this controller manages.
    fn ou(&self) -> &str;

    /// The OU this one mirrors, if any.
    fn mirror_of(&self) -> Option<&str> {
        None
    }

    /// The base DN this controller reads and writes, when it has one.
    fn base(&self) -> Option<&str> {
        None
    }

    fn prefetch(&self) -> Result<(), ReconcileError>;
    fn validate(&self) -> Result<(), ReconcileError>;
    fn calculate(
        &self,
        calculator: &Calculator,
        run: &mut RunContext,
    ) -> Result<Vec<Action>, ReconcileError>;
    fn preapply(&self) -> Result<(), ReconcileError>;
    fn apply(&self, action: &Action) -> Result<(), ReconcileError>;

    /// Actions produced by the last `calculate`.
    fn change_count(&self) -> usize;
}

/// Controller for backends whose entries are groups.
pub struct GroupController<P> {
    ou_key: String,
    config: OuConfig,
    provider: P,
    observed: RwLock<Option<BTreeSet<String>>>,
    changes: AtomicUsize,
}

impl<P: Provider> GroupController<P> {
    pub fn new<S: Into<String>>(ou_key: S, config: OuConfig, provider: P) -> Self {
        GroupController {
            ou_key: ou_key.into(),
            config,
            provider,
            observed: RwLock::new(None),
            changes: AtomicUsize::new(0),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}

struct Sides<'a, P> {
    provider: &'a P,
    calculated: &'a BTreeMap<String, Group>,
}

impl<P: Provider> GroupResolver for Sides<'_, P> {
    fn observed(&self, dn: &str) -> Result<Group, ReconcileError> {
        self.provider.read(dn)
    }

    fn calculated(&self, dn: &str) -> Result<Group, ReconcileError> {
        self.calculated
            .get(dn)
            .cloned()
            .ok_or_else(|| ReconcileError::Internal(format!("no calculated group {dn}")))
    }
}

impl<P: Provider> BackendController for GroupController<P> {
    fn ou(&self) -> &str {
        &self.ou_key
    }

    fn mirror_of(&self) -> Option<&str> {
        self.config.mirror.as_deref()
    }

    fn base(&self) -> Option<&str> {
        Some(&self.config.base)
    }

    fn prefetch(&self) -> Result<(), ReconcileError> {
        let dns = self.provider.read_all(&self.config.base)?;
        debug!(
            event = "Controller",
            phase = "Prefetch",
            ou = self.ou_key,
            groups = dns.len()
        );
        *self.observed.write()? = Some(dns);
        Ok(())
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        if self.observed.read()?.is_none() {
            return Err(ReconcileError::Internal(format!(
                "OU '{}' validated before prefetch",
                self.ou_key
            )));
        }
        if !self.config.create_if_missing && !self.provider.exists(&self.config.base)? {
            return Err(ReconcileError::Configuration(format!(
                "base {} of OU '{}' does not exist and create_if_missing is off",
                self.config.base, self.ou_key
            )));
        }
        Ok(())
    }

    fn calculate(
        &self,
        calculator: &Calculator,
        run: &mut RunContext,
    ) -> Result<Vec<Action>, ReconcileError> {
        let proposed = calculator.read_all(run, &self.ou_key)?;
        let existing = self.observed.read()?.clone().ok_or_else(|| {
            ReconcileError::Internal(format!(
                "OU '{}' calculated before prefetch",
                self.ou_key
            ))
        })?;
        let sides = Sides {
            provider: &self.provider,
            calculated: run.groups(),
        };
        let actions = diff(&existing, &proposed, &self.ou_key, &sides)?.into_actions();
        self.changes.store(actions.len(), Ordering::SeqCst);
        Ok(actions)
    }

    fn preapply(&self) -> Result<(), ReconcileError> {
        if self.config.create_if_missing && !self.provider.exists(&self.config.base)? {
            self.provider.create_ou(&self.config.base)?;
            info!(
                event = "Controller",
                phase = "Preapply",
                ou = self.ou_key,
                base = self.config.base,
                "created OU"
            );
        }
        Ok(())
    }

    fn apply(&self, action: &Action) -> Result<(), ReconcileError> {
        let changed = match action.change_type() {
            ChangeType::Add | ChangeType::Update => {
                let Some(group) = action.updated().and_then(Entry::as_group) else {
                    return Err(ReconcileError::Internal(format!(
                        "{action} carries no group"
                    )));
                };
                self.provider.upsert(group, &BTreeMap::new())?
            }
            ChangeType::Delete => self.provider.delete(action.dn())?,
        };
        if changed {
            info!(event = "Controller", phase = "Apply", ou = self.ou_key, action = %action);
        } else {
            warn!(
                event = "Controller",
                phase = "Apply",
                ou = self.ou_key,
                action = %action,
                "provider reported nothing to do"
            );
        }
        Ok(())
    }

    fn change_count(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }
}
