//! Reconcile declarative group membership rules against directory backends.
//!
//! Rule files describe who belongs in a group. A [`Calculator`] evaluates
//! them into [`Group`]s, controllers diff those against what each backend
//! holds, and the [`Reconciler`] applies the resulting [`Action`]s and hands
//! the outcome to every [`Auditor`].

pub use audit::{AuditRecord, JsonLinesAuditor, LogAuditor};
pub use calculated::{Calculator, people_of};
pub use config::{FilterClass, FilterConfig, OuConfig, ReconcilerConfig};
pub use context::{EvalContext, FileScope, RunContext};
pub use controller::{BackendController, GroupController};
pub use diff::{DiffResult, GroupResolver, diff};
pub use error::{ErrorKind, ReconcileError};
pub use extensions::Extensions;
pub use filters::{AttributeFilter, Filter, FilterDefinition, FilterSetting, MemberOfGroupFilter};
pub use loader::{FsRuleSource, MemoryRuleSource, RuleFile, RuleFileEntry, RuleSource};
pub use memory::{MemoryPeople, MemoryProvider};
pub use modifiers::{ExpirationModifier, MAX_MODIFIER_ITERATIONS, Modifier};
pub use reconciler::{Phase, Reconciler};
pub use rules::{Condition, Matcher, Rule};
pub use timers::RunStats;
pub use traits::{Auditor, PeopleSource, Provider};
pub use types::{
    Action, ActionRecord, AttrValue, ChangeType, Entry, Group, Member, MemberDiff, Person,
    PersonSet,
};

mod audit;
mod calculated;
mod config;
mod context;
mod controller;
mod diff;
mod error;
mod extensions;
mod filters;
pub mod loader;
mod memory;
mod modifiers;
mod reconciler;
pub mod rules;
mod timers;
mod traits;
pub mod types;

#[cfg(test)]
mod testing;
