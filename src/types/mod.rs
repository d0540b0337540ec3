//! Data model: people, groups and the actions that change them.
//!
//! Identity rules:
//! - Person: `uid`, case-preserving, compared case-insensitively.
//! - Group: `dn`; `cn` is the value of the first DN component.
//! - Action: `dn` plus the owning OU key.

mod action;
mod group;
mod person;

pub use action::{Action, ActionRecord, ChangeType, Entry, MemberDiff};
pub use group::{Group, Member, NO_MEMBERS_OK};
pub use person::{AttrValue, Person};

use std::collections::BTreeSet;
use std::sync::Arc;

/// The result of evaluating a rule: a set of people.
pub type PersonSet = BTreeSet<Arc<Person>>;
