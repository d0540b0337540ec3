//! Leaf predicates.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use tracing::warn;

use crate::context::EvalContext;
use crate::error::ReconcileError;
use crate::types::PersonSet;

use super::tree::Condition;

/// A named leaf predicate that turns a condition into a set of people.
///
/// Implementations are registered on [`crate::Extensions`] at startup and
/// looked up by name while rule files are evaluated.
pub trait Matcher: Send + Sync {
    fn matches(
        &self,
        condition: &Condition,
        ctx: &mut EvalContext<'_>,
    ) -> Result<PersonSet, ReconcileError>;
}

/// Alternate spellings accepted in rule files.
pub(crate) static ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("user", "username"),
        ("entitlements_group", "group"),
        ("calculated_group", "group"),
        ("attr", "attribute"),
    ])
});

/// `username: alice`
#[derive(Debug, Default)]
pub struct UsernameMatcher;

impl Matcher for UsernameMatcher {
    fn matches(
        &self,
        condition: &Condition,
        ctx: &mut EvalContext<'_>,
    ) -> Result<PersonSet, ReconcileError> {
        match ctx.person(&condition.key) {
            Ok(person) => Ok(PersonSet::from([person])),
            Err(ReconcileError::NotFound(_)) => {
                warn!(
                    event = "Rules",
                    phase = "Username",
                    origin = ctx.origin(),
                    username = condition.key,
                    "username does not exist, ignoring"
                );
                Ok(PersonSet::new())
            }
            Err(e) => Err(e),
        }
    }
}

/// `group: ou/cn`, the members of another calculated group.
#[derive(Debug, Default)]
pub struct GroupMatcher;

impl Matcher for GroupMatcher {
    fn matches(
        &self,
        condition: &Condition,
        ctx: &mut EvalContext<'_>,
    ) -> Result<PersonSet, ReconcileError> {
        ctx.group_members(&condition.key)
    }
}

/// `attribute: name=value`, people whose attribute holds the value.
#[derive(Debug, Default)]
pub struct AttributeMatcher;

impl Matcher for AttributeMatcher {
    fn matches(
        &self,
        condition: &Condition,
        ctx: &mut EvalContext<'_>,
    ) -> Result<PersonSet, ReconcileError> {
        let Some((attr, value)) = condition.key.split_once('=') else {
            return Err(ReconcileError::rule(
                ctx.origin(),
                format!("attribute condition '{}' must be name=value", condition.key),
            ));
        };
        let (attr, value) = (attr.trim(), value.trim());
        Ok(ctx
            .all_people()?
            .into_iter()
            .filter(|p| {
                p.get(attr)
                    .map(|v| v.contains_insensitive(value))
                    .unwrap_or(false)
            })
            .collect())
    }
}
