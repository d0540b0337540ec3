//! Rule trees and their evaluation.

mod matchers;
mod tree;

pub use matchers::{AttributeMatcher, GroupMatcher, Matcher, UsernameMatcher};
pub use tree::{Condition, Rule, parse_date};

pub(crate) use matchers::ALIASES;

use tracing::debug;

use crate::context::EvalContext;
use crate::error::ReconcileError;
use crate::types::PersonSet;

/// Evaluate a rule tree into the set of people it describes.
///
/// Every branch of an `and` is evaluated even when an earlier one came back
/// empty, so that errors in later branches are never hidden.
pub fn evaluate(rule: &Rule, ctx: &mut EvalContext<'_>) -> Result<PersonSet, ReconcileError> {
    match rule {
        Rule::Always(false) => Ok(PersonSet::new()),
        Rule::Always(true) => ctx.all_people(),
        Rule::Or(items) => {
            let mut result = PersonSet::new();
            for item in items {
                result.extend(evaluate(item, ctx)?);
            }
            Ok(result)
        }
        Rule::And(items) => {
            let mut iter = items.iter();
            let mut result = match iter.next() {
                Some(first) => evaluate(first, ctx)?,
                None => return Ok(PersonSet::new()),
            };
            for item in iter {
                let next = evaluate(item, ctx)?;
                result.retain(|p| next.contains(p));
            }
            Ok(result)
        }
        Rule::Not(inner) => {
            let excluded = evaluate(inner, ctx)?;
            let mut everyone = ctx.all_people()?;
            everyone.retain(|p| !excluded.contains(p));
            Ok(everyone)
        }
        Rule::Condition(condition) => {
            let matcher = ctx.matcher(&condition.method)?;
            if let Some(date) = condition.expiration {
                if ctx.is_expired(date) {
                    debug!(
                        event = "Rules",
                        phase = "Expired",
                        origin = ctx.origin(),
                        condition = condition.to_string(),
                        expiration = date.to_string()
                    );
                    return Ok(PersonSet::new());
                }
            }
            matcher.matches(condition, ctx)
        }
    }
}
