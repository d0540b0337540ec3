//! Membership modifiers, applied to a fixed point after filters.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::context::EvalContext;
use crate::error::ReconcileError;
use crate::rules::parse_date;
use crate::types::PersonSet;

/// Hard cap on modifier passes before giving up.
pub const MAX_MODIFIER_ITERATIONS: usize = 100;

/// A transformation of a group's member set, configured per rule file.
pub trait Modifier: Send + Sync {
    /// Modify `members` in place; return whether anything changed.
    fn modify(
        &self,
        value: &Value,
        members: &mut PersonSet,
        ctx: &mut EvalContext<'_>,
    ) -> Result<bool, ReconcileError>;

    /// Whether this modifier makes an empty group legitimate.
    fn permits_empty(&self, _value: &Value, _ctx: &EvalContext<'_>) -> Result<bool, ReconcileError> {
        Ok(false)
    }
}

/// `expiration: YYYY-MM-DD` empties the group once the date is reached.
#[derive(Debug, Default)]
pub struct ExpirationModifier;

impl ExpirationModifier {
    fn expired(&self, value: &Value, ctx: &EvalContext<'_>) -> Result<bool, ReconcileError> {
        let Value::String(text) = value else {
            return Err(ReconcileError::rule(
                ctx.origin(),
                "expiration modifier expects a YYYY-MM-DD string",
            ));
        };
        let date = parse_date(text).map_err(|_| {
            ReconcileError::rule(
                ctx.origin(),
                format!("invalid expiration '{text}' (expected YYYY-MM-DD)"),
            )
        })?;
        Ok(ctx.is_expired(date))
    }
}

impl Modifier for ExpirationModifier {
    fn modify(
        &self,
        value: &Value,
        members: &mut PersonSet,
        ctx: &mut EvalContext<'_>,
    ) -> Result<bool, ReconcileError> {
        if !self.expired(value, ctx)? || members.is_empty() {
            return Ok(false);
        }
        debug!(
            event = "Rules",
            phase = "Expired",
            origin = ctx.origin(),
            removed = members.len()
        );
        members.clear();
        Ok(true)
    }

    fn permits_empty(&self, value: &Value, ctx: &EvalContext<'_>) -> Result<bool, ReconcileError> {
        self.expired(value, ctx)
    }
}

/// Members after modification, and whether any modifier allows them to be empty.
#[derive(Debug, Clone, Default)]
pub struct ModifierOutcome {
    pub members: PersonSet,
    pub permits_empty: bool,
}

/// Run every configured modifier until none reports a change.
pub fn apply_modifiers(
    members: PersonSet,
    config: &BTreeMap<String, Value>,
    ctx: &mut EvalContext<'_>,
) -> Result<ModifierOutcome, ReconcileError> {
    let mut modifiers: Vec<(Arc<dyn Modifier>, &Value)> = Vec::with_capacity(config.len());
    for (name, value) in config {
        let modifier = ctx.calculator.extensions().modifier(name).ok_or_else(|| {
            ReconcileError::rule(ctx.origin(), format!("unknown modifier '{name}'"))
        })?;
        modifiers.push((modifier, value));
    }

    let mut outcome = ModifierOutcome {
        members,
        permits_empty: false,
    };
    if modifiers.is_empty() {
        return Ok(outcome);
    }

    let mut converged = false;
    for _ in 0..MAX_MODIFIER_ITERATIONS {
        let mut changed = false;
        for (modifier, value) in &modifiers {
            changed |= modifier.modify(value, &mut outcome.members, ctx)?;
        }
        if !changed {
            converged = true;
            break;
        }
    }
    if !converged {
        let err = ReconcileError::NonConvergent {
            origin: ctx.origin(),
            iterations: MAX_MODIFIER_ITERATIONS,
        };
        error!(event = "Rules", phase = "Modifiers", origin = ctx.origin(), "{err}");
        return Err(err);
    }

    for (modifier, value) in &modifiers {
        if modifier.permits_empty(value, ctx)? {
            outcome.permits_empty = true;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use crate::calculated::people_of;
    use crate::error::ReconcileError;
    use crate::testing::{CONFIG, Harness, run, uids};
    use yare::parameterized;

    fn calculate(modifiers: &str) -> Result<crate::types::Group, ReconcileError> {
        let text = format!("rules:\n  or:\n    - username: alice\n    - username: bob\nmodifiers:\n{modifiers}");
        let h = Harness::new(CONFIG, &[("teams/a.yaml", text.as_str())]);
        h.calculator.calculate_group(&mut run(), "teams", "a", "test")
    }

    #[parameterized(
        expired = { "2024-06-15", &[], true },
        active = { "2024-06-16", &["alice", "bob"], false },
    )]
    fn test_expiration_modifier(date: &str, expected: &[&str], empty_ok: bool) {
        let group = calculate(&format!("  expiration: \"{date}\"\n")).unwrap();
        assert_eq!(uids(&people_of(&group)), expected);
        assert_eq!(group.no_members_ok(), empty_ok);
    }

    #[parameterized(
        not_a_date = { "  expiration: soon\n" },
        not_a_string = { "  expiration: [2024-06-15]\n" },
    )]
    fn test_expiration_modifier_rejects_bad_values(modifiers: &str) {
        assert!(matches!(
            calculate(modifiers),
            Err(ReconcileError::Rule { .. })
        ));
    }
}
