//! Typed rule trees.
//!
//! A rule node is a mapping with exactly one key: `or`, `and`, `not`,
//! `always`, or a predicate name. Parsing validates the whole tree up front,
//! so every shape error in a file surfaces before any evaluation happens.

use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::ReconcileError;

/// A parsed rule tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Or(Vec<Rule>),
    And(Vec<Rule>),
    Not(Box<Rule>),
    Always(bool),
    Condition(Condition),
}

/// A leaf predicate: `{method: key}` or `{method: {key: ..., expiration: YYYY-MM-DD}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Predicate name as written, before alias resolution.
    pub method: String,
    pub key: String,
    pub expiration: Option<NaiveDate>,
}

impl Condition {
    pub fn new<M: Into<String>, K: Into<String>>(method: M, key: K) -> Self {
        Condition {
            method: method.into(),
            key: key.into(),
            expiration: None,
        }
    }

    fn parse(method: &str, value: &Value, origin: &str) -> Result<Self, ReconcileError> {
        match value {
            Value::Object(map) => {
                let mut key = None;
                let mut expiration = None;
                for (k, v) in map {
                    match k.as_str() {
                        "key" => key = Some(scalar(v, origin, method)?),
                        "expiration" => {
                            let text = scalar(v, origin, method)?;
                            expiration = Some(parse_date(&text).map_err(|_| {
                                ReconcileError::rule(
                                    origin,
                                    format!("invalid expiration '{text}' on '{method}' (expected YYYY-MM-DD)"),
                                )
                            })?);
                        }
                        other => {
                            return Err(ReconcileError::rule(
                                origin,
                                format!("unexpected option '{other}' on '{method}'"),
                            ));
                        }
                    }
                }
                let key = key.ok_or_else(|| {
                    ReconcileError::rule(origin, format!("'{method}' condition has no key"))
                })?;
                Ok(Condition {
                    method: method.to_string(),
                    key,
                    expiration,
                })
            }
            other => Ok(Condition::new(method, scalar(other, origin, method)?)),
        }
    }
}

impl Display for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{} = {}", self.method, self.key)
    }
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(text: &str) -> Result<NaiveDate, ReconcileError> {
    Ok(NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")?)
}

fn scalar(value: &Value, origin: &str, method: &str) -> Result<String, ReconcileError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ReconcileError::rule(
            origin,
            format!("'{method}' expects a scalar value, got {}", describe(other)),
        )),
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}

impl Rule {
    /// Parse the top-level rule of a file. An empty mapping means "nobody".
    pub fn parse(value: &Value, origin: &str) -> Result<Rule, ReconcileError> {
        match value {
            Value::Object(map) if map.is_empty() => Ok(Rule::Always(false)),
            other => Rule::parse_node(other, origin),
        }
    }

    fn parse_node(value: &Value, origin: &str) -> Result<Rule, ReconcileError> {
        let Value::Object(map) = value else {
            return Err(ReconcileError::rule(
                origin,
                format!("expected a rule mapping, got {}", describe(value)),
            ));
        };
        let (key, inner) = single_entry(map, origin)?;

        match key.as_str() {
            "or" => Ok(Rule::Or(parse_list(key, inner, origin)?)),
            "and" => {
                let items = parse_list(key, inner, origin)?;
                if items.is_empty() {
                    return Err(ReconcileError::rule(origin, "'and' requires at least one rule"));
                }
                Ok(Rule::And(items))
            }
            "not" => {
                if !inner.is_object() {
                    return Err(ReconcileError::rule(
                        origin,
                        format!("'not' expects a single rule mapping, got {}", describe(inner)),
                    ));
                }
                Ok(Rule::Not(Box::new(Rule::parse_node(inner, origin)?)))
            }
            "always" => match inner {
                Value::Bool(b) => Ok(Rule::Always(*b)),
                other => Err(ReconcileError::rule(
                    origin,
                    format!("'always' expects true or false, got {}", describe(other)),
                )),
            },
            method => Ok(Rule::Condition(Condition::parse(method, inner, origin)?)),
        }
    }

    /// Every condition in this tree, depth first.
    pub fn conditions(&self) -> Vec<&Condition> {
        let mut out = Vec::new();
        self.collect_conditions(&mut out);
        out
    }

    fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
        match self {
            Rule::Or(xs) | Rule::And(xs) => xs.iter().for_each(|x| x.collect_conditions(out)),
            Rule::Not(x) => x.collect_conditions(out),
            Rule::Always(_) => {}
            Rule::Condition(c) => out.push(c),
        }
    }
}

fn single_entry<'a>(
    map: &'a Map<String, Value>,
    origin: &str,
) -> Result<(&'a String, &'a Value), ReconcileError> {
    let mut iter = map.iter();
    match (iter.next(), iter.next()) {
        (Some(entry), None) => Ok(entry),
        _ => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            Err(ReconcileError::rule(
                origin,
                format!(
                    "rule must have exactly one key, found {} [{}]",
                    keys.len(),
                    keys.join(", ")
                ),
            ))
        }
    }
}

fn parse_list(key: &str, value: &Value, origin: &str) -> Result<Vec<Rule>, ReconcileError> {
    let Value::Array(items) = value else {
        return Err(ReconcileError::rule(
            origin,
            format!("'{key}' expects a list of rules, got {}", describe(value)),
        ));
    };
    items
        .iter()
        .map(|item| Rule::parse_node(item, origin))
        .collect()
}
