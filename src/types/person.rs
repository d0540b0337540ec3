//! Directory principals with a tracked attribute bag.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single attribute value on a [`Person`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "value")]
pub enum AttrValue {
    String(String),
    List(Vec<String>),
    Set(BTreeSet<String>), // always exposed to callers as a sorted list
}

impl AttrValue {
    /// True for empty strings, lists and sets.
    pub fn is_empty(&self) -> bool {
        match self {
            AttrValue::String(s) => s.is_empty(),
            AttrValue::List(xs) => xs.is_empty(),
            AttrValue::Set(xs) => xs.is_empty(),
        }
    }

    /// The value as callers see it: sets become sorted lists.
    pub fn exposed(&self) -> AttrValue {
        match self {
            AttrValue::Set(xs) => AttrValue::List(xs.iter().cloned().collect()),
            other => other.clone(),
        }
    }

    /// All string values in this attribute.
    pub fn values(&self) -> Vec<&str> {
        match self {
            AttrValue::String(s) => vec![s.as_str()],
            AttrValue::List(xs) => xs.iter().map(String::as_str).collect(),
            AttrValue::Set(xs) => xs.iter().map(String::as_str).collect(),
        }
    }

    /// Case-insensitive containment check over every value.
    pub fn contains_insensitive(&self, needle: &str) -> bool {
        self.values().iter().any(|v| v.eq_ignore_ascii_case(needle))
    }
}

/// A directory principal.
///
/// Identity is the `uid`, kept in its original case but compared
/// case-insensitively. Attributes remember what they were when loaded so
/// callers can find out what changed during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    uid: String,
    original: BTreeMap<String, AttrValue>,
    current: BTreeMap<String, AttrValue>,
    touched: BTreeSet<String>,
}

impl Person {
    pub fn new<S: Into<String>>(uid: S, attributes: BTreeMap<String, AttrValue>) -> Self {
        Person {
            uid: uid.into(),
            current: attributes.clone(),
            original: attributes,
            touched: BTreeSet::new(),
        }
    }

    /// Shorthand for a person without attributes.
    pub fn with_uid<S: Into<String>>(uid: S) -> Self {
        Person::new(uid, BTreeMap::new())
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Lowercased uid, the identity used for comparisons.
    pub fn key(&self) -> String {
        self.uid.to_lowercase()
    }

    /// Current value of an attribute, with sets exposed as sorted lists.
    pub fn get(&self, attr: &str) -> Option<AttrValue> {
        self.current.get(attr).map(AttrValue::exposed)
    }

    /// Value as loaded, before any mutation in this session.
    pub fn original(&self, attr: &str) -> Option<AttrValue> {
        self.original.get(attr).map(AttrValue::exposed)
    }

    /// Replace an attribute value. `None` or an empty value removes it.
    ///
    /// Clearing an attribute that was never present does not mark it touched.
    pub fn set(&mut self, attr: &str, value: Option<AttrValue>) {
        let value = value.filter(|v| !v.is_empty());
        match value {
            None => {
                if !self.original.contains_key(attr) && !self.current.contains_key(attr) {
                    return;
                }
                self.current.remove(attr);
            }
            Some(v) => {
                self.current.insert(attr.to_string(), v);
            }
        }
        self.touched.insert(attr.to_string());
    }

    /// Add a value to a set-valued attribute, converting scalars and lists as needed.
    pub fn add_to_set(&mut self, attr: &str, value: &str) {
        let mut set: BTreeSet<String> = self
            .current
            .get(attr)
            .map(|v| v.values().into_iter().map(str::to_string).collect())
            .unwrap_or_default();
        if set.insert(value.to_string()) || !matches!(self.current.get(attr), Some(AttrValue::Set(_))) {
            self.current.insert(attr.to_string(), AttrValue::Set(set));
            self.touched.insert(attr.to_string());
        }
    }

    /// Remove a value from a set-valued attribute. Returns whether it was present.
    pub fn remove_from_set(&mut self, attr: &str, value: &str) -> bool {
        let Some(AttrValue::Set(set)) = self.current.get_mut(attr) else {
            return false;
        };
        if !set.remove(value) {
            return false;
        }
        if set.is_empty() {
            self.current.remove(attr);
        }
        self.touched.insert(attr.to_string());
        true
    }

    /// Sorted names of attributes mutated in this session.
    pub fn touched(&self) -> Vec<&str> {
        self.touched.iter().map(String::as_str).collect()
    }

    /// `(attribute, original, current)` for touched attributes whose value really differs.
    pub fn changes(&self) -> Vec<(String, Option<AttrValue>, Option<AttrValue>)> {
        self.touched
            .iter()
            .filter_map(|attr| {
                let before = self.original(attr);
                let after = self.get(attr);
                (before != after).then(|| (attr.clone(), before, after))
            })
            .collect()
    }
}

impl PartialEq for Person {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Person {}

impl Hash for Person {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Person {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Person {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl Display for Person {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.uid)
    }
}
