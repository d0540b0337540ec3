//! Name-keyed registries for predicates, filters and modifiers.
//!
//! Built-ins are registered by [`Extensions::builtin`]; embedders add their
//! own at startup before handing the registry to a [`crate::Calculator`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::filters::FilterDefinition;
use crate::modifiers::{ExpirationModifier, Modifier};
use crate::rules::{ALIASES, AttributeMatcher, GroupMatcher, Matcher, UsernameMatcher};

#[derive(Clone, Default)]
pub struct Extensions {
    matchers: BTreeMap<String, Arc<dyn Matcher>>,
    modifiers: BTreeMap<String, Arc<dyn Modifier>>,
    filters: Vec<FilterDefinition>,
}

impl Extensions {
    /// An empty registry. Most callers want [`Extensions::builtin`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with every built-in predicate and modifier.
    pub fn builtin() -> Self {
        let mut ext = Self::new();
        ext.register_matcher("username", Arc::new(UsernameMatcher));
        ext.register_matcher("group", Arc::new(GroupMatcher));
        ext.register_matcher("attribute", Arc::new(AttributeMatcher));
        ext.register_modifier("expiration", Arc::new(ExpirationModifier));
        ext
    }

    pub fn register_matcher(&mut self, name: &str, matcher: Arc<dyn Matcher>) -> &mut Self {
        self.matchers.insert(name.to_string(), matcher);
        self
    }

    pub fn register_modifier(&mut self, name: &str, modifier: Arc<dyn Modifier>) -> &mut Self {
        self.modifiers.insert(name.to_string(), modifier);
        self
    }

    /// Register a filter in addition to those built from configuration.
    pub fn register_filter(&mut self, filter: FilterDefinition) -> &mut Self {
        self.filters.retain(|f| f.name != filter.name);
        self.filters.push(filter);
        self
    }

    /// Resolve an alias to its canonical predicate name.
    pub fn canonical_method<'a>(&self, method: &'a str) -> &'a str {
        ALIASES.get(method).copied().unwrap_or(method)
    }

    pub fn matcher(&self, name: &str) -> Option<Arc<dyn Matcher>> {
        self.matchers.get(name).cloned()
    }

    pub fn modifier(&self, name: &str) -> Option<Arc<dyn Modifier>> {
        self.modifiers.get(name).cloned()
    }

    pub fn filters(&self) -> &[FilterDefinition] {
        &self.filters
    }

    /// Registered predicate names, sorted.
    pub fn matcher_names(&self) -> Vec<&str> {
        self.matchers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        user = { "user", "username" },
        entitlements_group = { "entitlements_group", "group" },
        calculated_group = { "calculated_group", "group" },
        attr = { "attr", "attribute" },
        canonical = { "username", "username" },
        unknown = { "frobnicate", "frobnicate" },
    )]
    fn test_canonical_method(method: &str, expected: &str) {
        assert_eq!(Extensions::builtin().canonical_method(method), expected);
    }

    #[test]
    fn test_builtin_names() {
        let ext = Extensions::builtin();
        assert_eq!(ext.matcher_names(), vec!["attribute", "group", "username"]);
        assert!(ext.modifier("expiration").is_some());
        assert!(ext.matcher("user").is_none());
    }
}
