//! Name-keyed tables of pluggable callables.
//!
//! A fresh [`Registry`] is built for every orchestration pass. Plugins add to
//! it, the compiler reads from it, and nothing reads it before the pass is
//! complete.

mod defaults;

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::compiler::SchemaBuilder;
use crate::model::Record;

/// `(value) -> bool`, attached to a leaf with `validator: name`
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// `(value) -> value`, attached to a leaf with `set: name`
pub type SetFormatter = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// `(record, args) -> value`, backing a computed field
pub type VirtualFormatter = Arc<dyn Fn(&Record, &[Value]) -> Value + Send + Sync>;

/// `(schema, options)`, free to add virtuals, methods, hooks and indexes
pub type SchemaPlugin = Arc<dyn Fn(&mut SchemaBuilder, &Value) + Send + Sync>;

pub fn validator<F>(f: F) -> Validator
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn set_formatter<F>(f: F) -> SetFormatter
where
    F: Fn(Value) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn virtual_formatter<F>(f: F) -> VirtualFormatter
where
    F: Fn(&Record, &[Value]) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn schema_plugin<F>(f: F) -> SchemaPlugin
where
    F: Fn(&mut SchemaBuilder, &Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A table of callables keyed by dotted path (`namespace.name`).
#[derive(Clone)]
pub struct Table<F> {
    entries: BTreeMap<String, F>,
}

impl<F> Default for Table<F> {
    fn default() -> Self {
        Table {
            entries: BTreeMap::new(),
        }
    }
}

impl<F: Clone> Table<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, f: F) -> &mut Self {
        self.entries.insert(name.into(), f);
        self
    }

    pub fn with(mut self, name: impl Into<String>, f: F) -> Self {
        self.insert(name, f);
        self
    }

    /// Register every entry of `other` under `namespace.`
    pub fn insert_namespace(&mut self, namespace: &str, other: Table<F>) -> &mut Self {
        for (name, f) in other.entries {
            self.entries.insert(format!("{namespace}.{name}"), f);
        }
        self
    }

    /// Look up a callable by dotted path. A miss is `None`, never an error.
    pub fn get(&self, path: &str) -> Option<F> {
        self.entries.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge `other` into this table; entries from `other` replace existing ones.
    pub fn merge(&mut self, other: Table<F>) {
        self.entries.extend(other.entries);
    }
}

impl<F> fmt::Debug for Table<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// The four registries consulted by the definition compiler.
#[derive(Clone, Default, Debug)]
pub struct Registry {
    pub validators: Table<Validator>,
    pub set_formatters: Table<SetFormatter>,
    pub virtual_formatters: Table<VirtualFormatter>,
    pub schema_plugins: Table<SchemaPlugin>,
}

impl Registry {
    /// A registry with no entries at all
    pub fn empty() -> Self {
        Self::default()
    }

    /// The state every orchestration pass starts from
    pub fn with_defaults() -> Self {
        Registry {
            validators: defaults::validators(),
            set_formatters: defaults::set_formatters(),
            virtual_formatters: defaults::virtual_formatters(),
            schema_plugins: Table::new(),
        }
    }

    /// Merge a plugin's contribution. Later merges win on conflicting names.
    pub fn merge(&mut self, delta: Registry) {
        self.validators.merge(delta.validators);
        self.set_formatters.merge(delta.set_formatters);
        self.virtual_formatters.merge(delta.virtual_formatters);
        self.schema_plugins.merge(delta.schema_plugins);
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
            && self.set_formatters.is_empty()
            && self.virtual_formatters.is_empty()
            && self.schema_plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespace_lookup() {
        let mut table: Table<Validator> = Table::new();
        let inner = Table::new().with("positive", validator(|v| v.as_f64().map_or(false, |n| n > 0.0)));
        table.insert_namespace("math", inner);

        assert!(table.get("math.positive").is_some());
        assert!(table.get("positive").is_none());
        assert!((table.get("math.positive").unwrap())(&json!(3)));
    }

    #[test]
    fn test_merge_last_wins() {
        let mut base = Registry::empty();
        base.set_formatters
            .insert("shout", set_formatter(|_| json!("first")));

        let mut delta = Registry::empty();
        delta
            .set_formatters
            .insert("shout", set_formatter(|_| json!("second")));
        base.merge(delta);

        let f = base.set_formatters.get("shout").unwrap();
        assert_eq!(f(json!("x")), json!("second"));
        assert_eq!(base.set_formatters.len(), 1);
    }

    #[test]
    fn test_defaults_present() {
        let registry = Registry::with_defaults();
        assert!(registry.validators.contains("isEmail"));
        assert!(registry.set_formatters.contains("trim"));
        assert!(registry.virtual_formatters.contains("template"));
        assert!(registry.schema_plugins.is_empty());
    }
}
