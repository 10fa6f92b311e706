use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compiler::{compile, CompiledSchema};
use crate::config::ENV_DATABASE_NAME;
use crate::error::{RepoError, Result};
use crate::registry::Registry;
use crate::schema::Definition;

/// Fallback name and db for a definition, from plugin options or its file name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DefinitionDefaults {
    pub name: Option<String>,
    pub db: Option<String>,
}

impl DefinitionDefaults {
    /// Read `name` and `db` from plugin options
    pub fn from_options(options: &Value) -> Self {
        let text = |key: &str| options.get(key).and_then(Value::as_str).map(str::to_string);
        DefinitionDefaults {
            name: text("name"),
            db: text("db"),
        }
    }

    /// Fill missing fields from `fallback`
    pub fn or(mut self, fallback: &DefinitionDefaults) -> Self {
        if self.name.is_none() {
            self.name = fallback.name.clone();
        }
        if self.db.is_none() {
            self.db = fallback.db.clone();
        }
        self
    }
}

/// A compiled definition as registered in the catalog
#[derive(Debug)]
pub struct SchemaEntry {
    pub name: String,
    pub db: String,
    pub definition: Definition,
    /// Model names bound to this schema
    pub models: Vec<String>,
    pub schema: Arc<CompiledSchema>,
}

impl SchemaEntry {
    /// Resolve name and db, then compile. A definition without a `schema`
    /// contributes nothing and yields `None`.
    pub fn compile(
        mut definition: Definition,
        defaults: &DefinitionDefaults,
        registry: &Registry,
    ) -> Result<Option<Self>> {
        if definition.schema.is_none() {
            log::debug!(
                "Definition {} has no schema; skipped",
                definition.name.as_deref().or(defaults.name.as_deref()).unwrap_or("<unnamed>")
            );
            return Ok(None);
        }

        let name = definition
            .name
            .clone()
            .or_else(|| defaults.name.clone())
            .ok_or_else(|| RepoError::Assertion("Must provide a valid model name for the definition schema".into()))?;
        let db = definition
            .db
            .clone()
            .or_else(|| defaults.db.clone())
            .or_else(|| std::env::var(ENV_DATABASE_NAME).ok())
            .ok_or_else(|| RepoError::Assertion(format!("Must provide a db for definition {name}")))?;
        definition.name = Some(name.clone());
        definition.db = Some(db.clone());

        let schema = compile(&definition, registry)?;
        Ok(Some(SchemaEntry {
            models: definition.model_names(&name),
            name,
            db,
            definition,
            schema: Arc::new(schema),
        }))
    }
}

/// Filter for `Repository::schemas`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaQuery {
    pub db: Option<String>,
    /// With `db`, a schema name; without it, `db` or `db.name`
    pub path: Option<String>,
}

impl SchemaQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn db(db: impl Into<String>) -> Self {
        SchemaQuery {
            db: Some(db.into()),
            path: None,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    fn bounds(&self) -> (Option<&str>, Option<&str>) {
        match (self.db.as_deref(), self.path.as_deref()) {
            (Some(db), path) => (Some(db), path),
            (None, Some(path)) => match path.split_once('.') {
                Some((db, name)) => (Some(db), Some(name)),
                None => (Some(path), None),
            },
            (None, None) => (None, None),
        }
    }
}

/// Compiled schemas keyed by db, then schema name
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    dbs: BTreeMap<String, BTreeMap<String, Arc<SchemaEntry>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry; a later entry with the same db and name replaces the
    /// earlier one, which is returned.
    pub fn insert(&mut self, entry: SchemaEntry) -> Option<Arc<SchemaEntry>> {
        self.dbs
            .entry(entry.db.clone())
            .or_default()
            .insert(entry.name.clone(), Arc::new(entry))
    }

    pub fn get(&self, db: &str, name: &str) -> Option<&Arc<SchemaEntry>> {
        self.dbs.get(db).and_then(|entries| entries.get(name))
    }

    /// Entries of one db in name order
    pub fn db(&self, db: &str) -> impl Iterator<Item = &Arc<SchemaEntry>> {
        self.dbs.get(db).into_iter().flat_map(|entries| entries.values())
    }

    pub fn dbs(&self) -> impl Iterator<Item = &str> {
        self.dbs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SchemaEntry>> {
        self.dbs.values().flat_map(|entries| entries.values())
    }

    pub fn len(&self) -> usize {
        self.dbs.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The slice of the catalog a query selects
    pub fn select(&self, query: &SchemaQuery) -> Catalog {
        let (db, name) = query.bounds();
        let mut slice = Catalog::new();
        for (entry_db, entries) in &self.dbs {
            if db.is_some_and(|db| db != entry_db.as_str()) {
                continue;
            }
            for (entry_name, entry) in entries {
                if name.is_some_and(|name| name != entry_name.as_str()) {
                    continue;
                }
                slice
                    .dbs
                    .entry(entry_db.clone())
                    .or_default()
                    .insert(entry_name.clone(), entry.clone());
            }
        }
        slice
    }
}
