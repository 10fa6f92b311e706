//! Plugins contribute registry entries and definitions.
//!
//! Loading is two-phase. Every registered plugin runs concurrently and
//! produces a [`Contribution`]; contributions are then merged in registration
//! order and only afterwards are definitions compiled, so a definition can
//! use a validator from any plugin regardless of which one finishes first.

mod locator;

pub use locator::{DefinitionResolver, Fetcher, HttpFetcher};

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::catalog::{Catalog, DefinitionDefaults, SchemaEntry};
use crate::error::Result;
use crate::registry::{Registry, SchemaPlugin, SetFormatter, Validator, VirtualFormatter};
use crate::schema::{parse_definition_str, parse_definition_value, Definition};

/// A definition handed over by a plugin: inline, or a locator to resolve
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionSource {
    Inline(Definition),
    Locator(String),
}

impl From<Definition> for DefinitionSource {
    fn from(definition: Definition) -> Self {
        DefinitionSource::Inline(definition)
    }
}

impl From<&str> for DefinitionSource {
    fn from(locator: &str) -> Self {
        DefinitionSource::Locator(locator.to_string())
    }
}

impl From<String> for DefinitionSource {
    fn from(locator: String) -> Self {
        DefinitionSource::Locator(locator)
    }
}

/// Static contributions of a plugin
#[derive(Clone, Default, Debug)]
pub struct PluginExports {
    pub registry: Registry,
    pub definitions: Vec<DefinitionSource>,
}

impl PluginExports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validator(mut self, name: &str, f: Validator) -> Self {
        self.registry.validators.insert(name, f);
        self
    }

    pub fn set_formatter(mut self, name: &str, f: SetFormatter) -> Self {
        self.registry.set_formatters.insert(name, f);
        self
    }

    pub fn virtual_formatter(mut self, name: &str, f: VirtualFormatter) -> Self {
        self.registry.virtual_formatters.insert(name, f);
        self
    }

    pub fn schema_plugin(mut self, name: &str, f: SchemaPlugin) -> Self {
        self.registry.schema_plugins.insert(name, f);
        self
    }

    pub fn definition(mut self, source: impl Into<DefinitionSource>) -> Self {
        self.definitions.push(source.into());
        self
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    /// Registry entries and definitions known up front
    fn exports(&self) -> PluginExports {
        PluginExports::default()
    }

    /// Asynchronous setup; may add definitions and registry entries through `ctx`
    async fn load(&self, _ctx: &mut PluginContext<'_>, _options: &Value) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Plugin for PluginExports {
    fn exports(&self) -> PluginExports {
        self.clone()
    }
}

/// A plugin as registered on the repository
#[derive(Clone)]
pub struct PluginRecord {
    pub name: String,
    pub plugin: Arc<dyn Plugin>,
    pub options: Value,
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}

/// What one plugin added during a load pass
#[derive(Debug, Default)]
pub struct Contribution {
    pub plugin: String,
    pub registry: Registry,
    pub definitions: Vec<(Definition, DefinitionDefaults)>,
}

/// Handed to [`Plugin::load`]. Writes go to the plugin's own contribution.
pub struct PluginContext<'a> {
    resolver: &'a DefinitionResolver,
    defaults: DefinitionDefaults,
    contribution: Contribution,
}

impl<'a> PluginContext<'a> {
    fn new(plugin: &str, resolver: &'a DefinitionResolver, defaults: DefinitionDefaults) -> Self {
        PluginContext {
            resolver,
            defaults,
            contribution: Contribution {
                plugin: plugin.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.contribution.plugin
    }

    /// Registry entries this plugin contributes
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.contribution.registry
    }

    pub fn add_definition(&mut self, definition: Definition) {
        self.contribution
            .definitions
            .push((definition, self.defaults.clone()));
    }

    /// Parse and add a YAML or JSON definition document
    pub fn add_definition_str(&mut self, document: &str) -> Result<()> {
        let definition = parse_definition_str(document)?;
        self.add_definition(definition);
        Ok(())
    }

    pub fn add_definition_value(&mut self, value: Value) -> Result<()> {
        let definition = parse_definition_value(value)?;
        self.add_definition(definition);
        Ok(())
    }

    /// Resolve a path, glob or URL and add every definition it yields
    pub async fn add_definition_uri(&mut self, locator: &str) -> Result<()> {
        let resolved = self.resolver.resolve(locator, &self.defaults).await?;
        self.contribution.definitions.extend(resolved);
        Ok(())
    }

    async fn add_sources(&mut self, sources: Vec<DefinitionSource>) -> Result<()> {
        let resolver = self.resolver;
        let defaults = &self.defaults;
        let resolved = try_join_all(sources.into_iter().map(|source| async move {
            match source {
                DefinitionSource::Inline(definition) => Ok(vec![(definition, defaults.clone())]),
                DefinitionSource::Locator(locator) => resolver.resolve(&locator, defaults).await,
            }
        }))
        .await?;
        self.contribution
            .definitions
            .extend(resolved.into_iter().flatten());
        Ok(())
    }
}

async fn collect(record: &PluginRecord, resolver: &DefinitionResolver) -> Result<Contribution> {
    let exports = record.plugin.exports();
    let mut ctx = PluginContext::new(
        &record.name,
        resolver,
        DefinitionDefaults::from_options(&record.options),
    );
    ctx.contribution.registry.merge(exports.registry);
    ctx.add_sources(exports.definitions).await?;
    record.plugin.load(&mut ctx, &record.options).await?;

    log::debug!(
        "Plugin {} contributed {} definition(s)",
        record.name,
        ctx.contribution.definitions.len()
    );
    Ok(ctx.contribution)
}

/// Run every plugin, merge their registries over the defaults in registration
/// order, then compile all contributed definitions into a fresh catalog.
/// Any failure fails the whole pass.
pub async fn load_plugins(records: &[PluginRecord], resolver: &DefinitionResolver) -> Result<(Registry, Catalog)> {
    let contributions = try_join_all(records.iter().map(|record| collect(record, resolver))).await?;

    let mut registry = Registry::with_defaults();
    let mut pending = Vec::new();
    for contribution in contributions {
        registry.merge(contribution.registry);
        pending.push((contribution.plugin, contribution.definitions));
    }

    let mut catalog = Catalog::new();
    for (plugin, definitions) in pending {
        for (definition, defaults) in definitions {
            let Some(entry) = SchemaEntry::compile(definition, &defaults, &registry)? else {
                continue;
            };
            let key = format!("{}.{}", entry.db, entry.name);
            if catalog.insert(entry).is_some() {
                log::warn!("Definition {key} redefined by plugin {plugin}; last registration wins");
            }
        }
    }

    log::info!(
        "Loaded {} plugin(s), {} schema(s)",
        records.len(),
        catalog.len()
    );
    Ok((registry, catalog))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::validator;
    use crate::schema::parse_definition_str;
    use serde_json::json;
    use std::time::Duration;

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        async fn fetch_text(&self, url: &str) -> Result<String> {
            Err(crate::error::RepoError::Other(format!("offline: {url}")))
        }
    }

    fn resolver() -> DefinitionResolver {
        DefinitionResolver::new(".", Arc::new(NoFetch))
    }

    fn record(name: &str, plugin: impl Plugin + 'static, options: Value) -> PluginRecord {
        PluginRecord {
            name: name.into(),
            plugin: Arc::new(plugin),
            options,
        }
    }

    /// Registers its validator only after a delay
    struct SlowValidators;

    #[async_trait]
    impl Plugin for SlowValidators {
        async fn load(&self, ctx: &mut PluginContext<'_>, _options: &Value) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.registry_mut()
                .validators
                .insert("isPositive", validator(|v| v.as_f64().is_some_and(|n| n > 0.0)));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_validator_visible_across_plugins() {
        let uses = PluginExports::new().definition(
            parse_definition_str("name: Account\nschema:\n  balance: { type: Number, validator: isPositive }").unwrap(),
        );
        let records = vec![
            record("uses", uses, json!({ "db": "test" })),
            record("slow", SlowValidators, Value::Null),
        ];

        let (registry, catalog) = load_plugins(&records, &resolver()).await.unwrap();
        assert!(registry.validators.contains("isPositive"));
        assert!(registry.validators.contains("isEmail"));
        let balance = catalog.get("test", "Account").unwrap().schema.field("balance").unwrap().clone();
        assert!(balance.validator.unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let first = PluginExports::new()
            .definition(parse_definition_str("name: Foo\nschema: { a: String }").unwrap());
        let second = PluginExports::new()
            .definition(parse_definition_str("name: Foo\nschema: { b: String }").unwrap());
        let records = vec![
            record("first", first, json!({ "db": "test" })),
            record("second", second, json!({ "db": "test" })),
        ];

        let (_, catalog) = load_plugins(&records, &resolver()).await.unwrap();
        assert_eq!(catalog.len(), 1);
        let foo = catalog.get("test", "Foo").unwrap();
        assert!(foo.schema.field("b").is_some());
        assert!(foo.schema.field("a").is_none());
    }

    struct Loader;

    #[async_trait]
    impl Plugin for Loader {
        async fn load(&self, ctx: &mut PluginContext<'_>, options: &Value) -> Result<()> {
            ctx.add_definition_str("name: FromStr\nschema: { a: String }")?;
            ctx.add_definition_value(json!({ "name": "FromValue", "schema": { "b": "Number" } }))?;
            ctx.add_definition(Definition { name: Some("NoSchema".into()), ..Default::default() });
            assert_eq!(options["db"], json!("test"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_context_definitions() {
        let (_, catalog) = load_plugins(&[record("loader", Loader, json!({ "db": "test" }))], &resolver())
            .await
            .unwrap();
        let names: Vec<_> = catalog.db("test").map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["FromStr", "FromValue"]);
    }

    #[tokio::test]
    async fn test_failure_fails_pass() {
        let broken = PluginExports::new().definition("missing/definition.yml");
        let err = load_plugins(&[record("broken", broken, Value::Null)], &resolver()).await;
        assert!(err.is_err());
    }
}
