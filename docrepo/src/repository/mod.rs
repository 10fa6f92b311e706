//! The process-facing entry point: configure once, register plugins, then
//! ask for schemas, models and connections. Loading and wiring happen lazily
//! on first use and at most once; a failed attempt leaves nothing behind so
//! the next call retries.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tokio::sync::broadcast;

use crate::catalog::{Catalog, SchemaQuery};
use crate::config::RepositoryConfig;
use crate::driver::memory::MemoryDriver;
use crate::driver::sqlite::SqliteDriver;
use crate::driver::{Connection, Driver};
use crate::error::{FatalError, RepoError, Result};
use crate::model::{Model, ModelMap};
use crate::plugin::{load_plugins, DefinitionResolver, Fetcher, HttpFetcher, Plugin, PluginRecord};
use crate::pool::{DriverSet, FatalSink, Pool};
use crate::registry::Registry;

struct Loaded {
    registry: Registry,
    catalog: Catalog,
}

struct Wired {
    pool: Pool,
    models: BTreeMap<String, Arc<ModelMap>>,
}

struct Inner {
    config: RwLock<Option<RepositoryConfig>>,
    plugins: Mutex<Vec<PluginRecord>>,
    drivers: DriverSet,
    fetcher: Arc<dyn Fetcher>,
    loaded: tokio::sync::Mutex<Option<Arc<Loaded>>>,
    wired: tokio::sync::Mutex<Option<Arc<Wired>>>,
    fatal_tx: broadcast::Sender<FatalError>,
}

#[derive(Clone)]
pub struct Repository {
    inner: Arc<Inner>,
}

/// Builds a [`Repository`] with custom drivers or fetcher
pub struct RepositoryBuilder {
    drivers: DriverSet,
    fetcher: Arc<dyn Fetcher>,
}

impl RepositoryBuilder {
    /// Register (or replace) the driver for a connection-string scheme
    pub fn driver(mut self, scheme: &str, driver: Arc<dyn Driver>) -> Self {
        self.drivers.insert(scheme.to_ascii_lowercase(), driver);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn build(self) -> Repository {
        let (fatal_tx, _) = broadcast::channel(16);
        Repository {
            inner: Arc::new(Inner {
                config: RwLock::new(None),
                plugins: Mutex::new(Vec::new()),
                drivers: self.drivers,
                fetcher: self.fetcher,
                loaded: tokio::sync::Mutex::new(None),
                wired: tokio::sync::Mutex::new(None),
                fatal_tx,
            }),
        }
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository {
    /// A repository with the `memory` and `sqlite` drivers and an HTTP fetcher
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RepositoryBuilder {
        let mut drivers = DriverSet::new();
        drivers.insert("memory".into(), Arc::new(MemoryDriver::new()) as Arc<dyn Driver>);
        drivers.insert("sqlite".into(), Arc::new(SqliteDriver::default()) as Arc<dyn Driver>);
        RepositoryBuilder {
            drivers,
            fetcher: Arc::new(HttpFetcher::new()),
        }
    }

    /// The process-wide instance
    pub fn global() -> &'static Repository {
        static GLOBAL: OnceLock<Repository> = OnceLock::new();
        GLOBAL.get_or_init(Repository::new)
    }

    /// Store the configuration. Nothing is validated or opened until first use;
    /// a configuration set after wiring does not rewire.
    pub fn configure(&self, config: RepositoryConfig) {
        if let Ok(mut slot) = self.inner.config.write() {
            *slot = Some(config);
        }
    }

    /// Register a plugin. Registration order decides which contribution wins
    /// when two plugins define the same thing.
    pub fn plugin(&self, name: &str, plugin: impl Plugin + 'static, options: Value) {
        self.plugin_arc(name, Arc::new(plugin), options);
    }

    pub fn plugin_arc(&self, name: &str, plugin: Arc<dyn Plugin>, options: Value) {
        if let Ok(mut plugins) = self.inner.plugins.lock() {
            plugins.push(PluginRecord {
                name: name.to_string(),
                plugin,
                options,
            });
        }
    }

    /// Compiled schemas selected by `query`, loading plugins on first use
    pub async fn schemas(&self, query: &SchemaQuery) -> Result<Catalog> {
        let loaded = self.ensure_loaded().await?;
        Ok(loaded.catalog.select(query))
    }

    /// The registries as merged by the last successful load
    pub async fn registry(&self) -> Result<Registry> {
        Ok(self.ensure_loaded().await?.registry.clone())
    }

    pub async fn is_loaded(&self) -> bool {
        self.inner.loaded.lock().await.is_some()
    }

    /// Bound models of a configured db, wiring connections on first use
    pub async fn models(&self, db: &str) -> Result<Arc<ModelMap>> {
        let wired = self.ensure_wired().await?;
        wired
            .models
            .get(db)
            .cloned()
            .ok_or_else(|| RepoError::Config(format!("Unknown db '{db}'")))
    }

    /// Convenience lookup of one model
    pub async fn model(&self, db: &str, name: &str) -> Result<Arc<Model>> {
        self.models(db)
            .await?
            .get(name)
            .cloned()
            .ok_or_else(|| RepoError::Config(format!("No model '{name}' in db '{db}'")))
    }

    pub async fn connections(&self, db: &str) -> Result<Arc<dyn Connection>> {
        let wired = self.ensure_wired().await?;
        wired
            .pool
            .connection(db)
            .ok_or_else(|| RepoError::Config(format!("Unknown db '{db}'")))
    }

    /// Resolve once the db's connection reports open
    pub async fn connection_ready(&self, db: &str) -> Result<()> {
        let wired = self.ensure_wired().await?;
        wired.pool.ready(db).await
    }

    /// Close every physical connection. Without wiring this is a no-op.
    pub async fn disconnect(&self) -> Result<()> {
        let wired = self.inner.wired.lock().await.clone();
        match wired {
            Some(wired) => {
                wired.pool.close_all().await?;
                log::info!("Disconnected from {} host(s)", wired.pool.physical_count());
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Fatal pool conditions, delivered when the policy is `notify`
    pub fn fatal_errors(&self) -> broadcast::Receiver<FatalError> {
        self.inner.fatal_tx.subscribe()
    }

    fn config(&self) -> Result<RepositoryConfig> {
        self.inner
            .config
            .read()
            .ok()
            .and_then(|config| config.clone())
            .ok_or_else(|| RepoError::Config("Must set repository configuration via configure".into()))
    }

    async fn ensure_loaded(&self) -> Result<Arc<Loaded>> {
        let config = self.config()?;
        let mut slot = self.inner.loaded.lock().await;
        if let Some(loaded) = slot.as_ref() {
            return Ok(loaded.clone());
        }

        let records = self
            .inner
            .plugins
            .lock()
            .map(|plugins| plugins.clone())
            .unwrap_or_default();
        let base_dir = match config.definitions_dir {
            Some(dir) => dir,
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };
        let resolver = DefinitionResolver::new(base_dir, self.inner.fetcher.clone());

        let (registry, catalog) = load_plugins(&records, &resolver).await?;
        let loaded = Arc::new(Loaded { registry, catalog });
        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    async fn ensure_wired(&self) -> Result<Arc<Wired>> {
        let loaded = self.ensure_loaded().await?;
        let mut slot = self.inner.wired.lock().await;
        if let Some(wired) = slot.as_ref() {
            return Ok(wired.clone());
        }

        let config = self.config()?;
        let fatal = FatalSink::new(config.fatal_policy, self.inner.fatal_tx.clone());
        let pool = Pool::connect(&config, &self.inner.drivers, fatal)?;
        let models = bind_models(&loaded.catalog, &pool);

        let wired = Arc::new(Wired { pool, models });
        *slot = Some(wired.clone());
        Ok(wired)
    }
}

/// Bind every compiled schema to its db's connection and give each schema
/// a handle on its db's model map.
fn bind_models(catalog: &Catalog, pool: &Pool) -> BTreeMap<String, Arc<ModelMap>> {
    let mut bound = BTreeMap::new();
    for db in pool.dbs() {
        let Some(connection) = pool.connection(db) else {
            continue;
        };
        let mut models = ModelMap::new();
        for entry in catalog.db(db) {
            for model_name in &entry.models {
                let model = Model::bind(model_name, db, entry.schema.clone(), &connection);
                models.insert(model_name.clone(), Arc::new(model));
            }
        }
        let models = Arc::new(models);
        for entry in catalog.db(db) {
            entry.schema.bind_models(&models);
        }
        log::debug!("Bound {} model(s) for db {db}", models.len());
        bound.insert(db.to_string(), models);
    }

    for db in catalog.dbs() {
        if !bound.contains_key(db) {
            log::warn!("Schemas for db {db} have no configured connection; not bound");
        }
    }
    bound
}

/// Configure the global repository
pub fn configure(config: RepositoryConfig) {
    Repository::global().configure(config)
}

/// Register a plugin on the global repository
pub fn plugin(name: &str, plugin: impl Plugin + 'static, options: Value) {
    Repository::global().plugin(name, plugin, options)
}

pub async fn schemas(query: &SchemaQuery) -> Result<Catalog> {
    Repository::global().schemas(query).await
}

pub async fn models(db: &str) -> Result<Arc<ModelMap>> {
    Repository::global().models(db).await
}

pub async fn connections(db: &str) -> Result<Arc<dyn Connection>> {
    Repository::global().connections(db).await
}

pub async fn connection_ready(db: &str) -> Result<()> {
    Repository::global().connection_ready(db).await
}

pub async fn disconnect() -> Result<()> {
    Repository::global().disconnect().await
}
