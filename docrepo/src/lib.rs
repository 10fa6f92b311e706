pub mod schema;
pub mod template;
pub mod registry;
pub mod compiler;
pub mod validation;
pub mod model;
pub mod catalog;
pub mod plugin;
pub mod driver;
pub mod pool;
pub mod config;
pub mod repository;
pub mod error;

pub use catalog::{Catalog, SchemaEntry, SchemaQuery};
pub use compiler::CompiledSchema;
pub use config::{FatalPolicy, RepositoryConfig};
pub use error::{FatalError, RepoError, Result};
pub use model::{Model, ModelMap, Record};
pub use plugin::{Plugin, PluginContext, PluginExports};
pub use registry::Registry;
pub use repository::{
    configure, connection_ready, connections, disconnect, models, plugin, schemas, Repository,
};
pub use schema::Definition;
