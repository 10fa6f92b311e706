use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{RepoError, Result};

/// Environment variable holding the application user merged into connection options
pub const ENV_APP_USER: &str = "DB_APP_USER";
/// Environment variable holding the application password merged into connection options
pub const ENV_APP_PASSWORD: &str = "DB_APP_PASSWORD";
/// Fallback db for definitions that name none
pub const ENV_DATABASE_NAME: &str = "DATABASE_NAME";
/// Comma separated debug tags; `*` or `docrepo` enables verbose driver logging
pub const ENV_DEBUG: &str = "DEBUG";

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 60_000;

/// Repository configuration:
/// `{ dbs: [name...], <name>: { connectionString, options } }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    pub dbs: Vec<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub fatal_policy: FatalPolicy,
    /// Base directory for relative definition locators; defaults to the working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definitions_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub databases: BTreeMap<String, DbSettings>,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSettings {
    /// `scheme://host[:port]/namespace`
    pub connection_string: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// What to do when a physical connection becomes unusable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalPolicy {
    /// Log and terminate the process
    #[default]
    Exit,
    /// Broadcast to `Repository::fatal_errors` subscribers and keep running
    Notify,
}

impl RepositoryConfig {
    pub fn new() -> Self {
        RepositoryConfig {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            ..Default::default()
        }
    }

    /// Parse a YAML (or JSON) configuration document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: RepositoryConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_json_value(value: Value) -> Result<Self> {
        let config: RepositoryConfig = serde_json::from_value(value)?;
        Ok(config)
    }

    /// Add a logical database with its connection string
    pub fn database(mut self, name: &str, connection_string: &str) -> Self {
        self.dbs.push(name.to_string());
        self.databases.insert(
            name.to_string(),
            DbSettings {
                connection_string: connection_string.to_string(),
                options: Map::new(),
            },
        );
        self
    }

    /// Add a logical database with per-database connection options
    pub fn database_with_options(mut self, name: &str, connection_string: &str, options: Value) -> Self {
        self = self.database(name, connection_string);
        if let (Some(settings), Value::Object(options)) = (self.databases.get_mut(name), options) {
            settings.options = options;
        }
        self
    }

    pub fn connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }

    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }

    pub fn definitions_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.definitions_dir = Some(dir.into());
        self
    }

    pub fn settings(&self, db: &str) -> Result<&DbSettings> {
        self.databases
            .get(db)
            .ok_or_else(|| RepoError::Config(format!("No connection settings for db '{db}'")))
    }
}

/// Transport options every physical connection starts from
pub fn default_connection_options() -> Map<String, Value> {
    let defaults = json!({
        "keepAlive": 1000,
        "autoReconnect": true,
        "socketTimeoutMS": 0,
        "connectTimeoutMS": 0,
        "reconnectInterval": 2000,
        "useNewUrlParser": true,
    });
    match defaults {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Credentials sourced from the process environment, when present
pub fn credentials_from_env() -> Map<String, Value> {
    let mut auth = Map::new();
    if let Ok(user) = std::env::var(ENV_APP_USER) {
        auth.insert("user".into(), Value::String(user));
    }
    if let Ok(pass) = std::env::var(ENV_APP_PASSWORD) {
        auth.insert("pass".into(), Value::String(pass));
    }
    auth
}

/// Whether the debug variable asks for verbose driver logging
pub fn debug_enabled() -> bool {
    std::env::var(ENV_DEBUG)
        .map(|tags| debug_tags_match(&tags))
        .unwrap_or(false)
}

fn debug_tags_match(tags: &str) -> bool {
    tags.split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || tag == "docrepo" || tag == "docrepo:driver")
}

/// Deep merge `overlay` into `base`; objects merge recursively, everything else is replaced
pub fn merge_options(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_options(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = RepositoryConfig::from_yaml_str(
            r#"
dbs: [test, audit]
connectTimeoutMs: 500
fatalPolicy: notify
test:
  connectionString: memory://localhost/test
audit:
  connectionString: memory://localhost/audit
  options:
    poolSize: 4
"#,
        )
        .unwrap();

        assert_eq!(config.dbs, vec!["test", "audit"]);
        assert_eq!(config.connect_timeout_ms, 500);
        assert_eq!(config.fatal_policy, FatalPolicy::Notify);
        assert_eq!(
            config.settings("audit").unwrap().options["poolSize"],
            Value::from(4)
        );
        assert!(config.settings("missing").is_err());
    }

    #[test]
    fn test_defaults_when_omitted() {
        let config = RepositoryConfig::from_yaml_str(
            "dbs: [test]\ntest:\n  connectionString: memory://localhost/test\n",
        )
        .unwrap();
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(config.fatal_policy, FatalPolicy::Exit);
        assert!(config.definitions_dir.is_none());
    }

    #[test]
    fn test_builder() {
        let config = RepositoryConfig::new()
            .database("a", "memory://h1/a")
            .database_with_options("b", "memory://h1/b", json!({ "holdOpen": true }))
            .connect_timeout_ms(10);
        assert_eq!(config.dbs, vec!["a", "b"]);
        assert_eq!(config.settings("b").unwrap().options["holdOpen"], json!(true));
        assert_eq!(config.connect_timeout_ms, 10);
    }

    #[test]
    fn test_merge_options_deep() {
        let mut base = default_connection_options();
        let overlay = json!({ "keepAlive": 5, "tls": { "ca": "x" } });
        merge_options(&mut base, overlay.as_object().unwrap());
        merge_options(&mut base, json!({ "tls": { "cert": "y" } }).as_object().unwrap());

        assert_eq!(base["keepAlive"], json!(5));
        assert_eq!(base["autoReconnect"], json!(true));
        assert_eq!(base["tls"], json!({ "ca": "x", "cert": "y" }));
    }

    #[test]
    fn test_debug_tags() {
        assert!(debug_tags_match("*"));
        assert!(debug_tags_match("express, docrepo"));
        assert!(!debug_tags_match("express,other"));
    }
}
