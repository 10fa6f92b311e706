//! Connection pool: one physical connection per host, one namespaced handle
//! and readiness gate per logical database.

mod gate;

pub use gate::ReadinessGate;

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::config::{self, FatalPolicy, RepositoryConfig};
use crate::driver::{Connection, ConnectionEvent, Driver};
use crate::error::{FatalError, RepoError, Result};

/// Drivers keyed by connection-string scheme
pub type DriverSet = BTreeMap<String, Arc<dyn Driver>>;

/// A parsed `scheme://host/namespace` connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub uri: String,
    pub scheme: String,
    /// Host and optional port
    pub host: String,
    pub namespace: String,
}

fn connection_string_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z][A-Za-z0-9+.-]*)://([^/]+)/(.*)$").expect("static regex is valid")
    })
}

impl ConnectionTarget {
    pub fn parse(uri: &str) -> Result<Self> {
        let caps = connection_string_re()
            .captures(uri)
            .ok_or_else(|| RepoError::Config(format!("Unknown connection string format: {uri}")))?;
        Ok(ConnectionTarget {
            uri: uri.to_string(),
            scheme: caps[1].to_ascii_lowercase(),
            host: caps[2].to_string(),
            namespace: caps[3].to_string(),
        })
    }

    /// Key under which physical connections are shared
    pub fn host_key(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }
}

/// Where fatal pool conditions go, per the configured policy
#[derive(Clone)]
pub struct FatalSink {
    policy: FatalPolicy,
    tx: broadcast::Sender<FatalError>,
}

impl FatalSink {
    pub fn new(policy: FatalPolicy, tx: broadcast::Sender<FatalError>) -> Self {
        FatalSink { policy, tx }
    }

    pub fn raise(&self, error: FatalError) {
        log::error!("{error}");
        match self.policy {
            FatalPolicy::Exit => std::process::exit(1),
            FatalPolicy::Notify => {
                if self.tx.send(error).is_err() {
                    log::warn!("No subscribers for fatal connection errors");
                }
            }
        }
    }
}

/// Live connections for every configured logical database
pub struct Pool {
    connections: BTreeMap<String, Arc<dyn Connection>>,
    physical: BTreeMap<String, Arc<dyn Connection>>,
    gates: BTreeMap<String, Arc<ReadinessGate>>,
    monitors: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Open connections for every db in `config.dbs`. All connection strings
    /// are parsed before anything is opened, so a bad string opens nothing.
    pub fn connect(config: &RepositoryConfig, drivers: &DriverSet, fatal: FatalSink) -> Result<Self> {
        let mut targets = Vec::with_capacity(config.dbs.len());
        for db in &config.dbs {
            let settings = config.settings(db)?;
            let target = ConnectionTarget::parse(&settings.connection_string)?;
            if !drivers.contains_key(&target.scheme) {
                return Err(RepoError::Config(format!(
                    "No driver registered for scheme '{}' (db '{db}')",
                    target.scheme
                )));
            }
            targets.push((db.clone(), target, &settings.options));
        }

        let mut pool = Pool {
            connections: BTreeMap::new(),
            physical: BTreeMap::new(),
            gates: BTreeMap::new(),
            monitors: Vec::new(),
        };
        let timeout = Duration::from_millis(config.connect_timeout_ms);

        for (db, target, db_options) in targets {
            let key = target.host_key();
            let connection = match pool.physical.get(&key) {
                Some(physical) => {
                    log::debug!("Reusing connection to {key} for db {db}");
                    physical.use_db(&target.namespace)
                }
                None => {
                    let driver = drivers
                        .get(&target.scheme)
                        .ok_or_else(|| RepoError::Config(format!("No driver for scheme '{}'", target.scheme)))?;
                    let options = connection_options(db_options);
                    log::debug!("Opening connection to {key} for db {db}");
                    let connection = driver.create_connection(&target, &options)?;
                    pool.physical.insert(key, connection.clone());
                    connection
                }
            };

            let gate = Arc::new(ReadinessGate::new());
            pool.monitors.push(monitor(
                db.clone(),
                connection.clone(),
                gate.clone(),
                timeout,
                fatal.clone(),
            ));
            pool.gates.insert(db.clone(), gate);
            pool.connections.insert(db, connection);
        }

        Ok(pool)
    }

    pub fn connection(&self, db: &str) -> Option<Arc<dyn Connection>> {
        self.connections.get(db).cloned()
    }

    pub fn gate(&self, db: &str) -> Option<Arc<ReadinessGate>> {
        self.gates.get(db).cloned()
    }

    pub fn dbs(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    /// Number of distinct physical connections
    pub fn physical_count(&self) -> usize {
        self.physical.len()
    }

    /// Resolve once `db`'s connection has opened
    pub async fn ready(&self, db: &str) -> Result<()> {
        let (Some(connection), Some(gate)) = (self.connections.get(db), self.gates.get(db)) else {
            return Err(RepoError::Config(format!("Unknown db '{db}'")));
        };
        if connection.is_open() {
            gate.open();
        }
        gate.wait().await;
        Ok(())
    }

    /// Close every physical connection once. Already-closed connections count as success.
    pub async fn close_all(&self) -> Result<()> {
        let closing = self.physical.iter().map(|(key, connection)| async move {
            if connection.is_closed() {
                log::debug!("Connection to {key} already closed");
                return Ok(());
            }
            connection.close().await
        });
        futures::future::try_join_all(closing).await?;
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for monitor in &self.monitors {
            monitor.abort();
        }
    }
}

/// Transport defaults, then per-db options, then env credentials and the debug flag
fn connection_options(db_options: &Map<String, Value>) -> Map<String, Value> {
    let mut options = config::default_connection_options();
    config::merge_options(&mut options, db_options);
    config::merge_options(&mut options, &config::credentials_from_env());
    if config::debug_enabled() {
        options.insert("debug".into(), Value::Bool(true));
    }
    options
}

/// Watch a db's connection: open its gate on `Open`, raise fatal errors on
/// timeout or when retries run out.
fn monitor(
    db: String,
    connection: Arc<dyn Connection>,
    gate: Arc<ReadinessGate>,
    timeout: Duration,
    fatal: FatalSink,
) -> JoinHandle<()> {
    let mut events = connection.subscribe();
    tokio::spawn(async move {
        // Open may have been emitted before we subscribed
        if connection.is_open() {
            gate.open();
        }
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                _ = &mut deadline, if !timed_out && !gate.is_open() => {
                    timed_out = true;
                    fatal.raise(FatalError::ConnectTimeout {
                        db: db.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
                event = events.recv() => match event {
                    Ok(ConnectionEvent::Open) => {
                        if gate.open() {
                            log::info!("Connected to db {db}");
                        }
                    }
                    Ok(ConnectionEvent::Error(message)) => {
                        log::error!("Connection error on db {db}: {message}");
                    }
                    Ok(ConnectionEvent::Disconnected) => {
                        fatal.raise(FatalError::RetriesExhausted { db: db.clone() });
                    }
                    Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Missed {skipped} connection events for db {db}");
                        if connection.is_open() {
                            gate.open();
                        }
                    }
                },
            }
        }
        log::debug!("Stopped watching db {db}");
    })
}
