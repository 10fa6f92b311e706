// In-process driver. Each host is a shared document space that outlives
// individual connections made through the same driver.
//
// Options:
//   openDelayMs: u64   delay before the connection reports Open
//   holdOpen:    bool  never report Open

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use super::{Collection, Connection, ConnectionEvent, Driver, LinkState};
use crate::error::{RepoError, Result};
use crate::pool::ConnectionTarget;

/// `(namespace, collection) -> id -> document`
type HostData = Mutex<HashMap<(String, String), BTreeMap<String, Map<String, Value>>>>;

#[derive(Default)]
pub struct MemoryDriver {
    hosts: Mutex<HashMap<String, Arc<HostData>>>,
    links: Mutex<Vec<Arc<LinkState>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical connections this driver has created
    pub fn connections_created(&self) -> usize {
        self.links.lock().map(|links| links.len()).unwrap_or(0)
    }

    /// Deliver an event to every live connection on `host`, as a real
    /// transport would when the server misbehaves.
    pub fn inject_event(&self, host: &str, event: ConnectionEvent) {
        let Ok(links) = self.links.lock() else {
            return;
        };
        for link in links.iter().filter(|l| l.host() == host && !l.is_closed()) {
            link.emit(event.clone());
        }
    }

    fn host_data(&self, host: &str) -> Result<Arc<HostData>> {
        let mut hosts = self
            .hosts
            .lock()
            .map_err(|_| RepoError::Transport("memory driver state poisoned".into()))?;
        Ok(hosts.entry(host.to_string()).or_default().clone())
    }
}

impl Driver for MemoryDriver {
    fn create_connection(
        &self,
        target: &ConnectionTarget,
        options: &Map<String, Value>,
    ) -> Result<Arc<dyn Connection>> {
        let link = LinkState::new(&target.host, options);
        let data = self.host_data(&target.host)?;
        if let Ok(mut links) = self.links.lock() {
            links.push(link.clone());
        }

        let hold_open = options.get("holdOpen").and_then(Value::as_bool).unwrap_or(false);
        let delay = options.get("openDelayMs").and_then(Value::as_u64).unwrap_or(0);
        if !hold_open {
            let opening = link.clone();
            tokio::spawn(async move {
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                if !opening.is_closed() {
                    opening.emit(ConnectionEvent::Open);
                }
            });
        }

        Ok(Arc::new(MemoryConnection {
            link,
            data,
            namespace: target.namespace.clone(),
        }))
    }
}

pub struct MemoryConnection {
    link: Arc<LinkState>,
    data: Arc<HostData>,
    namespace: String,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn physical_id(&self) -> u64 {
        self.link.id()
    }

    fn host(&self) -> &str {
        self.link.host()
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn use_db(&self, namespace: &str) -> Arc<dyn Connection> {
        Arc::new(MemoryConnection {
            link: self.link.clone(),
            data: self.data.clone(),
            namespace: namespace.to_string(),
        })
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn is_closed(&self) -> bool {
        self.link.is_closed()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.link.subscribe()
    }

    fn collection(&self, name: &str) -> Arc<dyn Collection> {
        Arc::new(MemoryCollection {
            link: self.link.clone(),
            data: self.data.clone(),
            key: (self.namespace.clone(), name.to_string()),
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.link.close() {
            log::debug!("Connection to {} already closed", self.link.host());
        }
        Ok(())
    }
}

struct MemoryCollection {
    link: Arc<LinkState>,
    data: Arc<HostData>,
    key: (String, String),
}

impl MemoryCollection {
    fn with_docs<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Map<String, Value>>) -> T) -> Result<T> {
        if self.link.is_closed() {
            return Err(RepoError::Transport(format!(
                "connection to {} is closed",
                self.link.host()
            )));
        }
        let mut data = self
            .data
            .lock()
            .map_err(|_| RepoError::Transport("memory driver state poisoned".into()))?;
        Ok(f(data.entry(self.key.clone()).or_default()))
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.key.1
    }

    async fn upsert(&self, id: &str, doc: &Map<String, Value>) -> Result<()> {
        self.with_docs(|docs| {
            docs.insert(id.to_string(), doc.clone());
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        self.with_docs(|docs| docs.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Map<String, Value>>> {
        self.with_docs(|docs| docs.values().cloned().collect())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.with_docs(|docs| docs.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connect(driver: &MemoryDriver, uri: &str, options: Value) -> Arc<dyn Connection> {
        let target = ConnectionTarget::parse(uri).unwrap();
        driver
            .create_connection(&target, options.as_object().unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_opens_in_background() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://h/a", json!({ "openDelayMs": 20 }));
        let mut events = conn.subscribe();
        assert!(!conn.is_open());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Open);
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let driver = MemoryDriver::new();
        let a = connect(&driver, "memory://h/a", json!({}));
        let b = a.use_db("b");
        assert_eq!(a.physical_id(), b.physical_id());

        let doc = json!({ "x": 1 }).as_object().unwrap().clone();
        a.collection("Foo").upsert("1", &doc).await.unwrap();
        assert!(b.collection("Foo").get("1").await.unwrap().is_none());
        assert_eq!(a.collection("Foo").list().await.unwrap(), vec![doc]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://h/a", json!({ "holdOpen": true }));
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert!(conn.collection("Foo").list().await.is_err());
    }

    #[tokio::test]
    async fn test_inject_event() {
        let driver = MemoryDriver::new();
        let conn = connect(&driver, "memory://flaky/a", json!({ "holdOpen": true }));
        let mut events = conn.subscribe();
        driver.inject_event("flaky", ConnectionEvent::Disconnected);
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);
        assert_eq!(driver.connections_created(), 1);
    }
}
