//! Storage drivers.
//!
//! A [`Driver`] opens physical connections for one connection-string scheme.
//! Opening happens in the background: `create_connection` returns at once and
//! progress is reported on the connection's event stream.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::pool::ConnectionTarget;

/// Lifecycle events of a physical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    /// A transient transport error; the driver keeps retrying
    Error(String),
    /// The driver gave up reconnecting
    Disconnected,
    /// Closed on request
    Closed,
}

pub trait Driver: Send + Sync {
    /// Start opening a physical connection to `target.host`, selecting
    /// `target.namespace`. Must be called from within a tokio runtime.
    fn create_connection(
        &self,
        target: &ConnectionTarget,
        options: &Map<String, Value>,
    ) -> Result<Arc<dyn Connection>>;
}

/// A handle on a physical connection, scoped to one namespace
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identity of the underlying physical connection, shared by `use_db` handles
    fn physical_id(&self) -> u64;

    fn host(&self) -> &str;

    fn namespace(&self) -> &str;

    /// A handle on another namespace over the same physical connection
    fn use_db(&self, namespace: &str) -> Arc<dyn Connection>;

    fn is_open(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;

    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    /// Close the physical connection. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// Document storage for one model within a namespace
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    async fn upsert(&self, id: &str, doc: &Map<String, Value>) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Map<String, Value>>>;

    async fn list(&self) -> Result<Vec<Map<String, Value>>>;

    async fn remove(&self, id: &str) -> Result<bool>;
}

static NEXT_PHYSICAL_ID: AtomicU64 = AtomicU64::new(1);

/// Open/closed flags and the event stream shared by every handle on one
/// physical connection.
pub struct LinkState {
    id: u64,
    host: String,
    open: AtomicBool,
    closed: AtomicBool,
    debug: bool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl LinkState {
    pub fn new(host: &str, options: &Map<String, Value>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(LinkState {
            id: NEXT_PHYSICAL_ID.fetch_add(1, Ordering::Relaxed),
            host: host.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            debug: options.get("debug").and_then(Value::as_bool).unwrap_or(false),
            events,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Record an event. The open flag is updated before the event is sent so a
    /// subscriber that checks `is_open` after subscribing never misses `Open`.
    pub fn emit(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Open => self.open.store(true, Ordering::SeqCst),
            ConnectionEvent::Disconnected => self.open.store(false, Ordering::SeqCst),
            ConnectionEvent::Closed => {
                self.open.store(false, Ordering::SeqCst);
                self.closed.store(true, Ordering::SeqCst);
            }
            ConnectionEvent::Error(_) => {}
        }
        if self.debug {
            log::debug!("[{}#{}] {:?}", self.host, self.id, event);
        }
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Mark closed; returns false when it already was
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.emit(ConnectionEvent::Closed);
        true
    }
}
