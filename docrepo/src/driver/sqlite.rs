use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use super::{Collection, Connection, ConnectionEvent, Driver, LinkState};
use crate::error::{RepoError, Result};
use crate::pool::ConnectionTarget;

/// Driver for `sqlite://<host>/<namespace>`. Host `memory` opens an in-memory
/// database; any other host is a file `<data_dir>/<host>.db`.
pub struct SqliteDriver {
    data_dir: PathBuf,
}

impl SqliteDriver {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        SqliteDriver {
            data_dir: data_dir.into(),
        }
    }
}

impl Default for SqliteDriver {
    fn default() -> Self {
        SqliteDriver::new(".")
    }
}

impl Driver for SqliteDriver {
    fn create_connection(
        &self,
        target: &ConnectionTarget,
        options: &Map<String, Value>,
    ) -> Result<Arc<dyn Connection>> {
        let conn = if target.host == "memory" {
            rusqlite::Connection::open_in_memory()?
        } else {
            std::fs::create_dir_all(&self.data_dir)?;
            rusqlite::Connection::open(self.data_dir.join(format!("{}.db", target.host)))?
        };
        initialize_tables(&conn)?;

        let link = LinkState::new(&target.host, options);
        // The file is already open; report it once subscribers had a chance to attach
        let opening = link.clone();
        tokio::spawn(async move {
            opening.emit(ConnectionEvent::Open);
        });

        Ok(Arc::new(SqliteConnection {
            link,
            conn: Arc::new(Mutex::new(Some(conn))),
            namespace: target.namespace.clone(),
        }))
    }
}

fn initialize_tables(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS documents (
            namespace TEXT NOT NULL,
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data_json TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (namespace, collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(namespace, collection);
        ",
    )?;
    Ok(())
}

type SharedConn = Arc<Mutex<Option<rusqlite::Connection>>>;

pub struct SqliteConnection {
    link: Arc<LinkState>,
    conn: SharedConn,
    namespace: String,
}

#[async_trait]
impl Connection for SqliteConnection {
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
        Arc::new(SqliteConnection {
            link: self.link.clone(),
            conn: self.conn.clone(),
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
        Arc::new(SqliteCollection {
            conn: self.conn.clone(),
            namespace: self.namespace.clone(),
            name: name.to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        let taken = self
            .conn
            .lock()
            .map_err(|_| RepoError::Transport("sqlite connection poisoned".into()))?
            .take();
        if let Some(conn) = taken {
            conn.close().map_err(|(_, e)| RepoError::Sqlite(e))?;
        }
        self.link.close();
        Ok(())
    }
}

struct SqliteCollection {
    conn: SharedConn,
    namespace: String,
    name: String,
}

impl SqliteCollection {
    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| RepoError::Transport("sqlite connection poisoned".into()))?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(RepoError::Transport("sqlite connection is closed".into())),
        }
    }
}

fn parse_doc(data_json: &str) -> Result<Map<String, Value>> {
    Ok(serde_json::from_str(data_json)?)
}

#[async_trait]
impl Collection for SqliteCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn upsert(&self, id: &str, doc: &Map<String, Value>) -> Result<()> {
        let data_json = serde_json::to_string(doc)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO documents (namespace, collection, id, data_json) VALUES (?1, ?2, ?3, ?4)",
                params![self.namespace, self.name, id, data_json],
            )?;
            Ok(())
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        let data_json: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT data_json FROM documents WHERE namespace = ?1 AND collection = ?2 AND id = ?3",
                    params![self.namespace, self.name, id],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        data_json.as_deref().map(parse_doc).transpose()
    }

    async fn list(&self) -> Result<Vec<Map<String, Value>>> {
        let rows: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT data_json FROM documents WHERE namespace = ?1 AND collection = ?2 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![self.namespace, self.name], |row| row.get(0))?;

            let mut docs = Vec::new();
            for row in rows {
                docs.push(row?);
            }
            Ok(docs)
        })?;
        rows.iter().map(|json| parse_doc(json)).collect()
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM documents WHERE namespace = ?1 AND collection = ?2 AND id = ?3",
                params![self.namespace, self.name, id],
            )?;
            Ok(removed > 0)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_crud_in_memory() {
        let target = ConnectionTarget::parse("sqlite://memory/app").unwrap();
        let conn = SqliteDriver::default()
            .create_connection(&target, &Map::new())
            .unwrap();
        let users = conn.collection("User");

        users.upsert("b", &doc(json!({ "_id": "b", "n": 2 }))).await.unwrap();
        users.upsert("a", &doc(json!({ "_id": "a", "n": 1 }))).await.unwrap();
        users.upsert("a", &doc(json!({ "_id": "a", "n": 3 }))).await.unwrap();

        let all = users.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["n"], json!(3));
        assert!(users.remove("a").await.unwrap());
        assert!(!users.remove("a").await.unwrap());
        assert!(users.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespaces_share_file() {
        let tmp = TempDir::new().unwrap();
        let driver = SqliteDriver::new(tmp.path());
        let target = ConnectionTarget::parse("sqlite://local/one").unwrap();
        let one = driver.create_connection(&target, &Map::new()).unwrap();
        let two = one.use_db("two");

        one.collection("Foo").upsert("1", &doc(json!({ "v": "one" }))).await.unwrap();
        two.collection("Foo").upsert("1", &doc(json!({ "v": "two" }))).await.unwrap();

        assert_eq!(one.collection("Foo").get("1").await.unwrap().unwrap()["v"], json!("one"));
        assert_eq!(two.collection("Foo").get("1").await.unwrap().unwrap()["v"], json!("two"));
        assert!(tmp.path().join("local.db").exists());

        one.close().await.unwrap();
        two.close().await.unwrap();
        assert!(two.collection("Foo").get("1").await.is_err());
    }
}
