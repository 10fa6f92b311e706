//! Models bound to a live connection, and the records they produce.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::compiler::{hashing, CompiledSchema};
use crate::driver::{Collection, Connection};
use crate::error::{RepoError, Result};
use crate::template;
use crate::validation;

/// Models of one logical database, keyed by model name
pub type ModelMap = BTreeMap<String, Arc<Model>>;

/// A document paired with the schema that gives it virtuals and methods
#[derive(Clone)]
pub struct Record {
    schema: Arc<CompiledSchema>,
    doc: Map<String, Value>,
}

impl Record {
    /// Wrap a raw document without running set formatters
    pub fn new(schema: Arc<CompiledSchema>, doc: Map<String, Value>) -> Self {
        Record { schema, doc }
    }

    pub fn schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    pub fn doc(&self) -> &Map<String, Value> {
        &self.doc
    }

    pub fn into_doc(self) -> Map<String, Value> {
        self.doc
    }

    pub fn id(&self) -> Option<&str> {
        self.doc.get("_id").and_then(Value::as_str)
    }

    /// Read a field. Virtuals shadow stored fields of the same name.
    pub fn get(&self, path: &str) -> Value {
        if let Some(getter) = self.schema.virtual_getter(path) {
            return getter(self);
        }
        template::lookup(&self.doc, path)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Write a field at a dotted path, running the leaf's set formatter.
    /// Intermediate objects are created as needed.
    pub fn set(&mut self, path: &str, value: Value) {
        let value = match self
            .schema
            .field(path)
            .and_then(|spec| spec.set.as_ref())
            .and_then(|set| set.func.as_ref())
        {
            Some(set) => set(value),
            None => value,
        };

        let mut target = &mut self.doc;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                target.insert(part.to_string(), value);
                return;
            }
            let entry = target
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            target = match entry {
                Value::Object(map) => map,
                _ => return,
            };
        }
    }

    /// Call an instance method defined by the schema or one of its plugins
    pub fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        let func = self.schema.method(method).ok_or_else(|| {
            RepoError::Other(format!("{} has no method '{method}'", self.schema.name()))
        })?;
        func(self, args)
    }

    /// Check a plaintext candidate against a hashed field
    pub fn verify(&self, path: &str, plaintext: &str) -> Result<bool> {
        match self.schema.field(path) {
            Some(spec) if spec.bcrypt => {}
            _ => {
                return Err(RepoError::Other(format!(
                    "Field '{path}' of {} is not hashed",
                    self.schema.name()
                )))
            }
        }
        match template::lookup(&self.doc, path).and_then(Value::as_str) {
            Some(hash) if hashing::is_hashed(hash) => hashing::verify(plaintext, hash),
            _ => Ok(false),
        }
    }

    /// Plain JSON form, optionally with every virtual evaluated
    pub fn to_json(&self, with_virtuals: bool) -> Value {
        let mut out = self.doc.clone();
        if with_virtuals {
            for name in self.schema.virtual_names() {
                if let Some(getter) = self.schema.virtual_getter(name) {
                    out.insert(name.to_string(), getter(self));
                }
            }
        }
        Value::Object(out)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("schema", &self.schema.name())
            .field("doc", &self.doc)
            .finish()
    }
}

/// A compiled schema bound to a collection on a live connection
pub struct Model {
    name: String,
    db: String,
    schema: Arc<CompiledSchema>,
    collection: Arc<dyn Collection>,
}

impl Model {
    pub(crate) fn bind(name: &str, db: &str, schema: Arc<CompiledSchema>, connection: &Arc<dyn Connection>) -> Self {
        Model {
            name: name.to_string(),
            db: db.to_string(),
            collection: connection.collection(name),
            schema,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    /// Every model bound in the same database, this one included
    pub fn siblings(&self) -> Option<Arc<ModelMap>> {
        self.schema.repository_models()
    }

    /// Build an unsaved record, running set formatters over the input
    pub fn new_record(&self, doc: Value) -> Result<Record> {
        let Value::Object(mut doc) = doc else {
            return Err(RepoError::Validation(format!(
                "{} documents must be objects",
                self.name
            )));
        };
        validation::apply_setters(self.schema.fields(), &mut doc);
        Ok(Record::new(self.schema.clone(), doc))
    }

    pub async fn create(&self, doc: Value) -> Result<Record> {
        let mut record = self.new_record(doc)?;
        self.save(&mut record).await?;
        Ok(record)
    }

    /// Assign an id if missing, run the save pipeline, then persist.
    /// The record is only updated once the write succeeds.
    pub async fn save(&self, record: &mut Record) -> Result<()> {
        let mut doc = record.doc.clone();
        let id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = self.schema.id_strategy().generate();
                doc.insert("_id".into(), Value::String(id.clone()));
                id
            }
        };

        // Hashing is CPU bound
        let schema = self.schema.clone();
        let doc = tokio::task::spawn_blocking(move || validation::prepare(&schema, doc))
            .await
            .map_err(|e| RepoError::Other(format!("save task for {} failed: {e}", self.name)))??;

        self.collection.upsert(&id, &doc).await?;
        log::debug!("Saved {}/{id} in {}", self.name, self.db);
        record.doc = doc;
        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Record>> {
        let doc = self.collection.get(id).await?;
        Ok(doc.map(|doc| Record::new(self.schema.clone(), doc)))
    }

    /// Like `find_by_id`, but a missing record is an error
    pub async fn get(&self, id: &str) -> Result<Record> {
        self.find_by_id(id).await?.ok_or_else(|| RepoError::NotFound {
            model: self.name.clone(),
            id: id.to_string(),
        })
    }

    pub async fn find_all(&self) -> Result<Vec<Record>> {
        let docs = self.collection.list().await?;
        Ok(docs
            .into_iter()
            .map(|doc| Record::new(self.schema.clone(), doc))
            .collect())
    }

    /// Returns whether a record was removed
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.collection.remove(id).await
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name)
            .field("db", &self.db)
            .field("collection", &self.collection.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::driver::memory::MemoryDriver;
    use crate::driver::Driver;
    use crate::pool::ConnectionTarget;
    use crate::registry::Registry;
    use crate::schema::parse_definition_str;
    use serde_json::json;

    fn user_schema() -> Arc<CompiledSchema> {
        let definition = parse_definition_str(
            r#"
name: User
nameProperty: profile.display
schema:
  email: { type: String, set: toLowerCase, required: true }
  password: { type: String, bcrypt: true }
  profile:
    display: String
  visits: { type: Number, default: 0 }
"#,
        )
        .unwrap();
        Arc::new(compile(&definition, &Registry::with_defaults()).unwrap())
    }

    fn model(schema: Arc<CompiledSchema>) -> Model {
        let target = ConnectionTarget::parse("memory://model-tests/app").unwrap();
        let connection = MemoryDriver::new()
            .create_connection(&target, &Map::new())
            .unwrap();
        Model::bind("User", "app", schema, &connection)
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut record = Record::new(user_schema(), Map::new());
        record.set("profile.display", json!("Ada"));
        record.set("email", json!("ADA@EXAMPLE.COM"));
        assert_eq!(record.get("profile.display"), json!("Ada"));
        assert_eq!(record.get("email"), json!("ada@example.com"));
        // nameProperty virtual
        assert_eq!(record.get("name"), json!("Ada"));
        assert_eq!(record.get("missing"), Value::Null);
    }

    #[test]
    fn test_verify_requires_hashed_field() {
        let record = Record::new(user_schema(), Map::new());
        assert!(record.verify("email", "x").is_err());
        assert!(!record.verify("password", "x").unwrap());
    }

    #[test]
    fn test_unknown_method() {
        let record = Record::new(user_schema(), Map::new());
        assert!(record.call("nope", &[]).is_err());
        assert!(record.schema().method("verifyPassword").is_some());
    }

    #[tokio::test]
    async fn test_save_pipeline() {
        let users = model(user_schema());
        let mut record = users
            .new_record(json!({ "email": "Bob@Example.com", "password": "hunter2" }))
            .unwrap();
        assert_eq!(record.get("email"), json!("bob@example.com"));

        users.save(&mut record).await.unwrap();
        let id = record.id().unwrap().to_string();
        assert_eq!(record.get("visits"), json!(0));
        assert_ne!(record.get("password"), json!("hunter2"));
        assert_eq!(
            record.call("verifyPassword", &[json!("hunter2")]).unwrap(),
            json!(true)
        );

        let loaded = users.get(&id).await.unwrap();
        assert_eq!(loaded.doc(), record.doc());

        // Saving again keeps the existing hash
        let mut again = loaded.clone();
        users.save(&mut again).await.unwrap();
        assert_eq!(again.get("password"), record.get("password"));

        assert!(users.delete(&id).await.unwrap());
        assert!(users.find_by_id(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_record_is_not_persisted() {
        let users = model(user_schema());
        let mut record = users.new_record(json!({ "password": "x" })).unwrap();
        let err = users.save(&mut record).await.unwrap_err();
        assert!(matches!(err, RepoError::Validation(_)));
        assert!(record.id().is_none());
        assert!(users.find_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_to_json_with_virtuals() {
        let mut record = Record::new(user_schema(), Map::new());
        record.set("profile.display", json!("Ada"));
        assert_eq!(record.to_json(false), json!({ "profile": { "display": "Ada" } }));
        assert_eq!(record.to_json(true)["name"], json!("Ada"));
    }
}
