// One-way hashing for fields marked `bcrypt: true`, at any nesting depth.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::builder::{FieldNode, SchemaBuilder};
use crate::error::{RepoError, Result};
use crate::registry::{schema_plugin, SchemaPlugin};

/// Work factor used when the compiler attaches the hashing plugin
pub const HASH_ROUNDS: u32 = 8;

pub const PLUGIN_NAME: &str = "bcrypt";

pub fn default_options() -> Value {
    json!({ "rounds": HASH_ROUNDS })
}

/// Whether any leaf of the tree, including inside repeated sub-documents, is marked for hashing
pub fn has_hashed_fields(fields: &BTreeMap<String, FieldNode>) -> bool {
    fields.values().any(node_has_hashed)
}

fn node_has_hashed(node: &FieldNode) -> bool {
    match node {
        FieldNode::Leaf(spec) => spec.bcrypt,
        FieldNode::Repeated(inner) => node_has_hashed(inner),
        FieldNode::SubDocument(children) => has_hashed_fields(children),
    }
}

/// The schema plugin: hashes marked leaves before every save and adds a
/// `verify<Field>` method for each marked top-level field.
pub fn plugin() -> SchemaPlugin {
    schema_plugin(|schema: &mut SchemaBuilder, options: &Value| {
        let rounds = options
            .get("rounds")
            .and_then(Value::as_u64)
            .map_or(HASH_ROUNDS, |r| r as u32);
        let fields = schema.fields().clone();

        let top_level: Vec<String> = fields
            .iter()
            .filter(|(_, node)| matches!(node, FieldNode::Leaf(spec) if spec.bcrypt))
            .map(|(name, _)| name.clone())
            .collect();

        // Values already in bcrypt format are left alone; this stands in for
        // change tracking, so a plaintext that looks like a bcrypt hash is
        // stored as given.
        schema.pre_save(move |doc| hash_fields(&fields, doc, rounds));

        for field in top_level {
            let method_name = format!("verify{}", capitalize(&field));
            schema.method(method_name, move |record, args| {
                let plaintext = args.first().and_then(Value::as_str).ok_or_else(|| {
                    RepoError::Other(format!("verify{} expects a string argument", capitalize(&field)))
                })?;
                let verified = record.verify(&field, plaintext)?;
                Ok(Value::Bool(verified))
            });
        }
    })
}

fn hash_fields(
    fields: &BTreeMap<String, FieldNode>,
    doc: &mut Map<String, Value>,
    rounds: u32,
) -> Result<()> {
    for (name, node) in fields {
        if let Some(value) = doc.get_mut(name) {
            hash_node(node, value, rounds)?;
        }
    }
    Ok(())
}

fn hash_node(node: &FieldNode, value: &mut Value, rounds: u32) -> Result<()> {
    match node {
        FieldNode::Leaf(spec) if spec.bcrypt => {
            if let Value::String(plain) = value {
                if !is_hashed(plain) {
                    *plain = bcrypt::hash(plain.as_str(), rounds)?;
                }
            }
        }
        FieldNode::Leaf(_) => {}
        FieldNode::Repeated(inner) => {
            if let Value::Array(items) = value {
                for item in items {
                    hash_node(inner, item, rounds)?;
                }
            }
        }
        FieldNode::SubDocument(children) => {
            if let Value::Object(map) = value {
                hash_fields(children, map, rounds)?;
            }
        }
    }
    Ok(())
}

/// Whether a value already carries a bcrypt hash, so saves do not hash twice
pub fn is_hashed(value: &str) -> bool {
    value.len() == 60
        && (value.starts_with("$2a$") || value.starts_with("$2b$") || value.starts_with("$2y$"))
}

pub fn verify(plaintext: &str, hash: &str) -> Result<bool> {
    Ok(bcrypt::verify(plaintext, hash)?)
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::normalize;

    fn tree(value: Value) -> BTreeMap<String, FieldNode> {
        normalize(value.as_object().unwrap()).unwrap()
    }

    #[test]
    fn test_detects_nested_hashed_fields() {
        let fields = tree(json!({
            "profile": { "accounts": [{ "secret": { "type": "String", "bcrypt": true } }] }
        }));
        assert!(has_hashed_fields(&fields));

        let plain = tree(json!({ "profile": { "name": "String" } }));
        assert!(!has_hashed_fields(&plain));
    }

    #[test]
    fn test_hashes_every_depth_once() {
        let fields = tree(json!({
            "password": { "type": "String", "bcrypt": true },
            "accounts": [{ "pin": { "type": "String", "bcrypt": true }, "label": "String" }]
        }));
        let mut doc = json!({
            "password": "secret",
            "accounts": [{ "pin": "1234", "label": "main" }]
        })
        .as_object()
        .unwrap()
        .clone();

        hash_fields(&fields, &mut doc, 4).unwrap();
        let password = doc["password"].as_str().unwrap().to_string();
        let pin = doc["accounts"][0]["pin"].as_str().unwrap().to_string();
        assert!(is_hashed(&password));
        assert!(is_hashed(&pin));
        assert_eq!(doc["accounts"][0]["label"], json!("main"));
        assert!(verify("secret", &password).unwrap());
        assert!(verify("1234", &pin).unwrap());

        // A second pass leaves existing hashes alone
        hash_fields(&fields, &mut doc, 4).unwrap();
        assert_eq!(doc["password"].as_str().unwrap(), password);
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("password"), "Password");
        assert_eq!(capitalize(""), "");
    }
}
