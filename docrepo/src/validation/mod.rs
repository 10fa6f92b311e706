use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::compiler::{CompiledSchema, FieldNode, FieldSpec, NativeType};
use crate::error::{RepoError, Result};

/// Result of validating a document
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Validate a document against a compiled field tree.
/// Type, `required`, `enum` and attached validators produce errors;
/// undeclared top-level fields produce warnings.
pub fn validate_document(fields: &BTreeMap<String, FieldNode>, doc: &Map<String, Value>) -> ValidationResult {
    let mut result = ValidationResult::default();
    validate_fields(fields, doc, "", &mut result);

    for key in doc.keys() {
        if key != "_id" && !fields.contains_key(key) {
            result.warnings.push(format!("Undeclared field '{key}'"));
        }
    }
    result
}

fn validate_fields(
    fields: &BTreeMap<String, FieldNode>,
    doc: &Map<String, Value>,
    prefix: &str,
    result: &mut ValidationResult,
) {
    for (name, node) in fields {
        let path = join(prefix, name);
        match doc.get(name) {
            None | Some(Value::Null) => {
                if let FieldNode::Leaf(spec) = node {
                    if spec.is_required() {
                        result.errors.push(format!("Required field '{path}' is missing"));
                    }
                }
            }
            Some(value) => validate_node(node, value, &path, result),
        }
    }
}

fn validate_node(node: &FieldNode, value: &Value, path: &str, result: &mut ValidationResult) {
    match node {
        FieldNode::Leaf(spec) => validate_leaf(spec, value, path, result),
        FieldNode::Repeated(inner) => match value {
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if !item.is_null() {
                        validate_node(inner, item, &format!("{path}[{i}]"), result);
                    }
                }
            }
            other => result
                .errors
                .push(format!("Field '{path}' expected list, got {}", type_name(other))),
        },
        FieldNode::SubDocument(children) => match value {
            Value::Object(map) => validate_fields(children, map, path, result),
            other => result
                .errors
                .push(format!("Field '{path}' expected object, got {}", type_name(other))),
        },
    }
}

fn validate_leaf(spec: &FieldSpec, value: &Value, path: &str, result: &mut ValidationResult) {
    if let Some(native) = spec.native {
        if !matches_native(native, value) {
            result.errors.push(format!(
                "Field '{path}' expected {}, got {}",
                native_name(native),
                type_name(value)
            ));
            return;
        }
    }

    if let Some(allowed) = spec.enum_values() {
        if !allowed.contains(value) {
            result.errors.push(format!(
                "Field '{path}' value {value} is not in enum: {}",
                Value::Array(allowed.clone())
            ));
        }
    }

    if let Some(validator) = &spec.validator {
        if let Some(check) = &validator.func {
            if !check(value) {
                result
                    .errors
                    .push(format!("Field '{path}' failed validator '{}'", validator.name));
            }
        }
    }
}

fn matches_native(native: NativeType, value: &Value) -> bool {
    match native {
        NativeType::Number => value.is_number(),
        NativeType::String => value.is_string(),
        NativeType::Boolean => value.is_boolean(),
        NativeType::Date => match value {
            Value::Number(_) => true,
            Value::String(s) => {
                DateTime::parse_from_rfc3339(s).is_ok() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
            }
            _ => false,
        },
        NativeType::ObjectId => value.is_string(),
        NativeType::Mixed => true,
    }
}

fn native_name(native: NativeType) -> &'static str {
    match native {
        NativeType::Number => "number",
        NativeType::String => "string",
        NativeType::Boolean => "boolean",
        NativeType::Date => "date",
        NativeType::ObjectId => "object id",
        NativeType::Mixed => "anything",
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Apply `default` values for missing leaves, descending into sub-documents that are present.
pub fn apply_defaults(fields: &BTreeMap<String, FieldNode>, doc: &mut Map<String, Value>) {
    for (name, node) in fields {
        match node {
            FieldNode::Leaf(spec) => {
                let has_value = doc.get(name).map(|v| !v.is_null()).unwrap_or(false);
                if !has_value {
                    if let Some(default) = spec.default_value() {
                        doc.insert(name.clone(), default.clone());
                    }
                }
            }
            FieldNode::SubDocument(children) => {
                if let Some(Value::Object(child)) = doc.get_mut(name) {
                    apply_defaults(children, child);
                }
            }
            FieldNode::Repeated(_) => {}
        }
    }
}

/// Run attached set formatters over every present leaf, including list items.
pub fn apply_setters(fields: &BTreeMap<String, FieldNode>, doc: &mut Map<String, Value>) {
    for (name, node) in fields {
        if let Some(value) = doc.get_mut(name) {
            apply_setter_node(node, value);
        }
    }
}

fn apply_setter_node(node: &FieldNode, value: &mut Value) {
    match node {
        FieldNode::Leaf(spec) => {
            if let Some(set) = spec.set.as_ref().and_then(|m| m.func.as_ref()) {
                if !value.is_null() {
                    *value = set(std::mem::take(value));
                }
            }
        }
        FieldNode::Repeated(inner) => {
            if let Value::Array(items) = value {
                for item in items {
                    apply_setter_node(inner, item);
                }
            }
        }
        FieldNode::SubDocument(children) => {
            if let Value::Object(map) = value {
                apply_setters(children, map);
            }
        }
    }
}

/// The save pipeline run on a detached copy of a document: defaults,
/// validation, then pre-save hooks. Hooks (bcrypt hashing among them) only
/// see documents that passed validation. Returns the prepared document.
pub fn prepare(schema: &CompiledSchema, mut doc: Map<String, Value>) -> Result<Map<String, Value>> {
    apply_defaults(schema.fields(), &mut doc);

    let result = validate_document(schema.fields(), &doc);
    if !result.is_ok() {
        return Err(RepoError::Validation(format!(
            "{} document failed validation:\n  - {}",
            schema.name(),
            result.errors.join("\n  - ")
        )));
    }
    for warning in &result.warnings {
        log::debug!("{}: {warning}", schema.name());
    }

    for hook in schema.pre_save_hooks() {
        hook(&mut doc)?;
    }
    Ok(doc)
}
