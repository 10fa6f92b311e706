//! Definition compiler.
//!
//! Turns a loosely-shaped field spec tree into a [`CompiledSchema`]:
//! normalize the shape once, resolve type tokens, attach validator and set
//! middleware by name, then add synthetic fields, virtuals, schema plugins
//! and indexes. Misses in the registries degrade silently; malformed shapes
//! are errors naming the model.

mod builder;
pub mod hashing;

pub use builder::{
    AttachedPlugin, CompiledSchema, FieldNode, FieldSpec, Method, Middleware, NativeType,
    PreSaveHook, SchemaBuilder, VirtualGetter,
};

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{RepoError, Result};
use crate::registry::{Registry, Table};
use crate::schema::{Definition, FormatterSpec, VirtualSpec};
use crate::template;

/// Nesting limit for field trees; anything deeper is rejected rather than walked
pub const MAX_DEPTH: usize = 32;

fn shape_error(path: &str, message: impl std::fmt::Display) -> RepoError {
    RepoError::Compile {
        model: String::new(),
        message: format!("field '{path}': {message}"),
    }
}

/// Normalize a raw field spec tree into tagged nodes.
pub fn normalize(tree: &Map<String, Value>) -> Result<BTreeMap<String, FieldNode>> {
    normalize_tree(tree, "", 0)
}

fn normalize_tree(
    tree: &Map<String, Value>,
    prefix: &str,
    depth: usize,
) -> Result<BTreeMap<String, FieldNode>> {
    if depth > MAX_DEPTH {
        return Err(shape_error(prefix, format!("nesting exceeds {MAX_DEPTH} levels")));
    }

    let mut fields = BTreeMap::new();
    for (key, value) in tree {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        fields.insert(key.clone(), normalize_node(value, &path, depth + 1)?);
    }
    Ok(fields)
}

fn normalize_node(value: &Value, path: &str, depth: usize) -> Result<FieldNode> {
    match value {
        Value::String(token) => Ok(FieldNode::Leaf(FieldSpec::of_type(token.clone()))),
        Value::Object(map) => match map.get("type") {
            Some(type_value) => Ok(FieldNode::Leaf(leaf_spec(type_value, map, path)?)),
            None => Ok(FieldNode::SubDocument(normalize_tree(map, path, depth)?)),
        },
        Value::Array(items) => match items.as_slice() {
            [element] => Ok(FieldNode::Repeated(Box::new(normalize_node(
                element,
                &format!("{path}[]"),
                depth + 1,
            )?))),
            _ => Err(shape_error(
                path,
                format!("expected a one-element list, got {} elements", items.len()),
            )),
        },
        other => Err(shape_error(
            path,
            format!("unexpected schema structure ({})", json_kind(other)),
        )),
    }
}

fn leaf_spec(type_value: &Value, map: &Map<String, Value>, path: &str) -> Result<FieldSpec> {
    let mut spec = match type_value {
        Value::String(type_token) => FieldSpec::of_type(type_token.clone()),
        other => {
            log::warn!(
                "Field '{path}': 'type' is {} rather than a type token; passed through untyped",
                json_kind(other)
            );
            FieldSpec::of_type(String::new())
        }
    };
    for (key, value) in map {
        match key.as_str() {
            "type" if spec.type_token.is_empty() => {
                spec.options.insert(key.clone(), value.clone());
            }
            "type" => {}
            "validator" => spec.validator = middleware_name(value, path, key)?.map(Middleware::unresolved),
            "set" => spec.set = middleware_name(value, path, key)?.map(Middleware::unresolved),
            "bcrypt" => spec.bcrypt = is_truthy(value),
            _ => {
                spec.options.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(spec)
}

fn middleware_name(value: &Value, path: &str, key: &str) -> Result<Option<String>> {
    match value {
        Value::String(name) => Ok(Some(name.clone())),
        Value::Null => Ok(None),
        other => Err(shape_error(
            path,
            format!("'{key}' must name a registered function, got {}", json_kind(other)),
        )),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Visit every leaf of the tree, at every depth
pub fn for_each_leaf_mut(fields: &mut BTreeMap<String, FieldNode>, f: &mut impl FnMut(&mut FieldSpec)) {
    for node in fields.values_mut() {
        visit_leaf_mut(node, f);
    }
}

fn visit_leaf_mut(node: &mut FieldNode, f: &mut impl FnMut(&mut FieldSpec)) {
    match node {
        FieldNode::Leaf(spec) => f(spec),
        FieldNode::Repeated(inner) => visit_leaf_mut(inner, f),
        FieldNode::SubDocument(children) => for_each_leaf_mut(children, f),
    }
}

/// Resolve every leaf's type token against the native type map
pub fn resolve_types(fields: &mut BTreeMap<String, FieldNode>) {
    for_each_leaf_mut(fields, &mut |spec| {
        spec.native = NativeType::from_token(&spec.type_token);
        if spec.native.is_none() {
            log::debug!("Unknown type token '{}' passed through untyped", spec.type_token);
        }
    });
}

/// Replace validator and set names with the callables registered under them
pub fn attach_middleware(fields: &mut BTreeMap<String, FieldNode>, registry: &Registry) {
    for_each_leaf_mut(fields, &mut |spec| {
        if let Some(validator) = spec.validator.as_mut() {
            validator.func = lookup(&registry.validators, &validator.name, "validator");
        }
        if let Some(set) = spec.set.as_mut() {
            set.func = lookup(&registry.set_formatters, &set.name, "set formatter");
        }
    });
}

fn lookup<F: Clone>(table: &Table<F>, name: &str, kind: &str) -> Option<F> {
    let found = table.get(name);
    if found.is_none() {
        log::warn!("No {kind} registered as '{name}'; middleware disabled");
    }
    found
}

/// Compile a definition against the given registries. The definition must
/// already carry its name.
pub fn compile(definition: &Definition, registry: &Registry) -> Result<CompiledSchema> {
    let name = definition
        .name
        .clone()
        .ok_or_else(|| RepoError::Assertion("Must provide a valid model name for the definition schema".into()))?;
    let empty = Map::new();
    let raw = definition.schema.as_ref().unwrap_or(&empty);

    let mut fields = normalize(raw).map_err(|e| e.in_model(&name))?;
    resolve_types(&mut fields);
    attach_middleware(&mut fields, registry);

    let mut schema = SchemaBuilder::new(name, fields);
    if let Some(strategy) = definition.id {
        schema.id_strategy(strategy);
    }

    add_synthetic_fields(definition, raw, &mut schema);

    if hashing::has_hashed_fields(schema.fields()) {
        schema.apply_plugin(hashing::PLUGIN_NAME, &hashing::plugin(), hashing::default_options());
    }

    add_virtuals(definition, registry, &mut schema);

    for plugin_ref in &definition.plugins {
        let Some((plugin_name, options)) = plugin_ref.resolve() else {
            continue;
        };
        match registry.schema_plugins.get(plugin_name) {
            Some(plugin) => {
                schema.apply_plugin(plugin_name, &plugin, options);
            }
            None => log::warn!(
                "Schema plugin '{plugin_name}' not registered; skipped for {}",
                schema.name()
            ),
        }
    }

    for index in &definition.indexes {
        schema.index(index.clone());
    }

    Ok(schema.build())
}

fn add_synthetic_fields(definition: &Definition, raw: &Map<String, Value>, schema: &mut SchemaBuilder) {
    if let Some(item_type) = &definition.item_type {
        let item_type = Value::String(item_type.clone());
        schema.virtual_field("itemType", move |_| item_type.clone());
    }
    if let Some(alias) = &definition.alias {
        let alias = Value::String(alias.clone());
        schema.virtual_field("alias", move |_| alias.clone());
    }
    if !raw.contains_key("name") {
        if let Some(property) = definition.name_property.clone() {
            schema.virtual_field("name", move |record| {
                template::lookup(record.doc(), &property)
                    .cloned()
                    .unwrap_or(Value::Null)
            });
        }
    }
}

fn add_virtuals(definition: &Definition, registry: &Registry, schema: &mut SchemaBuilder) {
    for (key, spec) in &definition.virtuals {
        let Some((formatter_name, args)) = formatter_call(spec) else {
            log::debug!("Virtual '{key}' has no formatter; skipped");
            continue;
        };
        let Some(formatter) = registry.virtual_formatters.get(&formatter_name) else {
            log::warn!("Virtual formatter '{formatter_name}' not registered; virtual '{key}' skipped");
            continue;
        };
        schema.virtual_field(key.clone(), move |record| formatter(record, &args));
    }
}

/// The formatter name and fixed argument list a virtual spec calls
fn formatter_call(spec: &VirtualSpec) -> Option<(String, Vec<Value>)> {
    match spec {
        VirtualSpec::Template(template) => {
            Some(("template".to_string(), vec![Value::String(template.clone())]))
        }
        VirtualSpec::Formatter {
            formatter: Some(FormatterSpec::Name(name)),
        } => Some((name.clone(), Vec::new())),
        VirtualSpec::Formatter {
            formatter: Some(FormatterSpec::Call(call)),
        } => call.iter().next().map(|(name, args)| {
            let args = match args {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            (name.clone(), args)
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{schema_plugin, set_formatter, validator, virtual_formatter};
    use crate::schema::parse_definition_str;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn definition(yaml: &str) -> Definition {
        parse_definition_str(yaml).unwrap()
    }

    fn leaf<'a>(schema: &'a CompiledSchema, path: &str) -> &'a FieldSpec {
        schema.field(path).unwrap_or_else(|| panic!("no leaf at {path}"))
    }

    #[test]
    fn test_every_native_token_resolves() {
        let tokens = [
            ("Number", NativeType::Number),
            ("String", NativeType::String),
            ("Date", NativeType::Date),
            ("Boolean", NativeType::Boolean),
            ("Schema.Types.Mixed", NativeType::Mixed),
            ("Schema.Types.ObjectId", NativeType::ObjectId),
            ("ObjectId", NativeType::ObjectId),
        ];
        for (token, expected) in tokens {
            let def = Definition {
                name: Some("T".into()),
                schema: Some(json!({ "f": token }).as_object().unwrap().clone()),
                ..Default::default()
            };
            let schema = compile(&def, &Registry::empty()).unwrap();
            assert_eq!(leaf(&schema, "f").native, Some(expected), "token {token}");
        }
    }

    #[test]
    fn test_unknown_token_passes_through() {
        let def = definition("name: T\nschema:\n  f: Decimal128\n");
        let schema = compile(&def, &Registry::empty()).unwrap();
        let f = leaf(&schema, "f");
        assert_eq!(f.type_token, "Decimal128");
        assert_eq!(f.native, None);
    }

    #[test]
    fn test_non_token_type_passes_through() {
        let def = definition(
            "name: Geo\nschema:\n  location: { type: { type: String }, coordinates: [Number] }\n  label: String\n",
        );
        let schema = compile(&def, &Registry::empty()).unwrap();
        let location = leaf(&schema, "location");
        assert_eq!(location.native, None);
        assert_eq!(location.options.get("type"), Some(&json!({ "type": "String" })));
        assert_eq!(location.options.get("coordinates"), Some(&json!(["Number"])));
        assert_eq!(leaf(&schema, "label").native, Some(NativeType::String));
    }

    #[test]
    fn test_shapes_normalize() {
        let def = definition(
            r#"
name: Shapes
schema:
  title: String
  tags: [String]
  scores: [{ type: Number, validator: isInt }]
  address:
    street: String
    geo: { type: Schema.Types.Mixed }
  history: [{ at: Date, note: String }]
"#,
        );
        let schema = compile(&def, &Registry::with_defaults()).unwrap();
        let fields = schema.fields();

        assert!(matches!(fields["tags"], FieldNode::Repeated(ref inner) if matches!(**inner, FieldNode::Leaf(_))));
        assert!(matches!(fields["history"], FieldNode::Repeated(ref inner) if matches!(**inner, FieldNode::SubDocument(_))));
        assert_eq!(leaf(&schema, "address.street").native, Some(NativeType::String));
        assert_eq!(leaf(&schema, "address.geo").native, Some(NativeType::Mixed));
        assert_eq!(leaf(&schema, "history.at").native, Some(NativeType::Date));
        assert!(leaf(&schema, "scores").validator.as_ref().unwrap().is_resolved());
    }

    #[test]
    fn test_malformed_shape_names_model() {
        let def = definition("name: Broken\nschema:\n  count: 42\n");
        let err = compile(&def, &Registry::empty()).unwrap_err();
        match err {
            RepoError::Compile { model, message } => {
                assert_eq!(model, "Broken");
                assert!(message.contains("count"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_list_is_malformed() {
        let def = definition("name: Broken\nschema:\n  tags: []\n");
        assert!(matches!(
            compile(&def, &Registry::empty()),
            Err(RepoError::Compile { .. })
        ));
    }

    #[test]
    fn test_middleware_lookup_and_soft_miss() {
        let mut registry = Registry::empty();
        registry
            .validators
            .insert("custom.positive", validator(|v| v.as_f64().map_or(false, |n| n > 0.0)));
        registry
            .set_formatters
            .insert("double", set_formatter(|v| json!(v.as_f64().unwrap_or(0.0) * 2.0)));

        let def = definition(
            r#"
name: M
schema:
  amount: { type: Number, validator: custom.positive, set: double }
  other: { type: Number, validator: missing.validator }
  nested:
    deep: { type: Number, set: double }
"#,
        );
        let schema = compile(&def, &registry).unwrap();

        let amount = leaf(&schema, "amount");
        assert!(amount.validator.as_ref().unwrap().is_resolved());
        assert!(amount.set.as_ref().unwrap().is_resolved());
        let other = leaf(&schema, "other");
        assert_eq!(other.validator.as_ref().unwrap().name, "missing.validator");
        assert!(!other.validator.as_ref().unwrap().is_resolved());
        assert!(leaf(&schema, "nested.deep").set.as_ref().unwrap().is_resolved());
    }

    #[test]
    fn test_hashing_attached_once() {
        let def = definition(
            r#"
name: Secrets
schema:
  password: { type: String, bcrypt: true }
  pin: { type: String, bcrypt: true }
  devices: [{ token: { type: String, bcrypt: true } }]
"#,
        );
        let schema = compile(&def, &Registry::empty()).unwrap();
        let hashing: Vec<_> = schema
            .plugins()
            .iter()
            .filter(|p| p.name == hashing::PLUGIN_NAME)
            .collect();
        assert_eq!(hashing.len(), 1);
        assert_eq!(hashing[0].options, json!({ "rounds": 8 }));
        assert_eq!(schema.pre_save_hooks().len(), 1);
        assert!(schema.method("verifyPassword").is_some());
        assert!(schema.method("verifyPin").is_some());
    }

    #[test]
    fn test_no_hashing_without_marker() {
        let def = definition("name: Plain\nschema:\n  password: String\n");
        let schema = compile(&def, &Registry::empty()).unwrap();
        assert!(schema.plugins().is_empty());
    }

    #[test]
    fn test_virtuals_and_synthetic_fields() {
        let mut registry = Registry::with_defaults();
        registry.virtual_formatters.insert(
            "join",
            virtual_formatter(|record, args| {
                let parts: Vec<String> = args
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|f| record.get(f).as_str().unwrap_or_default().to_string())
                    .collect();
                json!(parts.join(" "))
            }),
        );

        let def = definition(
            r#"
name: Person
itemType: person
alias: people
nameProperty: handle
schema:
  first: String
  last: String
  handle: String
virtual:
  full: { formatter: { join: [first, last] } }
  greeting: "Hi {first}"
  missing: { formatter: nowhere }
  noFormatter: { other: 1 }
"#,
        );
        let schema = compile(&def, &registry).unwrap();
        let names: Vec<&str> = schema.virtual_names().collect();
        assert_eq!(names, vec!["alias", "full", "greeting", "itemType", "name"]);
    }

    #[test]
    fn test_name_property_ignored_when_schema_has_name() {
        let def = definition("name: N\nnameProperty: handle\nschema:\n  name: String\n  handle: String\n");
        let schema = compile(&def, &Registry::empty()).unwrap();
        assert!(schema.virtual_getter("name").is_none());
    }

    #[test]
    fn test_schema_plugins_and_indexes() {
        let mut registry = Registry::empty();
        registry.schema_plugins.insert(
            "greeter",
            schema_plugin(|schema, options| {
                let reply = options.get("reply").cloned().unwrap_or(json!("world"));
                schema.method("hello", move |_, _| Ok(reply.clone()));
            }),
        );

        let def = definition(
            r#"
name: P
schema:
  email: String
plugins:
  - greeter: { reply: there }
  - unknownPlugin
indexes:
  - fields: { email: 1 }
    options: { unique: true }
"#,
        );
        let schema = compile(&def, &registry).unwrap();
        assert_eq!(schema.plugins().len(), 1);
        assert_eq!(schema.plugins()[0].name, "greeter");
        assert!(schema.method("hello").is_some());
        assert_eq!(schema.indexes().len(), 1);
        assert_eq!(schema.indexes()[0].options["unique"], json!(true));
    }

    #[test]
    fn test_compile_is_idempotent() {
        let registry = Registry::with_defaults();
        let def = definition(
            r#"
name: Same
schema:
  email: { type: String, validator: isEmail, set: trim }
  password: { type: String, bcrypt: true }
  tags: [String]
virtual:
  label: "{email}"
"#,
        );
        let a = compile(&def, &registry).unwrap();
        let b = compile(&def, &registry).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!("String");
        for _ in 0..(MAX_DEPTH + 2) {
            value = json!({ "child": value });
        }
        let tree = json!({ "root": value });
        assert!(normalize(tree.as_object().unwrap()).is_err());
    }
}
