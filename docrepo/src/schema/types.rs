use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Declarative definition of one model, parsed from a definition document
/// or handed over inline by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db: Option<String>,
    /// Field spec tree: field name to type token, nested tree, one-element list, or leaf spec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Map<String, Value>>,
    #[serde(default, alias = "model", skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelNames>,
    #[serde(default, rename = "virtual", skip_serializing_if = "BTreeMap::is_empty")]
    pub virtuals: BTreeMap<String, VirtualSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_property: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IdStrategy>,
    /// Keys the compiler does not interpret (views, gql flags, ...), kept as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Definition {
    /// Model names to bind for this definition, falling back to the definition
    /// name when `models` is omitted. An explicit empty list binds nothing.
    pub fn model_names(&self, name: &str) -> Vec<String> {
        match &self.models {
            Some(ModelNames::One(model)) => vec![model.clone()],
            Some(ModelNames::Many(models)) => models.clone(),
            None => vec![name.to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelNames {
    One(String),
    Many(Vec<String>),
}

/// A computed field entry under `virtual`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VirtualSpec {
    /// Shorthand: render this template through the `template` formatter
    Template(String),
    Formatter {
        #[serde(default)]
        formatter: Option<FormatterSpec>,
    },
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormatterSpec {
    /// Call the named formatter with no arguments
    Name(String),
    /// `{ formatterName: args }`; a non-list argument is treated as a single argument
    Call(BTreeMap<String, Value>),
    Other(Value),
}

/// An entry of a definition's `plugins` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginRef {
    Name(String),
    WithOptions(BTreeMap<String, Value>),
    Other(Value),
}

impl PluginRef {
    /// Plugin name and options, or None for shapes that name no plugin.
    pub fn resolve(&self) -> Option<(&str, Value)> {
        match self {
            PluginRef::Name(name) => Some((name.as_str(), Value::Null)),
            PluginRef::WithOptions(map) => map
                .iter()
                .next()
                .map(|(name, options)| (name.as_str(), options.clone())),
            PluginRef::Other(_) => None,
        }
    }
}

/// Index declaration handed verbatim to the storage engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Strategy used to generate `_id` for new records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    Ulid,
    Uuid,
    Nanoid,
}

impl IdStrategy {
    pub fn generate(&self) -> String {
        match self {
            IdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            IdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            IdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}
