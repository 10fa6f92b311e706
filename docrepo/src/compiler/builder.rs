use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use crate::error::Result;
use crate::model::{ModelMap, Record};
use crate::registry::{SchemaPlugin, SetFormatter, Validator};
use crate::schema::{IdStrategy, IndexSpec};

/// Native field types a type token can resolve to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeType {
    Number,
    String,
    Date,
    Boolean,
    /// Opaque value, never type-checked
    Mixed,
    /// Opaque reference identifier
    ObjectId,
}

impl NativeType {
    /// Resolve a type token. Unknown tokens resolve to `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "Number" => Some(NativeType::Number),
            "String" => Some(NativeType::String),
            "Date" => Some(NativeType::Date),
            "Boolean" => Some(NativeType::Boolean),
            "Schema.Types.Mixed" => Some(NativeType::Mixed),
            "Schema.Types.ObjectId" | "ObjectId" => Some(NativeType::ObjectId),
            _ => None,
        }
    }
}

/// A middleware reference by name plus the callable it resolved to, if any
#[derive(Clone)]
pub struct Middleware<F> {
    pub name: String,
    pub func: Option<F>,
}

impl<F> Middleware<F> {
    pub fn unresolved(name: impl Into<String>) -> Self {
        Middleware {
            name: name.into(),
            func: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.func.is_some()
    }
}

impl<F> PartialEq for Middleware<F> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.is_resolved() == other.is_resolved()
    }
}

impl<F> fmt::Debug for Middleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("name", &self.name)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A leaf field after normalization
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub type_token: String,
    /// Resolved native type; `None` for unknown tokens
    pub native: Option<NativeType>,
    pub validator: Option<Middleware<Validator>>,
    pub set: Option<Middleware<SetFormatter>>,
    pub bcrypt: bool,
    /// Remaining keys of the leaf spec (`required`, `default`, `enum`, ...)
    pub options: BTreeMap<String, Value>,
}

impl FieldSpec {
    pub fn of_type(token: impl Into<String>) -> Self {
        FieldSpec {
            type_token: token.into(),
            native: None,
            validator: None,
            set: None,
            bcrypt: false,
            options: BTreeMap::new(),
        }
    }

    pub fn is_required(&self) -> bool {
        matches!(self.options.get("required"), Some(Value::Bool(true)))
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.options.get("default")
    }

    pub fn enum_values(&self) -> Option<&Vec<Value>> {
        self.options.get("enum").and_then(Value::as_array)
    }
}

/// Unambiguous field tree produced by normalization
#[derive(Debug, Clone, PartialEq)]
pub enum FieldNode {
    Leaf(FieldSpec),
    Repeated(Box<FieldNode>),
    SubDocument(BTreeMap<String, FieldNode>),
}

impl FieldNode {
    /// Find the leaf at a dotted path, walking through repeated fields
    pub fn find<'a>(fields: &'a BTreeMap<String, FieldNode>, path: &str) -> Option<&'a FieldSpec> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };
        let mut node = fields.get(head)?;
        while let FieldNode::Repeated(inner) = node {
            node = &**inner;
        }
        match (node, rest) {
            (FieldNode::Leaf(spec), None) => Some(spec),
            (FieldNode::SubDocument(children), Some(rest)) => FieldNode::find(children, rest),
            _ => None,
        }
    }
}

pub type VirtualGetter = Arc<dyn Fn(&Record) -> Value + Send + Sync>;
pub type Method = Arc<dyn Fn(&Record, &[Value]) -> Result<Value> + Send + Sync>;
pub type PreSaveHook = Arc<dyn Fn(&mut Map<String, Value>) -> Result<()> + Send + Sync>;

/// Record of a schema plugin applied to a schema
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedPlugin {
    pub name: String,
    pub options: Value,
}

/// Mutable schema under construction. The compiler fills it from a
/// definition and schema plugins extend it.
pub struct SchemaBuilder {
    name: String,
    fields: BTreeMap<String, FieldNode>,
    virtuals: BTreeMap<String, VirtualGetter>,
    methods: BTreeMap<String, Method>,
    pre_save: Vec<PreSaveHook>,
    plugins: Vec<AttachedPlugin>,
    indexes: Vec<IndexSpec>,
    id_strategy: IdStrategy,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>, fields: BTreeMap<String, FieldNode>) -> Self {
        SchemaBuilder {
            name: name.into(),
            fields,
            virtuals: BTreeMap::new(),
            methods: BTreeMap::new(),
            pre_save: Vec::new(),
            plugins: Vec::new(),
            indexes: Vec::new(),
            id_strategy: IdStrategy::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldNode> {
        &self.fields
    }

    pub fn id_strategy(&mut self, strategy: IdStrategy) -> &mut Self {
        self.id_strategy = strategy;
        self
    }

    /// Define a read-only computed field. Redefining a name replaces it.
    pub fn virtual_field<F>(&mut self, name: impl Into<String>, getter: F) -> &mut Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        self.virtuals.insert(name.into(), Arc::new(getter));
        self
    }

    pub fn method<F>(&mut self, name: impl Into<String>, method: F) -> &mut Self
    where
        F: Fn(&Record, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(method));
        self
    }

    /// Register a hook run on every save, after the document passed validation
    pub fn pre_save<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&mut Map<String, Value>) -> Result<()> + Send + Sync + 'static,
    {
        self.pre_save.push(Arc::new(hook));
        self
    }

    pub fn index(&mut self, spec: IndexSpec) -> &mut Self {
        self.indexes.push(spec);
        self
    }

    /// Run a schema plugin against this builder and remember that it was applied
    pub fn apply_plugin(&mut self, name: &str, plugin: &SchemaPlugin, options: Value) -> &mut Self {
        plugin(self, &options);
        self.plugins.push(AttachedPlugin {
            name: name.to_string(),
            options,
        });
        self
    }

    pub fn build(self) -> CompiledSchema {
        CompiledSchema {
            name: self.name,
            fields: self.fields,
            virtuals: self.virtuals,
            methods: self.methods,
            pre_save: self.pre_save,
            plugins: self.plugins,
            indexes: self.indexes,
            id_strategy: self.id_strategy,
            models: OnceLock::new(),
        }
    }
}

/// Executable form of a definition. Immutable once stored in the catalog.
pub struct CompiledSchema {
    name: String,
    fields: BTreeMap<String, FieldNode>,
    virtuals: BTreeMap<String, VirtualGetter>,
    methods: BTreeMap<String, Method>,
    pre_save: Vec<PreSaveHook>,
    plugins: Vec<AttachedPlugin>,
    indexes: Vec<IndexSpec>,
    id_strategy: IdStrategy,
    models: OnceLock<Weak<ModelMap>>,
}

impl CompiledSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldNode> {
        &self.fields
    }

    /// Leaf spec at a dotted path
    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        FieldNode::find(&self.fields, path)
    }

    pub fn virtual_getter(&self, name: &str) -> Option<&VirtualGetter> {
        self.virtuals.get(name)
    }

    pub fn virtual_names(&self) -> impl Iterator<Item = &str> {
        self.virtuals.keys().map(String::as_str)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn pre_save_hooks(&self) -> &[PreSaveHook] {
        &self.pre_save
    }

    pub fn plugins(&self) -> &[AttachedPlugin] {
        &self.plugins
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    pub fn id_strategy(&self) -> IdStrategy {
        self.id_strategy
    }

    /// All models bound for this schema's database, once models are bound.
    pub fn repository_models(&self) -> Option<Arc<ModelMap>> {
        self.models.get().and_then(Weak::upgrade)
    }

    pub(crate) fn bind_models(&self, models: &Arc<ModelMap>) {
        if self.models.set(Arc::downgrade(models)).is_err() {
            log::debug!("Schema {} already bound to a model map", self.name);
        }
    }
}

impl PartialEq for CompiledSchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.fields == other.fields
            && self.virtuals.keys().eq(other.virtuals.keys())
            && self.methods.keys().eq(other.methods.keys())
            && self.pre_save.len() == other.pre_save.len()
            && self.plugins == other.plugins
            && self.indexes == other.indexes
            && self.id_strategy == other.id_strategy
    }
}

impl fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("virtuals", &self.virtuals.keys().collect::<Vec<_>>())
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("pre_save", &self.pre_save.len())
            .field("plugins", &self.plugins)
            .field("indexes", &self.indexes)
            .field("id_strategy", &self.id_strategy)
            .finish()
    }
}
