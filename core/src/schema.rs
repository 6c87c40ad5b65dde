//! # Schema introspection
//!
//! Turns a [`TypeDescriptor`] into a normalised JSON Schema plus the table of
//! open generic placeholders it mentions.
//!
//! * Concrete types produce structural schemas; named objects are hoisted into
//!   `$defs` and referenced.
//! * A generic parameter produces a `$ref` to a `$defs` stub titled with the
//!   generic's name, so a later pass can swap in the concrete schema
//!   ([`substitute_generic`]).
//! * Expansion stops at [`MAX_SCHEMA_DEPTH`]; anything deeper becomes `{}`.

use crate::error::InterfaceError;
use crate::interface::Metadata;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub const MAX_SCHEMA_DEPTH: usize = 10;

/// Declarative description of a pin, state or parameter type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeDescriptor {
    Any,
    Null,
    Bool,
    Integer,
    Number,
    String,
    Array {
        items: Box<TypeDescriptor>,
    },
    Map {
        values: Box<TypeDescriptor>,
    },
    Optional {
        inner: Box<TypeDescriptor>,
    },
    Union {
        variants: Vec<TypeDescriptor>,
    },
    Object {
        name: String,
        #[serde(default)]
        description: Option<String>,
        fields: Vec<ObjectField>,
    },
    /// Reference to a named object declared elsewhere in the same type.
    Ref {
        name: String,
    },
    Generic {
        name: String,
        #[serde(default)]
        bound: Option<Box<TypeDescriptor>>,
    },
    /// A ready-made schema, e.g. one derived with `schemars`.
    Schema {
        schema: Value,
    },
    Annotated {
        inner: Box<TypeDescriptor>,
        annotations: Vec<Annotation>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectField {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeDescriptor,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_true() -> bool {
    true
}

impl ObjectField {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
        }
    }
}

/// Side metadata carried by an `Annotated` type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Annotation {
    Metadata {
        data: Metadata,
    },
    Config,
    Input {
        #[serde(default)]
        sticky: bool,
    },
    State {
        #[serde(default)]
        step_id: Option<String>,
        #[serde(default)]
        input_ids: Vec<String>,
    },
}

impl TypeDescriptor {
    pub fn array(items: TypeDescriptor) -> Self {
        TypeDescriptor::Array {
            items: Box::new(items),
        }
    }

    pub fn map(values: TypeDescriptor) -> Self {
        TypeDescriptor::Map {
            values: Box::new(values),
        }
    }

    pub fn optional(inner: TypeDescriptor) -> Self {
        TypeDescriptor::Optional {
            inner: Box::new(inner),
        }
    }

    pub fn union(variants: impl IntoIterator<Item = TypeDescriptor>) -> Self {
        TypeDescriptor::Union {
            variants: variants.into_iter().collect(),
        }
    }

    pub fn object(name: impl Into<String>, fields: impl IntoIterator<Item = ObjectField>) -> Self {
        TypeDescriptor::Object {
            name: name.into(),
            description: None,
            fields: fields.into_iter().collect(),
        }
    }

    pub fn generic(name: impl Into<String>) -> Self {
        TypeDescriptor::Generic {
            name: name.into(),
            bound: None,
        }
    }

    pub fn bounded_generic(name: impl Into<String>, bound: TypeDescriptor) -> Self {
        TypeDescriptor::Generic {
            name: name.into(),
            bound: Some(Box::new(bound)),
        }
    }

    /// The JSON Schema `schemars` derives for `T`.
    pub fn of<T: JsonSchema>() -> Self {
        let mut schema =
            serde_json::to_value(schemars::schema_for!(T)).unwrap_or_else(|_| json!({}));
        if let Value::Object(map) = &mut schema {
            map.remove("$schema");
        }
        TypeDescriptor::Schema { schema }
    }

    pub fn annotated(self, annotation: Annotation) -> Self {
        match self {
            TypeDescriptor::Annotated {
                inner,
                mut annotations,
            } => {
                annotations.push(annotation);
                TypeDescriptor::Annotated { inner, annotations }
            }
            other => TypeDescriptor::Annotated {
                inner: Box::new(other),
                annotations: vec![annotation],
            },
        }
    }

    /// Strip every `Annotated` layer, returning the base type and all
    /// annotations outermost-last.
    pub fn peel(&self) -> (&TypeDescriptor, Vec<&Annotation>) {
        let mut annotations = Vec::new();
        let mut current = self;
        while let TypeDescriptor::Annotated {
            inner,
            annotations: layer,
        } = current
        {
            annotations.extend(layer.iter());
            current = inner;
        }
        (current, annotations)
    }
}

/// What a field's annotations make of it.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRole {
    /// No Config/Input/State annotation: the field is not part of the interface.
    Plain,
    Config,
    Input { sticky: bool },
    State { step_id: Option<String>, input_ids: Vec<String> },
}

/// Classified annotations of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldAnnotations {
    pub role: FieldRole,
    pub metadata: Metadata,
}

impl FieldAnnotations {
    /// Fails when more than one of Config/Input/State is present.
    pub fn classify(field: &str, annotations: &[&Annotation]) -> Result<Self, InterfaceError> {
        let mut role = FieldRole::Plain;
        let mut roles = 0;
        let mut metadata = Metadata::new();

        for annotation in annotations {
            match annotation {
                Annotation::Metadata { data } => {
                    metadata.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Annotation::Config => {
                    roles += 1;
                    role = FieldRole::Config;
                }
                Annotation::Input { sticky } => {
                    roles += 1;
                    role = FieldRole::Input { sticky: *sticky };
                }
                Annotation::State { step_id, input_ids } => {
                    roles += 1;
                    role = FieldRole::State {
                        step_id: step_id.clone(),
                        input_ids: input_ids.clone(),
                    };
                }
            }
        }

        if roles > 1 {
            return Err(InterfaceError::ConflictingAnnotations {
                field: field.to_string(),
            });
        }

        Ok(Self { role, metadata })
    }
}

/// A normalised schema and the generics it leaves open.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaWithGenerics {
    pub schema: Value,
    /// Generic name -> schema of its bound (`{}` when unbounded).
    pub generics: IndexMap<String, Value>,
}

/// Produce the normalised schema for `ty`.
pub fn introspect(ty: &TypeDescriptor) -> SchemaWithGenerics {
    let mut introspector = Introspector::default();
    let schema = introspector.visit(ty, 0, true);
    introspector.finish(ty, schema)
}

/// Schema of the value a generic pin carries: the concrete schema itself.
pub fn generic_pin_schema() -> Value {
    json!({"type": "object", "additionalProperties": true})
}

pub fn definition_ref(name: &str) -> Value {
    json!({"$ref": format!("#/$defs/{name}")})
}

#[derive(Default)]
struct Introspector {
    defs: Map<String, Value>,
    generics: IndexMap<String, Value>,
    root_name: Option<String>,
    root_referenced: bool,
}

impl Introspector {
    fn visit(&mut self, ty: &TypeDescriptor, depth: usize, root: bool) -> Value {
        if depth > MAX_SCHEMA_DEPTH {
            tracing::debug!(depth, "schema depth limit reached, truncating");
            return json!({});
        }

        match ty {
            TypeDescriptor::Any => json!({}),
            TypeDescriptor::Null => json!({"type": "null"}),
            TypeDescriptor::Bool => json!({"type": "boolean"}),
            TypeDescriptor::Integer => json!({"type": "integer"}),
            TypeDescriptor::Number => json!({"type": "number"}),
            TypeDescriptor::String => json!({"type": "string"}),
            TypeDescriptor::Array { items } => {
                let items = self.visit(items, depth + 1, false);
                json!({"type": "array", "items": items})
            }
            TypeDescriptor::Map { values } => {
                let values = self.visit(values, depth + 1, false);
                json!({"type": "object", "additionalProperties": values})
            }
            TypeDescriptor::Optional { inner } => {
                let inner = self.visit(inner, depth + 1, false);
                json!({"anyOf": [inner, {"type": "null"}]})
            }
            TypeDescriptor::Union { variants } => {
                let variants: Vec<Value> = variants
                    .iter()
                    .map(|v| self.visit(v, depth + 1, false))
                    .collect();
                json!({"anyOf": variants})
            }
            TypeDescriptor::Object {
                name,
                description,
                fields,
            } => {
                if root {
                    self.root_name = Some(name.clone());
                } else if self.defs.contains_key(name) {
                    return definition_ref(name);
                } else {
                    // Reserve the slot first so self-references terminate.
                    self.defs.insert(name.clone(), json!({}));
                }

                let mut properties = Map::new();
                let mut required = Vec::new();
                for field in fields {
                    properties.insert(field.name.clone(), self.visit(&field.ty, depth + 1, false));
                    if field.required {
                        required.push(Value::String(field.name.clone()));
                    }
                }

                let mut schema = Map::new();
                schema.insert("title".into(), Value::String(name.clone()));
                if let Some(description) = description {
                    schema.insert("description".into(), Value::String(description.clone()));
                }
                schema.insert("type".into(), json!("object"));
                schema.insert("properties".into(), Value::Object(properties));
                if !required.is_empty() {
                    schema.insert("required".into(), Value::Array(required));
                }

                if root {
                    Value::Object(schema)
                } else {
                    self.defs.insert(name.clone(), Value::Object(schema));
                    definition_ref(name)
                }
            }
            TypeDescriptor::Ref { name } => {
                if self.root_name.as_deref() == Some(name.as_str()) {
                    self.root_referenced = true;
                }
                definition_ref(name)
            }
            TypeDescriptor::Generic { name, bound } => {
                let bound_schema = match bound {
                    Some(bound) => {
                        let nested = introspect(bound);
                        for (generic, schema) in nested.generics {
                            self.generics.entry(generic).or_insert(schema);
                        }
                        nested.schema
                    }
                    None => json!({}),
                };

                let mut stub = Map::new();
                stub.insert("title".into(), Value::String(name.clone()));
                if let Value::Object(extra) = &bound_schema {
                    for (key, value) in extra {
                        stub.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                }
                self.defs.insert(name.clone(), Value::Object(stub));
                self.generics.entry(name.clone()).or_insert(bound_schema);
                definition_ref(name)
            }
            TypeDescriptor::Schema { schema } => {
                let mut schema = schema.clone();
                if let Value::Object(map) = &mut schema {
                    for key in ["$defs", "definitions"] {
                        if let Some(Value::Object(defs)) = map.remove(key) {
                            for (name, def) in defs {
                                self.defs.entry(name).or_insert(def);
                            }
                        }
                    }
                }
                schema
            }
            TypeDescriptor::Annotated { inner, .. } => self.visit(inner, depth + 1, root),
        }
    }

    fn finish(mut self, ty: &TypeDescriptor, schema: Value) -> SchemaWithGenerics {
        let mut schema = schema;

        // A self-referencing root object lives in $defs like any other.
        if self.root_referenced {
            if let Some(name) = self.root_name.take() {
                self.defs.insert(name.clone(), schema);
                schema = definition_ref(&name);
            }
        }

        if !self.defs.is_empty() {
            match &mut schema {
                Value::Object(map) => {
                    map.insert("$defs".into(), Value::Object(self.defs));
                }
                other => {
                    // Boolean schemas cannot carry $defs; wrap them.
                    let inner = other.take();
                    schema = json!({"allOf": [inner], "$defs": Value::Object(self.defs)});
                }
            }
        }

        tracing::trace!(?ty, generics = self.generics.len(), "introspected type");
        SchemaWithGenerics {
            schema,
            generics: self.generics,
        }
    }
}

/// Replace the placeholder for `generic` with `concrete` everywhere in `schema`.
///
/// Every `{"$ref": "#/$defs/<generic>"}` becomes the concrete schema, and the
/// stub is dropped from `$defs` (and `$defs` itself once empty).
pub fn substitute_generic(schema: &Value, generic: &str, concrete: &Value) -> Value {
    let target = format!("#/$defs/{generic}");
    let mut concrete = concrete.clone();
    let mut hoisted = Map::new();
    if let Value::Object(map) = &mut concrete {
        if let Some(Value::Object(defs)) = map.remove("$defs") {
            hoisted = defs;
        }
    }

    let mut result = replace_refs(schema, &target, &concrete);
    if let Value::Object(map) = &mut result {
        let mut defs = match map.remove("$defs") {
            Some(Value::Object(defs)) => defs,
            _ => Map::new(),
        };
        defs.remove(generic);
        for (name, def) in hoisted {
            defs.entry(name).or_insert(def);
        }
        if !defs.is_empty() {
            map.insert("$defs".into(), Value::Object(defs));
        }
    }
    result
}

fn replace_refs(schema: &Value, target: &str, concrete: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            if map.get("$ref").and_then(Value::as_str) == Some(target) {
                let mut replaced = match concrete {
                    Value::Object(c) => c.clone(),
                    other => return other.clone(),
                };
                for (key, value) in map {
                    if key != "$ref" {
                        replaced
                            .entry(key.clone())
                            .or_insert_with(|| replace_refs(value, target, concrete));
                    }
                }
                return Value::Object(replaced);
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), replace_refs(v, target, concrete)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| replace_refs(v, target, concrete))
                .collect(),
        ),
        other => other.clone(),
    }
}
