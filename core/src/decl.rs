//! # Block declarations
//!
//! The shape of a block is written down as data rather than discovered by
//! reflection. A [`BlockDecl`] lists fields (outputs, configs, inputs, state,
//! tools, composite ports, generic setters) and functions (steps and callbacks).
//! Bases are flattened into a linear override list by the interface builder.
//!
//! Declarations are plain serde types, so they can also be loaded from
//! TOML or JSON manifests.

use crate::error::InterfaceError;
use crate::interface::{Metadata, PinType};
use crate::schema::{Annotation, TypeDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDecl {
    /// Declared name. A `_`-separated suffix is read as the version
    /// (`Map_1_2` is `Map` at `1.2.0`) unless `version` is set.
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub bases: Vec<BlockDecl>,
    #[serde(default)]
    pub fields: Vec<FieldDecl>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
}

/// Whether a field or pin holds one element, a list, or a string-keyed map of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Container {
    #[default]
    Single,
    List,
    Dictionary,
}

impl From<Container> for PinType {
    fn from(value: Container) -> Self {
        match value {
            Container::Single => PinType::Single,
            Container::List => PinType::List,
            Container::Dictionary => PinType::Dictionary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// `Output[T]`. Exactly one type is allowed.
    Output {
        types: Vec<TypeDescriptor>,
        #[serde(default)]
        container: Container,
    },
    /// A value whose annotations decide whether it is a config, an input,
    /// a state slot, or nothing.
    Value {
        #[serde(rename = "type")]
        ty: TypeDescriptor,
        #[serde(default)]
        default: Option<Value>,
        #[serde(default)]
        container: Container,
    },
    /// A composite port; with a `tool` signature it is a Tool.
    Port {
        port: PortDecl,
        #[serde(default)]
        container: Container,
    },
    /// Renames the hidden port of `generic` into this field.
    GenericSetter { generic: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortDecl {
    #[serde(default)]
    pub pins: Vec<PinDecl>,
    #[serde(default)]
    pub tool: Option<ToolSignature>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinDecl {
    pub name: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub kind: PinKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PinKind {
    Output {
        types: Vec<TypeDescriptor>,
        #[serde(default)]
        container: Container,
    },
    Value {
        #[serde(rename = "type")]
        ty: TypeDescriptor,
        #[serde(default)]
        default: Option<Value>,
        #[serde(default)]
        container: Container,
    },
    GenericSetter { generic: String },
}

/// The `run` contract of a Tool: parameters flow out of the block, the return
/// value flows back in on the `return` pin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSignature {
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    #[serde(default)]
    pub returns: Vec<TypeDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ParamKind {
    #[default]
    Positional,
    VarPositional,
    VarKeyword,
}

impl From<ParamKind> for PinType {
    fn from(value: ParamKind) -> Self {
        match value {
            ParamKind::Positional => PinType::Single,
            ParamKind::VarPositional => PinType::List,
            ParamKind::VarKeyword => PinType::Dictionary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeDescriptor,
    #[serde(default)]
    pub kind: ParamKind,
    /// `Some(Value::Null)` is an explicit null default; `None` means required.
    #[serde(default, with = "explicit_option")]
    pub default: Option<Value>,
}

/// Keeps `Some(null)` distinct from a missing default when deserialising.
mod explicit_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Option<Value>, s: S) -> Result<S::Ok, S::Error> {
        value.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Value>, D::Error> {
        Value::deserialize(d).map(Some)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FunctionKind {
    Step {
        #[serde(default)]
        output_name: Option<String>,
    },
    Callback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    pub kind: FunctionKind,
    #[serde(default)]
    pub params: Vec<ParamDecl>,
    #[serde(default)]
    pub returns: Option<TypeDescriptor>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl BlockDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            metadata: Metadata::new(),
            bases: Vec::new(),
            fields: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn extends(mut self, base: BlockDecl) -> Self {
        self.bases.push(base);
        self
    }

    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    pub fn function(mut self, function: FunctionDecl) -> Self {
        self.functions.push(function);
        self
    }

    /// The block name without any version suffix.
    pub fn block_name(&self) -> &str {
        self.name.split('_').next().unwrap_or(&self.name)
    }

    /// Resolve the semantic version from `version`, the name suffix, or the default.
    pub fn semantic_version(&self) -> Result<semver::Version, InterfaceError> {
        let suffix: Vec<&str> = self.name.split('_').skip(1).collect();
        let raw = match &self.version {
            Some(version) => version.clone(),
            None if !suffix.is_empty() => suffix.join("."),
            None => DEFAULT_VERSION.to_string(),
        };
        coerce_version(&raw).map_err(|reason| InterfaceError::InvalidVersion {
            block: self.block_name().to_string(),
            version: raw.clone(),
            reason,
        })
    }
}

/// Lenient version parsing: `"1"` is `1.0.0`, `"1.2"` is `1.2.0`, a leading
/// `v` is ignored, and trailing text after the numeric core is dropped.
pub fn coerce_version(raw: &str) -> Result<semver::Version, String> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    if let Ok(version) = semver::Version::parse(trimmed) {
        return Ok(version);
    }

    let mut parts = [0u64; 3];
    let mut seen = 0;
    for (slot, part) in trimmed.split('.').take(3).enumerate() {
        let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            break;
        }
        parts[slot] = digits.parse().map_err(|e| format!("{e}"))?;
        seen += 1;
    }

    if seen == 0 {
        return Err(format!("'{raw}' does not start with a version number"));
    }
    Ok(semver::Version::new(parts[0], parts[1], parts[2]))
}

impl FieldDecl {
    fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            metadata: Metadata::new(),
            kind,
        }
    }

    /// `name: Output[ty]`
    pub fn output(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self::new(
            name,
            FieldKind::Output {
                types: vec![ty],
                container: Container::Single,
            },
        )
    }

    /// `name: list[Output[ty]]` or `dict[str, Output[ty]]`
    pub fn outputs(name: impl Into<String>, ty: TypeDescriptor, container: Container) -> Self {
        Self::new(
            name,
            FieldKind::Output {
                types: vec![ty],
                container,
            },
        )
    }

    /// A sticky configuration value.
    pub fn config(name: impl Into<String>, ty: TypeDescriptor, default: Option<Value>) -> Self {
        Self::new(
            name,
            FieldKind::Value {
                ty: ty.annotated(Annotation::Config),
                default,
                container: Container::Single,
            },
        )
    }

    pub fn input(name: impl Into<String>, ty: TypeDescriptor, sticky: bool) -> Self {
        Self::new(
            name,
            FieldKind::Value {
                ty: ty.annotated(Annotation::Input { sticky }),
                default: None,
                container: Container::Single,
            },
        )
    }

    /// A state slot; without a scope it is global to the instance.
    pub fn state(name: impl Into<String>, ty: TypeDescriptor, default: Value) -> Self {
        Self::new(
            name,
            FieldKind::Value {
                ty: ty.annotated(Annotation::State {
                    step_id: None,
                    input_ids: Vec::new(),
                }),
                default: Some(default),
                container: Container::Single,
            },
        )
    }

    /// A raw value field; its annotations decide its role.
    pub fn value(name: impl Into<String>, ty: TypeDescriptor, default: Option<Value>) -> Self {
        Self::new(
            name,
            FieldKind::Value {
                ty,
                default,
                container: Container::Single,
            },
        )
    }

    pub fn tool(name: impl Into<String>, signature: ToolSignature) -> Self {
        Self::port(
            name,
            PortDecl {
                pins: Vec::new(),
                tool: Some(signature),
            },
        )
    }

    pub fn port(name: impl Into<String>, port: PortDecl) -> Self {
        Self::new(
            name,
            FieldKind::Port {
                port,
                container: Container::Single,
            },
        )
    }

    pub fn generic_setter(name: impl Into<String>, generic: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::GenericSetter {
                generic: generic.into(),
            },
        )
    }

    /// Scope a state field to the values a step receives on `input_ids`.
    pub fn scoped_to<I, S>(mut self, step_id: impl Into<String>, input_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let FieldKind::Value { ty, .. } = &mut self.kind {
            let step_id = step_id.into();
            let input_ids: Vec<String> = input_ids.into_iter().map(Into::into).collect();
            let retagged = strip_state(ty.clone()).annotated(Annotation::State {
                step_id: Some(step_id),
                input_ids,
            });
            *ty = retagged;
        }
        self
    }

    /// Turn the field into a List or Dictionary port.
    pub fn container(mut self, container: Container) -> Self {
        match &mut self.kind {
            FieldKind::Output { container: c, .. }
            | FieldKind::Value { container: c, .. }
            | FieldKind::Port { container: c, .. } => *c = container,
            FieldKind::GenericSetter { .. } => {}
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

fn strip_state(ty: TypeDescriptor) -> TypeDescriptor {
    match ty {
        TypeDescriptor::Annotated { inner, annotations } => {
            let kept: Vec<Annotation> = annotations
                .into_iter()
                .filter(|a| !matches!(a, Annotation::State { .. }))
                .collect();
            if kept.is_empty() {
                *inner
            } else {
                TypeDescriptor::Annotated {
                    inner,
                    annotations: kept,
                }
            }
        }
        other => other,
    }
}

impl PortDecl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin(mut self, pin: PinDecl) -> Self {
        self.pins.push(pin);
        self
    }

    pub fn tool(mut self, signature: ToolSignature) -> Self {
        self.tool = Some(signature);
        self
    }
}

impl PinDecl {
    pub fn output(name: impl Into<String>, ty: TypeDescriptor, container: Container) -> Self {
        Self {
            name: name.into(),
            metadata: Metadata::new(),
            kind: PinKind::Output {
                types: vec![ty],
                container,
            },
        }
    }

    pub fn config(name: impl Into<String>, ty: TypeDescriptor, default: Option<Value>) -> Self {
        Self::value(name, ty.annotated(Annotation::Config), default, Container::Single)
    }

    pub fn value(
        name: impl Into<String>,
        ty: TypeDescriptor,
        default: Option<Value>,
        container: Container,
    ) -> Self {
        Self {
            name: name.into(),
            metadata: Metadata::new(),
            kind: PinKind::Value {
                ty,
                default,
                container,
            },
        }
    }

    pub fn generic_setter(name: impl Into<String>, generic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            metadata: Metadata::new(),
            kind: PinKind::GenericSetter {
                generic: generic.into(),
            },
        }
    }
}

impl ToolSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, ty: TypeDescriptor) -> Self {
        self.returns.push(ty);
        self
    }
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
            kind: ParamKind::Positional,
            default: None,
        }
    }

    /// `*name`
    pub fn var_positional(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            kind: ParamKind::VarPositional,
            ..Self::new(name, ty)
        }
    }

    /// `**name`
    pub fn var_keyword(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            kind: ParamKind::VarKeyword,
            ..Self::new(name, ty)
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark the pin sticky: its last value is reused until replaced.
    pub fn sticky(mut self) -> Self {
        self.ty = self.ty.annotated(Annotation::Input { sticky: true });
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        let mut data = Metadata::new();
        data.insert("description".into(), Value::String(description.into()));
        self.ty = self.ty.annotated(Annotation::Metadata { data });
        self
    }
}

impl FunctionDecl {
    pub fn step(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FunctionKind::Step { output_name: None },
            params: Vec::new(),
            returns: None,
            metadata: Metadata::new(),
        }
    }

    pub fn callback(name: impl Into<String>) -> Self {
        Self {
            kind: FunctionKind::Callback,
            ..Self::step(name)
        }
    }

    pub fn param(mut self, param: ParamDecl) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, ty: TypeDescriptor) -> Self {
        self.returns = Some(ty);
        self
    }

    /// Name the step's output pin (defaults to `""`).
    pub fn output_name(mut self, name: impl Into<String>) -> Self {
        if let FunctionKind::Step { output_name } = &mut self.kind {
            *output_name = Some(name.into());
        }
        self
    }

    pub fn is_callback(&self) -> bool {
        matches!(self.kind, FunctionKind::Callback)
    }
}
