//! # Interface: the static shape of a block
//!
//! A [`BlockInterface`] is derived once per block type from its declaration
//! (see [`crate::builder`]) and never mutated afterwards. It is the contract the
//! flow compiler, the instance manager and any UI agree on.
//!
//! Wire names are camelCase (`schema`, `isFunction`) so serialised interfaces
//! round-trip byte-for-byte.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Free-form metadata attached to blocks, ports, pins and state.
pub type Metadata = Map<String, Value>;

/// Shape of a pin: one value, an ordered list, or a string-keyed map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinType {
    Single,
    List,
    Dictionary,
}

/// Shape of a port. List and Dictionary ports hold a dynamic collection of
/// identical sub-interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortType {
    Single,
    List,
    Dictionary,
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Single => write!(f, "Single"),
            PortType::List => write!(f, "List"),
            PortType::Dictionary => write!(f, "Dictionary"),
        }
    }
}

impl From<PinType> for PortType {
    fn from(value: PinType) -> Self {
        match value {
            PinType::Single => PortType::Single,
            PinType::List => PortType::List,
            PinType::Dictionary => PortType::Dictionary,
        }
    }
}

/// Reference to a pin on a block.
///
/// Either side may carry a dotted index (`"tools.2"`, `"values.key"`) when it
/// addresses an element of a List/Dictionary port or pin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPinRef {
    pub port: String,
    pub pin: String,
}

impl BlockPinRef {
    pub fn new(port: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            pin: pin.into(),
        }
    }

    /// Split into `(port, port_index, pin, pin_index)`.
    pub fn address(&self) -> PinAddress<'_> {
        let (port, port_index) = split_index(&self.port);
        let (pin, pin_index) = split_index(&self.pin);
        PinAddress {
            port,
            port_index,
            pin,
            pin_index,
        }
    }
}

impl fmt::Display for BlockPinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pin.is_empty() {
            write!(f, "{}", self.port)
        } else {
            write!(f, "{}/{}", self.port, self.pin)
        }
    }
}

/// A parsed [`BlockPinRef`]. Indexes are empty when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAddress<'a> {
    pub port: &'a str,
    pub port_index: &'a str,
    pub pin: &'a str,
    pub pin_index: &'a str,
}

fn split_index(path: &str) -> (&str, &str) {
    path.split_once('.').unwrap_or((path, ""))
}

/// Join a name and an index into the dotted addressing form.
pub fn indexed(name: &str, index: &str) -> String {
    if index.is_empty() {
        name.to_string()
    } else {
        format!("{name}.{index}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPinInterface {
    #[serde(default)]
    pub metadata: Metadata,
    pub sticky: bool,
    #[serde(rename = "schema")]
    pub json_schema: Value,
    /// Generic name -> the pin on this block that supplies its concrete schema.
    #[serde(default)]
    pub generics: IndexMap<String, BlockPinRef>,
    #[serde(rename = "type")]
    pub pin_type: PinType,
    pub required: bool,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPinInterface {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(rename = "schema")]
    pub json_schema: Value,
    #[serde(default)]
    pub generics: IndexMap<String, BlockPinRef>,
    #[serde(rename = "type")]
    pub pin_type: PinType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortInterface {
    #[serde(default)]
    pub metadata: Metadata,
    pub inputs: IndexMap<String, InputPinInterface>,
    pub outputs: IndexMap<String, OutputPinInterface>,
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(rename = "isFunction")]
    pub is_function: bool,
}

impl PortInterface {
    /// A port whose only pin is the unnamed `""` pin behaves like a plain value
    /// (input) or a plain emitter (output) rather than a composite object.
    pub fn is_bare(&self) -> bool {
        !self.is_function
            && self.inputs.len() + self.outputs.len() == 1
            && (self.inputs.contains_key("") || self.outputs.contains_key(""))
    }

    pub fn is_tool(&self) -> bool {
        self.metadata.get("tool").and_then(Value::as_bool) == Some(true)
    }

    /// A function port resumed by tool results rather than by flow inputs.
    pub fn is_callback(&self) -> bool {
        self.is_function && self.metadata.get("callback").and_then(Value::as_bool) == Some(true)
    }

    pub fn is_config(&self) -> bool {
        self.inputs
            .get("")
            .map(|pin| pin.is_config())
            .unwrap_or(false)
    }

    pub fn is_generic(&self) -> bool {
        self.inputs
            .get("")
            .map(|pin| pin.is_generic())
            .unwrap_or(false)
    }
}

impl InputPinInterface {
    pub fn is_config(&self) -> bool {
        self.metadata.get("config").and_then(Value::as_bool) == Some(true)
    }

    pub fn is_generic(&self) -> bool {
        self.metadata.get("generic").and_then(Value::as_bool) == Some(true)
    }
}

/// A value persisted across invocations, bucketed by the values received on
/// `scope`. An empty scope means one bucket for the whole instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInterface {
    #[serde(default)]
    pub metadata: Metadata,
    pub scope: Vec<BlockPinRef>,
    pub default: Value,
    #[serde(rename = "schema", default)]
    pub json_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInterface {
    #[serde(default)]
    pub metadata: Metadata,
    pub ports: IndexMap<String, PortInterface>,
    pub state: IndexMap<String, StateInterface>,
}

impl BlockInterface {
    pub fn port(&self, name: &str) -> Option<&PortInterface> {
        self.ports.get(name)
    }

    /// Ports backed by a Step or Callback.
    pub fn functions(&self) -> impl Iterator<Item = (&String, &PortInterface)> {
        self.ports.iter().filter(|(_, port)| port.is_function)
    }
}

/// Identifies a block implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockType {
    pub name: String,
    pub version: String,
}

impl BlockType {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pin_address_splits_indexes() {
        let target = BlockPinRef::new("tools.2", "args.key");
        let address = target.address();
        assert_eq!(address.port, "tools");
        assert_eq!(address.port_index, "2");
        assert_eq!(address.pin, "args");
        assert_eq!(address.pin_index, "key");

        let plain = BlockPinRef::new("items", "");
        let address = plain.address();
        assert_eq!(address.port, "items");
        assert_eq!(address.port_index, "");
        assert_eq!(address.pin, "");
    }

    #[test]
    fn test_port_interface_wire_names() {
        let port = PortInterface {
            metadata: Metadata::new(),
            inputs: IndexMap::new(),
            outputs: IndexMap::from([(
                "".to_string(),
                OutputPinInterface {
                    metadata: Metadata::new(),
                    json_schema: json!({"type": "string"}),
                    generics: IndexMap::new(),
                    pin_type: PinType::Single,
                },
            )]),
            port_type: PortType::List,
            is_function: false,
        };

        let wire = serde_json::to_value(&port).unwrap();
        assert_eq!(wire["isFunction"], json!(false));
        assert_eq!(wire["type"], json!("List"));
        assert_eq!(wire["outputs"][""]["schema"], json!({"type": "string"}));
        assert!(port.is_bare());
    }

    #[test]
    fn test_interface_json_round_trip() {
        use crate::builder::build_interface;
        use crate::decl::{BlockDecl, Container, FieldDecl, FunctionDecl, ParamDecl, ToolSignature};
        use crate::schema::TypeDescriptor;

        let items = TypeDescriptor::array(TypeDescriptor::Any);
        let decl = BlockDecl::new("Fanout_1_2")
            .metadata("description", json!("Runs a tool per item"))
            .field(FieldDecl::config("label", TypeDescriptor::String, Some(json!("x"))))
            .field(FieldDecl::tool(
                "run",
                ToolSignature::new()
                    .param(ParamDecl::new("item", TypeDescriptor::Any))
                    .returns(TypeDescriptor::Any),
            ))
            .field(FieldDecl::outputs("results", TypeDescriptor::Any, Container::Dictionary))
            .field(FieldDecl::state("pending", TypeDescriptor::Integer, json!(0)).scoped_to("start", ["items"]))
            .function(FunctionDecl::step("start").param(ParamDecl::new("items", items)))
            .function(
                FunctionDecl::callback("collect")
                    .param(ParamDecl::new("result", TypeDescriptor::Any))
                    .param(ParamDecl::var_keyword("extra", TypeDescriptor::Any)),
            );
        let interface = build_interface(&decl).unwrap();

        let first = serde_json::to_string(&interface).unwrap();
        let parsed: BlockInterface = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed, interface);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), first);
    }
}

