//! # Live instances
//!
//! A [`LiveInstance`] is the slot table of one block for one invocation: every
//! port of the interface becomes a [`PortSlot`], states hold their current
//! values, and function ports buffer the pin values they will be called with.
//!
//! List ports and pins grow 0-based and contiguously. Writing index `k` past the
//! end pads the gap with nulls, up to `instance.max_index_skew` past the
//! current length.

use crate::error::{Result, RuntimeError};
use crate::validate;
use blockflow_core::{
    indexed, BlockDefinition, BlockInterface, BlockPinRef, BlockType, InputPinInterface,
    InputValue, InstanceConfig, PinType, PortInterface, PortType, StateValue,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Values buffered on one pin.
#[derive(Debug, Clone, PartialEq)]
pub enum PinSlot {
    Single(Option<Value>),
    List(Vec<Value>),
    Dictionary(IndexMap<String, Value>),
}

impl PinSlot {
    pub fn empty(pin_type: PinType) -> Self {
        match pin_type {
            PinType::Single => PinSlot::Single(None),
            PinType::List => PinSlot::List(Vec::new()),
            PinType::Dictionary => PinSlot::Dictionary(IndexMap::new()),
        }
    }
}

/// Pending pin values of a function port, keyed by pin name.
pub type PendingInputs = IndexMap<String, PinSlot>;

/// One materialised port (or one element of a List/Dictionary port).
#[derive(Debug, Clone, PartialEq)]
pub enum PortObject {
    /// A port whose only pin is an input `""`.
    Value(Value),
    /// A port whose only pin is an output `""`.
    Emitter(BlockPinRef),
    Composite {
        inputs: IndexMap<String, PinSlot>,
        outputs: IndexMap<String, BlockPinRef>,
    },
    Function(PendingInputs),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortSlot {
    Single(PortObject),
    /// `None` marks padding that was never written.
    List(Vec<Option<PortObject>>),
    Dictionary(IndexMap<String, PortObject>),
}

impl PortSlot {
    /// Indexes or keys of the elements present, in order.
    pub fn indexes(&self) -> Vec<String> {
        match self {
            PortSlot::Single(_) => Vec::new(),
            PortSlot::List(items) => items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.is_some())
                .map(|(i, _)| i.to_string())
                .collect(),
            PortSlot::Dictionary(entries) => entries.keys().cloned().collect(),
        }
    }
}

/// Dynamic port elements known when the block was placed, such as the
/// number of parallel tool calls wired to a List tool port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicPorts {
    #[serde(default)]
    pub inputs: Vec<BlockPinRef>,
    #[serde(default)]
    pub outputs: Vec<BlockPinRef>,
}

#[derive(Debug, Clone)]
pub struct LiveInstance {
    block_type: BlockType,
    interface: Arc<BlockInterface>,
    ports: IndexMap<String, PortSlot>,
    states: IndexMap<String, Value>,
    limits: InstanceConfig,
}

impl LiveInstance {
    /// Build the slot table for `definition` and apply, in order, dynamic
    /// shapes, configs, states and inputs.
    pub fn materialize(
        interface: Arc<BlockInterface>,
        definition: &BlockDefinition,
        states: &[StateValue],
        inputs: &[InputValue],
        shapes: &DynamicPorts,
        limits: &InstanceConfig,
    ) -> Result<Self> {
        let mut ports = IndexMap::new();
        for (name, port) in &interface.ports {
            let slot = match port.port_type {
                _ if port.is_function => PortSlot::Single(PortObject::Function(IndexMap::new())),
                PortType::Single => PortSlot::Single(new_object(name, port)),
                PortType::List => PortSlot::List(Vec::new()),
                PortType::Dictionary => PortSlot::Dictionary(IndexMap::new()),
            };
            ports.insert(name.clone(), slot);
        }

        let mut instance = Self {
            block_type: definition.block_type.clone(),
            states: interface
                .state
                .iter()
                .map(|(name, state)| (name.clone(), state.default.clone()))
                .collect(),
            interface,
            ports,
            limits: limits.clone(),
        };

        for (tool_id, tool) in &definition.tools {
            instance.ensure_element(&BlockPinRef::new(tool_id.clone(), ""))?;
            if let Value::Object(pins) = &tool.configs {
                for (pin, value) in pins {
                    instance.apply_input(&BlockPinRef::new(tool_id.clone(), pin.clone()), value.clone())?;
                }
            }
        }
        for target in shapes.inputs.iter().chain(shapes.outputs.iter()) {
            instance.ensure_element(target)?;
        }

        for (name, config) in &definition.configs {
            instance.apply_input(&BlockPinRef::new(name.clone(), ""), config.value.clone())?;
        }

        for state in states {
            instance.apply_state(state)?;
        }

        for input in inputs {
            instance.apply_input(&input.target, input.value.clone())?;
        }

        Ok(instance)
    }

    pub fn block_type(&self) -> &BlockType {
        &self.block_type
    }

    pub fn interface(&self) -> &Arc<BlockInterface> {
        &self.interface
    }

    pub fn limits(&self) -> &InstanceConfig {
        &self.limits
    }

    pub fn port(&self, name: &str) -> Option<&PortSlot> {
        self.ports.get(name)
    }

    /// The value of a bare input port, such as a config.
    pub fn value(&self, port: &str) -> Option<&Value> {
        match self.ports.get(port) {
            Some(PortSlot::Single(PortObject::Value(value))) => Some(value),
            _ => None,
        }
    }

    pub fn state(&self, name: &str) -> Option<&Value> {
        self.states.get(name)
    }

    pub fn states(&self) -> &IndexMap<String, Value> {
        &self.states
    }

    pub fn set_state(&mut self, name: &str, value: Value) -> Result<()> {
        let slot = self
            .states
            .get_mut(name)
            .ok_or_else(|| RuntimeError::UnknownState {
                block: self.block_type.to_string(),
                state: name.to_string(),
            })?;
        *slot = value;
        Ok(())
    }

    pub(crate) fn replace_states(&mut self, states: IndexMap<String, Value>) {
        self.states = states;
    }

    pub fn pending(&self, function: &str) -> Option<&PendingInputs> {
        match self.ports.get(function) {
            Some(PortSlot::Single(PortObject::Function(pending))) => Some(pending),
            _ => None,
        }
    }

    pub(crate) fn take_pending(&mut self, function: &str) -> PendingInputs {
        match self.ports.get_mut(function) {
            Some(PortSlot::Single(PortObject::Function(pending))) => std::mem::take(pending),
            _ => IndexMap::new(),
        }
    }

    pub(crate) fn restore_pending(&mut self, function: &str, restored: PendingInputs) {
        if let Some(PortSlot::Single(PortObject::Function(pending))) = self.ports.get_mut(function)
        {
            *pending = restored;
        }
    }

    fn apply_state(&mut self, state: &StateValue) -> Result<()> {
        let Some(interface) = self.interface.state.get(&state.state) else {
            if self.limits.strict_inputs {
                return Err(RuntimeError::UnknownState {
                    block: self.block_type.to_string(),
                    state: state.state.clone(),
                });
            }
            tracing::debug!(state = %state.state, "ignoring value for undeclared state");
            return Ok(());
        };
        validate::check(&state.state, &interface.json_schema, &state.value)?;
        self.states.insert(state.state.clone(), state.value.clone());
        Ok(())
    }

    /// Route one input value to its slot.
    ///
    /// An empty pin addresses the port's own singular input; otherwise the
    /// named pin of the element at the port index. Function ports buffer the
    /// value until the function runs.
    pub fn apply_input(&mut self, target: &BlockPinRef, value: Value) -> Result<()> {
        let address = target.address();
        let interface = Arc::clone(&self.interface);
        let Some(port) = interface.port(address.port) else {
            return self.unknown(RuntimeError::UnknownPort {
                block: self.block_type.to_string(),
                port: address.port.to_string(),
            });
        };

        let pin_name = if port.is_bare() || address.pin.is_empty() {
            ""
        } else {
            address.pin
        };
        let Some(pin) = port.inputs.get(pin_name) else {
            return self.unknown(RuntimeError::UnknownPin {
                block: self.block_type.to_string(),
                port: address.port.to_string(),
                pin: address.pin.to_string(),
            });
        };

        let max_skew = self.limits.max_index_skew;
        let label = target.to_string();

        if port.is_function {
            let Some(PortSlot::Single(PortObject::Function(pending))) =
                self.ports.get_mut(address.port)
            else {
                return Ok(());
            };
            let slot = pending
                .entry(pin_name.to_string())
                .or_insert_with(|| PinSlot::empty(pin.pin_type));
            return set_pin(slot, pin, address.pin_index, value, &label, max_skew);
        }

        if port.port_type != PortType::Single && address.port_index.is_empty() && port.is_bare() {
            return self.replace_elements(address.port, port, pin, value, &label);
        }

        let object = self.element_mut(address.port, address.port_index, port, &label)?;
        match object {
            PortObject::Value(current) => {
                validate::check(&label, &pin.json_schema, &value)?;
                *current = value;
                Ok(())
            }
            PortObject::Composite { inputs, .. } => {
                let slot = inputs
                    .entry(pin_name.to_string())
                    .or_insert_with(|| PinSlot::empty(pin.pin_type));
                set_pin(slot, pin, address.pin_index, value, &label, max_skew)
            }
            PortObject::Emitter(_) | PortObject::Function(_) => {
                Err(RuntimeError::UnknownPin {
                    block: self.block_type.to_string(),
                    port: address.port.to_string(),
                    pin: address.pin.to_string(),
                })
            }
        }
    }

    /// Assign every element of a List/Dictionary value port at once.
    fn replace_elements(
        &mut self,
        name: &str,
        port: &PortInterface,
        pin: &InputPinInterface,
        value: Value,
        label: &str,
    ) -> Result<()> {
        let Some(slot) = self.ports.get_mut(name) else {
            return Ok(());
        };
        match (slot, value) {
            (PortSlot::List(items), Value::Array(values)) => {
                for item in &values {
                    validate::check(label, &pin.json_schema, item)?;
                }
                *items = values.into_iter().map(|v| Some(PortObject::Value(v))).collect();
            }
            (PortSlot::Dictionary(entries), Value::Object(values)) => {
                for item in values.values() {
                    validate::check(label, &pin.json_schema, item)?;
                }
                *entries = values
                    .into_iter()
                    .map(|(k, v)| (k, PortObject::Value(v)))
                    .collect();
            }
            (PortSlot::List(_), _) => {
                return Err(RuntimeError::ShapeMismatch {
                    target: label.to_string(),
                    expected: "a list".to_string(),
                });
            }
            (_, _) if port.port_type == PortType::Dictionary => {
                return Err(RuntimeError::ShapeMismatch {
                    target: label.to_string(),
                    expected: "a dictionary".to_string(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    /// Make sure the element addressed by `target.port` exists.
    pub fn ensure_element(&mut self, target: &BlockPinRef) -> Result<()> {
        let address = target.address();
        let interface = Arc::clone(&self.interface);
        let Some(port) = interface.port(address.port) else {
            return self.unknown(RuntimeError::UnknownPort {
                block: self.block_type.to_string(),
                port: address.port.to_string(),
            });
        };
        if port.port_type == PortType::Single || address.port_index.is_empty() {
            return Ok(());
        }
        self.element_mut(address.port, address.port_index, port, &target.to_string())
            .map(|_| ())
    }

    /// The element at `index` of `port`, created (and padded up to) on demand.
    pub(crate) fn element_mut(
        &mut self,
        name: &str,
        index: &str,
        port: &PortInterface,
        label: &str,
    ) -> Result<&mut PortObject> {
        let max_skew = self.limits.max_index_skew;
        let Some(slot) = self.ports.get_mut(name) else {
            return Err(RuntimeError::UnknownPort {
                block: self.block_type.to_string(),
                port: name.to_string(),
            });
        };

        match slot {
            PortSlot::Single(object) => Ok(object),
            PortSlot::List(items) => {
                let position = parse_index(label, index)?;
                let entry = padded(items, position, max_skew, label, || None)?;
                Ok(entry.get_or_insert_with(|| new_object(&indexed(name, index), port)))
            }
            PortSlot::Dictionary(entries) => {
                if index.is_empty() {
                    return Err(RuntimeError::ShapeMismatch {
                        target: label.to_string(),
                        expected: "addressed with a dictionary key".to_string(),
                    });
                }
                Ok(entries
                    .entry(index.to_string())
                    .or_insert_with(|| new_object(&indexed(name, index), port)))
            }
        }
    }

    fn unknown(&self, error: RuntimeError) -> Result<()> {
        if self.limits.strict_inputs {
            Err(error)
        } else {
            tracing::warn!(block = %self.block_type, %error, "ignoring input for undeclared target");
            Ok(())
        }
    }
}

fn new_object(name: &str, port: &PortInterface) -> PortObject {
    if port.is_bare() {
        if let Some(pin) = port.inputs.get("") {
            return PortObject::Value(pin.default.clone());
        }
        return PortObject::Emitter(BlockPinRef::new(name, ""));
    }

    PortObject::Composite {
        inputs: port
            .inputs
            .iter()
            .map(|(pin_name, pin)| (pin_name.clone(), default_slot(pin)))
            .collect(),
        outputs: port
            .outputs
            .keys()
            .map(|pin_name| (pin_name.clone(), BlockPinRef::new(name, pin_name.clone())))
            .collect(),
    }
}

fn default_slot(pin: &InputPinInterface) -> PinSlot {
    match pin.pin_type {
        PinType::Single if !pin.required => PinSlot::Single(Some(pin.default.clone())),
        other => PinSlot::empty(other),
    }
}

fn set_pin(
    slot: &mut PinSlot,
    pin: &InputPinInterface,
    index: &str,
    value: Value,
    label: &str,
    max_skew: usize,
) -> Result<()> {
    match slot {
        PinSlot::Single(current) => {
            validate::check(label, &pin.json_schema, &value)?;
            *current = Some(value);
        }
        PinSlot::List(items) if index.is_empty() => {
            let Value::Array(values) = value else {
                return Err(RuntimeError::ShapeMismatch {
                    target: label.to_string(),
                    expected: "a list".to_string(),
                });
            };
            for item in &values {
                validate::check(label, &pin.json_schema, item)?;
            }
            *items = values;
        }
        PinSlot::List(items) => {
            validate::check(label, &pin.json_schema, &value)?;
            let position = parse_index(label, index)?;
            *padded(items, position, max_skew, label, || Value::Null)? = value;
        }
        PinSlot::Dictionary(entries) if index.is_empty() => {
            let Value::Object(values) = value else {
                return Err(RuntimeError::ShapeMismatch {
                    target: label.to_string(),
                    expected: "a dictionary".to_string(),
                });
            };
            for item in values.values() {
                validate::check(label, &pin.json_schema, item)?;
            }
            *entries = values.into_iter().collect();
        }
        PinSlot::Dictionary(entries) => {
            validate::check(label, &pin.json_schema, &value)?;
            entries.insert(index.to_string(), value);
        }
    }
    Ok(())
}

fn parse_index(label: &str, index: &str) -> Result<usize> {
    index.parse().map_err(|_| RuntimeError::InvalidIndex {
        target: label.to_string(),
        index: index.to_string(),
    })
}

/// Slot `index` of `items`, growing the list with `fill` so that it exists.
fn padded<'a, T>(
    items: &'a mut Vec<T>,
    index: usize,
    max_skew: usize,
    label: &str,
    mut fill: impl FnMut() -> T,
) -> Result<&'a mut T> {
    let skew = index.saturating_sub(items.len());
    if skew > max_skew {
        return Err(RuntimeError::IndexSkew {
            target: label.to_string(),
            index,
            skew,
            max: max_skew,
        });
    }
    while items.len() <= index {
        items.push(fill());
    }
    Ok(&mut items[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockflow_core::{
        build_interface, compile_unvalidated, BlockDecl, BlockPlacement, Container, FieldDecl,
        FunctionDecl, ParamDecl, PinDecl, PortDecl, ToolSignature, TypeDescriptor,
    };
    use serde_json::json;

    fn interface() -> Arc<BlockInterface> {
        let decl = BlockDecl::new("Slots")
            .field(FieldDecl::config("prefix", TypeDescriptor::String, Some(json!(">"))))
            .field(FieldDecl::input("values", TypeDescriptor::Integer, false).container(Container::List))
            .field(
                FieldDecl::port(
                    "routes",
                    PortDecl::new()
                        .tool(ToolSignature::new().param(ParamDecl::new("message", TypeDescriptor::String)))
                        .pin(PinDecl::config("weight", TypeDescriptor::Integer, Some(json!(1)))),
                )
                .container(Container::Dictionary),
            )
            .field(FieldDecl::outputs("results", TypeDescriptor::Any, Container::List))
            .field(FieldDecl::state("total", TypeDescriptor::Integer, json!(0)))
            .function(
                FunctionDecl::step("join")
                    .param(ParamDecl::var_positional("strings", TypeDescriptor::String))
                    .param(ParamDecl::var_keyword("extra", TypeDescriptor::Any))
                    .param(ParamDecl::new("separator", TypeDescriptor::String)),
            );
        Arc::new(build_interface(&decl).unwrap())
    }

    fn definition(interface: &BlockInterface) -> BlockDefinition {
        let placement = BlockPlacement::new("slots", BlockType::new("Slots", "1.0.0"))
            .tool("routes", json!({"left": {}}));
        compile_unvalidated(interface, &placement).unwrap()
    }

    fn materialize(inputs: &[InputValue]) -> Result<LiveInstance> {
        let interface = interface();
        let definition = definition(&interface);
        LiveInstance::materialize(
            interface,
            &definition,
            &[],
            inputs,
            &DynamicPorts::default(),
            &InstanceConfig::default(),
        )
    }

    #[test]
    fn test_defaults_and_configs() {
        let instance = materialize(&[]).unwrap();
        assert_eq!(instance.value("prefix"), Some(&json!(">")));
        assert_eq!(instance.state("total"), Some(&json!(0)));
        assert_eq!(instance.port("routes").map(PortSlot::indexes), Some(vec!["left".to_string()]));
    }

    #[test]
    fn test_list_port_padding() {
        let instance = materialize(&[InputValue::new("values.3", "", json!(7))]).unwrap();
        let Some(PortSlot::List(items)) = instance.port("values") else {
            panic!("expected a list port");
        };
        assert_eq!(items.len(), 4);
        assert!(items[..3].iter().all(Option::is_none));
        assert_eq!(items[3], Some(PortObject::Value(json!(7))));
    }

    #[test]
    fn test_list_pin_padding_and_overwrite() {
        let instance = materialize(&[
            InputValue::new("join", "strings.2", json!("c")),
            InputValue::new("join", "strings.0", json!("a")),
            InputValue::new("join", "extra.mode", json!(true)),
        ])
        .unwrap();
        let pending = instance.pending("join").unwrap();
        assert_eq!(
            pending["strings"],
            PinSlot::List(vec![json!("a"), Value::Null, json!("c")])
        );
        assert_eq!(
            pending["extra"],
            PinSlot::Dictionary(IndexMap::from([("mode".to_string(), json!(true))]))
        );
    }

    #[test]
    fn test_non_integer_index() {
        let err = materialize(&[InputValue::new("values.first", "", json!(1))]).unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Indexes on list Ports/Pins must be valid integers"));
    }

    #[test]
    fn test_index_skew_is_capped() {
        let interface = interface();
        let definition = definition(&interface);
        let limits = InstanceConfig {
            max_index_skew: 2,
            strict_inputs: true,
        };
        let result = LiveInstance::materialize(
            interface,
            &definition,
            &[],
            &[InputValue::new("values.5", "", json!(1))],
            &DynamicPorts::default(),
            &limits,
        );
        assert!(matches!(result, Err(RuntimeError::IndexSkew { skew: 5, max: 2, .. })));
    }

    #[test]
    fn test_unknown_targets_follow_strictness() {
        let err = materialize(&[InputValue::new("nope", "", json!(1))]).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownPort { .. }));

        let err = materialize(&[InputValue::new("join", "missing", json!(1))]).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownPin { .. }));

        let interface = interface();
        let definition = definition(&interface);
        let lenient = InstanceConfig {
            strict_inputs: false,
            ..InstanceConfig::default()
        };
        assert!(LiveInstance::materialize(
            interface,
            &definition,
            &[],
            &[InputValue::new("nope", "", json!(1))],
            &DynamicPorts::default(),
            &lenient,
        )
        .is_ok());
    }

    #[test]
    fn test_values_are_schema_checked() {
        let err = materialize(&[InputValue::new("values.0", "", json!("seven"))]).unwrap_err();
        assert!(matches!(err, RuntimeError::SchemaMismatch { .. }));

        let interface = interface();
        let definition = definition(&interface);
        let err = LiveInstance::materialize(
            interface,
            &definition,
            &[StateValue::new("total", json!("lots"))],
            &[],
            &DynamicPorts::default(),
            &InstanceConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_composite_pin_and_dynamic_shapes() {
        let interface = interface();
        let definition = definition(&interface);
        let shapes = DynamicPorts {
            inputs: vec![],
            outputs: vec![BlockPinRef::new("results.1", "")],
        };
        let instance = LiveInstance::materialize(
            interface,
            &definition,
            &[],
            &[InputValue::new("routes.right", "weight", json!(3))],
            &shapes,
            &InstanceConfig::default(),
        )
        .unwrap();

        let Some(PortSlot::Dictionary(routes)) = instance.port("routes") else {
            panic!("expected a dictionary port");
        };
        let Some(PortObject::Composite { inputs, outputs }) = routes.get("right") else {
            panic!("expected a composite element");
        };
        assert_eq!(inputs["weight"], PinSlot::Single(Some(json!(3))));
        assert_eq!(outputs["message"], BlockPinRef::new("routes.right", "message"));

        let Some(PortSlot::List(results)) = instance.port("results") else {
            panic!("expected a list port");
        };
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[1],
            Some(PortObject::Emitter(BlockPinRef::new("results.1", "")))
        );
    }
}
