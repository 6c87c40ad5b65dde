//! Messages exchanged between the runtime and the orchestrator.

use crate::interface::BlockPinRef;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A value delivered to an input pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputValue {
    pub target: BlockPinRef,
    pub value: Value,
}

impl InputValue {
    pub fn new(port: impl Into<String>, pin: impl Into<String>, value: Value) -> Self {
        Self {
            target: BlockPinRef::new(port, pin),
            value,
        }
    }
}

/// A value emitted on an output pin. `index` increases monotonically per pin
/// within one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub source: BlockPinRef,
    pub value: Value,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateValue {
    pub state: String,
    pub value: Value,
}

impl StateValue {
    pub fn new(state: impl Into<String>, value: Value) -> Self {
        Self {
            state: state.into(),
            value,
        }
    }
}

/// Route the next value produced on `source` to `target` instead of its
/// normal consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRedirect {
    pub source: BlockPinRef,
    pub target: BlockPinRef,
}

/// One unit of output from an invocation.
///
/// `Output::emit` produces a message with a single output; a tool call produces
/// one message holding its trigger outputs plus the redirects and literal
/// callback inputs attached by `.then()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockMessage {
    #[serde(default)]
    pub outputs: Vec<OutputValue>,
    #[serde(default)]
    pub inputs: Vec<InputValue>,
    #[serde(default)]
    pub redirects: Vec<PinRedirect>,
    #[serde(default)]
    pub states: Vec<StateValue>,
}

impl BlockMessage {
    pub fn output(output: OutputValue) -> Self {
        Self {
            outputs: vec![output],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
            && self.inputs.is_empty()
            && self.redirects.is_empty()
            && self.states.is_empty()
    }
}

/// Everything one invocation produced, handed over atomically on completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationBatch {
    pub messages: Vec<BlockMessage>,
}

impl InvocationBatch {
    pub fn outputs(&self) -> impl Iterator<Item = &OutputValue> {
        self.messages.iter().flat_map(|m| m.outputs.iter())
    }

    /// Values emitted on `port`/`pin`, in emission order.
    pub fn outputs_on<'a>(
        &'a self,
        port: &'a str,
        pin: &'a str,
    ) -> impl Iterator<Item = &'a OutputValue> + 'a {
        self.outputs()
            .filter(move |o| o.source.port == port && o.source.pin == pin)
    }

    pub fn states(&self) -> impl Iterator<Item = &StateValue> {
        self.messages.iter().flat_map(|m| m.states.iter())
    }

    pub fn redirects(&self) -> impl Iterator<Item = &PinRedirect> {
        self.messages.iter().flat_map(|m| m.redirects.iter())
    }

    pub fn is_error(&self) -> bool {
        self.outputs().any(|o| o.source.port == ERROR_PORT)
    }
}

/// Name of the implicit, hidden output port every block carries.
pub const ERROR_PORT: &str = "error";

/// Payload of the implicit `error` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlockError {
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// An error a block body can return to attach structured data to its `error`
/// output. Any other error surfaces with `data: null`.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct BlockFailure {
    pub message: String,
    pub data: Value,
}

impl BlockFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Names the callback a tool result resumes, the parameter that receives the
/// result, and the literal parameters bound when the call was made.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackCall {
    pub name: String,
    #[serde(rename = "resultParam")]
    pub result_param: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl CallbackCall {
    pub fn new(name: impl Into<String>, result_param: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result_param: result_param.into(),
            params: serde_json::Map::new(),
        }
    }

    /// Bind a literal parameter. Values that fail to serialise bind as null.
    pub fn with(mut self, param: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.params.insert(param.into(), value);
        self
    }
}

/// A request to run one function of a registered block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockRunRequest {
    pub name: String,
    pub version: String,
    pub function: String,
    #[serde(default)]
    pub state: Vec<StateValue>,
    #[serde(default)]
    pub inputs: Vec<InputValue>,
    #[serde(rename = "dynamicOutputs", default)]
    pub dynamic_outputs: Vec<BlockPinRef>,
    #[serde(rename = "dynamicInputs", default)]
    pub dynamic_inputs: Vec<BlockPinRef>,
}
