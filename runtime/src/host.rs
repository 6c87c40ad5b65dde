//! # Block hosts
//!
//! A [`BlockHost`] drives one placed block through one flow execution. Each
//! call materialises a fresh [`LiveInstance`] from what the host remembers
//! between invocations:
//!
//! - sticky pin values, reused when no new value arrives on that pin
//! - state buckets, one per distinct combination of scope pin values
//! - outstanding tool calls and the callbacks they resume
//!
//! Every value a host emits is registered as a [`FlowValue`] whose parents are
//! the flow values its invocation consumed.

use crate::engine::{error_message, Engine};
use crate::error::{Result, RuntimeError};
use crate::instance::{DynamicPorts, LiveInstance};
use crate::provenance::{FlowValueRegistry, ProvenanceTracker};
use crate::registry::RegisteredBlock;
use crate::subscription::{PendingCallbacks, Resolution, Resumption, ToolSubscriptions};
use ahash::AHashMap;
use blockflow_core::{
    canonical_json, indexed, BlockDefinition, BlockMessage, BlockPinRef, FlowValue, InputValue,
    InvocationBatch, ProvenanceConfig, StateValue, ValueSourceRef, TOOL_RETURN_PIN,
};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

/// The FlowValue graph of one flow execution. Hosts placed in the same scope
/// share it; dropping the last clone releases every value.
#[derive(Debug, Clone)]
pub struct FlowScope {
    values: Arc<FlowValueRegistry>,
    tracker: Arc<ProvenanceTracker>,
}

impl FlowScope {
    pub fn new(config: &ProvenanceConfig) -> Self {
        let values = Arc::new(FlowValueRegistry::new());
        let tracker = Arc::new(ProvenanceTracker::new(Arc::clone(&values), config));
        Self { values, tracker }
    }

    /// Register a value entering the flow from outside.
    pub fn root(&self, flow_input_id: &str, value: Value) -> Result<Arc<FlowValue>> {
        self.register(FlowValue::root(flow_input_id, value))
    }

    pub fn register(&self, value: FlowValue) -> Result<Arc<FlowValue>> {
        Ok(self.values.register(value)?)
    }

    pub fn values(&self) -> &Arc<FlowValueRegistry> {
        &self.values
    }

    pub fn tracker(&self) -> &Arc<ProvenanceTracker> {
        &self.tracker
    }
}

/// A value bound to an input pin, with the flow value it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundValue {
    pub target: BlockPinRef,
    pub value: Value,
    pub source: Option<Arc<FlowValue>>,
}

impl BoundValue {
    pub fn flow(port: impl Into<String>, pin: impl Into<String>, source: Arc<FlowValue>) -> Self {
        Self {
            target: BlockPinRef::new(port, pin),
            value: source.value.clone(),
            source: Some(source),
        }
    }

    pub fn literal(port: impl Into<String>, pin: impl Into<String>, value: Value) -> Self {
        Self {
            target: BlockPinRef::new(port, pin),
            value,
            source: None,
        }
    }
}

/// The batch of one invocation and the flow values registered for its
/// outputs, in output order.
#[derive(Debug, Clone, Default)]
pub struct HostOutcome {
    pub batch: InvocationBatch,
    pub values: Vec<Arc<FlowValue>>,
}

impl HostOutcome {
    /// Flow values emitted on `port`/`pin`.
    pub fn values_on<'a>(&'a self, port: &'a str, pin: &'a str) -> impl Iterator<Item = &'a Arc<FlowValue>> + 'a {
        self.batch
            .outputs()
            .zip(self.values.iter())
            .filter(move |(output, _)| output.source.port == port && output.source.pin == pin)
            .map(|(_, value)| value)
    }
}

pub struct BlockHost {
    block_id: String,
    registered: Arc<RegisteredBlock>,
    definition: BlockDefinition,
    engine: Arc<Engine>,
    scope: FlowScope,
    sticky: IndexMap<BlockPinRef, BoundValue>,
    /// state -> bucket key -> value
    buckets: AHashMap<String, AHashMap<String, Value>>,
    current_keys: IndexMap<String, String>,
    subscriptions: ToolSubscriptions,
    shapes: DynamicPorts,
}

impl BlockHost {
    pub(crate) fn new(
        engine: Arc<Engine>,
        scope: FlowScope,
        registered: Arc<RegisteredBlock>,
        definition: BlockDefinition,
    ) -> Self {
        let subscriptions = ToolSubscriptions::new(engine.config().subscriptions.max_pending_per_tool);
        Self {
            block_id: definition.id.clone(),
            registered,
            definition,
            engine,
            scope,
            sticky: IndexMap::new(),
            buckets: AHashMap::new(),
            current_keys: IndexMap::new(),
            subscriptions,
            shapes: DynamicPorts::default(),
        }
    }

    /// Dynamic port elements to create on every materialisation.
    pub fn with_shapes(mut self, shapes: DynamicPorts) -> Self {
        self.shapes = shapes;
        self
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn definition(&self) -> &BlockDefinition {
        &self.definition
    }

    pub fn scope(&self) -> &FlowScope {
        &self.scope
    }

    pub fn pending_calls(&self, tool: &str) -> usize {
        self.subscriptions.pending(tool)
    }

    /// Drop every outstanding tool call of this host.
    pub fn cancel_subscriptions(&mut self) -> usize {
        let dropped = self.subscriptions.cancel_all();
        if dropped > 0 {
            tracing::debug!(block = %self.block_id, dropped, "cancelled tool subscriptions");
        }
        dropped
    }

    /// The value a state holds in the bucket selected by `key`.
    pub fn state_in_bucket(&self, state: &str, key: &str) -> Option<&Value> {
        self.buckets.get(state).and_then(|bucket| bucket.get(key))
    }

    /// Run a step with `inputs` plus any remembered sticky values.
    pub async fn run_step(&mut self, step: &str, inputs: Vec<BoundValue>) -> Result<HostOutcome> {
        let is_step = self
            .registered
            .interface()
            .port(step)
            .map(|port| port.is_function && !port.is_callback())
            .unwrap_or(false);
        if !is_step {
            return Err(RuntimeError::UnknownFunction {
                block: self.registered.block_type().to_string(),
                function: step.to_string(),
            });
        }
        self.run_function(step, inputs, None).await
    }

    /// Hand a value produced by tool `tool` to the call it answers and run the
    /// callbacks that call registered. Unmatched values produce nothing.
    ///
    /// The call is consumed either way. A callback that cannot run yields an
    /// outcome holding only an `error` value, and the remaining callbacks
    /// still run.
    pub async fn deliver(&mut self, tool: &str, inbound: Arc<FlowValue>) -> Result<Vec<HostOutcome>> {
        let resolution = self
            .subscriptions
            .check_value(tool, &inbound, self.scope.tracker())?;
        let callbacks = match resolution {
            Some(Resolution::Callbacks(callbacks)) => callbacks,
            Some(Resolution::Delivered) => return Ok(Vec::new()),
            None => {
                tracing::debug!(block = %self.block_id, tool, value = %inbound.id, "no pending call for tool result");
                return Ok(Vec::new());
            }
        };

        let mut outcomes = Vec::with_capacity(callbacks.resumptions.len());
        for resumption in callbacks.resumptions {
            let mut inputs = vec![BoundValue::flow(
                resumption.callback.clone(),
                resumption.result_param.clone(),
                Arc::clone(&inbound),
            )];
            inputs.extend(
                resumption
                    .inputs
                    .into_iter()
                    .map(|input| BoundValue {
                        target: input.target,
                        value: input.value,
                        source: None,
                    }),
            );
            let outcome = match self
                .run_function(&resumption.callback, inputs, Some(&callbacks.state_keys))
                .await
            {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(block = %self.block_id, callback = %resumption.callback, %error, "callback could not run");
                    let batch = InvocationBatch {
                        messages: vec![error_message(error.into())],
                    };
                    let values = self.register_outputs(&resumption.callback, &batch.messages[0], &[inbound.id])?;
                    HostOutcome { batch, values }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Wait for the answer to the tool call that emitted `triggers`, without
    /// resuming a callback.
    pub fn wait_for(
        &mut self,
        tool: &str,
        triggers: Vec<Arc<FlowValue>>,
    ) -> Result<oneshot::Receiver<Arc<FlowValue>>> {
        self.subscriptions.wait(tool, triggers)
    }

    async fn run_function(
        &mut self,
        function: &str,
        inputs: Vec<BoundValue>,
        captured_keys: Option<&IndexMap<String, String>>,
    ) -> Result<HostOutcome> {
        let (bound, staged) = self.merge_sticky(function, inputs);
        let keys = match captured_keys {
            Some(keys) => keys.clone(),
            None => self.state_keys(function, &bound),
        };

        let states: Vec<StateValue> = keys
            .iter()
            .filter_map(|(state, key)| {
                self.state_in_bucket(state, key)
                    .map(|value| StateValue::new(state.clone(), value.clone()))
            })
            .collect();
        let input_values: Vec<InputValue> = bound
            .iter()
            .map(|b| InputValue {
                target: b.target.clone(),
                value: b.value.clone(),
            })
            .collect();

        let mut instance = LiveInstance::materialize(
            Arc::clone(self.registered.interface()),
            &self.definition,
            &states,
            &input_values,
            &self.shapes,
            &self.engine.config().instance,
        )?;
        let batch = self
            .engine
            .invoke(self.registered.block().as_ref(), &mut instance, function)
            .await?;

        for input in staged {
            tracing::debug!(block = %self.block_id, pin = %input.target, "remembering sticky value");
            self.sticky.insert(input.target.clone(), input);
        }

        for (state, key) in &keys {
            self.current_keys.insert(state.clone(), key.clone());
        }
        if !batch.is_error() {
            for state in batch.states() {
                if let Some(key) = keys.get(&state.state) {
                    self.buckets
                        .entry(state.state.clone())
                        .or_default()
                        .insert(key.clone(), state.value.clone());
                }
            }
        }

        let parents = consumed(&bound);
        let mut values = Vec::new();
        for message in &batch.messages {
            let produced = self.register_outputs(function, message, &parents)?;
            if !message.redirects.is_empty() {
                self.subscribe(message, &produced, &keys)?;
            }
            values.extend(produced);
        }

        Ok(HostOutcome { batch, values })
    }

    /// Explicit inputs win; sticky values fill in pins that got nothing new.
    /// Returns the merged inputs and the sticky values to remember once the
    /// invocation has accepted them.
    fn merge_sticky(&self, function: &str, inputs: Vec<BoundValue>) -> (Vec<BoundValue>, Vec<BoundValue>) {
        let interface = self.registered.interface();
        let sticky_pin = |target: &BlockPinRef| {
            let address = target.address();
            address.port == function
                && interface
                    .port(function)
                    .and_then(|port| port.inputs.get(address.pin))
                    .map(|pin| pin.sticky)
                    .unwrap_or(false)
        };

        let staged: Vec<BoundValue> = inputs
            .iter()
            .filter(|input| sticky_pin(&input.target))
            .cloned()
            .collect();

        let mut merged: Vec<BoundValue> = self
            .sticky
            .iter()
            .filter(|(target, _)| target.port == function)
            .filter(|(target, _)| !inputs.iter().any(|input| &input.target == *target))
            .map(|(_, value)| value.clone())
            .collect();
        merged.extend(inputs);
        (merged, staged)
    }

    /// Bucket key per state: the canonical scope pin values when `function`
    /// owns the scope, otherwise the bucket used last.
    fn state_keys(&self, function: &str, bound: &[BoundValue]) -> IndexMap<String, String> {
        let mut keys = IndexMap::new();
        for (name, state) in &self.registered.interface().state {
            let owns_scope = !state.scope.is_empty() && state.scope.iter().all(|pin| pin.port == function);
            let key = if state.scope.is_empty() {
                String::new()
            } else if owns_scope {
                let values: Vec<Value> = state
                    .scope
                    .iter()
                    .map(|pin| {
                        bound
                            .iter()
                            .find(|b| b.target.port == pin.port && b.target.pin == pin.pin)
                            .map(|b| b.value.clone())
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                canonical_json(&Value::Array(values))
            } else {
                self.current_keys.get(name).cloned().unwrap_or_default()
            };
            keys.insert(name.clone(), key);
        }
        keys
    }

    fn register_outputs(
        &self,
        function: &str,
        message: &BlockMessage,
        parents: &[Uuid],
    ) -> Result<Vec<Arc<FlowValue>>> {
        let interface = self.registered.interface();
        let mut produced = Vec::with_capacity(message.outputs.len());
        for output in &message.outputs {
            let address = output.source.address();
            let port = interface.port(address.port);
            let value_source = match port {
                Some(port) if port.is_function => ValueSourceRef::Step {
                    block_id: self.block_id.clone(),
                    step_id: function.to_string(),
                    output_id: indexed(&output.source.port, &output.source.pin),
                },
                Some(port) if port.is_tool() => ValueSourceRef::ToolInput {
                    block_id: self.block_id.clone(),
                    tool_id: output.source.port.clone(),
                    input_id: output.source.pin.clone(),
                },
                _ => ValueSourceRef::BlockOutput {
                    block_id: self.block_id.clone(),
                    output_id: indexed(&output.source.port, &output.source.pin),
                },
            };
            let value = FlowValue::new(value_source, parents.to_vec(), output.value.clone());
            produced.push(self.scope.register(value)?);
        }
        Ok(produced)
    }

    fn subscribe(
        &mut self,
        message: &BlockMessage,
        triggers: &[Arc<FlowValue>],
        keys: &IndexMap<String, String>,
    ) -> Result<()> {
        let mut by_tool: IndexMap<&str, Vec<Resumption>> = IndexMap::new();
        for redirect in &message.redirects {
            if redirect.source.pin != TOOL_RETURN_PIN {
                continue;
            }
            let callback = redirect.target.port.clone();
            let inputs = message
                .inputs
                .iter()
                .filter(|input| input.target.port == callback)
                .cloned()
                .collect();
            by_tool
                .entry(redirect.source.port.as_str())
                .or_default()
                .push(Resumption {
                    callback,
                    result_param: redirect.target.pin.clone(),
                    inputs,
                });
        }

        for (tool, resumptions) in by_tool {
            self.subscriptions.subscribe(
                tool,
                triggers.to_vec(),
                PendingCallbacks {
                    resumptions,
                    state_keys: keys.clone(),
                },
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for BlockHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockHost")
            .field("block_id", &self.block_id)
            .field("block_type", self.registered.block_type())
            .field("sticky", &self.sticky.len())
            .field("pending_calls", &self.subscriptions.total_pending())
            .finish()
    }
}

fn consumed(bound: &[BoundValue]) -> Vec<Uuid> {
    let mut parents: Vec<Uuid> = Vec::new();
    for source in bound.iter().filter_map(|b| b.source.as_ref()) {
        if !parents.contains(&source.id) {
            parents.push(source.id);
        }
    }
    parents
}

/// A host shared between tasks. Invocations on one instance never overlap.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    host: Arc<Mutex<BlockHost>>,
}

impl InstanceHandle {
    pub fn new(host: BlockHost) -> Self {
        Self {
            host: Arc::new(Mutex::new(host)),
        }
    }

    pub async fn run_step(&self, step: &str, inputs: Vec<BoundValue>) -> Result<HostOutcome> {
        self.host.lock().await.run_step(step, inputs).await
    }

    pub async fn deliver(&self, tool: &str, inbound: Arc<FlowValue>) -> Result<Vec<HostOutcome>> {
        self.host.lock().await.deliver(tool, inbound).await
    }

    pub async fn cancel_subscriptions(&self) -> usize {
        self.host.lock().await.cancel_subscriptions()
    }

    pub async fn pending_calls(&self, tool: &str) -> usize {
        self.host.lock().await.pending_calls(tool)
    }
}
