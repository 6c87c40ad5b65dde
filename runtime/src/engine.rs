//! # Execution engine
//!
//! Runs one Step or Callback of a [`LiveInstance`] to completion and returns
//! everything it produced as a single [`InvocationBatch`].
//!
//! A failing body is contained: its messages and state writes are discarded
//! and the batch holds one value on the `error` output instead.

use crate::block::{ArgValue, Block, CallArgs};
use crate::error::{Result, RuntimeError};
use crate::host::{BlockHost, FlowScope};
use crate::instance::{DynamicPorts, LiveInstance, PendingInputs, PinSlot};
use crate::invocation::Invocation;
use crate::registry::BlockRegistry;
use crate::resources::Resources;
use blockflow_core::{
    compile_block, compile_unvalidated, BlockError, BlockFailure, BlockMessage, BlockPinRef,
    BlockPlacement, BlockRunRequest, InvocationBatch, OutputValue, PinType, PortInterface,
    RuntimeConfig, StateValue, ERROR_PORT,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;

pub struct Engine {
    registry: Arc<BlockRegistry>,
    config: RuntimeConfig,
    resources: Arc<Resources>,
}

impl Engine {
    pub fn new(registry: Arc<BlockRegistry>) -> Self {
        Self {
            registry,
            config: RuntimeConfig::default(),
            resources: Arc::new(Resources::new()),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = Arc::new(resources);
        self
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Run `function` on `instance`.
    ///
    /// # Errors
    ///
    /// Input errors (unknown function, missing required input) abort the call
    /// before the body runs and leave the instance untouched. Errors raised by
    /// the body are not returned; they become the `error` output.
    pub async fn invoke(
        &self,
        block: &dyn Block,
        instance: &mut LiveInstance,
        function: &str,
    ) -> Result<InvocationBatch> {
        let interface = Arc::clone(instance.interface());
        let Some(port) = interface.port(function).filter(|p| p.is_function) else {
            return Err(RuntimeError::UnknownFunction {
                block: instance.block_type().to_string(),
                function: function.to_string(),
            });
        };

        let pending = instance.take_pending(function);
        let args = match bind(instance, function, port, &pending) {
            Ok(args) => args,
            Err(error) => {
                instance.restore_pending(function, pending);
                return Err(error);
            }
        };

        let block_type = instance.block_type().clone();
        let snapshot = instance.states().clone();
        let span = tracing::info_span!(
            "Invocation",
            blockflow.block = %block_type,
            blockflow.function = %function,
        );

        let mut ctx = Invocation::new(instance, function, &self.resources);
        let outcome = block
            .invoke(function, &mut ctx, args)
            .instrument(span.clone())
            .await;

        let mut messages = match outcome {
            Ok(returned) => {
                if let (Some(value), Some(pin)) = (returned, port.outputs.keys().next()) {
                    if !value.is_null() {
                        ctx.emit_return(BlockPinRef::new(function, pin.clone()), value);
                    }
                }
                ctx.finish()
            }
            Err(error) => {
                drop(ctx);
                instance.replace_states(snapshot);
                let _entered = span.enter();
                tracing::warn!(error = %format!("{error:#}"), "block body failed");
                return Ok(InvocationBatch {
                    messages: vec![error_message(error)],
                });
            }
        };

        if !instance.states().is_empty() {
            messages.push(BlockMessage {
                states: instance
                    .states()
                    .iter()
                    .map(|(name, value)| StateValue::new(name.clone(), value.clone()))
                    .collect(),
                ..Default::default()
            });
        }

        Ok(InvocationBatch { messages })
    }

    /// Resolve, materialise and run a block from a wire request.
    pub async fn run_request(&self, request: &BlockRunRequest) -> Result<InvocationBatch> {
        let registered = self.registry.find(&request.name, &request.version)?;
        let placement = BlockPlacement::new(request.name.clone(), registered.block_type().clone());
        let definition = compile_unvalidated(registered.interface(), &placement)?;
        let shapes = DynamicPorts {
            inputs: request.dynamic_inputs.clone(),
            outputs: request.dynamic_outputs.clone(),
        };

        let mut instance = LiveInstance::materialize(
            Arc::clone(registered.interface()),
            &definition,
            &request.state,
            &request.inputs,
            &shapes,
            &self.config.instance,
        )?;
        self.invoke(registered.block().as_ref(), &mut instance, &request.function)
            .await
    }

    /// Place a block in `scope` and return the host that drives it.
    pub fn spawn_host(self: &Arc<Self>, scope: FlowScope, placement: &BlockPlacement) -> Result<BlockHost> {
        let registered = self
            .registry
            .find(&placement.block_type.name, &placement.block_type.version)?;
        let definition = compile_block(registered.interface(), placement)?;
        Ok(BlockHost::new(Arc::clone(self), scope, registered, definition))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("blocks", &self.registry.len())
            .field("resources", &self.resources)
            .finish()
    }
}

/// Turn the pending pin values of a function into call arguments.
fn bind(
    instance: &LiveInstance,
    function: &str,
    port: &PortInterface,
    pending: &PendingInputs,
) -> Result<CallArgs> {
    let mut args = CallArgs::new();
    for (name, pin) in &port.inputs {
        let arg = match (pending.get(name), pin.pin_type) {
            (Some(PinSlot::Single(Some(value))), _) => ArgValue::Single(value.clone()),
            (Some(PinSlot::List(items)), _) => ArgValue::List(items.clone()),
            (Some(PinSlot::Dictionary(entries)), _) => ArgValue::Dictionary(entries.clone()),
            (_, PinType::List) => ArgValue::List(Vec::new()),
            (_, PinType::Dictionary) => ArgValue::Dictionary(Default::default()),
            (_, PinType::Single) if !pin.required => ArgValue::Single(pin.default.clone()),
            (_, PinType::Single) => {
                return Err(RuntimeError::MissingInput {
                    block: instance.block_type().to_string(),
                    function: function.to_string(),
                    pin: name.clone(),
                });
            }
        };
        args.insert(name.clone(), arg);
    }
    Ok(args)
}

pub(crate) fn error_message(error: anyhow::Error) -> BlockMessage {
    let data = error
        .downcast_ref::<BlockFailure>()
        .map(|failure| failure.data.clone())
        .unwrap_or(Value::Null);
    let mut message = format!("{error:#}");
    if message.is_empty() {
        message = "block failed".to_string();
    }

    let value = serde_json::to_value(BlockError { message, data }).unwrap_or(Value::Null);
    BlockMessage::output(OutputValue {
        source: BlockPinRef::new(ERROR_PORT, ""),
        value,
        index: 0,
    })
}
