//! The context a block body runs against.

use crate::instance::{LiveInstance, PortObject, PortSlot};
use crate::resources::Resources;
use crate::validate;
use ahash::AHashMap;
use anyhow::{anyhow, bail, Context as _};
use blockflow_core::{
    indexed, BlockInterface, BlockMessage, BlockPinRef, CallbackCall, InputValue, OutputValue,
    PinRedirect, PinType, PortType, TOOL_RETURN_PIN,
};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// One running Step or Callback.
///
/// Everything emitted here is buffered and only handed out, as one ordered
/// batch, once the body has completed.
pub struct Invocation<'a> {
    instance: &'a mut LiveInstance,
    function: &'a str,
    resources: &'a Resources,
    messages: Vec<BlockMessage>,
    counters: AHashMap<BlockPinRef, u64>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        instance: &'a mut LiveInstance,
        function: &'a str,
        resources: &'a Resources,
    ) -> Self {
        Self {
            instance,
            function,
            resources,
            messages: Vec::new(),
            counters: AHashMap::new(),
        }
    }

    pub fn function(&self) -> &str {
        self.function
    }

    pub fn instance(&self) -> &LiveInstance {
        self.instance
    }

    /// A config value, deserialized.
    pub fn config<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .instance
            .value(name)
            .ok_or_else(|| anyhow!("block {} has no config '{name}'", self.instance.block_type()))?;
        serde_json::from_value(value.clone()).with_context(|| format!("config '{name}'"))
    }

    /// The value held by a port-level input.
    pub fn input(&self, port: &str) -> Option<&Value> {
        self.instance.value(port)
    }

    /// Values of a List or Dictionary input port, keyed by index.
    pub fn inputs(&self, port: &str) -> IndexMap<String, Value> {
        match self.instance.port(port) {
            Some(PortSlot::List(items)) => items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| match item {
                    Some(PortObject::Value(value)) => Some((i.to_string(), value.clone())),
                    _ => None,
                })
                .collect(),
            Some(PortSlot::Dictionary(entries)) => entries
                .iter()
                .filter_map(|(key, item)| match item {
                    PortObject::Value(value) => Some((key.clone(), value.clone())),
                    _ => None,
                })
                .collect(),
            _ => IndexMap::new(),
        }
    }

    pub fn port_indexes(&self, port: &str) -> Vec<String> {
        self.instance
            .port(port)
            .map(PortSlot::indexes)
            .unwrap_or_default()
    }

    pub fn state<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .state_value(name)
            .ok_or_else(|| anyhow!("block {} has no state '{name}'", self.instance.block_type()))?;
        serde_json::from_value(value.clone()).with_context(|| format!("state '{name}'"))
    }

    pub fn state_value(&self, name: &str) -> Option<&Value> {
        self.instance.state(name)
    }

    pub fn set_state(&mut self, name: &str, value: impl Serialize) -> anyhow::Result<()> {
        let value = serde_json::to_value(value)?;
        if let Some(state) = self.instance.interface().state.get(name) {
            validate::check(name, &state.json_schema, &value)?;
        }
        self.instance.set_state(name, value)?;
        Ok(())
    }

    pub fn resource<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.resources.get::<T>()
    }

    /// Emit on the unnamed pin of an output port.
    pub fn emit(&mut self, port: &str, value: impl Serialize) -> anyhow::Result<()> {
        self.emit_pin(port, "", value)
    }

    /// Emit on one element of a List/Dictionary output port.
    pub fn emit_at(&mut self, port: &str, index: &str, value: impl Serialize) -> anyhow::Result<()> {
        self.emit_pin(&indexed(port, index), "", value)
    }

    pub fn emit_pin(&mut self, port: &str, pin: &str, value: impl Serialize) -> anyhow::Result<()> {
        let source = BlockPinRef::new(port, pin);
        let address = source.address();
        let declared = self
            .instance
            .interface()
            .port(address.port)
            .filter(|p| !p.is_function && !p.is_tool())
            .and_then(|p| p.outputs.get(address.pin))
            .is_some();
        if !declared {
            bail!(
                "block {} has no output {source}",
                self.instance.block_type()
            );
        }

        let value = serde_json::to_value(value)?;
        let output = self.output_value(source, value);
        self.messages.push(BlockMessage::output(output));
        Ok(())
    }

    pub(crate) fn emit_return(&mut self, source: BlockPinRef, value: Value) {
        let output = self.output_value(source, value);
        self.messages.push(BlockMessage::output(output));
    }

    /// A tool port, or one element of a List/Dictionary tool port (`"tools.2"`).
    pub fn tool<'i>(&'i mut self, tool: &str) -> ToolPort<'i, 'a> {
        ToolPort {
            ctx: self,
            tool: tool.to_string(),
        }
    }

    pub(crate) fn finish(self) -> Vec<BlockMessage> {
        self.messages
    }

    fn output_value(&mut self, source: BlockPinRef, value: Value) -> OutputValue {
        let counter = self.counters.entry(source.clone()).or_insert(0);
        let index = *counter;
        *counter += 1;
        OutputValue {
            source,
            value,
            index,
        }
    }
}

/// Arguments of a tool call, one per tool parameter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs {
    singles: IndexMap<String, Value>,
    lists: IndexMap<String, Vec<Value>>,
    dicts: IndexMap<String, IndexMap<String, Value>>,
    invalid: Option<String>,
}

impl ToolArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a parameter. A value that fails to serialise is reported by
    /// [`ToolPort::call`].
    pub fn arg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.singles.insert(name, value);
            }
            Err(error) => {
                self.invalid
                    .get_or_insert_with(|| format!("argument '{name}' could not be serialised: {error}"));
            }
        }
        self
    }

    pub fn list(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.lists.insert(name.into(), values);
        self
    }

    pub fn dict(mut self, name: impl Into<String>, values: IndexMap<String, Value>) -> Self {
        self.dicts.insert(name.into(), values);
        self
    }
}

pub struct ToolPort<'i, 'a> {
    ctx: &'i mut Invocation<'a>,
    tool: String,
}

impl<'i, 'a> ToolPort<'i, 'a> {
    /// Emit the trigger values for one call of the tool and hand back the
    /// call record. Does not wait for the result.
    pub fn call(self, mut args: ToolArgs) -> anyhow::Result<ToolCall<'i>> {
        let ctx = self.ctx;
        if let Some(reason) = args.invalid.take() {
            bail!("tool '{}' {reason}", self.tool);
        }
        let interface = Arc::clone(ctx.instance.interface());
        let target = BlockPinRef::new(self.tool.clone(), "");
        let address = target.address();

        let Some(port) = interface.port(address.port).filter(|p| p.is_tool()) else {
            bail!("block {} has no tool '{}'", ctx.instance.block_type(), self.tool);
        };
        if port.port_type != PortType::Single {
            let wired = ctx
                .instance
                .port(address.port)
                .map(PortSlot::indexes)
                .unwrap_or_default();
            if !wired.iter().any(|index| index == address.port_index) {
                bail!("tool '{}' is not wired", self.tool);
            }
        }

        let mut singles = Vec::new();
        let mut lists = Vec::new();
        let mut dicts = Vec::new();
        for (name, pin) in &port.outputs {
            match pin.pin_type {
                PinType::Single => {
                    let value = args
                        .singles
                        .swap_remove(name)
                        .ok_or_else(|| anyhow!("tool '{}' is missing argument '{name}'", self.tool))?;
                    singles.push((BlockPinRef::new(self.tool.clone(), name.clone()), value));
                }
                PinType::List => {
                    for (i, value) in args.lists.swap_remove(name).unwrap_or_default().into_iter().enumerate() {
                        let pin = indexed(name, &i.to_string());
                        lists.push((BlockPinRef::new(self.tool.clone(), pin), value));
                    }
                }
                PinType::Dictionary => {
                    for (key, value) in args.dicts.swap_remove(name).unwrap_or_default() {
                        let pin = indexed(name, &key);
                        dicts.push((BlockPinRef::new(self.tool.clone(), pin), value));
                    }
                }
            }
        }
        if let Some(extra) = args
            .singles
            .keys()
            .chain(args.lists.keys())
            .chain(args.dicts.keys())
            .next()
        {
            bail!("tool '{}' has no parameter '{extra}'", self.tool);
        }

        let mut message = BlockMessage::default();
        for (source, value) in singles.into_iter().chain(lists).chain(dicts) {
            message.outputs.push(ctx.output_value(source, value));
        }
        ctx.messages.push(message);

        let message = ctx
            .messages
            .last_mut()
            .ok_or_else(|| anyhow!("tool call message was not recorded"))?;
        Ok(ToolCall {
            message,
            interface,
            tool: self.tool,
        })
    }
}

/// A tool call that has been emitted.
pub struct ToolCall<'i> {
    message: &'i mut BlockMessage,
    interface: Arc<BlockInterface>,
    tool: String,
}

impl<'i> ToolCall<'i> {
    pub fn tool(&self) -> &str {
        &self.tool
    }

    /// Resume `callback` with the tool's result. The result lands on the
    /// callback's `result_param`; the other params are bound now.
    pub fn then(self, callback: CallbackCall) -> anyhow::Result<Self> {
        let Some(port) = self
            .interface
            .port(&callback.name)
            .filter(|p| p.is_callback())
        else {
            bail!("'{}' is not a callback", callback.name);
        };
        if !port.inputs.contains_key(&callback.result_param) {
            bail!(
                "callback '{}' has no parameter '{}'",
                callback.name,
                callback.result_param
            );
        }

        for (param, value) in &callback.params {
            if !port.inputs.contains_key(param) {
                bail!("callback '{}' has no parameter '{param}'", callback.name);
            }
            self.message
                .inputs
                .push(InputValue::new(callback.name.clone(), param.clone(), value.clone()));
        }
        self.message.redirects.push(PinRedirect {
            source: BlockPinRef::new(self.tool.clone(), TOOL_RETURN_PIN),
            target: BlockPinRef::new(callback.name.clone(), callback.result_param.clone()),
        });
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::DynamicPorts;
    use blockflow_core::{
        build_interface, compile_unvalidated, BlockDecl, BlockPlacement, BlockType, Container,
        FieldDecl, FunctionDecl, InstanceConfig, ParamDecl, PortDecl, ToolSignature,
        TypeDescriptor,
    };
    use serde_json::json;

    fn instance() -> LiveInstance {
        let decl = BlockDecl::new("Fanout")
            .field(FieldDecl::config("label", TypeDescriptor::String, Some(json!("x"))))
            .field(FieldDecl::outputs("results", TypeDescriptor::Any, Container::List))
            .field(FieldDecl::output("done", TypeDescriptor::Bool))
            .field(FieldDecl::state("seen", TypeDescriptor::Integer, json!(0)))
            .field(FieldDecl::tool(
                "run",
                ToolSignature::new()
                    .param(ParamDecl::new("item", TypeDescriptor::Any))
                    .param(ParamDecl::var_positional("rest", TypeDescriptor::Any))
                    .returns(TypeDescriptor::Integer),
            ))
            .field(
                FieldDecl::port(
                    "workers",
                    PortDecl::new().tool(ToolSignature::new().param(ParamDecl::new("job", TypeDescriptor::Any))),
                )
                .container(Container::Dictionary),
            )
            .function(FunctionDecl::step("start").param(ParamDecl::new("items", TypeDescriptor::Any)))
            .function(
                FunctionDecl::callback("collect")
                    .param(ParamDecl::new("result", TypeDescriptor::Any))
                    .param(ParamDecl::new("index", TypeDescriptor::Integer)),
            );
        let interface = Arc::new(build_interface(&decl).unwrap());
        let placement = BlockPlacement::new("fanout", BlockType::new("Fanout", "1.0.0"))
            .tool("workers", json!({"a": {}}));
        let definition = compile_unvalidated(&interface, &placement).unwrap();
        LiveInstance::materialize(
            interface,
            &definition,
            &[],
            &[],
            &DynamicPorts::default(),
            &InstanceConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_emit_indexes_per_pin() {
        let mut instance = instance();
        let resources = Resources::new();
        let mut ctx = Invocation::new(&mut instance, "start", &resources);
        ctx.emit("done", true).unwrap();
        ctx.emit_at("results", "0", 1).unwrap();
        ctx.emit("done", false).unwrap();
        assert!(ctx.emit("nope", 1).is_err());
        assert!(ctx.emit("run", 1).is_err());

        let messages = ctx.finish();
        let indexes: Vec<(String, u64)> = messages
            .iter()
            .flat_map(|m| m.outputs.iter())
            .map(|o| (o.source.to_string(), o.index))
            .collect();
        assert_eq!(
            indexes,
            vec![
                ("done".to_string(), 0),
                ("results.0".to_string(), 0),
                ("done".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_config_and_state_access() {
        let mut instance = instance();
        let resources = Resources::new().with(7u32);
        let mut ctx = Invocation::new(&mut instance, "start", &resources);
        assert_eq!(ctx.config::<String>("label").unwrap(), "x");
        assert_eq!(ctx.state::<i64>("seen").unwrap(), 0);
        ctx.set_state("seen", 3).unwrap();
        assert!(ctx.set_state("seen", "three").is_err());
        assert!(ctx.set_state("missing", 1).is_err());
        assert_eq!(ctx.resource::<u32>(), Some(&7));
        drop(ctx);
        assert_eq!(instance.state("seen"), Some(&json!(3)));
    }

    #[test]
    fn test_tool_call_with_callbacks() {
        let mut instance = instance();
        let resources = Resources::new();
        let mut ctx = Invocation::new(&mut instance, "start", &resources);
        ctx.tool("run")
            .call(ToolArgs::new().arg("item", "a").list("rest", vec![json!(1), json!(2)]))
            .unwrap()
            .then(CallbackCall::new("collect", "result").with("index", 0))
            .unwrap();

        let messages = ctx.finish();
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        let sources: Vec<String> = message.outputs.iter().map(|o| o.source.to_string()).collect();
        assert_eq!(sources, vec!["run/item", "run/rest.0", "run/rest.1"]);
        assert_eq!(message.inputs, vec![InputValue::new("collect", "index", json!(0))]);
        assert_eq!(
            message.redirects,
            vec![PinRedirect {
                source: BlockPinRef::new("run", "return"),
                target: BlockPinRef::new("collect", "result"),
            }]
        );
    }

    #[test]
    fn test_tool_call_rejections() {
        let mut instance = instance();
        let resources = Resources::new();
        let mut ctx = Invocation::new(&mut instance, "start", &resources);

        assert!(ctx.tool("run").call(ToolArgs::new()).is_err());
        assert!(ctx
            .tool("run")
            .call(ToolArgs::new().arg("item", 1).arg("bogus", 2))
            .is_err());
        assert!(ctx.tool("workers.b").call(ToolArgs::new().arg("job", 1)).is_err());
        assert!(ctx.tool("done").call(ToolArgs::new()).is_err());

        let call = ctx.tool("workers.a").call(ToolArgs::new().arg("job", 1)).unwrap();
        assert!(call.then(CallbackCall::new("start", "items")).is_err());

        let call = ctx.tool("workers.a").call(ToolArgs::new().arg("job", 2)).unwrap();
        assert!(call.then(CallbackCall::new("collect", "missing")).is_err());
    }

    #[test]
    fn test_unserialisable_tool_argument_fails_the_call() {
        let mut instance = instance();
        let resources = Resources::new();
        let mut ctx = Invocation::new(&mut instance, "start", &resources);

        let tuple_keys = std::collections::BTreeMap::from([((1, 2), 3)]);
        let err = ctx
            .tool("run")
            .call(ToolArgs::new().arg("item", tuple_keys))
            .err()
            .unwrap();
        assert!(err.to_string().contains("'item'"));
        assert!(ctx.finish().is_empty());
    }
}
