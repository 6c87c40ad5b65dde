//! Compiling a placed block against its interface into a [`BlockDefinition`].
//!
//! The flow compiler places blocks, supplies their configuration and the keys of
//! any Dictionary/List tool ports, then calls [`connect`] for every connection to
//! narrow output schemas against what they feed.

use crate::builder::TOOL_RETURN_PIN;
use crate::error::DefinitionError;
use crate::interface::{indexed, BlockInterface, BlockType, PortType};
use crate::schema::substitute_generic;
use crate::value::ValueSourceRef;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDefinition {
    pub id: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDefinition {
    pub id: String,
    #[serde(rename = "schema")]
    pub json_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    pub id: String,
    pub sticky: bool,
    #[serde(rename = "schema")]
    pub json_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub inputs: IndexMap<String, InputDefinition>,
    /// Id of the entry in [`BlockDefinition::outputs`] the step returns on.
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInputDefinition {
    pub id: String,
    pub tool_id: String,
    #[serde(rename = "schema")]
    pub json_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutputDefinition {
    pub id: String,
    pub tool_id: String,
    #[serde(rename = "schema")]
    pub json_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub inputs: IndexMap<String, ToolInputDefinition>,
    #[serde(default)]
    pub output: Option<ToolOutputDefinition>,
    #[serde(default)]
    pub configs: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDefinition {
    pub id: String,
    pub default: Value,
    #[serde(rename = "schema", default)]
    pub json_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    pub configs: IndexMap<String, ConfigDefinition>,
    pub outputs: IndexMap<String, OutputDefinition>,
    pub steps: IndexMap<String, StepDefinition>,
    pub tools: IndexMap<String, ToolDefinition>,
    #[serde(default)]
    pub states: IndexMap<String, StateDefinition>,
}

/// One block as placed in a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub id: String,
    #[serde(rename = "type")]
    pub block_type: BlockType,
    #[serde(default)]
    pub configs: IndexMap<String, Value>,
    /// Tool port -> configuration. Dictionary tool ports take an object keyed
    /// by entry, List tool ports an array.
    #[serde(default)]
    pub tools: IndexMap<String, Value>,
}

impl BlockPlacement {
    pub fn new(id: impl Into<String>, block_type: BlockType) -> Self {
        Self {
            id: id.into(),
            block_type,
            configs: IndexMap::new(),
            tools: IndexMap::new(),
        }
    }

    pub fn config(mut self, name: impl Into<String>, value: Value) -> Self {
        self.configs.insert(name.into(), value);
        self
    }

    pub fn tool(mut self, name: impl Into<String>, config: Value) -> Self {
        self.tools.insert(name.into(), config);
        self
    }
}

/// Where a connection delivers to; the schema it carries narrows the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ValueTargetRef {
    #[serde(rename_all = "camelCase")]
    StepInput {
        block_id: String,
        step_id: String,
        input_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutput { block_id: String, tool_id: String },
    /// A flow output or child flow input, known only by its schema.
    #[serde(rename_all = "camelCase")]
    External { schema: Value },
}

/// Compile `placement` against `interface`, rejecting missing configs and
/// dangling step outputs.
pub fn compile_block(
    interface: &BlockInterface,
    placement: &BlockPlacement,
) -> Result<BlockDefinition, DefinitionError> {
    let definition = compile(interface, placement, true)?;
    definition.validate()?;
    Ok(definition)
}

/// Compile without requiring configs; used when a block is run directly
/// and its configs arrive as inputs.
pub fn compile_unvalidated(
    interface: &BlockInterface,
    placement: &BlockPlacement,
) -> Result<BlockDefinition, DefinitionError> {
    compile(interface, placement, false)
}

fn compile(
    interface: &BlockInterface,
    placement: &BlockPlacement,
    validate: bool,
) -> Result<BlockDefinition, DefinitionError> {
    let block = placement.block_type.to_string();

    if validate {
        for name in placement.configs.keys() {
            if !interface.port(name).map(|p| p.is_config()).unwrap_or(false) {
                return Err(DefinitionError::UnknownConfig {
                    block: block.clone(),
                    config: name.clone(),
                });
            }
        }
    }

    let mut configs = IndexMap::new();
    let mut outputs = IndexMap::new();
    let mut steps = IndexMap::new();
    let mut tools = IndexMap::new();

    for (name, port) in &interface.ports {
        if port.is_config() {
            let Some(pin) = port.inputs.get("") else {
                continue;
            };
            let value = match placement.configs.get(name) {
                Some(value) => value.clone(),
                None if !pin.required => pin.default.clone(),
                None if validate => {
                    return Err(DefinitionError::MissingConfig {
                        block: block.clone(),
                        config: name.clone(),
                    });
                }
                None => continue,
            };
            configs.insert(
                name.clone(),
                ConfigDefinition {
                    id: name.clone(),
                    value,
                },
            );
            continue;
        }

        if port.is_function {
            let inputs = port
                .inputs
                .iter()
                .map(|(pin_name, pin)| {
                    (
                        pin_name.clone(),
                        InputDefinition {
                            id: pin_name.clone(),
                            sticky: pin.sticky,
                            json_schema: pin.json_schema.clone(),
                        },
                    )
                })
                .collect();

            let mut output = None;
            if let Some((pin_name, pin)) = port.outputs.first() {
                let id = indexed(name, pin_name);
                outputs.insert(
                    id.clone(),
                    OutputDefinition {
                        id: id.clone(),
                        json_schema: pin.json_schema.clone(),
                    },
                );
                output = Some(id);
            }

            steps.insert(
                name.clone(),
                StepDefinition {
                    id: name.clone(),
                    inputs,
                    output,
                },
            );
            continue;
        }

        if port.is_tool() {
            for (tool_id, configs) in tool_instances(name, port.port_type, placement.tools.get(name)) {
                let inputs = port
                    .outputs
                    .iter()
                    .map(|(pin_name, pin)| {
                        (
                            pin_name.clone(),
                            ToolInputDefinition {
                                id: pin_name.clone(),
                                tool_id: tool_id.clone(),
                                json_schema: pin.json_schema.clone(),
                            },
                        )
                    })
                    .collect();
                let output = port.inputs.get(TOOL_RETURN_PIN).map(|pin| ToolOutputDefinition {
                    id: TOOL_RETURN_PIN.to_string(),
                    tool_id: tool_id.clone(),
                    json_schema: pin.json_schema.clone(),
                });
                tools.insert(
                    tool_id.clone(),
                    ToolDefinition {
                        id: tool_id,
                        inputs,
                        output,
                        configs,
                    },
                );
            }
            continue;
        }

        for (pin_name, pin) in &port.outputs {
            let id = indexed(name, pin_name);
            outputs.insert(
                id.clone(),
                OutputDefinition {
                    id,
                    json_schema: pin.json_schema.clone(),
                },
            );
        }
    }

    for tool in tools.values() {
        for (input_name, input) in &tool.inputs {
            let id = format!("{}.{input_name}", tool.id);
            outputs.insert(
                id.clone(),
                OutputDefinition {
                    id,
                    json_schema: input.json_schema.clone(),
                },
            );
        }
    }

    let states = interface
        .state
        .iter()
        .map(|(name, state)| {
            (
                name.clone(),
                StateDefinition {
                    id: name.clone(),
                    default: state.default.clone(),
                    json_schema: state.json_schema.clone(),
                },
            )
        })
        .collect();

    Ok(BlockDefinition {
        id: placement.id.clone(),
        block_type: placement.block_type.clone(),
        configs,
        outputs,
        steps,
        tools,
        states,
    })
}

fn tool_instances(name: &str, port_type: PortType, placed: Option<&Value>) -> Vec<(String, Value)> {
    match port_type {
        PortType::Single => vec![(
            name.to_string(),
            placed.cloned().unwrap_or_else(|| json!({})),
        )],
        PortType::Dictionary => match placed {
            Some(Value::Object(entries)) => entries
                .iter()
                .map(|(key, config)| (format!("{name}.{key}"), config.clone()))
                .collect(),
            _ => Vec::new(),
        },
        PortType::List => match placed {
            Some(Value::Array(entries)) => entries
                .iter()
                .enumerate()
                .map(|(i, config)| (format!("{name}.{i}"), config.clone()))
                .collect(),
            _ => Vec::new(),
        },
    }
}

impl BlockDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        for step in self.steps.values() {
            if let Some(output) = &step.output {
                if !self.outputs.contains_key(output) {
                    return Err(DefinitionError::MissingOutput {
                        block: self.block_type.to_string(),
                        step: step.id.clone(),
                        output: output.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Schema of the output a connection source reads from.
    fn source_schema_mut(&mut self, source: &ValueSourceRef) -> Result<Option<&mut Value>, DefinitionError> {
        let block = self.block_type.to_string();
        match source {
            ValueSourceRef::BlockOutput { output_id, .. } => self
                .outputs
                .get_mut(output_id)
                .map(|o| Some(&mut o.json_schema))
                .ok_or(DefinitionError::UnknownOutput {
                    block,
                    output: output_id.clone(),
                }),
            ValueSourceRef::Step {
                step_id, output_id, ..
            } => {
                let id = indexed(step_id, output_id);
                self.outputs
                    .get_mut(&id)
                    .map(|o| Some(&mut o.json_schema))
                    .ok_or(DefinitionError::UnknownOutput { block, output: id })
            }
            ValueSourceRef::ToolInput {
                tool_id, input_id, ..
            } => {
                let tool = self.tools.get_mut(tool_id).ok_or(DefinitionError::UnknownTool {
                    block: block.clone(),
                    tool: tool_id.clone(),
                })?;
                tool.inputs
                    .get_mut(input_id)
                    .map(|i| Some(&mut i.json_schema))
                    .ok_or(DefinitionError::UnknownOutput {
                        block,
                        output: format!("{tool_id}.{input_id}"),
                    })
            }
            ValueSourceRef::FlowInput { .. } => Ok(None),
        }
    }

    /// Replace generic `generic` with `concrete` in every schema.
    pub fn resolve_generic(&mut self, generic: &str, concrete: &Value) {
        let apply = |schema: &mut Value| *schema = substitute_generic(schema, generic, concrete);
        for output in self.outputs.values_mut() {
            apply(&mut output.json_schema);
        }
        for step in self.steps.values_mut() {
            for input in step.inputs.values_mut() {
                apply(&mut input.json_schema);
            }
        }
        for tool in self.tools.values_mut() {
            for input in tool.inputs.values_mut() {
                apply(&mut input.json_schema);
            }
            if let Some(output) = &mut tool.output {
                apply(&mut output.json_schema);
            }
        }
        for state in self.states.values_mut() {
            apply(&mut state.json_schema);
        }
    }
}

fn block_id(source: &ValueSourceRef) -> Option<&str> {
    match source {
        ValueSourceRef::BlockOutput { block_id, .. }
        | ValueSourceRef::ToolInput { block_id, .. }
        | ValueSourceRef::Step { block_id, .. } => Some(block_id),
        ValueSourceRef::FlowInput { .. } => None,
    }
}

fn target_schema(
    definitions: &IndexMap<String, BlockDefinition>,
    target: &ValueTargetRef,
) -> Result<Value, DefinitionError> {
    match target {
        ValueTargetRef::StepInput {
            block_id,
            step_id,
            input_id,
        } => definitions
            .get(block_id)
            .and_then(|d| d.steps.get(step_id))
            .and_then(|s| s.inputs.get(input_id))
            .map(|i| i.json_schema.clone())
            .ok_or_else(|| DefinitionError::UnknownInput {
                block: block_id.clone(),
                step: step_id.clone(),
                input: input_id.clone(),
            }),
        ValueTargetRef::ToolOutput { block_id, tool_id } => {
            let tool = definitions
                .get(block_id)
                .and_then(|d| d.tools.get(tool_id))
                .ok_or_else(|| DefinitionError::UnknownTool {
                    block: block_id.clone(),
                    tool: tool_id.clone(),
                })?;
            tool.output
                .as_ref()
                .map(|o| o.json_schema.clone())
                .ok_or_else(|| DefinitionError::MissingToolOutput {
                    block: block_id.clone(),
                    tool: tool_id.clone(),
                })
        }
        ValueTargetRef::External { schema } => Ok(schema.clone()),
    }
}

/// Narrow the schema of `source` by what `target` accepts.
pub fn connect(
    definitions: &mut IndexMap<String, BlockDefinition>,
    source: &ValueSourceRef,
    target: &ValueTargetRef,
) -> Result<(), DefinitionError> {
    let target_schema = target_schema(definitions, target)?;
    let Some(source_block) = block_id(source) else {
        return Ok(());
    };

    let definition = definitions
        .get_mut(source_block)
        .ok_or_else(|| DefinitionError::UnknownOutput {
            block: source_block.to_string(),
            output: source.describe(),
        })?;
    if let Some(schema) = definition.source_schema_mut(source)? {
        narrow(schema, target_schema);
    }
    Ok(())
}

fn narrow(schema: &mut Value, target: Value) {
    if let Some(Value::Array(all_of)) = schema.get_mut("allOf") {
        all_of.push(target);
        return;
    }
    if schema.as_object().map(|m| m.is_empty()).unwrap_or(false) {
        *schema = target;
        return;
    }
    let current = schema.take();
    *schema = json!({"allOf": [current, target]});
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_interface;
    use crate::decl::{BlockDecl, Container, FieldDecl, FunctionDecl, ParamDecl, ToolSignature};
    use crate::schema::TypeDescriptor;

    fn router() -> BlockInterface {
        let decl = BlockDecl::new("Router")
            .field(FieldDecl::config("mode", TypeDescriptor::String, None))
            .field(FieldDecl::config("limit", TypeDescriptor::Integer, Some(json!(5))))
            .field(
                FieldDecl::tool(
                    "routes",
                    ToolSignature::new()
                        .param(ParamDecl::new("message", TypeDescriptor::String))
                        .returns(TypeDescriptor::generic("R")),
                )
                .container(Container::Dictionary),
            )
            .field(FieldDecl::output("done", TypeDescriptor::Bool))
            .function(
                FunctionDecl::step("route")
                    .param(ParamDecl::new("message", TypeDescriptor::Any))
                    .returns(TypeDescriptor::generic("R"))
                    .output_name("result"),
            );
        build_interface(&decl).unwrap()
    }

    fn placement() -> BlockPlacement {
        BlockPlacement::new("router-1", BlockType::new("Router", "1.0.0"))
            .config("mode", json!("fast"))
            .tool("routes", json!({"left": {"weight": 1}, "right": {}}))
    }

    #[test]
    fn test_compile_block_tables() {
        let definition = compile_block(&router(), &placement()).unwrap();

        assert_eq!(definition.configs["mode"].value, json!("fast"));
        assert_eq!(definition.configs["limit"].value, json!(5));

        let tool_ids: Vec<&str> = definition.tools.keys().map(String::as_str).collect();
        assert_eq!(tool_ids, vec!["routes.left", "routes.right"]);
        assert_eq!(definition.tools["routes.left"].configs, json!({"weight": 1}));
        assert!(definition.tools["routes.left"].output.is_some());

        assert!(definition.outputs.contains_key("done"));
        assert!(definition.outputs.contains_key("error"));
        assert!(definition.outputs.contains_key("route.result"));
        assert!(definition.outputs.contains_key("routes.left.message"));
        assert_eq!(definition.steps["route"].output.as_deref(), Some("route.result"));
    }

    #[test]
    fn test_missing_and_unknown_config() {
        let bare = BlockPlacement::new("r", BlockType::new("Router", "1.0.0"));
        assert_eq!(
            compile_block(&router(), &bare).unwrap_err(),
            DefinitionError::MissingConfig {
                block: "Router@1.0.0".into(),
                config: "mode".into(),
            }
        );

        let extra = placement().config("colour", json!("red"));
        assert!(matches!(
            compile_block(&router(), &extra),
            Err(DefinitionError::UnknownConfig { .. })
        ));

        let lenient = compile_unvalidated(&router(), &bare).unwrap();
        assert!(!lenient.configs.contains_key("mode"));
    }

    #[test]
    fn test_validate_rejects_dangling_step_output() {
        let mut definition = compile_block(&router(), &placement()).unwrap();
        definition.outputs.shift_remove("route.result");
        assert!(matches!(
            definition.validate(),
            Err(DefinitionError::MissingOutput { step, .. }) if step == "route"
        ));
    }

    #[test]
    fn test_connect_narrows_schema() {
        let mut definitions = IndexMap::from([(
            "router-1".to_string(),
            compile_block(&router(), &placement()).unwrap(),
        )]);
        let source = ValueSourceRef::BlockOutput {
            block_id: "router-1".into(),
            output_id: "done".into(),
        };

        connect(
            &mut definitions,
            &source,
            &ValueTargetRef::External {
                schema: json!({"const": true}),
            },
        )
        .unwrap();
        assert_eq!(
            definitions["router-1"].outputs["done"].json_schema,
            json!({"allOf": [{"type": "boolean"}, {"const": true}]})
        );

        connect(
            &mut definitions,
            &source,
            &ValueTargetRef::External { schema: json!({"title": "x"}) },
        )
        .unwrap();
        assert_eq!(
            definitions["router-1"].outputs["done"].json_schema["allOf"]
                .as_array()
                .map(Vec::len),
            Some(3)
        );
    }

    #[test]
    fn test_connect_to_tool_without_output() {
        let decl = BlockDecl::new("Fire").field(FieldDecl::tool("go", ToolSignature::new()));
        let mut interface = build_interface(&decl).unwrap();
        if let Some(port) = interface.ports.get_mut("go") {
            port.inputs.shift_remove(TOOL_RETURN_PIN);
        }
        let definition = compile_block(
            &interface,
            &BlockPlacement::new("fire", BlockType::new("Fire", "1.0.0")),
        )
        .unwrap();
        let mut definitions = IndexMap::from([("fire".to_string(), definition)]);

        let result = connect(
            &mut definitions,
            &ValueSourceRef::flow_input("x"),
            &ValueTargetRef::ToolOutput {
                block_id: "fire".into(),
                tool_id: "go".into(),
            },
        );
        assert_eq!(
            result.unwrap_err(),
            DefinitionError::MissingToolOutput {
                block: "fire".into(),
                tool: "go".into(),
            }
        );
    }

    #[test]
    fn test_resolve_generic_rewrites_schemas() {
        let mut definition = compile_block(&router(), &placement()).unwrap();
        definition.resolve_generic("R", &json!({"type": "string"}));
        assert_eq!(
            definition.outputs["route.result"].json_schema,
            json!({"type": "string"})
        );
        assert_eq!(
            definition.tools["routes.right"]
                .output
                .as_ref()
                .map(|o| o.json_schema.clone()),
            Some(json!({"type": "string"}))
        );
    }

    #[test]
    fn test_definition_json_round_trip() {
        let mut definition = compile_block(&router(), &placement()).unwrap();
        definition.resolve_generic("R", &json!({"type": "integer"}));

        let first = serde_json::to_string(&definition).unwrap();
        let parsed: BlockDefinition = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed, definition);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), first);
    }
}

