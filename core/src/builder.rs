//! # Interface builder
//!
//! Turns a [`BlockDecl`] into its [`BlockInterface`].
//!
//! Declarations are linearised first: the implicit root (the hidden `error`
//! output), then every base in declared order (depth first, each base once),
//! then the block itself. A later declaration replaces an earlier one with the
//! same name. Fields and functions share one namespace.
//!
//! Generics found in value and function pins become hidden block-level ports
//! named after the generic; generics inside composite ports become hidden pins
//! of that port. Generic setter fields then move those into a visible location.

use crate::decl::{
    BlockDecl, Container, FieldDecl, FieldKind, FunctionDecl, FunctionKind, ParamDecl, PinDecl,
    PinKind, PortDecl,
};
use crate::error::InterfaceError;
use crate::interface::{
    BlockInterface, BlockPinRef, InputPinInterface, Metadata, OutputPinInterface, PinType,
    PortInterface, PortType, StateInterface,
};
use crate::message::{BlockError, ERROR_PORT};
use crate::schema::{introspect, FieldAnnotations, FieldRole, TypeDescriptor};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashSet;

const ROOT_ORIGIN: &str = "Block";
pub const TOOL_RETURN_PIN: &str = "return";

enum Member<'a> {
    Field(&'a FieldDecl),
    Function(&'a FunctionDecl),
}

struct Entry<'a> {
    origin: String,
    member: Member<'a>,
}

/// Build the interface of `decl`.
pub fn build_interface(decl: &BlockDecl) -> Result<BlockInterface, InterfaceError> {
    let root = root_error_field();
    let mut members: IndexMap<String, Entry<'_>> = IndexMap::new();
    insert_member(
        &mut members,
        root.name.clone(),
        ROOT_ORIGIN,
        Member::Field(&root),
    )?;

    let mut metadata = Metadata::new();
    let mut seen = HashSet::new();
    linearize(decl, &mut seen, &mut members, &mut metadata)?;

    let mut builder = InterfaceBuilder::default();
    let mut setters = Vec::new();

    for (name, entry) in &members {
        match entry.member {
            Member::Field(field) => match &field.kind {
                FieldKind::GenericSetter { generic } => setters.push((field, generic.as_str())),
                _ => builder.add_field(name, field, &entry.origin)?,
            },
            Member::Function(function) => builder.add_function(function)?,
        }
    }

    builder.add_generic_ports(&members)?;

    for (field, generic) in setters {
        builder.apply_block_setter(field, generic)?;
    }

    Ok(BlockInterface {
        metadata,
        ports: builder.ports,
        state: builder.states,
    })
}

fn root_error_field() -> FieldDecl {
    FieldDecl::output(ERROR_PORT, TypeDescriptor::of::<BlockError>())
        .with_metadata("hidden", Value::Bool(true))
}

fn linearize<'a>(
    decl: &'a BlockDecl,
    seen: &mut HashSet<String>,
    members: &mut IndexMap<String, Entry<'a>>,
    metadata: &mut Metadata,
) -> Result<(), InterfaceError> {
    for base in &decl.bases {
        if seen.insert(base.name.clone()) {
            linearize(base, seen, members, metadata)?;
        }
    }

    metadata.extend(decl.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
    let origin = decl.block_name();
    for field in &decl.fields {
        insert_member(members, field.name.clone(), origin, Member::Field(field))?;
    }
    for function in &decl.functions {
        insert_member(
            members,
            function.name.clone(),
            origin,
            Member::Function(function),
        )?;
    }
    Ok(())
}

fn insert_member<'a>(
    members: &mut IndexMap<String, Entry<'a>>,
    name: String,
    origin: &str,
    member: Member<'a>,
) -> Result<(), InterfaceError> {
    if let Some(existing) = members.get(&name) {
        let same_kind = matches!(
            (&existing.member, &member),
            (Member::Field(_), Member::Field(_)) | (Member::Function(_), Member::Function(_))
        );
        if !same_kind {
            return Err(InterfaceError::DuplicatePort {
                port: name,
                first: existing.origin.clone(),
                second: origin.to_string(),
            });
        }
    }
    members.insert(
        name,
        Entry {
            origin: origin.to_string(),
            member,
        },
    );
    Ok(())
}

#[derive(Default)]
struct InterfaceBuilder {
    ports: IndexMap<String, PortInterface>,
    states: IndexMap<String, StateInterface>,
    /// Block-level generics in order of first use, with their bound schema.
    generics: IndexMap<String, Value>,
}

impl InterfaceBuilder {
    fn add_field(
        &mut self,
        name: &str,
        field: &FieldDecl,
        origin: &str,
    ) -> Result<(), InterfaceError> {
        match &field.kind {
            FieldKind::Output { types, container } => {
                let ty = single_type(name, types)?;
                let pin = self.output_pin(ty, PinType::Single, |g| BlockPinRef::new(g, ""));
                self.ports.insert(
                    name.to_string(),
                    PortInterface {
                        metadata: field.metadata.clone(),
                        inputs: IndexMap::new(),
                        outputs: IndexMap::from([(String::new(), pin)]),
                        port_type: PinType::from(*container).into(),
                        is_function: false,
                    },
                );
            }
            FieldKind::Value {
                ty,
                default,
                container,
            } => self.add_value_field(name, field, ty, default.as_ref(), *container)?,
            FieldKind::Port { port, container } => {
                let built = build_composite_port(name, port, *container, &field.metadata)?;
                self.ports.insert(name.to_string(), built);
            }
            FieldKind::GenericSetter { .. } => {}
        }
        tracing::trace!(field = name, origin, "interface field added");
        Ok(())
    }

    fn add_value_field(
        &mut self,
        name: &str,
        field: &FieldDecl,
        ty: &TypeDescriptor,
        default: Option<&Value>,
        container: Container,
    ) -> Result<(), InterfaceError> {
        let (_, annotations) = ty.peel();
        let classified = FieldAnnotations::classify(name, &annotations)?;
        let introspected = introspect(ty);

        let sticky = match &classified.role {
            FieldRole::Plain => return Ok(()),
            FieldRole::State { step_id, input_ids } => {
                if container != Container::Single {
                    return Err(InterfaceError::StateContainer {
                        state: name.to_string(),
                        container: PortType::from(PinType::from(container)).to_string(),
                    });
                }
                let default = default.cloned().ok_or_else(|| {
                    InterfaceError::StateWithoutDefault {
                        state: name.to_string(),
                    }
                })?;
                let scope = match step_id {
                    Some(step) => input_ids
                        .iter()
                        .map(|input| BlockPinRef::new(step.clone(), input.clone()))
                        .collect(),
                    None => Vec::new(),
                };
                let mut metadata = field.metadata.clone();
                metadata.extend(classified.metadata.clone());
                self.states.insert(
                    name.to_string(),
                    StateInterface {
                        metadata,
                        scope,
                        default,
                        json_schema: introspected.schema,
                    },
                );
                return Ok(());
            }
            FieldRole::Config => true,
            FieldRole::Input { sticky } => *sticky,
        };

        let mut metadata = classified.metadata.clone();
        if classified.role == FieldRole::Config {
            metadata.insert("config".into(), Value::Bool(true));
        }

        let mut generics = IndexMap::new();
        for (generic, bound) in &introspected.generics {
            self.generics
                .entry(generic.clone())
                .or_insert_with(|| bound.clone());
            generics.insert(generic.clone(), BlockPinRef::new(generic.clone(), ""));
        }

        let pin = InputPinInterface {
            metadata,
            sticky,
            json_schema: introspected.schema,
            generics,
            pin_type: PinType::Single,
            required: default.is_none(),
            default: default.cloned().unwrap_or(Value::Null),
        };

        self.ports.insert(
            name.to_string(),
            PortInterface {
                metadata: field.metadata.clone(),
                inputs: IndexMap::from([(String::new(), pin)]),
                outputs: IndexMap::new(),
                port_type: PinType::from(container).into(),
                is_function: false,
            },
        );
        Ok(())
    }

    fn add_function(&mut self, function: &FunctionDecl) -> Result<(), InterfaceError> {
        let mut inputs = IndexMap::new();
        for param in &function.params {
            let pin = self.param_pin(param)?;
            if inputs.insert(param.name.clone(), pin).is_some() {
                return Err(InterfaceError::DuplicatePin {
                    port: function.name.clone(),
                    pin: param.name.clone(),
                });
            }
        }

        let mut outputs = IndexMap::new();
        if let (FunctionKind::Step { output_name }, Some(returns)) =
            (&function.kind, &function.returns)
        {
            let pin = self.output_pin(returns, PinType::Single, |g| BlockPinRef::new(g, ""));
            outputs.insert(output_name.clone().unwrap_or_default(), pin);
        }

        let mut metadata = function.metadata.clone();
        if function.is_callback() {
            metadata.insert("callback".into(), Value::Bool(true));
        }

        self.ports.insert(
            function.name.clone(),
            PortInterface {
                metadata,
                inputs,
                outputs,
                port_type: PortType::Single,
                is_function: true,
            },
        );
        Ok(())
    }

    fn param_pin(&mut self, param: &ParamDecl) -> Result<InputPinInterface, InterfaceError> {
        let (_, annotations) = param.ty.peel();
        let classified = FieldAnnotations::classify(&param.name, &annotations)?;
        let sticky = matches!(classified.role, FieldRole::Input { sticky: true });
        let introspected = introspect(&param.ty);

        let mut generics = IndexMap::new();
        for (generic, bound) in &introspected.generics {
            self.generics
                .entry(generic.clone())
                .or_insert_with(|| bound.clone());
            generics.insert(generic.clone(), BlockPinRef::new(generic.clone(), ""));
        }

        Ok(InputPinInterface {
            metadata: classified.metadata,
            sticky,
            json_schema: introspected.schema,
            generics,
            pin_type: param.kind.into(),
            required: param.default.is_none(),
            default: param.default.clone().unwrap_or(Value::Null),
        })
    }

    fn output_pin(
        &mut self,
        ty: &TypeDescriptor,
        pin_type: PinType,
        reference: impl Fn(&str) -> BlockPinRef,
    ) -> OutputPinInterface {
        let (_, annotations) = ty.peel();
        let introspected = introspect(ty);
        let mut generics = IndexMap::new();
        for (generic, bound) in &introspected.generics {
            self.generics
                .entry(generic.clone())
                .or_insert_with(|| bound.clone());
            generics.insert(generic.clone(), reference(generic));
        }
        OutputPinInterface {
            metadata: annotation_metadata(&annotations),
            json_schema: introspected.schema,
            generics,
            pin_type,
        }
    }

    fn add_generic_ports(
        &mut self,
        members: &IndexMap<String, Entry<'_>>,
    ) -> Result<(), InterfaceError> {
        for (generic, bound) in &self.generics {
            if let Some(existing) = members.get(generic) {
                return Err(InterfaceError::DuplicatePort {
                    port: generic.clone(),
                    first: existing.origin.clone(),
                    second: format!("generic {generic}"),
                });
            }
            self.ports.insert(
                generic.clone(),
                PortInterface {
                    metadata: Metadata::new(),
                    inputs: IndexMap::from([(String::new(), generic_input_pin(bound.clone()))]),
                    outputs: IndexMap::new(),
                    port_type: PortType::Single,
                    is_function: false,
                },
            );
        }
        Ok(())
    }

    /// Move the hidden port of `generic` to `field.name`, make it visible and
    /// repoint every back-reference.
    fn apply_block_setter(&mut self, field: &FieldDecl, generic: &str) -> Result<(), InterfaceError> {
        let is_generic_port = self
            .ports
            .get(generic)
            .map(PortInterface::is_generic)
            .unwrap_or(false);
        if !is_generic_port {
            return Err(InterfaceError::UnknownGeneric {
                field: field.name.clone(),
                generic: generic.to_string(),
            });
        }

        let Some((index, _, mut port)) = self.ports.swap_remove_full(generic) else {
            return Err(InterfaceError::UnknownGeneric {
                field: field.name.clone(),
                generic: generic.to_string(),
            });
        };
        if let Some(pin) = port.inputs.get_mut("") {
            pin.metadata.insert("hidden".into(), Value::Bool(false));
            pin.metadata
                .extend(field.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        let (new_index, previous) = self.ports.insert_full(field.name.clone(), port);
        if previous.is_some() {
            return Err(InterfaceError::DuplicatePort {
                port: field.name.clone(),
                first: field.name.clone(),
                second: format!("generic setter for {generic}"),
            });
        }
        // keep the generic's position
        self.ports.swap_indices(index, new_index);

        let from = BlockPinRef::new(generic, "");
        let to = BlockPinRef::new(field.name.clone(), "");
        relocate_refs(&mut self.ports, &from, &to);
        Ok(())
    }
}

fn build_composite_port(
    name: &str,
    decl: &PortDecl,
    container: Container,
    field_metadata: &Metadata,
) -> Result<PortInterface, InterfaceError> {
    let mut inputs: IndexMap<String, InputPinInterface> = IndexMap::new();
    let mut outputs: IndexMap<String, OutputPinInterface> = IndexMap::new();
    let mut generics: IndexMap<String, Value> = IndexMap::new();
    let mut metadata = field_metadata.clone();

    let mut collect = |found: &IndexMap<String, Value>| {
        let mut refs = IndexMap::new();
        for (generic, bound) in found {
            generics.entry(generic.clone()).or_insert_with(|| bound.clone());
            refs.insert(generic.clone(), BlockPinRef::new(name, generic.clone()));
        }
        refs
    };

    if let Some(tool) = &decl.tool {
        metadata.insert("tool".into(), Value::Bool(true));
        if tool.returns.len() > 1 {
            return Err(InterfaceError::ToolReturnArity {
                tool: name.to_string(),
                count: tool.returns.len(),
            });
        }

        for param in &tool.params {
            let (_, annotations) = param.ty.peel();
            let introspected = introspect(&param.ty);
            let pin = OutputPinInterface {
                metadata: annotation_metadata(&annotations),
                json_schema: introspected.schema,
                generics: collect(&introspected.generics),
                pin_type: param.kind.into(),
            };
            if outputs.insert(param.name.clone(), pin).is_some() {
                return Err(InterfaceError::DuplicatePin {
                    port: name.to_string(),
                    pin: param.name.clone(),
                });
            }
        }

        let (schema, refs) = match tool.returns.first() {
            Some(ty) => {
                let introspected = introspect(ty);
                let refs = collect(&introspected.generics);
                (introspected.schema, refs)
            }
            None => (json!({}), IndexMap::new()),
        };
        inputs.insert(
            TOOL_RETURN_PIN.to_string(),
            InputPinInterface {
                metadata: Metadata::new(),
                sticky: false,
                json_schema: schema,
                generics: refs,
                pin_type: PinType::Single,
                required: false,
                default: Value::Null,
            },
        );
    }

    let mut setters = Vec::new();
    for pin in &decl.pins {
        match &pin.kind {
            PinKind::Output { types, container } => {
                let ty = single_type(&format!("{name}.{}", pin.name), types)?;
                let (_, annotations) = ty.peel();
                let introspected = introspect(ty);
                let mut pin_metadata = annotation_metadata(&annotations);
                pin_metadata.extend(pin.metadata.clone());
                let built = OutputPinInterface {
                    metadata: pin_metadata,
                    json_schema: introspected.schema,
                    generics: collect(&introspected.generics),
                    pin_type: (*container).into(),
                };
                if outputs.insert(pin.name.clone(), built).is_some() {
                    return Err(duplicate_pin(name, pin));
                }
            }
            PinKind::Value {
                ty,
                default,
                container,
            } => {
                let (_, annotations) = ty.peel();
                let classified =
                    FieldAnnotations::classify(&format!("{name}.{}", pin.name), &annotations)?;
                let sticky = match &classified.role {
                    FieldRole::Config => true,
                    FieldRole::Input { sticky } => *sticky,
                    FieldRole::Plain | FieldRole::State { .. } => continue,
                };
                let mut pin_metadata = classified.metadata.clone();
                pin_metadata.extend(pin.metadata.clone());
                if classified.role == FieldRole::Config {
                    pin_metadata.insert("config".into(), Value::Bool(true));
                }
                let introspected = introspect(ty);
                let built = InputPinInterface {
                    metadata: pin_metadata,
                    sticky,
                    json_schema: introspected.schema,
                    generics: collect(&introspected.generics),
                    pin_type: (*container).into(),
                    required: default.is_none(),
                    default: default.clone().unwrap_or(Value::Null),
                };
                if inputs.insert(pin.name.clone(), built).is_some() {
                    return Err(duplicate_pin(name, pin));
                }
            }
            PinKind::GenericSetter { generic } => setters.push((pin, generic.as_str())),
        }
    }

    for (generic, bound) in generics {
        if inputs.contains_key(&generic) || outputs.contains_key(&generic) {
            return Err(InterfaceError::DuplicatePin {
                port: name.to_string(),
                pin: generic,
            });
        }
        inputs.insert(generic, generic_input_pin(bound));
    }

    let mut port = PortInterface {
        metadata,
        inputs,
        outputs,
        port_type: PinType::from(container).into(),
        is_function: false,
    };

    for (pin, generic) in setters {
        apply_pin_setter(name, &mut port, pin, generic)?;
    }

    Ok(port)
}

fn apply_pin_setter(
    port_name: &str,
    port: &mut PortInterface,
    setter: &PinDecl,
    generic: &str,
) -> Result<(), InterfaceError> {
    let unknown = || InterfaceError::UnknownGeneric {
        field: format!("{port_name}.{}", setter.name),
        generic: generic.to_string(),
    };

    if !port.inputs.get(generic).map(InputPinInterface::is_generic).unwrap_or(false) {
        return Err(unknown());
    }
    let Some((index, _, mut pin)) = port.inputs.swap_remove_full(generic) else {
        return Err(unknown());
    };
    pin.metadata.insert("hidden".into(), Value::Bool(false));
    pin.metadata
        .extend(setter.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

    let (new_index, previous) = port.inputs.insert_full(setter.name.clone(), pin);
    if previous.is_some() {
        return Err(InterfaceError::DuplicatePin {
            port: port_name.to_string(),
            pin: setter.name.clone(),
        });
    }
    port.inputs.swap_indices(index, new_index);

    let from = BlockPinRef::new(port_name, generic);
    let to = BlockPinRef::new(port_name, setter.name.clone());
    for pin in port.inputs.values_mut() {
        repoint(&mut pin.generics, &from, &to);
    }
    for pin in port.outputs.values_mut() {
        repoint(&mut pin.generics, &from, &to);
    }
    Ok(())
}

fn relocate_refs(ports: &mut IndexMap<String, PortInterface>, from: &BlockPinRef, to: &BlockPinRef) {
    for port in ports.values_mut() {
        for pin in port.inputs.values_mut() {
            repoint(&mut pin.generics, from, to);
        }
        for pin in port.outputs.values_mut() {
            repoint(&mut pin.generics, from, to);
        }
    }
}

fn repoint(generics: &mut IndexMap<String, BlockPinRef>, from: &BlockPinRef, to: &BlockPinRef) {
    for target in generics.values_mut() {
        if target == from {
            *target = to.clone();
        }
    }
}

fn generic_input_pin(bound: Value) -> InputPinInterface {
    let mut metadata = Metadata::new();
    metadata.insert("generic".into(), Value::Bool(true));
    metadata.insert("hidden".into(), Value::Bool(true));
    InputPinInterface {
        metadata,
        sticky: true,
        json_schema: crate::schema::generic_pin_schema(),
        generics: IndexMap::new(),
        pin_type: PinType::Single,
        required: false,
        default: bound,
    }
}

fn single_type<'a>(
    field: &str,
    types: &'a [TypeDescriptor],
) -> Result<&'a TypeDescriptor, InterfaceError> {
    match types {
        [ty] => Ok(ty),
        _ => Err(InterfaceError::OutputArity {
            field: field.to_string(),
            count: types.len(),
        }),
    }
}

fn annotation_metadata(annotations: &[&crate::schema::Annotation]) -> Metadata {
    let mut metadata = Metadata::new();
    for annotation in annotations {
        if let crate::schema::Annotation::Metadata { data } = annotation {
            metadata.extend(data.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    metadata
}

fn duplicate_pin(port: &str, pin: &PinDecl) -> InterfaceError {
    InterfaceError::DuplicatePin {
        port: port.to_string(),
        pin: pin.name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::{ParamDecl, ToolSignature};
    use crate::schema::Annotation;

    fn map_decl() -> BlockDecl {
        BlockDecl::new("Map")
            .field(FieldDecl::tool(
                "run",
                ToolSignature::new()
                    .param(ParamDecl::new("item", TypeDescriptor::generic("ItemT")))
                    .returns(TypeDescriptor::generic("ResultT")),
            ))
            .field(FieldDecl::output(
                "results",
                TypeDescriptor::array(TypeDescriptor::generic("ResultT")),
            ))
            .field(
                FieldDecl::state("count", TypeDescriptor::Integer, json!(0))
                    .scoped_to("map", ["items"]),
            )
            .function(
                FunctionDecl::step("map")
                    .param(ParamDecl::new(
                        "items",
                        TypeDescriptor::array(TypeDescriptor::generic("ItemT")),
                    )),
            )
            .function(
                FunctionDecl::callback("collect")
                    .param(ParamDecl::new("result", TypeDescriptor::generic("ResultT")))
                    .param(ParamDecl::new("index", TypeDescriptor::Integer)),
            )
    }

    #[test]
    fn test_build_is_deterministic() {
        let decl = map_decl();
        let first = build_interface(&decl).unwrap();
        let second = build_interface(&decl).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_root_error_port_is_hidden_output() {
        let interface = build_interface(&BlockDecl::new("Empty")).unwrap();
        let error = interface.port(ERROR_PORT).unwrap();
        assert_eq!(error.metadata["hidden"], json!(true));
        assert!(error.outputs.contains_key(""));
        assert!(!error.is_function);
    }

    #[test]
    fn test_tool_port_shape() {
        let interface = build_interface(&map_decl()).unwrap();
        let run = interface.port("run").unwrap();
        assert!(run.is_tool());
        assert_eq!(run.outputs["item"].generics["ItemT"], BlockPinRef::new("run", "ItemT"));

        let ret = &run.inputs[TOOL_RETURN_PIN];
        assert!(!ret.sticky);
        assert!(!ret.required);
        assert_eq!(ret.default, Value::Null);

        let hidden = &run.inputs["ItemT"];
        assert!(hidden.is_generic());
        assert!(hidden.sticky);
        assert_eq!(hidden.metadata["hidden"], json!(true));
    }

    #[test]
    fn test_block_generics_become_hidden_ports() {
        let interface = build_interface(&map_decl()).unwrap();
        let port = interface.port("ItemT").unwrap();
        assert!(port.is_generic());
        assert_eq!(port.inputs[""].json_schema, crate::schema::generic_pin_schema());
        assert_eq!(port.inputs[""].default, json!({}));

        let items = &interface.port("map").unwrap().inputs["items"];
        assert_eq!(items.generics["ItemT"], BlockPinRef::new("ItemT", ""));
    }

    #[test]
    fn test_generic_setter_relocates_refs() {
        let decl = map_decl().field(
            FieldDecl::generic_setter("item_schema", "ItemT")
                .with_metadata("description", json!("Shape of each item")),
        );
        let interface = build_interface(&decl).unwrap();

        assert!(interface.port("ItemT").is_none());
        let setter = interface.port("item_schema").unwrap();
        assert_eq!(setter.inputs[""].metadata["hidden"], json!(false));
        assert_eq!(setter.inputs[""].metadata["description"], json!("Shape of each item"));

        let items = &interface.port("map").unwrap().inputs["items"];
        assert_eq!(items.generics["ItemT"], BlockPinRef::new("item_schema", ""));
    }

    #[test]
    fn test_pin_generic_setter() {
        let tool = PortDecl::new()
            .tool(
                ToolSignature::new().param(ParamDecl::new("value", TypeDescriptor::generic("T"))),
            )
            .pin(PinDecl::generic_setter("schema", "T"));
        let decl = BlockDecl::new("Probe").field(FieldDecl::port("probe", tool));
        let interface = build_interface(&decl).unwrap();

        let probe = interface.port("probe").unwrap();
        assert!(!probe.inputs.contains_key("T"));
        assert_eq!(probe.inputs["schema"].metadata["hidden"], json!(false));
        assert_eq!(
            probe.outputs["value"].generics["T"],
            BlockPinRef::new("probe", "schema")
        );
    }

    #[test]
    fn test_unknown_generic_setter() {
        let decl = BlockDecl::new("Bad").field(FieldDecl::generic_setter("schema", "Nope"));
        assert_eq!(
            build_interface(&decl).unwrap_err(),
            InterfaceError::UnknownGeneric {
                field: "schema".into(),
                generic: "Nope".into(),
            }
        );
    }

    #[test]
    fn test_field_and_function_collide() {
        let decl = BlockDecl::new("Clash")
            .field(FieldDecl::output("run", TypeDescriptor::String))
            .function(FunctionDecl::step("run"));
        assert!(matches!(
            build_interface(&decl),
            Err(InterfaceError::DuplicatePort { port, .. }) if port == "run"
        ));
    }

    #[test]
    fn test_derived_field_overrides_base() {
        let base = BlockDecl::new("Base")
            .field(FieldDecl::output("output", TypeDescriptor::String))
            .field(FieldDecl::config("limit", TypeDescriptor::Integer, Some(json!(1))));
        let derived = BlockDecl::new("Derived")
            .extends(base)
            .field(FieldDecl::output("output", TypeDescriptor::Integer));

        let interface = build_interface(&derived).unwrap();
        let names: Vec<&str> = interface.ports.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["error", "output", "limit"]);
        assert_eq!(
            interface.port("output").unwrap().outputs[""].json_schema,
            json!({"type": "integer"})
        );
    }

    #[test]
    fn test_config_and_state_rules() {
        let decl = BlockDecl::new("Counter")
            .field(FieldDecl::config("step", TypeDescriptor::Integer, None))
            .field(FieldDecl::state("total", TypeDescriptor::Integer, json!(0)));
        let interface = build_interface(&decl).unwrap();

        let step = &interface.port("step").unwrap().inputs[""];
        assert!(step.is_config());
        assert!(step.sticky);
        assert!(step.required);

        let total = &interface.state["total"];
        assert!(total.scope.is_empty());
        assert_eq!(total.default, json!(0));
        assert!(interface.port("total").is_none());
    }

    #[test]
    fn test_state_scope_and_errors() {
        let interface = build_interface(&map_decl()).unwrap();
        assert_eq!(interface.state["count"].scope, vec![BlockPinRef::new("map", "items")]);

        let no_default = BlockDecl::new("Bad").field(FieldDecl::value(
            "total",
            TypeDescriptor::Integer.annotated(Annotation::State {
                step_id: None,
                input_ids: vec![],
            }),
            None,
        ));
        assert_eq!(
            build_interface(&no_default).unwrap_err(),
            InterfaceError::StateWithoutDefault {
                state: "total".into()
            }
        );

        let listed = BlockDecl::new("Bad").field(
            FieldDecl::state("total", TypeDescriptor::Integer, json!(0)).container(Container::List),
        );
        assert!(matches!(
            build_interface(&listed),
            Err(InterfaceError::StateContainer { .. })
        ));
    }

    #[test]
    fn test_plain_value_fields_are_ignored() {
        let decl = BlockDecl::new("Plain").field(FieldDecl::value(
            "scratch",
            TypeDescriptor::String,
            None,
        ));
        let interface = build_interface(&decl).unwrap();
        assert!(interface.port("scratch").is_none());
    }

    #[test]
    fn test_function_param_kinds() {
        let decl = BlockDecl::new("Join").function(
            FunctionDecl::step("join")
                .param(ParamDecl::var_positional("strings", TypeDescriptor::String))
                .param(ParamDecl::var_keyword("extra", TypeDescriptor::Any))
                .param(
                    ParamDecl::new("separator", TypeDescriptor::String)
                        .with_default(json!(","))
                        .sticky(),
                )
                .returns(TypeDescriptor::String)
                .output_name("output"),
        );
        let interface = build_interface(&decl).unwrap();
        let join = interface.port("join").unwrap();

        assert!(join.is_function);
        assert_eq!(join.inputs["strings"].pin_type, PinType::List);
        assert_eq!(join.inputs["extra"].pin_type, PinType::Dictionary);
        assert!(join.inputs["separator"].sticky);
        assert!(!join.inputs["separator"].required);
        assert!(join.inputs["strings"].required);
        assert!(join.outputs.contains_key("output"));
    }

    #[test]
    fn test_callbacks_have_no_outputs() {
        let interface = build_interface(&map_decl()).unwrap();
        let collect = interface.port("collect").unwrap();
        assert!(collect.outputs.is_empty());
        assert!(collect.is_callback());
        assert!(!interface.port("map").unwrap().is_callback());
    }

    #[test]
    fn test_output_and_tool_arity() {
        let decl = BlockDecl::new("Bad").field(FieldDecl {
            name: "out".into(),
            metadata: Metadata::new(),
            kind: FieldKind::Output {
                types: vec![TypeDescriptor::String, TypeDescriptor::Integer],
                container: Container::Single,
            },
        });
        assert_eq!(
            build_interface(&decl).unwrap_err().to_string(),
            "Outputs must have exactly one type (field 'out' declares 2)"
        );

        let tool = ToolSignature::new()
            .returns(TypeDescriptor::String)
            .returns(TypeDescriptor::Integer);
        let decl = BlockDecl::new("Bad").field(FieldDecl::tool("run", tool));
        assert!(matches!(
            build_interface(&decl),
            Err(InterfaceError::ToolReturnArity { count: 2, .. })
        ));
    }

    #[test]
    fn test_dictionary_tool_port() {
        let decl = BlockDecl::new("Router").field(
            FieldDecl::tool("routes", ToolSignature::new().returns(TypeDescriptor::String))
                .container(Container::Dictionary),
        );
        let interface = build_interface(&decl).unwrap();
        assert_eq!(interface.port("routes").unwrap().port_type, PortType::Dictionary);
    }
}
