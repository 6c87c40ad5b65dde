//! # blockflow-core
//!
//! Synchronous model of a block: how it is declared, the interface derived from
//! the declaration, and the definition a flow compiles it into. Nothing here runs
//! blocks; see `blockflow-runtime` for that.

pub mod builder;
pub mod compile;
pub mod config;
pub mod decl;
pub mod error;
pub mod interface;
pub mod message;
pub mod schema;
pub mod value;

pub use builder::{build_interface, TOOL_RETURN_PIN};
pub use compile::{
    compile_block, compile_unvalidated, connect, BlockDefinition, BlockPlacement,
    ConfigDefinition, InputDefinition, OutputDefinition, StateDefinition, StepDefinition,
    ToolDefinition, ToolInputDefinition, ToolOutputDefinition, ValueTargetRef,
};
pub use config::{
    InstanceConfig, LoggingConfig, ProvenanceConfig, RuntimeConfig, SubscriptionConfig,
};
pub use decl::{
    coerce_version, BlockDecl, Container, FieldDecl, FieldKind, FunctionDecl, FunctionKind,
    ParamDecl, ParamKind, PinDecl, PinKind, PortDecl, ToolSignature,
};
pub use error::{ConfigError, DefinitionError, InterfaceError};
pub use interface::{
    indexed, BlockInterface, BlockPinRef, BlockType, InputPinInterface, Metadata,
    OutputPinInterface, PinAddress, PinType, PortInterface, PortType, StateInterface,
};
pub use message::{
    BlockError, BlockFailure, BlockMessage, BlockRunRequest, CallbackCall, InputValue,
    InvocationBatch, OutputValue, PinRedirect, StateValue, ERROR_PORT,
};
pub use schema::{introspect, Annotation, ObjectField, SchemaWithGenerics, TypeDescriptor};
pub use value::{canonical_json, FlowValue, ValueSourceRef};

pub mod prelude {
    pub use crate::decl::{
        BlockDecl, Container, FieldDecl, FunctionDecl, ParamDecl, PinDecl, PortDecl,
        ToolSignature,
    };
    pub use crate::interface::{BlockInterface, BlockPinRef, BlockType};
    pub use crate::message::{BlockFailure, CallbackCall, InvocationBatch};
    pub use crate::schema::{Annotation, ObjectField, TypeDescriptor};
    pub use crate::value::FlowValue;
}
