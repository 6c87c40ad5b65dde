use blockflow_core::{DefinitionError, InterfaceError};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Failures that abort a registration, a lookup or a single invocation.
///
/// Errors raised inside a block body never surface here; the engine turns
/// them into values on the block's `error` output.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Block type {block} was refused registration: {source}")]
    Interface {
        block: String,
        #[source]
        source: InterfaceError,
    },
    #[error("No registered version of block '{name}' matches '{range}'")]
    NoMatchingVersion { name: String, range: String },
    #[error("Invalid version range '{range}': {reason}")]
    InvalidRange { range: String, reason: String },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("Block {block} has no port '{port}'")]
    UnknownPort { block: String, port: String },
    #[error("Block {block} port '{port}' has no pin '{pin}'")]
    UnknownPin {
        block: String,
        port: String,
        pin: String,
    },
    #[error("Block {block} has no function '{function}'")]
    UnknownFunction { block: String, function: String },
    #[error("Block {block} has no state '{state}'")]
    UnknownState { block: String, state: String },
    #[error("Indexes on list Ports/Pins must be valid integers (got '{index}' for {target})")]
    InvalidIndex { target: String, index: String },
    #[error("Index {index} for {target} is {skew} past the end, the limit is {max}")]
    IndexSkew {
        target: String,
        index: usize,
        skew: usize,
        max: usize,
    },
    #[error("Value for {target} must be {expected}")]
    ShapeMismatch { target: String, expected: String },
    #[error("Value for {target} does not match its schema: {reason}")]
    SchemaMismatch { target: String, reason: String },
    #[error("Block {block} function '{function}' is missing required input '{pin}'")]
    MissingInput {
        block: String,
        function: String,
        pin: String,
    },
    #[error("Tool {tool} already has {pending} pending calls (limit {limit})")]
    TooManyPending {
        tool: String,
        pending: usize,
        limit: usize,
    },
    #[error(transparent)]
    Provenance(#[from] ProvenanceError),
}

/// The FlowValue graph is append-only and fully connected; anything else is
/// a broken causal graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvenanceError {
    #[error("FlowValue {value} references unknown parent {parent}")]
    UnknownParent { value: Uuid, parent: Uuid },
    #[error("Unknown FlowValue {0}")]
    UnknownValue(Uuid),
    #[error("FlowValue {0} is already registered")]
    Duplicate(Uuid),
}
