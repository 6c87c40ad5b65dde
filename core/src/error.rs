use thiserror::Error;

/// Raised while deriving a block interface from its declaration.
///
/// Any of these refuses registration of the block type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterfaceError {
    #[error("Fields can only be annotated with one of Config(), Input(), and State() (field '{field}')")]
    ConflictingAnnotations { field: String },
    #[error("State() attributes must have a default value (state '{state}')")]
    StateWithoutDefault { state: String },
    #[error("State '{state}' must be declared on a single value, not a {container} container")]
    StateContainer { state: String, container: String },
    #[error("Outputs must have exactly one type (field '{field}' declares {count})")]
    OutputArity { field: String, count: usize },
    #[error("Tools must return at most one type (tool '{tool}' declares {count})")]
    ToolReturnArity { tool: String, count: usize },
    #[error("Duplicate port '{port}' declared by both {first} and {second}")]
    DuplicatePort {
        port: String,
        first: String,
        second: String,
    },
    #[error("Duplicate pin '{pin}' on port '{port}'")]
    DuplicatePin { port: String, pin: String },
    #[error("Generic setter '{field}' references unknown generic '{generic}'")]
    UnknownGeneric { field: String, generic: String },
    #[error("Invalid block version '{version}' for block '{block}': {reason}")]
    InvalidVersion {
        block: String,
        version: String,
        reason: String,
    },
}

/// Raised while compiling or validating a block definition.
///
/// Kept distinct from [`InterfaceError`] so a flow compiler can report it against
/// the offending flow and block.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Block {block} step {step} has output ref {output} but could not find a matching output in the block")]
    MissingOutput {
        block: String,
        step: String,
        output: String,
    },
    #[error("Block {block} tool {tool} has no output")]
    MissingToolOutput { block: String, tool: String },
    #[error("Block {block} has no tool '{tool}'")]
    UnknownTool { block: String, tool: String },
    #[error("Block {block} has no output '{output}'")]
    UnknownOutput { block: String, output: String },
    #[error("Block {block} step {step} has no input '{input}'")]
    UnknownInput {
        block: String,
        step: String,
        input: String,
    },
    #[error("Block {block} config '{config}' is required but no value was given")]
    MissingConfig { block: String, config: String },
    #[error("Block {block} has no config '{config}'")]
    UnknownConfig { block: String, config: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value '{value}' for {key}")]
    InvalidOverride { key: String, value: String },
}
