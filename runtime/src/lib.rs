//! # blockflow-runtime
//!
//! Executes blocks declared with `blockflow-core`.
//!
//! * [`BlockRegistry`] - registered implementations by name and version
//! * [`LiveInstance`] - the slot table of one block for one invocation
//! * [`Engine`] - runs a Step or Callback and contains its failures
//! * [`ProvenanceTracker`] - lineage queries over the FlowValue graph
//! * [`BlockHost`] - sticky values, scoped state and tool subscriptions of a
//!   placed block across invocations

pub mod block;
pub mod engine;
pub mod error;
pub mod host;
pub mod instance;
pub mod invocation;
pub mod provenance;
pub mod registry;
pub mod resources;
pub mod subscription;
mod validate;

pub use block::{ArgValue, Block, CallArgs};
pub use engine::Engine;
pub use error::{ProvenanceError, Result, RuntimeError};
pub use host::{BlockHost, BoundValue, FlowScope, HostOutcome, InstanceHandle};
pub use instance::{DynamicPorts, LiveInstance, PendingInputs, PinSlot, PortObject, PortSlot};
pub use invocation::{Invocation, ToolArgs, ToolCall, ToolPort};
pub use provenance::{FlowValueRegistry, ProvenanceTracker, VersionHistory};
pub use registry::{BlockRegistry, RegisteredBlock};
pub use resources::Resources;
pub use subscription::{PendingCallbacks, Resolution, Resumption, ToolSubscriptions};

pub mod prelude {
    pub use crate::block::{Block, CallArgs};
    pub use crate::engine::Engine;
    pub use crate::host::{BoundValue, FlowScope, InstanceHandle};
    pub use crate::invocation::{Invocation, ToolArgs};
    pub use crate::registry::BlockRegistry;
    pub use crate::resources::Resources;
}
