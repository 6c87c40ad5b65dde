//! Blockflow facade crate.
//!
//! Re-exports the core, runtime and std crates behind one dependency, and
//! sets up logging from a [`RuntimeConfig`](blockflow_core::RuntimeConfig).

pub mod logging;

pub use blockflow_core as core;
pub use blockflow_runtime as runtime;
#[cfg(feature = "std")]
pub use blockflow_std as std;

pub use blockflow_core::{BlockDecl, BlockInterface, FlowValue, RuntimeConfig};
pub use blockflow_runtime::{Block, BlockHost, BlockRegistry, Engine, FlowScope};
pub use logging::{init_stdout_tracing, init_tracing};

pub mod prelude {
    pub use blockflow_core::prelude::*;
    pub use blockflow_runtime::prelude::*;
    #[cfg(feature = "std")]
    pub use blockflow_std::prelude::*;
}
