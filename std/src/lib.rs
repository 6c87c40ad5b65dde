//! Built-in blocks for common list and string plumbing.
//!
//! ```ignore
//! let registry = BlockRegistry::new();
//! blockflow_std::register_standard_blocks(&registry)?;
//! ```

pub mod blocks;
pub mod category;
pub mod prelude;

use blockflow_runtime::{BlockRegistry, Result};

/// Register every block of this crate.
pub fn register_standard_blocks(registry: &BlockRegistry) -> Result<()> {
    use blocks::*;

    registry.register(Map)?;
    registry.register(Collect)?;
    registry.register(Count)?;
    registry.register(ForEach)?;
    registry.register(Slice)?;
    registry.register(First)?;
    registry.register(Flatten)?;
    registry.register(JoinStrings)?;
    registry.register(SplitString)?;
    registry.register(Concat)?;
    tracing::debug!(blocks = registry.len(), "registered standard blocks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_standard_blocks() {
        let registry = BlockRegistry::new();
        register_standard_blocks(&registry).unwrap();
        assert_eq!(registry.len(), 10);
        assert!(registry.find("SplitString", "^1").is_ok());
    }
}
