//! Block registry for registration and versioned lookup

use crate::block::Block;
use crate::error::{Result, RuntimeError};
use blockflow_core::{build_interface, BlockInterface, BlockType};
use dashmap::DashMap;
use semver::{Version, VersionReq};
use std::sync::Arc;

/// One registered implementation of a block type.
pub struct RegisteredBlock {
    block_type: BlockType,
    version: Version,
    interface: Arc<BlockInterface>,
    block: Arc<dyn Block>,
}

impl RegisteredBlock {
    pub fn block_type(&self) -> &BlockType {
        &self.block_type
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn interface(&self) -> &Arc<BlockInterface> {
        &self.interface
    }

    pub fn block(&self) -> &Arc<dyn Block> {
        &self.block
    }
}

impl std::fmt::Debug for RegisteredBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBlock")
            .field("block_type", &self.block_type)
            .field("ports", &self.interface.ports.len())
            .finish()
    }
}

/// Concurrent registry of block implementations, keyed by name and holding
/// every registered version in ascending order.
///
/// Owned by the composition root; [`BlockRegistry::clear`] is the explicit
/// teardown.
#[derive(Default)]
pub struct BlockRegistry {
    blocks: DashMap<String, Vec<Arc<RegisteredBlock>>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block, building its interface once.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Interface`] when the declaration does not yield a
    /// valid interface; the block is not registered.
    pub fn register(&self, block: impl Block) -> Result<Arc<RegisteredBlock>> {
        self.register_arc(Arc::new(block))
    }

    pub fn register_arc(&self, block: Arc<dyn Block>) -> Result<Arc<RegisteredBlock>> {
        let decl = block.declaration();
        let name = decl.block_name().to_string();

        let version = decl.semantic_version().map_err(|source| RuntimeError::Interface {
            block: name.clone(),
            source,
        })?;
        let interface = build_interface(&decl).map_err(|source| RuntimeError::Interface {
            block: format!("{name}@{version}"),
            source,
        })?;

        let registered = Arc::new(RegisteredBlock {
            block_type: BlockType::new(name.clone(), version.to_string()),
            version: version.clone(),
            interface: Arc::new(interface),
            block,
        });

        let mut versions = self.blocks.entry(name.clone()).or_default();
        match versions.binary_search_by(|entry| entry.version.cmp(&version)) {
            Ok(index) => {
                tracing::debug!(block = %name, %version, "replacing registered block version");
                versions[index] = Arc::clone(&registered);
            }
            Err(index) => versions.insert(index, Arc::clone(&registered)),
        }

        tracing::info!(block = %name, %version, "Registered block");
        Ok(registered)
    }

    /// Highest registered version of `name` matching `range`.
    ///
    /// `range` is a semver requirement (`^1.2.0`, `>=1.0.0 <2.0.0`); a bare
    /// version matches exactly and `*` or an empty string matches any.
    pub fn find(&self, name: &str, range: &str) -> Result<Arc<RegisteredBlock>> {
        let requirement = parse_range(range)?;
        self.blocks
            .get(name)
            .and_then(|versions| {
                versions
                    .iter()
                    .rev()
                    .find(|entry| requirement.matches(&entry.version))
                    .cloned()
            })
            .ok_or_else(|| RuntimeError::NoMatchingVersion {
                name: name.to_string(),
                range: range.to_string(),
            })
    }

    pub fn interface(&self, name: &str, range: &str) -> Result<Arc<BlockInterface>> {
        self.find(name, range).map(|entry| Arc::clone(&entry.interface))
    }

    pub fn versions(&self, name: &str) -> Vec<Version> {
        self.blocks
            .get(name)
            .map(|versions| versions.iter().map(|e| e.version.clone()).collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blocks.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered implementations across all names.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.blocks.clear();
    }
}

fn parse_range(range: &str) -> Result<VersionReq> {
    let trimmed = range.trim();
    if trimmed.is_empty() || trimmed == "*" || trimmed == "latest" {
        return Ok(VersionReq::STAR);
    }
    if let Ok(exact) = Version::parse(trimmed) {
        return Ok(VersionReq {
            comparators: vec![semver::Comparator {
                op: semver::Op::Exact,
                major: exact.major,
                minor: Some(exact.minor),
                patch: Some(exact.patch),
                pre: exact.pre,
            }],
        });
    }

    // npm separates comparators with spaces, semver with commas; a bare
    // operator (`>= 1.0.0`) belongs to the version after it
    let mut comparators: Vec<String> = Vec::new();
    let mut operator = String::new();
    for part in trimmed
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
    {
        if part.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            operator.push_str(part);
        } else {
            comparators.push(format!("{}{part}", std::mem::take(&mut operator)));
        }
    }
    if !operator.is_empty() {
        comparators.push(operator);
    }
    let normalized = comparators.join(", ");
    VersionReq::parse(&normalized).map_err(|e| RuntimeError::InvalidRange {
        range: range.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CallArgs;
    use crate::invocation::Invocation;
    use async_trait::async_trait;
    use blockflow_core::{BlockDecl, FieldDecl, TypeDescriptor};
    use serde_json::Value;

    struct Versioned(&'static str);

    #[async_trait]
    impl Block for Versioned {
        fn declaration(&self) -> BlockDecl {
            BlockDecl::new("Echo").version(self.0)
        }

        async fn invoke(
            &self,
            _function: &str,
            _ctx: &mut Invocation<'_>,
            _args: CallArgs,
        ) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
    }

    struct Broken;

    #[async_trait]
    impl Block for Broken {
        fn declaration(&self) -> BlockDecl {
            BlockDecl::new("Broken").field(FieldDecl::generic_setter("schema", "Missing"))
        }

        async fn invoke(
            &self,
            _function: &str,
            _ctx: &mut Invocation<'_>,
            _args: CallArgs,
        ) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }
    }

    fn registry() -> BlockRegistry {
        let registry = BlockRegistry::new();
        for version in ["1.0.0", "1.2.0", "1.10.1", "2.0.0"] {
            registry.register(Versioned(version)).unwrap();
        }
        registry
    }

    #[test]
    fn test_find_highest_matching() {
        let registry = registry();
        assert_eq!(registry.find("Echo", "^1.0.0").unwrap().version().to_string(), "1.10.1");
        assert_eq!(registry.find("Echo", "~1.2").unwrap().version().to_string(), "1.2.0");
        assert_eq!(registry.find("Echo", "*").unwrap().version().to_string(), "2.0.0");
        assert_eq!(
            registry.find("Echo", ">=1.1.0 <1.5.0").unwrap().version().to_string(),
            "1.2.0"
        );
    }

    #[test]
    fn test_operator_separated_from_version() {
        let registry = registry();
        assert_eq!(registry.find("Echo", ">= 1.0.0").unwrap().version().to_string(), "2.0.0");
        assert_eq!(
            registry.find("Echo", ">=1.0.0 <2.0.0").unwrap().version().to_string(),
            "1.10.1"
        );
        assert_eq!(
            registry.find("Echo", ">= 1.1.0, < 1.5.0").unwrap().version().to_string(),
            "1.2.0"
        );
        assert!(matches!(
            registry.find("Echo", "1.0.0 >="),
            Err(RuntimeError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_bare_version_is_exact() {
        let registry = registry();
        assert_eq!(registry.find("Echo", "1.0.0").unwrap().version().to_string(), "1.0.0");
        assert!(matches!(
            registry.find("Echo", "1.0.1"),
            Err(RuntimeError::NoMatchingVersion { .. })
        ));
    }

    #[test]
    fn test_lookup_failures() {
        let registry = registry();
        assert!(matches!(
            registry.find("Echo", "^3.0.0"),
            Err(RuntimeError::NoMatchingVersion { .. })
        ));
        assert!(matches!(
            registry.find("Nope", "*"),
            Err(RuntimeError::NoMatchingVersion { .. })
        ));
        assert!(matches!(
            registry.find("Echo", "not a range"),
            Err(RuntimeError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_interface_is_shared() {
        let registry = registry();
        let first = registry.interface("Echo", "^1").unwrap();
        let second = registry.interface("Echo", "^1").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.port("error").is_some());
    }

    #[test]
    fn test_invalid_declaration_is_refused() {
        let registry = BlockRegistry::new();
        assert!(matches!(
            registry.register(Broken),
            Err(RuntimeError::Interface { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reregister_replaces_and_clear() {
        let registry = registry();
        registry.register(Versioned("1.2.0")).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.names(), vec!["Echo".to_string()]);

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_version_suffix_from_name() {
        struct Suffixed;

        #[async_trait]
        impl Block for Suffixed {
            fn declaration(&self) -> BlockDecl {
                BlockDecl::new("Map_2_1").field(FieldDecl::output("out", TypeDescriptor::Any))
            }

            async fn invoke(
                &self,
                _function: &str,
                _ctx: &mut Invocation<'_>,
                _args: CallArgs,
            ) -> anyhow::Result<Option<Value>> {
                Ok(None)
            }
        }

        let registry = BlockRegistry::new();
        let registered = registry.register(Suffixed).unwrap();
        assert_eq!(registered.block_type().to_string(), "Map@2.1.0");
        assert!(registry.find("Map", "^2").is_ok());
    }
}
