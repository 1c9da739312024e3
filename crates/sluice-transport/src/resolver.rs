//! Logical node name to transfer host resolution.
//!
//! Switch plans name participants by their logical pipeline node; the
//! resolver turns those names into hosts the transfer sender can dial.
//! [`StaticResolver`] is a fixed table for single-process and test
//! deployments; an embedding engine can put service discovery behind
//! the same trait.

use std::collections::HashMap;

use parking_lot::RwLock;

use sluice_core::ResolveError;

/// Maps a `(pipeline, node)` pair to a dialable host.
pub trait HostResolver: Send + Sync {
    /// Resolves the host (without the transfer port) for `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownNode`] if the node is not known.
    fn resolve(&self, pipeline: &str, node: &str) -> Result<String, ResolveError>;
}

/// Resolver over a fixed host table.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: RwLock<HashMap<(String, String), String>>,
}

impl StaticResolver {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the host for `node` on `pipeline`.
    pub fn insert(&self, pipeline: &str, node: &str, host: &str) {
        self.hosts.write().insert(
            (pipeline.to_string(), node.to_string()),
            host.to_string(),
        );
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, pipeline: &str, node: &str) -> Result<String, ResolveError> {
        self.hosts
            .read()
            .get(&(pipeline.to_string(), node.to_string()))
            .cloned()
            .ok_or_else(|| ResolveError::UnknownNode {
                pipeline: pipeline.to_string(),
                node: node.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_registered_host() {
        let resolver = StaticResolver::new();
        resolver.insert("pipe", "op-b", "10.0.0.7");
        assert_eq!(resolver.resolve("pipe", "op-b").unwrap(), "10.0.0.7");
    }

    #[test]
    fn test_unknown_node_is_an_error() {
        let resolver = StaticResolver::new();
        let err = resolver.resolve("pipe", "ghost").unwrap_err();
        assert!(matches!(err, ResolveError::UnknownNode { .. }));
    }

    #[test]
    fn test_insert_replaces_host() {
        let resolver = StaticResolver::new();
        resolver.insert("pipe", "op-b", "10.0.0.7");
        resolver.insert("pipe", "op-b", "10.0.0.8");
        assert_eq!(resolver.resolve("pipe", "op-b").unwrap(), "10.0.0.8");
    }
}
