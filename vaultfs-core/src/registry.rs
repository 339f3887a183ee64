//! Engine-type registry: which mounts become browsable directories.

use std::collections::HashMap;
use std::sync::Arc;

use crate::adjust::PathAdjustor;
use crate::dir::DirectoryNode;
use crate::file::FileNode;
use crate::node::Node;
use crate::{Mount, SecretStore};

/// Picks the path strategy for a mount of a registered engine type.
pub type MountHandler = fn(&Mount) -> PathAdjustor;

/// Maps engine types (`Mount::engine_type`) to handlers.
///
/// New engine types are supported by registering a handler; the directory
/// algorithm itself never changes.
#[derive(Debug, Clone)]
pub struct EngineRegistry {
    handlers: HashMap<String, MountHandler>,
}

impl EngineRegistry {
    /// A registry with no engine types at all.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, engine_type: impl Into<String>, handler: MountHandler) {
        self.handlers.insert(engine_type.into(), handler);
    }

    pub fn is_supported(&self, engine_type: &str) -> bool {
        self.handlers.contains_key(engine_type)
    }

    /// Build the node for a mount's root.
    ///
    /// Mounts of unregistered engine types become an empty file rather than
    /// an error, so they stay visible but inert.
    pub fn mount_node(&self, store: &Arc<dyn SecretStore>, mount: &Arc<Mount>) -> Node {
        match self.handlers.get(&mount.engine_type) {
            Some(handler) => {
                let adjustor = handler(mount);
                Node::Directory(DirectoryNode::mount_root(
                    Arc::clone(store),
                    Arc::clone(mount),
                    adjustor,
                ))
            }
            None => {
                tracing::debug!(
                    mount = %mount.path,
                    engine = %mount.engine_type,
                    "no handler for engine type; serving placeholder"
                );
                Node::File(FileNode::empty())
            }
        }
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("kv", kv_handler);
        registry
    }
}

fn kv_handler(mount: &Mount) -> PathAdjustor {
    PathAdjustor::for_kv_version(mount.option("version"))
}
