//! The filesystem root: one directory per mount.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::node::{DirEntry, Node, NodeError};
use crate::registry::EngineRegistry;
use crate::{Mount, SEPARATOR, SecretStore, StoreError};

/// Root of the tree.  The mount table is fetched once, when the root is
/// discovered, and kept for the root's lifetime.
#[derive(Clone)]
pub struct RootNode {
    store: Arc<dyn SecretStore>,
    registry: Arc<EngineRegistry>,
    /// Keyed by mount path, trailing `/` included.
    mounts: Arc<BTreeMap<String, Arc<Mount>>>,
}

impl RootNode {
    /// Query the store's mount table and build the root.
    pub async fn discover(
        store: Arc<dyn SecretStore>,
        registry: Arc<EngineRegistry>,
    ) -> Result<Self, StoreError> {
        let mounts: BTreeMap<String, Arc<Mount>> = store
            .list_mounts()
            .await?
            .into_iter()
            .map(|(path, info)| {
                let mount = Mount::new(path, info);
                (mount.path.clone(), Arc::new(mount))
            })
            .collect();
        info!(count = mounts.len(), "discovered mounts");
        for mount in mounts.values() {
            debug!(
                mount = %mount.path,
                engine = %mount.engine_type,
                supported = registry.is_supported(&mount.engine_type),
                "mount"
            );
        }
        Ok(Self {
            store,
            registry,
            mounts: Arc::new(mounts),
        })
    }

    pub fn mounts(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.values().map(|m| m.as_ref())
    }

    /// One directory entry per mount, named without the trailing `/`.
    pub fn enumerate(&self) -> Vec<DirEntry> {
        self.mounts
            .values()
            .map(|mount| DirEntry::directory(mount.name()))
            .collect()
    }

    pub fn resolve(&self, name: &str) -> Result<Node, NodeError> {
        let key = format!("{name}{SEPARATOR}");
        let mount = self
            .mounts
            .get(&key)
            .ok_or_else(|| NodeError::NotFound(format!("no such mount: {name:?}")))?;
        Ok(self.registry.mount_node(&self.store, mount))
    }
}

impl std::fmt::Debug for RootNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootNode")
            .field("mounts", &self.mounts.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
