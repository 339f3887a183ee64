//! Core of the vaultfs virtual filesystem.
//!
//! A Vault server only knows how to *list* the child names under a path and
//! *read* the value stored at a path.  This crate turns that flat API into a
//! read-only directory tree:
//!
//! ```text
//! /                       RootNode        (one entry per mount)
//! ├── secret/             DirectoryNode   (mount root, kv v2)
//! │   ├── app/            DirectoryNode   (listed as "app/")
//! │   │   └── db          FileNode        (JSON of the secret's data)
//! │   └── token           FileNode
//! └── sys                 FileNode        (unsupported engine: empty file)
//! ```
//!
//! Nothing is cached: every enumeration and lookup goes back to the
//! [`SecretStore`], and every resolved leaf is materialized into a fresh,
//! immutable [`FileNode`].

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

pub mod adjust;
pub mod config;
pub mod dir;
pub mod file;
pub mod logged;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod node;
pub mod registry;
pub mod root;

pub use adjust::{PathAdjustor, join_path};
pub use dir::DirectoryNode;
pub use file::{FileNode, OpenResponse};
pub use logged::LoggedStore;
pub use node::{AccessMode, DirEntry, Node, NodeAttributes, NodeError, NodeKind};
pub use registry::EngineRegistry;
pub use root::RootNode;

/// A secret's data as returned by the store: a JSON object.
///
/// `serde_json::Map` is ordered by key, which is what makes rendered file
/// content deterministic.
pub type SecretData = serde_json::Map<String, serde_json::Value>;

/// Path separator used by the remote store; a listed name ending in it is a
/// directory marker.
pub const SEPARATOR: char = '/';

/// Mount description as reported by `sys/mounts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    #[serde(rename = "type")]
    pub engine_type: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub options: HashMap<String, String>,
}

impl MountInfo {
    pub fn new(engine_type: impl Into<String>) -> Self {
        Self {
            engine_type: engine_type.into(),
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A secret-engine mount point.  Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Mount path as the store reports it, including the trailing `/`.
    pub path: String,
    pub engine_type: String,
    pub options: HashMap<String, String>,
}

impl Mount {
    pub fn new(path: impl Into<String>, info: MountInfo) -> Self {
        let mut path = path.into();
        if !path.ends_with(SEPARATOR) {
            path.push(SEPARATOR);
        }
        Self {
            path,
            engine_type: info.engine_type,
            options: info.options,
        }
    }

    /// Mount name without the trailing separator, as shown in the root
    /// directory and used as the first segment of physical paths.
    pub fn name(&self) -> &str {
        self.path.trim_end_matches(SEPARATOR)
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The remote secret store as seen by the node tree.
///
/// Implementations perform no caching and no retries of their own beyond
/// what the transport does; the tree relies on every call reflecting the
/// store's current state.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// All mounts, keyed by mount path including the trailing `/`.
    async fn list_mounts(&self) -> Result<BTreeMap<String, MountInfo>, StoreError>;

    /// Child names under `path`.  Directory markers end with `/`.  A path
    /// with nothing under it yields an empty list, not an error.
    async fn list(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// The data object stored at `path`.
    async fn read(&self, path: &str) -> Result<SecretData, StoreError>;

    /// Store `data` at `path`.  Never called by the node tree.
    async fn write(&self, path: &str, data: SecretData) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_name_strips_separator() {
        let mount = Mount::new("secret/", MountInfo::new("kv"));
        assert_eq!(mount.name(), "secret");
        assert_eq!(mount.path, "secret/");
    }

    #[test]
    fn mount_path_gains_separator() {
        let mount = Mount::new("kvv1", MountInfo::new("kv"));
        assert_eq!(mount.path, "kvv1/");
    }

    #[test]
    fn mount_info_accepts_null_options() {
        let info: MountInfo = serde_json::from_str(r#"{"type":"system","options":null}"#).unwrap();
        assert_eq!(info.engine_type, "system");
        assert!(info.options.is_empty());

        let info: MountInfo =
            serde_json::from_str(r#"{"type":"kv","options":{"version":"2"}}"#).unwrap();
        assert_eq!(info.options.get("version").map(String::as_str), Some("2"));
    }

    #[test]
    fn mount_info_without_options_field() {
        let info: MountInfo = serde_json::from_str(r#"{"type":"identity"}"#).unwrap();
        assert!(info.options.is_empty());
    }
}
