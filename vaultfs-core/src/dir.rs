//! Directories inside a mount.
//!
//! The store cannot stat a single path.  A lookup therefore lists the
//! parent, decides between directory and leaf from the listing, and only
//! then reads the leaf: one list request, optionally followed by one read.

use std::sync::Arc;

use tracing::debug;

use crate::adjust::{PathAdjustor, join_path};
use crate::file::FileNode;
use crate::node::{DirEntry, Node, NodeError};
use crate::{Mount, SEPARATOR, SecretStore};

/// A logical directory: the mount root (empty `relative_path`) or any
/// prefix below it.
///
/// Holds no children.  Every enumeration and lookup is answered from a
/// fresh listing.
#[derive(Clone)]
pub struct DirectoryNode {
    store: Arc<dyn SecretStore>,
    mount: Arc<Mount>,
    adjustor: PathAdjustor,
    relative_path: String,
}

impl DirectoryNode {
    pub fn mount_root(store: Arc<dyn SecretStore>, mount: Arc<Mount>, adjustor: PathAdjustor) -> Self {
        Self {
            store,
            mount,
            adjustor,
            relative_path: String::new(),
        }
    }

    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    pub fn adjustor(&self) -> PathAdjustor {
        self.adjustor
    }

    /// Logical path below the mount; empty for the mount root.
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn is_mount_root(&self) -> bool {
        self.relative_path.is_empty()
    }

    /// The subdirectory `name`, sharing this directory's mount context.
    pub fn child_directory(&self, name: &str) -> Self {
        Self {
            store: Arc::clone(&self.store),
            mount: Arc::clone(&self.mount),
            adjustor: self.adjustor,
            relative_path: join_path(&[&self.relative_path, name]),
        }
    }

    fn physical_list_path(&self) -> String {
        join_path(&[
            self.mount.name(),
            &self.adjustor.list_path(&self.relative_path),
        ])
    }

    fn physical_read_path(&self, name: &str) -> String {
        let logical = join_path(&[&self.relative_path, name]);
        join_path(&[self.mount.name(), &self.adjustor.read_path(&logical)])
    }

    /// Names listed by the store.  Directory markers keep their trailing `/`.
    pub async fn enumerate(&self) -> Result<Vec<DirEntry>, NodeError> {
        let path = self.physical_list_path();
        let names = self.store.list(&path).await?;
        debug!(%path, count = names.len(), "listed directory");
        Ok(names
            .into_iter()
            .map(|name| {
                if name.ends_with(SEPARATOR) {
                    DirEntry::directory(name)
                } else {
                    DirEntry::file(name)
                }
            })
            .collect())
    }

    /// Resolve `name` against a fresh listing of this directory.
    ///
    /// If the store lists both `name/` and `name`, the directory wins.
    pub async fn resolve(&self, name: &str) -> Result<Node, NodeError> {
        let siblings = self.enumerate().await?;
        let marker = format!("{name}{SEPARATOR}");

        if siblings.iter().any(|entry| entry.name == marker) {
            return Ok(Node::Directory(self.child_directory(name)));
        }
        if siblings.iter().any(|entry| entry.name == name) {
            return self.materialize(name).await.map(Node::File);
        }
        Err(NodeError::NotFound(join_path(&[
            self.mount.name(),
            &self.relative_path,
            name,
        ])))
    }

    async fn materialize(&self, name: &str) -> Result<FileNode, NodeError> {
        let path = self.physical_read_path(name);
        let raw = self.store.read(&path).await?;
        let payload = self.adjustor.secret_payload(raw)?;
        let file = FileNode::from_secret(&payload)?;
        debug!(%path, len = file.len(), "materialized secret");
        Ok(file)
    }
}

impl std::fmt::Debug for DirectoryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryNode")
            .field("mount", &self.mount.path)
            .field("adjustor", &self.adjustor)
            .field("relative_path", &self.relative_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::{MountInfo, NodeKind, SecretData};
    use serde_json::json;

    fn data(value: serde_json::Value) -> SecretData {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn kv_mount(store: &Arc<MemoryStore>, name: &str, version: &str) -> DirectoryNode {
        let info = MountInfo::new("kv").with_option("version", version);
        store.mount(name, info.clone());
        let mount = Arc::new(Mount::new(name, info));
        let store: Arc<dyn SecretStore> = store.clone();
        DirectoryNode::mount_root(store, mount, PathAdjustor::for_kv_version(Some(version)))
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        let mut names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        names.sort();
        names
    }

    async fn read_file(dir: &DirectoryNode, name: &str) -> Vec<u8> {
        match dir.resolve(name).await.unwrap() {
            Node::File(file) => file.content().to_vec(),
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_kv_v1_mount_lists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv1", "1");
        assert!(dir.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_kv_v2_mount_lists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv2", "2");
        assert!(dir.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn kv_v1_leaf_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv1", "1");
        store.write("kvv1/foo", data(json!({"a": 1}))).await.unwrap();

        let entries = dir.enumerate().await.unwrap();
        assert_eq!(entries, [DirEntry::file("foo")]);
        assert_eq!(read_file(&dir, "foo").await, br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn kv_v2_hides_physical_prefixes_and_envelope() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv2", "2");
        store
            .write("kvv2/data/foo", data(json!({"data": {"a": 1}})))
            .await
            .unwrap();

        assert_eq!(names(&dir.enumerate().await.unwrap()), ["foo"]);
        assert_eq!(read_file(&dir, "foo").await, br#"{"a":1}"#);
        assert_eq!(
            store.calls()[1..],
            [
                "List(kvv2/metadata)",
                "List(kvv2/metadata)",
                "Read(kvv2/data/foo)",
            ]
        );
    }

    #[tokio::test]
    async fn nested_directories_resolve() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv2", "2");
        store
            .write("kvv2/data/app/db/password", data(json!({"data": {"pw": "s3cret", "user": "app"}})))
            .await
            .unwrap();
        store
            .write("kvv2/data/top", data(json!({"data": {"k": "v"}})))
            .await
            .unwrap();

        let entries = dir.enumerate().await.unwrap();
        assert_eq!(names(&entries), ["app/", "top"]);
        assert!(entries.contains(&DirEntry::directory("app/")));

        let app = match dir.resolve("app").await.unwrap() {
            Node::Directory(app) => app,
            other => panic!("expected directory, got {other:?}"),
        };
        assert_eq!(app.relative_path(), "app");

        let db = match app.resolve("db").await.unwrap() {
            Node::Directory(db) => db,
            other => panic!("expected directory, got {other:?}"),
        };
        assert_eq!(db.relative_path(), "app/db");
        assert_eq!(names(&db.enumerate().await.unwrap()), ["password"]);
        assert_eq!(
            read_file(&db, "password").await,
            br#"{"pw":"s3cret","user":"app"}"#
        );
        assert!(store.calls().contains(&"List(kvv2/metadata/app/db)".to_string()));
        assert!(store.calls().contains(&"Read(kvv2/data/app/db/password)".to_string()));
    }

    #[tokio::test]
    async fn interior_directory_in_kv_v1() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv1", "1");
        store.write("kvv1/team/x", data(json!({"b": 2, "a": 1}))).await.unwrap();

        let team = dir.child_directory("team");
        let entries = team.enumerate().await.unwrap();
        assert_eq!(entries[0].kind, NodeKind::File);
        assert_eq!(read_file(&team, "x").await, br#"{"a":1,"b":2}"#);
    }

    #[tokio::test]
    async fn missing_child_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv1", "1");
        store.write("kvv1/foo", data(json!({"a": 1}))).await.unwrap();

        assert!(matches!(dir.resolve("bar").await, Err(NodeError::NotFound(_))));
        // Only a listing happened; nothing was read.
        assert!(!store.calls().iter().any(|c| c.starts_with("Read(")));
    }

    #[tokio::test]
    async fn overwrite_is_visible_immediately() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv2", "2");
        store
            .write("kvv2/data/foo", data(json!({"data": {"a": 1}})))
            .await
            .unwrap();
        assert_eq!(read_file(&dir, "foo").await, br#"{"a":1}"#);

        store
            .write("kvv2/data/foo", data(json!({"data": {"a": 2, "b": "x"}})))
            .await
            .unwrap();
        assert_eq!(read_file(&dir, "foo").await, br#"{"a":2,"b":"x"}"#);
    }

    #[tokio::test]
    async fn directory_marker_wins_over_leaf() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv1", "1");
        store.write("kvv1/dup", data(json!({"leaf": true}))).await.unwrap();
        store.write("kvv1/dup/inner", data(json!({"x": 1}))).await.unwrap();

        assert_eq!(names(&dir.enumerate().await.unwrap()), ["dup", "dup/"]);
        assert!(matches!(dir.resolve("dup").await, Ok(Node::Directory(_))));
    }

    #[tokio::test]
    async fn upstream_failure_propagates() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "kvv1", "1");
        store.fail_next("connection refused");
        assert!(matches!(dir.enumerate().await, Err(NodeError::Upstream(_))));
        // The failure is request-scoped.
        assert!(dir.enumerate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_v2_payload_is_encoding_failure() {
        let store = Arc::new(MemoryStore::new());
        let dir = kv_mount(&store, "raw", "1");
        // A v1 write of a non-envelope value, browsed through a v2 adjustor.
        store
            .write("raw/data/foo", data(json!({"data": "not an object"})))
            .await
            .unwrap();
        store
            .write("raw/metadata/foo", data(json!({})))
            .await
            .unwrap();
        let v2 = DirectoryNode::mount_root(
            store.clone(),
            Arc::new(dir.mount().clone()),
            PathAdjustor::KvV2,
        );
        assert!(matches!(v2.resolve("foo").await, Err(NodeError::Encoding(_))));
    }
}
