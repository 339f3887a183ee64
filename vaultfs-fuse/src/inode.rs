//! Inode bookkeeping.
//!
//! The kernel addresses nodes by number; the core tree has no numbers at
//! all.  Directories keep one inode per `(parent, name)`.  Files get a new
//! inode every time they are looked up, because each lookup produces a new
//! immutable `FileNode` and the kernel may keep page cache per inode.
//!
//! Rendered secrets live only as long as the kernel references them: a file
//! inode is dropped, and its content zeroized, as soon as its lookup count
//! reaches zero.

use std::collections::{HashMap, HashSet};

use vaultfs_core::Node;

pub(crate) const INO_ROOT: u64 = 1;

#[derive(Debug)]
pub(crate) struct Inode {
    pub parent: u64,
    pub name: String,
    /// `None` until the entry has been resolved (readdir hands out inodes
    /// for files it has not read).  Only ever a file after a kernel lookup.
    pub node: Option<Node>,
    /// Kernel lookup count.
    lookups: u64,
}

#[derive(Debug)]
pub(crate) struct InodeTable {
    entries: HashMap<u64, Inode>,
    by_name: HashMap<(u64, String), u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new(root: Node) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            INO_ROOT,
            Inode {
                parent: INO_ROOT,
                name: String::new(),
                node: Some(root),
                lookups: 1,
            },
        );
        Self {
            entries,
            by_name: HashMap::new(),
            next_ino: INO_ROOT + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, ino: u64) -> Option<&Inode> {
        self.entries.get(&ino)
    }

    pub fn current(&self, parent: u64, name: &str) -> Option<u64> {
        self.by_name.get(&(parent, name.to_string())).copied()
    }

    fn alloc(&mut self, parent: u64, name: &str, node: Option<Node>, lookups: u64) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(
            ino,
            Inode {
                parent,
                name: name.to_string(),
                node,
                lookups,
            },
        );
        if let Some(old) = self.by_name.insert((parent, name.to_string()), ino) {
            self.drop_if_unused(old);
        }
        ino
    }

    fn drop_if_unused(&mut self, ino: u64) {
        let unused = self
            .entries
            .get(&ino)
            .is_some_and(|inode| inode.lookups == 0);
        if unused && ino != INO_ROOT {
            self.entries.remove(&ino);
        }
    }

    /// Remove `ino` and, if it still owns it, its name.
    fn release(&mut self, ino: u64) {
        let Some(inode) = self.entries.remove(&ino) else {
            return;
        };
        let key = (inode.parent, inode.name);
        if self.by_name.get(&key) == Some(&ino) {
            self.by_name.remove(&key);
        }
    }

    /// Record a successful lookup of `name` under `parent` and return the
    /// inode the kernel should use for it.
    pub fn record_lookup(&mut self, parent: u64, name: &str, node: Node) -> u64 {
        if let Some(ino) = self.current(parent, name)
            && let Some(inode) = self.entries.get_mut(&ino)
        {
            // A directory keeps its inode; so does an entry nobody has
            // looked up yet, since the kernel holds no cache for it.
            let reusable = match &inode.node {
                None => true,
                Some(existing) => existing.is_dir() && node.is_dir(),
            };
            if reusable {
                inode.node = Some(node);
                inode.lookups += 1;
                return ino;
            }
        }
        self.alloc(parent, name, Some(node), 1)
    }

    /// Inode to report for a directory listing entry, allocating an
    /// unresolved one if the name has never been seen.
    pub fn listed(&mut self, parent: u64, name: &str, node: Option<Node>) -> u64 {
        if let Some(ino) = self.current(parent, name)
            && let Some(inode) = self.entries.get_mut(&ino)
        {
            if inode.node.is_none() {
                inode.node = node;
            }
            return ino;
        }
        self.alloc(parent, name, node, 0)
    }

    /// Fill in the node of an unresolved inode.  Files are not kept: the
    /// kernel holds no reference to a merely listed entry, so its content
    /// would outlive every user of it.
    pub fn resolve_pending(&mut self, ino: u64, node: Node) {
        if !node.is_dir() {
            return;
        }
        if let Some(inode) = self.entries.get_mut(&ino)
            && inode.node.is_none()
        {
            inode.node = Some(node);
        }
    }

    /// Drop unreferenced children of `parent` that the latest listing no
    /// longer contains.
    pub fn retain_listed(&mut self, parent: u64, names: &HashSet<&str>) {
        let stale: Vec<u64> = self
            .by_name
            .iter()
            .filter(|((p, name), _)| *p == parent && !names.contains(name.as_str()))
            .map(|(_, ino)| *ino)
            .filter(|ino| self.entries.get(ino).is_some_and(|inode| inode.lookups == 0))
            .collect();
        for ino in stale {
            self.release(ino);
        }
    }

    /// The kernel dropped `nlookup` references to `ino`.
    ///
    /// At zero, files and unresolved entries are released.  A directory
    /// holds no secret and keeps its inode while it still owns its name.
    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == INO_ROOT {
            return;
        }
        let Some(inode) = self.entries.get_mut(&ino) else {
            return;
        };
        inode.lookups = inode.lookups.saturating_sub(nlookup);
        if inode.lookups > 0 {
            return;
        }
        let is_dir = inode.node.as_ref().is_some_and(Node::is_dir);
        let current = self.by_name.get(&(inode.parent, inode.name.clone())) == Some(&ino);
        if !is_dir || !current {
            self.release(ino);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use vaultfs_core::memory::MemoryStore;
    use vaultfs_core::{DirectoryNode, FileNode, Mount, MountInfo, PathAdjustor};

    fn file(content: &str) -> Node {
        Node::File(FileNode::new(content.as_bytes().to_vec()))
    }

    fn dir(name: &str) -> Node {
        let mount = Mount::new(format!("{name}/"), MountInfo::new("kv"));
        Node::Directory(DirectoryNode::mount_root(
            Arc::new(MemoryStore::new()),
            Arc::new(mount),
            PathAdjustor::Identity,
        ))
    }

    fn content(table: &InodeTable, ino: u64) -> Vec<u8> {
        match &table.get(ino).unwrap().node {
            Some(Node::File(f)) => f.content().to_vec(),
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn root_is_inode_one() {
        let table = InodeTable::new(file(""));
        assert!(table.get(INO_ROOT).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn each_file_lookup_gets_a_fresh_inode() {
        let mut table = InodeTable::new(file(""));
        let first = table.record_lookup(INO_ROOT, "foo", file("v1"));
        let second = table.record_lookup(INO_ROOT, "foo", file("v2"));
        assert_ne!(first, second);
        assert_eq!(content(&table, first), b"v1");
        assert_eq!(content(&table, second), b"v2");
        assert_eq!(table.current(INO_ROOT, "foo"), Some(second));

        table.forget(first, 1);
        assert!(table.get(first).is_none());
        assert_eq!(table.current(INO_ROOT, "foo"), Some(second));
    }

    #[test]
    fn forgotten_file_releases_its_content() {
        let mut table = InodeTable::new(file(""));
        let ino = table.record_lookup(INO_ROOT, "db", file(r#"{"pw":"hunter2"}"#));
        table.forget(ino, 1);
        assert!(table.get(ino).is_none());
        assert_eq!(table.current(INO_ROOT, "db"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn file_survives_partial_forget() {
        let mut table = InodeTable::new(file(""));
        let ino = table.listed(INO_ROOT, "foo", None);
        assert_eq!(table.record_lookup(INO_ROOT, "foo", file("a")), ino);
        // A second lookup of a resolved file allocates a fresh inode.
        let newer = table.record_lookup(INO_ROOT, "foo", file("b"));
        table.forget(newer, 0);
        assert!(table.get(newer).is_some());
        table.forget(ino, 1);
        assert!(table.get(ino).is_none());
    }

    #[test]
    fn directories_keep_their_inode() {
        let mut table = InodeTable::new(file(""));
        let first = table.record_lookup(INO_ROOT, "app", dir("app"));
        let again = table.record_lookup(INO_ROOT, "app", dir("app"));
        assert_eq!(first, again);
        table.forget(first, 2);
        assert!(table.get(first).is_some());
        assert_eq!(table.record_lookup(INO_ROOT, "app", dir("app")), first);
    }

    #[test]
    fn listed_then_looked_up_reuses_inode() {
        let mut table = InodeTable::new(file(""));
        let listed = table.listed(INO_ROOT, "foo", None);
        assert!(table.get(listed).unwrap().node.is_none());
        let looked_up = table.record_lookup(INO_ROOT, "foo", file("x"));
        assert_eq!(listed, looked_up);
        assert_eq!(content(&table, looked_up), b"x");
        // Listing again does not allocate.
        assert_eq!(table.listed(INO_ROOT, "foo", None), looked_up);
    }

    #[test]
    fn pending_directories_are_filled_once() {
        let mut table = InodeTable::new(file(""));
        let ino = table.listed(INO_ROOT, "app", None);
        table.resolve_pending(ino, dir("first"));
        table.resolve_pending(ino, dir("second"));
        match &table.get(ino).unwrap().node {
            Some(Node::Directory(d)) => assert_eq!(d.mount().name(), "first"),
            other => panic!("expected directory, got {other:?}"),
        }
    }

    #[test]
    fn pending_files_stay_unresolved() {
        let mut table = InodeTable::new(file(""));
        let ino = table.listed(INO_ROOT, "foo", None);
        table.resolve_pending(ino, file("secret"));
        assert!(table.get(ino).unwrap().node.is_none());
    }

    #[test]
    fn entries_missing_from_a_listing_are_evicted() {
        let mut table = InodeTable::new(file(""));
        let gone = table.listed(INO_ROOT, "gone", None);
        let kept = table.listed(INO_ROOT, "kept", None);
        let open = table.record_lookup(INO_ROOT, "open", file("x"));
        table.retain_listed(INO_ROOT, &HashSet::from(["kept"]));
        assert!(table.get(gone).is_none());
        assert!(table.get(kept).is_some());
        // Still referenced by the kernel.
        assert!(table.get(open).is_some());
        assert_eq!(table.current(INO_ROOT, "gone"), None);
    }

    #[test]
    fn forgetting_root_is_ignored() {
        let mut table = InodeTable::new(file(""));
        table.forget(INO_ROOT, 100);
        assert!(table.get(INO_ROOT).is_some());
    }
}
