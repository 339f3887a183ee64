//! The node contract shared by every kind of node in the tree.

use crate::dir::DirectoryNode;
use crate::file::FileNode;
use crate::root::RootNode;
use crate::{SEPARATOR, StoreError};

/// Permission bits of every directory.
pub const DIR_PERM: u16 = 0o555;
/// Permission bits of every file.
pub const FILE_PERM: u16 = 0o444;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
}

/// Attributes reported for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttributes {
    pub kind: NodeKind,
    pub perm: u16,
    pub size: u64,
}

impl NodeAttributes {
    pub fn directory() -> Self {
        Self {
            kind: NodeKind::Directory,
            perm: DIR_PERM,
            size: 0,
        }
    }

    pub fn file(size: u64) -> Self {
        Self {
            kind: NodeKind::File,
            perm: FILE_PERM,
            size,
        }
    }
}

/// One child reported by a directory enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name as listed by the store.  Directory entries below a mount keep
    /// their trailing `/`.
    pub name: String,
    pub kind: NodeKind,
}

impl DirEntry {
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Directory,
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File,
        }
    }

    /// Name as it should appear to a filesystem consumer, without any
    /// directory marker.
    pub fn display_name(&self) -> &str {
        self.name.trim_end_matches(SEPARATOR)
    }
}

/// Access mode requested by an open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    /// Decode the `O_ACCMODE` bits of POSIX open flags.
    pub fn from_open_flags(flags: i32) -> Self {
        const O_ACCMODE: i32 = 0o3;
        match flags & O_ACCMODE {
            0 => Self::ReadOnly,
            1 => Self::WriteOnly,
            _ => Self::ReadWrite,
        }
    }

    pub fn is_read_only(self) -> bool {
        self == Self::ReadOnly
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NodeError {
    #[error("no such entry: {0}")]
    NotFound(String),
    #[error("permission denied")]
    PermissionDenied,
    #[error("upstream failure: {0}")]
    Upstream(StoreError),
    #[error("cannot render secret: {0}")]
    Encoding(String),
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => Self::NotFound(path),
            other => Self::Upstream(other),
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}

/// Any node of the tree.  Cloning is cheap: nodes only hold shared
/// references and immutable buffers.
#[derive(Debug, Clone)]
pub enum Node {
    Root(RootNode),
    Directory(DirectoryNode),
    File(FileNode),
}

impl Node {
    pub fn attributes(&self) -> NodeAttributes {
        match self {
            Self::Root(_) | Self::Directory(_) => NodeAttributes::directory(),
            Self::File(file) => file.attributes(),
        }
    }

    pub fn is_dir(&self) -> bool {
        !matches!(self, Self::File(_))
    }

    pub async fn enumerate(&self) -> Result<Vec<DirEntry>, NodeError> {
        match self {
            Self::Root(root) => Ok(root.enumerate()),
            Self::Directory(dir) => dir.enumerate().await,
            Self::File(_) => Err(NodeError::NotFound("not a directory".into())),
        }
    }

    pub async fn resolve(&self, name: &str) -> Result<Node, NodeError> {
        match self {
            Self::Root(root) => root.resolve(name),
            Self::Directory(dir) => dir.resolve(name).await,
            Self::File(_) => Err(NodeError::NotFound(name.to_string())),
        }
    }

    /// Child node that can be built from an enumeration entry alone, without
    /// asking the store.  Files always need a lookup.
    pub fn child_from_entry(&self, entry: &DirEntry) -> Option<Node> {
        match (self, entry.kind) {
            (Self::Root(root), _) => root.resolve(entry.display_name()).ok(),
            (Self::Directory(dir), NodeKind::Directory) => {
                Some(Node::Directory(dir.child_directory(entry.display_name())))
            }
            _ => None,
        }
    }
}

impl From<FileNode> for Node {
    fn from(file: FileNode) -> Self {
        Self::File(file)
    }
}

impl From<DirectoryNode> for Node {
    fn from(dir: DirectoryNode) -> Self {
        Self::Directory(dir)
    }
}
