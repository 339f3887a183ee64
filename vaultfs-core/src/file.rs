//! Leaf nodes: immutable, fully materialized secret content.

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::SecretData;
use crate::node::{AccessMode, NodeAttributes, NodeError};

/// What a successful open tells the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenResponse {
    /// Content never changes for the lifetime of the node, so the caller may
    /// keep it cached across opens.
    pub keep_cache: bool,
}

/// A resolved secret.
///
/// The content is fixed at construction and shared by every clone; a new
/// lookup always builds a new `FileNode` from a fresh read.  The buffer is
/// wiped when the last clone is dropped.
#[derive(Clone)]
pub struct FileNode {
    content: Arc<Zeroizing<Vec<u8>>>,
}

impl FileNode {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content: Arc::new(Zeroizing::new(content)),
        }
    }

    /// The placeholder served for mounts whose engine has no handler.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Render `data` as compact JSON with keys in lexicographic order.
    pub fn from_secret(data: &SecretData) -> Result<Self, NodeError> {
        let rendered = serde_json::to_vec(data)?;
        Ok(Self::new(rendered))
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn attributes(&self) -> NodeAttributes {
        NodeAttributes::file(self.len() as u64)
    }

    pub fn open(&self, mode: AccessMode) -> Result<OpenResponse, NodeError> {
        if !mode.is_read_only() {
            return Err(NodeError::PermissionDenied);
        }
        Ok(OpenResponse { keep_cache: true })
    }

    /// Up to `size` bytes starting at `offset`.  Reads past the end return
    /// an empty slice.
    pub fn read(&self, offset: u64, size: u32) -> &[u8] {
        let len = self.content.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size as usize).min(len);
        &self.content[start..end]
    }
}

impl std::fmt::Debug for FileNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNode")
            .field("len", &self.len())
            .field("content", &"[redacted]")
            .finish()
    }
}
