//! FUSE filesystem implementation.
//!
//! Every request is answered from the core node tree.  The node tree is
//! async; fuser calls us on its own session thread, so each request blocks
//! that thread on the tokio runtime handle captured at mount time.  The
//! runtime must therefore be multi-threaded and must not be the thread that
//! fuser runs on.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use fuser::{
    AccessFlags, BackgroundSession, Config, Errno, FileAttr, FileHandle, FileType, Filesystem,
    FopenFlags, Generation, INodeNo, LockOwner, MountOption, OpenFlags, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, Request, SessionACL,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use vaultfs_core::{
    AccessMode, DirEntry, EngineRegistry, Node, NodeAttributes, NodeError, NodeKind, RootNode, SecretStore,
};

use crate::inode::{INO_ROOT, InodeTable};

/// Nothing is cached by the kernel: entries and attributes expire at once.
const TTL: Duration = Duration::ZERO;

#[derive(thiserror::Error, Debug)]
pub(crate) enum FsError {
    #[error(transparent)]
    Node(#[from] NodeError),
    #[error("unknown inode {0}")]
    UnknownInode(u64),
    #[error("inode {0} is not a directory")]
    NotADirectory(u64),
    #[error("inode {0} is not a file")]
    NotAFile(u64),
    #[error("inode table lock poisoned")]
    Poisoned,
}

impl FsError {
    fn errno(&self) -> Errno {
        match self {
            Self::Node(NodeError::PermissionDenied) => Errno::EACCES,
            Self::Node(NodeError::NotFound(_)) => Errno::ENOENT,
            Self::Node(NodeError::Upstream(_) | NodeError::Encoding(_)) | Self::Poisoned => {
                Errno::EIO
            }
            Self::UnknownInode(_) | Self::NotADirectory(_) | Self::NotAFile(_) => Errno::ENOENT,
        }
    }

    fn log(&self, op: &str, ino: u64) {
        match self {
            Self::Node(NodeError::Upstream(e)) => warn!(ino, "fuse {op}: store request failed: {e}"),
            Self::Node(NodeError::Encoding(e)) => warn!(ino, "fuse {op}: {e}"),
            Self::Poisoned => warn!("FUSE inode table lock poisoned"),
            other => debug!(ino, "fuse {op}: {other}"),
        }
    }
}

/// The FUSE filesystem object.
pub struct VaultFuse {
    runtime: Handle,
    inodes: RwLock<InodeTable>,
    mounted_at: SystemTime,
    uid: u32,
    gid: u32,
}

impl VaultFuse {
    pub fn new(runtime: Handle, root: RootNode) -> Self {
        // SAFETY: getuid/getgid cannot fail and touch no memory.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        Self {
            runtime,
            inodes: RwLock::new(InodeTable::new(Node::Root(root))),
            mounted_at: SystemTime::now(),
            uid,
            gid,
        }
    }

    fn table(&self) -> Result<RwLockReadGuard<'_, InodeTable>, FsError> {
        self.inodes.read().map_err(|_| FsError::Poisoned)
    }

    fn table_mut(&self) -> Result<RwLockWriteGuard<'_, InodeTable>, FsError> {
        self.inodes.write().map_err(|_| FsError::Poisoned)
    }

    fn make_attr(&self, ino: u64, attrs: NodeAttributes) -> FileAttr {
        let (kind, nlink) = match attrs.kind {
            NodeKind::Directory => (FileType::Directory, 2),
            NodeKind::File => (FileType::RegularFile, 1),
        };
        FileAttr {
            ino: INodeNo(ino),
            size: attrs.size,
            blocks: attrs.size.div_ceil(512),
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: UNIX_EPOCH,
            kind,
            perm: attrs.perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    /// The node behind `ino`, resolving it through its parent if it was
    /// only ever listed.
    fn node(&self, ino: u64) -> Result<Node, FsError> {
        let (parent, name) = {
            let table = self.table()?;
            let inode = table.get(ino).ok_or(FsError::UnknownInode(ino))?;
            if let Some(node) = &inode.node {
                return Ok(node.clone());
            }
            (inode.parent, inode.name.clone())
        };
        let parent_node = self.node(parent)?;
        let node = self.runtime.block_on(parent_node.resolve(&name))?;
        self.table_mut()?.resolve_pending(ino, node.clone());
        Ok(node)
    }

    pub(crate) fn do_lookup(&self, parent: u64, name: &str) -> Result<FileAttr, FsError> {
        let parent_node = self.node(parent)?;
        if !parent_node.is_dir() {
            return Err(FsError::NotADirectory(parent));
        }
        let child = self.runtime.block_on(parent_node.resolve(name))?;
        let attrs = child.attributes();
        let ino = self.table_mut()?.record_lookup(parent, name, child);
        debug!(parent, name, ino, "fuse lookup");
        Ok(self.make_attr(ino, attrs))
    }

    pub(crate) fn do_getattr(&self, ino: u64) -> Result<FileAttr, FsError> {
        let node = self.node(ino)?;
        Ok(self.make_attr(ino, node.attributes()))
    }

    pub(crate) fn do_open(&self, ino: u64, flags: i32) -> Result<FopenFlags, FsError> {
        match self.node(ino)? {
            Node::File(file) => {
                let opened = file.open(AccessMode::from_open_flags(flags))?;
                Ok(if opened.keep_cache {
                    FopenFlags::FOPEN_KEEP_CACHE
                } else {
                    FopenFlags::empty()
                })
            }
            _ => Err(FsError::NotAFile(ino)),
        }
    }

    pub(crate) fn do_opendir(&self, ino: u64) -> Result<(), FsError> {
        if self.node(ino)?.is_dir() {
            Ok(())
        } else {
            Err(FsError::NotADirectory(ino))
        }
    }

    pub(crate) fn do_read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        match self.node(ino)? {
            Node::File(file) => Ok(file.read(offset, size).to_vec()),
            _ => Err(FsError::NotAFile(ino)),
        }
    }

    /// `.`, `..` and one entry per child, in listing order.
    pub(crate) fn do_readdir(&self, ino: u64) -> Result<Vec<(u64, FileType, String)>, FsError> {
        let node = self.node(ino)?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(ino));
        }
        let children = self.runtime.block_on(node.enumerate())?;

        let mut table = self.table_mut()?;
        let parent = table.get(ino).map_or(INO_ROOT, |inode| inode.parent);
        let mut entries = Vec::with_capacity(children.len() + 2);
        entries.push((ino, FileType::Directory, ".".to_string()));
        entries.push((parent, FileType::Directory, "..".to_string()));
        for entry in &children {
            let name = entry.display_name();
            let child_ino = table.listed(ino, name, node.child_from_entry(entry));
            let kind = match entry.kind {
                NodeKind::Directory => FileType::Directory,
                NodeKind::File => FileType::RegularFile,
            };
            entries.push((child_ino, kind, name.to_string()));
        }
        let listed: HashSet<&str> = children.iter().map(DirEntry::display_name).collect();
        table.retain_listed(ino, &listed);
        Ok(entries)
    }

    pub(crate) fn do_forget(&self, ino: u64, nlookup: u64) -> Result<(), FsError> {
        self.table_mut()?.forget(ino, nlookup);
        Ok(())
    }

    fn inode_count(&self) -> Result<u64, FsError> {
        Ok(self.table()?.len() as u64)
    }
}

impl Filesystem for VaultFuse {
    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(Errno::ENOENT);
            return;
        };
        match self.do_lookup(parent.0, name) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => {
                e.log("lookup", parent.0);
                reply.error(e.errno());
            }
        }
    }

    fn forget(&self, _req: &Request, ino: INodeNo, nlookup: u64) {
        if let Err(e) = self.do_forget(ino.0, nlookup) {
            e.log("forget", ino.0);
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        match self.do_getattr(ino.0) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => {
                e.log("getattr", ino.0);
                reply.error(e.errno());
            }
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, _mask: AccessFlags, reply: ReplyEmpty) {
        // The mount is ro with default_permissions; the kernel checks modes.
        match self.table() {
            Ok(table) if table.get(ino.0).is_some() => reply.ok(),
            Ok(_) => reply.error(Errno::ENOENT),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        match self.do_open(ino.0, flags.0) {
            Ok(fopen) => reply.opened(FileHandle(0), fopen),
            Err(e) => {
                e.log("open", ino.0);
                reply.error(e.errno());
            }
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        match self.do_opendir(ino.0) {
            Ok(()) => reply.opened(FileHandle(0), FopenFlags::empty()),
            Err(e) => {
                e.log("opendir", ino.0);
                reply.error(e.errno());
            }
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        match self.do_read(ino.0, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                e.log("read", ino.0);
                reply.error(e.errno());
            }
        }
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.do_readdir(ino.0) {
            Ok(entries) => entries,
            Err(e) => {
                e.log("readdir", ino.0);
                reply.error(e.errno());
                return;
            }
        };
        for (i, (child_ino, kind, name)) in entries.iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            if reply.add(INodeNo(*child_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let files = match self.inode_count() {
            Ok(n) => n,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        // Virtual and read-only: no blocks, no free inodes.
        reply.statfs(0, 0, 0, files, 0, 4096, 255, 0);
    }
}

/// Mount-time settings.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub fsname: String,
    pub allow_other: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fsname: "vaultfs".to_string(),
            allow_other: false,
        }
    }
}

/// A handle to a mounted filesystem.
///
/// Dropping it unmounts: the `BackgroundSession` drop performs the kernel
/// unmount, and `fusermount3 -u` runs afterwards in case the kernel mount
/// outlived the session.
pub struct MountHandle {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
}

impl MountHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mountpoint", &self.mountpoint)
            .finish_non_exhaustive()
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        drop(self.session.take());
        let _ = std::process::Command::new("fusermount3")
            .args(["-u", self.mountpoint.to_string_lossy().as_ref()])
            .output();
        info!(mountpoint = %self.mountpoint.display(), "unmounted");
    }
}

/// Discover the store's mounts and mount the tree at `mountpoint`.
///
/// Must be called from within a multi-threaded tokio runtime; the runtime's
/// handle serves every later filesystem request.  Failing to list the
/// store's mounts fails the mount.
pub async fn mount(
    mountpoint: &Path,
    store: Arc<dyn SecretStore>,
    registry: Arc<EngineRegistry>,
    options: &MountOptions,
) -> anyhow::Result<MountHandle> {
    // Lazily unmount whatever a crashed previous instance left behind; this
    // fails harmlessly when nothing is mounted.
    let _ = std::process::Command::new("fusermount3")
        .args(["-uz", mountpoint.to_string_lossy().as_ref()])
        .output();

    std::fs::create_dir_all(mountpoint)
        .with_context(|| format!("create FUSE mountpoint {:?}", mountpoint))?;

    let root = RootNode::discover(store, registry)
        .await
        .context("list secret engine mounts")?;
    let fuse = VaultFuse::new(Handle::current(), root);

    let mut config = Config::default();
    config.mount_options = vec![
        MountOption::RO,
        MountOption::DefaultPermissions,
        MountOption::FSName(options.fsname.clone()),
        MountOption::Subtype("vaultfs".to_string()),
    ];
    config.acl = if options.allow_other {
        SessionACL::All
    } else {
        SessionACL::Owner
    };

    let session = fuser::spawn_mount2(fuse, mountpoint, &config)
        .with_context(|| format!("mount FUSE at {:?}", mountpoint))?;
    info!(mountpoint = %mountpoint.display(), "mounted");

    Ok(MountHandle {
        session: Some(session),
        mountpoint: mountpoint.to_path_buf(),
    })
}
