//! FUSE front end for the vaultfs node tree.
//!
//! ```text
//! <mountpoint>/
//! ├── cubbyhole                 (engine without a handler: empty file)
//! ├── secret/                   (kv v2 mount)
//! │   ├── app/
//! │   │   └── db                {"password":"...","user":"app"}
//! │   └── token                 {"value":"..."}
//! └── kvv1/                     (kv v1 mount)
//! ```
//!
//! The filesystem is **read-only** and uncached: attribute and entry TTLs
//! are zero, so every path walk reaches the remote store.
//!
//! Call [`mount`] from inside a multi-threaded tokio runtime.  The returned
//! [`MountHandle`] keeps the filesystem alive; drop it to unmount.

pub mod fs;
mod inode;

pub use fs::{MountHandle, MountOptions, VaultFuse, mount};
