//! Isolation layer: mount namespace snapshots and inherited process state
//!
//! A sandboxed step may move the process into another mount namespace to
//! build a private filesystem view. The snapshot taken beforehand lets every
//! exit path get back to the saved view.
//!
//! # Examples
//!
//! ```ignore
//! use procwarden::isolation::{restore_mount_namespace, save_mount_namespace};
//!
//! save_mount_namespace()?;
//! // ... unshare(CLONE_NEWNS), mount things ...
//! restore_mount_namespace()?;
//! ```

pub mod context;
pub mod namespace;

pub use context::restore_process_context;
pub use namespace::{
    global_snapshot, mount_namespace_inode, mount_namespace_inode_of, restore_mount_namespace,
    save_mount_namespace, MountNamespaceSnapshot,
};
