//! Shadow filesystem layer
//!
//! Every object here shadows a lower object one-to-one:
//! - [`MountSession`] wraps the lower superblock and owns the root entry
//! - [`ShadowEntry`] wraps one lower name binding through a [`LowerHandle`]
//! - [`ShadowInode`] wraps one lower inode, deduplicated by [`InodeRegistry`]
//! - [`OpenFile`] wraps one open lower file
//!
//! [`ShadowFs`] is the FUSE front-end over a session.

mod attr;
mod dir_ops;
mod entry;
mod file;
mod fuse;
mod handle;
mod inode;
mod lookup;
mod session;

pub use attr::{copy_attr_all, copy_attr_atime, copy_attr_times, copy_inode_size};
pub use entry::{EntryBudget, ShadowEntry};
pub use file::OpenFile;
pub use fuse::ShadowFs;
pub use handle::{EntrySlot, LowerHandle, MountContext};
pub use inode::{InodeRegistry, ModeClass, ShadowInode};
pub use session::MountSession;
