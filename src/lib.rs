//! stackfs - stackable pass-through filesystem layer
//!
//! This library presents a virtual filesystem tree that mirrors an
//! underlying ("lower") directory tree one-to-one: every shadow object
//! (mount session, inode, directory entry, open file) wraps a lower object
//! and forwards operations to it, refreshing its own cached metadata from
//! the lower layer after each call.

pub mod config;
pub mod error;
pub mod fs;
pub mod lower;

pub use config::MountConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::MountConfig;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{MountSession, ShadowEntry, ShadowInode};
    pub use crate::lower::{LocalFs, LowerFs, MemFs};
}
