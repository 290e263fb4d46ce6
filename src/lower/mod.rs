//! Lower filesystem capability interface
//!
//! The shadow layer never touches storage itself; it talks to the
//! filesystem it stacks on through [`LowerFs`]. A [`Location`] is the
//! lower analogue of a directory entry: one (directory, name) binding,
//! reference counted by the issuing filesystem, possibly negative (the
//! name does not currently exist). Node-level references pin a lower
//! inode independently of any location.
//!
//! Two implementations ship with the crate: [`LocalFs`] stacks on a real
//! directory tree, [`MemFs`] is an in-memory tree with reference-count
//! bookkeeping used heavily by the test suite.

mod local;
mod memory;

pub use local::LocalFs;
pub use memory::MemFs;

use crate::error::Result;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;
use std::ffi::{OsStr, OsString};
use std::time::SystemTime;

/// Identifier of a lower inode within one lower filesystem instance
pub type NodeId = u64;

/// Identifier of an open lower file
pub type FileId = u64;

/// Identity of a lower inode: the filesystem instance it belongs to plus
/// its inode number there. Two locations alias the same object iff their
/// identities are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeId {
    pub fsid: u64,
    pub ino: u64,
}

/// Opaque ticket naming one (directory, name) binding in the lower tree.
///
/// Whoever ends up owning a location must balance it with exactly one
/// [`LowerFs::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location(pub(crate) u64);

/// Metadata snapshot of a lower inode
#[derive(Debug, Clone)]
pub struct Attrs {
    /// File type and permission bits, `st_mode` layout
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Attribute changes forwarded by `setattr`. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct SetAttrs {
    /// Permission bits only; the file type cannot change
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Open mode for a lower file
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
}

impl OpenFlags {
    /// Decode the POSIX open(2) flag word
    pub fn from_libc(flags: i32) -> Self {
        let accmode = flags & libc::O_ACCMODE;
        OpenFlags {
            write: accmode == libc::O_WRONLY || accmode == libc::O_RDWR,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
        }
    }
}

/// One directory entry returned by `readdir`
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    /// `st_mode` of the entry (type bits included)
    pub mode: u32,
}

/// Owned guard for a lower node's mutation lock
pub struct NodeGuard {
    _guard: ArcMutexGuard<RawMutex, ()>,
}

impl NodeGuard {
    pub(crate) fn new(guard: ArcMutexGuard<RawMutex, ()>) -> Self {
        NodeGuard { _guard: guard }
    }
}

/// Guard spanning the two parent directories of a rename.
///
/// `trap` is the node sitting on the path between the two directories when
/// one is an ancestor of the other: the child of the shallower directory
/// through which the deeper one is reached. Callers compare it against the
/// rename endpoints to reject cycles before mutating.
pub struct RenameGuard {
    pub trap: Option<NodeId>,
    _first: NodeGuard,
    _second: Option<NodeGuard>,
}

impl RenameGuard {
    pub(crate) fn new(trap: Option<NodeId>, first: NodeGuard, second: Option<NodeGuard>) -> Self {
        RenameGuard {
            trap,
            _first: first,
            _second: second,
        }
    }
}

/// Capability interface to the filesystem this layer stacks on.
///
/// Locations returned by `root`, `resolve`, `placeholder` and `parent_of`
/// arrive with one reference owned by the caller. Mutating verbs that
/// target a name (`create`, `mkdir`, `mknod`, `symlink`, `link`, `unlink`,
/// `rmdir`, `rename`) take the location of that name binding; callers hold
/// the parent directory's `lock_node` guard across the call.
pub trait LowerFs: Send + Sync + 'static {
    /// Stable identity of this filesystem instance
    fn fsid(&self) -> u64;

    /// Largest file size this filesystem supports
    fn max_file_size(&self) -> u64;

    /// Superblock active-reference count, held once per mount session
    fn sb_acquire(&self);
    fn sb_release(&self);

    /// Location of the root directory
    fn root(&self) -> Result<Location>;

    fn acquire(&self, loc: Location);
    fn release(&self, loc: Location);

    /// Inode-level references, independent of location pins
    fn acquire_node(&self, node: NodeId);
    fn release_node(&self, node: NodeId);

    /// Resolve `name` under `dir`. `Err(NotFound)` when the name does not
    /// exist; any other error is a real failure.
    fn resolve(&self, dir: Location, name: &OsStr) -> Result<Location>;

    /// Negative location for `name` under `dir`, ready for a create-type
    /// operation. An existing cached location for the same binding is
    /// reused before a new one is allocated.
    fn placeholder(&self, dir: Location, name: &OsStr) -> Result<Location>;

    /// Location of the directory holding `loc`. The root is its own parent.
    fn parent_of(&self, loc: Location) -> Result<Location>;

    /// Node currently bound at `loc`, `None` for a negative location
    fn node_of(&self, loc: Location) -> Option<NodeId>;

    fn inode_identity(&self, loc: Location) -> Result<InodeId>;
    fn metadata(&self, loc: Location) -> Result<Attrs>;
    fn node_metadata(&self, node: NodeId) -> Result<Attrs>;

    /// Mutation lock for the node at `loc`. Directory mutations hold the
    /// parent directory's lock; `setattr` holds the target node's own.
    fn lock_node(&self, loc: Location) -> Result<NodeGuard>;

    /// Lock both parent directories of a rename in a canonical order and
    /// report the ancestry trap (see [`RenameGuard`]).
    fn lock_rename(&self, a: Location, b: Location) -> Result<RenameGuard>;

    /// Create a regular file at the negative location `at`.
    /// `mode` carries permission bits only.
    fn create(&self, at: Location, mode: u32) -> Result<()>;
    fn mkdir(&self, at: Location, mode: u32) -> Result<()>;
    /// `mode` carries type and permission bits; a missing type defaults to
    /// a regular file.
    fn mknod(&self, at: Location, mode: u32, rdev: u32) -> Result<()>;
    fn symlink(&self, at: Location, target: &OsStr) -> Result<()>;
    /// Add a new name (`at`, negative) for the object at `existing`.
    fn link(&self, existing: Location, at: Location) -> Result<()>;
    fn unlink(&self, at: Location) -> Result<()>;
    fn rmdir(&self, at: Location) -> Result<()>;
    /// Move the binding at `old` to the binding named by `new`.
    fn rename(&self, old: Location, new: Location) -> Result<()>;
    fn readlink(&self, loc: Location) -> Result<OsString>;
    fn setattr(&self, loc: Location, changes: &SetAttrs) -> Result<()>;

    /// Whether the entry at `loc` was silly-renamed by the lower layer
    /// instead of being removed (NFS-style deferred deletion). A `Busy`
    /// from `unlink` together with this flag means deletion has already
    /// begun and the caller may treat the unlink as successful.
    fn is_silly_renamed(&self, loc: Location) -> bool;

    /// Open the object at `loc`. The returned file owns one node
    /// reference, dropped by `release_file`.
    fn open(&self, loc: Location, flags: OpenFlags) -> Result<FileId>;
    fn release_file(&self, file: FileId);
    fn read(&self, file: FileId, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<usize>;
    fn fsync(&self, file: FileId, datasync: bool) -> Result<()>;
    fn readdir(&self, file: FileId) -> Result<Vec<DirEntry>>;
}
