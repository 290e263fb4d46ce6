//! Shadow inodes and the per-session inode registry
//!
//! A shadow inode mirrors exactly one lower inode and owns one reference
//! to it for its whole lifetime. The registry guarantees at most one
//! shadow inode per lower inode per mount session, which is what makes
//! hard links converge on a single shadow object.

use super::handle::MountContext;
use crate::error::Result;
use crate::lower::{Attrs, InodeId, NodeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::{Arc, Weak};

/// Classification of a shadow inode, fixed at interpose time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeClass {
    Regular,
    Directory,
    Symlink,
    /// Device nodes, fifos and sockets
    Special,
}

impl ModeClass {
    /// Classify by `st_mode` type bits
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => ModeClass::Directory,
            m if m == libc::S_IFLNK as u32 => ModeClass::Symlink,
            m if m == libc::S_IFREG as u32 => ModeClass::Regular,
            _ => ModeClass::Special,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ModeClass::Directory)
    }
}

/// Shadow inode mirroring one lower inode
pub struct ShadowInode {
    /// Inode number, inherited from the lower inode
    ino: u64,
    identity: InodeId,
    node: NodeId,
    mode_class: ModeClass,
    attrs: RwLock<Attrs>,
    ctx: Arc<MountContext>,
}

impl ShadowInode {
    /// Allocate a shadow inode over `node`, taking one lower inode
    /// reference that is held until the shadow inode is dropped.
    pub(crate) fn new(
        ctx: Arc<MountContext>,
        identity: InodeId,
        node: NodeId,
        attrs: Attrs,
    ) -> Arc<Self> {
        ctx.fs().acquire_node(node);
        Arc::new(ShadowInode {
            ino: identity.ino,
            identity,
            node,
            mode_class: ModeClass::from_mode(attrs.mode),
            attrs: RwLock::new(attrs),
            ctx,
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn identity(&self) -> InodeId {
        self.identity
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn mode_class(&self) -> ModeClass {
        self.mode_class
    }

    /// Snapshot of the cached attributes. The lower filesystem stays
    /// authoritative; this copy can be stale between refreshes.
    pub fn attrs(&self) -> Attrs {
        self.attrs.read().clone()
    }

    pub(crate) fn attrs_mut(&self) -> RwLockWriteGuard<'_, Attrs> {
        self.attrs.write()
    }

    pub(crate) fn set_nlink(&self, nlink: u32) {
        self.attrs.write().nlink = nlink;
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.attrs.write().size = size;
    }

    pub(crate) fn set_ctime(&self, ctime: std::time::SystemTime) {
        self.attrs.write().ctime = ctime;
    }
}

impl Drop for ShadowInode {
    fn drop(&mut self) {
        self.ctx.fs().release_node(self.node);
    }
}

/// Cache mapping lower inode identity to the one shadow inode aliasing it.
///
/// Entries are weak: a shadow inode dies when its last holder drops it,
/// and the stale slot is replaced on the next find-or-insert for the same
/// identity.
pub struct InodeRegistry {
    map: DashMap<InodeId, Weak<ShadowInode>>,
}

impl InodeRegistry {
    pub fn new() -> Self {
        InodeRegistry {
            map: DashMap::new(),
        }
    }

    /// Atomic find-or-insert. Concurrent callers for the same identity
    /// serialize on the entry and converge on a single shadow inode; the
    /// candidate is additionally checked against the requested lower node
    /// so a recycled inode number cannot alias a dead object.
    pub fn get_or_insert(
        &self,
        identity: InodeId,
        node: NodeId,
        make: impl FnOnce() -> Result<Arc<ShadowInode>>,
    ) -> Result<Arc<ShadowInode>> {
        match self.map.entry(identity) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade() {
                    if existing.node() == node {
                        return Ok(existing);
                    }
                }
                let made = make()?;
                entry.insert(Arc::downgrade(&made));
                Ok(made)
            }
            Entry::Vacant(entry) => {
                let made = make()?;
                entry.insert(Arc::downgrade(&made));
                Ok(made)
            }
        }
    }

    /// Drop dead weak slots
    pub fn prune(&self) {
        self.map.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of live shadow inodes
    pub fn len(&self) -> usize {
        self.map
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::{LowerFs, MemFs};
    use std::ffi::OsStr;

    #[test]
    fn test_mode_class() {
        assert_eq!(
            ModeClass::from_mode(libc::S_IFREG as u32 | 0o644),
            ModeClass::Regular
        );
        assert_eq!(
            ModeClass::from_mode(libc::S_IFDIR as u32 | 0o755),
            ModeClass::Directory
        );
        assert_eq!(
            ModeClass::from_mode(libc::S_IFLNK as u32 | 0o777),
            ModeClass::Symlink
        );
        assert_eq!(
            ModeClass::from_mode(libc::S_IFIFO as u32 | 0o600),
            ModeClass::Special
        );
    }

    #[test]
    fn test_registry_converges_under_races() {
        let fs = Arc::new(MemFs::new());
        let ctx = Arc::new(MountContext::new(fs.clone()));
        let registry = Arc::new(InodeRegistry::new());

        let root = fs.root().unwrap();
        let loc = fs.placeholder(root, OsStr::new("shared")).unwrap();
        fs.create(loc, 0o644).unwrap();
        let identity = fs.inode_identity(loc).unwrap();
        let node = fs.node_of(loc).unwrap();
        let attrs = fs.node_metadata(node).unwrap();

        let mut threads = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let ctx = ctx.clone();
            let attrs = attrs.clone();
            threads.push(std::thread::spawn(move || {
                registry
                    .get_or_insert(identity, node, || {
                        Ok(ShadowInode::new(ctx.clone(), identity, node, attrs.clone()))
                    })
                    .unwrap()
            }));
        }
        let inodes: Vec<Arc<ShadowInode>> =
            threads.into_iter().map(|t| t.join().unwrap()).collect();
        for inode in &inodes[1..] {
            assert!(Arc::ptr_eq(&inodes[0], inode));
        }
        assert_eq!(registry.len(), 1);

        // exactly one lower inode reference regardless of caller count
        assert_eq!(fs.outstanding_node_refs(), 1);
        drop(inodes);
        assert_eq!(fs.outstanding_node_refs(), 0);

        fs.release(loc);
        fs.release(root);
    }

    #[test]
    fn test_registry_prune() {
        let fs = Arc::new(MemFs::new());
        let ctx = Arc::new(MountContext::new(fs.clone()));
        let registry = InodeRegistry::new();

        let root = fs.root().unwrap();
        let identity = fs.inode_identity(root).unwrap();
        let node = fs.node_of(root).unwrap();
        let attrs = fs.node_metadata(node).unwrap();

        let inode = registry
            .get_or_insert(identity, node, || {
                Ok(ShadowInode::new(ctx.clone(), identity, node, attrs.clone()))
            })
            .unwrap();
        assert_eq!(registry.len(), 1);
        drop(inode);
        registry.prune();
        assert!(registry.is_empty());

        fs.release(root);
    }
}
