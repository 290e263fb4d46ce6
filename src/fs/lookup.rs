//! Lookup and interposition
//!
//! The resolver consults the lower tree for a name and instantiates a
//! positive or negative shadow entry; the interposer binds a shadow inode
//! mirroring the resolved lower object. A name the lower tree does not
//! know is a valid negative result, not an error: the negative entry
//! carries a placeholder lower location so a later create-type operation
//! has somewhere to create into.

use super::attr;
use super::entry::ShadowEntry;
use super::handle::{LowerHandle, MountContext};
use super::inode::{InodeRegistry, ShadowInode};
use super::session::MountSession;
use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::sync::Arc;
use tracing::debug;

/// Bind `entry` to a shadow inode mirroring the lower object at `lower`.
///
/// Rejects the bind with `CrossMount` when the lower object belongs to a
/// different lower filesystem instance than the session mounted on. On a
/// registry hit the existing shadow inode is reused and no additional
/// lower inode reference is taken; on a miss a new shadow inode acquires
/// exactly one.
pub(crate) fn interpose_with(
    ctx: &Arc<MountContext>,
    registry: &InodeRegistry,
    entry: &Arc<ShadowEntry>,
    lower: &LowerHandle,
) -> Result<()> {
    let fs = ctx.fs();
    let identity = fs.inode_identity(lower.location())?;
    if identity.fsid != ctx.lower_fsid() {
        return Err(Error::CrossMount);
    }
    let node = fs.node_of(lower.location()).ok_or(Error::Stale)?;
    let inode = registry.get_or_insert(identity, node, || {
        let attrs = fs.node_metadata(node)?;
        Ok(ShadowInode::new(ctx.clone(), identity, node, attrs))
    })?;
    entry.instantiate(inode);
    Ok(())
}

impl MountSession {
    pub(crate) fn interpose(
        &self,
        entry: &Arc<ShadowEntry>,
        lower: &LowerHandle,
    ) -> Result<()> {
        interpose_with(self.ctx(), self.registry(), entry, lower)
    }

    /// Resolve `name` under `parent`.
    ///
    /// Returns the cached entry when one exists; otherwise consults the
    /// lower tree and caches a positive entry (interposed over the
    /// resolved lower object) or a negative one (carrying a placeholder
    /// location). Callers distinguish the two with
    /// [`ShadowEntry::is_negative`].
    pub fn lookup(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
    ) -> Result<Arc<ShadowEntry>> {
        let parent_inode = parent.inode().ok_or(Error::Stale)?;
        if !parent_inode.mode_class().is_dir() {
            return Err(Error::NotADirectory);
        }
        if let Some(hit) = parent.cached_child(name) {
            return Ok(hit);
        }
        debug!(name = ?name, "lookup");

        // scoped acquisition: released on every path out of this function
        let parent_lower = parent.slot().get().ok_or(Error::Stale)?;

        let entry = ShadowEntry::new(self.budget(), Some(parent), name)?;
        let fs = self.ctx().fs();
        match fs.resolve(parent_lower.location(), name) {
            Ok(loc) => {
                let handle = LowerHandle::adopt(self.ctx().clone(), loc);
                entry.slot().set(handle.clone());
                if let Err(err) = self.interpose(&entry, &handle) {
                    // release the just-attached handle before propagating
                    drop(entry.slot().reset());
                    return Err(err);
                }
            }
            Err(err) if err.is_not_found() => {
                let loc = fs.placeholder(parent_lower.location(), name)?;
                entry.slot().set(LowerHandle::adopt(self.ctx().clone(), loc));
            }
            Err(err) => return Err(err),
        }

        if let Some(inode) = entry.inode() {
            if let Ok(meta) = fs.node_metadata(inode.node()) {
                attr::copy_attr_times(&inode, &meta);
            }
        }
        // looking up a child touches the parent's atime
        if let Ok(meta) = fs.metadata(parent_lower.location()) {
            attr::copy_attr_atime(&parent_inode, &meta);
        }

        Ok(parent.cache_child(entry))
    }

    /// Walk a `/`-separated relative path from the root, resolving each
    /// component in turn.
    pub fn lookup_path(&self, path: &str) -> Result<Arc<ShadowEntry>> {
        let mut entry = self.root().clone();
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            entry = self.lookup(&entry, OsStr::new(comp))?;
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::lower::{LowerFs, MemFs};

    fn mounted() -> (Arc<MemFs>, MountSession) {
        let fs = Arc::new(MemFs::new());
        let session = MountSession::mount(fs.clone(), MountConfig::new("/".into())).unwrap();
        (fs, session)
    }

    #[test]
    fn test_negative_lookup_is_not_an_error() {
        let (_fs, session) = mounted();
        let entry = session.lookup(session.root(), OsStr::new("ghost")).unwrap();
        assert!(entry.is_negative());
        // the negative entry still carries a lower location to create into
        assert!(entry.slot().get().is_some());
    }

    #[test]
    fn test_positive_lookup_interposes() {
        let (fs, session) = mounted();
        let root_loc = fs.root().unwrap();
        let loc = fs.placeholder(root_loc, OsStr::new("data")).unwrap();
        fs.create(loc, 0o644).unwrap();
        fs.release(loc);
        fs.release(root_loc);

        let entry = session.lookup(session.root(), OsStr::new("data")).unwrap();
        let inode = entry.inode().unwrap();
        assert_eq!(inode.mode_class(), crate::fs::ModeClass::Regular);
        assert_eq!(inode.identity().fsid, fs.fsid());
    }

    #[test]
    fn test_lookup_returns_cached_entry() {
        let (_fs, session) = mounted();
        let a = session.lookup(session.root(), OsStr::new("x")).unwrap();
        let b = session.lookup(session.root(), OsStr::new("x")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_lookup_under_file_fails() {
        let (fs, session) = mounted();
        let root_loc = fs.root().unwrap();
        let loc = fs.placeholder(root_loc, OsStr::new("plain")).unwrap();
        fs.create(loc, 0o644).unwrap();
        fs.release(loc);
        fs.release(root_loc);

        let plain = session.lookup(session.root(), OsStr::new("plain")).unwrap();
        assert!(matches!(
            session.lookup(&plain, OsStr::new("below")),
            Err(Error::NotADirectory)
        ));
    }

    #[test]
    fn test_interpose_rejects_cross_mount() {
        let (_fs, session) = mounted();
        let other = Arc::new(MemFs::new());
        let other_ctx = Arc::new(MountContext::new(other.clone()));

        // a handle resolved through a different lower instance
        let foreign_loc = other.root().unwrap();
        let foreign = LowerHandle::adopt(other_ctx, foreign_loc);
        let entry = ShadowEntry::new(session.budget(), None, OsStr::new("alien")).unwrap();
        entry.slot().set(foreign.clone());

        assert!(matches!(
            session.interpose(&entry, &foreign),
            Err(Error::CrossMount)
        ));
    }

    #[test]
    fn test_failed_interpose_releases_handle() {
        let (fs, session) = mounted();
        // lookup of a name that vanishes between resolve and interpose is
        // hard to stage; instead check the negative path's balance: every
        // lookup leaves exactly one attached reference per cached entry
        let before = fs.outstanding_location_refs();
        let entry = session.lookup(session.root(), OsStr::new("gone")).unwrap();
        assert!(entry.is_negative());
        assert_eq!(fs.outstanding_location_refs(), before + 1);

        session.root().drop_child(OsStr::new("gone"));
        drop(entry);
        assert_eq!(fs.outstanding_location_refs(), before);
    }

    #[test]
    fn test_hard_links_share_one_shadow_inode() {
        let (fs, session) = mounted();
        let root_loc = fs.root().unwrap();
        let a = fs.placeholder(root_loc, OsStr::new("a")).unwrap();
        fs.create(a, 0o644).unwrap();
        let b = fs.placeholder(root_loc, OsStr::new("b")).unwrap();
        fs.link(a, b).unwrap();
        fs.release(a);
        fs.release(b);
        fs.release(root_loc);

        let ea = session.lookup(session.root(), OsStr::new("a")).unwrap();
        let eb = session.lookup(session.root(), OsStr::new("b")).unwrap();
        assert!(Arc::ptr_eq(&ea.inode().unwrap(), &eb.inode().unwrap()));
        // the registry holds the canonical reference; one lower inode ref
        assert_eq!(fs.outstanding_node_refs(), 2); // root dir inode + the file
    }
}
