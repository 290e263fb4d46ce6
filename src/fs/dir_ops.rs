//! Directory operations
//!
//! Single-parent mutations share one shape: fetch the target entry's
//! lower handle, lock the lower parent directory, mutate the lower tree,
//! re-interpose, refresh the parent's cached metadata. The entry-local
//! slot lock is never held while any of this runs, and every handle and
//! lock is released on every exit path. Rename spans two directories and
//! goes through the lower layer's pair-lock primitive.

use super::attr;
use super::entry::ShadowEntry;
use super::handle::LowerHandle;
use super::inode::ModeClass;
use super::session::MountSession;
use crate::error::{Error, Result};
use crate::lower::{Attrs, Location, LowerFs, NodeGuard, SetAttrs};
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use tracing::debug;

impl MountSession {
    /// Resolve and lock the lower parent directory of `lower`. The guard
    /// drops before the returned handle, mirroring unlock-then-put.
    fn lock_parent(&self, lower: &LowerHandle) -> Result<(LowerHandle, NodeGuard)> {
        let fs = self.ctx().fs();
        let parent_loc = fs.parent_of(lower.location())?;
        let parent = LowerHandle::adopt(self.ctx().clone(), parent_loc);
        let guard = fs.lock_node(parent.location())?;
        Ok((parent, guard))
    }

    /// Refresh a shadow directory's times and size from its lower
    /// counterpart after a successful mutation. The copy itself cannot
    /// fail; a lower stat failure only leaves the cache stale until the
    /// next refresh.
    fn refresh_dir_attrs(&self, dir: &Arc<ShadowEntry>, lower_dir: &LowerHandle) {
        let fs = self.ctx().fs();
        if let (Some(inode), Ok(meta)) = (dir.inode(), fs.metadata(lower_dir.location())) {
            attr::copy_attr_times(&inode, &meta);
            attr::copy_inode_size(&inode, &meta);
        } else {
            debug!("parent attribute refresh skipped, lower stat failed");
        }
    }

    /// Common path for create/mkdir/symlink/mknod: the entry must be
    /// negative, the lower mutation runs under the lower parent's lock,
    /// and on success the entry is interposed over the new lower object.
    fn create_entry(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
        op: impl FnOnce(&Arc<dyn LowerFs>, Location) -> Result<()>,
    ) -> Result<Arc<ShadowEntry>> {
        let entry = self.lookup(parent, name)?;
        if !entry.is_negative() {
            return Err(Error::AlreadyExists(name.to_os_string()));
        }
        let lower = entry.slot().get().ok_or(Error::Stale)?;
        let (lower_parent, _guard) = self.lock_parent(&lower)?;
        let fs = self.ctx().fs();
        op(fs, lower.location())?;
        if let Err(err) = self.interpose(&entry, &lower) {
            // the lower object exists but the entry stays unbound; a
            // fresh lookup re-attempts interposition
            parent.drop_child(name);
            return Err(err);
        }
        self.refresh_dir_attrs(parent, &lower_parent);
        Ok(entry)
    }

    /// Create a regular file. `mode` carries permission bits.
    pub fn create(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
        mode: u32,
    ) -> Result<Arc<ShadowEntry>> {
        debug!(name = ?name, mode, "create");
        self.create_entry(parent, name, |fs, at| fs.create(at, mode))
    }

    pub fn mkdir(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
        mode: u32,
    ) -> Result<Arc<ShadowEntry>> {
        debug!(name = ?name, mode, "mkdir");
        let entry = self.create_entry(parent, name, |fs, at| fs.mkdir(at, mode))?;
        // a new subdirectory changes the parent's link count
        if let Some(pinode) = parent.inode() {
            if let Ok(meta) = self.ctx().fs().node_metadata(pinode.node()) {
                pinode.set_nlink(meta.nlink);
            }
        }
        Ok(entry)
    }

    pub fn symlink(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<Arc<ShadowEntry>> {
        debug!(name = ?name, target = ?target, "symlink");
        self.create_entry(parent, name, |fs, at| fs.symlink(at, target))
    }

    /// Create a special file. `mode` carries type and permission bits.
    pub fn mknod(
        &self,
        parent: &Arc<ShadowEntry>,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<Arc<ShadowEntry>> {
        debug!(name = ?name, mode, rdev, "mknod");
        self.create_entry(parent, name, |fs, at| fs.mknod(at, mode, rdev))
    }

    /// Add `new_name` under `new_parent` as a hard link to `old`. Both
    /// names end up sharing one shadow inode; its cached size is restored
    /// to the pre-link value because adding a name must not appear to
    /// change the file.
    pub fn link(
        &self,
        old: &Arc<ShadowEntry>,
        new_parent: &Arc<ShadowEntry>,
        new_name: &OsStr,
    ) -> Result<Arc<ShadowEntry>> {
        debug!(old = ?old.name(), new_name = ?new_name, "link");
        let old_inode = old
            .inode()
            .ok_or_else(|| Error::NotFound(old.name().to_os_string()))?;
        if old_inode.mode_class().is_dir() {
            return Err(Error::InvalidArgument("hard link to a directory"));
        }
        let size_save = old_inode.attrs().size;

        let lower_old = old.slot().get().ok_or(Error::Stale)?;
        let entry = self.lookup(new_parent, new_name)?;
        if !entry.is_negative() {
            return Err(Error::AlreadyExists(new_name.to_os_string()));
        }
        let lower_new = entry.slot().get().ok_or(Error::Stale)?;
        let (lower_dir, _guard) = self.lock_parent(&lower_new)?;

        let fs = self.ctx().fs();
        fs.link(lower_old.location(), lower_new.location())?;
        if let Err(err) = self.interpose(&entry, &lower_new) {
            new_parent.drop_child(new_name);
            return Err(err);
        }
        self.refresh_dir_attrs(new_parent, &lower_dir);

        // authoritative link count lands on the existing shadow inode
        if let Ok(meta) = fs.node_metadata(old_inode.node()) {
            old_inode.set_nlink(meta.nlink);
        }
        old_inode.set_size(size_save);
        Ok(entry)
    }

    /// Remove the name `name` under `parent`. A `Busy` from the lower
    /// layer is treated as success when the lower entry was silly-renamed:
    /// deletion already began in a way the caller can neither observe nor
    /// retry.
    pub fn unlink(&self, parent: &Arc<ShadowEntry>, name: &OsStr) -> Result<()> {
        debug!(name = ?name, "unlink");
        let entry = self.lookup(parent, name)?;
        let inode = entry
            .inode()
            .ok_or_else(|| Error::NotFound(name.to_os_string()))?;
        if inode.mode_class().is_dir() {
            return Err(Error::IsADirectory);
        }
        let lower = entry.slot().get().ok_or(Error::Stale)?;
        let (lower_parent, _guard) = self.lock_parent(&lower)?;
        let fs = self.ctx().fs();
        match fs.unlink(lower.location()) {
            Err(Error::Busy) if fs.is_silly_renamed(lower.location()) => {}
            Err(err) => return Err(err),
            Ok(()) => {}
        }
        self.refresh_dir_attrs(parent, &lower_parent);
        if let Ok(meta) = fs.node_metadata(inode.node()) {
            inode.set_nlink(meta.nlink);
        }
        if let Some(pinode) = parent.inode() {
            inode.set_ctime(pinode.attrs().ctime);
        }
        // drop the stale entry so subsequent lookups re-resolve
        parent.drop_child(name);
        self.registry().prune();
        Ok(())
    }

    pub fn rmdir(&self, parent: &Arc<ShadowEntry>, name: &OsStr) -> Result<()> {
        debug!(name = ?name, "rmdir");
        let entry = self.lookup(parent, name)?;
        let inode = entry
            .inode()
            .ok_or_else(|| Error::NotFound(name.to_os_string()))?;
        if !inode.mode_class().is_dir() {
            return Err(Error::NotADirectory);
        }
        let lower = entry.slot().get().ok_or(Error::Stale)?;
        let (lower_parent, _guard) = self.lock_parent(&lower)?;
        let fs = self.ctx().fs();
        fs.rmdir(lower.location())?;

        parent.drop_child(name);
        inode.set_nlink(0);
        self.refresh_dir_attrs(parent, &lower_parent);
        if let (Some(pinode), Ok(meta)) =
            (parent.inode(), fs.metadata(lower_parent.location()))
        {
            pinode.set_nlink(meta.nlink);
        }
        self.registry().prune();
        Ok(())
    }

    /// Move `old_name` under `old_parent` to `new_name` under
    /// `new_parent`. Both lower parents are locked through the lower
    /// layer's pair-lock primitive; its trap marker rejects renames that
    /// would put a directory inside itself before anything mutates.
    pub fn rename(
        &self,
        old_parent: &Arc<ShadowEntry>,
        old_name: &OsStr,
        new_parent: &Arc<ShadowEntry>,
        new_name: &OsStr,
    ) -> Result<()> {
        debug!(old = ?old_name, new = ?new_name, "rename");
        let old_entry = self.lookup(old_parent, old_name)?;
        if old_entry.is_negative() {
            return Err(Error::NotFound(old_name.to_os_string()));
        }
        let new_entry = self.lookup(new_parent, new_name)?;

        let lower_old = old_entry.slot().get().ok_or(Error::Stale)?;
        let lower_new = new_entry.slot().get().ok_or(Error::Stale)?;
        let fs = self.ctx().fs();
        let lower_old_dir =
            LowerHandle::adopt(self.ctx().clone(), fs.parent_of(lower_old.location())?);
        let lower_new_dir =
            LowerHandle::adopt(self.ctx().clone(), fs.parent_of(lower_new.location())?);

        let guard = fs.lock_rename(lower_old_dir.location(), lower_new_dir.location())?;
        if let Some(trap) = guard.trap {
            if Some(trap) == fs.node_of(lower_old.location()) {
                // source must not be an ancestor of the target
                return Err(Error::InvalidArgument("source is an ancestor of the target"));
            }
            if Some(trap) == fs.node_of(lower_new.location()) {
                // target must not be an ancestor of the source
                return Err(Error::DirectoryNotEmpty);
            }
        }

        fs.rename(lower_old.location(), lower_new.location())?;

        if let (Some(pinode), Ok(meta)) =
            (new_parent.inode(), fs.metadata(lower_new_dir.location()))
        {
            attr::copy_attr_all(&pinode, &meta);
            attr::copy_inode_size(&pinode, &meta);
        }
        if !Arc::ptr_eq(old_parent, new_parent) {
            if let (Some(pinode), Ok(meta)) =
                (old_parent.inode(), fs.metadata(lower_old_dir.location()))
            {
                attr::copy_attr_all(&pinode, &meta);
                attr::copy_inode_size(&pinode, &meta);
            }
        }
        drop(guard);

        // both names re-resolve on the next lookup
        old_parent.drop_child(old_name);
        new_parent.drop_child(new_name);
        Ok(())
    }

    /// Refresh and return the entry's attributes from the lower object
    pub fn getattr(&self, entry: &Arc<ShadowEntry>) -> Result<Attrs> {
        let inode = entry
            .inode()
            .ok_or_else(|| Error::NotFound(entry.name().to_os_string()))?;
        let lower = entry.slot().get().ok_or(Error::Stale)?;
        let meta = self.ctx().fs().metadata(lower.location())?;
        attr::copy_attr_all(&inode, &meta);
        attr::copy_inode_size(&inode, &meta);
        Ok(inode.attrs())
    }

    /// Forward attribute changes to the lower object and refresh the
    /// shadow inode from the result
    pub fn setattr(&self, entry: &Arc<ShadowEntry>, changes: &SetAttrs) -> Result<Attrs> {
        debug!(name = ?entry.name(), "setattr");
        let inode = entry
            .inode()
            .ok_or_else(|| Error::NotFound(entry.name().to_os_string()))?;
        if let Some(size) = changes.size {
            if size > self.max_size_bytes() {
                return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG)));
            }
        }
        let lower = entry.slot().get().ok_or(Error::Stale)?;
        let fs = self.ctx().fs();
        {
            // attribute changes serialize on the lower node's own lock
            let _guard = fs.lock_node(lower.location())?;
            fs.setattr(lower.location(), changes)?;
        }
        let meta = fs.metadata(lower.location())?;
        attr::copy_attr_all(&inode, &meta);
        attr::copy_inode_size(&inode, &meta);
        Ok(inode.attrs())
    }

    /// Read a symlink target and refresh the entry's access time
    pub fn readlink(&self, entry: &Arc<ShadowEntry>) -> Result<OsString> {
        let inode = entry
            .inode()
            .ok_or_else(|| Error::NotFound(entry.name().to_os_string()))?;
        if inode.mode_class() != ModeClass::Symlink {
            return Err(Error::InvalidArgument("not a symlink"));
        }
        let lower = entry.slot().get().ok_or(Error::Stale)?;
        let fs = self.ctx().fs();
        let target = fs.readlink(lower.location())?;
        if let Ok(meta) = fs.metadata(lower.location()) {
            attr::copy_attr_atime(&inode, &meta);
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::lower::MemFs;

    fn mounted() -> (Arc<MemFs>, MountSession) {
        let fs = Arc::new(MemFs::new());
        let session = MountSession::mount(fs.clone(), MountConfig::new("/".into())).unwrap();
        (fs, session)
    }

    #[test]
    fn test_create_turns_negative_entry_positive() {
        let (_fs, session) = mounted();
        let root = session.root().clone();

        let negative = session.lookup(&root, OsStr::new("foo")).unwrap();
        assert!(negative.is_negative());

        let created = session.create(&root, OsStr::new("foo"), 0o644).unwrap();
        // the same cached entry moved negative -> positive
        assert!(Arc::ptr_eq(&negative, &created));
        assert_eq!(created.inode().unwrap().mode_class(), ModeClass::Regular);

        assert!(matches!(
            session.create(&root, OsStr::new("foo"), 0o644),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_mkdir_and_rmdir_track_parent_links() {
        let (_fs, session) = mounted();
        let root = session.root().clone();

        session.mkdir(&root, OsStr::new("sub"), 0o755).unwrap();
        assert_eq!(root.inode().unwrap().attrs().nlink, 3);

        session.rmdir(&root, OsStr::new("sub")).unwrap();
        assert_eq!(root.inode().unwrap().attrs().nlink, 2);
        // removed from the cache; a fresh lookup sees a new negative entry
        let again = session.lookup(&root, OsStr::new("sub")).unwrap();
        assert!(again.is_negative());
    }

    #[test]
    fn test_rmdir_refuses_non_empty() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        let sub = session.mkdir(&root, OsStr::new("sub"), 0o755).unwrap();
        session.create(&sub, OsStr::new("inner"), 0o644).unwrap();

        assert!(matches!(
            session.rmdir(&root, OsStr::new("sub")),
            Err(Error::DirectoryNotEmpty)
        ));
    }

    #[test]
    fn test_link_shares_inode_and_restores_size() {
        let (fs, session) = mounted();
        let root = session.root().clone();

        let foo = session.create(&root, OsStr::new("foo"), 0o644).unwrap();
        let opened = session
            .open(&foo, crate::lower::OpenFlags {
                write: true,
                ..Default::default()
            })
            .unwrap();
        opened.write(0, b"some contents").unwrap();
        drop(opened);
        let size_before = foo.inode().unwrap().attrs().size;

        let bar = session.link(&foo, &root, OsStr::new("bar")).unwrap();
        let shared = foo.inode().unwrap();
        assert!(Arc::ptr_eq(&shared, &bar.inode().unwrap()));
        assert_eq!(shared.attrs().nlink, 2);
        assert_eq!(shared.attrs().size, size_before);
        assert_eq!(fs.outstanding_node_refs(), 2); // root + the shared file
    }

    #[test]
    fn test_unlink_updates_nlink_and_drops_entry() {
        let (_fs, session) = mounted();
        let root = session.root().clone();

        let foo = session.create(&root, OsStr::new("foo"), 0o644).unwrap();
        session.link(&foo, &root, OsStr::new("bar")).unwrap();
        let inode = foo.inode().unwrap();

        session.unlink(&root, OsStr::new("foo")).unwrap();
        assert_eq!(inode.attrs().nlink, 1);
        assert!(root.cached_child(OsStr::new("foo")).is_none());

        // the surviving name still resolves to the same shadow inode
        let bar = session.lookup(&root, OsStr::new("bar")).unwrap();
        assert!(Arc::ptr_eq(&bar.inode().unwrap(), &inode));

        session.unlink(&root, OsStr::new("bar")).unwrap();
        assert_eq!(inode.attrs().nlink, 0);
    }

    #[test]
    fn test_unlink_suppresses_busy_after_silly_rename() {
        let (fs, session) = mounted();
        let root = session.root().clone();
        session.create(&root, OsStr::new("held"), 0o644).unwrap();
        fs.mark_busy_unlink("held");

        session.unlink(&root, OsStr::new("held")).unwrap();
        // reported as success and the entry is gone from the cache
        assert!(root.cached_child(OsStr::new("held")).is_none());
    }

    #[test]
    fn test_rename_within_directory() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        session.create(&root, OsStr::new("old"), 0o644).unwrap();

        session
            .rename(&root, OsStr::new("old"), &root, OsStr::new("new"))
            .unwrap();

        assert!(session.lookup(&root, OsStr::new("old")).unwrap().is_negative());
        assert!(!session.lookup(&root, OsStr::new("new")).unwrap().is_negative());
    }

    #[test]
    fn test_rename_across_directories_refreshes_both_parents() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        let a = session.mkdir(&root, OsStr::new("a"), 0o755).unwrap();
        let b = session.mkdir(&root, OsStr::new("b"), 0o755).unwrap();
        session.create(&a, OsStr::new("f"), 0o644).unwrap();

        session
            .rename(&a, OsStr::new("f"), &b, OsStr::new("g"))
            .unwrap();

        assert!(session.lookup(&a, OsStr::new("f")).unwrap().is_negative());
        assert!(!session.lookup(&b, OsStr::new("g")).unwrap().is_negative());
        // sizes reflect the move: one entry left a, one landed in b
        assert_eq!(a.inode().unwrap().attrs().size, 0);
        assert_eq!(b.inode().unwrap().attrs().size, 1);
    }

    #[test]
    fn test_rename_rejects_source_ancestor_of_target() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        let d = session.mkdir(&root, OsStr::new("d"), 0o755).unwrap();
        session.mkdir(&d, OsStr::new("x"), 0o755).unwrap();
        let x = session.lookup(&d, OsStr::new("x")).unwrap();

        let err = session
            .rename(&root, OsStr::new("d"), &x, OsStr::new("inside"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // both trees unchanged
        assert!(!session.lookup(&root, OsStr::new("d")).unwrap().is_negative());
        assert!(session.lookup(&x, OsStr::new("inside")).unwrap().is_negative());
    }

    #[test]
    fn test_rename_rejects_target_ancestor_of_source() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        let d = session.mkdir(&root, OsStr::new("d"), 0o755).unwrap();
        let x = session.mkdir(&d, OsStr::new("x"), 0o755).unwrap();
        session.create(&x, OsStr::new("f"), 0o644).unwrap();

        // moving d/x/f onto the name "d" would put the target directory
        // above its own source
        let err = session
            .rename(&x, OsStr::new("f"), &root, OsStr::new("d"))
            .unwrap_err();
        assert!(matches!(err, Error::DirectoryNotEmpty));
    }

    #[test]
    fn test_symlink_and_readlink() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        let entry = session
            .symlink(&root, OsStr::new("ln"), OsStr::new("target/path"))
            .unwrap();
        assert_eq!(entry.inode().unwrap().mode_class(), ModeClass::Symlink);
        assert_eq!(session.readlink(&entry).unwrap(), OsString::from("target/path"));

        let file = session.create(&root, OsStr::new("plain"), 0o644).unwrap();
        assert!(matches!(
            session.readlink(&file),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mknod_classifies_special() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        let fifo = session
            .mknod(&root, OsStr::new("pipe"), libc::S_IFIFO as u32 | 0o600, 0)
            .unwrap();
        assert_eq!(fifo.inode().unwrap().mode_class(), ModeClass::Special);
    }

    #[test]
    fn test_setattr_roundtrip() {
        let (_fs, session) = mounted();
        let root = session.root().clone();
        let f = session.create(&root, OsStr::new("f"), 0o644).unwrap();

        let attrs = session
            .setattr(
                &f,
                &SetAttrs {
                    mode: Some(0o600),
                    size: Some(128),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(attrs.mode & 0o7777, 0o600);
        assert_eq!(attrs.size, 128);

        // size beyond the lower maximum is rejected before any mutation
        let err = session
            .setattr(
                &f,
                &SetAttrs {
                    size: Some(u64::MAX),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.errno(), libc::EFBIG);
    }

    #[test]
    fn test_getattr_refreshes_from_lower() {
        let (fs, session) = mounted();
        let root = session.root().clone();
        let f = session.create(&root, OsStr::new("f"), 0o644).unwrap();

        // grow the file behind the shadow layer's back
        let loc = f.slot().get().unwrap().location();
        fs.setattr(
            loc,
            &SetAttrs {
                size: Some(42),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(session.getattr(&f).unwrap().size, 42);
    }
}
