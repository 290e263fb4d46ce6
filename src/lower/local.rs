//! Local-directory lower filesystem
//!
//! Stacks on a real directory tree through std::fs and nix. Locations are
//! paths under the configured root; the node table mirrors the kernel's
//! in-core inode attributes so that link counts remain observable after an
//! unlink removed the last name.

use super::{
    Attrs, DirEntry, FileId, InodeId, Location, LowerFs, NodeGuard, NodeId, OpenFlags,
    RenameGuard, SetAttrs,
};
use crate::error::{Error, Result};
use nix::sys::stat::{utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::unistd::{chown, Gid, Uid};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct LocalLoc {
    path: PathBuf,
    refs: usize,
}

#[derive(Default)]
struct LocalState {
    locs: HashMap<u64, LocalLoc>,
    index: HashMap<PathBuf, u64>,
    /// Per-inode mutation locks, allocated on first use
    node_locks: HashMap<u64, Arc<Mutex<()>>>,
    /// In-core mirror of lower inode attributes, kept fresh by every stat
    nodes: HashMap<u64, Attrs>,
    node_refs: HashMap<u64, usize>,
    files: HashMap<FileId, (Arc<File>, PathBuf)>,
}

/// Lower filesystem backed by a local directory tree
pub struct LocalFs {
    root: PathBuf,
    fsid: u64,
    state: Mutex<LocalState>,
    next_loc: AtomicU64,
    next_file: AtomicU64,
    sb_active: AtomicUsize,
}

fn attrs_from_metadata(meta: &std::fs::Metadata) -> Attrs {
    Attrs {
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::new(meta.ctime() as u64, meta.ctime_nsec() as u32),
    }
}

fn timespec_from(time: Option<SystemTime>) -> TimeSpec {
    match time.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
        Some(d) => TimeSpec::new(d.as_secs() as i64, d.subsec_nanos() as i64),
        None => TimeSpec::new(0, libc::UTIME_OMIT),
    }
}

impl LocalFs {
    /// Create a lower layer over `root`, which must be an existing
    /// directory.
    pub fn new(root: PathBuf) -> Result<Self> {
        let meta = std::fs::symlink_metadata(&root)?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(LocalFs {
            fsid: meta.dev(),
            root,
            state: Mutex::new(LocalState::default()),
            next_loc: AtomicU64::new(1),
            next_file: AtomicU64::new(1),
            sb_active: AtomicUsize::new(0),
        })
    }

    /// Root path this layer stacks on
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn loc_path(&self, loc: Location) -> Result<PathBuf> {
        self.state
            .lock()
            .locs
            .get(&loc.0)
            .map(|l| l.path.clone())
            .ok_or(Error::Stale)
    }

    /// Find the cached location for `path` or allocate one, taking a new
    /// reference either way.
    fn loc_for(&self, path: PathBuf) -> Location {
        let mut st = self.state.lock();
        if let Some(&id) = st.index.get(&path) {
            if let Some(l) = st.locs.get_mut(&id) {
                l.refs += 1;
                return Location(id);
            }
        }
        let id = self.next_loc.fetch_add(1, Ordering::SeqCst);
        st.index.insert(path.clone(), id);
        st.locs.insert(id, LocalLoc { path, refs: 1 });
        Location(id)
    }

    /// Stat `path` and refresh the in-core attribute mirror.
    fn stat_cached(&self, path: &Path) -> Result<(u64, Attrs)> {
        let meta = std::fs::symlink_metadata(path)?;
        let attrs = attrs_from_metadata(&meta);
        self.state.lock().nodes.insert(meta.ino(), attrs.clone());
        Ok((meta.ino(), attrs))
    }

    fn node_lock(&self, ino: u64) -> Arc<Mutex<()>> {
        self.state
            .lock()
            .node_locks
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl LowerFs for LocalFs {
    fn fsid(&self) -> u64 {
        self.fsid
    }

    fn max_file_size(&self) -> u64 {
        i64::MAX as u64
    }

    fn sb_acquire(&self) {
        self.sb_active.fetch_add(1, Ordering::SeqCst);
    }

    fn sb_release(&self) {
        self.sb_active.fetch_sub(1, Ordering::SeqCst);
    }

    fn root(&self) -> Result<Location> {
        Ok(self.loc_for(self.root.clone()))
    }

    fn acquire(&self, loc: Location) {
        let mut st = self.state.lock();
        if let Some(l) = st.locs.get_mut(&loc.0) {
            l.refs += 1;
        }
    }

    fn release(&self, loc: Location) {
        let mut st = self.state.lock();
        let gone = match st.locs.get_mut(&loc.0) {
            Some(l) => {
                l.refs -= 1;
                l.refs == 0
            }
            None => false,
        };
        if gone {
            if let Some(l) = st.locs.remove(&loc.0) {
                if st.index.get(&l.path) == Some(&loc.0) {
                    st.index.remove(&l.path);
                }
            }
        }
    }

    fn acquire_node(&self, node: NodeId) {
        let mut st = self.state.lock();
        *st.node_refs.entry(node).or_insert(0) += 1;
    }

    fn release_node(&self, node: NodeId) {
        let mut st = self.state.lock();
        if let Some(r) = st.node_refs.get_mut(&node) {
            *r = r.saturating_sub(1);
        }
    }

    fn resolve(&self, dir: Location, name: &OsStr) -> Result<Location> {
        let path = self.loc_path(dir)?.join(name);
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let attrs = attrs_from_metadata(&meta);
                self.state.lock().nodes.insert(meta.ino(), attrs);
                Ok(self.loc_for(path))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(name.to_os_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn placeholder(&self, dir: Location, name: &OsStr) -> Result<Location> {
        let path = self.loc_path(dir)?.join(name);
        Ok(self.loc_for(path))
    }

    fn parent_of(&self, loc: Location) -> Result<Location> {
        let path = self.loc_path(loc)?;
        let parent = if path == self.root {
            self.root.clone()
        } else {
            path.parent().unwrap_or(&self.root).to_path_buf()
        };
        Ok(self.loc_for(parent))
    }

    fn node_of(&self, loc: Location) -> Option<NodeId> {
        let path = self.loc_path(loc).ok()?;
        std::fs::symlink_metadata(path).ok().map(|m| m.ino())
    }

    fn inode_identity(&self, loc: Location) -> Result<InodeId> {
        let path = self.loc_path(loc)?;
        let meta = std::fs::symlink_metadata(path)?;
        Ok(InodeId {
            fsid: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn metadata(&self, loc: Location) -> Result<Attrs> {
        let path = self.loc_path(loc)?;
        let (_, attrs) = self.stat_cached(&path)?;
        Ok(attrs)
    }

    fn node_metadata(&self, node: NodeId) -> Result<Attrs> {
        self.state
            .lock()
            .nodes
            .get(&node)
            .cloned()
            .ok_or(Error::Stale)
    }

    fn lock_node(&self, loc: Location) -> Result<NodeGuard> {
        let path = self.loc_path(loc)?;
        let meta = std::fs::symlink_metadata(path)?;
        Ok(NodeGuard::new(self.node_lock(meta.ino()).lock_arc()))
    }

    fn lock_rename(&self, a: Location, b: Location) -> Result<RenameGuard> {
        let a_path = self.loc_path(a)?;
        let b_path = self.loc_path(b)?;
        let a_ino = std::fs::symlink_metadata(&a_path)?.ino();
        let b_ino = std::fs::symlink_metadata(&b_path)?.ino();

        // the child of the shallower directory on the path down to the
        // deeper one, when one parent contains the other
        let trap_child = |outer: &Path, inner: &Path| -> Option<PathBuf> {
            let rest = inner.strip_prefix(outer).ok()?;
            let first = rest.components().next()?;
            Some(outer.join(first.as_os_str()))
        };
        let trap = if a_path == b_path {
            None
        } else {
            trap_child(&a_path, &b_path)
                .or_else(|| trap_child(&b_path, &a_path))
                .and_then(|p| std::fs::symlink_metadata(p).ok().map(|m| m.ino()))
        };

        if a_ino == b_ino {
            return Ok(RenameGuard::new(
                trap,
                NodeGuard::new(self.node_lock(a_ino).lock_arc()),
                None,
            ));
        }
        let (first, second) = if a_ino < b_ino {
            (a_ino, b_ino)
        } else {
            (b_ino, a_ino)
        };
        let first = NodeGuard::new(self.node_lock(first).lock_arc());
        let second = NodeGuard::new(self.node_lock(second).lock_arc());
        Ok(RenameGuard::new(trap, first, Some(second)))
    }

    fn create(&self, at: Location, mode: u32) -> Result<()> {
        let path = self.loc_path(at)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(&path)?;
        self.stat_cached(&path)?;
        Ok(())
    }

    fn mkdir(&self, at: Location, mode: u32) -> Result<()> {
        let path = self.loc_path(at)?;
        std::fs::DirBuilder::new().mode(mode & 0o7777).create(&path)?;
        self.stat_cached(&path)?;
        Ok(())
    }

    fn mknod(&self, at: Location, mode: u32, rdev: u32) -> Result<()> {
        let path = self.loc_path(at)?;
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT as u32);
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        nix::sys::stat::mknod(&path, kind, perm, rdev as libc::dev_t)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        self.stat_cached(&path)?;
        Ok(())
    }

    fn symlink(&self, at: Location, target: &OsStr) -> Result<()> {
        let path = self.loc_path(at)?;
        std::os::unix::fs::symlink(target, &path)?;
        self.stat_cached(&path)?;
        Ok(())
    }

    fn link(&self, existing: Location, at: Location) -> Result<()> {
        let existing_path = self.loc_path(existing)?;
        let new_path = self.loc_path(at)?;
        std::fs::hard_link(&existing_path, &new_path)?;
        self.stat_cached(&new_path)?;
        Ok(())
    }

    fn unlink(&self, at: Location) -> Result<()> {
        let path = self.loc_path(at)?;
        let (ino, mut attrs) = self.stat_cached(&path)?;
        std::fs::remove_file(&path)?;
        // the in-core inode keeps its decremented link count
        attrs.nlink = attrs.nlink.saturating_sub(1);
        let mut st = self.state.lock();
        st.nodes.insert(ino, attrs);
        if st.index.get(&path) == Some(&at.0) {
            st.index.remove(&path);
        }
        Ok(())
    }

    fn rmdir(&self, at: Location) -> Result<()> {
        let path = self.loc_path(at)?;
        let (ino, mut attrs) = self.stat_cached(&path)?;
        std::fs::remove_dir(&path).map_err(|e| match e.raw_os_error() {
            Some(code) if code == libc::ENOTEMPTY => Error::DirectoryNotEmpty,
            _ => Error::Io(e),
        })?;
        attrs.nlink = 0;
        let mut st = self.state.lock();
        st.nodes.insert(ino, attrs);
        if st.index.get(&path) == Some(&at.0) {
            st.index.remove(&path);
        }
        Ok(())
    }

    fn rename(&self, old: Location, new: Location) -> Result<()> {
        let old_path = self.loc_path(old)?;
        let new_path = self.loc_path(new)?;
        std::fs::rename(&old_path, &new_path)?;

        // every cached location under the moved name follows it
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut moved: Vec<(u64, PathBuf)> = Vec::new();
        for (id, l) in st.locs.iter() {
            if *id == new.0 {
                continue;
            }
            if l.path == old_path {
                moved.push((*id, new_path.clone()));
            } else if let Ok(rest) = l.path.strip_prefix(&old_path) {
                moved.push((*id, new_path.join(rest)));
            }
        }
        for (id, path) in moved {
            if let Some(l) = st.locs.get_mut(&id) {
                if st.index.get(&l.path) == Some(&id) {
                    st.index.remove(&l.path);
                }
                l.path = path.clone();
                st.index.insert(path, id);
            }
        }
        Ok(())
    }

    fn readlink(&self, loc: Location) -> Result<OsString> {
        let path = self.loc_path(loc)?;
        Ok(std::fs::read_link(path)?.into_os_string())
    }

    fn setattr(&self, loc: Location, changes: &SetAttrs) -> Result<()> {
        let path = self.loc_path(loc)?;
        if let Some(mode) = changes.mode {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            chown(
                &path,
                changes.uid.map(Uid::from_raw),
                changes.gid.map(Gid::from_raw),
            )
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        }
        if let Some(size) = changes.size {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(size)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            utimensat(
                None,
                &path,
                &timespec_from(changes.atime),
                &timespec_from(changes.mtime),
                UtimensatFlags::NoFollowSymlink,
            )
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
        }
        self.stat_cached(&path)?;
        Ok(())
    }

    fn is_silly_renamed(&self, _loc: Location) -> bool {
        false
    }

    fn open(&self, loc: Location, flags: OpenFlags) -> Result<FileId> {
        let path = self.loc_path(loc)?;
        let meta = std::fs::symlink_metadata(&path)?;
        let file = if meta.is_dir() {
            if flags.write {
                return Err(Error::IsADirectory);
            }
            File::open(&path)?
        } else {
            OpenOptions::new()
                .read(true)
                .write(flags.write)
                .append(flags.append)
                .truncate(flags.truncate)
                .open(&path)?
        };
        let id = self.next_file.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock();
        *st.node_refs.entry(meta.ino()).or_insert(0) += 1;
        st.files.insert(id, (Arc::new(file), path));
        Ok(id)
    }

    fn release_file(&self, file: FileId) {
        let mut st = self.state.lock();
        if let Some((f, _path)) = st.files.remove(&file) {
            if let Ok(meta) = f.metadata() {
                if let Some(r) = st.node_refs.get_mut(&meta.ino()) {
                    *r = r.saturating_sub(1);
                }
            }
        }
    }

    fn read(&self, file: FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let f = {
            let st = self.state.lock();
            st.files.get(&file).map(|(f, _)| f.clone()).ok_or(Error::Stale)?
        };
        let mut buf = vec![0u8; len];
        let n = f.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<usize> {
        let f = {
            let st = self.state.lock();
            st.files.get(&file).map(|(f, _)| f.clone()).ok_or(Error::Stale)?
        };
        let n = f.write_at(data, offset)?;
        Ok(n)
    }

    fn fsync(&self, file: FileId, datasync: bool) -> Result<()> {
        let f = {
            let st = self.state.lock();
            st.files.get(&file).map(|(f, _)| f.clone()).ok_or(Error::Stale)?
        };
        if datasync {
            f.sync_data()?;
        } else {
            f.sync_all()?;
        }
        Ok(())
    }

    fn readdir(&self, file: FileId) -> Result<Vec<DirEntry>> {
        let path = {
            let st = self.state.lock();
            st.files.get(&file).map(|(_, p)| p.clone()).ok_or(Error::Stale)?
        };
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            entries.push(DirEntry {
                name: entry.file_name(),
                ino: meta.ino(),
                mode: meta.mode(),
            });
        }
        Ok(entries)
    }
}
