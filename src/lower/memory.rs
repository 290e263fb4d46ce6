//! In-memory lower filesystem
//!
//! A complete [`LowerFs`] over an in-memory tree. Location and node
//! reference counts are tracked exactly, which makes this the backend of
//! choice for the test suite: after a session is torn down every count
//! must be back to zero. Unlinked nodes are kept as tombstones so inode
//! identity is never recycled.

use super::{
    Attrs, DirEntry, FileId, InodeId, Location, LowerFs, NodeGuard, NodeId, OpenFlags,
    RenameGuard, SetAttrs,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

const ROOT_NODE: NodeId = 1;

static NEXT_FSID: AtomicU64 = AtomicU64::new(1);

struct MemNode {
    mode: u32,
    nlink: u32,
    uid: u32,
    gid: u32,
    rdev: u32,
    data: Vec<u8>,
    target: Option<OsString>,
    children: BTreeMap<OsString, NodeId>,
    parent: NodeId,
    name: OsString,
    atime: SystemTime,
    mtime: SystemTime,
    ctime: SystemTime,
    /// Inode references held by the upper layer and open files
    refs: usize,
    lock: Arc<Mutex<()>>,
}

impl MemNode {
    fn new(mode: u32, parent: NodeId, name: OsString) -> Self {
        let now = SystemTime::now();
        MemNode {
            mode,
            nlink: if mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32 {
                2
            } else {
                1
            },
            uid: 0,
            gid: 0,
            rdev: 0,
            data: Vec::new(),
            target: None,
            children: BTreeMap::new(),
            parent,
            name,
            atime: now,
            mtime: now,
            ctime: now,
            refs: 0,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    fn size(&self) -> u64 {
        if self.is_dir() {
            // entry count stands in for a directory's byte size
            self.children.len() as u64
        } else if let Some(target) = &self.target {
            target.len() as u64
        } else {
            self.data.len() as u64
        }
    }

    fn attrs(&self) -> Attrs {
        let size = self.size();
        Attrs {
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            size,
            blocks: (size + 511) / 512,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

struct MemLoc {
    dir: NodeId,
    name: OsString,
    node: Option<NodeId>,
    refs: usize,
    silly: bool,
}

struct MemOpenFile {
    node: NodeId,
    append: bool,
}

#[derive(Default)]
struct MemState {
    nodes: HashMap<NodeId, MemNode>,
    locs: HashMap<u64, MemLoc>,
    index: HashMap<(NodeId, OsString), u64>,
    /// (dir, name) pairs whose unlink reports Busy after a silent rename
    busy_unlink: HashSet<(NodeId, OsString)>,
    files: HashMap<FileId, MemOpenFile>,
}

/// In-memory lower filesystem
pub struct MemFs {
    fsid: u64,
    state: Mutex<MemState>,
    next_node: AtomicU64,
    next_loc: AtomicU64,
    next_file: AtomicU64,
    sb_active: AtomicUsize,
    max_file_size: u64,
}

impl MemFs {
    pub fn new() -> Self {
        let mut state = MemState::default();
        state.nodes.insert(
            ROOT_NODE,
            MemNode::new(libc::S_IFDIR as u32 | 0o755, ROOT_NODE, OsString::new()),
        );
        MemFs {
            fsid: NEXT_FSID.fetch_add(1, Ordering::SeqCst),
            state: Mutex::new(state),
            next_node: AtomicU64::new(ROOT_NODE + 1),
            next_loc: AtomicU64::new(1),
            next_file: AtomicU64::new(1),
            sb_active: AtomicUsize::new(0),
            max_file_size: 1 << 40,
        }
    }

    /// Arrange for the next unlink of `path` to report Busy with the
    /// entry marked silly-renamed, the way NFS defers deletion.
    pub fn mark_busy_unlink(&self, path: &str) {
        let mut st = self.state.lock();
        if let Some((dir, name)) = Self::split_path(&st, path) {
            st.busy_unlink.insert((dir, name));
        }
    }

    /// Sum of all outstanding location references
    pub fn outstanding_location_refs(&self) -> usize {
        self.state.lock().locs.values().map(|l| l.refs).sum()
    }

    /// Sum of all outstanding node references
    pub fn outstanding_node_refs(&self) -> usize {
        self.state.lock().nodes.values().map(|n| n.refs).sum()
    }

    /// Current superblock active-reference count
    pub fn sb_active(&self) -> usize {
        self.sb_active.load(Ordering::SeqCst)
    }

    fn split_path(st: &MemState, path: &str) -> Option<(NodeId, OsString)> {
        let mut dir = ROOT_NODE;
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(comp) = components.next() {
            if components.peek().is_none() {
                return Some((dir, OsString::from(comp)));
            }
            dir = *st.nodes.get(&dir)?.children.get(OsStr::new(comp))?;
        }
        None
    }

    fn alloc_loc(&self, st: &mut MemState, dir: NodeId, name: &OsStr, node: Option<NodeId>) -> Location {
        let id = self.next_loc.fetch_add(1, Ordering::SeqCst);
        st.locs.insert(
            id,
            MemLoc {
                dir,
                name: name.to_os_string(),
                node,
                refs: 1,
                silly: false,
            },
        );
        st.index.insert((dir, name.to_os_string()), id);
        Location(id)
    }

    /// Find the cached location for (dir, name) or allocate one. The
    /// returned location carries one new reference.
    fn loc_for(&self, st: &mut MemState, dir: NodeId, name: &OsStr, node: Option<NodeId>) -> Location {
        if let Some(&id) = st.index.get(&(dir, name.to_os_string())) {
            if let Some(loc) = st.locs.get_mut(&id) {
                loc.refs += 1;
                loc.node = node.or(loc.node);
                return Location(id);
            }
        }
        self.alloc_loc(st, dir, name, node)
    }

    fn loc_node(st: &MemState, loc: Location) -> Result<NodeId> {
        st.locs
            .get(&loc.0)
            .and_then(|l| l.node)
            .ok_or(Error::Stale)
    }

    fn dir_node(st: &MemState, loc: Location) -> Result<NodeId> {
        let node = Self::loc_node(st, loc)?;
        let n = st.nodes.get(&node).ok_or(Error::Stale)?;
        if !n.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(node)
    }

    /// The node directly under `a` on the path down to `b`, when `a` is an
    /// ancestor of `b`.
    fn trap_between(nodes: &HashMap<NodeId, MemNode>, a: NodeId, b: NodeId) -> Option<NodeId> {
        if a == b {
            return None;
        }
        let mut cur = b;
        while let Some(n) = nodes.get(&cur) {
            if n.parent == a {
                return Some(cur);
            }
            if n.parent == cur {
                break;
            }
            cur = n.parent;
        }
        None
    }

    fn is_ancestor(nodes: &HashMap<NodeId, MemNode>, a: NodeId, b: NodeId) -> bool {
        Self::trap_between(nodes, a, b).is_some()
    }

    /// Check that the negative location `at` can take a new name, returning
    /// (directory node, name).
    fn prepare_create(st: &MemState, at: Location) -> Result<(NodeId, OsString)> {
        let loc = st.locs.get(&at.0).ok_or(Error::Stale)?;
        let dir = st.nodes.get(&loc.dir).ok_or(Error::Stale)?;
        if !dir.is_dir() {
            return Err(Error::NotADirectory);
        }
        // a removed directory is a tombstone; nothing new goes into it
        if dir.nlink == 0 {
            return Err(Error::Stale);
        }
        if loc.node.is_some() || dir.children.contains_key(&loc.name) {
            return Err(Error::AlreadyExists(loc.name.clone()));
        }
        Ok((loc.dir, loc.name.clone()))
    }

    fn insert_child(&self, st: &mut MemState, at: Location, mode: u32) -> Result<NodeId> {
        let (dir, name) = Self::prepare_create(st, at)?;
        let id = self.next_node.fetch_add(1, Ordering::SeqCst);
        let node = MemNode::new(mode, dir, name.clone());
        let is_dir = node.is_dir();
        st.nodes.insert(id, node);
        let parent = st.nodes.get_mut(&dir).ok_or(Error::Stale)?;
        parent.children.insert(name, id);
        let now = SystemTime::now();
        parent.mtime = now;
        parent.ctime = now;
        if is_dir {
            parent.nlink += 1;
        }
        if let Some(loc) = st.locs.get_mut(&at.0) {
            loc.node = Some(id);
        }
        Ok(id)
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl LowerFs for MemFs {
    fn fsid(&self) -> u64 {
        self.fsid
    }

    fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    fn sb_acquire(&self) {
        self.sb_active.fetch_add(1, Ordering::SeqCst);
    }

    fn sb_release(&self) {
        self.sb_active.fetch_sub(1, Ordering::SeqCst);
    }

    fn root(&self) -> Result<Location> {
        let mut st = self.state.lock();
        Ok(self.loc_for(&mut st, ROOT_NODE, OsStr::new(""), Some(ROOT_NODE)))
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
                let key = (l.dir, l.name);
                if st.index.get(&key) == Some(&loc.0) {
                    st.index.remove(&key);
                }
            }
        }
    }

    fn acquire_node(&self, node: NodeId) {
        let mut st = self.state.lock();
        if let Some(n) = st.nodes.get_mut(&node) {
            n.refs += 1;
        }
    }

    fn release_node(&self, node: NodeId) {
        let mut st = self.state.lock();
        if let Some(n) = st.nodes.get_mut(&node) {
            n.refs -= 1;
        }
    }

    fn resolve(&self, dir: Location, name: &OsStr) -> Result<Location> {
        let mut st = self.state.lock();
        let dirnode = Self::dir_node(&st, dir)?;
        let child = match st.nodes.get(&dirnode).and_then(|n| n.children.get(name)) {
            Some(&c) => c,
            None => return Err(Error::NotFound(name.to_os_string())),
        };
        // a lookup touches the directory's atime
        if let Some(n) = st.nodes.get_mut(&dirnode) {
            n.atime = SystemTime::now();
        }
        Ok(self.loc_for(&mut st, dirnode, name, Some(child)))
    }

    fn placeholder(&self, dir: Location, name: &OsStr) -> Result<Location> {
        let mut st = self.state.lock();
        let dirnode = Self::dir_node(&st, dir)?;
        let node = st.nodes.get(&dirnode).and_then(|n| n.children.get(name)).copied();
        Ok(self.loc_for(&mut st, dirnode, name, node))
    }

    fn parent_of(&self, loc: Location) -> Result<Location> {
        let mut st = self.state.lock();
        let dirnode = st.locs.get(&loc.0).map(|l| l.dir).ok_or(Error::Stale)?;
        let (grandparent, name) = {
            let n = st.nodes.get(&dirnode).ok_or(Error::Stale)?;
            (n.parent, n.name.clone())
        };
        Ok(self.loc_for(&mut st, grandparent, &name, Some(dirnode)))
    }

    fn node_of(&self, loc: Location) -> Option<NodeId> {
        self.state.lock().locs.get(&loc.0).and_then(|l| l.node)
    }

    fn inode_identity(&self, loc: Location) -> Result<InodeId> {
        let st = self.state.lock();
        let node = Self::loc_node(&st, loc)?;
        Ok(InodeId {
            fsid: self.fsid,
            ino: node,
        })
    }

    fn metadata(&self, loc: Location) -> Result<Attrs> {
        let st = self.state.lock();
        let node = Self::loc_node(&st, loc)?;
        st.nodes.get(&node).map(|n| n.attrs()).ok_or(Error::Stale)
    }

    fn node_metadata(&self, node: NodeId) -> Result<Attrs> {
        let st = self.state.lock();
        st.nodes.get(&node).map(|n| n.attrs()).ok_or(Error::Stale)
    }

    fn lock_node(&self, loc: Location) -> Result<NodeGuard> {
        let lock = {
            let st = self.state.lock();
            let node = Self::loc_node(&st, loc)?;
            st.nodes.get(&node).map(|n| n.lock.clone()).ok_or(Error::Stale)?
        };
        Ok(NodeGuard::new(lock.lock_arc()))
    }

    fn lock_rename(&self, a: Location, b: Location) -> Result<RenameGuard> {
        let (a_node, b_node, a_lock, b_lock, trap) = {
            let st = self.state.lock();
            let a_node = Self::dir_node(&st, a)?;
            let b_node = Self::dir_node(&st, b)?;
            let a_lock = st.nodes.get(&a_node).map(|n| n.lock.clone()).ok_or(Error::Stale)?;
            let b_lock = st.nodes.get(&b_node).map(|n| n.lock.clone()).ok_or(Error::Stale)?;
            let trap = Self::trap_between(&st.nodes, a_node, b_node)
                .or_else(|| Self::trap_between(&st.nodes, b_node, a_node));
            (a_node, b_node, a_lock, b_lock, trap)
        };
        if a_node == b_node {
            return Ok(RenameGuard::new(trap, NodeGuard::new(a_lock.lock_arc()), None));
        }
        // deterministic total order over directory identities
        let (first, second) = if a_node < b_node {
            (a_lock, b_lock)
        } else {
            (b_lock, a_lock)
        };
        let first = NodeGuard::new(first.lock_arc());
        let second = NodeGuard::new(second.lock_arc());
        Ok(RenameGuard::new(trap, first, Some(second)))
    }

    fn create(&self, at: Location, mode: u32) -> Result<()> {
        let mut st = self.state.lock();
        self.insert_child(&mut st, at, libc::S_IFREG as u32 | (mode & 0o7777))?;
        Ok(())
    }

    fn mkdir(&self, at: Location, mode: u32) -> Result<()> {
        let mut st = self.state.lock();
        self.insert_child(&mut st, at, libc::S_IFDIR as u32 | (mode & 0o7777))?;
        Ok(())
    }

    fn mknod(&self, at: Location, mode: u32, rdev: u32) -> Result<()> {
        let mut st = self.state.lock();
        let mut mode = mode;
        if mode & libc::S_IFMT as u32 == 0 {
            mode |= libc::S_IFREG as u32;
        }
        let id = self.insert_child(&mut st, at, mode)?;
        if let Some(n) = st.nodes.get_mut(&id) {
            n.rdev = rdev;
        }
        Ok(())
    }

    fn symlink(&self, at: Location, target: &OsStr) -> Result<()> {
        let mut st = self.state.lock();
        let id = self.insert_child(&mut st, at, libc::S_IFLNK as u32 | 0o777)?;
        if let Some(n) = st.nodes.get_mut(&id) {
            n.target = Some(target.to_os_string());
        }
        Ok(())
    }

    fn link(&self, existing: Location, at: Location) -> Result<()> {
        let mut st = self.state.lock();
        let node = Self::loc_node(&st, existing)?;
        if st.nodes.get(&node).ok_or(Error::Stale)?.is_dir() {
            return Err(Error::InvalidArgument("hard link to a directory"));
        }
        let (dir, name) = Self::prepare_create(&st, at)?;
        let now = SystemTime::now();
        let parent = st.nodes.get_mut(&dir).ok_or(Error::Stale)?;
        parent.children.insert(name, node);
        parent.mtime = now;
        parent.ctime = now;
        if let Some(n) = st.nodes.get_mut(&node) {
            n.nlink += 1;
            n.ctime = now;
        }
        if let Some(loc) = st.locs.get_mut(&at.0) {
            loc.node = Some(node);
        }
        Ok(())
    }

    fn unlink(&self, at: Location) -> Result<()> {
        let mut st = self.state.lock();
        let (dir, name, node) = {
            let loc = st.locs.get(&at.0).ok_or(Error::Stale)?;
            let node = loc.node.ok_or(Error::Stale)?;
            (loc.dir, loc.name.clone(), node)
        };
        if st.nodes.get(&node).ok_or(Error::Stale)?.is_dir() {
            return Err(Error::IsADirectory);
        }
        if st.busy_unlink.remove(&(dir, name.clone())) {
            if let Some(loc) = st.locs.get_mut(&at.0) {
                loc.silly = true;
            }
            return Err(Error::Busy);
        }
        let now = SystemTime::now();
        let parent = st.nodes.get_mut(&dir).ok_or(Error::Stale)?;
        parent.children.remove(&name);
        parent.mtime = now;
        parent.ctime = now;
        if let Some(n) = st.nodes.get_mut(&node) {
            n.nlink -= 1;
            n.ctime = now;
        }
        let key = (dir, name);
        if st.index.get(&key) == Some(&at.0) {
            st.index.remove(&key);
        }
        Ok(())
    }

    fn rmdir(&self, at: Location) -> Result<()> {
        let mut st = self.state.lock();
        let (dir, name, node) = {
            let loc = st.locs.get(&at.0).ok_or(Error::Stale)?;
            let node = loc.node.ok_or(Error::Stale)?;
            (loc.dir, loc.name.clone(), node)
        };
        {
            let n = st.nodes.get(&node).ok_or(Error::Stale)?;
            if !n.is_dir() {
                return Err(Error::NotADirectory);
            }
            if !n.children.is_empty() {
                return Err(Error::DirectoryNotEmpty);
            }
        }
        let now = SystemTime::now();
        let parent = st.nodes.get_mut(&dir).ok_or(Error::Stale)?;
        parent.children.remove(&name);
        parent.nlink -= 1;
        parent.mtime = now;
        parent.ctime = now;
        if let Some(n) = st.nodes.get_mut(&node) {
            n.nlink = 0;
        }
        let key = (dir, name);
        if st.index.get(&key) == Some(&at.0) {
            st.index.remove(&key);
        }
        Ok(())
    }

    fn rename(&self, old: Location, new: Location) -> Result<()> {
        let mut st = self.state.lock();
        let (old_dir, old_name, node) = {
            let loc = st.locs.get(&old.0).ok_or(Error::Stale)?;
            (loc.dir, loc.name.clone(), loc.node.ok_or(Error::Stale)?)
        };
        let (new_dir, new_name, target) = {
            let loc = st.locs.get(&new.0).ok_or(Error::Stale)?;
            (loc.dir, loc.name.clone(), loc.node)
        };
        let node_is_dir = st.nodes.get(&node).ok_or(Error::Stale)?.is_dir();
        if node_is_dir && Self::is_ancestor(&st.nodes, node, new_dir) {
            return Err(Error::InvalidArgument("rename into own subtree"));
        }
        if let Some(target) = target {
            if target == node {
                return Ok(());
            }
            let t = st.nodes.get(&target).ok_or(Error::Stale)?;
            if t.is_dir() {
                if !t.children.is_empty() {
                    return Err(Error::DirectoryNotEmpty);
                }
                if !node_is_dir {
                    return Err(Error::IsADirectory);
                }
            } else if node_is_dir {
                return Err(Error::NotADirectory);
            }
        }
        let now = SystemTime::now();
        // detach the target name, if any
        if let Some(target) = target {
            let target_is_dir = st.nodes.get(&target).map(|n| n.is_dir()).unwrap_or(false);
            if let Some(n) = st.nodes.get_mut(&target) {
                if target_is_dir {
                    n.nlink = 0;
                } else {
                    n.nlink -= 1;
                }
            }
            if target_is_dir {
                if let Some(p) = st.nodes.get_mut(&new_dir) {
                    p.nlink -= 1;
                }
            }
        }
        // move the name binding
        if let Some(p) = st.nodes.get_mut(&old_dir) {
            p.children.remove(&old_name);
            p.mtime = now;
            p.ctime = now;
        }
        if let Some(p) = st.nodes.get_mut(&new_dir) {
            p.children.insert(new_name.clone(), node);
            p.mtime = now;
            p.ctime = now;
        }
        if node_is_dir && old_dir != new_dir {
            if let Some(p) = st.nodes.get_mut(&old_dir) {
                p.nlink -= 1;
            }
            if let Some(p) = st.nodes.get_mut(&new_dir) {
                p.nlink += 1;
            }
        }
        if let Some(n) = st.nodes.get_mut(&node) {
            n.parent = new_dir;
            n.name = new_name.clone();
            n.ctime = now;
        }
        // the moved location takes over the new name binding
        st.index.remove(&(old_dir, old_name));
        st.index.insert((new_dir, new_name.clone()), old.0);
        if let Some(loc) = st.locs.get_mut(&old.0) {
            loc.dir = new_dir;
            loc.name = new_name;
        }
        Ok(())
    }

    fn readlink(&self, loc: Location) -> Result<OsString> {
        let mut st = self.state.lock();
        let node = Self::loc_node(&st, loc)?;
        let n = st.nodes.get_mut(&node).ok_or(Error::Stale)?;
        let target = n.target.clone().ok_or(Error::InvalidArgument("not a symlink"))?;
        n.atime = SystemTime::now();
        Ok(target)
    }

    fn setattr(&self, loc: Location, changes: &SetAttrs) -> Result<()> {
        let mut st = self.state.lock();
        let node = Self::loc_node(&st, loc)?;
        let n = st.nodes.get_mut(&node).ok_or(Error::Stale)?;
        if let Some(mode) = changes.mode {
            n.mode = (n.mode & libc::S_IFMT as u32) | (mode & 0o7777);
        }
        if let Some(uid) = changes.uid {
            n.uid = uid;
        }
        if let Some(gid) = changes.gid {
            n.gid = gid;
        }
        if let Some(size) = changes.size {
            if n.is_dir() {
                return Err(Error::IsADirectory);
            }
            n.data.resize(size as usize, 0);
            n.mtime = SystemTime::now();
        }
        if let Some(atime) = changes.atime {
            n.atime = atime;
        }
        if let Some(mtime) = changes.mtime {
            n.mtime = mtime;
        }
        n.ctime = SystemTime::now();
        Ok(())
    }

    fn is_silly_renamed(&self, loc: Location) -> bool {
        self.state
            .lock()
            .locs
            .get(&loc.0)
            .map(|l| l.silly)
            .unwrap_or(false)
    }

    fn open(&self, loc: Location, flags: OpenFlags) -> Result<FileId> {
        let mut st = self.state.lock();
        let node = Self::loc_node(&st, loc)?;
        let is_dir = st.nodes.get(&node).ok_or(Error::Stale)?.is_dir();
        if is_dir && flags.write {
            return Err(Error::IsADirectory);
        }
        if flags.truncate {
            if let Some(n) = st.nodes.get_mut(&node) {
                n.data.clear();
                n.mtime = SystemTime::now();
            }
        }
        if let Some(n) = st.nodes.get_mut(&node) {
            n.refs += 1;
        }
        let id = self.next_file.fetch_add(1, Ordering::SeqCst);
        st.files.insert(
            id,
            MemOpenFile {
                node,
                append: flags.append,
            },
        );
        Ok(id)
    }

    fn release_file(&self, file: FileId) {
        let mut st = self.state.lock();
        if let Some(f) = st.files.remove(&file) {
            if let Some(n) = st.nodes.get_mut(&f.node) {
                n.refs -= 1;
            }
        }
    }

    fn read(&self, file: FileId, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut st = self.state.lock();
        let node = st.files.get(&file).map(|f| f.node).ok_or(Error::Stale)?;
        let n = st.nodes.get_mut(&node).ok_or(Error::Stale)?;
        n.atime = SystemTime::now();
        let start = (offset as usize).min(n.data.len());
        let end = (start + len).min(n.data.len());
        Ok(n.data[start..end].to_vec())
    }

    fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<usize> {
        let mut st = self.state.lock();
        let (node, append) = st
            .files
            .get(&file)
            .map(|f| (f.node, f.append))
            .ok_or(Error::Stale)?;
        let n = st.nodes.get_mut(&node).ok_or(Error::Stale)?;
        let offset = if append { n.data.len() } else { offset as usize };
        if offset + data.len() > n.data.len() {
            n.data.resize(offset + data.len(), 0);
        }
        n.data[offset..offset + data.len()].copy_from_slice(data);
        let now = SystemTime::now();
        n.mtime = now;
        n.ctime = now;
        Ok(data.len())
    }

    fn fsync(&self, file: FileId, _datasync: bool) -> Result<()> {
        let st = self.state.lock();
        if st.files.contains_key(&file) {
            Ok(())
        } else {
            Err(Error::Stale)
        }
    }

    fn readdir(&self, file: FileId) -> Result<Vec<DirEntry>> {
        let mut st = self.state.lock();
        let node = st.files.get(&file).map(|f| f.node).ok_or(Error::Stale)?;
        let children: Vec<(OsString, NodeId)> = {
            let n = st.nodes.get_mut(&node).ok_or(Error::Stale)?;
            if !n.is_dir() {
                return Err(Error::NotADirectory);
            }
            n.atime = SystemTime::now();
            n.children.iter().map(|(k, v)| (k.clone(), *v)).collect()
        };
        Ok(children
            .into_iter()
            .filter_map(|(name, ino)| {
                st.nodes.get(&ino).map(|n| DirEntry {
                    name,
                    ino,
                    mode: n.mode,
                })
            })
            .collect())
    }
}
