//! FUSE dispatch layer
//!
//! Translates kernel requests into shadow-layer calls. The adapter keeps
//! its own virtual inode numbers for the kernel's benefit; shadow inodes
//! keep the lower numbers they inherited.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

use super::entry::ShadowEntry;
use super::file::OpenFile;
use super::session::MountSession;
use crate::lower::{Attrs, OpenFlags, SetAttrs};

const FUSE_ROOT_INO: u64 = 1;

fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT as u32 {
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn file_attr(ino: u64, attrs: &Attrs) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks,
        atime: attrs.atime,
        mtime: attrs.mtime,
        ctime: attrs.ctime,
        crtime: attrs.ctime,
        kind: file_type_from_mode(attrs.mode),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: attrs.rdev,
        blksize: 4096,
        flags: 0,
    }
}

fn system_time(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Virtual ino <-> shadow entry table
struct NodeTable {
    next: AtomicU64,
    by_ino: RwLock<HashMap<u64, Arc<ShadowEntry>>>,
    ids: RwLock<HashMap<usize, u64>>,
}

impl NodeTable {
    fn new(root: &Arc<ShadowEntry>) -> Self {
        let table = NodeTable {
            next: AtomicU64::new(FUSE_ROOT_INO + 1),
            by_ino: RwLock::new(HashMap::new()),
            ids: RwLock::new(HashMap::new()),
        };
        table.by_ino.write().insert(FUSE_ROOT_INO, root.clone());
        table
            .ids
            .write()
            .insert(Arc::as_ptr(root) as usize, FUSE_ROOT_INO);
        table
    }

    fn ino_for(&self, entry: &Arc<ShadowEntry>) -> u64 {
        let key = Arc::as_ptr(entry) as usize;
        if let Some(&ino) = self.ids.read().get(&key) {
            return ino;
        }
        let mut ids = self.ids.write();
        if let Some(&ino) = ids.get(&key) {
            return ino;
        }
        let ino = self.next.fetch_add(1, Ordering::SeqCst);
        ids.insert(key, ino);
        self.by_ino.write().insert(ino, entry.clone());
        ino
    }

    fn get(&self, ino: u64) -> Option<Arc<ShadowEntry>> {
        self.by_ino.read().get(&ino).cloned()
    }
}

/// Open file handle table
struct OpenTable {
    next: AtomicU64,
    files: RwLock<HashMap<u64, Arc<OpenFile>>>,
}

impl OpenTable {
    fn new() -> Self {
        OpenTable {
            next: AtomicU64::new(1),
            files: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, file: OpenFile) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::SeqCst);
        self.files.write().insert(fh, Arc::new(file));
        fh
    }

    fn get(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.files.read().get(&fh).cloned()
    }

    fn remove(&self, fh: u64) -> Option<Arc<OpenFile>> {
        self.files.write().remove(&fh)
    }
}

/// FUSE front-end over a mount session
pub struct ShadowFs {
    session: Arc<MountSession>,
    nodes: NodeTable,
    handles: OpenTable,
}

impl ShadowFs {
    pub fn new(session: Arc<MountSession>) -> Self {
        let nodes = NodeTable::new(session.root());
        ShadowFs {
            session,
            nodes,
            handles: OpenTable::new(),
        }
    }

    fn reply_entry(&self, entry: &Arc<ShadowEntry>, reply: ReplyEntry) {
        match entry.inode() {
            Some(inode) => {
                let ino = self.nodes.ino_for(entry);
                let attr = file_attr(ino, &inode.attrs());
                reply.entry(&self.session.attr_ttl(), &attr, 0);
            }
            None => reply.error(libc::ENOENT),
        }
    }
}

impl Filesystem for ShadowFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);
        let parent = match self.nodes.get(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.lookup(&parent, name) {
            Ok(entry) => self.reply_entry(&entry, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);
        let entry = match self.nodes.get(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.getattr(&entry) {
            Ok(attrs) => reply.attr(&self.session.attr_ttl(), &file_attr(ino, &attrs)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={})", ino);
        let entry = match self.nodes.get(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let changes = SetAttrs {
            mode: mode.map(|m| m & 0o7777),
            uid,
            gid,
            size,
            atime: atime.map(system_time),
            mtime: mtime.map(system_time),
        };
        match self.session.setattr(&entry, &changes) {
            Ok(attrs) => reply.attr(&self.session.attr_ttl(), &file_attr(ino, &attrs)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={})", ino);
        let entry = match self.nodes.get(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.readlink(&entry) {
            Ok(target) => reply.data(target.as_encoded_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={}, name={:?})", parent, name);
        let parent = match self.nodes.get(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.mknod(&parent, name, mode, rdev) {
            Ok(entry) => self.reply_entry(&entry, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        debug!("mkdir(parent={}, name={:?})", parent, name);
        let parent = match self.nodes.get(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.mkdir(&parent, name, mode & 0o7777) {
            Ok(entry) => self.reply_entry(&entry, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("unlink(parent={}, name={:?})", parent, name);
        let parent = match self.nodes.get(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.unlink(&parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={}, name={:?})", parent, name);
        let parent = match self.nodes.get(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.rmdir(&parent, name) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        debug!("symlink(parent={}, name={:?})", parent, link_name);
        let parent = match self.nodes.get(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.symlink(&parent, link_name, target.as_os_str()) {
            Ok(entry) => self.reply_entry(&entry, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        debug!("rename({:?} -> {:?})", name, newname);
        if flags != 0 {
            // RENAME_EXCHANGE and friends are not forwarded
            reply.error(libc::EINVAL);
            return;
        }
        let (old_parent, new_parent) = match (self.nodes.get(parent), self.nodes.get(newparent)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.rename(&old_parent, name, &new_parent, newname) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        debug!("link(ino={}, newname={:?})", ino, newname);
        let (old, new_parent) = match (self.nodes.get(ino), self.nodes.get(newparent)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.link(&old, &new_parent, newname) {
            Ok(entry) => self.reply_entry(&entry, reply),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        debug!("create(parent={}, name={:?})", parent, name);
        let parent = match self.nodes.get(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let entry = match self.session.create(&parent, name, mode & 0o7777) {
            Ok(entry) => entry,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let file = match self.session.open(&entry, OpenFlags::from_libc(flags)) {
            Ok(file) => file,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };
        let ino = self.nodes.ino_for(&entry);
        let attr = match entry.inode() {
            Some(inode) => file_attr(ino, &inode.attrs()),
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let fh = self.handles.insert(file);
        reply.created(&self.session.attr_ttl(), &attr, 0, fh, 0);
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);
        let entry = match self.nodes.get(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.open(&entry, OpenFlags::from_libc(flags)) {
            Ok(file) => reply.opened(self.handles.insert(file), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        match file.read(offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        match file.write(offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // nothing buffered on this side
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);
        self.handles.remove(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        debug!("fsync(ino={}, fh={})", ino, fh);
        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        match file.fsync(datasync) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);
        let entry = match self.nodes.get(ino) {
            Some(e) => e,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        match self.session.open(&entry, OpenFlags::default()) {
            Ok(file) => reply.opened(self.handles.insert(file), 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };
        let listing = match file.readdir() {
            Ok(listing) => listing,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let parent_ino = file
            .entry()
            .parent()
            .map(|p| self.nodes.ino_for(&p))
            .unwrap_or(ino);
        let mut entries: Vec<(u64, FileType, std::ffi::OsString)> = vec![
            (ino, FileType::Directory, ".".into()),
            (parent_ino, FileType::Directory, "..".into()),
        ];
        for d in listing {
            entries.push((d.ino, file_type_from_mode(d.mode), d.name));
        }

        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*entry_ino, (i + 1) as i64, *kind, name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);
        self.handles.remove(fh);
        reply.ok();
    }

    fn access(&mut self, _req: &Request, ino: u64, _mask: i32, reply: ReplyEmpty) {
        if self.nodes.get(ino).is_some() {
            reply.ok();
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: fuser::ReplyStatfs) {
        // static numbers; the lower filesystem answers real statfs queries
        // on its own mount
        reply.statfs(
            1000000, // blocks
            500000,  // bfree
            500000,  // bavail
            1000000, // files
            500000,  // ffree
            4096,    // bsize
            255,     // namelen
            4096,    // frsize
        );
    }
}
