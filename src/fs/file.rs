//! Per-open-file state and content forwarding
//!
//! Opening a shadow entry acquires the lower file reference first; every
//! content operation goes through it. Reads refresh the shadow inode's
//! access time, writes refresh size and times, and the lower reference is
//! released exactly once when the open file is dropped.

use super::attr;
use super::entry::ShadowEntry;
use super::handle::MountContext;
use super::session::MountSession;
use crate::error::{Error, Result};
use crate::lower::{DirEntry, FileId, OpenFlags};
use std::sync::Arc;
use tracing::debug;

/// One open file in the shadow layer
pub struct OpenFile {
    ctx: Arc<MountContext>,
    entry: Arc<ShadowEntry>,
    /// Lower file reference, present from open until release
    lower_file: Option<FileId>,
    flags: OpenFlags,
}

impl MountSession {
    /// Open `entry`, creating the per-file lower reference before any
    /// content operation can run. Entries already dropped from the cache
    /// cannot be opened.
    pub fn open(&self, entry: &Arc<ShadowEntry>, flags: OpenFlags) -> Result<OpenFile> {
        debug!(name = ?entry.name(), "open");
        let inode = entry
            .inode()
            .ok_or_else(|| Error::NotFound(entry.name().to_os_string()))?;
        if let Some(parent) = entry.parent() {
            let hashed = parent
                .cached_child(entry.name())
                .map(|cached| Arc::ptr_eq(&cached, entry))
                .unwrap_or(false);
            if !hashed {
                return Err(Error::Stale);
            }
        }
        let lower = entry.slot().get().ok_or(Error::Stale)?;
        let fs = self.ctx().fs();
        let lower_file = fs.open(lower.location(), flags)?;
        // mirror the freshly opened object's attributes
        if let Ok(meta) = fs.node_metadata(inode.node()) {
            attr::copy_attr_all(&inode, &meta);
            attr::copy_inode_size(&inode, &meta);
        }
        Ok(OpenFile {
            ctx: self.ctx().clone(),
            entry: entry.clone(),
            lower_file: Some(lower_file),
            flags,
        })
    }
}

impl OpenFile {
    fn lower_file(&self) -> Result<FileId> {
        self.lower_file.ok_or(Error::Stale)
    }

    pub fn entry(&self) -> &Arc<ShadowEntry> {
        &self.entry
    }

    pub fn is_writable(&self) -> bool {
        self.flags.write
    }

    /// Read from the lower file; a successful read refreshes the shadow
    /// inode's access time.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let fs = self.ctx.fs();
        let data = fs.read(self.lower_file()?, offset, len)?;
        if let Some(inode) = self.entry.inode() {
            if let Ok(meta) = fs.node_metadata(inode.node()) {
                attr::copy_attr_atime(&inode, &meta);
            }
        }
        Ok(data)
    }

    /// Write to the lower file; a successful write refreshes the shadow
    /// inode's size and times.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        if !self.flags.write {
            return Err(Error::InvalidArgument("file not opened for writing"));
        }
        if offset.saturating_add(data.len() as u64) > self.ctx.fs().max_file_size() {
            return Err(Error::Io(std::io::Error::from_raw_os_error(libc::EFBIG)));
        }
        let fs = self.ctx.fs();
        let written = fs.write(self.lower_file()?, offset, data)?;
        if let Some(inode) = self.entry.inode() {
            if let Ok(meta) = fs.node_metadata(inode.node()) {
                attr::copy_inode_size(&inode, &meta);
                attr::copy_attr_times(&inode, &meta);
            }
        }
        Ok(written)
    }

    pub fn fsync(&self, datasync: bool) -> Result<()> {
        self.ctx.fs().fsync(self.lower_file()?, datasync)
    }

    /// List the directory behind this open file; refreshes the shadow
    /// inode's access time like a read does.
    pub fn readdir(&self) -> Result<Vec<DirEntry>> {
        let fs = self.ctx.fs();
        let entries = fs.readdir(self.lower_file()?)?;
        if let Some(inode) = self.entry.inode() {
            if let Ok(meta) = fs.node_metadata(inode.node()) {
                attr::copy_attr_atime(&inode, &meta);
            }
        }
        Ok(entries)
    }
}

impl Drop for OpenFile {
    fn drop(&mut self) {
        if let Some(file) = self.lower_file.take() {
            self.ctx.fs().release_file(file);
        }
    }
}
