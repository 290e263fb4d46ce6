//! Attribute propagation from lower to shadow inodes
//!
//! The lower filesystem stays authoritative for all metadata; these
//! helpers refresh the shadow inode's cached copy from a lower snapshot
//! and never fail. Callers re-copy after each successful lower mutation.

use super::inode::ShadowInode;
use crate::lower::Attrs;

/// Copy everything except the size fields
pub fn copy_attr_all(dst: &ShadowInode, src: &Attrs) {
    let mut attrs = dst.attrs_mut();
    attrs.mode = src.mode;
    attrs.nlink = src.nlink;
    attrs.uid = src.uid;
    attrs.gid = src.gid;
    attrs.rdev = src.rdev;
    attrs.atime = src.atime;
    attrs.mtime = src.mtime;
    attrs.ctime = src.ctime;
}

/// Copy the three timestamps
pub fn copy_attr_times(dst: &ShadowInode, src: &Attrs) {
    let mut attrs = dst.attrs_mut();
    attrs.atime = src.atime;
    attrs.mtime = src.mtime;
    attrs.ctime = src.ctime;
}

/// Copy the access time only
pub fn copy_attr_atime(dst: &ShadowInode, src: &Attrs) {
    dst.attrs_mut().atime = src.atime;
}

/// Copy size and block count
pub fn copy_inode_size(dst: &ShadowInode, src: &Attrs) {
    let mut attrs = dst.attrs_mut();
    attrs.size = src.size;
    attrs.blocks = src.blocks;
}
