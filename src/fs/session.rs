//! Mount session lifecycle
//!
//! One session per mounted instance. The session owns the root shadow
//! entry, the inode registry and the entry budget, and holds exactly one
//! active reference on the lower superblock from mount to unmount.

use super::entry::{EntryBudget, ShadowEntry};
use super::handle::{LowerHandle, MountContext};
use super::inode::InodeRegistry;
use super::lookup;
use crate::config::MountConfig;
use crate::error::Result;
use crate::lower::LowerFs;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// One mounted stackfs instance
pub struct MountSession {
    ctx: Arc<MountContext>,
    root: Arc<ShadowEntry>,
    registry: InodeRegistry,
    budget: Arc<EntryBudget>,
    /// Largest file size, inherited from the lower filesystem at mount
    max_size_bytes: u64,
    config: MountConfig,
}

impl MountSession {
    /// Mount on top of `fs`: acquire the lower superblock, resolve the
    /// lower root and interpose the root shadow entry over it.
    pub fn mount(fs: Arc<dyn LowerFs>, config: MountConfig) -> Result<MountSession> {
        let ctx = Arc::new(MountContext::new(fs));
        ctx.fs().sb_acquire();
        let (root, registry, budget) = match Self::prepare(&ctx, &config) {
            Ok(parts) => parts,
            Err(err) => {
                ctx.fs().sb_release();
                return Err(err);
            }
        };
        let max_size_bytes = ctx.fs().max_file_size();
        info!(
            lower_fsid = ctx.lower_fsid(),
            max_size_bytes, "mounted stackfs over lower filesystem"
        );
        Ok(MountSession {
            ctx,
            root,
            registry,
            budget,
            max_size_bytes,
            config,
        })
    }

    fn prepare(
        ctx: &Arc<MountContext>,
        config: &MountConfig,
    ) -> Result<(Arc<ShadowEntry>, InodeRegistry, Arc<EntryBudget>)> {
        let budget = EntryBudget::new(config.entry_cache_limit);
        let registry = InodeRegistry::new();
        let root = ShadowEntry::new(&budget, None, OsStr::new(""))?;

        let root_loc = ctx.fs().root()?;
        let handle = LowerHandle::adopt(ctx.clone(), root_loc);
        root.slot().set(handle.clone());
        if let Err(err) = lookup::interpose_with(ctx, &registry, &root, &handle) {
            drop(root.slot().reset());
            return Err(err);
        }
        Ok((root, registry, budget))
    }

    /// Tear the session down. Equivalent to dropping it; the lower
    /// superblock reference is returned exactly once either way.
    pub fn unmount(self) {
        drop(self);
    }

    /// Root shadow entry
    pub fn root(&self) -> &Arc<ShadowEntry> {
        &self.root
    }

    /// Largest file size the lower filesystem supports
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }

    /// Attribute TTL for FUSE replies
    pub fn attr_ttl(&self) -> Duration {
        Duration::from_secs(self.config.attr_ttl_secs)
    }

    pub(crate) fn ctx(&self) -> &Arc<MountContext> {
        &self.ctx
    }

    pub(crate) fn registry(&self) -> &InodeRegistry {
        &self.registry
    }

    pub(crate) fn budget(&self) -> &Arc<EntryBudget> {
        &self.budget
    }
}

impl Drop for MountSession {
    fn drop(&mut self) {
        debug!("unmounting, releasing lower superblock");
        self.ctx.fs().sb_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::MemFs;

    #[test]
    fn test_mount_holds_one_superblock_reference() {
        let fs = Arc::new(MemFs::new());
        let session =
            MountSession::mount(fs.clone(), MountConfig::new("/".into())).unwrap();
        assert_eq!(fs.sb_active(), 1);

        let root = session.root().clone();
        assert!(!root.is_negative());
        assert_eq!(root.inode().unwrap().mode_class(), crate::fs::ModeClass::Directory);

        session.unmount();
        assert_eq!(fs.sb_active(), 0);

        // the root entry kept alive by an outside holder still works, and
        // its teardown returns the remaining lower references
        drop(root);
        assert_eq!(fs.outstanding_location_refs(), 0);
        assert_eq!(fs.outstanding_node_refs(), 0);
    }

    #[test]
    fn test_mount_failure_releases_superblock() {
        let fs = Arc::new(MemFs::new());
        // a zero entry budget cannot even hold the root entry
        let mut config = MountConfig::new("/".into());
        config.entry_cache_limit = 0;
        assert!(MountSession::mount(fs.clone(), config).is_err());
        assert_eq!(fs.sb_active(), 0);
        assert_eq!(fs.outstanding_location_refs(), 0);
    }
}
