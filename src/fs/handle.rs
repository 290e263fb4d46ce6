//! Lower handle lifecycle
//!
//! Every shadow directory entry keeps a [`LowerHandle`] naming the lower
//! object it aliases: a location in the lower tree plus the mount context
//! it was resolved through. The handle is reference counted; the slot
//! holding it is guarded by an entry-local lock held only for the pointer
//! copy or swap, never across a lower-filesystem call.

use crate::lower::{Location, LowerFs};
use parking_lot::Mutex;
use std::sync::Arc;

/// Mount context a handle was resolved through: the lower filesystem and
/// the session's record of which lower instance it stacked on.
pub struct MountContext {
    fs: Arc<dyn LowerFs>,
    lower_fsid: u64,
}

impl MountContext {
    pub fn new(fs: Arc<dyn LowerFs>) -> Self {
        let lower_fsid = fs.fsid();
        MountContext { fs, lower_fsid }
    }

    pub fn fs(&self) -> &Arc<dyn LowerFs> {
        &self.fs
    }

    /// Identity of the lower filesystem instance this session mounted on
    pub fn lower_fsid(&self) -> u64 {
        self.lower_fsid
    }
}

struct HandleInner {
    loc: Location,
    ctx: Arc<MountContext>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.ctx.fs.release(self.loc);
    }
}

/// Reference-counted capability for one location in the lower tree.
///
/// Cloning increments the shared count; dropping the last clone releases
/// the location back to the lower filesystem. A released handle cannot be
/// dereferenced because no clone of it exists anymore.
#[derive(Clone)]
pub struct LowerHandle {
    inner: Arc<HandleInner>,
}

impl LowerHandle {
    /// Wrap an already-acquired location, taking over the caller's
    /// reference.
    pub fn adopt(ctx: Arc<MountContext>, loc: Location) -> Self {
        LowerHandle {
            inner: Arc::new(HandleInner { loc, ctx }),
        }
    }

    pub fn location(&self) -> Location {
        self.inner.loc
    }

    pub fn ctx(&self) -> &Arc<MountContext> {
        &self.inner.ctx
    }
}

/// Per-entry slot for the attached lower handle
#[derive(Default)]
pub struct EntrySlot {
    lower: Mutex<Option<LowerHandle>>,
}

impl EntrySlot {
    /// Clone the attached handle. The caller owns the returned reference
    /// and releases it by dropping the clone.
    pub fn get(&self) -> Option<LowerHandle> {
        self.lower.lock().clone()
    }

    /// Attach `handle`, replacing any previous value.
    pub fn set(&self, handle: LowerHandle) {
        *self.lower.lock() = Some(handle);
    }

    /// Take the attached handle out, leaving the slot empty, and hand it
    /// to the caller for disposal. Swap and clear happen in one critical
    /// section: a concurrent `get` observes either the live handle or an
    /// empty slot, never a handle whose teardown has begun.
    pub fn reset(&self) -> Option<LowerHandle> {
        self.lower.lock().take()
    }
}
