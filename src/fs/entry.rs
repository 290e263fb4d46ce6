//! Shadow directory entries
//!
//! A shadow entry is one name binding in the shadow namespace. It is
//! negative until the interposer binds a shadow inode to it; a positive
//! entry never goes back to negative in place, removal drops it from the
//! cache and a fresh lookup re-creates it.

use super::handle::EntrySlot;
use super::inode::ShadowInode;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Per-session budget for cached shadow entries
pub struct EntryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl EntryBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(EntryBudget {
            limit,
            used: AtomicUsize::new(0),
        })
    }

    fn charge(self: &Arc<Self>) -> Result<BudgetCharge> {
        let prev = self.used.fetch_add(1, Ordering::SeqCst);
        if prev >= self.limit {
            self.used.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::OutOfMemory);
        }
        Ok(BudgetCharge {
            budget: self.clone(),
        })
    }

    /// Entries currently charged against the budget
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

pub(crate) struct BudgetCharge {
    budget: Arc<EntryBudget>,
}

impl Drop for BudgetCharge {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One name binding in the shadow namespace
pub struct ShadowEntry {
    name: OsString,
    parent: Weak<ShadowEntry>,
    slot: EntrySlot,
    inode: RwLock<Option<Arc<ShadowInode>>>,
    children: Mutex<HashMap<OsString, Arc<ShadowEntry>>>,
    _charge: BudgetCharge,
}

impl ShadowEntry {
    /// Allocate entry-private storage. Fails with `OutOfMemory` when the
    /// session's entry budget is exhausted.
    pub(crate) fn new(
        budget: &Arc<EntryBudget>,
        parent: Option<&Arc<ShadowEntry>>,
        name: &OsStr,
    ) -> Result<Arc<Self>> {
        let charge = budget.charge()?;
        Ok(Arc::new(ShadowEntry {
            name: name.to_os_string(),
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            slot: EntrySlot::default(),
            inode: RwLock::new(None),
            children: Mutex::new(HashMap::new()),
            _charge: charge,
        }))
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<ShadowEntry>> {
        self.parent.upgrade()
    }

    /// The entry's lower handle slot
    pub fn slot(&self) -> &EntrySlot {
        &self.slot
    }

    /// Shadow inode, if the entry is positive
    pub fn inode(&self) -> Option<Arc<ShadowInode>> {
        self.inode.read().clone()
    }

    /// True while no shadow inode is bound
    pub fn is_negative(&self) -> bool {
        self.inode.read().is_none()
    }

    /// Bind a shadow inode, turning the entry positive. Only the
    /// interposer calls this, and only while the slot holds the lower
    /// handle the inode was resolved from.
    pub(crate) fn instantiate(&self, inode: Arc<ShadowInode>) {
        debug_assert!(self.slot.get().is_some());
        *self.inode.write() = Some(inode);
    }

    /// Cached child by name
    pub fn cached_child(&self, name: &OsStr) -> Option<Arc<ShadowEntry>> {
        self.children.lock().get(name).cloned()
    }

    /// Insert `child` into the cache unless a concurrent lookup won the
    /// race, in which case the existing entry is returned and `child` is
    /// discarded by the caller.
    pub(crate) fn cache_child(&self, child: Arc<ShadowEntry>) -> Arc<ShadowEntry> {
        let mut children = self.children.lock();
        match children.entry(child.name.clone()) {
            std::collections::hash_map::Entry::Occupied(existing) => existing.get().clone(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(child.clone());
                child
            }
        }
    }

    /// Drop a child from the cache so subsequent lookups re-resolve
    pub fn drop_child(&self, name: &OsStr) -> Option<Arc<ShadowEntry>> {
        self.children.lock().remove(name)
    }

    /// Number of cached children
    pub fn cached_children(&self) -> usize {
        self.children.lock().len()
    }
}
