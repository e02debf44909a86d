//! Vsock context id allocation.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use crate::config::FIRST_GUEST_CID;

#[derive(Debug)]
struct CidState {
    next: u32,
    taken: BTreeSet<u32>,
}

/// Hands out distinct vsock context ids to the VMs of one process.
///
/// Fresh ids are allocated in increasing order and never reused. Ids that
/// an existing domain already carries are [reserved](Self::reserve) so
/// later allocations skip them.
#[derive(Debug)]
pub struct CidAllocator {
    state: Mutex<CidState>,
}

impl CidAllocator {
    /// Starts allocating at `first`.
    #[must_use]
    pub fn new(first: u32) -> Self {
        Self {
            state: Mutex::new(CidState {
                next: first,
                taken: BTreeSet::new(),
            }),
        }
    }

    /// Returns the next unused id.
    pub fn allocate(&self) -> u32 {
        self.allocate_excluding(&BTreeSet::new())
    }

    /// Returns the next id that is neither taken here nor in `in_use`.
    pub fn allocate_excluding(&self, in_use: &BTreeSet<u32>) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut cid = state.next;
        while state.taken.contains(&cid) || in_use.contains(&cid) {
            cid = cid.saturating_add(1);
        }
        state.taken.insert(cid);
        state.next = cid.saturating_add(1);
        cid
    }

    /// Marks `cid` as taken. Returns false if it already was.
    pub fn reserve(&self, cid: u32) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .taken
            .insert(cid)
    }
}

impl Default for CidAllocator {
    fn default() -> Self {
        Self::new(FIRST_GUEST_CID)
    }
}
