//! Optimistic read consistency for view calls.
//!
//! The chain advances a [`GlobalStateIndex`] once per committed state
//! transition. A view call takes a [`StateBaseline`] before its first read
//! and every read goes through an [`OptimisticReader`], which checks the
//! baseline before and after touching the store. If the index moved, the
//! read fails with [`HostError::StateInvalidated`] and the caller decides
//! whether to run the call again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{HostError, HostResult};
use crate::kv::KvStore;

/// Sentinel stored while chain state is known to be inconsistent.
pub const INVALID_STATE_INDEX: u64 = u64::MAX;

#[derive(Debug)]
pub struct GlobalStateIndex {
    index: AtomicU64,
    /// Bumped on every invalidation so a restored index does not revive
    /// snapshots taken before it.
    epoch: AtomicU64,
}

impl GlobalStateIndex {
    pub fn new(index: u64) -> Self {
        Self {
            index: AtomicU64::new(index),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn get(&self) -> u64 {
        self.index.load(Ordering::SeqCst)
    }

    pub fn is_invalid(&self) -> bool {
        self.get() == INVALID_STATE_INDEX
    }

    /// Record one committed transition. Returns the new index, or `None`
    /// while the index is invalidated.
    pub fn advance(&self) -> Option<u64> {
        self.index
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != INVALID_STATE_INDEX).then(|| current.wrapping_add(1))
                    .filter(|next| *next != INVALID_STATE_INDEX)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    /// The sentinel goes in before the epoch moves, so a baseline started
    /// in between observes an invalid index rather than the old one.
    pub fn invalidate(&self) {
        self.index.store(INVALID_STATE_INDEX, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Set a known-good index after an invalidation.
    pub fn restore(&self, index: u64) {
        self.index.store(index, Ordering::SeqCst);
    }

    /// Mark state as in flux. Returns the index to hand back to
    /// [`end_transition`](Self::end_transition).
    pub fn begin_transition(&self) -> u64 {
        let previous = self.get();
        self.invalidate();
        previous
    }

    /// Close a transition opened at `previous`. A committed transition moves
    /// the index on; a rolled-back one keeps it. An index that was already
    /// invalid before the transition stays invalid.
    pub fn end_transition(&self, previous: u64, committed: bool) {
        if previous == INVALID_STATE_INDEX {
            return;
        }
        let next = if committed {
            match previous.wrapping_add(1) {
                INVALID_STATE_INDEX => 0,
                next => next,
            }
        } else {
            previous
        };
        self.restore(next);
    }

    fn observe(&self) -> (u64, u64) {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let index = self.get();
            if epoch == self.epoch.load(Ordering::SeqCst) {
                return (index, epoch);
            }
        }
    }

    /// A baseline already started against the current index.
    pub fn baseline(self: &Arc<Self>) -> StateBaseline {
        let mut baseline = StateBaseline::new(Arc::clone(self));
        baseline.start();
        baseline
    }
}

impl Default for GlobalStateIndex {
    fn default() -> Self {
        Self::new(0)
    }
}

/// One reader's snapshot of the global index.
#[derive(Debug, Clone)]
pub struct StateBaseline {
    global: Arc<GlobalStateIndex>,
    observed: u64,
    epoch: u64,
}

impl StateBaseline {
    /// An unstarted baseline; it is never valid until [`start`](Self::start).
    pub fn new(global: Arc<GlobalStateIndex>) -> Self {
        Self {
            global,
            observed: INVALID_STATE_INDEX,
            epoch: u64::MAX,
        }
    }

    pub fn start(&mut self) {
        let (index, epoch) = self.global.observe();
        self.observed = index;
        self.epoch = epoch;
    }

    pub fn set(&mut self) {
        self.start();
    }

    pub fn observed(&self) -> u64 {
        self.observed
    }

    pub fn is_valid(&self) -> bool {
        let (index, epoch) = self.global.observe();
        index != INVALID_STATE_INDEX && index == self.observed && epoch == self.epoch
    }

    pub fn check(&self) -> HostResult<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(HostError::StateInvalidated)
        }
    }
}

/// Read-only store wrapper that validates a baseline around every read.
pub struct OptimisticReader {
    store: Arc<dyn KvStore>,
    baseline: StateBaseline,
}

impl OptimisticReader {
    pub fn new(store: Arc<dyn KvStore>, baseline: StateBaseline) -> Self {
        Self { store, baseline }
    }

    pub fn baseline(&self) -> &StateBaseline {
        &self.baseline
    }

    fn guarded<T>(&self, read: impl FnOnce() -> HostResult<T>) -> HostResult<T> {
        self.baseline.check()?;
        let value = read()?;
        self.baseline.check()?;
        Ok(value)
    }
}

impl KvStore for OptimisticReader {
    fn get(&self, key: &[u8]) -> HostResult<Option<Vec<u8>>> {
        self.guarded(|| self.store.get(key))
    }

    fn has(&self, key: &[u8]) -> HostResult<bool> {
        self.guarded(|| self.store.has(key))
    }

    fn set(&self, _key: &[u8], _value: &[u8]) -> HostResult<()> {
        Err(HostError::capability("view state is read-only"))
    }

    fn del(&self, _key: &[u8]) -> HostResult<()> {
        Err(HostError::capability("view state is read-only"))
    }

    fn iterate_prefix(
        &self,
        prefix: &[u8],
        f: &mut dyn FnMut(&[u8], &[u8]) -> bool,
    ) -> HostResult<()> {
        self.guarded(|| self.store.iterate_prefix(prefix, f))
    }
}
