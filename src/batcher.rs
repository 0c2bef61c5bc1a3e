use crate::diagnostics::trace_event;
use crate::sync::{AtomicU64, AtomicUsize, Condvar, Mutex, Ordering};

struct BatcherState {
    remaining: usize,
    // Raised by an arrival that had to block, lowered by the leaver whose
    // departure empties the epoch. Named `barrier` after section 4.4; the
    // source called the same field `keep_waiting`.
    barrier: bool,
}

/// The epoch synchroniser. Groups whichever transactions are concurrently
/// "in" the region (between `enter` and `leave`) into one batch, and runs
/// the batch's commit function exactly once, with zero transactions
/// in-flight, when the last of them leaves.
///
/// `enter` is the only call that can block. `leave` only blocks briefly on
/// the internal mutex, for the duration of `commit_fn` itself.
pub(crate) struct Batcher {
    state: Mutex<BatcherState>,
    condvar: Condvar,
    n_blocked: AtomicUsize,
    epoch: AtomicUsize,
    tx_counter: AtomicU64,
}

impl Batcher {
    pub fn new() -> Batcher {
        Batcher {
            state: Mutex::new(BatcherState {
                remaining: 0,
                barrier: false,
            }),
            condvar: Condvar::new(),
            n_blocked: AtomicUsize::new(0),
            epoch: AtomicUsize::new(0),
            // Transaction ids start at 1; 0 is reserved so it can never
            // collide with a real id.
            tx_counter: AtomicU64::new(1),
        }
    }

    /// Allocates the next globally unique, strictly increasing transaction
    /// id for this region.
    pub fn next_tx_id(&self) -> u64 {
        self.tx_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn blocked(&self) -> usize {
        self.n_blocked.load(Ordering::Relaxed)
    }

    /// Join the current epoch, or the next one if one is already underway.
    pub fn enter(&self) {
        let mut state = self.state.lock();
        if state.remaining > 0 {
            state.barrier = true;
            self.n_blocked.fetch_add(1, Ordering::Relaxed);
            trace_event!(blocked = self.blocked(), "batcher: waiting for epoch barrier");
            state = self.condvar.wait_while(state, |s| s.barrier);
            self.n_blocked.fetch_sub(1, Ordering::Relaxed);
        }
        state.remaining += 1;
    }

    /// Leave the current epoch. If this was the last transaction in the
    /// epoch, runs `commit_fn` while still holding the batcher's mutex (so
    /// it is guaranteed to run with `remaining == 0` and no other leaver can
    /// interleave), then opens the next epoch.
    pub fn leave<F: FnOnce()>(&self, commit_fn: F) {
        let mut state = self.state.lock();
        state.remaining -= 1;
        if state.remaining == 0 {
            trace_event!(
                epoch = self.epoch.load(Ordering::Relaxed),
                blocked = self.blocked(),
                "batcher: last leaver, committing"
            );
            commit_fn();
            self.epoch.fetch_add(1, Ordering::AcqRel);
            state.barrier = false;
            self.condvar.notify_all();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_enter_leave_advances_epoch() {
        let batcher = Batcher::new();
        assert_eq!(batcher.epoch(), 0);
        batcher.enter();
        batcher.leave(|| {});
        assert_eq!(batcher.epoch(), 1);
    }

    #[test]
    fn tx_ids_strictly_increase() {
        let batcher = Batcher::new();
        let a = batcher.next_tx_id();
        let b = batcher.next_tx_id();
        let c = batcher.next_tx_id();
        assert!(a < b);
        assert!(b < c);
        assert!(a >= 1);
    }

    #[test]
    fn second_arrival_blocks_until_first_leaves() {
        let batcher = Arc::new(Batcher::new());
        let committed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        batcher.enter();

        let batcher2 = Arc::clone(&batcher);
        let committed2 = Arc::clone(&committed);
        let handle = thread::spawn(move || {
            batcher2.enter();
            committed2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            batcher2.leave(|| {});
        });

        // Give the second thread a chance to block; it must not have
        // incremented the counter yet because the first epoch is still
        // open.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(committed.load(std::sync::atomic::Ordering::SeqCst), 0);

        batcher.leave(|| {});
        handle.join().unwrap();
        assert_eq!(committed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(batcher.epoch(), 2);
    }
}
