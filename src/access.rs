use crate::sync::{AtomicBool, AtomicU64, Ordering};
use crate::transaction::CellHandle;

// Packed layout of `AccessCell::state`: kind in the top 2 bits, a write flag
// in the next bit (meaningful only for `Owned`), owner transaction id in the
// remaining 61 bits (meaningful only for `Owned`).
const KIND_SHIFT: u32 = 62;
const WRITE_SHIFT: u32 = 61;
const ID_MASK: u64 = (1u64 << WRITE_SHIFT) - 1;

const KIND_IDLE: u64 = 0;
const KIND_READ_SHARED: u64 = 1;
const KIND_MULTI_READ: u64 = 2;
const KIND_OWNED: u64 = 3;

fn pack(kind: u64, write: bool, owner: u64) -> u64 {
    (kind << KIND_SHIFT) | ((write as u64) << WRITE_SHIFT) | (owner & ID_MASK)
}

fn unpack(state: u64) -> (u64, bool, u64) {
    let kind = state >> KIND_SHIFT;
    let write = (state >> WRITE_SHIFT) & 1 != 0;
    let owner = state & ID_MASK;
    (kind, write, owner)
}

/// Which physical byte copy a successful read should come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    FromReadable,
    FromWriteable,
    Fail,
}

/// The per-word access-control state machine of section 4.3: a single
/// atomic word tracking `Idle` / `ReadShared` / `Owned`, plus the volatile
/// bookkeeping the commit/rollback pass needs (first reader, whether this
/// cell has already been enlisted for this transaction, whether it was
/// written). All four fields are reset together at commit or rollback.
pub(crate) struct AccessCell {
    state: AtomicU64,
    first_reader: AtomicU64,
    staged: AtomicBool,
    write_staged: AtomicBool,
}

impl AccessCell {
    pub fn new() -> AccessCell {
        AccessCell {
            state: AtomicU64::new(pack(KIND_IDLE, false, 0)),
            first_reader: AtomicU64::new(0),
            staged: AtomicBool::new(false),
            write_staged: AtomicBool::new(false),
        }
    }

    /// Attempt to read this cell on behalf of `tx_id`. Loops on CAS failure
    /// (another transaction raced the same transition) rather than failing
    /// outright; only a genuine conflict with another transaction's
    /// ownership is reported as [`ReadOutcome::Fail`].
    pub fn try_read(&self, tx_id: u64) -> ReadOutcome {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (kind, _write, owner) = unpack(cur);
            match kind {
                KIND_OWNED => {
                    return if owner == tx_id {
                        ReadOutcome::FromWriteable
                    } else {
                        ReadOutcome::Fail
                    };
                }
                KIND_IDLE => {
                    let new = pack(KIND_READ_SHARED, false, 0);
                    if self
                        .state
                        .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.first_reader.store(tx_id, Ordering::Relaxed);
                        return ReadOutcome::FromReadable;
                    }
                    // Lost the race (another reader or a writer got there
                    // first); reload and retry.
                }
                KIND_READ_SHARED => {
                    if self.first_reader.load(Ordering::Relaxed) == tx_id {
                        return ReadOutcome::FromReadable;
                    }
                    let new = pack(KIND_MULTI_READ, false, 0);
                    match self
                        .state
                        .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => return ReadOutcome::FromReadable,
                        Err(_) => {
                            // Someone else changed the cell (became
                            // multi-read, or a writer upgraded); retry.
                        }
                    }
                }
                KIND_MULTI_READ => return ReadOutcome::FromReadable,
                _ => return ReadOutcome::Fail,
            }
        }
    }

    /// Attempt to write this cell on behalf of `tx_id`. Returns `false` if
    /// another transaction already owns the cell, or if more than one
    /// reader has observed it (write-incompatible multi-reader state).
    pub fn try_write(&self, tx_id: u64) -> bool {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let (kind, write, owner) = unpack(cur);
            match kind {
                KIND_OWNED => {
                    if owner != tx_id {
                        return false;
                    }
                    if write {
                        return true;
                    }
                    let new = pack(KIND_OWNED, true, owner);
                    if self
                        .state
                        .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                    // Retry: something about our own cell's bookkeeping
                    // changed concurrently, which can't happen for a cell we
                    // already own; reload defensively anyway.
                }
                KIND_IDLE => {
                    let new = pack(KIND_OWNED, true, tx_id);
                    if self
                        .state
                        .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                }
                KIND_READ_SHARED => {
                    if self.first_reader.load(Ordering::Relaxed) != tx_id {
                        return false;
                    }
                    let new = pack(KIND_OWNED, true, tx_id);
                    if self
                        .state
                        .compare_exchange(cur, new, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                    // Raced with something (e.g. another reader joining);
                    // retry.
                }
                KIND_MULTI_READ => return false,
                _ => return false,
            }
        }
    }

    /// Enlists this cell into `accessed` exactly once per epoch, regardless
    /// of how many times the owning transaction touches it.
    pub fn enlist(&self, accessed: &mut Vec<CellHandle>, handle: CellHandle) {
        if self
            .staged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            accessed.push(handle);
        }
    }

    pub fn mark_write_staged(&self) {
        self.write_staged.store(true, Ordering::Relaxed);
    }

    pub fn was_written(&self) -> bool {
        self.write_staged.load(Ordering::Relaxed)
    }

    /// Returns this cell to `Idle` and clears all bookkeeping flags. Used
    /// both by commit (after copying written bytes) and by rollback (bytes
    /// are left untouched, since an aborted transaction never reached the
    /// readable copy).
    pub fn reset(&self) {
        self.state.store(pack(KIND_IDLE, false, 0), Ordering::Release);
        self.first_reader.store(0, Ordering::Relaxed);
        self.staged.store(false, Ordering::Relaxed);
        self.write_staged.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn idle_read_then_owner_read_your_writes() {
        let cell = AccessCell::new();
        assert_eq!(cell.try_read(1), ReadOutcome::FromReadable);
        assert!(cell.try_write(1));
        // Same owner reading again sees its own write.
        assert_eq!(cell.try_read(1), ReadOutcome::FromWriteable);
    }

    #[test]
    fn second_reader_can_still_read_but_blocks_write() {
        let cell = AccessCell::new();
        assert_eq!(cell.try_read(1), ReadOutcome::FromReadable);
        assert_eq!(cell.try_read(2), ReadOutcome::FromReadable);
        assert!(!cell.try_write(1));
        assert!(!cell.try_write(2));
    }

    #[test]
    fn sole_reader_can_upgrade_to_writer() {
        let cell = AccessCell::new();
        assert_eq!(cell.try_read(1), ReadOutcome::FromReadable);
        assert!(cell.try_write(1));
        assert_eq!(cell.try_read(1), ReadOutcome::FromWriteable);
    }

    #[test]
    fn concurrent_writers_exactly_one_wins() {
        let cell = AccessCell::new();
        assert!(cell.try_write(1));
        assert!(!cell.try_write(2));
        // Owner may keep writing.
        assert!(cell.try_write(1));
    }

    #[test]
    fn other_tx_read_after_owned_fails() {
        let cell = AccessCell::new();
        assert!(cell.try_write(1));
        assert_eq!(cell.try_read(2), ReadOutcome::Fail);
    }

    #[test]
    fn reset_returns_cell_to_idle() {
        let cell = AccessCell::new();
        assert!(cell.try_write(1));
        cell.mark_write_staged();
        assert!(cell.was_written());
        cell.reset();
        assert!(!cell.was_written());
        assert_eq!(cell.try_read(7), ReadOutcome::FromReadable);
    }

    #[test]
    fn enlist_is_idempotent() {
        let cell = AccessCell::new();
        let mut accessed = Vec::new();
        let handle = CellHandle {
            segment: crate::segment::SegmentId(0),
            word: 0,
        };
        cell.enlist(&mut accessed, handle);
        cell.enlist(&mut accessed, handle);
        assert_eq!(accessed.len(), 1);
    }
}
