use std::cell::UnsafeCell;

use crate::access::ReadOutcome;
use crate::batcher::Batcher;
use crate::diagnostics::trace_event;
use crate::error::TmError;
use crate::segment::{decode_address, encode_address, Segment, SegmentId};
use crate::sync::{AtomicUsize, Mutex, Ordering};
use crate::transaction::{CellHandle, Transaction};

/// Fixed capacity of a region's segment table, matching the historical
/// `MAX_SEGMENTS`. Chosen for O(1) address decode: a growable table would
/// cost a level of indirection on the read/write hot path.
pub const MAX_SEGMENTS: usize = 65536;

/// Configuration for a [`Region`], supplementing the bare `(size, align)`
/// pair of the historical `tm_create` entry point.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Upper bound on the number of live segments (including segment 0).
    pub capacity: usize,
    /// Whether batch/commit/abort transitions emit `tracing` events. Has no
    /// effect unless the crate's `tracing` feature is enabled.
    pub tracing: bool,
}

impl Default for RegionConfig {
    fn default() -> RegionConfig {
        RegionConfig {
            capacity: MAX_SEGMENTS,
            tracing: true,
        }
    }
}

struct SegmentSlot {
    segment: UnsafeCell<Option<Segment>>,
}

impl SegmentSlot {
    fn empty() -> SegmentSlot {
        SegmentSlot {
            segment: UnsafeCell::new(None),
        }
    }
}

// Safety: a slot is only ever populated by the transaction that claimed its
// index (via `SegmentTable::allocate`'s atomic counter or the lock-guarded
// scan), read by any transaction holding a valid address into it, and
// cleared only by the single-threaded commit function or by the aborting
// transaction that exclusively owns it. Distinct indices are never aliased.
unsafe impl Sync for SegmentSlot {}

/// Owns every segment a region has ever allocated. Slot assignment for the
/// common case (table not yet full) is a single atomic increment; once the
/// table has been saturated at least once, reuse of freed slots falls back
/// to a lock-guarded linear scan, matching the O(1) amortised / O(n) worst
/// case documented in section 4.1.
pub(crate) struct SegmentTable {
    slots: Box<[SegmentSlot]>,
    capacity: usize,
    n_segments: AtomicUsize,
    scan_lock: Mutex<()>,
}

impl SegmentTable {
    fn new(capacity: usize) -> SegmentTable {
        let slots = (0..capacity).map(|_| SegmentSlot::empty()).collect();
        SegmentTable {
            slots,
            capacity,
            n_segments: AtomicUsize::new(0),
            scan_lock: Mutex::new(()),
        }
    }

    pub fn allocate(&self, size: usize, align: usize) -> Option<SegmentId> {
        let claimed = self.n_segments.fetch_add(1, Ordering::Relaxed);
        if claimed < self.capacity {
            // Safety: index `claimed` was never handed out before (the
            // counter only increases) and is in bounds.
            unsafe {
                *self.slots[claimed].segment.get() = Some(Segment::new(size, align));
            }
            return Some(SegmentId(claimed as u32));
        }

        // Table has been saturated at least once; undo the speculative
        // increment and fall back to scanning for a freed slot.
        self.n_segments.fetch_sub(1, Ordering::Relaxed);
        let _guard = self.scan_lock.lock();
        for i in 0..self.capacity {
            // Safety: `scan_lock` serialises the scan-and-claim operation
            // against every other caller taking this fallback path. The
            // fast-path `allocate` above only ever touches indices beyond
            // the current occupied range, so it cannot race a freed slot
            // found here.
            let slot = unsafe { &mut *self.slots[i].segment.get() };
            if slot.is_none() {
                *slot = Some(Segment::new(size, align));
                return Some(SegmentId(i as u32));
            }
        }
        None
    }

    /// Safety: `id` must refer to a currently allocated segment; callers
    /// must not hold any live reference returned by `segment` across a call
    /// to `release` for the same id.
    pub fn release(&self, id: SegmentId) {
        unsafe {
            *self.slots[id.0 as usize].segment.get() = None;
        }
    }

    pub fn segment(&self, id: SegmentId) -> &Segment {
        // Safety: callers only ever pass ids decoded from addresses that
        // were handed out by a successful `allocate` and not yet `release`d;
        // the region/transaction protocol guarantees no concurrent `release`
        // of that same id while this reference is alive.
        unsafe {
            (*self.slots[id.0 as usize].segment.get())
                .as_ref()
                .expect("segment not allocated")
        }
    }
}

/// Result of [`Region::alloc`]/`tm_alloc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocResult {
    /// Allocation succeeded; carries the encoded address of the new
    /// segment's first byte.
    Success(u64),
    /// Allocation failed; the transaction is *not* aborted and may continue.
    NoMem,
    /// The transaction was already aborted before this call.
    Abort,
}

pub(crate) enum TxHandleInner {
    ReadOnly,
    ReadWrite(Box<Transaction>),
}

/// Opaque transaction handle returned by [`Region::begin`]/`tm_begin`.
pub struct TxHandle(pub(crate) TxHandleInner);

/// A shared memory region: the segment table, the epoch batcher, and the
/// two logs (modified cells, freed segments) that a committing transaction
/// appends to and the single-threaded commit function drains.
pub struct Region {
    batcher: Batcher,
    table: SegmentTable,
    align: usize,
    config: RegionConfig,
    modified_cells: Mutex<Vec<CellHandle>>,
    freed_segments: Mutex<Vec<SegmentId>>,
}

impl Region {
    /// Creates a region with the default [`RegionConfig`], matching the
    /// historical `tm_create(size, align)` defaults.
    pub fn new(size: usize, align: usize) -> Result<Region, TmError> {
        Region::with_config(size, align, RegionConfig::default())
    }

    pub fn with_config(size: usize, align: usize, config: RegionConfig) -> Result<Region, TmError> {
        if size == 0 || align == 0 || !align.is_power_of_two() || size % align != 0 {
            return Err(TmError::InvalidRegion);
        }

        let table = SegmentTable::new(config.capacity);
        let first = table.allocate(size, align).ok_or(TmError::OutOfMemory)?;
        debug_assert_eq!(first, SegmentId(0));

        Ok(Region {
            batcher: Batcher::new(),
            table,
            align,
            config,
            modified_cells: Mutex::new(Vec::new()),
            freed_segments: Mutex::new(Vec::new()),
        })
    }

    pub fn start(&self) -> u64 {
        encode_address(SegmentId(0), 0)
    }

    pub fn size(&self) -> usize {
        self.table.segment(SegmentId(0)).size()
    }

    pub fn align(&self) -> usize {
        self.align
    }

    /// Begins a new transaction. Blocks (inside the batcher) if a commit is
    /// currently in flight for the previous epoch.
    pub fn begin(&self, is_ro: bool) -> TxHandle {
        self.batcher.enter();
        if is_ro {
            TxHandle(TxHandleInner::ReadOnly)
        } else {
            let id = self.batcher.next_tx_id();
            TxHandle(TxHandleInner::ReadWrite(Box::new(Transaction::new(id))))
        }
    }

    /// Ends `tx`, returning whether it committed.
    pub fn end(&self, tx: TxHandle) -> bool {
        match tx.0 {
            TxHandleInner::ReadOnly => {
                self.batcher.leave(|| self.commit());
                true
            }
            TxHandleInner::ReadWrite(mut txn) => {
                if txn.aborted {
                    trace_event!(tx = txn.id, "transaction aborted; rolling back");
                    for handle in txn.accessed.drain(..) {
                        self.table.segment(handle.segment).cell(handle.word).reset();
                    }
                    for seg in txn.allocated.drain(..) {
                        // Safety: this segment was allocated by `txn` this
                        // epoch and never published (the transaction never
                        // committed), so no other transaction can hold a
                        // reference to it.
                        self.table.release(seg);
                    }
                    self.batcher.leave(|| self.commit());
                    false
                } else {
                    {
                        let mut freed = self.freed_segments.lock();
                        freed.extend(txn.freed.drain(..));
                    }
                    {
                        let mut modified = self.modified_cells.lock();
                        modified.extend(txn.accessed.drain(..));
                    }
                    self.batcher.leave(|| self.commit());
                    true
                }
            }
        }
    }

    /// Runs with zero transactions in the epoch, guaranteed by the batcher.
    /// Copies every written word's bytes into its readable copy, resets
    /// every enlisted cell to `Idle`, then releases every segment freed
    /// during the epoch.
    fn commit(&self) {
        let mut modified = self.modified_cells.lock();
        for handle in modified.drain(..) {
            let segment = self.table.segment(handle.segment);
            let cell = segment.cell(handle.word);
            if cell.was_written() {
                // Safety: commit is single-threaded (runs inside the
                // batcher's last `leave`, under its mutex) and this cell is
                // enlisted, so no transaction is concurrently touching it.
                unsafe { segment.copy_word_writeable_to_readable(handle.word) };
            }
            cell.reset();
        }
        drop(modified);

        let mut freed = self.freed_segments.lock();
        for seg in freed.drain(..) {
            self.table.release(seg);
        }
        if self.config.tracing {
            trace_event!(epoch = self.batcher.epoch(), "commit complete");
        }
    }

    /// Reads `buf.len() / align` consecutive words starting at `src` into
    /// `buf`. Returns `false` (and marks `tx` aborted) if a read-write
    /// transaction lost contention partway through; any words already
    /// copied into `buf` before the failure are not meaningful.
    pub fn read(&self, tx: &mut TxHandle, src: u64, buf: &mut [u8]) -> bool {
        debug_assert_eq!(buf.len() % self.align, 0);
        let n_words = buf.len() / self.align;
        let (segment_id, offset) = decode_address(src);
        let start_word = (offset / self.align as u64) as u32;
        let segment = self.table.segment(segment_id);

        match &mut tx.0 {
            TxHandleInner::ReadOnly => {
                for i in 0..n_words {
                    // Safety: read-only transactions never race a writer for
                    // the *readable* copy: the batcher guarantees no commit
                    // can be in flight while this transaction is in its
                    // epoch, and commit is the only mutator of `readable`.
                    let word = unsafe { segment.readable_word(start_word + i as u32) };
                    buf[i * self.align..(i + 1) * self.align].copy_from_slice(word);
                }
                true
            }
            TxHandleInner::ReadWrite(txn) => {
                if txn.aborted {
                    return false;
                }
                for i in 0..n_words {
                    let word_idx = start_word + i as u32;
                    let cell = segment.cell(word_idx);
                    let outcome = cell.try_read(txn.id);
                    let bytes = match outcome {
                        ReadOutcome::Fail => {
                            txn.aborted = true;
                            return false;
                        }
                        ReadOutcome::FromReadable => {
                            cell.enlist(
                                &mut txn.accessed,
                                CellHandle {
                                    segment: segment_id,
                                    word: word_idx,
                                },
                            );
                            // Safety: see `ReadOutcome::FromReadable`'s
                            // contract in `AccessCell::try_read`.
                            unsafe { segment.readable_word(word_idx) }
                        }
                        ReadOutcome::FromWriteable => {
                            cell.enlist(
                                &mut txn.accessed,
                                CellHandle {
                                    segment: segment_id,
                                    word: word_idx,
                                },
                            );
                            // Safety: `txn` owns this cell, so it is the
                            // only transaction permitted to touch its
                            // writeable bytes.
                            unsafe { segment.writeable_word(word_idx) }
                        }
                    };
                    buf[i * self.align..(i + 1) * self.align].copy_from_slice(bytes);
                }
                true
            }
        }
    }

    /// Writes `buf.len() / align` consecutive words from `buf` starting at
    /// `dst`. Returns `false` (and marks `tx` aborted) on contention.
    pub fn write(&self, tx: &mut TxHandle, buf: &[u8], dst: u64) -> bool {
        debug_assert_eq!(buf.len() % self.align, 0);
        let n_words = buf.len() / self.align;
        let (segment_id, offset) = decode_address(dst);
        let start_word = (offset / self.align as u64) as u32;

        let txn = match &mut tx.0 {
            TxHandleInner::ReadOnly => return false,
            TxHandleInner::ReadWrite(txn) => txn,
        };
        if txn.aborted {
            return false;
        }
        let segment = self.table.segment(segment_id);
        for i in 0..n_words {
            let word_idx = start_word + i as u32;
            let cell = segment.cell(word_idx);
            if !cell.try_write(txn.id) {
                txn.aborted = true;
                return false;
            }
            cell.enlist(
                &mut txn.accessed,
                CellHandle {
                    segment: segment_id,
                    word: word_idx,
                },
            );
            cell.mark_write_staged();
            // Safety: `try_write` just succeeded, so `txn` is the sole
            // owner of this cell's writeable bytes.
            let word = unsafe { segment.writeable_word_mut(word_idx) };
            word.copy_from_slice(&buf[i * self.align..(i + 1) * self.align]);
        }
        true
    }

    /// Allocates a fresh segment of `size` bytes, returning its encoded
    /// start address.
    pub fn alloc(&self, tx: &mut TxHandle, size: usize) -> AllocResult {
        let txn = match &mut tx.0 {
            TxHandleInner::ReadOnly => return AllocResult::Abort,
            TxHandleInner::ReadWrite(txn) => txn,
        };
        if txn.aborted {
            return AllocResult::Abort;
        }
        match self.table.allocate(size, self.align) {
            Some(id) => {
                txn.allocated.push(id);
                AllocResult::Success(encode_address(id, 0))
            }
            None => AllocResult::NoMem,
        }
    }

    /// Marks the segment containing `addr` for release; the segment is
    /// actually freed at commit, after `tx` successfully leaves.
    pub fn free(&self, tx: &mut TxHandle, addr: u64) -> bool {
        let txn = match &mut tx.0 {
            TxHandleInner::ReadOnly => return false,
            TxHandleInner::ReadWrite(txn) => txn,
        };
        if txn.aborted {
            return false;
        }
        let (segment_id, _offset) = decode_address(addr);
        txn.freed.push(segment_id);
        true
    }
}

/// Creates a shared memory region with one first, non-freeable segment of
/// the requested size and alignment. `None` on invalid parameters or
/// allocation failure (the "invalid-region sentinel" of section 6).
pub fn tm_create(size: usize, align: usize) -> Option<Region> {
    Region::new(size, align).ok()
}

/// Destroys a region; callers must guarantee no transaction is still live.
pub fn tm_destroy(_region: Region) {}

pub fn tm_start(region: &Region) -> u64 {
    region.start()
}

pub fn tm_size(region: &Region) -> usize {
    region.size()
}

pub fn tm_align(region: &Region) -> usize {
    region.align()
}

pub fn tm_begin(region: &Region, is_ro: bool) -> Option<TxHandle> {
    Some(region.begin(is_ro))
}

pub fn tm_end(region: &Region, tx: TxHandle) -> bool {
    region.end(tx)
}

pub fn tm_read(region: &Region, tx: &mut TxHandle, src: u64, n: usize, dst: &mut [u8]) -> bool {
    region.read(tx, src, &mut dst[..n])
}

pub fn tm_write(region: &Region, tx: &mut TxHandle, src: &[u8], n: usize, dst: u64) -> bool {
    region.write(tx, &src[..n], dst)
}

pub fn tm_alloc(region: &Region, tx: &mut TxHandle, size: usize) -> AllocResult {
    region.alloc(tx, size)
}

pub fn tm_free(region: &Region, tx: &mut TxHandle, addr: u64) -> bool {
    region.free(tx, addr)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn segment_zero_is_non_freeable_address() {
        let region = Region::new(8, 8).unwrap();
        assert_eq!(region.start(), 1u64 << 48);
        assert_eq!(region.size(), 8);
        assert_eq!(region.align(), 8);
    }

    #[test]
    fn rejects_misaligned_construction() {
        assert_eq!(Region::new(0, 8).unwrap_err(), TmError::InvalidRegion);
        assert_eq!(Region::new(7, 8).unwrap_err(), TmError::InvalidRegion);
        assert_eq!(Region::new(8, 3).unwrap_err(), TmError::InvalidRegion);
    }

    #[test]
    fn fresh_region_reads_zero() {
        let region = Region::new(8, 8).unwrap();
        let mut tx = region.begin(true);
        let mut buf = [0xffu8; 8];
        assert!(region.read(&mut tx, region.start(), &mut buf));
        assert_eq!(buf, [0u8; 8]);
        assert!(region.end(tx));
    }

    #[test]
    fn write_then_read_back() {
        let region = Region::new(8, 8).unwrap();
        let mut tx = region.begin(false);
        assert!(region.write(&mut tx, &[42u8; 8], region.start()));
        assert!(region.end(tx));

        let mut tx2 = region.begin(true);
        let mut buf = [0u8; 8];
        assert!(region.read(&mut tx2, region.start(), &mut buf));
        assert_eq!(buf, [42u8; 8]);
        assert!(region.end(tx2));
    }

    #[test]
    fn alloc_abort_releases_slot_for_reuse() {
        let region = Region::new(8, 8).unwrap();

        let mut tx1 = region.begin(false);
        let res = region.alloc(&mut tx1, 8);
        let addr = match res {
            AllocResult::Success(addr) => addr,
            other => panic!("expected success, got {other:?}"),
        };
        assert!(region.write(&mut tx1, &[7u8; 8], addr));
        if let TxHandleInner::ReadWrite(txn) = &mut tx1.0 {
            txn.aborted = true;
        }
        assert!(!region.end(tx1));

        let mut tx2 = region.begin(false);
        let res2 = region.alloc(&mut tx2, 8);
        assert!(matches!(res2, AllocResult::Success(_)));
        assert!(region.end(tx2));
    }

    #[test]
    fn free_defers_release_until_commit() {
        let region = Region::new(8, 8).unwrap();
        let mut tx1 = region.begin(false);
        let addr = match region.alloc(&mut tx1, 8) {
            AllocResult::Success(addr) => addr,
            other => panic!("expected success, got {other:?}"),
        };
        assert!(region.end(tx1));

        let mut tx2 = region.begin(false);
        assert!(region.free(&mut tx2, addr));
        assert!(region.end(tx2));
    }
}
