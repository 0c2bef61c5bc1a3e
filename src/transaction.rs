use crate::segment::SegmentId;

/// Identifies a single word inside a single segment; enough information for
/// the commit/rollback pass to find the [`crate::access::AccessCell`] and
/// byte copies it needs without re-decoding an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CellHandle {
    pub segment: SegmentId,
    pub word: u32,
}

/// Per-transaction bookkeeping for a read-write transaction. Read-only
/// transactions carry none of this; they bypass the access controller
/// entirely and are represented by [`crate::region::TxHandleInner::ReadOnly`].
///
/// The three sequences are exactly the `accessed-cells`, `allocated-segments`
/// and `freed-segments` lists of the data model: owned by the transaction,
/// spliced into the region's logs (or discarded, on abort) at `end`, and
/// dropped with the transaction.
pub(crate) struct Transaction {
    pub id: u64,
    pub aborted: bool,
    pub accessed: Vec<CellHandle>,
    pub allocated: Vec<SegmentId>,
    pub freed: Vec<SegmentId>,
}

impl Transaction {
    pub fn new(id: u64) -> Transaction {
        Transaction {
            id,
            aborted: false,
            // Allocated lazily in the sense that these start empty; we don't
            // pre-size them, matching the source's habit of not penalising
            // transactions that touch only a handful of words.
            accessed: Vec::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
        }
    }
}
