//! A serialisable, abortable software transactional memory engine over a
//! dynamically allocated, word-addressable heap.
//!
//! A [`Region`] is a shared virtual address space divided into segments.
//! Each segment stores two physical copies of its bytes (a *readable* copy
//! and a *writeable* copy) and one access-control cell per word.
//! Transactions are grouped into epochs by an internal batcher: every
//! transaction concurrently "in" the region commits or aborts together when
//! the last of them leaves, and the resulting commit pass (copying every
//! written word's bytes from its writeable copy into its readable copy)
//! runs single-threaded, with no other transaction in flight, so it never
//! needs to synchronise against a reader or writer.
//!
//! The public surface comes in two layers that forward to the same
//! internals:
//!
//! - An idiomatic Rust API ([`Region`]'s methods, taking `&mut TxHandle`)
//!   for embedding the engine directly in a Rust program.
//! - A set of free functions (`tm_create`, `tm_begin`, `tm_read`, ...)
//!   shaped after the C calling convention this engine's design was
//!   distilled from, for callers that want that exact surface.
//!
//! ```
//! use epoch_stm::Region;
//!
//! let region = Region::new(64, 8).unwrap();
//! let mut tx = region.begin(false);
//! let word = [7u8; 8];
//! assert!(region.write(&mut tx, &word, region.start()));
//! assert!(region.end(tx));
//!
//! let mut tx = region.begin(true);
//! let mut buf = [0u8; 8];
//! assert!(region.read(&mut tx, region.start(), &mut buf));
//! assert_eq!(buf, word);
//! assert!(region.end(tx));
//! ```

mod access;
mod batcher;
mod diagnostics;
mod error;
mod region;
mod segment;
mod sync;
mod transaction;

pub use error::TmError;
pub use region::{
    tm_align, tm_alloc, tm_begin, tm_create, tm_destroy, tm_end, tm_free, tm_read, tm_size,
    tm_start, tm_write, AllocResult, Region, RegionConfig, TxHandle, MAX_SEGMENTS,
};
