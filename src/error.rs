use std::fmt;

/// Failure kinds surfaced by the Rust-facing constructor/allocator paths.
///
/// The hot-path `tm_*` operations keep their historical boolean/enum return
/// values (see [`crate::AllocResult`]); `TmError` is only used where this
/// crate's own idiomatic surface (`Region::with_config`) needs a real
/// `Result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmError {
    /// A segment or control-array allocation failed.
    OutOfMemory,
    /// `size`/`align` did not satisfy the region's construction contract
    /// (`size > 0`, `align` a power of two, `size` a multiple of `align`).
    InvalidRegion,
    /// The access controller refused an operation; the owning transaction
    /// must abort. Not constructed by this crate today (contention is
    /// reported via the `tm_read`/`tm_write` boolean return), but kept as
    /// part of the error surface for embedders that want to convert a failed
    /// read/write into a `Result` of their own.
    Contention,
}

impl fmt::Display for TmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TmError::OutOfMemory => write!(f, "out of memory"),
            TmError::InvalidRegion => write!(f, "invalid region parameters"),
            TmError::Contention => write!(f, "transaction lost contention on a shared word"),
        }
    }
}

impl std::error::Error for TmError {}
