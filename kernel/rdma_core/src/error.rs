//! Error vocabularies. `RdmaError` is returned by entry points;
//! `CompletionStatus` (in [`crate::wr`]) is reported through a CQE. The two
//! are kept separate because an error can occur before a WR is ever queued
//! (caller-visible, no CQE) or during executor dispatch (CQE, call has
//! already returned success).

/// Errors surfaced directly to the caller of an entry point. Converts to
/// the negative return codes the syscall shim expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaError {
    /// Null/zero inputs, out-of-range ids, non-power-of-two sizes, or a
    /// memory range crossing a page boundary.
    InvalidArg,
    /// The MR or QP table is full.
    NoSlots,
    /// The caller is not the owner (pointer/handle or pid mismatch).
    NotOwned,
    /// The operation is not legal in the QP's current state.
    BadState,
    /// `deregister` was attempted with `refcount > 0`.
    Busy,
    /// The send queue is full.
    QueueFull,
}

impl From<RdmaError> for i32 {
    fn from(err: RdmaError) -> i32 {
        match err {
            RdmaError::InvalidArg => -1,
            RdmaError::NoSlots => -2,
            RdmaError::NotOwned => -3,
            RdmaError::BadState => -4,
            RdmaError::Busy => -5,
            RdmaError::QueueFull => -6,
        }
    }
}

pub type Result<T> = core::result::Result<T, RdmaError>;
