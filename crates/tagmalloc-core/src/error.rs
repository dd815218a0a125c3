//! Recoverable allocator errors.
//!
//! Only resource exhaustion and argument validation are recoverable;
//! corruption never reaches this type (see `fatal`).

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The request cannot be satisfied; maps to a null return with
    /// `ENOMEM` at the C boundary.
    #[error("out of memory")]
    OutOfMemory,
    /// Aligned allocation with an alignment above the supported ceiling;
    /// maps to `EINVAL`.
    #[error("invalid alignment")]
    InvalidAlignment,
    /// Tuning value outside the recognized range for its parameter.
    #[error("tuning value out of range")]
    InvalidTuning,
}
