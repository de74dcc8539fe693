//! Error taxonomy for container parsing, decompression and relocation.
//!
//! Structural errors (bad magic, out-of-range reads, malformed compression)
//! abort the parse of the whole container. `UnresolvedSymbol` is the one
//! per-entry failure: the relocator records it in a diagnostics list and
//! keeps going.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NxoError>;

#[derive(Debug, Error)]
pub enum NxoError {
    /// None of the NSO0/KIP1/NRO0 magic signatures matched.
    #[error("not an NSO, NRO or KIP file")]
    UnknownContainerFormat,

    /// A computed read/write index left the valid range during decompression.
    #[error("malformed compressed segment: {0}")]
    MalformedCompression(&'static str),

    /// The MOD0 descriptor magic is absent or unreachable.
    #[error("invalid MOD0 module descriptor")]
    InvalidModuleDescriptor,

    /// A relocation references an external symbol with no resolution.
    /// Recorded per entry by the relocator, never a hard failure.
    #[error("unresolved symbol {name:?} for relocation at 0x{offset:X}")]
    UnresolvedSymbol { offset: u64, name: String },

    /// Heuristically recovered boundaries disagree with declared layout,
    /// or declared segments/sections overlap.
    #[error("layout inconsistency: {0}")]
    LayoutConsistency(String),

    /// A read past the end of the input buffer.
    #[error("truncated input: read of {len} bytes at offset 0x{offset:X} exceeds size 0x{size:X}")]
    Truncated { offset: u64, len: usize, size: usize },
}
