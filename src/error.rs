//! Error taxonomy: a `thiserror`-derived `Error` enum split into medium,
//! structural, decode, out-of-memory, and callback variants. Incomplete
//! metadata is deliberately *not* a variant here — it is a distinct,
//! non-error outcome of the semantic pass; see [`crate::metadata::Outcome`].

use crate::traceclass::{EventId, StreamId};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Medium I/O error ({})", .0.kind())]
    Medium(#[from] io::Error),

    #[error("Malformed trace metadata: {0}")]
    Structural(#[from] StructuralError),

    #[error("Malformed trace data: {0}")]
    Decode(#[from] DecodeError),

    #[error("Out of memory while growing a decode buffer")]
    OutOfMemory,

    #[error("Caller callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("Attempted to parse an invalid float size ({0})")]
    InvalidFloatSize(usize),

    #[error("Unsupported field type '{0}' (size {1}, alignment {2})")]
    UnsupportedFieldType(String, usize, usize),

    #[error("Unsupported alignment '{0}'")]
    UnsupportedAlignment(String),

    #[error("Encountered a CTF stream ID ({0}) that's not defined in the trace metadata")]
    UndefinedStreamId(StreamId),

    #[error("Encountered a CTF event ID ({0}) that's not defined in the trace metadata")]
    UndefinedEventId(EventId),
}

impl Error {
    pub(crate) fn unsupported_ft<S: AsRef<str>>(f: S, size: usize, alignment: usize) -> Self {
        Error::UnsupportedFieldType(f.as_ref().to_owned(), size, alignment)
    }

    pub(crate) fn unsupported_alignment<S: AsRef<str>>(f: S) -> Self {
        Error::UnsupportedAlignment(f.as_ref().to_owned())
    }

    pub fn callback<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
        Error::Callback(Box::new(e))
    }
}

/// Failures discovered while building the trace class graph from TSDL.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("duplicate stream class id {0}")]
    DuplicateStreamClassId(StreamId),

    #[error("duplicate event class id {0} in stream class {1}")]
    DuplicateEventClassId(EventId, StreamId),

    #[error("unresolved name '{0}' in scope '{1}'")]
    UnresolvedName(String, &'static str),

    #[error("untagged variant not allowed at type-alias definition site '{0}'")]
    UntaggedVariantAtAliasSite(String),

    #[error("byte order continuity violated while resolving alias '{0}'")]
    IncoherentByteOrder(String),

    #[error("unsupported TSDL version {major}.{minor} (only 1.8 is supported)")]
    UnsupportedVersion { major: u64, minor: u64 },

    #[error("integer size {0} exceeds the supported maximum of 64 bits")]
    IntegerTooWide(u64),

    #[error("alignment {0} is not a power of two")]
    AlignmentNotPowerOfTwo(u64),

    #[error("duplicate enum label '{0}'")]
    DuplicateEnumLabel(String),

    #[error("duplicate struct member '{0}'")]
    DuplicateStructMember(String),

    #[error("variant option '{0}' has no matching label in its tag enum")]
    VariantOptionNotInTagEnum(String),

    #[error("field '{0}' is named like a clock-mapped field but multiple clock classes exist with no explicit mapping")]
    AmbiguousClockMapping(String),

    #[error("field '{0}' declares byte_order = native but no trace default byte order is known yet")]
    DefaultByteOrderUnknown(String),
}

/// Failures discovered while decoding packet bytes (BFCR and the message
/// iterator).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(
        "byte order continuity violated at bit offset {bit_offset}: previous basic field ended \
         {previous:?}, next begins mid-byte as {new:?}"
    )]
    ByteOrderContinuity {
        bit_offset: u64,
        previous: crate::fieldclass::ByteOrder,
        new: crate::fieldclass::ByteOrder,
    },

    #[error("sequence length field decoded to a negative value")]
    NegativeSequenceLength,

    #[error("variant tag value did not match any declared option")]
    VariantTagNoMatch,

    #[error("packet switch attempted at a non-byte-aligned bit cursor")]
    UnalignedPacketSwitch,

    #[error("invalid CTF magic number: expected {expected:#010x}, found {found:#010x}")]
    InvalidMagicNumber { expected: u32, found: u64 },

    #[error("unsupported float size; only 32 and 64 bits are supported")]
    UnsupportedFloatSize,

    #[error("internal invariant violated: {0}")]
    InvariantViolated(&'static str),

    #[error("this iterator has already returned an error and cannot continue")]
    AlreadyErrored,
}
