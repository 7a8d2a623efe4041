//! A Common Trace Format (CTF 1.8) binary trace reader.
//!
//! TSDL metadata is treated as an external collaborator: [`metadata::ast`]
//! defines the AST shape a TSDL lexer/parser would hand to
//! [`metadata::resolve`], which builds the immutable [`traceclass::TraceClass`]
//! graph. [`iterator::MessageIterator`] then walks a [`medium::Medium`]'s
//! packet bytes through [`bfcr::Bfcr`] against that graph, producing the
//! ordered [`message::Message`] stream.

pub use crate::codec::MessageDecoder;
pub use crate::error::{DecodeError, Error, StructuralError};
pub use crate::iterator::{IteratorStatus, MessageIterator, TracerQuirks};
pub use crate::medium::{Medium, ReaderMedium, RequestOutcome, SliceMedium, StreamHandle};
pub use crate::message::{EventRecord, Message, PacketProperties, Value};
pub use crate::metadata::{resolve, Outcome};
pub use crate::traceclass::TraceClass;

pub mod bfcr;
pub mod bitbuffer;
pub mod codec;
pub mod error;
pub mod fieldclass;
pub mod fieldpath;
pub mod iterator;
pub mod medium;
pub mod message;
pub mod metadata;
pub mod stitch;
pub mod storedvalues;
pub mod traceclass;
