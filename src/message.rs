//! Output messages produced by [`crate::iterator`].

use crate::traceclass::{EventCount, EventId, SequenceNumber, StreamId};
use internment::Intern;

/// A decoded scalar or string value, materialized only for fields whose
/// field class has `in_ir = true`.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    UnsignedInt(u64),
    SignedInt(i64),
    Float(f64),
    String(String),
    Struct(Vec<(Intern<String>, Value)>),
    Array(Vec<Value>),
}

#[derive(Clone, Debug, Default)]
pub struct PacketProperties {
    pub total_size_bits: Option<u64>,
    pub content_size_bits: Option<u64>,
    pub stream_class_id: Option<StreamId>,
    pub data_stream_id: Option<u64>,
    pub discarded_events_snapshot: Option<EventCount>,
    pub packets_snapshot: Option<SequenceNumber>,
    pub begin_clock: Option<u64>,
    pub end_clock: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct EventRecord {
    pub stream_id: StreamId,
    pub event_id: EventId,
    pub name: Intern<String>,
    pub default_clock_snapshot: Option<u64>,
    pub common_context: Option<Value>,
    pub specific_context: Option<Value>,
    pub payload: Option<Value>,
}

/// One message in the ordered stream the iterator produces.
#[derive(Clone, Debug)]
pub enum Message {
    StreamBeginning { stream_id: StreamId },
    PacketBeginning { stream_id: StreamId, properties: PacketProperties },
    Event(EventRecord),
    DiscardedEvents { stream_id: StreamId, count: EventCount, begin_clock: Option<u64>, end_clock: Option<u64> },
    DiscardedPackets { stream_id: StreamId, count: SequenceNumber, begin_clock: Option<u64>, end_clock: Option<u64> },
    PacketEnd { stream_id: StreamId, end_clock: Option<u64> },
    StreamEnd { stream_id: StreamId },
    /// Emitted instead of blocking when a non-seekable medium reports it
    /// has no data right now but may later — `next()`'s `Again` status
    /// surfaced as a message so callers polling an async source don't need
    /// a separate out-of-band signal.
    MessageIteratorInactivity,
}
