//! The trace class graph: the immutable description of a trace's
//! structure, built once by [`crate::metadata`] and borrowed (never owned)
//! by the message iterator for the life of decoding.

use crate::fieldclass::{ClockClassIndex, Field};
use fxhash::FxHashMap;
use internment::Intern;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type StreamId = u64;
pub type EventId = u64;

/// Timestamp in clock cycles, pre-reconstruction.
pub type Timestamp = u64;

pub type EventCount = u64;

pub type SequenceNumber = u64;

pub const CTF_MAGIC_NUMBER: u32 = 0xC1FC_1FC1;

/// An environment value as stored in the trace's `env` TSDL block — always
/// one of these two kinds.
#[derive(Clone, Debug)]
pub enum EnvironmentValue {
    Integer(i64),
    String(Intern<String>),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ClockOffset {
    pub seconds: i64,
    pub cycles: u64,
}

#[derive(Clone, Debug)]
pub struct ClockClass {
    pub name: Intern<String>,
    pub frequency: u64,
    pub precision: u64,
    pub offset: ClockOffset,
    pub uuid: Option<Uuid>,
    pub is_absolute: bool,
}

impl ClockClass {
    /// A 1 GHz clock synthesized when TSDL declares none and an
    /// auto-mappable `timestamp` field needs one.
    pub fn implicit() -> Self {
        Self {
            name: Intern::new("default".to_owned()),
            frequency: 1_000_000_000,
            precision: 0,
            offset: ClockOffset { seconds: 0, cycles: 0 },
            uuid: None,
            is_absolute: false,
        }
    }
}

/// Which optional clock-snapshot fields a stream class's scopes carry, so
/// the message iterator knows whether to look for (and emit discarded-*
/// messages from) them.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct StreamFlags {
    pub has_packet_begin_time: bool,
    pub has_packet_end_time: bool,
    pub has_discarded_events_snapshot: bool,
    pub has_packet_counter_snapshot: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    DebugSystem,
    DebugProgram,
    DebugProcess,
    DebugModule,
    DebugUnit,
    DebugFunction,
    DebugLine,
    Debug,
    Other(i64),
}

#[derive(Clone, Debug)]
pub struct EventClass {
    pub id: EventId,
    pub name: Intern<String>,
    pub emf_uri: Option<Intern<String>>,
    pub log_level: Option<LogLevel>,
    pub specific_context: Option<Field>,
    pub payload: Option<Field>,
}

#[derive(Clone, Debug)]
pub struct StreamClass {
    pub id: StreamId,
    pub packet_context: Option<Field>,
    pub event_header: Option<Field>,
    pub event_common_context: Option<Field>,
    /// Indexed by [`EventClass::id`]; sparse ids are stored as `None` holes.
    pub event_classes: Vec<Option<EventClass>>,
    pub default_clock_class: Option<ClockClassIndex>,
    pub flags: StreamFlags,
}

impl StreamClass {
    pub fn event_class(&self, id: EventId) -> Option<&EventClass> {
        self.event_classes.get(id as usize).and_then(|e| e.as_ref())
    }
}

#[derive(Clone, Debug)]
pub struct TraceClass {
    pub name: Option<Intern<String>>,
    pub major: u64,
    pub minor: u64,
    pub uuid: Option<Uuid>,
    pub default_byte_order: crate::fieldclass::ByteOrder,
    pub packet_header: Option<Field>,
    /// Indexed by [`StreamClass::id`]; sparse ids are stored as `None` holes.
    pub stream_classes: Vec<Option<StreamClass>>,
    pub environment: BTreeMap<String, EnvironmentValue>,
    pub clock_classes: Vec<ClockClass>,
    pub stored_value_count: usize,
}

impl TraceClass {
    pub fn stream_class(&self, id: StreamId) -> Option<&StreamClass> {
        self.stream_classes.get(id as usize).and_then(|s| s.as_ref())
    }

    pub fn clock_class(&self, index: ClockClassIndex) -> Option<&ClockClass> {
        self.clock_classes.get(index)
    }

    /// Lazily-memoizable name → index lookup, avoiding a linear scan over
    /// every clock class on every lookup.
    pub fn clock_class_index_by_name(&self) -> FxHashMap<&str, ClockClassIndex> {
        self.clock_classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect()
    }
}
