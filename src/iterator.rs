//! The message iterator: a packet/stream state machine layered on
//! [`crate::bfcr::Bfcr`], turning a byte-level medium and an immutable
//! [`TraceClass`] into an ordered [`Message`] sequence.
//!
//! Each nested dynamic scope (packet header, packet context, event header,
//! event common context, event specific context, event payload) is a
//! separate BFCR root; this module is responsible for chaining those roots
//! across one continuous bitstream, tracking the stored-values table, the
//! running reconstructed clock, and per-packet snapshot bookkeeping.

use crate::bfcr::{Bfcr, Callbacks, Status};
use crate::error::{DecodeError, Error};
use crate::fieldclass::{Field, FieldClass, IntFieldClass, Meaning};
use crate::medium::{Medium, RequestOutcome};
use crate::message::{EventRecord, Message, PacketProperties, Value};
use crate::storedvalues::StoredValues;
use crate::traceclass::{EventClass, EventId, StreamClass, StreamId, TraceClass, CTF_MAGIC_NUMBER};
use bytes::Bytes;
use internment::Intern;
use tracing::{debug, warn};

const DEFAULT_CHUNK_BYTES: usize = 4096;

/// Status a caller of [`MessageIterator::next`] reacts to: ready/no-data-yet
/// /exhausted, with the error case instead surfaced as a `Result` error at
/// this layer, idiomatic Rust's usual swap for a status code.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IteratorStatus {
    Ok,
    Again,
    End,
}

/// Tracer-specific decode adjustments. Which quirks apply isn't something
/// this crate auto-detects from the byte stream — real-world tracers leave
/// this undocumented; callers pick based on which tracer produced the
/// trace.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TracerQuirks {
    /// barectf emits the packet-begin timestamp field *after* the first
    /// event rather than before it; delay `PacketBeginning` until the first
    /// event is decoded, then clamp its clock down to the event's if needed.
    pub barectf_event_before_packet: bool,
    /// LTTng crash traces may have a nonzero packet-begin clock followed by
    /// a zeroed-out packet-end clock written by a tracer that was killed
    /// mid-write; suppress that bogus zero instead of regressing the clock.
    pub lttng_crash: bool,
    /// LTTng may emit an event after a packet's final clock snapshot was
    /// already taken, leaving the snapshot earlier than the last event's
    /// reconstructed clock; suppress the snapshot rather than let the clock
    /// run backwards.
    pub lttng_event_after_packet: bool,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    Init,
    SwitchPacket,
    DScopePacketHeader,
    AfterPacketHeader,
    DScopePacketContext,
    AfterPacketContext,
    EmitStreamBeginning,
    CheckEmitDiscardedEvents,
    CheckEmitDiscardedPackets,
    EmitPacketBeginning,
    DScopeEventHeader,
    AfterEventHeader,
    DScopeEventCommonContext,
    DScopeEventSpecContext,
    DScopeEventPayload,
    EmitEvent,
    EmitPacketEnd,
    SkipPacketPadding,
    CheckEmitStreamEnd,
    EmitStreamEnd,
    Done,
}

enum StepResult {
    Message(Message),
    Finished,
}

enum RootOutcome {
    Completed,
    /// The medium had no bytes at all when this root began — only a
    /// legitimate outcome at a packet boundary on an unbounded packet/trace.
    EndOfMedium,
}

/// Snapshot fields captured from packet-header/packet-context Int fields by
/// their canonical [`Meaning`]. Reset at the start of every packet; copied
/// to `prev_packet_snapshots` once the packet's context has been read.
#[derive(Copy, Clone, Debug, Default)]
struct Snapshots {
    stream_class_id: Option<u64>,
    data_stream_id: Option<u64>,
    packet_total_size: Option<u64>,
    packet_content_size: Option<u64>,
    packet_begin_time: Option<u64>,
    packet_end_time: Option<u64>,
    discarded_events: Option<u64>,
    packets_snapshot: Option<u64>,
}

/// Running trackers the named tracer quirks consult, independent of the
/// per-packet [`Snapshots`] (these persist across packet boundaries).
#[derive(Copy, Clone, Debug, Default)]
struct QuirkState {
    packet_begin_raw: Option<u64>,
    last_event_clock: Option<u64>,
}

/// Accumulates a [`Value`] tree across BFCR's scalar/compound callbacks for
/// one root decode, mirroring the shape of the field-class tree being
/// walked without needing BFCR itself to know about message values.
#[derive(Default)]
struct ValueBuilder {
    stack: Vec<BuildFrame>,
    root_value: Option<Value>,
    string_scratch: String,
}

enum BuildFrame {
    Struct { member_names: Vec<Intern<String>>, cursor: usize, values: Vec<(Intern<String>, Value)> },
    Array { values: Vec<Value> },
    Variant { pending: Option<Value> },
    /// A field with `in_ir = false`: its whole subtree is decoded (for
    /// structural/producer side effects) but no value is kept.
    Skip,
}

impl ValueBuilder {
    fn reset(&mut self) {
        self.stack.clear();
        self.root_value = None;
        self.string_scratch.clear();
    }

    fn take(&mut self) -> Option<Value> {
        self.root_value.take()
    }

    fn push_child(&mut self, value: Option<Value>) {
        match self.stack.last_mut() {
            None => {
                if let Some(v) = value {
                    self.root_value = Some(v);
                }
            }
            Some(BuildFrame::Struct { member_names, cursor, values }) => {
                let name = member_names[*cursor];
                *cursor += 1;
                if let Some(v) = value {
                    values.push((name, v));
                }
            }
            Some(BuildFrame::Array { values }) => {
                if let Some(v) = value {
                    values.push(v);
                }
            }
            Some(BuildFrame::Variant { pending }) => *pending = value,
            Some(BuildFrame::Skip) => {}
        }
    }

    fn record_scalar(&mut self, field: &Field, value: Value) {
        let v = field.in_ir.then_some(value);
        self.push_child(v);
    }

    fn string_begin(&mut self, _field: &Field) {
        self.string_scratch.clear();
    }

    fn string_chunk(&mut self, bytes: &[u8]) {
        self.string_scratch.push_str(&String::from_utf8_lossy(bytes));
    }

    fn string_end(&mut self, field: &Field) {
        let s = std::mem::take(&mut self.string_scratch);
        self.record_scalar(field, Value::String(s));
    }

    fn compound_begin(&mut self, field: &Field) {
        if !field.in_ir {
            self.stack.push(BuildFrame::Skip);
            return;
        }
        let frame = match &field.class {
            FieldClass::Struct(s) => BuildFrame::Struct {
                member_names: s.members.iter().map(|m| m.name).collect(),
                cursor: 0,
                values: Vec::with_capacity(s.members.len()),
            },
            FieldClass::StaticArray(_) | FieldClass::DynamicArray(_) => BuildFrame::Array { values: Vec::new() },
            FieldClass::Variant(_) => BuildFrame::Variant { pending: None },
            _ => unreachable!("compound_begin only fires for compound field classes"),
        };
        self.stack.push(frame);
    }

    fn compound_end(&mut self, _field: &Field) {
        let frame = self.stack.pop().expect("compound_end without a matching compound_begin");
        let value = match frame {
            BuildFrame::Struct { values, .. } => Some(Value::Struct(values)),
            BuildFrame::Array { values } => Some(Value::Array(values)),
            BuildFrame::Variant { pending } => pending,
            BuildFrame::Skip => None,
        };
        self.push_child(value);
    }
}

fn int_meta(class: &FieldClass) -> Option<&IntFieldClass> {
    match class {
        FieldClass::Int(i) => Some(i),
        FieldClass::Enum(e) => Some(&e.underlying),
        _ => None,
    }
}

/// Whatever would make a 64-bit running clock consistent with a newly
/// decoded `bits`-wide sample: widen by detecting a single wraparound of
/// the low `bits` bits.
fn reconstruct(current: u64, value: u64, bits: u8) -> u64 {
    if bits >= 64 {
        return value;
    }
    let mask = (1u64 << bits) - 1;
    let masked = current & mask;
    let base = if value < masked { current.wrapping_add(mask + 1) } else { current };
    (base & !mask) | value
}

/// Borrows exactly the iterator fields BFCR callbacks need to mutate,
/// leaving `bfcr`/`medium` free for the caller to hold mutably at the same
/// time (disjoint field borrows, not a `&mut self` method receiver).
struct DecodeCallbacks<'a, 'cls> {
    stored_values: &'a mut StoredValues,
    builder: &'a mut ValueBuilder,
    snapshots: &'a mut Snapshots,
    default_clock_snapshot: &'a mut u64,
    quirks: &'a mut QuirkState,
    quirk_config: TracerQuirks,
    event_class_id: &'a mut Option<u64>,
    _trace: &'cls TraceClass,
}

impl<'a, 'cls> DecodeCallbacks<'a, 'cls> {
    fn observe_int(&mut self, raw: u64, field: &Field) -> Result<(), Error> {
        let Some(ic) = int_meta(&field.class) else { return Ok(()) };
        if let Some(idx) = ic.stored_value_index {
            self.stored_values.set(idx, raw);
        }
        if ic.mapped_clock_class.is_some() {
            self.apply_clock_field(raw, ic.size, ic.meaning);
        }
        match ic.meaning {
            Some(Meaning::EventClassId) => *self.event_class_id = Some(raw),
            Some(Meaning::StreamClassId) => self.snapshots.stream_class_id = Some(raw),
            Some(Meaning::DataStreamId) => self.snapshots.data_stream_id = Some(raw),
            Some(Meaning::PacketTotalSize) => self.snapshots.packet_total_size = Some(raw),
            Some(Meaning::PacketContentSize) => self.snapshots.packet_content_size = Some(raw),
            Some(Meaning::DiscardedEventCounterSnapshot) => self.snapshots.discarded_events = Some(raw),
            Some(Meaning::PacketCounterSnapshot) => self.snapshots.packets_snapshot = Some(raw),
            Some(Meaning::Magic) if raw != CTF_MAGIC_NUMBER as u64 => {
                return Err(DecodeError::InvalidMagicNumber { expected: CTF_MAGIC_NUMBER, found: raw }.into());
            }
            // Handled in apply_clock_field (PacketBeginTime/PacketEndTime), or
            // not tracked at all (Uuid isn't surfaced in PacketProperties; this
            // crate has no trace-level UUID to compare a packet header's
            // against, matching the original decoder's own scope).
            _ => {}
        }
        Ok(())
    }

    fn apply_clock_field(&mut self, raw: u64, bits: u8, meaning: Option<Meaning>) {
        let candidate = reconstruct(*self.default_clock_snapshot, raw, bits);

        let crash_quirk = self.quirk_config.lttng_crash
            && meaning == Some(Meaning::PacketEndTime)
            && self.quirks.packet_begin_raw.is_some_and(|b| b != 0)
            && raw == 0;
        let regression_quirk = self.quirk_config.lttng_event_after_packet
            && meaning == Some(Meaning::PacketEndTime)
            && self.quirks.last_event_clock.is_some_and(|last| candidate < last);
        let suppressed = crash_quirk || regression_quirk;

        if suppressed {
            warn!(raw, candidate, crash_quirk, regression_quirk, "quirk: suppressing bogus packet-end clock snapshot");
        }

        if !suppressed {
            *self.default_clock_snapshot = candidate;
        }

        match meaning {
            Some(Meaning::PacketBeginTime) => {
                self.quirks.packet_begin_raw = Some(raw);
                self.snapshots.packet_begin_time = Some(candidate);
            }
            Some(Meaning::PacketEndTime) => {
                self.snapshots.packet_end_time = (!suppressed).then_some(candidate);
            }
            _ => {
                if !suppressed {
                    self.quirks.last_event_clock = Some(candidate);
                }
            }
        }
    }
}

impl<'a, 'cls> Callbacks for DecodeCallbacks<'a, 'cls> {
    fn unsigned_int(&mut self, value: u64, field: &Field) -> Result<(), Error> {
        self.observe_int(value, field)?;
        self.builder.record_scalar(field, Value::UnsignedInt(value));
        Ok(())
    }

    fn signed_int(&mut self, value: i64, field: &Field) -> Result<(), Error> {
        self.observe_int(value as u64, field)?;
        self.builder.record_scalar(field, Value::SignedInt(value));
        Ok(())
    }

    fn float(&mut self, value: f64, field: &Field) -> Result<(), Error> {
        self.builder.record_scalar(field, Value::Float(value));
        Ok(())
    }

    fn string_begin(&mut self, field: &Field) -> Result<(), Error> {
        self.builder.string_begin(field);
        Ok(())
    }

    fn string(&mut self, bytes: &[u8], _field: &Field) -> Result<(), Error> {
        self.builder.string_chunk(bytes);
        Ok(())
    }

    fn string_end(&mut self, field: &Field) -> Result<(), Error> {
        self.builder.string_end(field);
        Ok(())
    }

    fn compound_begin(&mut self, field: &Field) -> Result<(), Error> {
        self.builder.compound_begin(field);
        Ok(())
    }

    fn compound_end(&mut self, field: &Field) -> Result<(), Error> {
        self.builder.compound_end(field);
        Ok(())
    }

    fn get_sequence_length(&mut self, field: &Field) -> Result<i64, Error> {
        let FieldClass::DynamicArray(a) = &field.class else {
            return Err(DecodeError::InvariantViolated("get_sequence_length on a non-array field").into());
        };
        let (_, idx) = a
            .length_ref
            .resolved
            .as_ref()
            .ok_or(DecodeError::InvariantViolated("sequence length never resolved"))?;
        Ok(self.stored_values.get_signed(*idx))
    }

    fn borrow_variant_selected_index(&mut self, field: &Field) -> Result<Option<usize>, Error> {
        let FieldClass::Variant(v) = &field.class else {
            return Err(DecodeError::InvariantViolated("borrow_variant_selected_index on a non-variant field").into());
        };
        let (_, idx) = v
            .tag
            .resolved
            .as_ref()
            .ok_or(DecodeError::InvariantViolated("variant tag never resolved"))?;
        Ok(v.range_table.select(self.stored_values.get_signed(*idx)))
    }
}

/// Drives one trace through its packet/stream/event scopes, producing a
/// well-ordered [`Message`] sequence. Owns all per-decode state; the trace
/// class graph is only borrowed.
pub struct MessageIterator<'cls, M> {
    trace: &'cls TraceClass,
    medium: M,
    bfcr: Bfcr<'cls>,
    stored_values: StoredValues,
    builder: ValueBuilder,
    quirks: QuirkState,
    quirk_config: TracerQuirks,
    errored: bool,

    state: State,
    pending_leftover: Option<Bytes>,
    pending_offset_bits: u64,
    packet_bit_cursor: u64,
    default_clock_snapshot: u64,

    stream_class: Option<&'cls StreamClass>,
    event_class: Option<&'cls EventClass>,
    event_class_id: Option<u64>,

    snapshots: Snapshots,
    prev_packet_snapshots: Snapshots,
    stream_beginning_emitted: bool,
    current_stream_id: StreamId,

    packet_properties: PacketProperties,
    pending_packet_beginning: Option<Message>,
    pending_after_packet_beginning: Option<Message>,
    first_event_in_packet: bool,

    common_context_value: Option<Value>,
    specific_context_value: Option<Value>,
    payload_value: Option<Value>,
}

impl<'cls, M: Medium> MessageIterator<'cls, M> {
    pub fn new(trace: &'cls TraceClass, medium: M) -> Self {
        Self::with_quirks(trace, medium, TracerQuirks::default())
    }

    pub fn with_quirks(trace: &'cls TraceClass, medium: M, quirk_config: TracerQuirks) -> Self {
        Self {
            trace,
            medium,
            bfcr: Bfcr::new(),
            stored_values: StoredValues::new(trace.stored_value_count),
            builder: ValueBuilder::default(),
            quirks: QuirkState::default(),
            quirk_config,
            errored: false,
            state: State::Init,
            pending_leftover: None,
            pending_offset_bits: 0,
            packet_bit_cursor: 0,
            default_clock_snapshot: 0,
            stream_class: None,
            event_class: None,
            event_class_id: None,
            snapshots: Snapshots::default(),
            prev_packet_snapshots: Snapshots::default(),
            stream_beginning_emitted: false,
            current_stream_id: 0,
            packet_properties: PacketProperties::default(),
            pending_packet_beginning: None,
            pending_after_packet_beginning: None,
            first_event_in_packet: true,
            common_context_value: None,
            specific_context_value: None,
            payload_value: None,
        }
    }

    /// Fills up to `max` messages, stopping early on `Again`/`End`.
    pub fn next(&mut self, max: usize) -> Result<(Vec<Message>, IteratorStatus), Error> {
        if self.errored {
            return Err(DecodeError::AlreadyErrored.into());
        }
        let mut out = Vec::with_capacity(max.min(16));
        loop {
            if out.len() >= max {
                return Ok((out, IteratorStatus::Ok));
            }
            match self.step() {
                Ok(Some(StepResult::Message(m))) => out.push(m),
                Ok(Some(StepResult::Finished)) => return Ok((out, IteratorStatus::End)),
                Ok(None) => {}
                Err(e) => {
                    self.errored = true;
                    return Err(e);
                }
            }
        }
    }

    /// Only valid when the medium supports it; re-enters `SwitchPacket` at
    /// the given byte offset.
    pub fn seek(&mut self, byte_offset: u64) -> Result<(), Error> {
        self.medium.seek(byte_offset)?;
        self.bfcr = Bfcr::new();
        self.pending_leftover = None;
        self.pending_offset_bits = 0;
        self.packet_bit_cursor = 0;
        self.state = State::SwitchPacket;
        Ok(())
    }

    pub fn can_seek_beginning(&self) -> bool {
        self.medium.can_seek_beginning()
    }

    /// Drives the machine up to (but not through) `EmitPacketBeginning` and
    /// reports the packet's properties without consuming it; a subsequent
    /// `next()` call replays the same transitions and emits normally.
    pub fn get_packet_properties(&mut self) -> Result<PacketProperties, Error> {
        loop {
            match self.state {
                State::EmitStreamBeginning
                | State::CheckEmitDiscardedEvents
                | State::CheckEmitDiscardedPackets
                | State::EmitPacketBeginning
                | State::Done => return Ok(self.packet_properties.clone()),
                _ => {
                    self.step()?;
                }
            }
        }
    }

    fn callbacks(&mut self) -> DecodeCallbacks<'_, 'cls> {
        DecodeCallbacks {
            stored_values: &mut self.stored_values,
            builder: &mut self.builder,
            snapshots: &mut self.snapshots,
            default_clock_snapshot: &mut self.default_clock_snapshot,
            quirks: &mut self.quirks,
            quirk_config: self.quirk_config,
            event_class_id: &mut self.event_class_id,
            _trace: self.trace,
        }
    }

    /// Decodes one field-class root to completion, requesting more bytes
    /// from the medium whenever BFCR suspends. `allow_end_of_medium` permits
    /// interpreting a completely empty first read as the legitimate end of
    /// an unbounded trace/packet rather than a truncation error.
    fn drive_root(&mut self, root: &'cls Field, allow_end_of_medium: bool) -> Result<RootOutcome, Error> {
        self.builder.reset();
        let mut current_buf = self.pending_leftover.take().unwrap_or_default();
        let mut offset_bits = self.pending_offset_bits;
        let mut first_call = true;

        loop {
            let (bits, status) = {
                let mut cb = self.callbacks();
                if first_call {
                    self.bfcr.start(root, current_buf.clone(), offset_bits, self.packet_bit_cursor, &mut cb)?
                } else {
                    self.bfcr.continue_(current_buf.clone(), &mut cb)?
                }
            };
            self.packet_bit_cursor += bits;

            if status == Status::Done {
                let consumed_bytes = (bits / 8) as usize;
                self.pending_offset_bits = bits % 8;
                self.pending_leftover = Some(current_buf.slice(consumed_bytes.min(current_buf.len())..));
                return Ok(RootOutcome::Completed);
            }

            match self.medium.request_bytes(DEFAULT_CHUNK_BYTES)? {
                RequestOutcome::Data(b) => {
                    current_buf = b;
                    offset_bits = 0;
                    first_call = false;
                }
                RequestOutcome::Eof => {
                    if allow_end_of_medium && first_call && current_buf.is_empty() {
                        return Ok(RootOutcome::EndOfMedium);
                    }
                    return Err(DecodeError::InvariantViolated("medium ended mid-field").into());
                }
            }
        }
    }

    /// Consumes `bits` of inter-packet padding directly from the buffered
    /// byte stream, requesting more from the medium as needed.
    fn skip_bits(&mut self, mut bits: u64) -> Result<(), Error> {
        while bits > 0 {
            let have = self
                .pending_leftover
                .as_ref()
                .map_or(0, |b| (b.len() as u64) * 8 - self.pending_offset_bits);
            if have == 0 {
                match self.medium.request_bytes(DEFAULT_CHUNK_BYTES)? {
                    RequestOutcome::Data(b) => {
                        self.pending_leftover = Some(b);
                        self.pending_offset_bits = 0;
                        continue;
                    }
                    RequestOutcome::Eof => {
                        return Err(DecodeError::InvariantViolated("medium ended while skipping packet padding").into())
                    }
                }
            }
            let take = have.min(bits);
            let buf = self.pending_leftover.take().unwrap();
            let total_bits_in_buf = self.pending_offset_bits + take;
            let consumed_bytes = (total_bits_in_buf / 8) as usize;
            self.pending_offset_bits = total_bits_in_buf % 8;
            self.pending_leftover = Some(buf.slice(consumed_bytes.min(buf.len())..));
            self.packet_bit_cursor += take;
            bits -= take;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<Option<StepResult>, Error> {
        if let Some(m) = self.pending_after_packet_beginning.take() {
            return Ok(Some(StepResult::Message(m)));
        }

        match self.state {
            State::Init => {
                self.stored_values = StoredValues::new(self.trace.stored_value_count);
                self.state = State::SwitchPacket;
                Ok(None)
            }

            State::SwitchPacket => {
                self.medium.switch_packet()?;
                self.packet_bit_cursor = 0;
                self.snapshots = Snapshots::default();
                self.quirks.packet_begin_raw = None;
                self.first_event_in_packet = true;
                self.state = State::DScopePacketHeader;
                Ok(None)
            }

            State::DScopePacketHeader => match self.trace.packet_header.as_ref() {
                Some(field) => match self.drive_root(field, true)? {
                    RootOutcome::Completed => {
                        self.state = State::AfterPacketHeader;
                        Ok(None)
                    }
                    RootOutcome::EndOfMedium => {
                        self.state = State::CheckEmitStreamEnd;
                        Ok(None)
                    }
                },
                None => {
                    self.state = State::AfterPacketHeader;
                    Ok(None)
                }
            },

            State::AfterPacketHeader => {
                let id = self.snapshots.stream_class_id.unwrap_or(0);
                self.current_stream_id = id;
                self.stream_class = Some(self.trace.stream_class(id).ok_or(Error::UndefinedStreamId(id))?);
                self.state = State::DScopePacketContext;
                Ok(None)
            }

            State::DScopePacketContext => {
                let sc = self.stream_class.expect("stream class set by AfterPacketHeader");
                match sc.packet_context.as_ref() {
                    Some(field) => match self.drive_root(field, false)? {
                        RootOutcome::Completed => {
                            self.state = State::AfterPacketContext;
                            Ok(None)
                        }
                        RootOutcome::EndOfMedium => unreachable!("EndOfMedium is only allowed at a packet boundary"),
                    },
                    None => {
                        self.state = State::AfterPacketContext;
                        Ok(None)
                    }
                }
            }

            State::AfterPacketContext => {
                self.packet_properties = PacketProperties {
                    total_size_bits: self.snapshots.packet_total_size,
                    content_size_bits: self.snapshots.packet_content_size,
                    stream_class_id: Some(self.current_stream_id),
                    data_stream_id: self.snapshots.data_stream_id,
                    discarded_events_snapshot: self.snapshots.discarded_events,
                    packets_snapshot: self.snapshots.packets_snapshot,
                    begin_clock: self.snapshots.packet_begin_time,
                    end_clock: self.snapshots.packet_end_time,
                };
                debug!(
                    stream_id = self.current_stream_id,
                    total_size = ?self.packet_properties.total_size_bits,
                    content_size = ?self.packet_properties.content_size_bits,
                    "decoded packet context"
                );
                self.state = if self.stream_beginning_emitted {
                    State::CheckEmitDiscardedEvents
                } else {
                    State::EmitStreamBeginning
                };
                Ok(None)
            }

            State::EmitStreamBeginning => {
                self.stream_beginning_emitted = true;
                self.state = State::CheckEmitDiscardedEvents;
                Ok(Some(StepResult::Message(Message::StreamBeginning { stream_id: self.current_stream_id })))
            }

            State::CheckEmitDiscardedEvents => {
                let sc = self.stream_class.expect("stream class set by AfterPacketHeader");
                let cur = self.snapshots.discarded_events.unwrap_or(0);
                let prev = self.prev_packet_snapshots.discarded_events.unwrap_or(0);
                self.state = State::CheckEmitDiscardedPackets;
                if sc.flags.has_discarded_events_snapshot && cur > prev {
                    Ok(Some(StepResult::Message(Message::DiscardedEvents {
                        stream_id: self.current_stream_id,
                        count: cur - prev,
                        begin_clock: self.prev_packet_snapshots.packet_end_time,
                        end_clock: self.snapshots.packet_begin_time,
                    })))
                } else {
                    Ok(None)
                }
            }

            State::CheckEmitDiscardedPackets => {
                let sc = self.stream_class.expect("stream class set by AfterPacketHeader");
                self.state = State::EmitPacketBeginning;
                let gap = match (self.snapshots.packets_snapshot, self.prev_packet_snapshots.packets_snapshot) {
                    (Some(cur), Some(prev)) if cur.saturating_sub(prev) > 1 => Some(cur - prev - 1),
                    _ => None,
                };
                if sc.flags.has_packet_counter_snapshot {
                    if let Some(count) = gap {
                        return Ok(Some(StepResult::Message(Message::DiscardedPackets {
                            stream_id: self.current_stream_id,
                            count,
                            begin_clock: self.prev_packet_snapshots.packet_end_time,
                            end_clock: self.snapshots.packet_begin_time,
                        })));
                    }
                }
                Ok(None)
            }

            State::EmitPacketBeginning => {
                self.state = State::DScopeEventHeader;
                let msg = Message::PacketBeginning {
                    stream_id: self.current_stream_id,
                    properties: self.packet_properties.clone(),
                };
                if self.quirk_config.barectf_event_before_packet {
                    warn!(
                        stream_id = self.current_stream_id,
                        "quirk barectf_event_before_packet: holding packet-beginning for the first event's clock"
                    );
                    self.pending_packet_beginning = Some(msg);
                    Ok(None)
                } else {
                    Ok(Some(StepResult::Message(msg)))
                }
            }

            State::DScopeEventHeader => {
                if let Some(content_bits) = self.packet_properties.content_size_bits {
                    if self.packet_bit_cursor >= content_bits {
                        self.state = State::EmitPacketEnd;
                        return Ok(None);
                    }
                }
                let sc = self.stream_class.expect("stream class set by AfterPacketHeader");
                self.event_class_id = None;
                let open_ended = self.packet_properties.content_size_bits.is_none();
                match sc.event_header.as_ref() {
                    Some(field) => match self.drive_root(field, open_ended)? {
                        RootOutcome::Completed => {
                            self.state = State::AfterEventHeader;
                            Ok(None)
                        }
                        RootOutcome::EndOfMedium => {
                            self.state = State::EmitPacketEnd;
                            Ok(None)
                        }
                    },
                    None => {
                        self.state = State::AfterEventHeader;
                        Ok(None)
                    }
                }
            }

            State::AfterEventHeader => {
                let eid = self.event_class_id.unwrap_or(0);
                let sc = self.stream_class.expect("stream class set by AfterPacketHeader");
                self.event_class = Some(sc.event_class(eid).ok_or(Error::UndefinedEventId(eid))?);
                self.common_context_value = None;
                self.specific_context_value = None;
                self.payload_value = None;
                self.state = State::DScopeEventCommonContext;
                Ok(None)
            }

            State::DScopeEventCommonContext => {
                let sc = self.stream_class.expect("stream class set by AfterPacketHeader");
                match sc.event_common_context.as_ref() {
                    Some(field) => match self.drive_root(field, false)? {
                        RootOutcome::Completed => {
                            self.common_context_value = self.builder.take();
                            self.state = State::DScopeEventSpecContext;
                            Ok(None)
                        }
                        RootOutcome::EndOfMedium => unreachable!("EndOfMedium is only allowed at a packet boundary"),
                    },
                    None => {
                        self.state = State::DScopeEventSpecContext;
                        Ok(None)
                    }
                }
            }

            State::DScopeEventSpecContext => {
                let ec = self.event_class.expect("event class set by AfterEventHeader");
                match ec.specific_context.as_ref() {
                    Some(field) => match self.drive_root(field, false)? {
                        RootOutcome::Completed => {
                            self.specific_context_value = self.builder.take();
                            self.state = State::DScopeEventPayload;
                            Ok(None)
                        }
                        RootOutcome::EndOfMedium => unreachable!("EndOfMedium is only allowed at a packet boundary"),
                    },
                    None => {
                        self.state = State::DScopeEventPayload;
                        Ok(None)
                    }
                }
            }

            State::DScopeEventPayload => {
                let ec = self.event_class.expect("event class set by AfterEventHeader");
                match ec.payload.as_ref() {
                    Some(field) => match self.drive_root(field, false)? {
                        RootOutcome::Completed => {
                            self.payload_value = self.builder.take();
                            self.state = State::EmitEvent;
                            Ok(None)
                        }
                        RootOutcome::EndOfMedium => unreachable!("EndOfMedium is only allowed at a packet boundary"),
                    },
                    None => {
                        self.state = State::EmitEvent;
                        Ok(None)
                    }
                }
            }

            State::EmitEvent => {
                let ec = self.event_class.expect("event class set by AfterEventHeader");
                let record = EventRecord {
                    stream_id: self.current_stream_id,
                    event_id: ec.id,
                    name: ec.name,
                    default_clock_snapshot: Some(self.default_clock_snapshot),
                    common_context: self.common_context_value.take(),
                    specific_context: self.specific_context_value.take(),
                    payload: self.payload_value.take(),
                };
                self.state = State::DScopeEventHeader;
                debug!(
                    stream_id = record.stream_id,
                    event_id = record.event_id,
                    event_name = %record.name,
                    clock = ?record.default_clock_snapshot,
                    "decoded event"
                );

                if self.first_event_in_packet {
                    if let Some(Message::PacketBeginning { stream_id, mut properties }) =
                        self.pending_packet_beginning.take()
                    {
                        if let (Some(pb), Some(ev)) = (properties.begin_clock, record.default_clock_snapshot) {
                            if ev < pb {
                                properties.begin_clock = Some(ev);
                            }
                        }
                        self.first_event_in_packet = false;
                        self.pending_after_packet_beginning = Some(Message::Event(record));
                        return Ok(Some(StepResult::Message(Message::PacketBeginning { stream_id, properties })));
                    }
                }
                self.first_event_in_packet = false;
                Ok(Some(StepResult::Message(Message::Event(record))))
            }

            State::EmitPacketEnd => {
                self.prev_packet_snapshots = self.snapshots;
                self.state = State::SkipPacketPadding;
                Ok(Some(StepResult::Message(Message::PacketEnd {
                    stream_id: self.current_stream_id,
                    end_clock: self.snapshots.packet_end_time,
                })))
            }

            State::SkipPacketPadding => {
                if let Some(total_bits) = self.packet_properties.total_size_bits {
                    if total_bits > self.packet_bit_cursor {
                        self.skip_bits(total_bits - self.packet_bit_cursor)?;
                    }
                }
                if self.pending_offset_bits != 0 {
                    return Err(DecodeError::UnalignedPacketSwitch.into());
                }
                self.state = State::SwitchPacket;
                Ok(None)
            }

            State::CheckEmitStreamEnd => {
                self.state = if self.stream_beginning_emitted { State::EmitStreamEnd } else { State::Done };
                Ok(None)
            }

            State::EmitStreamEnd => {
                self.state = State::Done;
                Ok(Some(StepResult::Message(Message::StreamEnd { stream_id: self.current_stream_id })))
            }

            State::Done => Ok(Some(StepResult::Finished)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldclass::{
        ByteOrder, DynamicArrayFieldClass, FieldRef, IntFieldClass, PreferredDisplayBase, StructFieldClass,
        StructMember,
    };
    use crate::fieldpath::{FieldPath, Scope};
    use crate::medium::SliceMedium;
    use crate::traceclass::{EventClass, StreamClass, StreamFlags, TraceClass};
    use std::sync::Arc;

    fn u32_field(name: &str) -> StructMember {
        StructMember {
            name: Intern::new(name.to_owned()),
            field: Field::materialized(FieldClass::Int(IntFieldClass {
                size: 32,
                signed: false,
                byte_order: ByteOrder::LittleEndian,
                alignment: 8,
                preferred_display_base: PreferredDisplayBase::Decimal,
                is_text_encoded: false,
                mapped_clock_class: None,
                stored_value_index: None,
                meaning: None,
            })),
        }
    }

    fn minimal_trace() -> TraceClass {
        let payload = Field::materialized(FieldClass::Struct(StructFieldClass {
            members: vec![u32_field("x")],
            alignment: 8,
        }));
        let event = EventClass {
            id: 0,
            name: Intern::new("e".to_owned()),
            emf_uri: None,
            log_level: None,
            specific_context: None,
            payload: Some(payload),
        };
        let stream = StreamClass {
            id: 0,
            packet_context: None,
            event_header: None,
            event_common_context: None,
            event_classes: vec![Some(event)],
            default_clock_class: None,
            flags: StreamFlags::default(),
        };
        TraceClass {
            name: None,
            major: 1,
            minor: 8,
            uuid: None,
            default_byte_order: ByteOrder::LittleEndian,
            packet_header: None,
            stream_classes: vec![Some(stream)],
            environment: Default::default(),
            clock_classes: Vec::new(),
            stored_value_count: 0,
        }
    }

    #[test]
    fn decodes_a_single_event_packet_to_end() {
        let trace = minimal_trace();
        let medium = SliceMedium::new(vec![0x2A, 0, 0, 0]);
        let mut it = MessageIterator::new(&trace, medium);
        let (msgs, status) = it.next(16).unwrap();
        assert_eq!(status, IteratorStatus::End);

        let kinds: Vec<&str> = msgs
            .iter()
            .map(|m| match m {
                Message::StreamBeginning { .. } => "StreamBeginning",
                Message::PacketBeginning { .. } => "PacketBeginning",
                Message::Event(_) => "Event",
                Message::PacketEnd { .. } => "PacketEnd",
                Message::StreamEnd { .. } => "StreamEnd",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["StreamBeginning", "PacketBeginning", "Event", "PacketEnd", "StreamEnd"]);

        let Message::Event(ev) = msgs.iter().find(|m| matches!(m, Message::Event(_))).unwrap() else {
            unreachable!()
        };
        assert_eq!(ev.payload, Some(Value::Struct(vec![(Intern::new("x".to_owned()), Value::UnsignedInt(42))])));
    }

    #[test]
    fn rejects_a_packet_header_with_the_wrong_magic_number() {
        let mut trace = minimal_trace();
        trace.packet_header = Some(Field::materialized(FieldClass::Struct(StructFieldClass {
            members: vec![StructMember {
                name: Intern::new("magic".to_owned()),
                field: Field::materialized(FieldClass::Int(IntFieldClass {
                    size: 32,
                    signed: false,
                    byte_order: ByteOrder::LittleEndian,
                    alignment: 8,
                    preferred_display_base: PreferredDisplayBase::Hexadecimal,
                    is_text_encoded: false,
                    mapped_clock_class: None,
                    stored_value_index: None,
                    meaning: Some(Meaning::Magic),
                })),
            }],
            alignment: 8,
        })));

        let medium = SliceMedium::new(vec![0xEF, 0xBE, 0xAD, 0xDE]);
        let mut it = MessageIterator::new(&trace, medium);
        let err = it.next(16).unwrap_err();
        assert!(matches!(
            err,
            Error::Decode(DecodeError::InvalidMagicNumber { expected: CTF_MAGIC_NUMBER, found: 0xDEAD_BEEF })
        ));
    }

    #[test]
    fn resolves_sequence_length_from_a_producer_field() {
        let inner = StructFieldClass {
            members: vec![
                u32_field("len"),
                StructMember {
                    name: Intern::new("data".to_owned()),
                    field: Field::materialized(FieldClass::DynamicArray(DynamicArrayFieldClass {
                        element: Arc::new(Field::materialized(FieldClass::Int(IntFieldClass {
                            size: 8,
                            signed: false,
                            byte_order: ByteOrder::LittleEndian,
                            alignment: 8,
                            preferred_display_base: PreferredDisplayBase::Decimal,
                            is_text_encoded: false,
                            mapped_clock_class: None,
                            stored_value_index: None,
                            meaning: None,
                        }))),
                        length_ref: FieldRef {
                            name: "len".to_owned(),
                            resolved: Some((FieldPath::new(Scope::EventPayload, vec![0]), 0)),
                        },
                        is_text: false,
                    })),
                },
            ],
            alignment: 8,
        };
        let mut payload_class = FieldClass::Struct(inner);
        if let FieldClass::Struct(s) = &mut payload_class {
            if let FieldClass::Int(i) = &mut s.members[0].field.class {
                i.stored_value_index = Some(0);
            }
        }
        let event = EventClass {
            id: 0,
            name: Intern::new("e".to_owned()),
            emf_uri: None,
            log_level: None,
            specific_context: None,
            payload: Some(Field::materialized(payload_class)),
        };
        let stream = StreamClass {
            id: 0,
            packet_context: None,
            event_header: None,
            event_common_context: None,
            event_classes: vec![Some(event)],
            default_clock_class: None,
            flags: StreamFlags::default(),
        };
        let trace = TraceClass {
            name: None,
            major: 1,
            minor: 8,
            uuid: None,
            default_byte_order: ByteOrder::LittleEndian,
            packet_header: None,
            stream_classes: vec![Some(stream)],
            environment: Default::default(),
            clock_classes: Vec::new(),
            stored_value_count: 1,
        };

        // len=2, data=[0xAA, 0xBB]
        let medium = SliceMedium::new(vec![2, 0, 0, 0, 0xAA, 0xBB]);
        let mut it = MessageIterator::new(&trace, medium);
        let (msgs, _) = it.next(16).unwrap();
        let Message::Event(ev) = msgs.iter().find(|m| matches!(m, Message::Event(_))).unwrap() else {
            unreachable!()
        };
        let Some(Value::Struct(fields)) = &ev.payload else { panic!("expected a struct payload") };
        let (_, data) = fields.iter().find(|(n, _)| n.as_str() == "data").unwrap();
        assert_eq!(data, &Value::Array(vec![Value::UnsignedInt(0xAA), Value::UnsignedInt(0xBB)]));
    }

    #[test]
    fn reconstructs_a_wrapped_clock_value() {
        assert_eq!(reconstruct(0, 0x07FF_FFFF, 27), 0x07FF_FFFF);
        // Next sample wraps past the 27-bit boundary.
        assert_eq!(reconstruct(0x07FF_FFFF, 0x0000_0001, 27), 0x0800_0001);
    }
}
