//! End-to-end scenarios over hand-built trace class graphs: no TSDL lexer
//! exists in this crate, so these fixtures stand in for what
//! `metadata::resolve` would have produced from real `.tsdl` text.

use ctf_reader::fieldclass::{
    ByteOrder, Field, FieldClass, FieldRef, IntFieldClass, Meaning, PreferredDisplayBase,
    StructFieldClass, StructMember, VariantFieldClass, VariantOption, VariantRangeTable,
};
use ctf_reader::fieldpath::{FieldPath, Scope};
use ctf_reader::traceclass::{ClockClass, EventClass, StreamClass, StreamFlags, TraceClass};
use ctf_reader::{IteratorStatus, Message, MessageIterator, SliceMedium, Value};
use internment::Intern;
use pretty_assertions::assert_eq;
use test_log::test;

fn plain_int(meaning: Option<Meaning>, mapped_clock_class: Option<usize>) -> Field {
    Field::materialized(FieldClass::Int(IntFieldClass {
        size: 32,
        signed: false,
        byte_order: ByteOrder::LittleEndian,
        alignment: 8,
        preferred_display_base: PreferredDisplayBase::Decimal,
        is_text_encoded: false,
        mapped_clock_class,
        stored_value_index: None,
        meaning,
    }))
}

fn member(name: &str, field: Field) -> StructMember {
    StructMember { name: Intern::new(name.to_owned()), field }
}

fn le_u32(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}

/// One stream class with a packet header, a packet context carrying the
/// canonical size/clock/discarded-events members, a plain event header, and
/// a single event class with a `{x: u32}` payload.
fn base_trace() -> TraceClass {
    let packet_header = Field::materialized(FieldClass::Struct(StructFieldClass {
        members: vec![
            member("magic", plain_int(Some(Meaning::Magic), None)),
            member("stream_id", plain_int(Some(Meaning::StreamClassId), None)),
        ],
        alignment: 8,
    }));

    let packet_context = Field::materialized(FieldClass::Struct(StructFieldClass {
        members: vec![
            member("packet_size", plain_int(Some(Meaning::PacketTotalSize), None)),
            member("content_size", plain_int(Some(Meaning::PacketContentSize), None)),
            member("timestamp_begin", plain_int(Some(Meaning::PacketBeginTime), Some(0))),
            member("timestamp_end", plain_int(Some(Meaning::PacketEndTime), Some(0))),
            member("events_discarded", plain_int(Some(Meaning::DiscardedEventCounterSnapshot), None)),
        ],
        alignment: 8,
    }));

    let event_header = Field::materialized(FieldClass::Struct(StructFieldClass {
        members: vec![
            member("id", plain_int(Some(Meaning::EventClassId), None)),
            member("timestamp", plain_int(None, Some(0))),
        ],
        alignment: 8,
    }));

    let payload = Field::materialized(FieldClass::Struct(StructFieldClass {
        members: vec![member("x", plain_int(None, None))],
        alignment: 8,
    }));

    let event = EventClass {
        id: 0,
        name: Intern::new("ev".to_owned()),
        emf_uri: None,
        log_level: None,
        specific_context: None,
        payload: Some(payload),
    };

    let stream = StreamClass {
        id: 0,
        packet_context: Some(packet_context),
        event_header: Some(event_header),
        event_common_context: None,
        event_classes: vec![Some(event)],
        default_clock_class: Some(0),
        flags: StreamFlags {
            has_packet_begin_time: true,
            has_packet_end_time: true,
            has_discarded_events_snapshot: true,
            has_packet_counter_snapshot: false,
        },
    };

    TraceClass {
        name: Some(Intern::new("t".to_owned())),
        major: 1,
        minor: 8,
        uuid: None,
        default_byte_order: ByteOrder::LittleEndian,
        packet_header: Some(packet_header),
        stream_classes: vec![Some(stream)],
        environment: Default::default(),
        clock_classes: vec![ClockClass::implicit()],
        stored_value_count: 0,
    }
}

/// header(8) + context(20) + event_header(8) + payload(4) = 40 bytes = 320 bits.
fn packet_bytes(stream_id: u32, timestamp_begin: u32, timestamp_end: u32, events_discarded: u32, event_timestamp: u32, x: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(le_u32(0xC1FC_1FC1));
    out.extend(le_u32(stream_id));
    out.extend(le_u32(320)); // packet_size (bits)
    out.extend(le_u32(320)); // content_size (bits)
    out.extend(le_u32(timestamp_begin));
    out.extend(le_u32(timestamp_end));
    out.extend(le_u32(events_discarded));
    out.extend(le_u32(0)); // event id
    out.extend(le_u32(event_timestamp));
    out.extend(le_u32(x));
    out
}

fn payload_x(msg: &Message) -> u64 {
    let Message::Event(ev) = msg else { panic!("expected an Event message, got {msg:?}") };
    let Some(Value::Struct(fields)) = &ev.payload else { panic!("expected a struct payload") };
    let (_, v) = fields.iter().find(|(n, _)| n.as_str() == "x").unwrap();
    let Value::UnsignedInt(n) = v else { panic!("expected an unsigned int") };
    *n
}

/// S1: a minimal single-event packet decodes to the full canonical message
/// sequence and ends the trace on the following boundary.
#[test]
fn minimal_single_event_packet() {
    let trace = base_trace();
    let bytes = packet_bytes(0, 1000, 2000, 0, 1500, 42);
    let mut it = MessageIterator::new(&trace, SliceMedium::new(bytes));

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

    let Message::PacketBeginning { properties, .. } = &msgs[1] else { unreachable!() };
    assert_eq!(properties.begin_clock, Some(1000));
    assert_eq!(properties.end_clock, Some(2000));
    assert_eq!(properties.content_size_bits, Some(320));

    assert_eq!(payload_x(&msgs[2]), 42);
}

/// S3: a jump in the discarded-events counter between two packets emits a
/// `DiscardedEvents` message sized to the gap, ordered before the second
/// packet's `PacketBeginning`.
#[test]
fn discarded_events_between_packets() {
    let trace = base_trace();
    let mut bytes = packet_bytes(0, 1000, 2000, 0, 1500, 1);
    bytes.extend(packet_bytes(0, 3000, 4000, 7, 3500, 2));
    let mut it = MessageIterator::new(&trace, SliceMedium::new(bytes));

    let (msgs, status) = it.next(32).unwrap();
    assert_eq!(status, IteratorStatus::End);

    let discarded: Vec<&Message> = msgs.iter().filter(|m| matches!(m, Message::DiscardedEvents { .. })).collect();
    assert_eq!(discarded.len(), 1);
    let Message::DiscardedEvents { count, .. } = discarded[0] else { unreachable!() };
    assert_eq!(*count, 7);

    // The discarded-events message precedes the second packet's beginning.
    let discarded_pos = msgs.iter().position(|m| matches!(m, Message::DiscardedEvents { .. })).unwrap();
    let second_packet_pos =
        msgs.iter().enumerate().filter(|(_, m)| matches!(m, Message::PacketBeginning { .. })).nth(1).unwrap().0;
    assert!(discarded_pos < second_packet_pos);
}

/// A clock field narrower than 64 bits that wraps is reconstructed by
/// carrying the high bits of the running clock forward, rather than going
/// backwards.
#[test]
fn clock_wraparound_advances_monotonically() {
    let mut trace = base_trace();
    if let Some(Some(sc)) = trace.stream_classes.get_mut(0) {
        if let Some(ctx) = sc.packet_context.as_mut() {
            if let FieldClass::Struct(s) = &mut ctx.class {
                for m in &mut s.members {
                    if let FieldClass::Int(ic) = &mut m.field.class {
                        if m.name.as_str() == "timestamp_begin" || m.name.as_str() == "timestamp_end" {
                            ic.size = 8; // narrow clock field, easy to force a wrap
                            ic.mapped_clock_class = Some(0);
                        }
                    }
                }
            }
        }
    }

    // header(8) + context(4+4+1+1+4=14) + event_header(8) + payload(4) = 34 bytes = 272 bits.
    let mut bytes = Vec::new();
    bytes.extend(le_u32(0xC1FC_1FC1));
    bytes.extend(le_u32(0)); // stream_id
    bytes.extend(le_u32(272)); // packet_size (bits)
    bytes.extend(le_u32(272)); // content_size (bits)
    bytes.push(250); // timestamp_begin: low byte of a clock near the 8-bit boundary
    bytes.push(5); // timestamp_end: wrapped past 255
    bytes.extend(le_u32(0)); // events_discarded
    bytes.extend(le_u32(0)); // event id
    bytes.extend(le_u32(0)); // event timestamp
    bytes.extend(le_u32(42)); // payload x

    let mut it = MessageIterator::new(&trace, SliceMedium::new(bytes));
    let (msgs, _) = it.next(16).unwrap();
    let Message::PacketBeginning { properties, .. } = &msgs[1] else { unreachable!() };
    assert_eq!(properties.begin_clock, Some(250));
    assert_eq!(properties.end_clock, Some(256 + 5));
}

/// S4: a gap in the packet-sequence-number counter between two packets
/// emits a `DiscardedPackets` message sized to the number of missing
/// packets.
#[test]
fn discarded_packets_between_packets() {
    let mut trace = base_trace();
    if let Some(Some(sc)) = trace.stream_classes.get_mut(0) {
        sc.flags.has_packet_counter_snapshot = true;
        if let Some(ctx) = sc.packet_context.as_mut() {
            if let FieldClass::Struct(s) = &mut ctx.class {
                s.members.push(member("packet_seq_num", plain_int(Some(Meaning::PacketCounterSnapshot), None)));
            }
        }
    }

    // header(8) + context(20+4=24) + event_header(8) + payload(4) = 44 bytes = 352 bits.
    fn packet_bytes_with_seq(seq: u32, timestamp_begin: u32, timestamp_end: u32, x: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(le_u32(0xC1FC_1FC1));
        out.extend(le_u32(0)); // stream_id
        out.extend(le_u32(352)); // packet_size (bits)
        out.extend(le_u32(352)); // content_size (bits)
        out.extend(le_u32(timestamp_begin));
        out.extend(le_u32(timestamp_end));
        out.extend(le_u32(0)); // events_discarded
        out.extend(le_u32(seq)); // packet_seq_num
        out.extend(le_u32(0)); // event id
        out.extend(le_u32(0)); // event timestamp
        out.extend(le_u32(x));
        out
    }

    let mut bytes = packet_bytes_with_seq(0, 1000, 2000, 1);
    bytes.extend(packet_bytes_with_seq(4, 3000, 4000, 2));
    let mut it = MessageIterator::new(&trace, SliceMedium::new(bytes));

    let (msgs, status) = it.next(32).unwrap();
    assert_eq!(status, IteratorStatus::End);

    let discarded: Vec<&Message> = msgs.iter().filter(|m| matches!(m, Message::DiscardedPackets { .. })).collect();
    assert_eq!(discarded.len(), 1);
    let Message::DiscardedPackets { count, .. } = discarded[0] else { unreachable!() };
    assert_eq!(*count, 3);

    // No DiscardedEvents fires here; the gap is in the packet counter, not
    // the event counter.
    assert!(!msgs.iter().any(|m| matches!(m, Message::DiscardedEvents { .. })));
}

/// S6: two consecutive sub-byte integers at a mid-byte bit boundary with
/// differing byte orders is a decode error; the second field's callback
/// never fires.
#[test]
fn byte_order_continuity_failure_mid_byte() {
    let nibble = |byte_order: ByteOrder| {
        Field::materialized(FieldClass::Int(IntFieldClass {
            size: 4,
            signed: false,
            byte_order,
            alignment: 1,
            preferred_display_base: PreferredDisplayBase::Decimal,
            is_text_encoded: false,
            mapped_clock_class: None,
            stored_value_index: None,
            meaning: None,
        }))
    };
    let payload = Field::materialized(FieldClass::Struct(StructFieldClass {
        members: vec![member("a", nibble(ByteOrder::LittleEndian)), member("b", nibble(ByteOrder::BigEndian))],
        alignment: 1,
    }));

    let event = EventClass {
        id: 0,
        name: Intern::new("ev".to_owned()),
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
        stored_value_count: 0,
    };

    let bytes = vec![0xAB];
    let mut it = MessageIterator::new(&trace, SliceMedium::new(bytes));
    let err = it.next(16).unwrap_err();
    assert!(matches!(
        err,
        ctf_reader::Error::Decode(ctf_reader::DecodeError::ByteOrderContinuity {
            previous: ByteOrder::LittleEndian,
            new: ByteOrder::BigEndian,
            ..
        })
    ));
}

/// A variant tag value with no matching option always errors rather than
/// silently falling back to some default option.
#[test]
fn variant_tag_out_of_range_errors() {
    let tag_field = StructMember {
        name: Intern::new("tag".to_owned()),
        field: {
            let mut f = plain_int(None, None);
            if let FieldClass::Int(ic) = &mut f.class {
                ic.stored_value_index = Some(0);
            }
            f
        },
    };
    let choice_field = StructMember {
        name: Intern::new("choice".to_owned()),
        field: Field::materialized(FieldClass::Variant(VariantFieldClass {
            tag: FieldRef { name: "tag".to_owned(), resolved: Some((FieldPath::new(Scope::EventPayload, vec![0]), 0)) },
            options: vec![VariantOption { name: Intern::new("a".to_owned()), field: plain_int(None, None) }],
            range_table: VariantRangeTable { entries: vec![(0, 0, 0)] },
        })),
    };
    let payload = Field::materialized(FieldClass::Struct(StructFieldClass {
        members: vec![tag_field, choice_field],
        alignment: 8,
    }));

    let event = EventClass {
        id: 0,
        name: Intern::new("ev".to_owned()),
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

    // tag = 5, which has no entry in the range table; choice's payload byte
    // is never reached.
    let bytes = [le_u32(5), le_u32(0)].concat();
    let mut it = MessageIterator::new(&trace, SliceMedium::new(bytes));
    let err = it.next(16).unwrap_err();
    assert!(matches!(err, ctf_reader::Error::Decode(ctf_reader::DecodeError::VariantTagNoMatch)));
}
