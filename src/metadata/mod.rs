//! The semantic metadata pass.
//!
//! Turns a [`ast::Document`] into the trace class graph of
//! [`crate::traceclass`] plus the field-class trees of
//! [`crate::fieldclass`]. The AST is a plain data description of textual
//! input already parsed by an external front-end; this pass consumes it to
//! build the crate's internal, immutable class graph.

pub mod ast;

use crate::error::{Error, StructuralError};
use crate::fieldclass::{
    ByteOrder, DynamicArrayFieldClass, EnumFieldClass, EnumMapping, Field, FieldClass, FieldRef,
    FloatFieldClass, FloatSize, IntFieldClass, Meaning, PreferredDisplayBase, StaticArrayFieldClass,
    StringEncoding, StringFieldClass, StructFieldClass, StructMember, VariantFieldClass,
    VariantOption, VariantRangeTable,
};
use crate::fieldpath::{self, FieldPath, Scope};
use crate::traceclass::{
    ClockClass, ClockOffset, EnvironmentValue, EventClass, LogLevel, StreamClass, StreamFlags,
    TraceClass,
};
use internment::Intern;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of a semantic-pass invocation. `Incomplete` is not a failure: it
/// is a distinguishable status the caller can use to re-invoke once more
/// TSDL has been supplied, which is why this is a dedicated enum rather
/// than a variant of [`Error`].
pub enum Outcome {
    Complete(TraceClass),
    Incomplete,
}

/// Strips a leading underscore from a TSDL identifier, the same
/// underscore-shadowing convention [`FieldPath::normalize_name`] applies to
/// field-path segments. Exposed so enum-label lookups can apply the
/// identical rule.
pub fn strip_leading_underscore(name: &str) -> &str {
    name.strip_prefix('_').unwrap_or(name)
}

/// The roots of the six dynamic scopes, as they exist mid-build for one
/// stream/event pair, used to resolve a [`Scope`]-qualified field path to a
/// member-index chain via [`fieldpath::resolve`].
///
/// Holds owned clones rather than borrows: a scope's tree is still being
/// mutated (`FieldRef`s filled in) while its own members are read back for
/// path resolution, which a borrow would make self-referential. The clone
/// is one-time, at metadata-build time, never on a decode path.
#[derive(Default)]
struct ScopeRoots {
    packet_header: Option<FieldClass>,
    packet_context: Option<FieldClass>,
    event_header: Option<FieldClass>,
    event_common_context: Option<FieldClass>,
    event_specific_context: Option<FieldClass>,
    event_payload: Option<FieldClass>,
}

impl ScopeRoots {
    fn get(&self, scope: Scope) -> Option<&FieldClass> {
        match scope {
            Scope::PacketHeader => self.packet_header.as_ref(),
            Scope::PacketContext => self.packet_context.as_ref(),
            Scope::EventHeader => self.event_header.as_ref(),
            Scope::EventCommonContext => self.event_common_context.as_ref(),
            Scope::EventSpecificContext => self.event_specific_context.as_ref(),
            Scope::EventPayload => self.event_payload.as_ref(),
        }
    }
}

/// The same six scopes as live `&mut Field`s, used once ref-resolution of a
/// tree has finished to write each producer's assigned stored-value index
/// back onto the real (un-cloned) field it names. Built fresh at each call
/// site from whichever scopes are locals in hand there; a scope absent from
/// the current lexical nesting (e.g. event scopes while resolving
/// stream-level fields) is simply `None`.
#[derive(Default)]
struct ScopeSlots<'a> {
    packet_header: Option<&'a mut Field>,
    packet_context: Option<&'a mut Field>,
    event_header: Option<&'a mut Field>,
    event_common_context: Option<&'a mut Field>,
    event_specific_context: Option<&'a mut Field>,
    event_payload: Option<&'a mut Field>,
}

impl<'a> ScopeSlots<'a> {
    fn get_mut(&mut self, scope: Scope) -> Option<&mut Field> {
        match scope {
            Scope::PacketHeader => self.packet_header.as_deref_mut(),
            Scope::PacketContext => self.packet_context.as_deref_mut(),
            Scope::EventHeader => self.event_header.as_deref_mut(),
            Scope::EventCommonContext => self.event_common_context.as_deref_mut(),
            Scope::EventSpecificContext => self.event_specific_context.as_deref_mut(),
            Scope::EventPayload => self.event_payload.as_deref_mut(),
        }
    }
}

/// A producer field discovered while resolving a consumer's [`FieldRef`]:
/// `scope`/`indices` name the real field (in the un-cloned tree) that must
/// have its `stored_value_index` set to `index`.
type ProducerAssignment = (Scope, Vec<usize>, usize);

fn apply_producer_assignments(
    assignments: &[ProducerAssignment],
    mut slots: ScopeSlots,
) -> Result<(), Error> {
    for (scope, indices, index) in assignments {
        let field = slots.get_mut(*scope).ok_or_else(|| {
            StructuralError::UnresolvedName("<producer field>".into(), "stored value scope")
        })?;
        set_stored_value_index(field, indices, *index).ok_or_else(|| {
            StructuralError::UnresolvedName("<producer field>".into(), "stored value path")
        })?;
    }
    Ok(())
}

/// Walks `root` through `indices` (a resolved [`FieldPath`]'s chain) and
/// sets `stored_value_index` on the terminal Int/Enum field.
fn set_stored_value_index(root: &mut Field, indices: &[usize], index: usize) -> Option<()> {
    let mut field = root;
    for &i in indices {
        let s = match &mut field.class {
            FieldClass::Struct(s) => s,
            _ => return None,
        };
        field = &mut s.members.get_mut(i)?.field;
    }
    match &mut field.class {
        FieldClass::Int(ic) => {
            ic.stored_value_index = Some(index);
            Some(())
        }
        FieldClass::Enum(ec) => {
            ec.underlying.stored_value_index = Some(index);
            Some(())
        }
        _ => None,
    }
}

struct Resolver {
    /// Lexical scope: one flat table keyed by `"<bucket>:<name>"` where
    /// bucket is `a`/`e`/`s`/`v`. A single flat map suffices because TSDL
    /// aliases are global once registered;
    /// nested `typedef`/anonymous blocks resolve to a fresh `FieldClass`
    /// inline rather than a new scope frame.
    aliases: BTreeMap<String, FieldClass>,
    default_byte_order: Option<ByteOrder>,
    clock_classes: Vec<ClockClass>,
    clock_index_by_name: BTreeMap<String, usize>,
    stored_value_count: usize,
}

pub fn resolve(doc: &ast::Document) -> Result<Outcome, Error> {
    let Some(trace_block) = doc.trace.as_ref() else {
        debug!("metadata pass: no trace block yet, reporting incomplete");
        return Ok(Outcome::Incomplete);
    };

    let major = trace_block
        .major
        .ok_or_else(|| StructuralError::UnresolvedName("major".into(), "trace"))?;
    let minor = trace_block
        .minor
        .ok_or_else(|| StructuralError::UnresolvedName("minor".into(), "trace"))?;
    if major != 1 || minor != 8 {
        return Err(StructuralError::UnsupportedVersion { major, minor }.into());
    }

    let default_byte_order = match trace_block.byte_order {
        Some(ast::ByteOrderSpec::LittleEndian) => ByteOrder::LittleEndian,
        Some(ast::ByteOrderSpec::BigEndian) => ByteOrder::BigEndian,
        Some(ast::ByteOrderSpec::Native) | None => {
            return Err(StructuralError::DefaultByteOrderUnknown("trace.byte_order".into()).into())
        }
    };

    let mut resolver = Resolver {
        aliases: BTreeMap::new(),
        default_byte_order: Some(default_byte_order),
        clock_classes: Vec::new(),
        clock_index_by_name: BTreeMap::new(),
        stored_value_count: 0,
    };

    for (name, spec) in &doc.type_aliases {
        let class = resolver.type_spec_to_class(spec)?;
        reject_untagged_variant_alias(name, &class)?;
        resolver.aliases.insert(format!("a:{name}"), class);
    }

    for clock in &doc.clocks {
        let name = clock
            .name
            .clone()
            .ok_or_else(|| StructuralError::UnresolvedName("name".into(), "clock"))?;
        let idx = resolver.clock_classes.len();
        resolver.clock_index_by_name.insert(name.clone(), idx);
        resolver.clock_classes.push(ClockClass {
            name: Intern::new(name),
            frequency: clock.freq.unwrap_or(1_000_000_000),
            precision: clock.precision.unwrap_or(0),
            offset: ClockOffset {
                seconds: clock.offset_s.unwrap_or(0),
                cycles: clock.offset.unwrap_or(0),
            },
            uuid: clock.uuid.as_deref().and_then(|u| Uuid::parse_str(u).ok()),
            is_absolute: clock.absolute,
        });
    }

    let mut packet_header = trace_block
        .packet_header
        .as_ref()
        .map(|s| resolver.struct_spec_to_field(s))
        .transpose()?;
    if let Some(field) = packet_header.as_mut() {
        tag_meanings(field, CANONICAL_PACKET_HEADER);
    }

    let mut environment = BTreeMap::new();
    for (k, v) in &doc.env {
        environment.insert(
            k.clone(),
            match v {
                ast::EnvValue::Integer(i) => EnvironmentValue::Integer(*i),
                ast::EnvValue::String(s) => EnvironmentValue::String(Intern::new(s.clone())),
            },
        );
    }

    let mut stream_classes: Vec<Option<StreamClass>> = Vec::new();
    for (stream_idx, stream_block) in doc.streams.iter().enumerate() {
        let id = stream_block.id.unwrap_or(stream_idx as u64);

        let mut packet_context = stream_block
            .packet_context
            .as_ref()
            .map(|s| resolver.struct_spec_to_field(s))
            .transpose()?;
        if let Some(field) = packet_context.as_mut() {
            tag_meanings(field, CANONICAL_PACKET_CONTEXT);
        }
        let mut event_header = stream_block
            .event_header
            .as_ref()
            .map(|s| resolver.struct_spec_to_field(s))
            .transpose()?;
        if let Some(field) = event_header.as_mut() {
            tag_meanings(field, CANONICAL_EVENT_HEADER);
        }
        let mut event_common_context = stream_block
            .event_context
            .as_ref()
            .map(|s| resolver.struct_spec_to_field(s))
            .transpose()?;

        let flags = StreamFlags {
            has_packet_begin_time: packet_context
                .as_ref()
                .map(|f| has_meaning(f, Meaning::PacketBeginTime))
                .unwrap_or(false),
            has_packet_end_time: packet_context
                .as_ref()
                .map(|f| has_meaning(f, Meaning::PacketEndTime))
                .unwrap_or(false),
            has_discarded_events_snapshot: packet_context
                .as_ref()
                .map(|f| has_meaning(f, Meaning::DiscardedEventCounterSnapshot))
                .unwrap_or(false),
            has_packet_counter_snapshot: packet_context
                .as_ref()
                .map(|f| has_meaning(f, Meaning::PacketCounterSnapshot))
                .unwrap_or(false),
        };

        resolver.auto_map_clock(event_header.as_ref(), "timestamp")?;
        resolver.auto_map_clock(packet_context.as_ref(), "timestamp_begin")?;
        resolver.auto_map_clock(packet_context.as_ref(), "timestamp_end")?;
        let default_clock_class = resolver.clock_index_by_name.values().copied().next();

        let mut event_classes: Vec<Option<EventClass>> = Vec::new();
        for (event_idx, event_block) in doc
            .events
            .iter()
            .filter(|e| e.stream_id.unwrap_or(0) == id)
            .enumerate()
        {
            let eid = event_block.id.unwrap_or(event_idx as u64);
            let mut specific_context = event_block
                .context
                .as_ref()
                .map(|s| resolver.struct_spec_to_field(s))
                .transpose()?;
            let mut payload = event_block
                .fields
                .as_ref()
                .map(|s| resolver.struct_spec_to_field(s))
                .transpose()?;

            let roots = ScopeRoots {
                packet_header: packet_header.as_ref().map(|f| f.class.clone()),
                packet_context: packet_context.as_ref().map(|f| f.class.clone()),
                event_header: event_header.as_ref().map(|f| f.class.clone()),
                event_common_context: event_common_context.as_ref().map(|f| f.class.clone()),
                event_specific_context: specific_context.as_ref().map(|f| f.class.clone()),
                event_payload: payload.as_ref().map(|f| f.class.clone()),
            };
            let mut assignments = Vec::new();
            if let Some(f) = specific_context.as_mut() {
                resolve_refs_in(
                    f,
                    Scope::EventSpecificContext,
                    &roots,
                    &mut resolver.stored_value_count,
                    &mut assignments,
                )?;
            }
            if let Some(f) = payload.as_mut() {
                resolve_refs_in(
                    f,
                    Scope::EventPayload,
                    &roots,
                    &mut resolver.stored_value_count,
                    &mut assignments,
                )?;
            }
            apply_producer_assignments(
                &assignments,
                ScopeSlots {
                    packet_header: packet_header.as_mut(),
                    packet_context: packet_context.as_mut(),
                    event_header: event_header.as_mut(),
                    event_common_context: event_common_context.as_mut(),
                    event_specific_context: specific_context.as_mut(),
                    event_payload: payload.as_mut(),
                },
            )?;

            place(
                &mut event_classes,
                eid as usize,
                EventClass {
                    id: eid,
                    name: Intern::new(event_block.name.clone()),
                    emf_uri: event_block.model_emf_uri.as_ref().map(|s| Intern::new(s.clone())),
                    log_level: event_block.loglevel.map(LogLevel::Other),
                    specific_context,
                    payload,
                },
            )
            .map_err(|_| StructuralError::DuplicateEventClassId(eid, id))?;
        }

        // Resolve refs in the per-stream scopes themselves (e.g. a dynamic
        // array in event_common_context keyed off a field in the same
        // scope) against siblings only — cross-stream scopes never see
        // per-event roots, matching TSDL's lexical nesting.
        let roots_for_stream = ScopeRoots {
            packet_header: packet_header.as_ref().map(|f| f.class.clone()),
            packet_context: packet_context.as_ref().map(|f| f.class.clone()),
            event_header: event_header.as_ref().map(|f| f.class.clone()),
            event_common_context: event_common_context.as_ref().map(|f| f.class.clone()),
            ..Default::default()
        };
        let mut stream_assignments = Vec::new();
        if let Some(f) = packet_context.as_mut() {
            resolve_refs_in(
                f,
                Scope::PacketContext,
                &roots_for_stream,
                &mut resolver.stored_value_count,
                &mut stream_assignments,
            )?;
        }
        if let Some(f) = event_header.as_mut() {
            resolve_refs_in(
                f,
                Scope::EventHeader,
                &roots_for_stream,
                &mut resolver.stored_value_count,
                &mut stream_assignments,
            )?;
        }
        if let Some(f) = event_common_context.as_mut() {
            resolve_refs_in(
                f,
                Scope::EventCommonContext,
                &roots_for_stream,
                &mut resolver.stored_value_count,
                &mut stream_assignments,
            )?;
        }
        apply_producer_assignments(
            &stream_assignments,
            ScopeSlots {
                packet_header: packet_header.as_mut(),
                packet_context: packet_context.as_mut(),
                event_header: event_header.as_mut(),
                event_common_context: event_common_context.as_mut(),
                ..Default::default()
            },
        )?;

        place(
            &mut stream_classes,
            id as usize,
            StreamClass {
                id,
                packet_context,
                event_header,
                event_common_context,
                event_classes,
                default_clock_class,
                flags,
            },
        )
        .map_err(|_| StructuralError::DuplicateStreamClassId(id))?;
    }

    if let Some(f) = packet_header.as_mut() {
        let roots = ScopeRoots { packet_header: Some(f.class.clone()), ..Default::default() };
        let mut header_assignments = Vec::new();
        resolve_refs_in(
            f,
            Scope::PacketHeader,
            &roots,
            &mut resolver.stored_value_count,
            &mut header_assignments,
        )?;
        apply_producer_assignments(
            &header_assignments,
            ScopeSlots { packet_header: Some(f), ..Default::default() },
        )?;
    }

    Ok(Outcome::Complete(TraceClass {
        name: None,
        major,
        minor,
        uuid: trace_block.uuid.as_deref().and_then(|u| Uuid::parse_str(u).ok()),
        default_byte_order,
        packet_header,
        stream_classes,
        environment,
        clock_classes: resolver.clock_classes,
        stored_value_count: resolver.stored_value_count,
    }))
}

fn place<T>(slots: &mut Vec<Option<T>>, index: usize, value: T) -> Result<(), ()> {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    if slots[index].is_some() {
        return Err(());
    }
    slots[index] = Some(value);
    Ok(())
}

impl Resolver {
    fn type_spec_to_class(&mut self, spec: &ast::TypeSpec) -> Result<FieldClass, Error> {
        Ok(match spec {
            ast::TypeSpec::Integer(i) => FieldClass::Int(self.integer_spec(i)?),
            ast::TypeSpec::FloatingPoint(f) => FieldClass::Float(self.float_spec(f)?),
            ast::TypeSpec::String { encoding } => FieldClass::String(StringFieldClass {
                encoding: match encoding.as_deref() {
                    Some("none") => StringEncoding::None,
                    _ => StringEncoding::Utf8,
                },
            }),
            ast::TypeSpec::Enum(e) => {
                let underlying = match self.type_spec_to_class(&e.underlying)? {
                    FieldClass::Int(i) => i,
                    _ => {
                        return Err(StructuralError::UnresolvedName(
                            "enum underlying type must be an integer".into(),
                            "enum",
                        )
                        .into())
                    }
                };
                let mut seen = std::collections::BTreeSet::new();
                let mut mappings = Vec::with_capacity(e.enumerators.len());
                for en in &e.enumerators {
                    let label = strip_leading_underscore(&en.label).to_owned();
                    if !seen.insert(label.clone()) {
                        return Err(StructuralError::DuplicateEnumLabel(label).into());
                    }
                    mappings.push(EnumMapping { label: Intern::new(label), ranges: vec![en.range] });
                }
                FieldClass::Enum(EnumFieldClass { underlying, mappings })
            }
            ast::TypeSpec::Struct(s) => self.struct_spec_to_class(s)?,
            ast::TypeSpec::Variant(v) => FieldClass::Variant(self.variant_spec(v)?),
            ast::TypeSpec::Alias(name) => self.lookup_alias(name)?.clone(),
            ast::TypeSpec::Array { element, length } => {
                let elem = self.type_spec_to_class(element)?;
                let is_text = is_char_like(&elem);
                FieldClass::StaticArray(StaticArrayFieldClass {
                    element: Arc::new(Field::materialized(elem)),
                    length: *length,
                    is_text,
                })
            }
            ast::TypeSpec::Sequence { element, length_ref } => {
                let elem = self.type_spec_to_class(element)?;
                let is_text = is_char_like(&elem);
                FieldClass::DynamicArray(DynamicArrayFieldClass {
                    element: Arc::new(Field::materialized(elem)),
                    length_ref: FieldRef::unresolved(length_ref.clone()),
                    is_text,
                })
            }
        })
    }

    fn struct_spec_to_field(&mut self, s: &ast::StructSpec) -> Result<Field, Error> {
        Ok(Field::materialized(self.struct_spec_to_class(s)?))
    }

    fn struct_spec_to_class(&mut self, s: &ast::StructSpec) -> Result<FieldClass, Error> {
        let Some(fields) = s.fields.as_ref() else {
            return Err(StructuralError::UnresolvedName(
                "forward-declared struct never defined".into(),
                "struct",
            )
            .into());
        };
        let mut seen = std::collections::BTreeSet::new();
        let mut members = Vec::with_capacity(fields.len());
        let mut max_align = s.min_align.unwrap_or(8);
        for f in fields {
            let norm = strip_leading_underscore(&f.name).to_owned();
            if !seen.insert(norm) {
                return Err(StructuralError::DuplicateStructMember(f.name.clone()).into());
            }
            let class = self.type_spec_to_class(&f.ty)?;
            max_align = max_align.max(class.alignment());
            members.push(StructMember {
                name: Intern::new(f.name.clone()),
                field: Field::materialized(class),
            });
        }
        Ok(FieldClass::Struct(StructFieldClass { members, alignment: max_align }))
    }

    fn variant_spec(&mut self, v: &ast::VariantSpec) -> Result<VariantFieldClass, Error> {
        let Some(options) = v.options.as_ref() else {
            return Err(
                StructuralError::UnresolvedName("variant has no options".into(), "variant").into(),
            );
        };
        let mut options_out = Vec::with_capacity(options.len());
        for o in options {
            let class = self.type_spec_to_class(&o.ty)?;
            options_out.push(VariantOption {
                name: Intern::new(o.name.clone()),
                field: Field::materialized(class),
            });
        }
        let tag = v
            .tag
            .clone()
            .ok_or_else(|| StructuralError::UnresolvedName("tag".into(), "variant"))?;

        Ok(VariantFieldClass {
            tag: FieldRef::unresolved(tag),
            options: options_out,
            range_table: VariantRangeTable::default(),
        })
    }

    fn integer_spec(&self, i: &ast::IntegerSpec) -> Result<IntFieldClass, Error> {
        let size = i
            .size
            .ok_or_else(|| StructuralError::UnresolvedName("size".into(), "integer"))?;
        if size == 0 || size > 64 {
            return Err(StructuralError::IntegerTooWide(size).into());
        }
        let alignment = i.align.unwrap_or(if size % 8 == 0 { 8 } else { 1 });
        if !alignment.is_power_of_two() {
            return Err(StructuralError::AlignmentNotPowerOfTwo(alignment).into());
        }
        Ok(IntFieldClass {
            size: size as u8,
            signed: i.signed,
            byte_order: self.resolve_byte_order(i.byte_order)?,
            alignment,
            preferred_display_base: match i.base {
                Some(2) => PreferredDisplayBase::Binary,
                Some(8) => PreferredDisplayBase::Octal,
                Some(16) => PreferredDisplayBase::Hexadecimal,
                _ => PreferredDisplayBase::Decimal,
            },
            is_text_encoded: i.encoding.as_deref().is_some_and(|e| e != "none"),
            mapped_clock_class: i
                .map_clock
                .as_ref()
                .and_then(|n| self.clock_index_by_name.get(n).copied()),
            stored_value_index: None,
            meaning: None,
        })
    }

    fn float_spec(&self, f: &ast::FloatingPointSpec) -> Result<FloatFieldClass, Error> {
        let mant_dig = f
            .mant_dig
            .ok_or_else(|| StructuralError::UnresolvedName("mant_dig".into(), "floating_point"))?;
        let exp_dig = f
            .exp_dig
            .ok_or_else(|| StructuralError::UnresolvedName("exp_dig".into(), "floating_point"))?;
        let size = match (mant_dig, exp_dig) {
            (24, 8) => FloatSize::Bits32,
            (53, 11) => FloatSize::Bits64,
            _ => return Err(Error::InvalidFloatSize((mant_dig + exp_dig) as usize)),
        };
        Ok(FloatFieldClass {
            size,
            byte_order: self.resolve_byte_order(f.byte_order)?,
            alignment: f.align.unwrap_or(8),
        })
    }

    fn resolve_byte_order(&self, spec: Option<ast::ByteOrderSpec>) -> Result<ByteOrder, Error> {
        match spec {
            Some(ast::ByteOrderSpec::LittleEndian) => Ok(ByteOrder::LittleEndian),
            Some(ast::ByteOrderSpec::BigEndian) => Ok(ByteOrder::BigEndian),
            Some(ast::ByteOrderSpec::Native) | None => self.default_byte_order.ok_or_else(|| {
                StructuralError::DefaultByteOrderUnknown("byte_order = native".into()).into()
            }),
        }
    }

    fn lookup_alias(&self, name: &str) -> Result<&FieldClass, Error> {
        for bucket in ["a", "e", "s", "v"] {
            if let Some(c) = self.aliases.get(&format!("{bucket}:{name}")) {
                return Ok(c);
            }
        }
        Err(StructuralError::UnresolvedName(name.to_owned(), "type-alias").into())
    }

    /// A struct member named `timestamp`, `timestamp_begin`, or
    /// `timestamp_end` that is an unmapped integer auto-maps to the trace's
    /// sole clock class, synthesizing one at 1 GHz
    /// if none was declared. More than one declared clock with no explicit
    /// `map = clock.<name>.value` is ambiguous and rejected.
    fn auto_map_clock(&mut self, scope: Option<&Field>, canonical_name: &str) -> Result<(), Error> {
        let Some(scope) = scope else { return Ok(()) };
        let Some(s) = scope.class.as_struct() else { return Ok(()) };
        let Some(idx) = s.member_index(canonical_name) else { return Ok(()) };
        let FieldClass::Int(int_class) = &s.members[idx].field.class else { return Ok(()) };
        if int_class.mapped_clock_class.is_some() {
            return Ok(());
        }

        if self.clock_index_by_name.is_empty() {
            warn!(field = canonical_name, "no clock class declared; synthesizing implicit 1 GHz clock");
            let implicit = ClockClass::implicit();
            self.clock_index_by_name.insert(implicit.name.to_string(), self.clock_classes.len());
            self.clock_classes.push(implicit);
        } else if self.clock_index_by_name.len() > 1 {
            return Err(StructuralError::AmbiguousClockMapping(canonical_name.to_owned()).into());
        }
        Ok(())
    }
}

fn is_char_like(class: &FieldClass) -> bool {
    matches!(class, FieldClass::Int(i) if i.size == 8 && i.is_text_encoded)
}

fn reject_untagged_variant_alias(name: &str, class: &FieldClass) -> Result<(), Error> {
    if let FieldClass::Variant(v) = class {
        if v.tag.name.is_empty() {
            return Err(StructuralError::UntaggedVariantAtAliasSite(name.to_owned()).into());
        }
    }
    Ok(())
}

const CANONICAL_PACKET_HEADER: &[(&str, Meaning)] = &[
    ("magic", Meaning::Magic),
    ("uuid", Meaning::Uuid),
    ("stream_id", Meaning::StreamClassId),
    ("stream_instance_id", Meaning::DataStreamId),
];

const CANONICAL_PACKET_CONTEXT: &[(&str, Meaning)] = &[
    ("timestamp_begin", Meaning::PacketBeginTime),
    ("timestamp_end", Meaning::PacketEndTime),
    ("packet_size", Meaning::PacketTotalSize),
    ("content_size", Meaning::PacketContentSize),
    ("events_discarded", Meaning::DiscardedEventCounterSnapshot),
    ("packet_seq_num", Meaning::PacketCounterSnapshot),
];

const CANONICAL_EVENT_HEADER: &[(&str, Meaning)] = &[("id", Meaning::EventClassId)];

/// Tags canonically-named integer struct members with their [`Meaning`],
/// the last step before a scope's field tree is considered final. `field`
/// must already be a `Struct`; non-struct scopes (malformed
/// metadata) are left untagged and caught later by validation elsewhere.
fn tag_meanings(field: &mut Field, table: &[(&str, Meaning)]) {
    let FieldClass::Struct(s) = &mut field.class else { return };
    for (name, meaning) in table {
        if let Some(idx) = s.member_index(name) {
            if let FieldClass::Int(i) = &mut s.members[idx].field.class {
                i.meaning = Some(*meaning);
            }
        }
    }
}

fn has_meaning(field: &Field, meaning: Meaning) -> bool {
    let Some(s) = field.class.as_struct() else { return false };
    s.members
        .iter()
        .any(|m| matches!(&m.field.class, FieldClass::Int(i) if i.meaning == Some(meaning)))
}

/// Resolves sequence-length and variant-tag [`FieldRef`]s reachable from
/// `root`, assigning stored-value indices to their producer
/// Int fields and filling in each Variant's `range_table` from its tag
/// enum's mappings. `roots` supplies the scopes a reference may legally
/// point into; `default_scope` is used for unqualified (relative) names.
fn resolve_refs_in(
    root: &mut Field,
    default_scope: Scope,
    roots: &ScopeRoots,
    counter: &mut usize,
    assignments: &mut Vec<ProducerAssignment>,
) -> Result<(), Error> {
    resolve_refs_rec(root, default_scope, roots, counter, assignments)
}

fn resolve_refs_rec(
    field: &mut Field,
    default_scope: Scope,
    roots: &ScopeRoots,
    counter: &mut usize,
    assignments: &mut Vec<ProducerAssignment>,
) -> Result<(), Error> {
    match &mut field.class {
        FieldClass::Struct(s) => {
            for m in &mut s.members {
                resolve_refs_rec(&mut m.field, default_scope, roots, counter, assignments)?;
            }
        }
        FieldClass::StaticArray(a) => {
            if let Some(elem) = Arc::get_mut(&mut a.element) {
                resolve_refs_rec(elem, default_scope, roots, counter, assignments)?;
            }
        }
        FieldClass::DynamicArray(a) => {
            let (scope, names) = FieldPath::split_reference(&a.length_ref.name, default_scope);
            let scope_root = roots
                .get(scope)
                .ok_or_else(|| StructuralError::UnresolvedName(a.length_ref.name.clone(), "sequence length"))?;
            let indices = fieldpath::resolve(scope_root, &names)
                .ok_or_else(|| StructuralError::UnresolvedName(a.length_ref.name.clone(), "sequence length"))?;
            let index = assign_stored_value(counter);
            assignments.push((scope, indices.clone(), index));
            a.length_ref.resolved = Some((FieldPath::new(scope, indices), index));
            if let Some(elem) = Arc::get_mut(&mut a.element) {
                resolve_refs_rec(elem, default_scope, roots, counter, assignments)?;
            }
        }
        FieldClass::Variant(v) => {
            let (scope, names) = FieldPath::split_reference(&v.tag.name, default_scope);
            let scope_root = roots
                .get(scope)
                .ok_or_else(|| StructuralError::UnresolvedName(v.tag.name.clone(), "variant tag"))?;
            let indices = fieldpath::resolve(scope_root, &names)
                .ok_or_else(|| StructuralError::UnresolvedName(v.tag.name.clone(), "variant tag"))?;
            let tag_class = indices
                .iter()
                .try_fold(scope_root, |cur, &i| cur.as_struct().map(|s| &s.members[i].field.class));
            let index = assign_stored_value(counter);
            v.range_table = build_range_table(tag_class, v)?;
            assignments.push((scope, indices.clone(), index));
            v.tag.resolved = Some((FieldPath::new(scope, indices), index));
            for o in &mut v.options {
                resolve_refs_rec(&mut o.field, default_scope, roots, counter, assignments)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Builds a variant's `{range -> option_index}` table. When the tag
/// resolves to an enum field, each option name is looked up among the
/// enum's labels (the common TSDL form: `variant { struct a label_a; ... }
/// tag;` where `label_a` names an enumerator). Otherwise the tag is a bare
/// integer and option names must themselves parse as the matching value.
fn build_range_table(tag_class: Option<&FieldClass>, v: &VariantFieldClass) -> Result<VariantRangeTable, Error> {
    let mut entries = Vec::with_capacity(v.options.len());
    match tag_class {
        Some(FieldClass::Enum(e)) => {
            for (i, opt) in v.options.iter().enumerate() {
                let label = strip_leading_underscore(opt.name.as_str());
                let mapping = e
                    .mappings
                    .iter()
                    .find(|m| m.label.as_str() == label)
                    .ok_or_else(|| StructuralError::VariantOptionNotInTagEnum(opt.name.to_string()))?;
                entries.extend(mapping.ranges.iter().map(|&(lo, hi)| (lo, hi, i)));
            }
        }
        _ => {
            for (i, opt) in v.options.iter().enumerate() {
                let name = opt.name.as_str();
                let value = name
                    .parse::<i64>()
                    .map_err(|_| StructuralError::VariantOptionNotInTagEnum(name.to_owned()))?;
                entries.push((value, value, i));
            }
        }
    }
    Ok(VariantRangeTable { entries })
}

fn assign_stored_value(counter: &mut usize) -> usize {
    let idx = *counter;
    *counter += 1;
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_doc() -> ast::Document {
        ast::Document {
            trace: Some(ast::TraceBlock {
                major: Some(1),
                minor: Some(8),
                uuid: None,
                byte_order: Some(ast::ByteOrderSpec::LittleEndian),
                packet_header: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn reports_incomplete_without_a_trace_block() {
        let doc = ast::Document::default();
        match resolve(&doc).unwrap() {
            Outcome::Incomplete => {}
            Outcome::Complete(_) => panic!("expected Incomplete"),
        }
    }

    #[test]
    fn rejects_unsupported_tsdl_version() {
        let mut doc = base_doc();
        doc.trace.as_mut().unwrap().minor = Some(7);
        let err = resolve(&doc).unwrap_err();
        assert!(matches!(err, Error::Structural(StructuralError::UnsupportedVersion { .. })));
    }

    #[test]
    fn builds_a_minimal_trace_class() {
        let doc = base_doc();
        match resolve(&doc).unwrap() {
            Outcome::Complete(tc) => {
                assert_eq!(tc.major, 1);
                assert_eq!(tc.minor, 8);
                assert_eq!(tc.default_byte_order, ByteOrder::LittleEndian);
            }
            Outcome::Incomplete => panic!("expected Complete"),
        }
    }

    #[test]
    fn synthesizes_implicit_clock_for_unmapped_timestamp() {
        let mut doc = base_doc();
        doc.streams.push(ast::StreamBlock {
            id: Some(0),
            event_header: Some(ast::StructSpec {
                fields: Some(vec![ast::FieldSpec {
                    name: "timestamp".to_owned(),
                    ty: ast::TypeSpec::Integer(ast::IntegerSpec {
                        size: Some(64),
                        byte_order: Some(ast::ByteOrderSpec::LittleEndian),
                        ..Default::default()
                    }),
                }]),
                min_align: None,
            }),
            ..Default::default()
        });
        let tc = match resolve(&doc).unwrap() {
            Outcome::Complete(tc) => tc,
            Outcome::Incomplete => panic!("expected Complete"),
        };
        assert_eq!(tc.clock_classes.len(), 1);
        assert_eq!(tc.clock_classes[0].frequency, 1_000_000_000);
    }

    #[test]
    fn tags_packet_header_canonical_members() {
        let mut doc = base_doc();
        doc.trace.as_mut().unwrap().packet_header = Some(ast::StructSpec {
            fields: Some(vec![ast::FieldSpec {
                name: "magic".to_owned(),
                ty: ast::TypeSpec::Integer(ast::IntegerSpec {
                    size: Some(32),
                    byte_order: Some(ast::ByteOrderSpec::LittleEndian),
                    ..Default::default()
                }),
            }]),
            min_align: None,
        });
        let tc = match resolve(&doc).unwrap() {
            Outcome::Complete(tc) => tc,
            Outcome::Incomplete => panic!("expected Complete"),
        };
        let header = tc.packet_header.unwrap();
        let s = header.class.as_struct().unwrap();
        let magic = s.members[0].field.class.as_int().unwrap();
        assert_eq!(magic.meaning, Some(Meaning::Magic));
    }

    #[test]
    fn resolves_a_sequence_length_reference() {
        let mut doc = base_doc();
        doc.streams.push(ast::StreamBlock { id: Some(0), ..Default::default() });
        doc.events.push(ast::EventBlock {
            name: "evt".to_owned(),
            id: Some(0),
            stream_id: Some(0),
            fields: Some(ast::StructSpec {
                fields: Some(vec![
                    ast::FieldSpec {
                        name: "len".to_owned(),
                        ty: ast::TypeSpec::Integer(ast::IntegerSpec {
                            size: Some(16),
                            byte_order: Some(ast::ByteOrderSpec::LittleEndian),
                            ..Default::default()
                        }),
                    },
                    ast::FieldSpec {
                        name: "data".to_owned(),
                        ty: ast::TypeSpec::Sequence {
                            element: Box::new(ast::TypeSpec::Integer(ast::IntegerSpec {
                                size: Some(8),
                                byte_order: Some(ast::ByteOrderSpec::LittleEndian),
                                ..Default::default()
                            })),
                            length_ref: "len".to_owned(),
                        },
                    },
                ]),
                min_align: None,
            }),
            ..Default::default()
        });
        let tc = match resolve(&doc).unwrap() {
            Outcome::Complete(tc) => tc,
            Outcome::Incomplete => panic!("expected Complete"),
        };
        let payload = tc.stream_class(0).unwrap().event_class(0).unwrap().payload.as_ref().unwrap();
        let s = payload.class.as_struct().unwrap();
        let FieldClass::DynamicArray(arr) = &s.members[1].field.class else {
            panic!("expected a dynamic array")
        };
        let (path, index) = arr.length_ref.resolved.as_ref().unwrap();
        assert_eq!(path.root_scope, Scope::EventPayload);
        assert_eq!(path.indices, vec![0]);

        let len_field = s.members[0].field.class.as_int().unwrap();
        assert_eq!(len_field.stored_value_index, Some(*index));
    }
}
