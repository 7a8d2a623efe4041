//! The field class tree: the *type* of a CTF field.
//!
//! A field class is a tagged variant over the basic and compound CTF field
//! kinds. The tree is built once by the semantic pass ([`crate::metadata`])
//! and is immutable afterwards; [`crate::bfcr`] walks it read-only while
//! decoding packet bytes.

use crate::fieldpath::FieldPath;
use internment::Intern;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Byte order of a basic field's wire representation.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Preferred radix for rendering an integer value; carried through from the
/// field class so a downstream pretty-printer (out of scope here) doesn't
/// need to re-derive it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub enum PreferredDisplayBase {
    Binary,
    Octal,
    #[default]
    Decimal,
    Hexadecimal,
}

/// The canonical role of a named Int field. Discovered once by the
/// semantic pass at a canonical name in a canonical scope, consumed by the
/// message iterator on every decode.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Meaning {
    Magic,
    Uuid,
    StreamClassId,
    DataStreamId,
    EventClassId,
    PacketTotalSize,
    PacketContentSize,
    PacketBeginTime,
    PacketEndTime,
    DiscardedEventCounterSnapshot,
    PacketCounterSnapshot,
}

/// An index into the per-iterator stored-values table.
pub type StoredValueIndex = usize;

/// An index into the trace class's ordered clock class list.
pub type ClockClassIndex = usize;

#[derive(Clone, Debug)]
pub struct IntFieldClass {
    /// Width in bits, 1..=64.
    pub size: u8,
    pub signed: bool,
    pub byte_order: ByteOrder,
    /// A power of two, bits.
    pub alignment: u64,
    pub preferred_display_base: PreferredDisplayBase,
    /// `true` when this integer's bytes should be interpreted as UTF-8 text
    /// (an `encoding` hint rather than a distinct wire format).
    pub is_text_encoded: bool,
    pub mapped_clock_class: Option<ClockClassIndex>,
    pub stored_value_index: Option<StoredValueIndex>,
    pub meaning: Option<Meaning>,
}

impl IntFieldClass {
    pub fn mask(&self) -> u64 {
        if self.size >= 64 {
            u64::MAX
        } else {
            (1u64 << self.size) - 1
        }
    }
}

/// One `{label, ranges}` mapping of an enumeration. Ranges are inclusive
/// and may overlap; the first matching mapping (in declared order) wins.
#[derive(Clone, Debug)]
pub struct EnumMapping {
    pub label: Intern<String>,
    pub ranges: Vec<(i64, i64)>,
}

impl EnumMapping {
    pub fn contains(&self, value: i64) -> bool {
        self.ranges.iter().any(|(lo, hi)| value >= *lo && value <= *hi)
    }
}

#[derive(Clone, Debug)]
pub struct EnumFieldClass {
    pub underlying: IntFieldClass,
    /// Declaration order matters for de-underscored label lookup and for
    /// variant tag range-table construction.
    pub mappings: Vec<EnumMapping>,
}

impl EnumFieldClass {
    /// Returns the label, if any, whose range contains `value`.
    ///
    /// Leading underscores on labels were stripped when the mapping was
    /// registered (see [`crate::metadata::strip_leading_underscore`]).
    pub fn label(&self, value: i64) -> Option<Intern<String>> {
        self.mappings
            .iter()
            .find(|m| m.contains(value))
            .map(|m| m.label)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FloatSize {
    Bits32,
    Bits64,
}

#[derive(Clone, Debug)]
pub struct FloatFieldClass {
    pub size: FloatSize,
    pub byte_order: ByteOrder,
    pub alignment: u64,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum StringEncoding {
    Utf8,
    None,
}

#[derive(Clone, Debug)]
pub struct StringFieldClass {
    pub encoding: StringEncoding,
}

#[derive(Clone, Debug)]
pub struct StructMember {
    pub name: Intern<String>,
    pub field: Field,
}

#[derive(Clone, Debug)]
pub struct StructFieldClass {
    pub members: Vec<StructMember>,
    pub alignment: u64,
}

impl StructFieldClass {
    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name.as_str() == name)
    }
}

/// How a variant's tag, or a dynamic array's length, refers to a producer
/// field. Before resolution only the textual name is known; after
/// resolution the field path and stored-value index are filled in.
#[derive(Clone, Debug)]
pub struct FieldRef {
    pub name: String,
    pub resolved: Option<(FieldPath, StoredValueIndex)>,
}

impl FieldRef {
    pub fn unresolved(name: impl Into<String>) -> Self {
        Self { name: name.into(), resolved: None }
    }
}

#[derive(Clone, Debug)]
pub struct VariantOption {
    pub name: Intern<String>,
    pub field: Field,
}

/// A precomputed `{range -> option_index}` table derived from the tag
/// enum's mappings, so BFCR can select a variant option without walking
/// labels on every decode.
#[derive(Clone, Debug, Default)]
pub struct VariantRangeTable {
    pub entries: Vec<(i64, i64, usize)>,
}

impl VariantRangeTable {
    pub fn select(&self, tag_value: i64) -> Option<usize> {
        self.entries
            .iter()
            .find(|(lo, hi, _)| tag_value >= *lo && tag_value <= *hi)
            .map(|(_, _, idx)| *idx)
    }
}

#[derive(Clone, Debug)]
pub struct VariantFieldClass {
    pub tag: FieldRef,
    pub options: Vec<VariantOption>,
    pub range_table: VariantRangeTable,
}

impl VariantFieldClass {
    pub fn option_by_name(&self, name: &str) -> Option<usize> {
        self.options.iter().position(|o| o.name.as_str() == name)
    }
}

#[derive(Clone, Debug)]
pub struct StaticArrayFieldClass {
    pub element: Arc<Field>,
    pub length: u64,
    pub is_text: bool,
}

#[derive(Clone, Debug)]
pub struct DynamicArrayFieldClass {
    pub element: Arc<Field>,
    pub length_ref: FieldRef,
    pub is_text: bool,
}

/// The type of a CTF field. `Clone` performs the structural deep copy
/// that type-alias registration requires — mutating a field inside one
/// clone never affects another, since every compound variant clones its
/// member vectors by value.
#[derive(Clone, Debug)]
pub enum FieldClass {
    Int(IntFieldClass),
    Enum(EnumFieldClass),
    Float(FloatFieldClass),
    String(StringFieldClass),
    Struct(StructFieldClass),
    Variant(VariantFieldClass),
    StaticArray(StaticArrayFieldClass),
    DynamicArray(DynamicArrayFieldClass),
}

/// A field class annotated with whether the decoder should materialize it
/// in the emitted message (`in_ir`). This is the node type actually stored
/// inside compound classes (struct members, array/sequence elements,
/// variant options) and passed as BFCR's root.
#[derive(Clone, Debug)]
pub struct Field {
    pub class: FieldClass,
    pub in_ir: bool,
}

impl Field {
    pub fn materialized(class: FieldClass) -> Self {
        Self { class, in_ir: true }
    }

    pub fn hidden(class: FieldClass) -> Self {
        Self { class, in_ir: false }
    }
}

impl FieldClass {
    pub fn is_compound(&self) -> bool {
        matches!(
            self,
            FieldClass::Struct(_)
                | FieldClass::Variant(_)
                | FieldClass::StaticArray(_)
                | FieldClass::DynamicArray(_)
        )
    }

    pub fn alignment(&self) -> u64 {
        match self {
            FieldClass::Int(c) => c.alignment,
            FieldClass::Enum(c) => c.underlying.alignment,
            FieldClass::Float(c) => c.alignment,
            FieldClass::String(_) => 8,
            FieldClass::Struct(c) => c.alignment,
            FieldClass::Variant(c) => {
                c.options.iter().map(|o| o.field.class.alignment()).max().unwrap_or(1)
            }
            FieldClass::StaticArray(c) => c.element.class.alignment(),
            FieldClass::DynamicArray(c) => c.element.class.alignment(),
        }
    }

    pub fn as_int(&self) -> Option<&IntFieldClass> {
        match self {
            FieldClass::Int(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructFieldClass> {
        match self {
            FieldClass::Struct(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_variant(&self) -> Option<&VariantFieldClass> {
        match self {
            FieldClass::Variant(c) => Some(c),
            _ => None,
        }
    }
}

/// Scratch-built mapping of alias-scope names to field classes, used by the
/// semantic pass while resolving type specifiers. Keyed by a bucket-prefixed
/// name (`a:`/`e:`/`s:`/`v:`) so aliases registered in different TSDL scopes
/// never collide in one flat map.
pub type AliasTable = BTreeMap<String, FieldClass>;
