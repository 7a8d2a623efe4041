//! The TSDL AST: an external collaborator's input. This module defines the
//! *type* an external TSDL lexer/parser would hand to [`super::resolve`] —
//! this crate does not tokenize or parse `.tsdl`/CTF metadata text itself,
//! only describes the schema a parser would populate.
//!
//! Deriving `serde::Deserialize` here gives demos and tests a way to load a
//! `Document` from a file (JSON, in this crate's demos) without this crate
//! owning a TSDL front-end itself.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrderSpec {
    LittleEndian,
    BigEndian,
    /// `byte_order = native` — resolved against the trace block's default.
    Native,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct IntegerSpec {
    pub size: Option<u64>,
    pub signed: bool,
    pub byte_order: Option<ByteOrderSpec>,
    pub align: Option<u64>,
    pub base: Option<u64>,
    pub encoding: Option<String>,
    pub map_clock: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FloatingPointSpec {
    pub mant_dig: Option<u64>,
    pub exp_dig: Option<u64>,
    pub byte_order: Option<ByteOrderSpec>,
    pub align: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnumeratorSpec {
    pub label: String,
    pub range: (i64, i64),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EnumSpec {
    pub underlying: Box<TypeSpec>,
    pub enumerators: Vec<EnumeratorSpec>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FieldSpec {
    pub name: String,
    pub ty: TypeSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StructSpec {
    /// `None` here is a forward reference to a struct alias registered
    /// elsewhere (`struct name;` with no body).
    pub fields: Option<Vec<FieldSpec>>,
    pub min_align: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VariantSpec {
    pub tag: Option<String>,
    pub options: Option<Vec<FieldSpec>>,
}

/// A C-like declarator suffix: a plain type, a fixed-length array of it, or
/// a length-referencing sequence of it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TypeSpec {
    Integer(IntegerSpec),
    FloatingPoint(FloatingPointSpec),
    String { encoding: Option<String> },
    Enum(EnumSpec),
    Struct(StructSpec),
    Variant(VariantSpec),
    /// A named reference to a previously-registered type alias.
    Alias(String),
    Array { element: Box<TypeSpec>, length: u64 },
    Sequence { element: Box<TypeSpec>, length_ref: String },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvValue {
    Integer(i64),
    String(String),
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TraceBlock {
    pub major: Option<u64>,
    pub minor: Option<u64>,
    pub uuid: Option<String>,
    pub byte_order: Option<ByteOrderSpec>,
    pub packet_header: Option<StructSpec>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClockBlock {
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub freq: Option<u64>,
    pub precision: Option<u64>,
    pub offset_s: Option<i64>,
    pub offset: Option<u64>,
    pub absolute: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventBlock {
    pub name: String,
    pub id: Option<u64>,
    pub stream_id: Option<u64>,
    pub loglevel: Option<i64>,
    pub model_emf_uri: Option<String>,
    pub context: Option<StructSpec>,
    pub fields: Option<StructSpec>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StreamBlock {
    pub id: Option<u64>,
    pub event_header: Option<StructSpec>,
    pub event_context: Option<StructSpec>,
    pub packet_context: Option<StructSpec>,
}

/// A full TSDL document: the trace block, clock blocks, named type-alias
/// registrations (bucketed by `a`/`e`/`s`/`v` kind),
/// stream blocks, and event blocks, in declaration order (order matters:
/// "native" byte order can't resolve before the trace block is seen).
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Document {
    pub trace: Option<TraceBlock>,
    pub env: BTreeMap<String, EnvValue>,
    pub clocks: Vec<ClockBlock>,
    pub type_aliases: Vec<(String, TypeSpec)>,
    pub streams: Vec<StreamBlock>,
    pub events: Vec<EventBlock>,
}
