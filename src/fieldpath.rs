//! Field-path resolver.
//!
//! Names in TSDL like `event.fields.len` or
//! `stream.packet.context.packet_size` resolve to a [`FieldPath`]: a root
//! scope plus a chain of member indices. Resolution happens once, during
//! the semantic pass ([`crate::metadata`]); BFCR and the message iterator
//! only ever follow an already-resolved path into the stored-values table.

use crate::fieldclass::FieldClass;

/// One of the six nested dynamic scopes of a CTF event, plus the two
/// containers a `FieldPath` can legally start from.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum Scope {
    PacketHeader,
    PacketContext,
    EventHeader,
    EventCommonContext,
    EventSpecificContext,
    EventPayload,
}

/// A compile-time-resolved reference to a field: which scope it lives in,
/// and the chain of struct-member indices to follow to reach it.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct FieldPath {
    pub root_scope: Scope,
    pub indices: Vec<usize>,
}

impl FieldPath {
    pub fn new(root_scope: Scope, indices: Vec<usize>) -> Self {
        Self { root_scope, indices }
    }

    /// Strips a leading underscore from a TSDL field name, the convention
    /// that lets a field shadow a reserved word. Preserved verbatim; not
    /// documented by CTF 1.8 itself.
    pub fn normalize_name(name: &str) -> &str {
        name.strip_prefix('_').unwrap_or(name)
    }

    /// Parses a dotted TSDL field reference (e.g. `stream.packet.context.len`,
    /// or a relative reference like `len` resolved against `default_scope`)
    /// into a root scope and a sequence of member names still to be
    /// resolved to indices by [`resolve`].
    pub fn split_reference(reference: &str, default_scope: Scope) -> (Scope, Vec<String>) {
        let parts: Vec<&str> = reference.split('.').collect();
        let (scope, rest): (Scope, &[&str]) = match parts.as_slice() {
            ["trace", "packet", "header", rest @ ..] => (Scope::PacketHeader, rest),
            ["stream", "packet", "context", rest @ ..] => (Scope::PacketContext, rest),
            ["stream", "event", "header", rest @ ..] => (Scope::EventHeader, rest),
            ["stream", "event", "context", rest @ ..] => (Scope::EventCommonContext, rest),
            ["event", "context", rest @ ..] => (Scope::EventSpecificContext, rest),
            ["event", "fields", rest @ ..] => (Scope::EventPayload, rest),
            rest => (default_scope, rest),
        };
        (
            scope,
            rest.iter().map(|s| Self::normalize_name(s).to_owned()).collect(),
        )
    }
}

/// Walks `root` following `names`, matching struct members after
/// underscore-stripping both sides, and returns the resolved index chain.
/// Returns `None` on the first name that can't be found, or if the path
/// descends into a non-struct field class before names are exhausted.
pub fn resolve(root: &FieldClass, names: &[String]) -> Option<Vec<usize>> {
    let mut indices = Vec::with_capacity(names.len());
    let mut current = root;
    for name in names {
        let s = current.as_struct()?;
        let idx = s
            .members
            .iter()
            .position(|m| FieldPath::normalize_name(m.name.as_str()) == name)?;
        indices.push(idx);
        current = &s.members[idx].field.class;
    }
    Some(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fieldclass::{
        ByteOrder, Field, FieldClass, IntFieldClass, PreferredDisplayBase, StructFieldClass,
        StructMember,
    };
    use internment::Intern;

    fn int_class() -> FieldClass {
        FieldClass::Int(IntFieldClass {
            size: 32,
            signed: false,
            byte_order: ByteOrder::LittleEndian,
            alignment: 8,
            preferred_display_base: PreferredDisplayBase::Decimal,
            is_text_encoded: false,
            mapped_clock_class: None,
            stored_value_index: None,
            meaning: None,
        })
    }

    #[test]
    fn resolves_nested_struct_path() {
        let inner = FieldClass::Struct(StructFieldClass {
            members: vec![StructMember {
                name: Intern::new("len".to_owned()),
                field: Field::materialized(int_class()),
            }],
            alignment: 8,
        });
        let root = FieldClass::Struct(StructFieldClass {
            members: vec![StructMember {
                name: Intern::new("_inner".to_owned()),
                field: Field::materialized(inner),
            }],
            alignment: 8,
        });

        let (scope, names) = FieldPath::split_reference("event.fields.inner.len", Scope::EventPayload);
        assert_eq!(scope, Scope::EventPayload);
        assert_eq!(names, vec!["inner".to_owned(), "len".to_owned()]);

        let indices = resolve(&root, &names).unwrap();
        assert_eq!(indices, vec![0, 0]);
    }

    #[test]
    fn relative_reference_uses_default_scope() {
        let (scope, names) = FieldPath::split_reference("len", Scope::EventPayload);
        assert_eq!(scope, Scope::EventPayload);
        assert_eq!(names, vec!["len".to_owned()]);
    }

    #[test]
    fn unresolvable_name_returns_none() {
        let root = FieldClass::Struct(StructFieldClass { members: vec![], alignment: 8 });
        assert!(resolve(&root, &["missing".to_owned()]).is_none());
    }
}
