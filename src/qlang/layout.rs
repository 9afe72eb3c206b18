//! Compiled class metadata: member offsets and the method table.
//!
//! Reflection works by data, not by types: the editor's property panel and
//! the typed instance accessors both consult this table at run time.

use {
    super::{abi::RawMethodFn, types::QType, value::QValue},
    std::collections::HashMap,
};

/// One member slot inside instance memory.
#[derive(Clone, Debug)]
pub struct MemberLayout {
    pub name: String,
    pub ty: QType,
    /// Numeric type id persisted in `.qm` member records.
    pub type_token: i32,
    pub type_name: String,
    pub offset: u32,
    /// Literal initializer applied after zero-init, if declared.
    pub default: Option<QValue>,
}

/// Signature and native entry point of one compiled method.
#[derive(Clone)]
pub struct CompiledMethod {
    pub name: String,
    /// JIT symbol of the defining class (`Defining::method`); inherited
    /// entries keep the ancestor's symbol so later compilations link the
    /// right code.
    pub symbol: String,
    pub param_types: Vec<QType>,
    pub return_type: QType,
    pub entry: RawMethodFn,
}

impl std::fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("name", &self.name)
            .field("param_types", &self.param_types)
            .field("return_type", &self.return_type)
            .finish_non_exhaustive()
    }
}

/// Post-compile record of a class: memory layout plus dispatch table.
#[derive(Clone, Debug)]
pub struct ClassLayout {
    pub name: String,
    pub parent_name: Option<String>,
    /// Self plus every ancestor, nearest first; answers `is_a` checks
    /// without a registry lookup.
    pub lineage: Vec<String>,
    /// Declaration order; inherited members come first and keep their
    /// original offsets.
    pub members: Vec<MemberLayout>,
    /// Instance size including trailing alignment padding.
    pub total_size: u32,
    pub methods: HashMap<String, CompiledMethod>,
    /// Own methods in declaration order; drives `.qm` metadata output.
    pub method_order: Vec<String>,
    pub is_static: bool,
}

impl ClassLayout {
    pub fn member(&self, name: &str) -> Option<&MemberLayout> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&CompiledMethod> {
        self.methods.get(name)
    }

    /// Declared return type name for metadata, `"null"` when the method
    /// returns nothing.
    pub fn method_return_type(&self, name: &str) -> Option<&str> {
        self.methods.get(name).map(|m| m.return_type.type_name())
    }
}

fn align_up(offset: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

/// Assign offsets to members in source order. Each member lands at the
/// cumulative size of its predecessors aligned up to its own natural
/// alignment; the total includes trailing padding to the largest alignment
/// seen.
pub fn compute_member_offsets(
    inherited: &[MemberLayout],
    own: impl IntoIterator<Item = (String, QType, Option<QValue>)>,
) -> (Vec<MemberLayout>, u32) {
    let mut members: Vec<MemberLayout> = inherited.to_vec();
    let mut offset = members
        .last()
        .map(|m| m.offset + m.ty.size())
        .unwrap_or(0);
    let mut max_align = members.iter().map(|m| m.ty.align()).max().unwrap_or(1);

    for (name, ty, default) in own {
        let align = ty.align();
        max_align = max_align.max(align);
        offset = align_up(offset, align);
        members.push(MemberLayout {
            type_token: ty.token_id(),
            type_name: ty.type_name().to_owned(),
            name,
            ty,
            offset,
            default,
        });
        offset += members.last().map(|m| m.ty.size()).unwrap_or(0);
    }

    (members, align_up(offset, max_align))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(name: &str, ty: QType) -> (String, QType, Option<QValue>) {
        (name.to_owned(), ty, None)
    }

    #[test]
    fn two_floats_pack_tightly() {
        let (members, size) = compute_member_offsets(
            &[],
            [m("x", QType::Float32), m("y", QType::Float32)],
        );
        assert_eq!(members[0].offset, 0);
        assert_eq!(members[1].offset, 4);
        assert_eq!(size, 8);
    }

    #[test]
    fn natural_alignment_inserts_padding() {
        let (members, size) = compute_member_offsets(
            &[],
            [
                m("flag", QType::Bool),
                m("count", QType::Int32),
                m("big", QType::Int64),
            ],
        );
        assert_eq!(members[0].offset, 0);
        assert_eq!(members[1].offset, 4);
        assert_eq!(members[2].offset, 8);
        assert_eq!(size, 16);
    }

    #[test]
    fn trailing_padding_to_max_alignment() {
        let (_, size) = compute_member_offsets(
            &[],
            [m("big", QType::Int64), m("flag", QType::Bool)],
        );
        assert_eq!(size, 16);
    }

    #[test]
    fn inherited_members_keep_offsets() {
        let (base, _) = compute_member_offsets(&[], [m("a", QType::Int32)]);
        let (derived, size) = compute_member_offsets(&base, [m("b", QType::Int32)]);
        assert_eq!(derived[0].name, "a");
        assert_eq!(derived[0].offset, 0);
        assert_eq!(derived[1].offset, 4);
        assert_eq!(size, 8);
    }

    #[test]
    fn layout_is_deterministic() {
        let build = || {
            compute_member_offsets(
                &[],
                [
                    m("a", QType::Bool),
                    m("b", QType::Float64),
                    m("c", QType::Int32),
                ],
            )
        };
        let (first, size_a) = build();
        let (second, size_b) = build();
        assert_eq!(size_a, size_b);
        for (lhs, rhs) in first.iter().zip(&second) {
            assert_eq!(lhs.offset, rhs.offset);
            assert_eq!(lhs.name, rhs.name);
        }
    }
}
