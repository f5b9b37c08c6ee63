//! Structural signatures for interface conformance.
//!
//! A signature is the ordered set of members a type exposes. Conformance is
//! set containment over member keys (`name|kind|type`): a type satisfies an
//! interface when every member of the interface appears with the same kind
//! and the same type reference.

use hashbrown::HashSet;

use crate::type_ref::TypeRef;
use crate::types::MemberKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberSig {
    pub name: String,
    pub kind: MemberKind,
    pub type_ref: TypeRef,
}

impl MemberSig {
    pub fn new(name: impl Into<String>, kind: MemberKind, type_ref: TypeRef) -> Self {
        Self {
            name: name.into(),
            kind,
            type_ref,
        }
    }

    /// Canonical key compared during conformance checks.
    pub fn key(&self) -> String {
        format!("{}|{}|{}", self.name, self.kind as u8, self.type_ref)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Signature {
    /// Declaration order is kept for display and metadata export.
    members: Vec<MemberSig>,
    keys: HashSet<String>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_members(members: impl IntoIterator<Item = MemberSig>) -> Self {
        let mut sig = Self::new();
        for m in members {
            sig.push(m);
        }
        sig
    }

    /// Add a member. Returns false if an identical member was already present.
    pub fn push(&mut self, member: MemberSig) -> bool {
        if self.keys.insert(member.key()) {
            self.members.push(member);
            true
        } else {
            false
        }
    }

    pub fn members(&self) -> &[MemberSig] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &MemberSig) -> bool {
        self.keys.contains(&member.key())
    }

    pub fn find(&self, name: &str) -> Option<&MemberSig> {
        self.members.iter().find(|m| m.name == name)
    }

    /// True if every member of `required` is present here.
    pub fn is_superset_of(&self, required: &Signature) -> bool {
        required.keys.iter().all(|k| self.keys.contains(k))
    }

    /// Members of `required` missing from this signature, in declaration order.
    pub fn missing<'a>(&self, required: &'a Signature) -> Vec<&'a MemberSig> {
        required
            .members
            .iter()
            .filter(|m| !self.contains(m))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(members: &[(&str, MemberKind, &str)]) -> Signature {
        Signature::from_members(
            members
                .iter()
                .map(|(n, k, t)| MemberSig::new(*n, *k, TypeRef::named(*t))),
        )
    }

    #[test]
    fn test_member_key() {
        let m = MemberSig::new("GetValue", MemberKind::Function, TypeRef::named("builtins.Boolean"));
        assert_eq!(m.key(), "GetValue|2|builtins.Boolean");
    }

    #[test]
    fn test_superset() {
        let iface = sig(&[("Name", MemberKind::Property, "builtins.String")]);
        let full = sig(&[
            ("Name", MemberKind::Property, "builtins.String"),
            ("Age", MemberKind::Property, "builtins.Integer"),
        ]);
        assert!(full.is_superset_of(&iface));
        assert!(!iface.is_superset_of(&full));
        assert!(full.is_superset_of(&Signature::new()));
    }

    #[test]
    fn test_kind_and_type_must_match() {
        let iface = sig(&[("Name", MemberKind::Property, "builtins.String")]);
        let wrong_kind = sig(&[("Name", MemberKind::Function, "builtins.String")]);
        let wrong_type = sig(&[("Name", MemberKind::Property, "builtins.Integer")]);
        assert!(!wrong_kind.is_superset_of(&iface));
        assert_eq!(wrong_type.missing(&iface).len(), 1);
    }

    #[test]
    fn test_push_dedup() {
        let mut s = Signature::new();
        let m = MemberSig::new("Clone", MemberKind::Function, TypeRef::any());
        assert!(s.push(m.clone()));
        assert!(!s.push(m));
        assert_eq!(s.len(), 1);
    }
}
