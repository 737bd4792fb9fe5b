//! Coverage filters.
//!
//! Filters recognize compiler-synthesized code regions and mark them for
//! exclusion from coverage accounting: the generated sequences were never
//! written by anyone, so counting them as missed code only produces noise.
//! Each filter inspects one method at a time through the pattern matcher
//! and yields [`FilterMatch`] ranges.

use crate::matcher::{FilterMatch, InsnMatcher, VarAccess};
use crate::unit::{Method, Opcode, OpcodeKind};

/// A rule that excludes recognized code patterns from coverage accounting
pub trait Filter {
    /// Short name, for diagnostics
    fn name(&self) -> &'static str;

    /// Ranges of `method` to exclude from all counters
    fn matches(&self, method: &Method) -> Vec<FilterMatch>;
}

/// Excludes compiler-generated field accessors
///
/// Matches synthetic methods whose whole body is "load self, read one
/// field, return it" - the accessor bridges generated for inner-class
/// field access.
#[derive(Debug, Default)]
pub struct SyntheticAccessorFilter;

impl Filter for SyntheticAccessorFilter {
    fn name(&self) -> &'static str {
        "synthetic-accessor"
    }

    fn matches(&self, method: &Method) -> Vec<FilterMatch> {
        if !method.synthetic {
            return Vec::new();
        }
        let mut matcher = InsnMatcher::new(method);
        matcher
            .first_is_self_load()
            .next_is_kind(OpcodeKind::FieldGet)
            .next_is_kind(OpcodeKind::Return);
        match matcher.matched_from(0) {
            // Whole-body pattern: nothing may follow the return.
            Some(m) if method.next_insn(m.end + 1).is_none() => {
                vec![FilterMatch::new(0, method.body.len() - 1)]
            }
            _ => Vec::new(),
        }
    }
}

/// Excludes synthetic bridge methods
///
/// Matches synthetic forwarders: load self, load each argument in slot
/// order, invoke the bridged target once, return. Generics erasure and
/// visibility bridges take this shape.
#[derive(Debug, Default)]
pub struct BridgeMethodFilter;

impl Filter for BridgeMethodFilter {
    fn name(&self) -> &'static str {
        "bridge-method"
    }

    fn matches(&self, method: &Method) -> Vec<FilterMatch> {
        if !method.synthetic {
            return Vec::new();
        }
        let mut matcher = InsnMatcher::new(method);
        matcher.first_is_self_load();
        // Zero or more argument loads ahead of the single invoke.
        let mut arg = 0u16;
        while !matcher.is_failed() {
            let peek = matcher
                .cursor()
                .and_then(|c| method.next_insn(c + 1))
                .and_then(|i| method.body[i].opcode());
            if !matches!(peek, Some(Opcode::LoadLocal(_))) {
                break;
            }
            arg += 1;
            matcher.next_is_var(VarAccess::Load, &format!("arg{arg}"));
        }
        matcher
            .next_is_kind(OpcodeKind::Invoke)
            .next_is_kind(OpcodeKind::Return);
        match matcher.matched_from(0) {
            Some(m) if method.next_insn(m.end + 1).is_none() => {
                vec![FilterMatch::new(0, method.body.len() - 1)]
            }
            _ => Vec::new(),
        }
    }
}

/// The filters applied during analysis
pub struct FilterSet {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterSet {
    /// An empty set: nothing is excluded
    #[must_use]
    pub fn none() -> Self {
        Self { filters: Vec::new() }
    }

    /// Add a filter to the set
    #[must_use]
    pub fn with(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    /// All matches of all filters against one method
    #[must_use]
    pub fn matches(&self, method: &Method) -> Vec<FilterMatch> {
        self.filters
            .iter()
            .flat_map(|f| f.matches(method))
            .collect()
    }

    /// Per-node exclusion flags for one method body
    #[must_use]
    pub fn excluded_nodes(&self, method: &Method) -> Vec<bool> {
        let mut excluded = vec![false; method.body.len()];
        for m in self.matches(method) {
            for flag in excluded
                .iter_mut()
                .take(m.end + 1)
                .skip(m.start)
            {
                *flag = true;
            }
        }
        excluded
    }
}

impl Default for FilterSet {
    /// The standard filters: synthetic accessors and bridge methods
    fn default() -> Self {
        Self::none()
            .with(SyntheticAccessorFilter)
            .with(BridgeMethodFilter)
    }
}

impl std::fmt::Debug for FilterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.filters.iter().map(|x| x.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{MemberRef, Node, Opcode};

    fn accessor(synthetic: bool) -> Method {
        let m = Method::new("access$000", "()I", 1).with_body(vec![
            Node::Line(1),
            Node::Insn(Opcode::LoadSelf),
            Node::Insn(Opcode::GetField(MemberRef::new("A", "x", "I"))),
            Node::Insn(Opcode::ReturnValue),
        ]);
        if synthetic {
            m.synthetic()
        } else {
            m
        }
    }

    fn bridge() -> Method {
        Method::new("get", "(I)Ljava/lang/Object;", 2)
            .with_body(vec![
                Node::Insn(Opcode::LoadSelf),
                Node::Insn(Opcode::LoadLocal(1)),
                Node::Insn(Opcode::Invoke(MemberRef::new("A", "get", "(I)Ljava/lang/String;"))),
                Node::Insn(Opcode::ReturnValue),
            ])
            .synthetic()
    }

    #[test]
    fn test_accessor_filter_excludes_whole_body() {
        let method = accessor(true);
        let matches = SyntheticAccessorFilter.matches(&method);
        assert_eq!(matches, vec![FilterMatch::new(0, 3)]);
    }

    #[test]
    fn test_accessor_filter_ignores_handwritten_getter() {
        // Same shape, but not compiler-synthesized.
        let method = accessor(false);
        assert!(SyntheticAccessorFilter.matches(&method).is_empty());
    }

    #[test]
    fn test_bridge_filter_matches_forwarder() {
        let method = bridge();
        let matches = BridgeMethodFilter.matches(&method);
        assert_eq!(matches, vec![FilterMatch::new(0, 3)]);
    }

    #[test]
    fn test_bridge_filter_rejects_extra_logic() {
        let method = Method::new("get", "(I)I", 2)
            .with_body(vec![
                Node::Insn(Opcode::LoadSelf),
                Node::Insn(Opcode::LoadLocal(1)),
                Node::Insn(Opcode::Invoke(MemberRef::new("A", "get", "(I)I"))),
                Node::Insn(Opcode::Const(1)),
                Node::Insn(Opcode::Add),
                Node::Insn(Opcode::ReturnValue),
            ])
            .synthetic();
        assert!(BridgeMethodFilter.matches(&method).is_empty());
    }

    #[test]
    fn test_filter_set_flags_nodes() {
        let method = accessor(true);
        let excluded = FilterSet::default().excluded_nodes(&method);
        assert_eq!(excluded, vec![true; 4]);
    }

    #[test]
    fn test_empty_filter_set_excludes_nothing() {
        let method = accessor(true);
        let excluded = FilterSet::none().excluded_nodes(&method);
        assert!(excluded.iter().all(|&flag| !flag));
    }
}
