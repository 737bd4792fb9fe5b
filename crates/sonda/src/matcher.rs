//! Sequential instruction-pattern matcher.
//!
//! Filters recognize compiler-synthesized idioms by walking a method body
//! with an [`InsnMatcher`]: a single-direction, non-backtracking cursor.
//! Once any step fails the cursor is failed for good and every further step
//! is a no-op, so multi-instruction patterns compose as a flat sequence of
//! "next is X" calls without explicit branching. A successful pattern spans
//! a contiguous node range reported as a [`FilterMatch`]; a failed pattern
//! yields nothing.

use crate::unit::{Method, Node, Opcode, OpcodeKind};
use std::collections::HashMap;

/// A matched node range within one method body, inclusive on both ends
///
/// Instructions inside the range are excluded from every coverage counter,
/// as if they did not exist structurally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterMatch {
    /// First node of the matched range
    pub start: usize,
    /// Last node of the matched range
    pub end: usize,
}

impl FilterMatch {
    /// Create a match over an inclusive node range
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Whether the given node index falls inside the range
    #[must_use]
    pub const fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }
}

/// Cursor state: the last matched node, or failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Matching so far; value is the node index of the last match
    At(usize),
    /// Before the first match step
    Start,
    /// A step failed; sticky
    Failed,
}

/// Local-variable access direction, for [`InsnMatcher::next_is_var`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAccess {
    /// A local load
    Load,
    /// A local store
    Store,
}

/// Non-backtracking cursor matcher over one method body
///
/// Every operation is total: on a failed cursor it simply keeps the cursor
/// failed. Operations return `&mut Self` so patterns chain.
#[derive(Debug)]
pub struct InsnMatcher<'a> {
    method: &'a Method,
    cursor: Cursor,
    /// Named slot bindings from successful variable matches
    vars: HashMap<String, u16>,
}

impl<'a> InsnMatcher<'a> {
    /// Create a matcher positioned before the method's first node
    #[must_use]
    pub fn new(method: &'a Method) -> Self {
        Self {
            method,
            cursor: Cursor::Start,
            vars: HashMap::new(),
        }
    }

    /// Node index of the last matched instruction, unless failed
    #[must_use]
    pub const fn cursor(&self) -> Option<usize> {
        match self.cursor {
            Cursor::At(i) => Some(i),
            Cursor::Start | Cursor::Failed => None,
        }
    }

    /// Whether any step has failed
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self.cursor, Cursor::Failed)
    }

    /// Slot bound to a variable name by an earlier `next_is_var`
    #[must_use]
    pub fn bound_slot(&self, name: &str) -> Option<u16> {
        self.vars.get(name).copied()
    }

    /// Fail the cursor unconditionally
    pub fn fail(&mut self) -> &mut Self {
        self.cursor = Cursor::Failed;
        self
    }

    /// Succeeds only if the method's very first instruction loads the
    /// enclosing instance reference; positions the cursor on it
    ///
    /// This is the entry check of instance-initializer and accessor
    /// patterns. Restarting drops any slot bindings from a previous
    /// pattern.
    pub fn first_is_self_load(&mut self) -> &mut Self {
        self.cursor = Cursor::Start;
        self.vars.clear();
        match self.method.next_insn(0) {
            Some(i) if self.method.body[i].opcode() == Some(&Opcode::LoadSelf) => {
                self.cursor = Cursor::At(i);
            }
            _ => self.cursor = Cursor::Failed,
        }
        self
    }

    /// Match the next substantive instruction against an exact opcode
    pub fn next_is(&mut self, expected: &Opcode) -> &mut Self {
        self.next_matching(|op| op == expected)
    }

    /// Match the next substantive instruction against an opcode kind only
    pub fn next_is_kind(&mut self, kind: OpcodeKind) -> &mut Self {
        self.next_matching(|op| op.kind() == kind)
    }

    /// Match an invocation of the given owner/name/descriptor
    pub fn next_is_invoke(&mut self, owner: &str, name: &str, descriptor: &str) -> &mut Self {
        self.next_matching(|op| match op {
            Opcode::Invoke(m) => m.owner == owner && m.name == name && m.descriptor == descriptor,
            _ => false,
        })
    }

    /// Match a field access of the given direction and owner/name/descriptor
    pub fn next_is_field(
        &mut self,
        access: VarAccess,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> &mut Self {
        self.next_matching(|op| {
            let member = match (access, op) {
                (VarAccess::Load, Opcode::GetField(m)) | (VarAccess::Store, Opcode::PutField(m)) => m,
                _ => return false,
            };
            member.owner == owner && member.name == name && member.descriptor == descriptor
        })
    }

    /// Match a local-variable access and bind its slot to `name`
    ///
    /// A name bound by an earlier match constrains later ones: the pattern
    /// only continues if both accesses use the same slot.
    pub fn next_is_var(&mut self, access: VarAccess, name: &str) -> &mut Self {
        let Some(i) = self.next_substantive() else {
            return self.fail();
        };
        let slot = match (access, self.method.body[i].opcode()) {
            (VarAccess::Load, Some(Opcode::LoadLocal(slot)))
            | (VarAccess::Store, Some(Opcode::StoreLocal(slot))) => *slot,
            (VarAccess::Load, Some(Opcode::LoadSelf)) => 0,
            _ => return self.fail(),
        };
        match self.vars.get(name) {
            Some(bound) if *bound != slot => self.fail(),
            _ => {
                self.vars.insert(name.to_string(), slot);
                self.cursor = Cursor::At(i);
                self
            }
        }
    }

    /// Match a table or lookup switch
    pub fn next_is_switch(&mut self) -> &mut Self {
        self.next_matching(|op| op.kind() == OpcodeKind::Switch)
    }

    /// Move the cursor to the next node unconditionally
    ///
    /// Only meaningful when the caller has already validated reachability.
    pub fn advance(&mut self) -> &mut Self {
        match self.cursor {
            Cursor::At(i) if i + 1 < self.method.body.len() => self.cursor = Cursor::At(i + 1),
            Cursor::Start if !self.method.body.is_empty() => self.cursor = Cursor::At(0),
            _ => self.cursor = Cursor::Failed,
        }
        self
    }

    /// Move the cursor forward past labels, line markers and frames
    ///
    /// From the start position this lands on the method's first
    /// instruction; on an instruction it stays put; past the last
    /// instruction it fails.
    pub fn skip_insignificant(&mut self) -> &mut Self {
        let from = match self.cursor {
            Cursor::At(i) if self.method.body[i].is_insignificant() => i,
            Cursor::Start => 0,
            _ => return self,
        };
        match self.method.next_insn(from) {
            Some(next) => self.cursor = Cursor::At(next),
            None => self.cursor = Cursor::Failed,
        }
        self
    }

    /// The match so far as a node range starting at `start`
    ///
    /// `None` if any step failed.
    #[must_use]
    pub fn matched_from(&self, start: usize) -> Option<FilterMatch> {
        self.cursor().map(|end| FilterMatch::new(start, end))
    }

    /// Index of the next substantive instruction after the cursor, without
    /// consuming it
    fn next_substantive(&self) -> Option<usize> {
        if self.is_failed() {
            return None;
        }
        let from = match self.cursor {
            Cursor::At(i) => i + 1,
            Cursor::Start => 0,
            Cursor::Failed => return None,
        };
        self.method.next_insn(from)
    }

    fn next_matching(&mut self, predicate: impl Fn(&Opcode) -> bool) -> &mut Self {
        match self.next_substantive() {
            Some(i) if self.method.body[i].opcode().is_some_and(&predicate) => {
                self.cursor = Cursor::At(i);
            }
            _ => self.cursor = Cursor::Failed,
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{LabelId, MemberRef, Method, Node};

    fn getter() -> Method {
        Method::new("access$100", "()I", 1).with_body(vec![
            Node::Line(12),
            Node::Insn(Opcode::LoadSelf),
            Node::Frame,
            Node::Insn(Opcode::GetField(MemberRef::new("com/example/A", "count", "I"))),
            Node::Insn(Opcode::ReturnValue),
        ])
    }

    #[test]
    fn test_chained_pattern_matches_getter() {
        let method = getter();
        let mut matcher = InsnMatcher::new(&method);
        matcher
            .first_is_self_load()
            .next_is_field(VarAccess::Load, "com/example/A", "count", "I")
            .next_is_kind(OpcodeKind::Return);
        assert_eq!(matcher.cursor(), Some(4));
        assert_eq!(matcher.matched_from(0), Some(FilterMatch::new(0, 4)));
    }

    #[test]
    fn test_failure_is_sticky() {
        let method = getter();
        let mut matcher = InsnMatcher::new(&method);
        matcher
            .first_is_self_load()
            .next_is_invoke("com/example/A", "nope", "()V")
            // Everything after the failed step is a no-op.
            .next_is_kind(OpcodeKind::Return)
            .advance()
            .skip_insignificant();
        assert!(matcher.is_failed());
        assert_eq!(matcher.matched_from(0), None);
    }

    #[test]
    fn test_first_is_self_load_rejects_other_entry() {
        let method = Method::new("m", "()V", 1).with_body(vec![
            Node::Insn(Opcode::Const(0)),
            Node::Insn(Opcode::Return),
        ]);
        let mut matcher = InsnMatcher::new(&method);
        assert!(matcher.first_is_self_load().is_failed());
    }

    #[test]
    fn test_insignificant_nodes_are_skipped_between_steps() {
        let method = Method::new("m", "()V", 2).with_body(vec![
            Node::Insn(Opcode::Const(1)),
            Node::Label(LabelId::new(0)),
            Node::Line(5),
            Node::Insn(Opcode::StoreLocal(1)),
            Node::Insn(Opcode::Return),
        ]);
        let mut matcher = InsnMatcher::new(&method);
        matcher
            .next_is_kind(OpcodeKind::Const)
            .next_is_var(VarAccess::Store, "x")
            .next_is(&Opcode::Return);
        assert!(!matcher.is_failed());
        assert_eq!(matcher.bound_slot("x"), Some(1));
    }

    #[test]
    fn test_var_binding_enforces_slot_consistency() {
        let method = Method::new("m", "()V", 3).with_body(vec![
            Node::Insn(Opcode::Const(1)),
            Node::Insn(Opcode::StoreLocal(1)),
            Node::Insn(Opcode::LoadLocal(2)),
            Node::Insn(Opcode::Return),
        ]);
        let mut matcher = InsnMatcher::new(&method);
        matcher
            .next_is_kind(OpcodeKind::Const)
            .next_is_var(VarAccess::Store, "x")
            // Loads slot 2, but "x" is bound to slot 1.
            .next_is_var(VarAccess::Load, "x");
        assert!(matcher.is_failed());
    }

    #[test]
    fn test_next_is_switch() {
        let method = Method::new("m", "(I)V", 1).with_body(vec![
            Node::Insn(Opcode::LoadLocal(0)),
            Node::Insn(Opcode::LookupSwitch {
                keys: vec![1],
                targets: vec![LabelId::new(0)],
                default: LabelId::new(1),
            }),
            Node::Label(LabelId::new(0)),
            Node::Insn(Opcode::Return),
            Node::Label(LabelId::new(1)),
            Node::Insn(Opcode::Return),
        ]);
        let mut matcher = InsnMatcher::new(&method);
        matcher.next_is_kind(OpcodeKind::LoadLocal).next_is_switch();
        assert_eq!(matcher.cursor(), Some(1));
    }

    #[test]
    fn test_advance_and_skip_insignificant() {
        let method = getter();
        let mut matcher = InsnMatcher::new(&method);
        // advance lands on the leading line marker; skipping moves to the
        // first real instruction.
        matcher.advance().skip_insignificant();
        assert_eq!(matcher.cursor(), Some(1));
    }

    #[test]
    fn test_skip_insignificant_acts_from_start() {
        // Leading line marker: skipping from the start position lands on
        // the first real instruction.
        let method = getter();
        let mut matcher = InsnMatcher::new(&method);
        matcher.skip_insignificant();
        assert_eq!(matcher.cursor(), Some(1));

        // Already on an instruction: stays put.
        matcher.skip_insignificant();
        assert_eq!(matcher.cursor(), Some(1));
    }

    #[test]
    fn test_skip_insignificant_fails_without_instructions() {
        let method = Method::new("m", "()V", 1).with_body(vec![Node::Line(1), Node::Frame]);
        let mut matcher = InsnMatcher::new(&method);
        matcher.skip_insignificant();
        assert!(matcher.is_failed());
    }

    #[test]
    fn test_pattern_restart_drops_stale_bindings() {
        let method = Method::new("m", "()V", 2).with_body(vec![
            Node::Insn(Opcode::LoadSelf),
            Node::Insn(Opcode::LoadLocal(1)),
            Node::Insn(Opcode::Return),
        ]);
        let mut matcher = InsnMatcher::new(&method);
        // First pattern binds "x" to slot 0 via the self load.
        matcher.next_is_var(VarAccess::Load, "x");
        assert_eq!(matcher.bound_slot("x"), Some(0));

        // Restarting the pattern must not constrain "x" to the old slot.
        matcher
            .first_is_self_load()
            .next_is_var(VarAccess::Load, "x");
        assert!(!matcher.is_failed());
        assert_eq!(matcher.bound_slot("x"), Some(1));
    }

    #[test]
    fn test_advance_past_end_fails() {
        let method = Method::new("m", "()V", 1).with_body(vec![Node::Insn(Opcode::Return)]);
        let mut matcher = InsnMatcher::new(&method);
        matcher.next_is(&Opcode::Return).advance();
        assert!(matcher.is_failed());
    }
}
