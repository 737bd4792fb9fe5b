//! Abstract code-unit model.
//!
//! A [`CodeUnit`] is an immutable, named, versioned compiled artifact: an
//! ordered collection of [`Method`]s, each holding an ordered sequence of
//! [`Node`]s. Opcode-bearing nodes are the instructions; labels, source-line
//! markers and stack-map frames are structurally insignificant and carry no
//! control flow of their own.
//!
//! The concrete opcode set is deliberately small. It is rich enough to
//! express straight-line code, two-way conditional branches, multi-way
//! switches, field access, invocations and returns - everything the
//! instrumenter, the pattern matcher and the analyzer need to agree on.

use crate::error::{SondaError, SondaResult};
use crate::probe::ProbeId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Label identifier, unique within one method body.
///
/// Labels mark join points; branch operands refer to them rather than to raw
/// node offsets, so the instrumenter can splice nodes without re-indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(u32);

impl LabelId {
    /// Create a new label ID
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner value
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

/// Reference to a named member of another unit (field or method)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRef {
    /// Owning unit name
    pub owner: String,
    /// Member name
    pub name: String,
    /// Type descriptor
    pub descriptor: String,
}

impl MemberRef {
    /// Create a new member reference
    #[must_use]
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

/// Comparison operator of a two-way conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cmp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

/// Instruction opcodes
///
/// `Probe` never appears in original units; the instrumenter inserts it and
/// refuses input that already contains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    /// Push an integer constant
    Const(i64),
    /// Load the enclosing instance reference (local slot 0)
    LoadSelf,
    /// Load a local variable slot
    LoadLocal(u16),
    /// Store the stack top into a local variable slot
    StoreLocal(u16),
    /// Pop two operands, push their sum
    Add,
    /// Pop two operands, push their product
    Mul,
    /// Pop two operands, push their bitwise xor
    Xor,
    /// Pop two operands `a`, `b`; jump to `target` when `cmp(a, b)` holds,
    /// otherwise fall through
    Branch {
        /// Comparison applied to the two popped operands
        cmp: Cmp,
        /// Jump target when the comparison holds
        target: LabelId,
    },
    /// Unconditional jump
    Goto(LabelId),
    /// Multi-way branch over a dense key range starting at `low`
    TableSwitch {
        /// Key matching the first target
        low: i64,
        /// One target per consecutive key
        targets: Vec<LabelId>,
        /// Target when no key matches
        default: LabelId,
    },
    /// Multi-way branch over sparse keys
    LookupSwitch {
        /// Matched keys, parallel to `targets`
        keys: Vec<i64>,
        /// One target per key
        targets: Vec<LabelId>,
        /// Target when no key matches
        default: LabelId,
    },
    /// Read an instance field, pushing its value
    GetField(MemberRef),
    /// Pop a value and write it to an instance field
    PutField(MemberRef),
    /// Invoke another method
    Invoke(MemberRef),
    /// Return without a value
    Return,
    /// Pop the stack top and return it
    ReturnValue,
    /// Record that execution reached this point (instrumentation only)
    Probe(ProbeId),
}

/// Coarse classification of opcodes, used by matcher constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeKind {
    /// Integer constant push
    Const,
    /// Self-reference load
    LoadSelf,
    /// Local variable load
    LoadLocal,
    /// Local variable store
    StoreLocal,
    /// Arithmetic or bitwise operation
    Arithmetic,
    /// Two-way conditional branch
    Branch,
    /// Unconditional jump
    Goto,
    /// Table or lookup switch
    Switch,
    /// Instance field read
    FieldGet,
    /// Instance field write
    FieldPut,
    /// Method invocation
    Invoke,
    /// Return, with or without a value
    Return,
    /// Inserted probe
    Probe,
}

impl Opcode {
    /// The coarse kind of this opcode
    #[must_use]
    pub const fn kind(&self) -> OpcodeKind {
        match self {
            Self::Const(_) => OpcodeKind::Const,
            Self::LoadSelf => OpcodeKind::LoadSelf,
            Self::LoadLocal(_) => OpcodeKind::LoadLocal,
            Self::StoreLocal(_) => OpcodeKind::StoreLocal,
            Self::Add | Self::Mul | Self::Xor => OpcodeKind::Arithmetic,
            Self::Branch { .. } => OpcodeKind::Branch,
            Self::Goto(_) => OpcodeKind::Goto,
            Self::TableSwitch { .. } | Self::LookupSwitch { .. } => OpcodeKind::Switch,
            Self::GetField(_) => OpcodeKind::FieldGet,
            Self::PutField(_) => OpcodeKind::FieldPut,
            Self::Invoke(_) => OpcodeKind::Invoke,
            Self::Return | Self::ReturnValue => OpcodeKind::Return,
            Self::Probe(_) => OpcodeKind::Probe,
        }
    }

    /// Whether control never continues past this opcode
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Goto(_)
                | Self::TableSwitch { .. }
                | Self::LookupSwitch { .. }
                | Self::Return
                | Self::ReturnValue
        )
    }
}

/// One node of a method body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    /// Join-point marker, target of branch operands
    Label(LabelId),
    /// Source line marker: following instructions belong to this line
    Line(u32),
    /// Stack-map frame marker, carries no semantics here
    Frame,
    /// An actual instruction
    Insn(Opcode),
}

impl Node {
    /// The opcode of this node, if it is an instruction
    #[must_use]
    pub const fn opcode(&self) -> Option<&Opcode> {
        match self {
            Self::Insn(op) => Some(op),
            _ => None,
        }
    }

    /// Whether this node bears no opcode (label, line marker, frame)
    #[must_use]
    pub const fn is_insignificant(&self) -> bool {
        !matches!(self, Self::Insn(_))
    }
}

/// Outgoing edge of a branch point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeTarget {
    /// Continue at the next instruction
    FallThrough,
    /// Jump to a label
    Jump(LabelId),
}

/// A named method with its ordered body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Method {
    /// Method name
    pub name: String,
    /// Type descriptor
    pub descriptor: String,
    /// Number of local variable slots, arguments included
    pub max_locals: u16,
    /// Compiler-synthesized member (bridge, accessor); candidate for
    /// exclusion by filters
    pub synthetic: bool,
    /// Ordered body nodes
    pub body: Vec<Node>,
}

impl Method {
    /// Create an empty method
    #[must_use]
    pub fn new(name: impl Into<String>, descriptor: impl Into<String>, max_locals: u16) -> Self {
        Self {
            name: name.into(),
            descriptor: descriptor.into(),
            max_locals,
            synthetic: false,
            body: Vec::new(),
        }
    }

    /// Mark this method as compiler-synthesized
    #[must_use]
    pub const fn synthetic(mut self) -> Self {
        self.synthetic = true;
        self
    }

    /// Append body nodes
    #[must_use]
    pub fn with_body(mut self, body: Vec<Node>) -> Self {
        self.body = body;
        self
    }

    /// Index of the first instruction node at or after `from`
    #[must_use]
    pub fn next_insn(&self, from: usize) -> Option<usize> {
        (from..self.body.len()).find(|&i| matches!(self.body[i], Node::Insn(_)))
    }

    /// Map every label in the body to its node index
    ///
    /// Duplicate labels make the unit malformed.
    pub fn label_table(&self, unit: &str) -> SondaResult<HashMap<LabelId, usize>> {
        let mut table = HashMap::new();
        for (i, node) in self.body.iter().enumerate() {
            if let Node::Label(label) = node {
                if table.insert(*label, i).is_some() {
                    return Err(SondaError::malformed(
                        unit,
                        format!("duplicate label L{} in method '{}'", label.as_u32(), self.name),
                    ));
                }
            }
        }
        Ok(table)
    }

    /// Outgoing edges of the instruction at node index `i`, when it has more
    /// than one possible successor
    ///
    /// Edge order is canonical: fall-through first for conditional branches;
    /// case targets in operand order then the default for switches, with
    /// duplicate labels collapsed to their first appearance. Probe index
    /// assignment and branch counters both rely on this order.
    #[must_use]
    pub fn branch_edges(&self, i: usize) -> Option<Vec<EdgeTarget>> {
        let op = self.body.get(i)?.opcode()?;
        match op {
            Opcode::Branch { target, .. } => {
                Some(vec![EdgeTarget::FallThrough, EdgeTarget::Jump(*target)])
            }
            Opcode::TableSwitch { targets, default, .. }
            | Opcode::LookupSwitch { targets, default, .. } => {
                let mut edges: Vec<EdgeTarget> = Vec::new();
                let mut seen: Vec<LabelId> = Vec::new();
                for label in targets.iter().chain(std::iter::once(default)) {
                    if !seen.contains(label) {
                        seen.push(*label);
                        edges.push(EdgeTarget::Jump(*label));
                    }
                }
                if edges.len() > 1 {
                    Some(edges)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Whether the instruction at node index `i` is a branch point
    #[must_use]
    pub fn is_branch_point(&self, i: usize) -> bool {
        self.branch_edges(i).is_some()
    }
}

/// Content fingerprint of a code unit
///
/// Derived from a canonical encoding of the original (uninstrumented)
/// unit. Execution data carries the fingerprint of the unit
/// it was collected for; analysis against a different fingerprint is a
/// [`SondaError::DataMismatch`], never silently tolerated.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Wrap a raw fingerprint value
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw fingerprint value
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An immutable, named, versioned compiled artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Unique unit name (e.g. `com/example/Target`)
    pub name: String,
    /// Format version of the artifact
    pub version: u32,
    /// Methods in declaration order
    pub methods: Vec<Method>,
}

impl CodeUnit {
    /// Create a unit with no methods
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            methods: Vec::new(),
        }
    }

    /// Append a method
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Content fingerprint over a canonical encoding of the unit
    ///
    /// Deterministic for byte-identical input; any change to names,
    /// descriptors or bodies yields a different value. The encoding is
    /// infallible: fingerprinting cannot degrade into a shared default.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hash_str(&mut hasher, &self.name);
        hasher.update(self.version.to_be_bytes());
        hasher.update((self.methods.len() as u64).to_be_bytes());
        for method in &self.methods {
            hash_method(&mut hasher, method);
        }
        let digest = hasher.finalize();
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        Fingerprint(u64::from_be_bytes(raw))
    }
}

// Canonical fingerprint encoding: every variant is tagged and every
// variable-length field is length-prefixed, so distinct units never encode
// to the same byte stream.

fn hash_str(hasher: &mut Sha256, s: &str) {
    hasher.update((s.len() as u64).to_be_bytes());
    hasher.update(s.as_bytes());
}

fn hash_member(hasher: &mut Sha256, member: &MemberRef) {
    hash_str(hasher, &member.owner);
    hash_str(hasher, &member.name);
    hash_str(hasher, &member.descriptor);
}

fn hash_labels(hasher: &mut Sha256, labels: &[LabelId]) {
    hasher.update((labels.len() as u64).to_be_bytes());
    for label in labels {
        hasher.update(label.as_u32().to_be_bytes());
    }
}

const fn cmp_tag(cmp: Cmp) -> u8 {
    match cmp {
        Cmp::Eq => 0,
        Cmp::Ne => 1,
        Cmp::Lt => 2,
        Cmp::Le => 3,
        Cmp::Gt => 4,
        Cmp::Ge => 5,
    }
}

fn hash_method(hasher: &mut Sha256, method: &Method) {
    hash_str(hasher, &method.name);
    hash_str(hasher, &method.descriptor);
    hasher.update(method.max_locals.to_be_bytes());
    hasher.update([u8::from(method.synthetic)]);
    hasher.update((method.body.len() as u64).to_be_bytes());
    for node in &method.body {
        hash_node(hasher, node);
    }
}

fn hash_node(hasher: &mut Sha256, node: &Node) {
    match node {
        Node::Label(label) => {
            hasher.update([0]);
            hasher.update(label.as_u32().to_be_bytes());
        }
        Node::Line(line) => {
            hasher.update([1]);
            hasher.update(line.to_be_bytes());
        }
        Node::Frame => hasher.update([2]),
        Node::Insn(op) => {
            hasher.update([3]);
            hash_opcode(hasher, op);
        }
    }
}

fn hash_opcode(hasher: &mut Sha256, op: &Opcode) {
    match op {
        Opcode::Const(value) => {
            hasher.update([0]);
            hasher.update(value.to_be_bytes());
        }
        Opcode::LoadSelf => hasher.update([1]),
        Opcode::LoadLocal(slot) => {
            hasher.update([2]);
            hasher.update(slot.to_be_bytes());
        }
        Opcode::StoreLocal(slot) => {
            hasher.update([3]);
            hasher.update(slot.to_be_bytes());
        }
        Opcode::Add => hasher.update([4]),
        Opcode::Mul => hasher.update([5]),
        Opcode::Xor => hasher.update([6]),
        Opcode::Branch { cmp, target } => {
            hasher.update([7, cmp_tag(*cmp)]);
            hasher.update(target.as_u32().to_be_bytes());
        }
        Opcode::Goto(target) => {
            hasher.update([8]);
            hasher.update(target.as_u32().to_be_bytes());
        }
        Opcode::TableSwitch { low, targets, default } => {
            hasher.update([9]);
            hasher.update(low.to_be_bytes());
            hash_labels(hasher, targets);
            hasher.update(default.as_u32().to_be_bytes());
        }
        Opcode::LookupSwitch { keys, targets, default } => {
            hasher.update([10]);
            hasher.update((keys.len() as u64).to_be_bytes());
            for key in keys {
                hasher.update(key.to_be_bytes());
            }
            hash_labels(hasher, targets);
            hasher.update(default.as_u32().to_be_bytes());
        }
        Opcode::GetField(member) => {
            hasher.update([11]);
            hash_member(hasher, member);
        }
        Opcode::PutField(member) => {
            hasher.update([12]);
            hash_member(hasher, member);
        }
        Opcode::Invoke(member) => {
            hasher.update([13]);
            hash_member(hasher, member);
        }
        Opcode::Return => hasher.update([14]),
        Opcode::ReturnValue => hasher.update([15]),
        Opcode::Probe(probe) => {
            hasher.update([16]);
            hasher.update(probe.as_u32().to_be_bytes());
        }
    }
}
