//! Probe identity and the deterministic probe plan.
//!
//! A probe is a single boolean execution marker tied to one method entry or
//! one outgoing edge of a branch point. Probe indices are assigned by a pure
//! traversal of the original unit, so the instrumenter (which inserts the
//! probes) and the analyzer (which attributes execution data to structure)
//! can compute the identical [`ProbePlan`] independently, possibly in
//! different processes. Reconciliation happens purely through probe index
//! plus unit fingerprint, never through object identity.

use crate::error::{SondaError, SondaResult};
use crate::unit::{CodeUnit, EdgeTarget, Method, Opcode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Probe identifier, unique within one code unit
///
/// Doubles as the index into the unit's probe array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProbeId(u32);

impl ProbeId {
    /// Create a new probe ID
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

    /// The probe array slot this ID addresses
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// One probed outgoing edge of a branch point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeProbe {
    /// Where the edge leads
    pub target: EdgeTarget,
    /// Node index of the first instruction the edge reaches
    pub target_insn: usize,
    /// Probe recording traversal of this edge
    pub probe: ProbeId,
}

/// A branch point with its probed edges, in canonical edge order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchProbes {
    /// Node index of the branching instruction
    pub insn: usize,
    /// One probe per distinct outgoing edge
    pub edges: Vec<EdgeProbe>,
}

/// Probe assignment for one method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPlan {
    /// Entry probe: fires iff the method was invoked
    pub entry: ProbeId,
    /// Node index of the first instruction
    pub entry_insn: usize,
    /// Branch points in body order
    pub branches: Vec<BranchProbes>,
}

impl MethodPlan {
    /// Total edges across all branch points of this method
    #[must_use]
    pub fn branch_edge_count(&self) -> usize {
        self.branches.iter().map(|b| b.edges.len()).sum()
    }
}

/// Deterministic probe assignment for a whole code unit
///
/// Probes are numbered in first-appearance order: for each method in
/// declaration order, the entry probe first, then one probe per outgoing
/// edge of each branch point in body order. Running the computation twice
/// over byte-identical input yields the identical plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePlan {
    /// One plan per method, in declaration order
    pub methods: Vec<MethodPlan>,
    count: u32,
}

impl ProbePlan {
    /// Compute the probe plan for an original (uninstrumented) unit
    ///
    /// Validates the unit on the way: undefined or duplicate labels and
    /// control falling off a method end are [`SondaError::MalformedUnit`];
    /// a unit that already contains probe instructions is
    /// [`SondaError::UnsupportedConstruct`].
    pub fn compute(unit: &CodeUnit) -> SondaResult<Self> {
        let mut methods = Vec::with_capacity(unit.methods.len());
        let mut next = 0u32;
        for method in &unit.methods {
            let plan = Self::compute_method(unit, method, &mut next)?;
            methods.push(plan);
        }
        Ok(Self { methods, count: next })
    }

    /// Number of probes the plan allocates
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    fn alloc(next: &mut u32) -> ProbeId {
        let id = ProbeId::new(*next);
        *next += 1;
        id
    }

    fn compute_method(unit: &CodeUnit, method: &Method, next: &mut u32) -> SondaResult<MethodPlan> {
        let labels = method.label_table(&unit.name)?;
        let entry_insn = method.next_insn(0).ok_or_else(|| {
            SondaError::malformed(
                &unit.name,
                format!("method '{}' has no instructions", method.name),
            )
        })?;

        let resolve = |label| Self::resolve(unit, method, &labels, label);

        let entry = Self::alloc(next);
        let mut branches = Vec::new();
        for i in 0..method.body.len() {
            let Some(op) = method.body[i].opcode() else {
                continue;
            };
            if matches!(op, Opcode::Probe(_)) {
                return Err(SondaError::unsupported(
                    &unit.name,
                    format!("method '{}' is already instrumented", method.name),
                ));
            }
            // Validate plain jumps and fall-through even off branch points,
            // so a malformed unit never gets a partial plan.
            match method.branch_edges(i) {
                Some(targets) => {
                    let mut edges = Vec::with_capacity(targets.len());
                    for target in targets {
                        let target_insn = match target {
                            EdgeTarget::FallThrough => Self::fall_through(unit, method, i)?,
                            EdgeTarget::Jump(label) => resolve(label)?,
                        };
                        edges.push(EdgeProbe {
                            target,
                            target_insn,
                            probe: Self::alloc(next),
                        });
                    }
                    branches.push(BranchProbes { insn: i, edges });
                }
                None => match op {
                    Opcode::Goto(label)
                    | Opcode::TableSwitch { default: label, .. }
                    | Opcode::LookupSwitch { default: label, .. } => {
                        resolve(*label)?;
                    }
                    _ if op.is_terminal() => {}
                    _ => {
                        Self::fall_through(unit, method, i)?;
                    }
                },
            }
        }
        Ok(MethodPlan {
            entry,
            entry_insn,
            branches,
        })
    }

    /// First instruction reached by falling through from node index `i`
    fn fall_through(unit: &CodeUnit, method: &Method, i: usize) -> SondaResult<usize> {
        method.next_insn(i + 1).ok_or_else(|| {
            SondaError::malformed(
                &unit.name,
                format!("control falls off the end of method '{}'", method.name),
            )
        })
    }

    /// First instruction at or after the given label
    fn resolve(
        unit: &CodeUnit,
        method: &Method,
        labels: &HashMap<crate::unit::LabelId, usize>,
        label: crate::unit::LabelId,
    ) -> SondaResult<usize> {
        let at = labels.get(&label).copied().ok_or_else(|| {
            SondaError::malformed(
                &unit.name,
                format!(
                    "undefined label L{} in method '{}'",
                    label.as_u32(),
                    method.name
                ),
            )
        })?;
        method.next_insn(at).ok_or_else(|| {
            SondaError::malformed(
                &unit.name,
                format!(
                    "label L{} in method '{}' is not followed by an instruction",
                    label.as_u32(),
                    method.name
                ),
            )
        })
    }
}
