//! Probe instrumentation.
//!
//! The instrumenter rewrites a code unit so that execution leaves a trace:
//! one probe instruction at every method entry and on every outgoing edge of
//! every branch point. The instrumented unit is behaviorally identical to
//! the original apart from the probe writes, which are side-effect-free with
//! respect to the unit's own semantics.
//!
//! Fall-through edges are probed by inserting the probe directly after the
//! branching instruction. Jump edges are probed by edge splitting: the
//! branch is retargeted to a fresh label whose trampoline block records the
//! probe and jumps on to the original target. Trampolines are appended after
//! the method end, which is safe because plan validation already rejected
//! any method whose control can fall off the end.
//!
//! Instrumentation is all-or-nothing: validation happens up front while the
//! probe plan is computed, and the rewrite itself cannot fail, so a
//! malformed or unsupported unit is returned untouched with an error.

use crate::error::SondaResult;
use crate::probe::{EdgeProbe, ProbeId, ProbePlan};
use crate::unit::{CodeUnit, EdgeTarget, Fingerprint, LabelId, Method, Node, Opcode};
use tracing::debug;

/// Result of instrumenting one code unit
#[derive(Debug, Clone)]
pub struct InstrumentedUnit {
    /// The rewritten unit, ready for execution
    pub unit: CodeUnit,
    /// Size of the probe array the runtime must allocate
    pub probe_count: u32,
    /// Fingerprint of the *original* unit; execution data collected from
    /// this instrumented unit is keyed by it
    pub fingerprint: Fingerprint,
}

/// Rewrites code units to record execution probes
#[derive(Debug, Default)]
pub struct Instrumenter;

impl Instrumenter {
    /// Create a new instrumenter
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Instrument a code unit
    ///
    /// Probe indices are assigned deterministically, so repeated
    /// instrumentation of byte-identical input is reproducible. The input
    /// unit is never modified; on error nothing is emitted.
    pub fn instrument(&self, unit: &CodeUnit) -> SondaResult<InstrumentedUnit> {
        let plan = ProbePlan::compute(unit)?;
        let fingerprint = unit.fingerprint();

        let mut out = CodeUnit::new(unit.name.clone(), unit.version);
        for (method, method_plan) in unit.methods.iter().zip(&plan.methods) {
            let mut rewriter = MethodRewriter::new(method);
            rewriter.entry_probe(method_plan.entry);
            for branch in &method_plan.branches {
                rewriter.probe_branch(branch.insn, &branch.edges);
            }
            out.methods.push(rewriter.finish());
        }

        debug!(
            unit = %unit.name,
            probes = plan.count(),
            fingerprint = %fingerprint,
            "instrumented code unit"
        );
        Ok(InstrumentedUnit {
            unit: out,
            probe_count: plan.count(),
            fingerprint,
        })
    }
}

/// Splices probe instructions into a single method body
struct MethodRewriter<'a> {
    method: &'a Method,
    /// Probe to place before the first node, if any
    entry: Option<ProbeId>,
    /// Per-node pending rewrites, indexed like the original body
    rewrites: Vec<NodeRewrite>,
    /// Trampoline blocks appended after the method end
    trampolines: Vec<Node>,
    next_label: u32,
}

#[derive(Default, Clone)]
struct NodeRewrite {
    /// Replacement opcode with retargeted labels
    replace: Option<Opcode>,
    /// Probe on the fall-through edge, inserted right after the node
    fall_through: Option<ProbeId>,
}

impl<'a> MethodRewriter<'a> {
    fn new(method: &'a Method) -> Self {
        let max_label = method
            .body
            .iter()
            .filter_map(|n| match n {
                Node::Label(l) => Some(l.as_u32()),
                _ => None,
            })
            .max();
        Self {
            method,
            entry: None,
            rewrites: vec![NodeRewrite::default(); method.body.len()],
            trampolines: Vec::new(),
            next_label: max_label.map_or(0, |l| l + 1),
        }
    }

    fn entry_probe(&mut self, probe: ProbeId) {
        self.entry = Some(probe);
    }

    fn fresh_label(&mut self) -> LabelId {
        let label = LabelId::new(self.next_label);
        self.next_label += 1;
        label
    }

    /// Probe every outgoing edge of the branch instruction at node index `i`
    fn probe_branch(&mut self, i: usize, edges: &[EdgeProbe]) {
        let Some(op) = self.method.body[i].opcode() else {
            return;
        };
        let mut op = op.clone();
        for edge in edges {
            match edge.target {
                EdgeTarget::FallThrough => {
                    self.rewrites[i].fall_through = Some(edge.probe);
                }
                EdgeTarget::Jump(target) => {
                    let split = self.fresh_label();
                    op = retarget(&op, target, split);
                    self.trampolines.extend([
                        Node::Label(split),
                        Node::Insn(Opcode::Probe(edge.probe)),
                        Node::Insn(Opcode::Goto(target)),
                    ]);
                }
            }
        }
        self.rewrites[i].replace = Some(op);
    }

    fn finish(mut self) -> Method {
        let mut body =
            Vec::with_capacity(self.method.body.len() + self.trampolines.len() + 1);
        if let Some(probe) = self.entry {
            body.push(Node::Insn(Opcode::Probe(probe)));
        }
        for (node, rewrite) in self.method.body.iter().zip(&self.rewrites) {
            match &rewrite.replace {
                Some(op) => body.push(Node::Insn(op.clone())),
                None => body.push(node.clone()),
            }
            if let Some(probe) = rewrite.fall_through {
                body.push(Node::Insn(Opcode::Probe(probe)));
            }
        }
        body.append(&mut self.trampolines);

        let mut method = Method::new(
            self.method.name.clone(),
            self.method.descriptor.clone(),
            self.method.max_locals,
        )
        .with_body(body);
        method.synthetic = self.method.synthetic;
        method
    }
}

/// Replace every occurrence of `from` in the opcode's jump operands
fn retarget(op: &Opcode, from: LabelId, to: LabelId) -> Opcode {
    let swap = |l: &LabelId| if *l == from { to } else { *l };
    match op {
        Opcode::Branch { cmp, target } => Opcode::Branch {
            cmp: *cmp,
            target: swap(target),
        },
        Opcode::Goto(target) => Opcode::Goto(swap(target)),
        Opcode::TableSwitch { low, targets, default } => Opcode::TableSwitch {
            low: *low,
            targets: targets.iter().map(swap).collect(),
            default: swap(default),
        },
        Opcode::LookupSwitch { keys, targets, default } => Opcode::LookupSwitch {
            keys: keys.clone(),
            targets: targets.iter().map(swap).collect(),
            default: swap(default),
        },
        other => other.clone(),
    }
}
