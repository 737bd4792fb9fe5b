//! Coverage analysis.
//!
//! The analyzer reconstructs which structural elements executed by combining
//! three inputs: the original (uninstrumented) unit, the filter exclusions,
//! and the collected execution data. The probe plan is recomputed from the
//! original unit, so the only contract between instrumentation time and
//! analysis time is "same bytes, same fingerprint" - a mismatch aborts the
//! analysis of that unit with [`SondaError::DataMismatch`], counters are
//! never fabricated from inconsistent data.
//!
//! Instruction coverage is a forward propagation over the control-flow
//! graph: the entry instruction is covered iff the entry probe fired, the
//! target of a probed branch edge is covered iff that edge's probe fired,
//! and coverage flows along unprobed edges (fall-through, goto) from any
//! covered instruction.

use crate::error::{SondaError, SondaResult};
use crate::filter::FilterSet;
use crate::probe::{MethodPlan, ProbePlan};
use crate::report::CoverageBuilder;
use crate::runtime::ExecutionStore;
use crate::source::UnitSource;
use crate::unit::{CodeUnit, Fingerprint, Method, Node, Opcode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Classification of a structural element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoverageStatus {
    /// No item of the element executed
    NotCovered,
    /// Some items executed, some did not
    PartlyCovered,
    /// Every item executed
    FullyCovered,
}

impl fmt::Display for CoverageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotCovered => "not covered",
            Self::PartlyCovered => "partly covered",
            Self::FullyCovered => "fully covered",
        };
        f.write_str(text)
    }
}

/// Missed/covered pair for one kind of element
///
/// Always derived from execution data plus the structural model, never
/// stored persistently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Elements that did not execute
    pub missed: u32,
    /// Elements that executed
    pub covered: u32,
}

impl Counter {
    /// Create a counter from its two counts
    #[inline]
    #[must_use]
    pub const fn new(missed: u32, covered: u32) -> Self {
        Self { missed, covered }
    }

    /// Count one element as covered or missed
    pub fn increment(&mut self, covered: bool) {
        if covered {
            self.covered += 1;
        } else {
            self.missed += 1;
        }
    }

    /// Add another counter of the same kind
    pub fn add(&mut self, other: Self) {
        self.missed += other.missed;
        self.covered += other.covered;
    }

    /// Total number of elements
    #[must_use]
    pub const fn total(self) -> u32 {
        self.missed + self.covered
    }

    /// Covered fraction, 0.0 when the counter is empty
    #[must_use]
    pub fn covered_ratio(self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            f64::from(self.covered) / f64::from(self.total())
        }
    }

    /// Status classification of this counter
    #[must_use]
    pub const fn status(self) -> CoverageStatus {
        if self.covered == 0 {
            CoverageStatus::NotCovered
        } else if self.missed == 0 {
            CoverageStatus::FullyCovered
        } else {
            CoverageStatus::PartlyCovered
        }
    }
}

/// Coverage of one source line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCoverage {
    /// Instructions attributed to the line
    pub instructions: Counter,
    /// Branch edges of branch points attributed to the line
    pub branches: Counter,
}

impl LineCoverage {
    /// Status of the line
    ///
    /// Not covered while no instruction executed; fully covered once every
    /// instruction and every branch edge of the line executed; partly
    /// covered in between.
    #[must_use]
    pub const fn status(self) -> CoverageStatus {
        if self.instructions.covered == 0 {
            CoverageStatus::NotCovered
        } else if self.instructions.missed == 0 && self.branches.missed == 0 {
            CoverageStatus::FullyCovered
        } else {
            CoverageStatus::PartlyCovered
        }
    }

    fn add(&mut self, other: Self) {
        self.instructions.add(other.instructions);
        self.branches.add(other.branches);
    }
}

/// Coverage counters of one method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCoverage {
    /// Method name
    pub name: String,
    /// Type descriptor
    pub descriptor: String,
    /// Instruction counter
    pub instructions: Counter,
    /// Branch edge counter
    pub branches: Counter,
    /// Line counter
    pub lines: Counter,
    /// Cyclomatic complexity counter
    pub complexity: Counter,
    /// Method counter: (0,1) when the entry probe fired, else (1,0)
    pub methods: Counter,
    /// Per-line detail, ascending
    pub line_detail: BTreeMap<u32, LineCoverage>,
}

impl MethodCoverage {
    /// Whether the method was entered at all
    #[must_use]
    pub const fn is_covered(&self) -> bool {
        self.methods.covered > 0
    }
}

/// Coverage counters of one code unit (class level)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCoverage {
    /// Unit name
    pub name: String,
    /// Fingerprint of the analyzed unit
    pub fingerprint: Fingerprint,
    /// Whether execution data was present for the unit
    pub executed: bool,
    /// Per-method coverage, in declaration order
    pub methods: Vec<MethodCoverage>,
    /// Per-line coverage across all methods, ascending
    pub lines: BTreeMap<u32, LineCoverage>,
    /// Instruction counter over the whole unit
    pub instructions: Counter,
    /// Branch edge counter over the whole unit
    pub branches: Counter,
    /// Line counter over the whole unit
    pub line_counter: Counter,
    /// Method counter over the whole unit
    pub method_counter: Counter,
    /// Complexity counter over the whole unit
    pub complexity: Counter,
}

impl UnitCoverage {
    /// First source line with coverage information
    #[must_use]
    pub fn first_line(&self) -> Option<u32> {
        self.lines.keys().next().copied()
    }

    /// Last source line with coverage information
    #[must_use]
    pub fn last_line(&self) -> Option<u32> {
        self.lines.keys().next_back().copied()
    }

    /// Status of a single line, if the unit has code on it
    #[must_use]
    pub fn line_status(&self, line: u32) -> Option<CoverageStatus> {
        self.lines.get(&line).map(|l| l.status())
    }

    /// Overall status of the unit, derived from its instruction counter
    #[must_use]
    pub const fn status(&self) -> CoverageStatus {
        self.instructions.status()
    }
}

/// Merges structural model, filters and execution data into counters
#[derive(Debug)]
pub struct Analyzer<'a> {
    executions: &'a ExecutionStore,
    filters: FilterSet,
}

impl<'a> Analyzer<'a> {
    /// Create an analyzer over collected execution data, with the standard
    /// filters
    #[must_use]
    pub fn new(executions: &'a ExecutionStore) -> Self {
        Self {
            executions,
            filters: FilterSet::default(),
        }
    }

    /// Replace the filter set
    #[must_use]
    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = filters;
        self
    }

    /// Analyze one original unit and add its coverage to the builder
    ///
    /// A unit without collected execution data is analyzed as fully
    /// unexecuted. A fingerprint or probe-count mismatch with collected
    /// data fails the unit with [`SondaError::DataMismatch`] and adds
    /// nothing to the builder.
    pub fn analyze(&self, unit: &CodeUnit, builder: &mut CoverageBuilder) -> SondaResult<()> {
        let coverage = self.analyze_unit(unit)?;
        builder.add(coverage);
        Ok(())
    }

    /// Analyze every unit of a source
    ///
    /// Units are processed in name order; a failure on one unit is recorded
    /// and the rest proceed. Returns the number of units analyzed together
    /// with the per-unit failures.
    pub fn analyze_all(
        &self,
        source: &dyn UnitSource,
        builder: &mut CoverageBuilder,
    ) -> (usize, Vec<(String, SondaError)>) {
        let mut analyzed = 0;
        let mut failures = Vec::new();
        for name in source.names() {
            let result = source
                .read(&name)
                .and_then(|unit| self.analyze(&unit, builder));
            match result {
                Ok(()) => analyzed += 1,
                Err(err) => failures.push((name, err)),
            }
        }
        (analyzed, failures)
    }

    fn analyze_unit(&self, unit: &CodeUnit) -> SondaResult<UnitCoverage> {
        let plan = ProbePlan::compute(unit)?;
        let fingerprint = unit.fingerprint();

        let collected = self.executions.get(&unit.name);
        let probes: Vec<bool> = match collected {
            Some(data) => {
                data.assert_compatible(&unit.name, fingerprint, plan.count() as usize)?;
                data.probes.clone()
            }
            None => vec![false; plan.count() as usize],
        };

        let mut coverage = UnitCoverage {
            name: unit.name.clone(),
            fingerprint,
            executed: collected.is_some(),
            methods: Vec::new(),
            lines: BTreeMap::new(),
            instructions: Counter::default(),
            branches: Counter::default(),
            line_counter: Counter::default(),
            method_counter: Counter::default(),
            complexity: Counter::default(),
        };

        for (method, method_plan) in unit.methods.iter().zip(&plan.methods) {
            let Some(mc) = self.analyze_method(unit, method, method_plan, &probes)? else {
                continue;
            };
            coverage.instructions.add(mc.instructions);
            coverage.branches.add(mc.branches);
            coverage.line_counter.add(mc.lines);
            coverage.method_counter.add(mc.methods);
            coverage.complexity.add(mc.complexity);
            for (line, detail) in &mc.line_detail {
                coverage.lines.entry(*line).or_default().add(*detail);
            }
            coverage.methods.push(mc);
        }

        debug!(
            unit = %unit.name,
            executed = coverage.executed,
            instructions = ?coverage.instructions,
            branches = ?coverage.branches,
            "analyzed code unit"
        );
        Ok(coverage)
    }

    /// Counters for one method; `None` when filters exclude it entirely
    fn analyze_method(
        &self,
        unit: &CodeUnit,
        method: &Method,
        plan: &MethodPlan,
        probes: &[bool],
    ) -> SondaResult<Option<MethodCoverage>> {
        let excluded = self.filters.excluded_nodes(method);
        let covered = propagate_coverage(unit, method, plan, probes)?;

        let fired = |probe: crate::probe::ProbeId| probes.get(probe.index()).copied().unwrap_or(false);

        // Source line of each node, from the preceding line marker.
        let mut line_of = vec![None; method.body.len()];
        let mut current = None;
        for (i, node) in method.body.iter().enumerate() {
            if let Node::Line(line) = node {
                current = Some(*line);
            }
            line_of[i] = current;
        }

        let mut mc = MethodCoverage {
            name: method.name.clone(),
            descriptor: method.descriptor.clone(),
            instructions: Counter::default(),
            branches: Counter::default(),
            lines: Counter::default(),
            complexity: Counter::default(),
            methods: Counter::default(),
            line_detail: BTreeMap::new(),
        };

        for (i, node) in method.body.iter().enumerate() {
            if excluded[i] || !matches!(node, Node::Insn(_)) {
                continue;
            }
            mc.instructions.increment(covered[i]);
            if let Some(line) = line_of[i] {
                mc.line_detail
                    .entry(line)
                    .or_default()
                    .instructions
                    .increment(covered[i]);
            }
        }

        if mc.instructions.total() == 0 {
            // Filters removed the whole method; it contributes to nothing.
            return Ok(None);
        }

        for branch in &plan.branches {
            if excluded[branch.insn] {
                continue;
            }
            let mut bc = Counter::default();
            for edge in &branch.edges {
                bc.increment(fired(edge.probe));
            }
            mc.branches.add(bc);
            // Each branch point adds (edges - 1) units of complexity, split
            // by how many edges executed.
            let covered_cx = bc.covered.saturating_sub(1);
            let missed_cx = bc.total() - covered_cx - 1;
            mc.complexity.add(Counter::new(missed_cx, covered_cx));
            if let Some(line) = line_of[branch.insn] {
                mc.line_detail.entry(line).or_default().branches.add(bc);
            }
        }

        // Method and complexity base: invoked or not.
        let entered = fired(plan.entry);
        mc.methods.increment(entered);
        mc.complexity.increment(entered);

        for detail in mc.line_detail.values() {
            mc.lines.increment(detail.instructions.covered > 0);
        }

        Ok(Some(mc))
    }
}

/// Forward coverage propagation over one method's control-flow graph
fn propagate_coverage(
    unit: &CodeUnit,
    method: &Method,
    plan: &MethodPlan,
    probes: &[bool],
) -> SondaResult<Vec<bool>> {
    let labels = method.label_table(&unit.name)?;
    let fired = |probe: crate::probe::ProbeId| probes.get(probe.index()).copied().unwrap_or(false);

    let mut covered = vec![false; method.body.len()];
    let mut worklist = Vec::new();
    let mut push = |covered: &mut Vec<bool>, worklist: &mut Vec<usize>, i: usize| {
        if !covered[i] {
            covered[i] = true;
            worklist.push(i);
        }
    };

    // Seed from the probe sites.
    if fired(plan.entry) {
        push(&mut covered, &mut worklist, plan.entry_insn);
    }
    for branch in &plan.branches {
        for edge in &branch.edges {
            if fired(edge.probe) {
                push(&mut covered, &mut worklist, edge.target_insn);
            }
        }
    }

    // Flow along unprobed edges. Branch-point edges all carry probes, so
    // propagation stops there.
    while let Some(i) = worklist.pop() {
        if method.is_branch_point(i) {
            continue;
        }
        let Some(op) = method.body[i].opcode() else {
            continue;
        };
        let targets: Vec<usize> = match op {
            Opcode::Return | Opcode::ReturnValue => Vec::new(),
            Opcode::Goto(label) => vec![resolve(unit, method, &labels, *label)?],
            // Degenerate switch: one distinct successor, unprobed.
            Opcode::TableSwitch { default, .. } | Opcode::LookupSwitch { default, .. } => {
                vec![resolve(unit, method, &labels, *default)?]
            }
            _ => match method.next_insn(i + 1) {
                Some(next) => vec![next],
                None => Vec::new(),
            },
        };
        for target in targets {
            push(&mut covered, &mut worklist, target);
        }
    }
    Ok(covered)
}

fn resolve(
    unit: &CodeUnit,
    method: &Method,
    labels: &std::collections::HashMap<crate::unit::LabelId, usize>,
    label: crate::unit::LabelId,
) -> SondaResult<usize> {
    let at = labels.get(&label).copied().ok_or_else(|| {
        SondaError::malformed(
            &unit.name,
            format!("undefined label L{} in method '{}'", label.as_u32(), method.name),
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
