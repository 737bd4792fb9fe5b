//! Coverage report assembly.
//!
//! The analyzer feeds per-unit coverage into a [`CoverageBuilder`]; the
//! finished [`CoverageReport`] is a read-only value with a defined traversal
//! order: units in analysis order, methods in declaration order, lines
//! ascending. Rendering beyond the plain-text counter summary is a consumer
//! concern.

use crate::analysis::{Counter, CoverageStatus, UnitCoverage};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Collects per-unit coverage during analysis
#[derive(Debug, Default)]
pub struct CoverageBuilder {
    units: Vec<UnitCoverage>,
}

impl CoverageBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one analyzed unit
    pub fn add(&mut self, unit: UnitCoverage) {
        self.units.push(unit);
    }

    /// Finish into a report
    #[must_use]
    pub fn build(self) -> CoverageReport {
        CoverageReport { units: self.units }
    }
}

/// Aggregated counters over a whole report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Instruction counter over all units
    pub instructions: Counter,
    /// Branch edge counter over all units
    pub branches: Counter,
    /// Line counter over all units
    pub lines: Counter,
    /// Method counter over all units
    pub methods: Counter,
    /// Complexity counter over all units
    pub complexity: Counter,
}

/// Read-only coverage result for one or more units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageReport {
    units: Vec<UnitCoverage>,
}

impl CoverageReport {
    /// Analyzed units, in analysis order
    #[must_use]
    pub fn units(&self) -> &[UnitCoverage] {
        &self.units
    }

    /// Coverage of a unit by name
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<&UnitCoverage> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Counters summed over all units
    #[must_use]
    pub fn summary(&self) -> CoverageSummary {
        let mut summary = CoverageSummary::default();
        for unit in &self.units {
            summary.instructions.add(unit.instructions);
            summary.branches.add(unit.branches);
            summary.lines.add(unit.line_counter);
            summary.methods.add(unit.method_counter);
            summary.complexity.add(unit.complexity);
        }
        summary
    }

    /// Plain-text counter summary with per-line statuses
    ///
    /// One block per unit: the five counters as "missed of total", then
    /// every line from first to last with its status color.
    #[must_use]
    pub fn text_summary(&self) -> String {
        let mut out = String::new();
        for unit in &self.units {
            let _ = writeln!(out, "coverage of unit {}", unit.name);
            write_counter(&mut out, "instructions", unit.instructions);
            write_counter(&mut out, "branches", unit.branches);
            write_counter(&mut out, "lines", unit.line_counter);
            write_counter(&mut out, "methods", unit.method_counter);
            write_counter(&mut out, "complexity", unit.complexity);
            if let (Some(first), Some(last)) = (unit.first_line(), unit.last_line()) {
                for line in first..=last {
                    if let Some(status) = unit.line_status(line) {
                        let _ = writeln!(out, "line {line}: {}", color(status));
                    }
                }
            }
        }
        out
    }
}

fn write_counter(out: &mut String, kind: &str, counter: Counter) {
    let _ = writeln!(out, "{} of {} {} missed", counter.missed, counter.total(), kind);
}

const fn color(status: CoverageStatus) -> &'static str {
    match status {
        CoverageStatus::NotCovered => "red",
        CoverageStatus::PartlyCovered => "yellow",
        CoverageStatus::FullyCovered => "green",
    }
}
