//! Sonda: probe-based code coverage engine.
//!
//! Sonda (Spanish: "probe") rewrites compiled code units to emit execution
//! probes without changing their observable behavior, records which probes
//! fire at runtime, and combines the recorded data with the original
//! structural layout to classify every instruction, branch, line and method
//! as not, partly or fully covered.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      SONDA Pipeline                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  CodeUnit ──► Instrumenter ──► instrumented unit ──► execution   │
//! │     │              │                                     │       │
//! │     │          ProbePlan                            ProbeArray   │
//! │     │              │                                     │       │
//! │     └──► Analyzer ◄┴── FilterSet ◄── InsnMatcher    collect()    │
//! │              │                                           │       │
//! │              └──────────── ExecutionStore ◄──────────────┘       │
//! │                            │                                     │
//! │                            ▼                                     │
//! │                      CoverageReport                              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Instrumentation and analysis are decoupled in time and process: both
//! derive the same deterministic probe plan from the original unit, and
//! execution data is reconciled purely by probe index plus content
//! fingerprint. Stale or foreign data never analyzes silently.
//!
//! # Example
//!
//! ```
//! use sonda::{Analyzer, CoverageBuilder, ExecutionStore, Instrumenter};
//! use sonda::{CodeUnit, Method, Node, Opcode};
//! use sonda::{ProbeId, RuntimeData, SessionStore};
//!
//! # fn main() -> sonda::SondaResult<()> {
//! let unit = CodeUnit::new("demo/Target", 1).with_method(
//!     Method::new("run", "()V", 1)
//!         .with_body(vec![Node::Line(1), Node::Insn(Opcode::Return)]),
//! );
//!
//! // Instrument, then pretend the harness ran the unit.
//! let instrumented = Instrumenter::new().instrument(&unit)?;
//! let runtime = RuntimeData::new();
//! let probes = runtime.register(
//!     &unit.name,
//!     instrumented.fingerprint,
//!     instrumented.probe_count,
//! )?;
//! probes.hit(ProbeId::new(0));
//!
//! // Collect and analyze against the original unit.
//! let mut executions = ExecutionStore::new();
//! let mut sessions = SessionStore::new();
//! runtime.collect(&mut executions, &mut sessions, false)?;
//!
//! let mut builder = CoverageBuilder::new();
//! Analyzer::new(&executions).analyze(&unit, &mut builder)?;
//! let report = builder.build();
//! assert_eq!(report.summary().methods.covered, 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod analysis;
mod error;
mod filter;
mod instrument;
mod matcher;
mod probe;
mod report;
mod runtime;
mod source;
mod unit;

pub use analysis::{
    Analyzer, Counter, CoverageStatus, LineCoverage, MethodCoverage, UnitCoverage,
};
pub use error::{SondaError, SondaResult};
pub use filter::{BridgeMethodFilter, Filter, FilterSet, SyntheticAccessorFilter};
pub use instrument::{InstrumentedUnit, Instrumenter};
pub use matcher::{FilterMatch, InsnMatcher, VarAccess};
pub use probe::{BranchProbes, EdgeProbe, MethodPlan, ProbeId, ProbePlan};
pub use report::{CoverageBuilder, CoverageReport, CoverageSummary};
pub use runtime::{
    ExecutionData, ExecutionStore, ProbeArray, RuntimeData, SessionInfo, SessionStore,
};
pub use source::{DirUnitSource, MemoryUnitSource, UnitSource};
pub use unit::{
    Cmp, CodeUnit, EdgeTarget, Fingerprint, LabelId, MemberRef, Method, Node, Opcode, OpcodeKind,
};
