//! Static deadlock detection for code with explicit lock/unlock calls.
//!
//! The analysis consumes a program in a typed SSA form together with the
//! results of a points-to analysis and constructs a lock-order graph: an
//! edge `A -> B` means some path acquired lock class `B` while holding `A`.
//! Cycles in that graph indicate code paths with the potential for
//! deadlock; the report shows, per edge, the code paths that produce it, so
//! the edge with the fewest paths is usually the easiest fix.
//!
//! The walker is inter-procedural, path-sensitive and partially
//! value-sensitive, based on Engler and Ashcroft, "RacerX: Effective,
//! static detection of race conditions and deadlocks", SOSP 2003. It
//! reasons about lock *classes* (sets of locks that may alias), not
//! individual locks, and it may explore paths that are impossible at
//! runtime: simple intra-procedural value propagation prunes the obvious
//! cases, but correlated conditions beyond its reach produce false
//! positives. Reported cycles are leads to inspect, not proofs.
//!
//! Inputs are assembled by the embedder: the SSA program (`ir`), a
//! callgraph (`analysis::callgraph`), the points-to oracle
//! (`analysis::pointsto`), and resolved runtime primitives
//! (`ir::RuntimeFns`). `detector::Analyzer` walks the roots and produces
//! the report.

pub mod analysis;
pub mod detector;
pub mod ir;
pub mod lockset;
pub mod vstate;

pub use detector::report::{AnalysisReport, Report, Warning};
pub use detector::{Analyzer, DEFAULT_MAX_SIMILAR_STATES};
