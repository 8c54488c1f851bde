//! Reports for the deadlock analysis.
//! `ReportContent` carries bug kind, possibility, diagnosis, and explanation.
//! The diagnosis for a lock cycle lists its classes and, per edge, the
//! witness stack pairs (trimmed to their distinct suffixes) so the user can
//! spot the edge with the fewest code paths — usually the easiest one to fix.

use std::io::{self, Write};

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ReportContent<D> {
    pub bug_kind: String,
    pub possibility: String,
    pub diagnosis: D,
    pub explanation: String,
}

impl<D: std::fmt::Debug> ReportContent<D> {
    pub fn new(bug_kind: String, possibility: String, diagnosis: D, explanation: String) -> Self {
        Self {
            bug_kind,
            possibility,
            diagnosis,
            explanation,
        }
    }
}

#[derive(Debug, Serialize)]
pub enum Report {
    LockCycle(ReportContent<CycleDiagnosis>),
}

/// One call frame rendered as `function (position)`.
pub type RenderedFrame = String;

#[derive(Debug, Serialize)]
pub struct WitnessStacks {
    pub first_stack: Vec<RenderedFrame>,
    pub second_stack: Vec<RenderedFrame>,
}

#[derive(Debug, Serialize)]
pub struct EdgeDiagnosis {
    pub first_lock: String,
    pub second_lock: String,
    pub witnesses: Vec<WitnessStacks>,
}

#[derive(Debug, Serialize)]
pub struct CycleDiagnosis {
    pub classes: Vec<String>,
    pub edges: Vec<EdgeDiagnosis>,
}

#[derive(Debug, Serialize)]
pub struct Warning {
    /// Rendered source position; empty when unknown.
    pub pos: String,
    pub message: String,
}

/// The complete analysis output.
#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub roots: Vec<String>,
    pub warnings: Vec<Warning>,
    pub cycles: Vec<Report>,
}

impl AnalysisReport {
    pub fn write_json(&self, w: impl Write) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(w, self)
    }

    /// The textual cycle report: roots, cycle count, then per cycle each
    /// edge with its witness count and stacks.
    pub fn write_text(&self, mut w: impl Write) -> io::Result<()> {
        write!(w, "roots:")?;
        for root in &self.roots {
            write!(w, " {}", root)?;
        }
        writeln!(w)?;
        writeln!(w, "number of lock cycles: {}", self.cycles.len())?;
        for report in &self.cycles {
            let Report::LockCycle(content) = report;
            let cycle = &content.diagnosis;
            writeln!(w)?;
            write!(w, "lock cycle:")?;
            for class in &cycle.classes {
                write!(w, " {} ->", class)?;
            }
            writeln!(w, " {}", cycle.classes[0])?;
            for edge in &cycle.edges {
                writeln!(
                    w,
                    "  {} -> {}: {} path(s)",
                    edge.first_lock,
                    edge.second_lock,
                    edge.witnesses.len()
                )?;
                for (i, witness) in edge.witnesses.iter().enumerate() {
                    writeln!(w, "    [{}] {} acquired at:", i + 1, edge.first_lock)?;
                    write_stack(&mut w, &witness.first_stack)?;
                    writeln!(w, "        {} acquired at:", edge.second_lock)?;
                    write_stack(&mut w, &witness.second_stack)?;
                }
            }
        }
        Ok(())
    }
}

fn write_stack(w: &mut impl Write, stack: &[RenderedFrame]) -> io::Result<()> {
    if stack.is_empty() {
        return writeln!(w, "          (entry)");
    }
    for frame in stack {
        writeln!(w, "          {}", frame)?;
    }
    Ok(())
}
