use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;
use std::time::Duration;

use console::Style;

use crate::error::RunFailure;
use crate::graph::{GraphSnapshot, Status};

const ANSI_GREEN: Style = Style::new().green();
const ANSI_YELLOW: Style = Style::new().yellow();
const ANSI_RED: Style = Style::new().red();

/// How a single target ended the run.
#[derive(Debug)]
pub struct TargetOutcome {
    pub status: Status,
    /// Wall duration of the build, `None` for skipped and never-dispatched
    /// targets.
    pub duration: Option<Duration>,
    /// Which trigger fired, for built targets.
    pub trigger: Option<&'static str>,
}

/// The final account of one run: every target's outcome, every
/// independently-failing branch, and the graph as it ended (including
/// sub-targets discovered mid-run).
#[derive(Debug)]
pub struct RunReport {
    pub outcomes: BTreeMap<String, TargetOutcome>,
    pub failures: Vec<(String, RunFailure)>,
    pub elapsed: Duration,
    pub graph: GraphSnapshot,
}

impl RunReport {
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn built(&self) -> usize {
        self.count(Status::Completed, true)
    }

    pub fn completed(&self) -> usize {
        self.count(Status::Completed, false)
    }

    pub fn skipped(&self) -> usize {
        self.count(Status::Skipped, false)
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Failed, false)
    }

    fn count(&self, status: Status, executed_only: bool) -> usize {
        self.outcomes
            .values()
            .filter(|o| o.status == status)
            .filter(|o| !executed_only || o.duration.is_some())
            .count()
    }

    pub fn status(&self, name: &str) -> Option<Status> {
        self.outcomes.get(name).map(|o| o.status)
    }

    /// Every identity this run touched; the complement in the store is
    /// garbage-collection eligible.
    pub fn reachable(&self) -> HashSet<String> {
        self.outcomes.keys().cloned().collect()
    }

    /// Human-readable account of the run, one line per failure.
    pub fn summary(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "{} built, {} skipped, {} failed in {:.2?}",
            ANSI_GREEN.apply_to(self.built()),
            ANSI_YELLOW.apply_to(self.skipped()),
            ANSI_RED.apply_to(self.failed()),
            self.elapsed,
        );

        for (name, failure) in &self.failures {
            let _ = writeln!(out, "  {} {failure}", ANSI_RED.apply_to(name));
        }

        out
    }
}
