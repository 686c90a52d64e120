//! report.rs
//!
//! Run report: one record per unit, appended concurrently by workers and
//! finalized when the run ends.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::TestFramework;
use crate::state::CoverageResult;
use crate::testgen::refine::Conflict;

pub const REPORT_FILE: &str = "test_generation_report.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitStatus {
    Passed,
    Partial,
    Exhausted,
    Interrupted,
    Cached,
    /// Dry run: prompts built, nothing generated.
    Planned,
}

impl UnitStatus {
    pub fn is_success(self) -> bool {
        matches!(self, UnitStatus::Passed | UnitStatus::Cached | UnitStatus::Planned)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitRecord {
    pub unit: String,
    pub status: UnitStatus,
    pub artifact: Option<PathBuf>,
    /// Dry run only: signatures a prompt was built for.
    pub planned: Vec<String>,
    pub resolved: Vec<String>,
    pub unresolved: Vec<String>,
    pub test_cases: Vec<String>,
    pub attempts: u32,
    pub retries: u32,
    pub conflicts: Vec<Conflict>,
    pub coverage: Option<CoverageResult>,
    pub coverage_cycles: u32,
    pub refactored: Option<PathBuf>,
    pub fatal_service_error: bool,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl UnitRecord {
    pub fn new(unit: impl Into<String>, status: UnitStatus) -> Self {
        Self {
            unit: unit.into(),
            status,
            artifact: None,
            planned: Vec::new(),
            resolved: Vec::new(),
            unresolved: Vec::new(),
            test_cases: Vec::new(),
            attempts: 0,
            retries: 0,
            conflicts: Vec::new(),
            coverage: None,
            coverage_cycles: 0,
            refactored: None,
            fatal_service_error: false,
            warnings: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub units: usize,
    pub generated: usize,
    pub refactored: usize,
    pub failed: usize,
    pub retried: u32,
    pub cached: usize,
    pub conflicts: usize,
    pub partial: usize,
    pub interrupted: usize,
    pub below_threshold: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub project_root: PathBuf,
    pub framework: TestFramework,
    pub dry_run: bool,
    pub units: Vec<UnitRecord>,
    pub counts: Counts,
    pub warnings: Vec<String>,
}

impl RunReport {
    /// 0 success, 1 incomplete or under-covered, 3 fatal service error.
    /// (2 is reserved for errors that abort the run before any unit.)
    pub fn exit_code(&self) -> i32 {
        if self.units.iter().any(|u| u.fatal_service_error) {
            return 3;
        }
        let incomplete = self.units.iter().any(|u| !u.status.is_success());
        if incomplete || self.counts.below_threshold > 0 {
            return 1;
        }
        0
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::from)?;
        fs::write(path, json + "\n")
    }

    pub fn summary(&self) -> String {
        let c = &self.counts;
        let mut out = String::new();

        let _ = writeln!(out, "Test generation report ({})", self.run_id);
        let _ = writeln!(out, "  units:        {}", c.units);
        let _ = writeln!(out, "  generated:    {}", c.generated);
        let _ = writeln!(out, "  cached:       {}", c.cached);
        let _ = writeln!(out, "  partial:      {}", c.partial);
        let _ = writeln!(out, "  failed:       {}", c.failed);
        let _ = writeln!(out, "  interrupted:  {}", c.interrupted);
        let _ = writeln!(out, "  retried:      {}", c.retried);
        let _ = writeln!(out, "  conflicts:    {}", c.conflicts);
        let _ = writeln!(out, "  refactored:   {}", c.refactored);
        if c.below_threshold > 0 {
            let _ = writeln!(out, "  below coverage threshold: {}", c.below_threshold);
        }

        for u in self.units.iter().filter(|u| !u.status.is_success()) {
            let _ = writeln!(out, "  [{:?}] {}", u.status, u.unit);
            if !u.unresolved.is_empty() {
                let _ = writeln!(out, "      unresolved: {}", u.unresolved.join(", "));
            }
            if let Some(e) = &u.error {
                let _ = writeln!(out, "      error: {e}");
            }
        }
        for w in &self.warnings {
            let _ = writeln!(out, "  warning: {w}");
        }

        out
    }

    pub fn print_summary(&self) {
        println!("{}", self.summary());
    }
}

/* ============================================================
   Accumulator
   ============================================================ */

pub struct ReportBuilder {
    inner: Mutex<RunReport>,
}

impl ReportBuilder {
    pub fn new(project_root: &Path, framework: TestFramework, dry_run: bool) -> Self {
        Self {
            inner: Mutex::new(RunReport {
                run_id: Uuid::new_v4(),
                started_at: Utc::now(),
                finished_at: None,
                project_root: project_root.to_path_buf(),
                framework,
                dry_run,
                units: Vec::new(),
                counts: Counts::default(),
                warnings: Vec::new(),
            }),
        }
    }

    pub fn record(&self, record: UnitRecord) {
        tracing::info!(unit = %record.unit, status = ?record.status, attempts = record.attempts, "unit finished");
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .units
            .push(record);
    }

    pub fn warn(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!("{msg}");
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .warnings
            .push(msg);
    }

    pub fn finish(self) -> RunReport {
        let mut report = self.inner.into_inner().unwrap_or_else(|p| p.into_inner());
        report.units.sort_by(|a, b| a.unit.cmp(&b.unit));
        report.counts = count(&report.units);
        report.finished_at = Some(Utc::now());
        report
    }
}

fn count(units: &[UnitRecord]) -> Counts {
    let mut c = Counts {
        units: units.len(),
        ..Counts::default()
    };

    for u in units {
        match u.status {
            UnitStatus::Passed => c.generated += 1,
            UnitStatus::Partial => {
                c.generated += 1;
                c.partial += 1;
            }
            UnitStatus::Exhausted => c.failed += 1,
            UnitStatus::Interrupted => {
                c.failed += 1;
                c.interrupted += 1;
            }
            UnitStatus::Cached => c.cached += 1,
            UnitStatus::Planned => {}
        }
        c.retried += u.retries;
        c.conflicts += u.conflicts.len();
        if u.refactored.is_some() {
            c.refactored += 1;
        }
        if u.coverage.as_ref().is_some_and(|cov| !cov.passed) {
            c.below_threshold += 1;
        }
    }

    c
}
