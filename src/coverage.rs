//! coverage.rs
//!
//! Line (and branch) coverage of integrated tests against their units.
//!
//! `GcovRunner` builds C/C++ units and tests with `--coverage`, runs the
//! test binary, and reads the `.gcov` files `gcov` leaves behind.
//! `PytestCovRunner` runs pytest under coverage.py and reads its JSON
//! report. Parsing is pure and lives at the bottom of the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

use crate::config::{CoverageFormat, TestFramework, TestGenConfig};
use crate::detectors::language::Language;
use crate::detectors::scan::sibling_header;
use crate::error::CoverageError;
use crate::state::{CoverageResult, SourceUnit};

pub trait CoverageRunner: Send + Sync {
    fn measure(
        &self,
        project_root: &Path,
        units: &[&SourceUnit],
        test_files: &[PathBuf],
    ) -> Result<Vec<CoverageResult>, CoverageError>;
}

/// Marks `result` against the threshold.
pub fn evaluate(mut result: CoverageResult, threshold: f64) -> CoverageResult {
    result.passed = result.line_percent >= threshold;
    result
}

/// The runner matching the configured framework, if there is one.
pub fn runner_for(cfg: &TestGenConfig, project_root: &Path) -> Option<Box<dyn CoverageRunner>> {
    let report_dir = project_root.join("coverage_report");
    match cfg.test_framework {
        TestFramework::Gtest => Some(Box::new(GcovRunner {
            include_dirs: cfg.include_dirs.iter().map(|d| project_root.join(d)).collect(),
            link_flags: ["-lgtest_main", "-lgtest", "-pthread"].map(String::from).to_vec(),
            format: cfg.coverage_format,
            report_dir: Some(report_dir),
        })),
        TestFramework::Pytest => Some(Box::new(PytestCovRunner {
            format: cfg.coverage_format,
            report_dir: Some(report_dir),
        })),
        TestFramework::Cargo => None,
    }
}

/* ============================================================
   gcov
   ============================================================ */

pub struct GcovRunner {
    pub include_dirs: Vec<PathBuf>,
    pub link_flags: Vec<String>,
    pub format: CoverageFormat,
    pub report_dir: Option<PathBuf>,
}

impl CoverageRunner for GcovRunner {
    fn measure(
        &self,
        project_root: &Path,
        units: &[&SourceUnit],
        test_files: &[PathBuf],
    ) -> Result<Vec<CoverageResult>, CoverageError> {
        let work = tempfile::tempdir()?;

        // A unit without a header is #included by its test, so only
        // header-backed sources are compiled on their own.
        let mut compile_units: Vec<PathBuf> = units
            .iter()
            .filter(|u| u.language.is_c_family())
            .filter(|u| sibling_header(&u.abs_path).is_some_and(|h| h != u.abs_path))
            .map(|u| u.abs_path.clone())
            .collect();
        compile_units.extend(test_files.iter().cloned());

        let mut objects = Vec::new();
        for (i, src) in compile_units.iter().enumerate() {
            let obj = work.path().join(format!("cov{i}.o"));
            let is_c = Language::from_path(src) == Language::C;

            let mut cmd = Command::new(if is_c { "gcc" } else { "g++" });
            if !is_c {
                cmd.arg("-std=c++17");
            }
            cmd.args(["--coverage", "-O0", "-c"])
                .arg(format!("-I{}", project_root.display()));
            for dir in &self.include_dirs {
                cmd.arg(format!("-I{}", dir.display()));
            }
            if let Some(parent) = src.parent() {
                cmd.arg(format!("-I{}", parent.display()));
            }
            cmd.arg(src).arg("-o").arg(&obj).current_dir(project_root);

            let out = run(&mut cmd)?;
            if !out.status.success() {
                return Err(CoverageError::Build(stderr_of(&out)));
            }
            objects.push((src.clone(), obj));
        }

        let binary = work.path().join("coverage_tests");
        let mut link = Command::new("g++");
        link.arg("--coverage")
            .args(objects.iter().map(|(_, o)| o))
            .arg("-o")
            .arg(&binary)
            .args(&self.link_flags);
        let out = run(&mut link)?;
        if !out.status.success() {
            return Err(CoverageError::Build(stderr_of(&out)));
        }

        let out = run(Command::new(&binary).current_dir(project_root))?;
        if !out.status.success() {
            tracing::warn!(status = ?out.status.code(), "test binary reported failures");
            if out.status.code().is_none() {
                return Err(CoverageError::Execution(stderr_of(&out)));
            }
        }

        for (src, obj) in &objects {
            let out = run(
                Command::new("gcov")
                    .args(["-b", "-c", "-o"])
                    .arg(obj)
                    .arg(src)
                    .current_dir(work.path()),
            )?;
            if !out.status.success() {
                return Err(CoverageError::Report(stderr_of(&out)));
            }
        }

        let mut parsed = Vec::new();
        for entry in fs::read_dir(work.path())? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "gcov") {
                parsed.push(parse_gcov(&fs::read_to_string(&path)?));
            }
        }

        if let Some(dir) = &self.report_dir {
            if let Err(e) = gcov_report(self.format, project_root, work.path(), dir) {
                tracing::warn!(error = %e, "coverage report not written");
            }
        }

        Ok(units
            .iter()
            .map(|u| {
                parsed
                    .iter()
                    .find(|g| source_matches(&g.source, project_root, u))
                    .map(|g| g.to_result(&u.path))
                    .unwrap_or_else(|| CoverageResult::from_lines(u.path.clone(), 0, 0, Vec::new()))
            })
            .collect())
    }
}

fn gcov_report(
    format: CoverageFormat,
    project_root: &Path,
    work: &Path,
    dir: &Path,
) -> Result<(), CoverageError> {
    fs::create_dir_all(dir)?;

    let out = match format {
        CoverageFormat::Html => {
            let info = work.join("coverage.info");
            let captured = run(
                Command::new("lcov")
                    .args(["--capture", "--directory"])
                    .arg(work)
                    .arg("--output-file")
                    .arg(&info),
            )?;
            if !captured.status.success() {
                return Err(CoverageError::Report(stderr_of(&captured)));
            }
            run(Command::new("genhtml").arg(&info).arg("-o").arg(dir))?
        }
        CoverageFormat::Xml | CoverageFormat::Json => {
            let (flag, file) = match format {
                CoverageFormat::Xml => ("--xml", "coverage.xml"),
                _ => ("--json", "coverage.json"),
            };
            run(
                Command::new("gcovr")
                    .arg("-r")
                    .arg(project_root)
                    .arg(flag)
                    .arg("-o")
                    .arg(dir.join(file))
                    .arg(work),
            )?
        }
    };

    if out.status.success() {
        tracing::info!(dir = %dir.display(), ?format, "coverage report written");
        Ok(())
    } else {
        Err(CoverageError::Report(stderr_of(&out)))
    }
}

/* ============================================================
   coverage.py
   ============================================================ */

pub struct PytestCovRunner {
    pub format: CoverageFormat,
    pub report_dir: Option<PathBuf>,
}

impl CoverageRunner for PytestCovRunner {
    fn measure(
        &self,
        project_root: &Path,
        units: &[&SourceUnit],
        test_files: &[PathBuf],
    ) -> Result<Vec<CoverageResult>, CoverageError> {
        let work = tempfile::tempdir()?;
        let data = work.path().join(".coverage");
        let json = work.path().join("coverage.json");

        let out = run(
            Command::new("python3")
                .args(["-m", "coverage", "run", "--branch"])
                .arg(format!("--data-file={}", data.display()))
                .args(["-m", "pytest", "-q"])
                .args(test_files)
                .current_dir(project_root)
                .env("PYTHONPATH", project_root),
        )?;
        // pytest exits 1 on failing tests, which still produces data
        if !matches!(out.status.code(), Some(0) | Some(1)) {
            return Err(CoverageError::Execution(stderr_of(&out)));
        }

        let reported = run(
            Command::new("python3")
                .args(["-m", "coverage", "json"])
                .arg(format!("--data-file={}", data.display()))
                .arg("-o")
                .arg(&json)
                .current_dir(project_root),
        )?;
        if !reported.status.success() {
            return Err(CoverageError::Report(stderr_of(&reported)));
        }

        if let Some(dir) = &self.report_dir {
            fs::create_dir_all(dir)?;
            let (sub, target) = match self.format {
                CoverageFormat::Html => ("html", dir.join("html")),
                CoverageFormat::Xml => ("xml", dir.join("coverage.xml")),
                CoverageFormat::Json => ("json", dir.join("coverage.json")),
            };
            let flag = if sub == "html" { "-d" } else { "-o" };
            let out = run(
                Command::new("python3")
                    .args(["-m", "coverage", sub])
                    .arg(format!("--data-file={}", data.display()))
                    .arg(flag)
                    .arg(&target)
                    .current_dir(project_root),
            )?;
            if !out.status.success() {
                tracing::warn!(error = %stderr_of(&out), "coverage report not written");
            }
        }

        let report: Value = serde_json::from_str(&fs::read_to_string(&json)?)
            .map_err(|e| CoverageError::Report(e.to_string()))?;
        let files = parse_coverage_py(&report);

        Ok(units
            .iter()
            .map(|u| {
                files
                    .iter()
                    .find(|(path, _)| source_matches(path, project_root, u))
                    .map(|(_, r)| CoverageResult {
                        source: u.path.clone(),
                        ..r.clone()
                    })
                    .unwrap_or_else(|| CoverageResult::from_lines(u.path.clone(), 0, 0, Vec::new()))
            })
            .collect())
    }
}

/* ============================================================
   Parsing
   ============================================================ */

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcovFile {
    pub source: String,
    pub lines_total: usize,
    pub lines_covered: usize,
    pub uncovered: Vec<usize>,
    pub branches_total: usize,
    pub branches_taken: usize,
}

impl GcovFile {
    fn to_result(&self, unit: &str) -> CoverageResult {
        let mut r = CoverageResult::from_lines(
            unit.to_string(),
            self.lines_total,
            self.lines_covered,
            self.uncovered.clone(),
        );
        if self.branches_total > 0 {
            r.branch_percent = Some(self.branches_taken as f64 / self.branches_total as f64 * 100.0);
        }
        r
    }
}

/// Parses one `gcov -b -c` text file.
pub fn parse_gcov(text: &str) -> GcovFile {
    let mut file = GcovFile::default();

    for line in text.lines() {
        let trimmed = line.trim_start();

        if let Some(rest) = trimmed.strip_prefix("branch") {
            file.branches_total += 1;
            if let Some(n) = rest.split("taken").nth(1) {
                let count = n.split_whitespace().next().unwrap_or("0").trim_end_matches('%');
                if count.parse::<u64>().is_ok_and(|c| c > 0) {
                    file.branches_taken += 1;
                }
            }
            continue;
        }

        let mut parts = line.splitn(3, ':');
        let (Some(count), Some(lineno), rest) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let Ok(lineno) = lineno.trim().parse::<usize>() else {
            continue;
        };

        if lineno == 0 {
            if let Some(src) = rest.and_then(|r| r.strip_prefix("Source:")) {
                file.source = src.trim().to_string();
            }
            continue;
        }

        match count.trim() {
            "-" => {}
            "#####" | "=====" => {
                file.lines_total += 1;
                file.uncovered.push(lineno);
            }
            c if c.trim_end_matches('*').parse::<u64>().is_ok() => {
                file.lines_total += 1;
                file.lines_covered += 1;
            }
            _ => {}
        }
    }

    file
}

/// Per-file results of a coverage.py JSON report.
pub fn parse_coverage_py(report: &Value) -> BTreeMap<String, CoverageResult> {
    let mut out = BTreeMap::new();
    let Some(files) = report.get("files").and_then(Value::as_object) else {
        return out;
    };

    for (path, data) in files {
        let lines = |key: &str| -> Vec<usize> {
            data.get(key)
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_u64()).map(|v| v as usize).collect())
                .unwrap_or_default()
        };
        let executed = lines("executed_lines");
        let missing = lines("missing_lines");

        let mut r = CoverageResult::from_lines(
            path.clone(),
            executed.len() + missing.len(),
            executed.len(),
            missing,
        );

        let summary = data.get("summary");
        let num = |key: &str| summary.and_then(|s| s.get(key)).and_then(Value::as_u64);
        if let (Some(total), Some(covered)) = (num("num_branches"), num("covered_branches")) {
            if total > 0 {
                r.branch_percent = Some(covered as f64 / total as f64 * 100.0);
            }
        }

        out.insert(path.clone(), r);
    }

    out
}

/* ============================================================
   Helpers
   ============================================================ */

fn run(cmd: &mut Command) -> Result<Output, CoverageError> {
    tracing::debug!(command = ?cmd, "running coverage tool");
    Ok(cmd.output()?)
}

fn stderr_of(out: &Output) -> String {
    let err = String::from_utf8_lossy(&out.stderr);
    if err.trim().is_empty() {
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    } else {
        err.trim().to_string()
    }
}

fn source_matches(reported: &str, project_root: &Path, unit: &SourceUnit) -> bool {
    let reported = Path::new(reported);
    if reported == unit.abs_path || project_root.join(reported) == unit.abs_path {
        return true;
    }
    reported.to_string_lossy().replace('\\', "/").ends_with(&unit.path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GCOV: &str = "        -:    0:Source:src/math.cpp
        -:    0:Graph:cov0.gcno
        -:    1:#include \"math.h\"
        3:    2:int add(int a, int b) {
        3:    3:    return a + b;
        -:    4:}
        1:    5:int clamp(int v) {
branch  0 taken 1
branch  1 taken 0
        1:    6:    if (v < 0)
    #####:    7:        return 0;
        1:    8:    return v;
        -:    9:}
";

    #[test]
    fn gcov_lines_and_branches() {
        let g = parse_gcov(GCOV);
        assert_eq!(g.source, "src/math.cpp");
        assert_eq!(g.lines_total, 6);
        assert_eq!(g.lines_covered, 5);
        assert_eq!(g.uncovered, vec![7]);
        assert_eq!((g.branches_total, g.branches_taken), (2, 1));

        let r = g.to_result("src/math.cpp");
        assert!((r.line_percent - 83.333).abs() < 0.01);
        assert_eq!(r.branch_percent, Some(50.0));
    }

    #[test]
    fn threshold_decides_pass() {
        let r = CoverageResult::from_lines("a.cpp", 4, 3, vec![2]);
        assert!(evaluate(r.clone(), 75.0).passed);
        assert!(!evaluate(r, 80.0).passed);
    }

    #[test]
    fn coverage_py_report() {
        let report = serde_json::json!({
            "files": {
                "src/geo.py": {
                    "executed_lines": [1, 2, 4],
                    "missing_lines": [5],
                    "summary": { "num_branches": 2, "covered_branches": 1 }
                }
            }
        });
        let files = parse_coverage_py(&report);
        let r = &files["src/geo.py"];
        assert_eq!(r.lines_total, 4);
        assert_eq!(r.uncovered_lines, vec![5]);
        assert_eq!(r.branch_percent, Some(50.0));
        assert!((r.line_percent - 75.0).abs() < 1e-9);
    }

    #[test]
    fn reported_paths_match_units() {
        let unit = SourceUnit {
            path: "src/math.cpp".into(),
            abs_path: PathBuf::from("/p/src/math.cpp"),
            language: Language::Cpp,
            source: String::new(),
            content_hash: String::new(),
            signatures: vec![],
        };
        let root = Path::new("/p");
        assert!(source_matches("/p/src/math.cpp", root, &unit));
        assert!(source_matches("src/math.cpp", root, &unit));
        assert!(!source_matches("src/other.cpp", root, &unit));
    }
}
