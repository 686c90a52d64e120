//! orchestrator.rs
//!
//! One run: scan, extract, then per unit
//! generate/validate/retry each function, refine, integrate, and gate on
//! coverage. Units are pulled from a channel by a bounded pool of worker
//! threads; the functions of one unit run sequentially.

use std::collections::BTreeMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;

use crate::config::{TestFramework, TestGenConfig};
use crate::control::{CancelToken, Limits};
use crate::coverage::{evaluate, CoverageRunner};
use crate::detectors::ast::extract_signatures;
use crate::detectors::language::Language;
use crate::detectors::scan::{find_source_files, relative_path, sibling_header};
use crate::error::{IntegrationError, RunError};
use crate::llm::backend::{ModelGateway, RetryingGateway};
use crate::llm::prompt::{build_prompt, import_hint, PromptHint, RuleSet, UnitContext};
use crate::report::{ReportBuilder, RunReport, UnitRecord, UnitStatus};
use crate::state::{CoverageResult, FunctionSignature, Provenance, SourceUnit, TestArtifact};
use crate::testgen::cache::{hash_str, Manifest, ManifestEntry, SemanticKey};
use crate::testgen::materialize::{artifact_path, artifact_paths, integrate};
use crate::testgen::refactor::{RefactorOutcome, Refactorer};
use crate::testgen::refine::Refiner;
use crate::testgen::retry::{ChainResult, ExhaustReason, RetryController};
use crate::testgen::runner::ToolchainRunner;
use crate::testgen::validate::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Generate,
    /// Extraction and prompt building only; nothing is sent or written.
    DryRun,
}

/// External services a run talks to.
pub struct Collaborators<'a> {
    pub gateway: &'a dyn ModelGateway,
    pub toolchain: &'a dyn ToolchainRunner,
    pub coverage: Option<&'a dyn CoverageRunner>,
    pub mode: RunMode,
}

struct RunContext<'a> {
    root: &'a Path,
    cfg: &'a TestGenConfig,
    gateway: RetryingGateway<&'a dyn ModelGateway>,
    toolchain: &'a dyn ToolchainRunner,
    coverage: Option<&'a dyn CoverageRunner>,
    limits: Limits,
    rules: RuleSet,
    test_dir: PathBuf,
    refactored_dir: PathBuf,
    /// unit path -> artifact path, distinct per unit
    artifacts: BTreeMap<String, PathBuf>,
    manifest: Manifest,
    report: &'a ReportBuilder,
    cancel: &'a CancelToken,
}

/* ============================================================
   Entry
   ============================================================ */

pub fn run(
    project_root: &Path,
    config: &TestGenConfig,
    collab: &Collaborators,
    cancel: &CancelToken,
) -> Result<RunReport, RunError> {
    config.validate()?;

    if !project_root.is_dir() {
        return Err(RunError::ProjectRoot(project_root.to_path_buf()));
    }

    let dry_run = collab.mode == RunMode::DryRun;
    let test_dir = config.test_dir(project_root);
    let refactored_dir = config.refactored_dir(project_root);

    if !dry_run {
        fs::create_dir_all(&test_dir).map_err(|source| RunError::OutputDir {
            path: test_dir.clone(),
            source,
        })?;
        if config.refactor_sources {
            fs::create_dir_all(&refactored_dir).map_err(|source| RunError::OutputDir {
                path: refactored_dir.clone(),
                source,
            })?;
        }
    }

    let mut excluded = config.excluded_dirs.clone();
    for dir in [&config.output_test_dir, &config.output_refactored_dir] {
        if let Some(name) = Path::new(dir).file_name() {
            excluded.push(name.to_string_lossy().into_owned());
        }
    }

    let files = find_source_files(project_root, &config.extensions(), &excluded)?;
    tracing::info!(
        root = %project_root.display(),
        files = files.len(),
        framework = ?config.test_framework,
        dry_run,
        "scan complete"
    );

    let report = ReportBuilder::new(project_root, config.test_framework, dry_run);
    let units = load_units(project_root, &files, &report);
    let artifacts = artifact_paths(
        &test_dir,
        config.test_framework,
        units.iter().map(|u| u.path.as_str()),
    );

    if dry_run {
        plan(project_root, config, &units, &artifacts, &report);
        return Ok(report.finish());
    }

    let ctx = RunContext {
        root: project_root,
        cfg: config,
        gateway: RetryingGateway::new(
            collab.gateway,
            config.gateway_retries,
            Duration::from_millis(config.gateway_backoff_ms),
            cancel.clone(),
        ),
        toolchain: collab.toolchain,
        coverage: collab.coverage,
        limits: Limits::new(config.max_concurrent_requests, config.max_concurrent_compiles),
        rules: RuleSet::from_config(config),
        manifest: Manifest::load(&test_dir),
        test_dir,
        artifacts,
        refactored_dir,
        report: &report,
        cancel,
    };

    let workers = config.max_concurrent_units.min(units.len()).max(1);
    let (tx, rx) = unbounded::<SourceUnit>();
    for unit in units {
        let _ = tx.send(unit);
    }
    drop(tx);

    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                while let Ok(unit) = rx.recv() {
                    let record = if ctx.cancel.is_cancelled() {
                        let mut r = UnitRecord::new(&unit.path, UnitStatus::Interrupted);
                        r.unresolved = unit.signatures.iter().map(|s| s.name.clone()).collect();
                        r
                    } else {
                        process_guarded(&ctx, &unit)
                    };
                    ctx.report.record(record);
                }
            });
        }
    });

    drop(ctx);
    let report = report.finish();
    tracing::info!(
        units = report.counts.units,
        generated = report.counts.generated,
        failed = report.counts.failed,
        cached = report.counts.cached,
        "run finished"
    );
    Ok(report)
}

/* ============================================================
   Units
   ============================================================ */

fn load_units(root: &Path, files: &[PathBuf], report: &ReportBuilder) -> Vec<SourceUnit> {
    files
        .iter()
        .filter_map(|path| {
            let rel = relative_path(root, path);
            match fs::read_to_string(path) {
                Ok(source) => {
                    let language = Language::from_path(path);
                    let signatures = extract_signatures(&rel, language, &source);
                    Some(SourceUnit {
                        path: rel,
                        abs_path: path.clone(),
                        language,
                        content_hash: hash_str(&source),
                        signatures,
                        source,
                    })
                }
                Err(e) => {
                    let mut r = UnitRecord::new(&rel, UnitStatus::Exhausted);
                    r.error = Some(format!("cannot read source: {e}"));
                    report.record(r);
                    None
                }
            }
        })
        .collect()
}

fn unit_context<'u>(root: &Path, cfg: &TestGenConfig, unit: &'u SourceUnit) -> UnitContext<'u> {
    let header = (cfg.test_framework == TestFramework::Gtest && unit.language.is_c_family())
        .then(|| sibling_header(&unit.abs_path))
        .flatten()
        .map(|h| relative_path(root, &h));

    UnitContext {
        path: &unit.path,
        language: unit.language,
        source: &unit.source,
        import_hint: import_hint(&unit.path, cfg.test_framework, header.as_deref()),
    }
}

fn plan(
    root: &Path,
    cfg: &TestGenConfig,
    units: &[SourceUnit],
    artifacts: &BTreeMap<String, PathBuf>,
    report: &ReportBuilder,
) {
    let rules = RuleSet::from_config(cfg);

    for unit in units {
        let unit_ctx = unit_context(root, cfg, unit);
        let mut record = UnitRecord::new(&unit.path, UnitStatus::Planned);
        record.artifact = artifacts.get(&unit.path).cloned();

        for sig in &unit.signatures {
            let prompt = build_prompt(&unit_ctx, sig, &rules, &PromptHint::None);
            tracing::debug!(unit = %unit.path, function = %sig.name, prompt = %prompt.text(), "planned prompt");
            record.planned.push(sig.display());
        }
        report.record(record);
    }
}

/// Per-unit error boundary.
fn process_guarded(ctx: &RunContext, unit: &SourceUnit) -> UnitRecord {
    panic::catch_unwind(AssertUnwindSafe(|| process_unit(ctx, unit))).unwrap_or_else(|_| {
        tracing::error!(unit = %unit.path, "unit processing panicked");
        let mut r = UnitRecord::new(&unit.path, UnitStatus::Exhausted);
        r.error = Some("internal error while processing unit".into());
        r
    })
}

struct UnitState {
    refiner: Refiner,
    /// signature name -> semantic key
    resolved: BTreeMap<String, String>,
    unresolved: Vec<String>,
    /// test case name -> signature it was generated for
    owners: BTreeMap<String, String>,
}

impl UnitState {
    /// Merges a passing candidate and records `sig` as the owner of the
    /// cases it added.
    fn merge(&mut self, sig: &str, candidate: &str, attempt: u32, origin: &str) {
        let before = self.refiner.file().case_names();
        self.refiner.merge(candidate, attempt, origin);
        for name in self.refiner.file().case_names() {
            if !before.contains(&name) {
                self.owners.insert(name, sig.to_string());
            }
        }
    }

    /// Drops seeded cases whose function is gone from the unit. Cases with
    /// no recorded owner were not generated here and stay.
    fn prune_removed(&mut self, unit: &SourceUnit) {
        let stale: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, sig)| !unit.signatures.iter().any(|s| &s.name == *sig))
            .map(|(case, _)| case.clone())
            .collect();
        if stale.is_empty() {
            return;
        }

        tracing::info!(unit = %unit.path, cases = ?stale, "dropping tests of removed functions");
        self.refiner.drop_cases(&stale);
        for case in &stale {
            self.owners.remove(case);
        }
    }
}

fn process_unit(ctx: &RunContext, unit: &SourceUnit) -> UnitRecord {
    let cfg = ctx.cfg;
    let artifact = ctx
        .artifacts
        .get(&unit.path)
        .cloned()
        .unwrap_or_else(|| artifact_path(&ctx.test_dir, cfg.test_framework, &unit.path));
    let mut record = UnitRecord::new(&unit.path, UnitStatus::Passed);
    record.artifact = Some(artifact.clone());

    if cfg.skip_unchanged && ctx.manifest.is_current(unit, &artifact) {
        let entry = ctx.manifest.get(&unit.path).unwrap_or_default();
        tracing::info!(unit = %unit.path, "unchanged since last run");
        record.status = UnitStatus::Cached;
        record.resolved = entry.resolved.keys().cloned().collect();
        record.test_cases = entry.cases.keys().cloned().collect();
        return record;
    }

    tracing::info!(unit = %unit.path, functions = unit.signatures.len(), "generating tests");

    if cfg.refactor_sources {
        refactor_unit(ctx, unit, &mut record);
    }

    let prior = ctx.manifest.get(&unit.path).unwrap_or_default();
    let unit_ctx = unit_context(ctx.root, cfg, unit);
    let validator = validator_for(ctx, unit);
    let controller = RetryController {
        gateway: &ctx.gateway,
        request_slots: &ctx.limits.requests,
        validator: &validator,
        rules: &ctx.rules,
        max_retries: cfg.llm_max_retries,
        auto_fix: cfg.auto_fix_issues,
        cancel: ctx.cancel,
    };

    let mut state = UnitState {
        refiner: Refiner::new(cfg.test_framework),
        resolved: BTreeMap::new(),
        unresolved: Vec::new(),
        owners: BTreeMap::new(),
    };

    let existing = fs::read_to_string(&artifact).ok();
    if let Some(existing) = &existing {
        state.refiner.seed(existing, &prior.cases);
        state.owners = prior.owners.clone();
        state.prune_removed(unit);
    }

    let mut interrupted = false;
    let mut stop = false;

    for sig in &unit.signatures {
        if stop {
            state.unresolved.push(sig.name.clone());
            continue;
        }

        let key = SemanticKey::for_signature(unit, sig).to_cache_key();
        if cfg.skip_unchanged
            && existing.is_some()
            && prior.resolved.get(&sig.name) == Some(&key)
        {
            tracing::debug!(unit = %unit.path, function = %sig.name, "function unchanged, keeping its tests");
            state.resolved.insert(sig.name.clone(), key);
            continue;
        }

        let outcome = controller.run(&unit_ctx, sig, &PromptHint::None);
        record.attempts += outcome.attempts.len() as u32;
        record.retries += outcome.retries();

        match outcome.result {
            ChainResult::Passed { candidate, attempt } => {
                state.merge(
                    &sig.name,
                    &candidate,
                    attempt,
                    &format!("{} attempt {}", sig.name, attempt),
                );
                state.resolved.insert(sig.name.clone(), key);
            }
            ChainResult::Exhausted(reason) => {
                state.unresolved.push(sig.name.clone());
                match reason {
                    ExhaustReason::RetriesExhausted => {
                        if let Some(last) = outcome.attempts.last() {
                            record.warnings.push(format!(
                                "{}: no passing test after {} attempt(s), last verdict {}",
                                sig.name, last.number, last.verdict
                            ));
                        }
                    }
                    ExhaustReason::TransientService(msg) => {
                        record.warnings.push(format!("{}: {msg}", sig.name));
                    }
                    ExhaustReason::FatalService(msg) => {
                        record.fatal_service_error = true;
                        record.error = Some(msg);
                        stop = true;
                    }
                    ExhaustReason::Cancelled => {
                        interrupted = true;
                        stop = true;
                    }
                }
            }
        }
    }

    record.resolved = state.resolved.keys().cloned().collect();
    record.unresolved = state.unresolved.clone();
    record.conflicts = state.refiner.conflicts().to_vec();

    if interrupted {
        tracing::warn!(unit = %unit.path, "cancelled, nothing committed");
        record.status = UnitStatus::Interrupted;
        return record;
    }

    record.status = if state.unresolved.is_empty() {
        UnitStatus::Passed
    } else if state.resolved.is_empty() {
        UnitStatus::Exhausted
    } else {
        UnitStatus::Partial
    };

    if state.refiner.file().cases.is_empty() {
        record.artifact = None;
        record.status = UnitStatus::Exhausted;
        if record.error.is_none() {
            record.error = Some("no test cases produced".into());
        }
        return record;
    }

    if let Err(e) = commit(ctx, unit, &artifact, &state) {
        record.status = UnitStatus::Exhausted;
        record.error = Some(e.to_string());
        return record;
    }

    if cfg.use_coverage && !state.resolved.is_empty() {
        if let Some(runner) = ctx.coverage {
            coverage_gate(ctx, runner, unit, &unit_ctx, &controller, &artifact, &mut state, &mut record);
        }
    }

    record.test_cases = state.refiner.file().case_names();
    record.conflicts = state.refiner.conflicts().to_vec();
    record
}

fn validator_for<'c>(ctx: &'c RunContext<'_>, unit: &SourceUnit) -> Validator<'c> {
    let mut include_dirs = vec![ctx.root.to_path_buf()];
    if let Some(parent) = unit.abs_path.parent() {
        include_dirs.push(parent.to_path_buf());
    }
    include_dirs.extend(ctx.cfg.include_dirs.iter().map(|d| ctx.root.join(d)));

    Validator {
        framework: ctx.cfg.test_framework,
        check_syntax: ctx.cfg.validate_syntax,
        check_compilation: ctx.cfg.validate_compilation,
        toolchain: ctx.toolchain,
        compile_slots: &ctx.limits.compiles,
        project_root: ctx.root.to_path_buf(),
        sources: vec![unit.abs_path.clone()],
        include_dirs,
    }
}

fn commit(
    ctx: &RunContext,
    unit: &SourceUnit,
    artifact: &Path,
    state: &UnitState,
) -> Result<(), IntegrationError> {
    let artifact = TestArtifact {
        path: artifact.to_path_buf(),
        content: state.refiner.render(),
        case_names: state.refiner.file().case_names(),
        provenance: Provenance {
            source: unit.path.clone(),
            source_hash: unit.content_hash.clone(),
            cases: state.refiner.case_attempts(),
        },
        unresolved: state.unresolved.clone(),
    };

    let changed = integrate(&artifact.path, &artifact.content)?;
    tracing::info!(
        unit = %unit.path,
        path = %artifact.path.display(),
        cases = artifact.case_names.len(),
        changed,
        "artifact integrated"
    );

    ctx.manifest.record(
        &artifact.provenance.source,
        ManifestEntry {
            artifact: relative_path(&ctx.test_dir, &artifact.path),
            source_hash: artifact.provenance.source_hash,
            cases: artifact.provenance.cases,
            resolved: state.resolved.clone(),
            unresolved: artifact.unresolved,
            owners: state
                .owners
                .iter()
                .filter(|(case, _)| artifact.case_names.contains(*case))
                .map(|(case, sig)| (case.clone(), sig.clone()))
                .collect(),
        },
    )
}

fn refactor_unit(ctx: &RunContext, unit: &SourceUnit, record: &mut UnitRecord) {
    let refactorer = Refactorer {
        gateway: &ctx.gateway,
        request_slots: &ctx.limits.requests,
        max_attempts: ctx.cfg.llm_max_retries,
        out_dir: &ctx.refactored_dir,
        cancel: ctx.cancel,
    };

    match refactorer.refactor(unit) {
        RefactorOutcome::Written(path) | RefactorOutcome::Unchanged(path) => {
            record.refactored = Some(path);
        }
        RefactorOutcome::Failed(msg) => {
            record.warnings.push(format!("refactor skipped: {msg}"));
        }
    }
}

/* ============================================================
   Coverage gate
   ============================================================ */

#[allow(clippy::too_many_arguments)]
fn coverage_gate(
    ctx: &RunContext,
    runner: &dyn CoverageRunner,
    unit: &SourceUnit,
    unit_ctx: &UnitContext,
    controller: &RetryController,
    artifact: &Path,
    state: &mut UnitState,
    record: &mut UnitRecord,
) {
    let threshold = ctx.cfg.coverage_threshold;
    let mut cycles = 0;

    loop {
        let measured = {
            let _slot = ctx.limits.compiles.acquire();
            runner.measure(ctx.root, &[unit], &[artifact.to_path_buf()])
        };

        let cov = match measured {
            Ok(results) => evaluate(
                results
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| CoverageResult::from_lines(unit.path.clone(), 0, 0, Vec::new())),
                threshold,
            ),
            Err(e) => {
                record.warnings.push(format!("coverage not measured: {e}"));
                tracing::warn!(unit = %unit.path, error = %e, "coverage not measured");
                break;
            }
        };

        tracing::info!(
            unit = %unit.path,
            line_percent = cov.line_percent,
            threshold,
            passed = cov.passed,
            cycle = cycles,
            "coverage measured"
        );

        if cov.passed {
            record.coverage = Some(cov);
            break;
        }

        if cycles >= ctx.cfg.coverage_passes || ctx.cancel.is_cancelled() {
            ctx.report.warn(format!(
                "{}: line coverage {:.1}% below threshold {:.1}% after {} extra cycle(s)",
                unit.path, cov.line_percent, threshold, cycles
            ));
            record.coverage = Some(cov);
            break;
        }

        cycles += 1;
        let hint = PromptHint::Coverage {
            measured: cov.line_percent,
            threshold,
            uncovered_lines: cov.uncovered_lines.clone(),
        };

        let targets: Vec<&FunctionSignature> = unit
            .signatures
            .iter()
            .filter(|s| state.resolved.contains_key(&s.name))
            .collect();

        for sig in targets {
            let outcome = controller.run(unit_ctx, sig, &hint);
            record.attempts += outcome.attempts.len() as u32;
            record.retries += outcome.retries();

            match outcome.result {
                ChainResult::Passed { candidate, attempt } => state.merge(
                    &sig.name,
                    &candidate,
                    attempt,
                    &format!("{} coverage pass {} attempt {}", sig.name, cycles, attempt),
                ),
                ChainResult::Exhausted(ExhaustReason::Cancelled) => break,
                ChainResult::Exhausted(reason) => {
                    tracing::info!(unit = %unit.path, function = %sig.name, ?reason, "no extra coverage tests");
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            record.coverage = Some(cov);
            break;
        }

        if let Err(e) = commit(ctx, unit, artifact, state) {
            record.status = UnitStatus::Exhausted;
            record.error = Some(e.to_string());
            record.coverage = Some(cov);
            break;
        }
    }

    record.coverage_cycles = cycles;
}
