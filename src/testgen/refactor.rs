//! testgen/refactor.rs
//!
//! Optional pass that asks the model for a behavior-preserving cleanup of a
//! source file and writes it under `output_refactored_dir`. The original
//! file is never touched and tests are still generated against it.

use std::path::{Path, PathBuf};

use crate::control::{CancelToken, Semaphore};
use crate::llm::backend::ModelGateway;
use crate::llm::prompt::{build_refactor_prompt, UnitContext};
use crate::state::SourceUnit;
use crate::testgen::extract::extract_code;
use crate::testgen::materialize::integrate;
use crate::testgen::validate::check_source_syntax;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefactorOutcome {
    Written(PathBuf),
    Unchanged(PathBuf),
    Failed(String),
}

pub struct Refactorer<'a> {
    pub gateway: &'a dyn ModelGateway,
    pub request_slots: &'a Semaphore,
    pub max_attempts: u32,
    pub out_dir: &'a Path,
    pub cancel: &'a CancelToken,
}

impl Refactorer<'_> {
    pub fn refactor(&self, unit: &SourceUnit) -> RefactorOutcome {
        let ctx = UnitContext {
            path: &unit.path,
            language: unit.language,
            source: &unit.source,
            import_hint: String::new(),
        };

        let mut previous: Option<(String, String)> = None;

        for attempt in 1..=self.max_attempts.max(1) {
            if self.cancel.is_cancelled() {
                return RefactorOutcome::Failed("cancelled".into());
            }

            let prompt = build_refactor_prompt(
                &ctx,
                previous.as_ref().map(|(c, d)| (c.as_str(), d.as_str())),
            );

            let reply = {
                let _slot = self.request_slots.acquire();
                self.gateway.complete(&prompt)
            };

            let reply = match reply {
                Ok(r) => r,
                Err(e) => return RefactorOutcome::Failed(e.to_string()),
            };

            let code = extract_code(&reply, unit.language).code;
            match check_source_syntax(&code, unit.language) {
                Ok(()) => {
                    let target = self.out_dir.join(&unit.path);
                    return match integrate(&target, &code) {
                        Ok(true) => RefactorOutcome::Written(target),
                        Ok(false) => RefactorOutcome::Unchanged(target),
                        Err(e) => RefactorOutcome::Failed(e.to_string()),
                    };
                }
                Err(diagnostic) => {
                    tracing::info!(unit = %unit.path, attempt, %diagnostic, "refactored source rejected");
                    previous = Some((code, diagnostic));
                }
            }
        }

        RefactorOutcome::Failed(format!(
            "no syntactically valid refactoring after {} attempt(s)",
            self.max_attempts.max(1)
        ))
    }
}
