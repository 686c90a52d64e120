//! testgen/retry.rs
//!
//! The generation loop for one function:
//!
//! ```text
//! GENERATING -> VALIDATING -> PASSED
//!      ^            |
//!      |            +-> RETRYING --+   (attempt < max_retries)
//!      +---------------------------+
//!                   +-> EXHAUSTED      (attempt == max_retries, fatal
//!                                       service error, cancellation)
//! ```
//!
//! Attempts are strictly sequential: every corrective prompt embeds the
//! previous attempt's candidate and diagnostic.

use crate::control::{CancelToken, Semaphore};
use crate::detectors::language::test_language;
use crate::error::GatewayError;
use crate::llm::backend::ModelGateway;
use crate::llm::prompt::{build_prompt, PromptHint, RuleSet, UnitContext};
use crate::state::{FunctionSignature, GenerationAttempt, Verdict};
use crate::testgen::extract::extract_code;
use crate::testgen::validate::Validator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Generating,
    Validating,
    Retrying,
    Passed,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExhaustReason {
    RetriesExhausted,
    FatalService(String),
    TransientService(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum ChainResult {
    Passed { candidate: String, attempt: u32 },
    Exhausted(ExhaustReason),
}

#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub signature: FunctionSignature,
    pub attempts: Vec<GenerationAttempt>,
    pub result: ChainResult,
}

impl ChainOutcome {
    pub fn passed(&self) -> bool {
        matches!(self.result, ChainResult::Passed { .. })
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        (self.attempts.len() as u32).saturating_sub(1)
    }
}

pub struct RetryController<'a> {
    pub gateway: &'a dyn ModelGateway,
    pub request_slots: &'a Semaphore,
    pub validator: &'a Validator<'a>,
    pub rules: &'a RuleSet,
    pub max_retries: u32,
    pub auto_fix: bool,
    pub cancel: &'a CancelToken,
}

impl RetryController<'_> {
    pub fn run(
        &self,
        unit: &UnitContext,
        sig: &FunctionSignature,
        initial_hint: &PromptHint,
    ) -> ChainOutcome {
        let test_lang = test_language(self.rules.framework);
        let max = self.max_retries.max(1);

        let mut attempts: Vec<GenerationAttempt> = Vec::new();
        let mut hint = initial_hint.clone();
        let mut state = ChainState::Generating;

        let finish = |attempts: Vec<GenerationAttempt>, result: ChainResult| ChainOutcome {
            signature: sig.clone(),
            attempts,
            result,
        };

        loop {
            let next = match state {
                ChainState::Generating => {
                    if self.cancel.is_cancelled() {
                        return finish(attempts, ChainResult::Exhausted(ExhaustReason::Cancelled));
                    }

                    let number = attempts.len() as u32 + 1;
                    let prompt = build_prompt(unit, sig, self.rules, &hint);
                    let mut attempt = GenerationAttempt::new(number, prompt.text());

                    let reply = {
                        let _slot = self.request_slots.acquire();
                        self.gateway.complete(&prompt)
                    };

                    match reply {
                        Ok(text) => {
                            attempt.candidate = extract_code(&text, test_lang).code;
                            attempt.response = text;
                            attempts.push(attempt);
                            ChainState::Validating
                        }
                        Err(e) => {
                            tracing::warn!(
                                unit = unit.path,
                                function = %sig.name,
                                attempt = number,
                                error = %e,
                                "model gateway failed"
                            );
                            attempt.diagnostic = e.to_string();
                            attempts.push(attempt);
                            let reason = match e {
                                GatewayError::Fatal(msg) => ExhaustReason::FatalService(msg),
                                GatewayError::Transient(msg) => ExhaustReason::TransientService(msg),
                                GatewayError::Cancelled => ExhaustReason::Cancelled,
                            };
                            return finish(attempts, ChainResult::Exhausted(reason));
                        }
                    }
                }

                ChainState::Validating => {
                    let Some(current) = attempts.last_mut() else {
                        return finish(attempts, ChainResult::Exhausted(ExhaustReason::RetriesExhausted));
                    };

                    let validation = self.validator.validate(&current.candidate);
                    current.verdict = validation.verdict;
                    current.diagnostic = validation.diagnostic;

                    tracing::info!(
                        unit = unit.path,
                        function = %sig.name,
                        attempt = current.number,
                        verdict = %current.verdict,
                        "candidate validated"
                    );

                    match current.verdict {
                        Verdict::Pass => ChainState::Passed,
                        _ if current.number < max => ChainState::Retrying,
                        _ => ChainState::Exhausted,
                    }
                }

                ChainState::Retrying => {
                    hint = match attempts.last() {
                        Some(prev) if self.auto_fix => PromptHint::Corrective {
                            attempt: prev.number,
                            candidate: prev.candidate.clone(),
                            verdict: prev.verdict,
                            diagnostic: prev.diagnostic.clone(),
                            escalate: prev.number >= 2,
                        },
                        _ => initial_hint.clone(),
                    };
                    ChainState::Generating
                }

                ChainState::Passed => {
                    let Some(last) = attempts.last() else {
                        return finish(attempts, ChainResult::Exhausted(ExhaustReason::RetriesExhausted));
                    };
                    let result = ChainResult::Passed {
                        candidate: last.candidate.clone(),
                        attempt: last.number,
                    };
                    return finish(attempts, result);
                }

                ChainState::Exhausted => {
                    tracing::warn!(
                        unit = unit.path,
                        function = %sig.name,
                        attempts = attempts.len(),
                        "retry budget exhausted"
                    );
                    return finish(attempts, ChainResult::Exhausted(ExhaustReason::RetriesExhausted));
                }
            };

            tracing::debug!(unit = unit.path, function = %sig.name, from = ?state, to = ?next, "chain transition");
            state = next;
        }
    }
}
