//! testsmith: generate, validate and integrate unit tests for a source tree
//! with a language model, gated on compilation and coverage.

pub mod config;
pub mod control;
pub mod coverage;
pub mod detectors;
pub mod error;
pub mod llm;
pub mod logger;
pub mod orchestrator;
pub mod report;
pub mod state;
pub mod testgen;
