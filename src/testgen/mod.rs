pub mod cache;
pub mod extract;
pub mod materialize;
pub mod refactor;
pub mod refine;
pub mod retry;
pub mod runner;
pub mod validate;
