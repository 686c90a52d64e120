pub mod ast;
pub mod language;
pub mod scan;
