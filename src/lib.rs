//! ai-migrate library crate
//!
//! Exposes the migration engine so benchmarks and external tooling can
//! exercise manifest, parsing, and scheduling paths without going through
//! CLI startup.

pub mod attempt;
pub mod config;
pub mod evals;
pub mod examples;
pub mod llm;
pub mod manifest;
pub mod parse;
pub mod project;
pub mod prompt;
pub mod runner;
pub mod scheduler;
pub mod selector;
pub mod status;
pub mod util;
pub mod workspace;
