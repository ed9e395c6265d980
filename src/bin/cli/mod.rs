//! CLI subcommand implementations for hermetic-fuzz

pub mod inputs;
pub mod mode;
pub mod patterns;
