// Library interface for geodaily modules
// This allows tests and the binary to import modules

pub mod analysis;
pub mod archiver;
pub mod clustering;
pub mod cost;
pub mod dedup;
pub mod error;
pub mod grouping;
pub mod llm;
pub mod models;
pub mod processing;
pub mod resilience;
pub mod scoring;
pub mod storage;
pub mod text;
