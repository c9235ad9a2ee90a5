//! abstain-core — scoring, prompting, parsing and the session engine.
//!
//! This crate defines the data model, the model-client trait, and the
//! session and consistency-probe logic that the rest of abstain builds on.

pub mod consistency;
pub mod engine;
pub mod error;
pub mod grader;
pub mod judge;
pub mod model;
pub mod parser;
pub mod prompt;
pub mod report;
pub mod response;
pub mod scoring;
pub mod session;
pub mod statistics;
pub mod traits;

#[cfg(test)]
mod testing;
