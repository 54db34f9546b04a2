//! vulchain library crate
//!
//! Everything the `vulchain` binary does is reachable from here so the
//! benchmarks and integration tooling can drive the search without the CLI.

pub mod batch;
pub mod callers;
pub mod config;
pub mod error;
pub mod index;
pub mod logging;
pub mod oracle;
pub mod orchestrator;
pub mod poc;
pub mod search;
pub mod store;
pub mod testcase;
pub mod tools;
pub mod util;
