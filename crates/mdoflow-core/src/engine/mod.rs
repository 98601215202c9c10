//! # Engine Module
//!
//! The stateful orchestration layer of mdoflow: it turns builder descriptions into a tree of
//! disciplines, configures that tree against the study data until it stops changing, and
//! executes it with coupled-system solvers.
//!
//! ## Overview
//!
//! The [`execution_engine::ExecutionEngine`] owns the data manager, the namespace registry
//! and the [`factory::Factory`] holding the discipline tree. Loading a study drives the
//! configuration loop (build, register schemas, re-inject data) to a fixed point; executing
//! it walks the tree on a snapshot of the data, solving each coupling's cycles with a
//! Gauss-Seidel or Newton-Raphson MDA.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Engine and default MDA settings, TOML loading
//! - **Error Handling** ([`error`]) - Layered error types and their conversions
//! - **Progress Monitoring** ([`progress`]) - Phase and task events for callers
//! - **Model Contract** ([`model`]) - The trait user computations implement
//! - **Process Tree** ([`builder`], [`discipline`], [`factory`]) - Descriptors, nodes and
//!   their owner
//! - **Dynamic Expansion** ([`scatter`], [`driver`]) - Per-instance replication and
//!   evaluation drivers
//! - **Solvers** ([`mda`], [`strategies`]) - MDA algorithms, samplers and optimizers
//! - **Data Sources** ([`datasets`]) - Connectors filling inputs from external datasets
//! - **Orchestration** ([`execution_engine`]) - The load and execute protocols

pub mod builder;
pub mod config;
pub(crate) mod configure;
pub(crate) mod coupling;
pub mod datasets;
pub mod debug;
pub mod discipline;
pub mod driver;
pub mod error;
pub(crate) mod execution;
pub mod execution_engine;
pub mod factory;
pub mod mda;
pub mod model;
pub(crate) mod parallel;
pub mod progress;
pub mod scatter;
pub mod strategies;

#[cfg(test)]
pub(crate) mod test_models;
