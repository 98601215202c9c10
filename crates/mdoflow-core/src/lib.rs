//! # mdoflow Core Library
//!
//! An orchestration core for multidisciplinary design optimization (MDO): users assemble
//! disciplines (black-box models with typed inputs and outputs) into hierarchical processes,
//! and the library configures them to a fixed point, propagates data through namespaced
//! variables, and solves coupled systems with multidisciplinary analysis (MDA) solvers.
//!
//! ## Architectural Philosophy
//!
//! The library follows a three-layer architecture with a clear separation of concerns.
//!
//! - **[`core`]: The Foundation.** Stateless data models: identifiers, dynamically typed
//!   values, variable declarations, namespaces, the [`core::data_manager::DataManager`]
//!   holding every variable of a study, and key anonymization for study dumps.
//!
//! - **[`engine`]: The Logic Core.** The stateful orchestration layer. It owns the discipline
//!   tree built from [`engine::builder::Builder`] descriptors, the configuration loop, the
//!   coupling graph analysis, the Gauss-Seidel and Newton-Raphson MDA solvers, the scatter
//!   tool, evaluation drivers, and the [`engine::execution_engine::ExecutionEngine`] that ties
//!   them together.
//!
//! - **[`workflows`]: The Public API.** The user-facing [`workflows::study::Study`] facade that
//!   loads, runs, dumps and reloads complete studies.

pub mod core;
pub mod engine;
pub mod workflows;
