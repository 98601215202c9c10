//! # Workflows Module
//!
//! High-level entry points for users of mdoflow.
//!
//! ## Overview
//!
//! A workflow wraps an [`crate::engine::execution_engine::ExecutionEngine`] and covers the
//! whole life of a study: loading input values, running the process, and persisting the
//! result as a portable dump that can be reloaded under another study name.
//!
//! ## Architecture
//!
//! - **Study Workflow** ([`study`]) - Load, run, dump and reload complete studies, with dumps
//!   stored as JSON files.

pub mod study;
