//! # Core Module
//!
//! Stateless data models shared by the whole library.
//!
//! ## Overview
//!
//! Everything a study stores lives here: the [`value::Value`] payloads, the
//! [`variable::VariableSpec`] declarations disciplines publish, the schemas assembled from
//! them, the namespace registry that turns short names into full paths, and the
//! [`data_manager::DataManager`] that indexes every variable by path and by [`ids::VarId`].
//!
//! ## Architecture
//!
//! - **Identifiers** ([`ids`]) - Slot-map keys for variables, disciplines and namespaces
//! - **Values** ([`value`]) - Dynamically typed payloads and their numeric flattening
//! - **Variables** ([`variable`], [`schema`]) - Declarations, metadata and schema deltas
//! - **Namespaces** ([`namespace`]) - Immutable namespace values with generation ids
//! - **Storage** ([`data_manager`]) - The single source of truth for variable values
//! - **Serialization helpers** ([`anonymize`]) - Study-independent keys for dumps

pub mod anonymize;
pub mod data_manager;
pub mod ids;
pub mod namespace;
pub mod schema;
pub mod value;
pub mod variable;
