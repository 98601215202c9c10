use super::config::ConfigError;
use super::datasets::DatasetError;
use crate::core::data_manager::DataError;
use crate::core::namespace::NamespaceError;
use std::path::PathBuf;
use thiserror::Error;

/// Failure raised by a user model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("Input '{0}' is not available")]
    MissingInput(String),

    #[error("Input '{name}' has an unexpected type: {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("Output '{0}' was declared but not computed")]
    MissingOutput(String),

    #[error("{0}")]
    Computation(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MdaError {
    #[error("Relaxation factor must be in (0, 1], got {0}")]
    InvalidRelaxFactor(f64),

    #[error("Over-relaxation factor must be in (0, 2], got {0}")]
    InvalidOverRelaxationFactor(f64),

    #[error("Unknown MDA class '{0}'")]
    UnknownMdaClass(String),

    #[error("Coupling variable '{0}' is not numeric")]
    NonNumericCoupling(String),

    #[error("Coupling variable '{0}' has no value")]
    MissingCoupling(String),

    #[error("Singular Jacobian in coupling '{coupling}' at iteration {iteration}")]
    SingularJacobian { coupling: String, iteration: usize },

    #[error("Jacobian of '{discipline}' for d{output}/d{input} has shape {found:?}, expected {expected:?}")]
    JacobianShape {
        discipline: String,
        output: String,
        input: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Cannot initialize strong couplings of '{coupling}', no discipline is ready:\n{}", .missing.join("\n"))]
    PreRunImpossible {
        coupling: String,
        missing: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Namespace error: {0}")]
    Namespace(#[from] NamespaceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MDA error: {0}")]
    Mda(#[from] MdaError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Discipline '{discipline}' failed: {source}")]
    Model {
        discipline: String,
        #[source]
        source: ModelError,
    },

    #[error("Missing input '{variable}' for discipline '{discipline}'")]
    MissingInput {
        discipline: String,
        variable: String,
    },

    #[error("Debug check '{mode}' failed for '{discipline}': {reason}")]
    DebugCheck {
        mode: &'static str,
        discipline: String,
        reason: String,
    },

    #[error("No root process has been set")]
    NoRootProcess,

    #[error("Unknown discipline: {0}")]
    UnknownDiscipline(String),

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),

    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
