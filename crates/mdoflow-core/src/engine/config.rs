use super::error::MdaError;
use phf::phf_map;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{param}': {reason}")]
    InvalidValue { param: &'static str, reason: String },

    #[error("Unknown debug mode '{0}'")]
    UnknownDebugMode(String),

    #[error("Malformed scatter map for '{driver}': {reason}")]
    MalformedScatterMap { driver: String, reason: String },

    #[error("Driver '{driver}' cannot resolve evaluated variable '{name}'")]
    UnknownEvalVariable { driver: String, name: String },

    #[error("Discipline name '{0}' is used twice")]
    DuplicateDiscipline(String),

    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Solver used for each strongly coupled group of a coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MdaClass {
    GaussSeidel,
    PureNewtonRaphson,
}

static MDA_CLASSES: phf::Map<&'static str, MdaClass> = phf_map! {
    "GaussSeidel" => MdaClass::GaussSeidel,
    "MDAGaussSeidel" => MdaClass::GaussSeidel,
    "PureNewtonRaphson" => MdaClass::PureNewtonRaphson,
};

impl MdaClass {
    pub fn from_name(name: &str) -> Result<Self, MdaError> {
        MDA_CLASSES
            .get(name)
            .copied()
            .ok_or_else(|| MdaError::UnknownMdaClass(name.to_string()))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MdaClass::GaussSeidel => "GaussSeidel",
            MdaClass::PureNewtonRaphson => "PureNewtonRaphson",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    None,
    SimpleCache,
}

static CACHE_TYPES: phf::Map<&'static str, CacheType> = phf_map! {
    "None" => CacheType::None,
    "SimpleCache" => CacheType::SimpleCache,
};

impl CacheType {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        CACHE_TYPES
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::InvalidValue {
                param: "cache_type",
                reason: format!("unknown cache type '{name}'"),
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::None => "None",
            CacheType::SimpleCache => "SimpleCache",
        }
    }
}

/// Default numerical settings given to every coupling.
#[derive(Debug, Clone, PartialEq)]
pub struct MdaConfig {
    pub sub_mda_class: MdaClass,
    pub max_mda_iter: usize,
    pub tolerance: f64,
    pub over_relaxation_factor: f64,
    pub relax_factor: f64,
    pub warm_start: bool,
    pub n_processes: usize,
    pub cache_type: CacheType,
}

impl Default for MdaConfig {
    fn default() -> Self {
        Self {
            sub_mda_class: MdaClass::GaussSeidel,
            max_mda_iter: 30,
            tolerance: 1e-6,
            over_relaxation_factor: 1.0,
            relax_factor: 0.99,
            warm_start: false,
            n_processes: 1,
            cache_type: CacheType::None,
        }
    }
}

impl MdaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tolerance.is_nan() || self.tolerance <= 0.0 {
            return Err(ConfigError::InvalidValue {
                param: "tolerance",
                reason: format!("must be positive, got {}", self.tolerance),
            });
        }
        if self.max_mda_iter == 0 {
            return Err(ConfigError::InvalidValue {
                param: "max_mda_iter",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.n_processes == 0 {
            return Err(ConfigError::InvalidValue {
                param: "n_processes",
                reason: "must be at least 1".to_string(),
            });
        }
        for (param, factor, upper) in [
            ("over_relaxation_factor", self.over_relaxation_factor, 2.0),
            ("relax_factor", self.relax_factor, 1.0),
        ] {
            if factor.is_nan() || factor <= 0.0 || factor > upper {
                return Err(ConfigError::InvalidValue {
                    param,
                    reason: format!("must be in (0, {upper}], got {factor}"),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub max_configure_iterations: usize,
    pub mda: MdaConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_configure_iterations: 100,
            mda: MdaConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads a TOML configuration file, filling unspecified settings with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading engine configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let partial: PartialEngineConfig =
            toml::from_str(&content).map_err(|e| ConfigError::Toml {
                path: path.to_path_buf(),
                source: e,
            })?;
        partial.merge_with_defaults()
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    max_configure_iterations: Option<usize>,
    sub_mda_class: Option<MdaClass>,
    max_mda_iter: Option<usize>,
    tolerance: Option<f64>,
    over_relaxation_factor: Option<f64>,
    relax_factor: Option<f64>,
    warm_start: Option<bool>,
    n_processes: Option<usize>,
    cache_type: Option<CacheType>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_configure_iterations(mut self, iterations: usize) -> Self {
        self.max_configure_iterations = Some(iterations);
        self
    }
    pub fn sub_mda_class(mut self, class: MdaClass) -> Self {
        self.sub_mda_class = Some(class);
        self
    }
    pub fn max_mda_iter(mut self, iterations: usize) -> Self {
        self.max_mda_iter = Some(iterations);
        self
    }
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = Some(tolerance);
        self
    }
    pub fn over_relaxation_factor(mut self, factor: f64) -> Self {
        self.over_relaxation_factor = Some(factor);
        self
    }
    pub fn relax_factor(mut self, factor: f64) -> Self {
        self.relax_factor = Some(factor);
        self
    }
    pub fn warm_start(mut self, enabled: bool) -> Self {
        self.warm_start = Some(enabled);
        self
    }
    pub fn n_processes(mut self, n: usize) -> Self {
        self.n_processes = Some(n);
        self
    }
    pub fn cache_type(mut self, cache: CacheType) -> Self {
        self.cache_type = Some(cache);
        self
    }

    /// Builds the configuration. The solver class, iteration cap and tolerance are required;
    /// the remaining settings fall back to their defaults.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        let defaults = MdaConfig::default();
        let mda = MdaConfig {
            sub_mda_class: self
                .sub_mda_class
                .ok_or(ConfigError::MissingParameter("sub_mda_class"))?,
            max_mda_iter: self
                .max_mda_iter
                .ok_or(ConfigError::MissingParameter("max_mda_iter"))?,
            tolerance: self
                .tolerance
                .ok_or(ConfigError::MissingParameter("tolerance"))?,
            over_relaxation_factor: self
                .over_relaxation_factor
                .unwrap_or(defaults.over_relaxation_factor),
            relax_factor: self.relax_factor.unwrap_or(defaults.relax_factor),
            warm_start: self.warm_start.unwrap_or(defaults.warm_start),
            n_processes: self.n_processes.unwrap_or(defaults.n_processes),
            cache_type: self.cache_type.unwrap_or(defaults.cache_type),
        };
        mda.validate()?;
        Ok(EngineConfig {
            max_configure_iterations: self.max_configure_iterations.unwrap_or(100),
            mda,
        })
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialMdaConfig {
    sub_mda_class: Option<String>,
    max_mda_iter: Option<usize>,
    tolerance: Option<f64>,
    over_relaxation_factor: Option<f64>,
    relax_factor: Option<f64>,
    warm_start: Option<bool>,
    n_processes: Option<usize>,
    cache_type: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialEngineConfig {
    max_configure_iterations: Option<usize>,
    mda: Option<PartialMdaConfig>,
}

impl PartialEngineConfig {
    fn merge_with_defaults(self) -> Result<EngineConfig, ConfigError> {
        let defaults = EngineConfig::default();
        let mda_file = self.mda.unwrap_or_default();

        let sub_mda_class = match mda_file.sub_mda_class {
            Some(name) => MdaClass::from_name(&name).map_err(|e| ConfigError::InvalidValue {
                param: "sub-mda-class",
                reason: e.to_string(),
            })?,
            None => defaults.mda.sub_mda_class,
        };
        let cache_type = match mda_file.cache_type {
            Some(name) => CacheType::from_name(&name)?,
            None => defaults.mda.cache_type,
        };

        let mda = MdaConfig {
            sub_mda_class,
            max_mda_iter: mda_file.max_mda_iter.unwrap_or(defaults.mda.max_mda_iter),
            tolerance: mda_file.tolerance.unwrap_or(defaults.mda.tolerance),
            over_relaxation_factor: mda_file
                .over_relaxation_factor
                .unwrap_or(defaults.mda.over_relaxation_factor),
            relax_factor: mda_file.relax_factor.unwrap_or(defaults.mda.relax_factor),
            warm_start: mda_file.warm_start.unwrap_or(defaults.mda.warm_start),
            n_processes: mda_file.n_processes.unwrap_or(defaults.mda.n_processes),
            cache_type,
        };
        mda.validate()?;

        Ok(EngineConfig {
            max_configure_iterations: self
                .max_configure_iterations
                .unwrap_or(defaults.max_configure_iterations),
            mda,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn builder_requires_core_solver_settings() {
        let result = EngineConfigBuilder::new().tolerance(1e-8).build();
        assert!(matches!(
            result,
            Err(ConfigError::MissingParameter("sub_mda_class"))
        ));

        let config = EngineConfigBuilder::new()
            .sub_mda_class(MdaClass::PureNewtonRaphson)
            .max_mda_iter(50)
            .tolerance(1e-8)
            .build()
            .unwrap();
        assert_eq!(config.mda.relax_factor, 0.99);
        assert_eq!(config.max_configure_iterations, 100);
    }

    #[test]
    fn builder_rejects_out_of_range_relaxation() {
        let result = EngineConfigBuilder::new()
            .sub_mda_class(MdaClass::GaussSeidel)
            .max_mda_iter(10)
            .tolerance(1e-6)
            .over_relaxation_factor(2.5)
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue {
                param: "over_relaxation_factor",
                ..
            })
        ));
    }

    #[test]
    fn file_settings_override_defaults() {
        let file = write_config(
            r#"
max-configure-iterations = 20

[mda]
sub-mda-class = "PureNewtonRaphson"
tolerance = 1e-9
cache-type = "SimpleCache"
n-processes = 2
"#,
        );
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_configure_iterations, 20);
        assert_eq!(config.mda.sub_mda_class, MdaClass::PureNewtonRaphson);
        assert_eq!(config.mda.tolerance, 1e-9);
        assert_eq!(config.mda.cache_type, CacheType::SimpleCache);
        assert_eq!(config.mda.n_processes, 2);
        assert_eq!(config.mda.max_mda_iter, 30);
    }

    #[test]
    fn file_with_unknown_key_is_rejected() {
        let file = write_config("[mda]\nunknown-setting = 1\n");
        assert!(matches!(
            EngineConfig::from_file(file.path()),
            Err(ConfigError::Toml { .. })
        ));
    }

    #[test]
    fn missing_file_reports_io_error() {
        let result = EngineConfig::from_file(Path::new("/nonexistent/engine.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn mda_class_names_resolve_through_static_table() {
        assert_eq!(
            MdaClass::from_name("MDAGaussSeidel").unwrap(),
            MdaClass::GaussSeidel
        );
        assert!(MdaClass::from_name("Jacobi").is_err());
    }
}
