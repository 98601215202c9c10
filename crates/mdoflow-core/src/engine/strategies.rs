//! Sampling and optimization strategies pluggable into an evaluation driver.

use super::config::ConfigError;
use super::error::EngineError;
use crate::core::value::{DataFrame, Value, VarType};
use crate::core::variable::VariableSpec;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

pub const DESIGN_SPACE_VARIABLE: &str = "variable";
pub const DESIGN_SPACE_LOWER: &str = "lower_bnd";
pub const DESIGN_SPACE_UPPER: &str = "upper_bnd";
pub const DESIGN_SPACE_VALUE: &str = "value";

#[derive(Debug, Clone, PartialEq)]
pub struct DesignVariable {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
    pub value: f64,
}

/// Box-bounded scalar variables, one per row of a design space table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DesignSpace {
    variables: Vec<DesignVariable>,
}

impl DesignSpace {
    pub fn new(variables: Vec<DesignVariable>) -> Self {
        Self { variables }
    }

    /// Reads a table with `variable`, `lower_bnd`, `upper_bnd` and `value` columns.
    ///
    /// A missing `value` starts the variable at the middle of its bounds.
    pub fn from_dataframe(df: &DataFrame) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            param: "design_space",
            reason,
        };
        for column in [DESIGN_SPACE_VARIABLE, DESIGN_SPACE_LOWER, DESIGN_SPACE_UPPER] {
            if df.column_index(column).is_none() {
                return Err(invalid(format!("missing column '{column}'")));
            }
        }

        let mut variables = Vec::with_capacity(df.n_rows());
        for row in 0..df.n_rows() {
            let name = df
                .get(row, DESIGN_SPACE_VARIABLE)
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(format!("row {row} has no variable name")))?;
            let bound = |column: &str| {
                df.get(row, column)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| invalid(format!("'{name}' has no numeric {column}")))
            };
            let (lower, upper) = (bound(DESIGN_SPACE_LOWER)?, bound(DESIGN_SPACE_UPPER)?);
            if lower > upper {
                return Err(invalid(format!(
                    "'{name}' has lower bound {lower} above upper bound {upper}"
                )));
            }
            let value = df
                .get(row, DESIGN_SPACE_VALUE)
                .and_then(Value::as_f64)
                .unwrap_or(0.5 * (lower + upper));
            variables.push(DesignVariable {
                name: name.to_string(),
                lower,
                upper,
                value: value.clamp(lower, upper),
            });
        }
        Ok(Self { variables })
    }

    pub fn variables(&self) -> &[DesignVariable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&DesignVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn dimension(&self) -> usize {
        self.variables.len()
    }

    pub fn contains(&self, x: &[f64]) -> bool {
        x.len() == self.variables.len()
            && self
                .variables
                .iter()
                .zip(x)
                .all(|(v, &xi)| xi >= v.lower && xi <= v.upper)
    }
}

/// Produces the sample table of a design of experiments.
pub trait SampleGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Options understood by `algo_name`, with their defaults.
    fn get_options_desc_in(&self, _algo_name: &str) -> Vec<VariableSpec> {
        Vec::new()
    }

    /// One column per selected input, one row per sample.
    fn generate_samples(
        &self,
        algo_name: &str,
        options: &BTreeMap<String, Value>,
        selected_inputs: &[String],
        design_space: Option<&DesignSpace>,
    ) -> Result<DataFrame, ConfigError>;
}

/// Full factorial over explicit value lists given per input in the options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CartesianProductGenerator;

impl SampleGenerator for CartesianProductGenerator {
    fn name(&self) -> &str {
        "CartesianProduct"
    }

    fn generate_samples(
        &self,
        _algo_name: &str,
        options: &BTreeMap<String, Value>,
        selected_inputs: &[String],
        _design_space: Option<&DesignSpace>,
    ) -> Result<DataFrame, ConfigError> {
        let mut axes: Vec<Vec<Value>> = Vec::with_capacity(selected_inputs.len());
        for input in selected_inputs {
            let values = match options.get(input) {
                Some(Value::List(items)) => items.clone(),
                Some(Value::Array(items)) => items.iter().copied().map(Value::Float).collect(),
                Some(Value::StringList(items)) => {
                    items.iter().cloned().map(Value::String).collect()
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        param: "algo_options",
                        reason: format!("no list of values for '{input}'"),
                    });
                }
            };
            axes.push(values);
        }

        let mut samples = DataFrame::new(selected_inputs.iter().cloned());
        if axes.is_empty() {
            return Ok(samples);
        }
        for row in axes.into_iter().multi_cartesian_product() {
            samples.push_row(row);
        }
        Ok(samples)
    }
}

/// Uniform sampling inside the design space bounds, reproducible through `seed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonteCarloGenerator;

impl MonteCarloGenerator {
    pub const N_SAMPLES: &'static str = "n_samples";
    pub const SEED: &'static str = "seed";
}

impl SampleGenerator for MonteCarloGenerator {
    fn name(&self) -> &str {
        "MonteCarlo"
    }

    fn get_options_desc_in(&self, _algo_name: &str) -> Vec<VariableSpec> {
        vec![
            VariableSpec::new(Self::N_SAMPLES, VarType::Int).default_value(Value::Int(10)),
            VariableSpec::new(Self::SEED, VarType::Int).default_value(Value::Int(1)),
        ]
    }

    fn generate_samples(
        &self,
        _algo_name: &str,
        options: &BTreeMap<String, Value>,
        selected_inputs: &[String],
        design_space: Option<&DesignSpace>,
    ) -> Result<DataFrame, ConfigError> {
        let design_space = design_space.ok_or(ConfigError::MissingParameter("design_space"))?;
        let read = |name: &'static str, default: i64| -> Result<i64, ConfigError> {
            match options.get(name) {
                None => Ok(default),
                Some(v) => v.as_i64().ok_or_else(|| ConfigError::InvalidValue {
                    param: name,
                    reason: format!("expected an integer, got {}", v.var_type()),
                }),
            }
        };
        let n_samples = usize::try_from(read(Self::N_SAMPLES, 10)?).map_err(|_| {
            ConfigError::InvalidValue {
                param: Self::N_SAMPLES,
                reason: "must not be negative".to_string(),
            }
        })?;
        let seed = read(Self::SEED, 1)? as u64;

        let bounds = selected_inputs
            .iter()
            .map(|name| {
                design_space
                    .variable(name)
                    .map(|v| (v.lower, v.upper))
                    .ok_or_else(|| ConfigError::InvalidValue {
                        param: "design_space",
                        reason: format!("no bounds for '{name}'"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut rng = StdRng::seed_from_u64(seed);
        let mut samples = DataFrame::new(selected_inputs.iter().cloned());
        for _ in 0..n_samples {
            let row = bounds
                .iter()
                .map(|&(lower, upper)| {
                    let x = if upper > lower {
                        rng.gen_range(lower..=upper)
                    } else {
                        lower
                    };
                    Value::Float(x)
                })
                .collect();
            samples.push_row(row);
        }
        Ok(samples)
    }
}

/// What an optimizer sees of the evaluation sub-process.
pub trait OptimizationProblem {
    fn dimension(&self) -> usize;

    fn bounds(&self) -> Vec<(f64, f64)>;

    fn initial_point(&self) -> Vec<f64>;

    /// Objective value at `x`, running the sub-process once.
    fn evaluate(&mut self, x: &[f64]) -> Result<f64, EngineError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub x_opt: Vec<f64>,
    pub objective: f64,
    pub is_feasible: bool,
    pub n_evaluations: usize,
}

/// Minimizes the objective of an [`OptimizationProblem`].
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    fn run(
        &self,
        problem: &mut dyn OptimizationProblem,
        options: &BTreeMap<String, Value>,
    ) -> Result<OptimizationResult, EngineError>;
}

/// Derivative-free pattern search inside the bounds.
///
/// Options: `max_iter` (default 200), `initial_step` as a fraction of each range (0.25),
/// `min_step` (1e-6).
#[derive(Debug, Clone, Copy, Default)]
pub struct CompassSearch;

impl Optimizer for CompassSearch {
    fn name(&self) -> &str {
        "CompassSearch"
    }

    fn run(
        &self,
        problem: &mut dyn OptimizationProblem,
        options: &BTreeMap<String, Value>,
    ) -> Result<OptimizationResult, EngineError> {
        let option = |name: &str, default: f64| options.get(name).and_then(Value::as_f64).unwrap_or(default);
        let max_iter = option("max_iter", 200.0).max(1.0) as usize;
        let initial_step = option("initial_step", 0.25);
        let min_step = option("min_step", 1e-6);

        let bounds = problem.bounds();
        let mut x: Vec<f64> = problem
            .initial_point()
            .iter()
            .zip(&bounds)
            .map(|(&xi, &(lower, upper))| xi.clamp(lower, upper))
            .collect();
        let mut best = problem.evaluate(&x)?;
        let mut n_evaluations = 1;
        let mut steps: Vec<f64> = bounds
            .iter()
            .map(|&(lower, upper)| initial_step * (upper - lower).max(min_step))
            .collect();

        for _ in 0..max_iter {
            let mut improved = false;
            for i in 0..x.len() {
                for direction in [1.0, -1.0] {
                    let mut candidate = x.clone();
                    candidate[i] = (x[i] + direction * steps[i]).clamp(bounds[i].0, bounds[i].1);
                    if candidate[i] == x[i] {
                        continue;
                    }
                    let value = problem.evaluate(&candidate)?;
                    n_evaluations += 1;
                    if value < best {
                        best = value;
                        x = candidate;
                        improved = true;
                        break;
                    }
                }
            }
            if !improved {
                steps.iter_mut().for_each(|s| *s *= 0.5);
                if steps.iter().all(|&s| s < min_step) {
                    break;
                }
            }
        }

        let is_feasible = x
            .iter()
            .zip(&bounds)
            .all(|(&xi, &(lower, upper))| xi >= lower && xi <= upper)
            && best.is_finite();
        Ok(OptimizationResult {
            x_opt: x,
            objective: best,
            is_feasible,
            n_evaluations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design_space() -> DesignSpace {
        let df = DataFrame::new([
            DESIGN_SPACE_VARIABLE,
            DESIGN_SPACE_LOWER,
            DESIGN_SPACE_UPPER,
            DESIGN_SPACE_VALUE,
        ])
        .with_row(vec!["x".into(), 0.0.into(), 10.0.into(), 1.0.into()])
        .with_row(vec!["y".into(), (-1.0).into(), 1.0.into(), 0.0.into()]);
        DesignSpace::from_dataframe(&df).unwrap()
    }

    #[test]
    fn design_space_reads_bounds_and_values() {
        let ds = design_space();
        assert_eq!(ds.dimension(), 2);
        assert_eq!(ds.variable("y").unwrap().lower, -1.0);
        assert!(ds.contains(&[5.0, 0.5]));
        assert!(!ds.contains(&[11.0, 0.5]));
    }

    #[test]
    fn design_space_rejects_missing_columns() {
        let df = DataFrame::new([DESIGN_SPACE_VARIABLE, DESIGN_SPACE_LOWER]);
        assert!(matches!(
            DesignSpace::from_dataframe(&df),
            Err(ConfigError::InvalidValue { param: "design_space", .. })
        ));
    }

    #[test]
    fn cartesian_product_enumerates_every_combination() {
        let mut options = BTreeMap::new();
        options.insert("a".to_string(), Value::Array(vec![1.0, 2.0]));
        options.insert(
            "b".to_string(),
            Value::List(vec![Value::Int(10), Value::Int(20), Value::Int(30)]),
        );
        let df = CartesianProductGenerator
            .generate_samples("", &options, &["a".to_string(), "b".to_string()], None)
            .unwrap();
        assert_eq!(df.n_rows(), 6);
        assert_eq!(df.get(0, "a"), Some(&Value::Float(1.0)));
        assert_eq!(df.get(0, "b"), Some(&Value::Int(10)));
        assert_eq!(df.get(5, "a"), Some(&Value::Float(2.0)));
        assert_eq!(df.get(5, "b"), Some(&Value::Int(30)));
    }

    #[test]
    fn cartesian_product_requires_values_for_each_input() {
        let err = CartesianProductGenerator
            .generate_samples("", &BTreeMap::new(), &["a".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { param: "algo_options", .. }));
    }

    #[test]
    fn monte_carlo_is_seeded_and_bounded() {
        let mut options = BTreeMap::new();
        options.insert(MonteCarloGenerator::N_SAMPLES.to_string(), Value::Int(20));
        options.insert(MonteCarloGenerator::SEED.to_string(), Value::Int(7));
        let inputs = vec!["x".to_string(), "y".to_string()];
        let ds = design_space();

        let first = MonteCarloGenerator
            .generate_samples("", &options, &inputs, Some(&ds))
            .unwrap();
        let second = MonteCarloGenerator
            .generate_samples("", &options, &inputs, Some(&ds))
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.n_rows(), 20);
        for row in 0..first.n_rows() {
            let x = first.get(row, "x").and_then(Value::as_f64).unwrap();
            let y = first.get(row, "y").and_then(Value::as_f64).unwrap();
            assert!(ds.contains(&[x, y]));
        }
    }

    struct Quadratic {
        calls: usize,
    }

    impl OptimizationProblem for Quadratic {
        fn dimension(&self) -> usize {
            2
        }

        fn bounds(&self) -> Vec<(f64, f64)> {
            vec![(-5.0, 5.0), (-5.0, 5.0)]
        }

        fn initial_point(&self) -> Vec<f64> {
            vec![4.0, -4.0]
        }

        fn evaluate(&mut self, x: &[f64]) -> Result<f64, EngineError> {
            self.calls += 1;
            Ok((x[0] - 1.0).powi(2) + (x[1] + 2.0).powi(2))
        }
    }

    #[test]
    fn compass_search_finds_the_minimum_of_a_bowl() {
        let mut problem = Quadratic { calls: 0 };
        let result = CompassSearch.run(&mut problem, &BTreeMap::new()).unwrap();
        assert!((result.x_opt[0] - 1.0).abs() < 1e-4);
        assert!((result.x_opt[1] + 2.0).abs() < 1e-4);
        assert!(result.is_feasible);
        assert_eq!(result.n_evaluations, problem.calls);
    }
}
