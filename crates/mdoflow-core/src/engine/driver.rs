//! Evaluation driver: runs its sub-process over a table of samples, or lets an optimizer
//! drive it.

use super::builder::Builder;
use super::config::ConfigError;
use super::coupling::run_chain;
use super::discipline::{DisciplineNode, NodeBehavior};
use super::error::EngineError;
use super::execution::{ExecScope, Executor};
use super::factory::{EngineContext, Factory};
use super::mda::{self, N_PROCESSES};
use super::parallel::fork_join;
use super::progress::Progress;
use super::strategies::{DesignSpace, OptimizationProblem, Optimizer, SampleGenerator};
use crate::core::data_manager::LocalData;
use crate::core::ids::{DisciplineId, VarId};
use crate::core::namespace::compose_ns;
use crate::core::schema::{Provenance, Schema, SchemaDelta};
use crate::core::value::{DataFrame, Value, VarType};
use crate::core::variable::{IoType, VariableSpec};
use crate::engine::config::MdaConfig;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const EVAL_INPUTS: &str = "eval_inputs";
pub const EVAL_OUTPUTS: &str = "eval_outputs";
pub const SAMPLES_DF: &str = "samples_df";
pub const ALGO_NAME: &str = "algo_name";
pub const ALGO_OPTIONS: &str = "algo_options";
pub const DESIGN_SPACE: &str = "design_space";
pub const OBJECTIVE_NAME: &str = "objective_name";
pub const SAMPLES_INPUTS_DF: &str = "samples_inputs_df";
pub const X_OPT: &str = "x_opt";
pub const OBJECTIVE_OPT: &str = "objective_opt";
pub const IS_FEASIBLE: &str = "is_feasible";
pub const NS_DOE: &str = "ns_doe";
pub const SCENARIO_COLUMN: &str = "scenario";

/// How an evaluation driver obtains the points it evaluates.
#[derive(Clone)]
pub enum DriverStrategy {
    /// Samples are given by the user in `samples_df`.
    Samples,
    /// Samples come from `samples_df` if set, otherwise from the generator.
    Doe(Arc<dyn SampleGenerator>),
    /// The optimizer chooses the points.
    Optimizer(Arc<dyn Optimizer>),
}

impl DriverStrategy {
    pub fn doe(generator: impl SampleGenerator + 'static) -> Self {
        Self::Doe(Arc::new(generator))
    }

    pub fn optimizer(optimizer: impl Optimizer + 'static) -> Self {
        Self::Optimizer(Arc::new(optimizer))
    }
}

impl fmt::Debug for DriverStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Samples => f.write_str("Samples"),
            Self::Doe(generator) => write!(f, "Doe({})", generator.name()),
            Self::Optimizer(optimizer) => write!(f, "Optimizer({})", optimizer.name()),
        }
    }
}

/// An eval input or output resolved to a variable of the sub-process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EvalVariable {
    pub name: String,
    pub path: String,
    pub var: VarId,
    /// Output gathering this variable's samples, for eval outputs of a sampling driver.
    pub dict_name: String,
}

pub(crate) struct DriverState {
    pub strategy: DriverStrategy,
    pub builders: Vec<Builder>,
    pub built: bool,
    pub eval_inputs: Vec<EvalVariable>,
    pub eval_outputs: Vec<EvalVariable>,
}

impl DriverState {
    pub(crate) fn new(strategy: DriverStrategy, builders: Vec<Builder>) -> Self {
        Self {
            strategy,
            builders,
            built: false,
            eval_inputs: Vec::new(),
            eval_outputs: Vec::new(),
        }
    }
}

/// Name of the output gathering the samples of `eval_output`: its path relative to the
/// driver (or to the study) suffixed with `_dict`.
pub fn dict_output_name(driver: &str, study: &str, eval_output: &str) -> String {
    let relative = [driver, study]
        .into_iter()
        .find_map(|prefix| {
            eval_output
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
        })
        .unwrap_or(eval_output);
    format!("{relative}_dict")
}

fn string_list(node: &DisciplineNode, name: &str, ctx: &EngineContext<'_>) -> Vec<String> {
    node.input(name)
        .and_then(|p| ctx.dm.value_by_id(p.var))
        .and_then(Value::as_string_list)
        .map(<[String]>::to_vec)
        .unwrap_or_default()
}

/// Declarations of a driver, derived from its strategy and the current eval outputs.
///
/// Binds `ns_doe` to the study when nothing defines it yet.
pub(crate) fn driver_schema(
    factory: &Factory,
    id: DisciplineId,
    ctx: &mut EngineContext<'_>,
) -> Result<Schema, EngineError> {
    let node = factory.get(id)?;
    let NodeBehavior::EvalDriver(state) = &node.behavior else {
        return Err(EngineError::Internal("driver schema on a non-driver node".into()));
    };
    if factory.resolve_namespace(id, NS_DOE, ctx.ns).is_none() {
        ctx.ns.add_ns(NS_DOE, ctx.study_name);
        debug!(driver = %node.full_name, "Namespace ns_doe bound to the study");
    }

    let list = |name: &str| {
        VariableSpec::new(name, VarType::StringList)
            .structuring()
            .default_value(Vec::<String>::new())
    };
    let mut delta = SchemaDelta::new(Provenance::Driver)
        .input(list(EVAL_INPUTS))
        .input(list(EVAL_OUTPUTS))
        .input(
            VariableSpec::new(N_PROCESSES, VarType::Int)
                .numerical()
                .default_value(Value::Int(1)),
        )
        .input(
            VariableSpec::new(ALGO_OPTIONS, VarType::Dict)
                .default_value(Value::Dict(BTreeMap::new())),
        );

    match &state.strategy {
        DriverStrategy::Samples | DriverStrategy::Doe(_) => {
            delta = delta
                .input(VariableSpec::new(SAMPLES_DF, VarType::DataFrame).optional())
                .output(VariableSpec::new(SAMPLES_INPUTS_DF, VarType::DataFrame));
            if let DriverStrategy::Doe(generator) = &state.strategy {
                delta = delta
                    .input(
                        VariableSpec::new(ALGO_NAME, VarType::String)
                            .default_value(generator.name()),
                    )
                    .input(VariableSpec::new(DESIGN_SPACE, VarType::DataFrame).optional());
            }
            for output in string_list(node, EVAL_OUTPUTS, ctx) {
                delta = delta.output(
                    VariableSpec::new(
                        dict_output_name(&node.full_name, ctx.study_name, &output),
                        VarType::Dict,
                    )
                    .shared(NS_DOE),
                );
            }
        }
        DriverStrategy::Optimizer(_) => {
            delta = delta
                .input(VariableSpec::new(DESIGN_SPACE, VarType::DataFrame))
                .input(VariableSpec::new(OBJECTIVE_NAME, VarType::String))
                .output(VariableSpec::new(X_OPT, VarType::Array))
                .output(VariableSpec::new(OBJECTIVE_OPT, VarType::Float))
                .output(VariableSpec::new(IS_FEASIBLE, VarType::Bool));
        }
    }
    Ok(Schema::from_deltas([delta]))
}

/// Candidate full paths for an eval variable name, most specific first.
fn candidate_paths(driver: &str, study: &str, name: &str) -> [String; 3] {
    [
        compose_ns([driver, name]),
        compose_ns([study, name]),
        name.to_string(),
    ]
}

/// Resolves `eval_inputs` and `eval_outputs` against the variables of the sub-process.
///
/// Names are looked up under the driver first, then under the study, then as full paths.
pub(crate) fn resolve_eval_variables(
    factory: &mut Factory,
    id: DisciplineId,
    ctx: &mut EngineContext<'_>,
) -> Result<(), EngineError> {
    let (driver, inputs, outputs) = {
        let node = factory.get(id)?;
        (
            node.full_name.clone(),
            string_list(node, EVAL_INPUTS, ctx),
            string_list(node, EVAL_OUTPUTS, ctx),
        )
    };

    let resolve = |names: Vec<String>, io_type: Option<IoType>| {
        names
            .into_iter()
            .map(|name| {
                candidate_paths(&driver, ctx.study_name, &name)
                    .into_iter()
                    .find_map(|path| {
                        let var = ctx.dm.var_id(&path)?;
                        let variable = ctx.dm.variable(var)?;
                        (io_type.is_none() || io_type == Some(variable.io_type))
                            .then_some(EvalVariable {
                                dict_name: dict_output_name(&driver, ctx.study_name, &name),
                                name: name.clone(),
                                path,
                                var,
                            })
                    })
                    .ok_or_else(|| ConfigError::UnknownEvalVariable {
                        driver: driver.clone(),
                        name,
                    })
            })
            .collect::<Result<Vec<_>, _>>()
    };
    let eval_inputs = resolve(inputs, Some(IoType::In))?;
    let eval_outputs = resolve(outputs, None)?;

    if let NodeBehavior::EvalDriver(state) = &mut factory.get_mut(id)?.behavior {
        state.eval_inputs = eval_inputs;
        state.eval_outputs = eval_outputs;
    }
    Ok(())
}

fn input_value<'d>(node: &DisciplineNode, data: &'d LocalData, name: &str) -> Option<&'d Value> {
    node.input(name).and_then(|p| data.get(&p.var))
}

fn missing(node: &DisciplineNode, name: &str) -> EngineError {
    EngineError::MissingInput {
        discipline: node.full_name.clone(),
        variable: compose_ns([node.full_name.as_str(), name]),
    }
}

/// Runs a driver node: every sample (or optimizer query) evaluates the sub-process on its
/// own copy of `data`, and only the driver's outputs are written back.
#[instrument(skip_all, name = "eval_driver", fields(driver = %node.full_name))]
pub(crate) fn run_driver(
    exec: &Executor<'_>,
    node: &DisciplineNode,
    state: &DriverState,
    data: &mut LocalData,
    scope: ExecScope,
) -> Result<(), EngineError> {
    let options = mda::options_from_inputs(node, data, &exec.config.mda)?;
    let algo_options = input_value(node, data, ALGO_OPTIONS)
        .and_then(Value::as_dict)
        .cloned()
        .unwrap_or_default();

    match &state.strategy {
        DriverStrategy::Samples => {
            run_samples(exec, node, state, data, &options, scope, None, &algo_options)?
        }
        DriverStrategy::Doe(generator) => run_samples(
            exec,
            node,
            state,
            data,
            &options,
            scope,
            Some(generator.as_ref()),
            &algo_options,
        )?,
        DriverStrategy::Optimizer(optimizer) => run_optimizer(
            exec,
            node,
            state,
            data,
            &options,
            scope,
            optimizer.as_ref(),
            &algo_options,
        )?,
    }
    node.runtime().n_calls += 1;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_samples(
    exec: &Executor<'_>,
    node: &DisciplineNode,
    state: &DriverState,
    data: &mut LocalData,
    options: &MdaConfig,
    scope: ExecScope,
    generator: Option<&dyn SampleGenerator>,
    algo_options: &BTreeMap<String, Value>,
) -> Result<(), EngineError> {
    let names: Vec<String> = state.eval_inputs.iter().map(|e| e.name.clone()).collect();
    let provided = input_value(node, data, SAMPLES_DF)
        .and_then(Value::as_dataframe)
        .filter(|df| !df.is_empty())
        .cloned();

    let samples = match (provided, generator) {
        (Some(df), _) => df,
        (None, Some(generator)) => {
            let algo_name = input_value(node, data, ALGO_NAME)
                .and_then(Value::as_str)
                .unwrap_or(generator.name())
                .to_string();
            let mut options = algo_options.clone();
            for spec in generator.get_options_desc_in(&algo_name) {
                if let Some(default) = spec.default {
                    options.entry(spec.name).or_insert(default);
                }
            }
            let design_space = input_value(node, data, DESIGN_SPACE)
                .and_then(Value::as_dataframe)
                .map(DesignSpace::from_dataframe)
                .transpose()?;
            generator.generate_samples(&algo_name, &options, &names, design_space.as_ref())?
        }
        (None, None) => return Err(missing(node, SAMPLES_DF)),
    };
    if let Some(name) = names.iter().find(|n| samples.column_index(n).is_none()) {
        return Err(ConfigError::InvalidValue {
            param: "samples_df",
            reason: format!("no column for eval input '{name}'"),
        }
        .into());
    }

    let n_samples = samples.n_rows();
    info!(driver = %node.full_name, n_samples, "Evaluating samples");
    exec.reporter.report(Progress::TaskStart {
        total_steps: n_samples as u64,
    });

    let rows: Vec<usize> = (0..n_samples).collect();
    let results = {
        let base: &LocalData = data;
        fork_join(&rows, options.n_processes, |&row| {
            let mut local = base.clone();
            for input in &state.eval_inputs {
                if let Some(value) = samples.get(row, &input.name) {
                    local.insert(input.var, value.clone());
                }
            }
            run_chain(exec, node, &node.children, &mut local, options, scope)?;
            exec.reporter.report(Progress::TaskIncrement);
            Ok(state
                .eval_outputs
                .iter()
                .map(|o| local.get(&o.var).cloned())
                .collect::<Vec<_>>())
        })?
    };
    exec.reporter.report(Progress::TaskFinish);

    let labels: Vec<String> = (1..=n_samples).map(|i| format!("scenario_{i}")).collect();
    for (j, output) in state.eval_outputs.iter().enumerate() {
        let Some(port) = node.output(&output.dict_name) else {
            continue;
        };
        let gathered: BTreeMap<String, Value> = results
            .iter()
            .zip(&labels)
            .filter_map(|(values, label)| values[j].clone().map(|v| (label.clone(), v)))
            .collect();
        data.insert(port.var, Value::Dict(gathered));
    }

    if let Some(port) = node.output(SAMPLES_INPUTS_DF) {
        let mut table =
            DataFrame::new(std::iter::once(SCENARIO_COLUMN.to_string()).chain(names.iter().cloned()));
        for (row, label) in labels.iter().enumerate() {
            let mut values = vec![Value::String(label.clone())];
            values.extend(
                names
                    .iter()
                    .map(|n| samples.get(row, n).cloned().unwrap_or(Value::Float(f64::NAN))),
            );
            table.push_row(values);
        }
        data.insert(port.var, Value::DataFrame(table));
    }
    Ok(())
}

/// The sub-process of a driver seen as an objective function of its eval inputs.
struct SubProcessProblem<'e, 'a> {
    exec: &'e Executor<'a>,
    node: &'e DisciplineNode,
    base: &'e LocalData,
    variables: Vec<(VarId, f64, f64, f64)>,
    objective: &'e EvalVariable,
    options: &'e MdaConfig,
    scope: ExecScope,
}

impl OptimizationProblem for SubProcessProblem<'_, '_> {
    fn dimension(&self) -> usize {
        self.variables.len()
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        self.variables.iter().map(|&(_, l, u, _)| (l, u)).collect()
    }

    fn initial_point(&self) -> Vec<f64> {
        self.variables.iter().map(|&(_, _, _, x0)| x0).collect()
    }

    fn evaluate(&mut self, x: &[f64]) -> Result<f64, EngineError> {
        let mut local = self.base.clone();
        for (&(var, ..), &xi) in self.variables.iter().zip(x) {
            local.insert(var, Value::Float(xi));
        }
        run_chain(
            self.exec,
            self.node,
            &self.node.children,
            &mut local,
            self.options,
            self.scope,
        )?;
        self.exec.reporter.report(Progress::TaskIncrement);
        let value = local
            .get(&self.objective.var)
            .ok_or_else(|| missing(self.node, &self.objective.name))?;
        value.as_f64().ok_or_else(|| {
            ConfigError::InvalidValue {
                param: "objective_name",
                reason: format!("objective '{}' is not a scalar", self.objective.path),
            }
            .into()
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn run_optimizer(
    exec: &Executor<'_>,
    node: &DisciplineNode,
    state: &DriverState,
    data: &mut LocalData,
    options: &MdaConfig,
    scope: ExecScope,
    optimizer: &dyn Optimizer,
    algo_options: &BTreeMap<String, Value>,
) -> Result<(), EngineError> {
    let design_space = input_value(node, data, DESIGN_SPACE)
        .and_then(Value::as_dataframe)
        .ok_or_else(|| missing(node, DESIGN_SPACE))
        .and_then(|df| DesignSpace::from_dataframe(df).map_err(EngineError::from))?;
    let objective_name = input_value(node, data, OBJECTIVE_NAME)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(node, OBJECTIVE_NAME))?;
    let objective = state
        .eval_outputs
        .iter()
        .find(|o| o.name == objective_name)
        .ok_or_else(|| ConfigError::UnknownEvalVariable {
            driver: node.full_name.clone(),
            name: objective_name.to_string(),
        })?;
    let variables = state
        .eval_inputs
        .iter()
        .map(|input| {
            design_space
                .variable(&input.name)
                .map(|v| (input.var, v.lower, v.upper, v.value))
                .ok_or_else(|| ConfigError::InvalidValue {
                    param: "design_space",
                    reason: format!("no bounds for eval input '{}'", input.name),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    exec.reporter.report(Progress::TaskStart { total_steps: 0 });
    let result = {
        let mut problem = SubProcessProblem {
            exec,
            node,
            base: data,
            variables: variables.clone(),
            objective,
            options,
            scope,
        };
        optimizer.run(&mut problem, algo_options)?
    };
    exec.reporter.report(Progress::TaskFinish);
    info!(
        driver = %node.full_name,
        optimizer = optimizer.name(),
        objective = result.objective,
        evaluations = result.n_evaluations,
        "Optimization finished"
    );

    for (&(var, ..), &xi) in variables.iter().zip(&result.x_opt) {
        data.insert(var, Value::Float(xi));
    }
    run_chain(exec, node, &node.children, data, options, scope)?;

    let within_bounds = variables
        .iter()
        .zip(&result.x_opt)
        .all(|(&(_, lower, upper, _), &xi)| xi >= lower && xi <= upper);
    let outputs = [
        (X_OPT, Value::Array(result.x_opt.clone())),
        (OBJECTIVE_OPT, Value::Float(result.objective)),
        (IS_FEASIBLE, Value::Bool(result.is_feasible && within_bounds)),
    ];
    for (name, value) in outputs {
        if let Some(port) = node.output(name) {
            data.insert(port.var, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_output_keeps_path_relative_to_driver() {
        assert_eq!(dict_output_name("study.doe", "study", "y"), "y_dict");
        assert_eq!(dict_output_name("study.doe", "study", "Disc1.y"), "Disc1.y_dict");
        assert_eq!(dict_output_name("study.doe", "study", "study.doe.Disc1.y"), "Disc1.y_dict");
        assert_eq!(dict_output_name("study.doe", "study", "study.Disc2.y"), "Disc2.y_dict");
        assert_ne!(
            dict_output_name("study.doe", "study", "Disc1.y"),
            dict_output_name("study.doe", "study", "Disc2.y")
        );
    }

    #[test]
    fn eval_names_resolve_under_driver_before_study() {
        assert_eq!(
            candidate_paths("study.doe", "study", "Disc.y"),
            [
                "study.doe.Disc.y".to_string(),
                "study.Disc.y".to_string(),
                "Disc.y".to_string()
            ]
        );
    }
}
