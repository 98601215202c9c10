//! Multidisciplinary analysis solvers.
//!
//! A coupled cycle is exposed to the solvers through [`CoupledSystem`]; the solvers only
//! see the flattened vector of strong couplings and never touch the discipline tree.

pub mod gauss_seidel;
pub mod jacobian;
pub mod newton;

pub use gauss_seidel::GaussSeidel;
pub use newton::PureNewtonRaphson;

use super::config::{CacheType, MdaClass, MdaConfig};
use super::discipline::DisciplineNode;
use super::error::{EngineError, MdaError};
use crate::core::data_manager::LocalData;
use crate::core::ids::VarId;
use crate::core::schema::{Provenance, SchemaDelta};
use crate::core::value::{Value, VarType};
use crate::core::variable::VariableSpec;
use nalgebra::{DMatrix, DVector};

pub const SUB_MDA_CLASS: &str = "sub_mda_class";
pub const MAX_MDA_ITER: &str = "max_mda_iter";
pub const TOLERANCE: &str = "tolerance";
pub const OVER_RELAXATION_FACTOR: &str = "over_relaxation_factor";
pub const RELAX_FACTOR: &str = "relax_factor";
pub const WARM_START: &str = "warm_start";
pub const N_PROCESSES: &str = "n_processes";
pub const CACHE_TYPE: &str = "cache_type";
pub const DEBUG_MODE: &str = "debug_mode";
pub const RESIDUALS_HISTORY: &str = "residuals_history";

/// Numerical inputs and outputs declared by every coupling, defaulted from `defaults`.
pub(crate) fn numerical_inputs_delta(defaults: &MdaConfig) -> SchemaDelta {
    let numerical = |name: &str, var_type: VarType, value: Value| {
        VariableSpec::new(name, var_type)
            .internal()
            .numerical()
            .default_value(value)
    };
    SchemaDelta::new(Provenance::Numerical)
        .input(
            numerical(
                SUB_MDA_CLASS,
                VarType::String,
                defaults.sub_mda_class.as_str().into(),
            )
            .possible_values(vec![
                MdaClass::GaussSeidel.as_str().into(),
                MdaClass::PureNewtonRaphson.as_str().into(),
            ]),
        )
        .input(numerical(
            MAX_MDA_ITER,
            VarType::Int,
            Value::Int(defaults.max_mda_iter as i64),
        ))
        .input(numerical(TOLERANCE, VarType::Float, defaults.tolerance.into()))
        .input(numerical(
            OVER_RELAXATION_FACTOR,
            VarType::Float,
            defaults.over_relaxation_factor.into(),
        ))
        .input(numerical(
            RELAX_FACTOR,
            VarType::Float,
            defaults.relax_factor.into(),
        ))
        .input(numerical(WARM_START, VarType::Bool, defaults.warm_start.into()))
        .input(numerical(
            N_PROCESSES,
            VarType::Int,
            Value::Int(defaults.n_processes as i64),
        ))
        .input(
            numerical(CACHE_TYPE, VarType::String, defaults.cache_type.as_str().into())
                .possible_values(vec![
                    CacheType::None.as_str().into(),
                    CacheType::SimpleCache.as_str().into(),
                ]),
        )
        .input(numerical(DEBUG_MODE, VarType::String, "".into()))
        .output(
            VariableSpec::new(RESIDUALS_HISTORY, VarType::Array)
                .internal()
                .numerical(),
        )
}

/// Reads the MDA options of `node` from `data`, falling back to `defaults` for every
/// option the node does not declare.
pub(crate) fn options_from_inputs(
    node: &DisciplineNode,
    data: &LocalData,
    defaults: &MdaConfig,
) -> Result<MdaConfig, EngineError> {
    let value = |name: &str| node.input(name).and_then(|port| data.get(&port.var));
    let invalid = |param: &'static str, found: &Value| {
        EngineError::from(super::config::ConfigError::InvalidValue {
            param,
            reason: format!("unexpected {} value on '{}'", found.var_type(), node.full_name()),
        })
    };
    let count = |param: &'static str, default: usize| -> Result<usize, EngineError> {
        match value(param) {
            None => Ok(default),
            Some(v) => v
                .as_i64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| invalid(param, v)),
        }
    };
    let real = |param: &'static str, default: f64| -> Result<f64, EngineError> {
        match value(param) {
            None => Ok(default),
            Some(v) => v.as_f64().ok_or_else(|| invalid(param, v)),
        }
    };

    let sub_mda_class = match value(SUB_MDA_CLASS) {
        None => defaults.sub_mda_class,
        Some(v) => MdaClass::from_name(v.as_str().ok_or_else(|| invalid(SUB_MDA_CLASS, v))?)?,
    };
    let cache_type = match value(CACHE_TYPE) {
        None => defaults.cache_type,
        Some(v) => CacheType::from_name(v.as_str().ok_or_else(|| invalid(CACHE_TYPE, v))?)?,
    };
    let warm_start = match value(WARM_START) {
        None => defaults.warm_start,
        Some(v) => v.as_bool().ok_or_else(|| invalid(WARM_START, v))?,
    };

    Ok(MdaConfig {
        sub_mda_class,
        max_mda_iter: count(MAX_MDA_ITER, defaults.max_mda_iter)?,
        tolerance: real(TOLERANCE, defaults.tolerance)?,
        over_relaxation_factor: real(OVER_RELAXATION_FACTOR, defaults.over_relaxation_factor)?,
        relax_factor: real(RELAX_FACTOR, defaults.relax_factor)?,
        warm_start,
        n_processes: count(N_PROCESSES, defaults.n_processes)?.max(1),
        cache_type,
    })
}

/// A cycle of disciplines as seen by a fixed-point solver.
pub(crate) trait CoupledSystem {
    fn name(&self) -> &str;

    /// One Gauss-Seidel pass: members run in order, each coupling they write is blended
    /// with its previous value as `relaxation * new + (1 - relaxation) * old`.
    fn sweep(&self, data: &mut LocalData, relaxation: f64) -> Result<(), EngineError>;

    /// Runs every member at the current point and stores their outputs.
    fn evaluate_all(&self, data: &mut LocalData) -> Result<(), EngineError>;

    /// `dF/dX` of the coupling map at the current point, without storing any output.
    fn linearize(
        &self,
        data: &mut LocalData,
        couplings: &CouplingVector,
    ) -> Result<DMatrix<f64>, EngineError>;
}

#[derive(Debug, Clone)]
struct CouplingEntry {
    var: VarId,
    path: String,
    template: Value,
    offset: usize,
    len: usize,
}

/// Strong couplings of a cycle flattened into one vector.
#[derive(Debug, Clone)]
pub(crate) struct CouplingVector {
    entries: Vec<CouplingEntry>,
    size: usize,
}

impl CouplingVector {
    /// Builds the layout from the current values, which must all be present and numeric.
    pub fn new(vars: &[(VarId, String)], data: &LocalData) -> Result<Self, MdaError> {
        let mut entries = Vec::with_capacity(vars.len());
        let mut offset = 0;
        for (var, path) in vars {
            let value = data
                .get(var)
                .ok_or_else(|| MdaError::MissingCoupling(path.clone()))?;
            let len = value
                .numeric_len()
                .ok_or_else(|| MdaError::NonNumericCoupling(path.clone()))?;
            entries.push(CouplingEntry {
                var: *var,
                path: path.clone(),
                template: value.clone(),
                offset,
                len,
            });
            offset += len;
        }
        Ok(Self {
            entries,
            size: offset,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn contains(&self, var: VarId) -> bool {
        self.entries.iter().any(|e| e.var == var)
    }

    /// `(offset, len)` of `var` in the flattened vector.
    pub fn span(&self, var: VarId) -> Option<(usize, usize)> {
        self.entries
            .iter()
            .find(|e| e.var == var)
            .map(|e| (e.offset, e.len))
    }

    pub fn path(&self, var: VarId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.var == var)
            .map(|e| e.path.as_str())
    }

    pub fn gather(&self, data: &LocalData) -> Result<DVector<f64>, MdaError> {
        let mut x = DVector::zeros(self.size);
        for entry in &self.entries {
            let components = data
                .get(&entry.var)
                .ok_or_else(|| MdaError::MissingCoupling(entry.path.clone()))?
                .to_vector()
                .filter(|v| v.len() == entry.len)
                .ok_or_else(|| MdaError::NonNumericCoupling(entry.path.clone()))?;
            x.rows_mut(entry.offset, entry.len)
                .copy_from_slice(&components);
        }
        Ok(x)
    }

    pub fn scatter(&self, data: &mut LocalData, x: &DVector<f64>) -> Result<(), MdaError> {
        for entry in &self.entries {
            let slice: Vec<f64> = x.rows(entry.offset, entry.len).iter().copied().collect();
            let value = entry
                .template
                .with_vector(&slice)
                .ok_or_else(|| MdaError::NonNumericCoupling(entry.path.clone()))?;
            data.insert(entry.var, value);
        }
        Ok(())
    }

    pub fn snapshot(&self, data: &LocalData) -> Vec<Option<Value>> {
        self.entries.iter().map(|e| data.get(&e.var).cloned()).collect()
    }

    /// Blends the current coupling values with `before` using `factor`.
    pub fn relax(&self, data: &mut LocalData, before: &[Option<Value>], factor: f64) {
        if factor == 1.0 {
            return;
        }
        for (entry, old) in self.entries.iter().zip(before) {
            let (Some(old), Some(new)) = (old.as_ref().and_then(Value::to_vector), data.get(&entry.var)) else {
                continue;
            };
            let Some(new_components) = new.to_vector() else {
                continue;
            };
            if old.len() != new_components.len() {
                continue;
            }
            let blended: Vec<f64> = new_components
                .iter()
                .zip(&old)
                .map(|(n, o)| factor * n + (1.0 - factor) * o)
                .collect();
            if let Some(value) = new.with_vector(&blended) {
                data.insert(entry.var, value);
            }
        }
    }

    /// `(path, min, max)` of every coupling present in `data`.
    pub fn min_max(&self, data: &LocalData) -> Vec<(&str, f64, f64)> {
        self.entries
            .iter()
            .filter_map(|e| {
                let v = data.get(&e.var)?.to_vector()?;
                let min = v.iter().copied().fold(f64::INFINITY, f64::min);
                let max = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Some((e.path.as_str(), min, max))
            })
            .collect()
    }
}

/// `delta / reference`, where a zero reference means the cycle was already at rest.
pub(crate) fn normalized_residual(delta: f64, reference: f64) -> f64 {
    if reference == 0.0 { 0.0 } else { delta / reference }
}

/// What a sub-MDA run ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct MdaOutcome {
    pub converged: bool,
    pub iterations: usize,
    pub residuals: Vec<f64>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use slotmap::SlotMap;

    /// `y1 = 0.5 * y2 + 1`, `y2 = 0.25 * y1 + 2`, fixed point at (16/7, 18/7).
    pub struct LinearCycle {
        pub y1: VarId,
        pub y2: VarId,
    }

    impl LinearCycle {
        pub fn new() -> (Self, LocalData) {
            let mut keys: SlotMap<VarId, ()> = SlotMap::with_key();
            let (y1, y2) = (keys.insert(()), keys.insert(()));
            let data: LocalData = [(y1, Value::Float(0.0)), (y2, Value::Float(0.0))].into();
            (Self { y1, y2 }, data)
        }

        pub fn couplings(&self, data: &LocalData) -> CouplingVector {
            CouplingVector::new(&[(self.y1, "y1".into()), (self.y2, "y2".into())], data).unwrap()
        }

        fn f1(data: &LocalData, y2: VarId) -> f64 {
            0.5 * data[&y2].as_f64().unwrap() + 1.0
        }

        fn f2(data: &LocalData, y1: VarId) -> f64 {
            0.25 * data[&y1].as_f64().unwrap() + 2.0
        }
    }

    impl CoupledSystem for LinearCycle {
        fn name(&self) -> &str {
            "linear"
        }

        fn sweep(&self, data: &mut LocalData, relaxation: f64) -> Result<(), EngineError> {
            let old = data[&self.y1].as_f64().unwrap();
            let new = Self::f1(data, self.y2);
            data.insert(self.y1, Value::Float(relaxation * new + (1.0 - relaxation) * old));
            let old = data[&self.y2].as_f64().unwrap();
            let new = Self::f2(data, self.y1);
            data.insert(self.y2, Value::Float(relaxation * new + (1.0 - relaxation) * old));
            Ok(())
        }

        fn evaluate_all(&self, data: &mut LocalData) -> Result<(), EngineError> {
            let (y1, y2) = (Self::f1(data, self.y2), Self::f2(data, self.y1));
            data.insert(self.y1, Value::Float(y1));
            data.insert(self.y2, Value::Float(y2));
            Ok(())
        }

        fn linearize(
            &self,
            _data: &mut LocalData,
            _couplings: &CouplingVector,
        ) -> Result<DMatrix<f64>, EngineError> {
            Ok(DMatrix::from_row_slice(2, 2, &[0.0, 0.5, 0.25, 0.0]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn coupling_vector_flattens_scalars_and_arrays() {
        let mut keys: SlotMap<VarId, ()> = SlotMap::with_key();
        let (a, b) = (keys.insert(()), keys.insert(()));
        let mut data: LocalData =
            [(a, Value::Int(2)), (b, Value::Array(vec![1.0, 3.0]))].into();
        let couplings =
            CouplingVector::new(&[(a, "a".into()), (b, "b".into())], &data).unwrap();

        assert_eq!(couplings.size(), 3);
        assert_eq!(couplings.span(b), Some((1, 2)));
        assert_eq!(couplings.gather(&data).unwrap().as_slice(), &[2.0, 1.0, 3.0]);

        couplings
            .scatter(&mut data, &DVector::from_vec(vec![5.0, 6.0, 7.0]))
            .unwrap();
        assert_eq!(data[&a], Value::Float(5.0));
        assert_eq!(data[&b], Value::Array(vec![6.0, 7.0]));
    }

    #[test]
    fn coupling_vector_rejects_non_numeric_values() {
        let mut keys: SlotMap<VarId, ()> = SlotMap::with_key();
        let a = keys.insert(());
        let data: LocalData = [(a, Value::String("x".into()))].into();
        assert_eq!(
            CouplingVector::new(&[(a, "study.a".into())], &data).unwrap_err(),
            MdaError::NonNumericCoupling("study.a".into())
        );
    }

    #[test]
    fn relax_blends_new_and_old_values() {
        let mut keys: SlotMap<VarId, ()> = SlotMap::with_key();
        let a = keys.insert(());
        let mut data: LocalData = [(a, Value::Float(0.0))].into();
        let couplings = CouplingVector::new(&[(a, "a".into())], &data).unwrap();
        let before = couplings.snapshot(&data);
        data.insert(a, Value::Float(10.0));

        couplings.relax(&mut data, &before, 0.3);
        assert!((data[&a].as_f64().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn zero_reference_counts_as_converged() {
        assert_eq!(normalized_residual(0.0, 0.0), 0.0);
        assert_eq!(normalized_residual(1.0, 4.0), 0.25);
    }

    #[test]
    fn numerical_inputs_carry_configured_defaults() {
        let defaults = MdaConfig {
            max_mda_iter: 12,
            ..MdaConfig::default()
        };
        let delta = numerical_inputs_delta(&defaults);
        let max_iter = delta
            .inputs
            .iter()
            .find(|s| s.name == MAX_MDA_ITER)
            .unwrap();
        assert_eq!(max_iter.default, Some(Value::Int(12)));
        assert!(max_iter.numerical);
        assert!(delta.outputs.iter().any(|s| s.name == RESIDUALS_HISTORY));
    }
}
