//! MDA chain of a coupling: dependency analysis of its children, pre-run of uninitialized
//! cycles, and the sub-MDA solving each cycle.

pub(crate) mod graph;

use self::graph::{CouplingGraph, DisciplineIo, subtree_io};
use super::config::{MdaClass, MdaConfig};
use super::discipline::{DisciplineNode, NodeBehavior};
use super::error::{EngineError, MdaError};
use super::execution::{ExecScope, Executor};
use super::mda::jacobian::{JacobianAssembler, block_min_max, finite_difference_step};
use super::mda::{
    self, CoupledSystem, CouplingVector, GaussSeidel, PureNewtonRaphson, RESIDUALS_HISTORY,
};
use super::model::{PartialDerivatives, RunContext};
use super::parallel::fork_join;
use crate::core::data_manager::LocalData;
use crate::core::ids::{DisciplineId, VarId};
use crate::core::value::Value;
use nalgebra::DMatrix;
use std::collections::HashMap;
use tracing::{debug, info, instrument};

/// Runs a coupling with the MDA options read from its numerical inputs.
pub(crate) fn run_coupling(
    exec: &Executor<'_>,
    node: &DisciplineNode,
    data: &mut LocalData,
) -> Result<(), EngineError> {
    let options = mda::options_from_inputs(node, data, &exec.config.mda)?;
    let scope = ExecScope {
        cache: options.cache_type,
        n_processes: options.n_processes,
    };
    let history = run_chain(exec, node, &node.children, data, &options, scope)?;
    if let Some(port) = node.output(RESIDUALS_HISTORY) {
        data.insert(port.var, Value::Array(history));
    }
    Ok(())
}

/// Executes `members` in dependency order, solving every cycle among them.
///
/// # Return
///
/// The normalized residuals of every sub-MDA, concatenated in execution order.
#[instrument(skip_all, name = "mda_chain", fields(owner = %owner.full_name))]
pub(crate) fn run_chain(
    exec: &Executor<'_>,
    owner: &DisciplineNode,
    members: &[DisciplineId],
    data: &mut LocalData,
    options: &MdaConfig,
    scope: ExecScope,
) -> Result<Vec<f64>, EngineError> {
    let io = members
        .iter()
        .map(|&m| subtree_io(exec.factory, m))
        .collect::<Result<Vec<_>, _>>()?;
    let graph = CouplingGraph::new(io);
    let mut history = Vec::new();

    for component in graph.execution_sequence() {
        if component.len() == 1 && !graph.has_self_loop(component[0]) {
            exec.execute_node(members[component[0]], data, scope)?;
            continue;
        }

        let ids: Vec<DisciplineId> = component.iter().map(|&i| members[i]).collect();
        let strong = graph.strong_couplings(&component);
        if options.warm_start {
            if let Some(previous) = owner.runtime().warm_start.as_ref() {
                for var in &strong {
                    if let Some(value) = previous.get(var) {
                        data.insert(*var, value.clone());
                    }
                }
            }
        }

        let component_io: Vec<&DisciplineIo> = component.iter().map(|&i| graph.io(i)).collect();
        pre_run(exec, owner, &ids, &component_io, &strong, data, scope)?;

        let paths: Vec<(VarId, String)> = strong
            .iter()
            .map(|&var| (var, path_of(&component_io, var)))
            .collect();
        let couplings = CouplingVector::new(&paths, data)?;
        let batches = graph
            .parallel_batches(&component)
            .into_iter()
            .map(|batch| batch.into_iter().map(|i| members[i]).collect())
            .collect();
        let system = CycleSystem {
            exec,
            owner,
            members: ids,
            batches,
            couplings: &couplings,
            scope,
        };

        let outcome = match options.sub_mda_class {
            MdaClass::GaussSeidel => GaussSeidel::new(
                options.over_relaxation_factor,
                options.tolerance,
                options.max_mda_iter,
            )?
            .solve(&system, &couplings, data, exec.reporter)?,
            MdaClass::PureNewtonRaphson => PureNewtonRaphson::new(
                options.relax_factor,
                options.tolerance,
                options.max_mda_iter,
            )?
            .solve(&system, &couplings, data, exec.reporter)?,
        };
        info!(
            owner = %owner.full_name,
            class = options.sub_mda_class.as_str(),
            iterations = outcome.iterations,
            converged = outcome.converged,
            "Sub-MDA finished"
        );
        history.extend(outcome.residuals);

        if options.warm_start {
            let mut runtime = owner.runtime();
            let stored = runtime.warm_start.get_or_insert_with(LocalData::new);
            for var in &strong {
                if let Some(value) = data.get(var) {
                    stored.insert(*var, value.clone());
                }
            }
        }
    }

    owner.runtime().residuals_history = history.clone();
    Ok(history)
}

fn path_of(io: &[&DisciplineIo], var: VarId) -> String {
    io.iter()
        .find_map(|i| i.paths.get(&var).cloned())
        .unwrap_or_else(|| format!("{var:?}"))
}

/// Runs ready members one at a time until every strong coupling has a value.
fn pre_run(
    exec: &Executor<'_>,
    owner: &DisciplineNode,
    members: &[DisciplineId],
    io: &[&DisciplineIo],
    strong: &[VarId],
    data: &mut LocalData,
    scope: ExecScope,
) -> Result<(), EngineError> {
    let mut pending: Vec<usize> = (0..members.len()).collect();
    while strong.iter().any(|var| !data.contains_key(var)) {
        let ready = pending
            .iter()
            .position(|&i| io[i].inputs.iter().all(|var| data.contains_key(var)));
        match ready {
            Some(position) => {
                let index = pending.remove(position);
                let member = exec.factory.get(members[index])?;
                info!(owner = %owner.full_name, discipline = %member.full_name, "Pre-run to initialize couplings");
                exec.execute_node(members[index], data, scope)?;
            }
            None => {
                let missing = pending
                    .iter()
                    .map(|&i| {
                        let name = exec
                            .factory
                            .node(members[i])
                            .map(|n| n.full_name.clone())
                            .unwrap_or_default();
                        let inputs: Vec<String> = io[i]
                            .inputs
                            .iter()
                            .filter(|var| !data.contains_key(var))
                            .map(|&var| io[i].path(var))
                            .collect();
                        format!("{name}: {}", inputs.join(", "))
                    })
                    .collect();
                return Err(MdaError::PreRunImpossible {
                    coupling: owner.full_name.clone(),
                    missing,
                }
                .into());
            }
        }
    }
    Ok(())
}

/// One cycle of a chain, seen as a coupled system by the solvers.
struct CycleSystem<'e, 'a> {
    exec: &'e Executor<'a>,
    owner: &'e DisciplineNode,
    members: Vec<DisciplineId>,
    batches: Vec<Vec<DisciplineId>>,
    couplings: &'e CouplingVector,
    scope: ExecScope,
}

impl CycleSystem<'_, '_> {
    /// Evaluates `members` at the same point and merges their outputs into `data`.
    fn evaluate_batch(
        &self,
        members: &[DisciplineId],
        data: &mut LocalData,
    ) -> Result<(), EngineError> {
        let outputs = {
            let snapshot: &LocalData = data;
            fork_join(members, self.scope.n_processes, |&m| {
                self.exec.evaluate_member(m, snapshot, self.scope)
            })?
        };
        for produced in outputs {
            data.extend(produced);
        }
        Ok(())
    }

    fn log_couplings(&self, data: &LocalData) {
        if !self.owner.debug.min_max_couplings {
            return;
        }
        for (path, min, max) in self.couplings.min_max(data) {
            info!(owner = %self.owner.full_name, coupling = path, min, max, "Coupling range");
        }
    }

    fn linearize_member(
        &self,
        id: DisciplineId,
        data: &mut LocalData,
        couplings: &CouplingVector,
        assembler: &mut JacobianAssembler<'_>,
    ) -> Result<(), EngineError> {
        let node = self.exec.factory.get(id)?;
        let io = subtree_io(self.exec.factory, id)?;
        let outputs: Vec<VarId> = io
            .outputs
            .iter()
            .copied()
            .filter(|v| couplings.contains(*v))
            .collect();
        let inputs: Vec<VarId> = io
            .inputs
            .iter()
            .copied()
            .filter(|v| couplings.contains(*v))
            .collect();
        if outputs.is_empty() || inputs.is_empty() {
            return Ok(());
        }

        if let NodeBehavior::Leaf(model) = &node.behavior {
            let ctx = RunContext::new(node.full_name.clone(), self.exec.leaf_inputs(node, data)?);
            let mut partials = PartialDerivatives::new();
            let analytic = model
                .compute_jacobian(&ctx, &mut partials)
                .map_err(|source| EngineError::Model {
                    discipline: node.full_name.clone(),
                    source,
                })?;
            if analytic {
                for out in node.outputs.iter().filter(|p| outputs.contains(&p.var)) {
                    for inp in node.inputs.iter().filter(|p| inputs.contains(&p.var)) {
                        if let Some(block) = partials.get(&out.name, &inp.name) {
                            self.check_block(node, &out.path, &inp.path, block)?;
                            assembler.add_block(&node.full_name, out.var, inp.var, block)?;
                        }
                    }
                }
                return Ok(());
            }
        }

        let base: HashMap<VarId, Vec<f64>> = self
            .exec
            .evaluate_member(id, data, self.scope)?
            .into_iter()
            .filter(|(var, _)| outputs.contains(var))
            .filter_map(|(var, value)| value.to_vector().map(|v| (var, v)))
            .collect();

        for &input in &inputs {
            let Some(original) = data.get(&input).cloned() else {
                continue;
            };
            let Some(x) = original.to_vector() else {
                continue;
            };
            let mut blocks: HashMap<VarId, DMatrix<f64>> = base
                .iter()
                .map(|(&var, v)| (var, DMatrix::zeros(v.len(), x.len())))
                .collect();

            for k in 0..x.len() {
                let step = finite_difference_step(x[k]);
                let mut perturbed = x.clone();
                perturbed[k] += step;
                let Some(value) = original.with_vector(&perturbed) else {
                    continue;
                };
                data.insert(input, value);
                let evaluated = self.exec.evaluate_member(id, data, self.scope);
                data.insert(input, original.clone());
                for (var, value) in evaluated? {
                    let (Some(block), Some(reference), Some(shifted)) =
                        (blocks.get_mut(&var), base.get(&var), value.to_vector())
                    else {
                        continue;
                    };
                    for (row, (s, r)) in shifted.iter().zip(reference).enumerate() {
                        block[(row, k)] = (s - r) / step;
                    }
                }
            }

            for (var, block) in &blocks {
                let out_path = couplings.path(*var).unwrap_or_default().to_string();
                let in_path = couplings.path(input).unwrap_or_default().to_string();
                self.check_block(node, &out_path, &in_path, block)?;
                assembler.add_block(&node.full_name, *var, input, block)?;
            }
        }
        Ok(())
    }

    fn check_block(
        &self,
        node: &DisciplineNode,
        output: &str,
        input: &str,
        block: &DMatrix<f64>,
    ) -> Result<(), EngineError> {
        if node.debug.nan && block.iter().any(|v| v.is_nan()) {
            return Err(EngineError::DebugCheck {
                mode: "nan",
                discipline: node.full_name.clone(),
                reason: format!("d{output}/d{input} contains NaN"),
            });
        }
        if node.debug.min_max_grad {
            if let Some((min, max)) = block_min_max(block) {
                info!(discipline = %node.full_name, output, input, min, max, "Gradient range");
            }
        }
        Ok(())
    }
}

impl CoupledSystem for CycleSystem<'_, '_> {
    fn name(&self) -> &str {
        &self.owner.full_name
    }

    fn sweep(&self, data: &mut LocalData, relaxation: f64) -> Result<(), EngineError> {
        for batch in &self.batches {
            let before = self.couplings.snapshot(data);
            if batch.len() == 1 {
                self.exec.execute_node(batch[0], data, self.scope)?;
            } else {
                self.evaluate_batch(batch, data)?;
            }
            self.couplings.relax(data, &before, relaxation);
        }
        self.log_couplings(data);
        Ok(())
    }

    fn evaluate_all(&self, data: &mut LocalData) -> Result<(), EngineError> {
        self.evaluate_batch(&self.members, data)?;
        self.log_couplings(data);
        Ok(())
    }

    fn linearize(
        &self,
        data: &mut LocalData,
        couplings: &CouplingVector,
    ) -> Result<DMatrix<f64>, EngineError> {
        let before = self
            .owner
            .debug
            .linearize_data_change
            .then(|| couplings.snapshot(data));

        let mut assembler = JacobianAssembler::new(couplings);
        for &member in &self.members {
            self.linearize_member(member, data, couplings, &mut assembler)?;
        }

        if let Some(before) = before {
            if before != couplings.snapshot(data) {
                return Err(EngineError::DebugCheck {
                    mode: "linearize_data_change",
                    discipline: self.owner.full_name.clone(),
                    reason: "coupling values changed during linearization".to_string(),
                });
            }
        }
        debug!(owner = %self.owner.full_name, size = couplings.size(), "Cycle linearized");
        Ok(assembler.finish())
    }
}
