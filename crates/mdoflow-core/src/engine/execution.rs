use super::config::{CacheType, EngineConfig};
use super::coupling::{self, graph};
use super::discipline::{CachedRun, DisciplineNode, NodeBehavior, Status};
use super::driver;
use super::error::{EngineError, ModelError};
use super::factory::Factory;
use super::model::{Model, RunContext};
use super::progress::ProgressReporter;
use crate::core::data_manager::LocalData;
use crate::core::ids::{DisciplineId, VarId};
use crate::core::value::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Settings inherited from the closest enclosing coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExecScope {
    pub cache: CacheType,
    pub n_processes: usize,
}

impl ExecScope {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            cache: config.mda.cache_type,
            n_processes: config.mda.n_processes,
        }
    }
}

/// Runs the discipline tree against a [`LocalData`] snapshot.
///
/// The tree is only borrowed: statuses are atomic and per-node runtime state sits behind a
/// mutex, so members of a batch can run on worker threads.
pub(crate) struct Executor<'a> {
    pub factory: &'a Factory,
    pub config: &'a EngineConfig,
    pub reporter: &'a ProgressReporter<'a>,
}

impl<'a> Executor<'a> {
    pub fn new(
        factory: &'a Factory,
        config: &'a EngineConfig,
        reporter: &'a ProgressReporter<'a>,
    ) -> Self {
        Self {
            factory,
            config,
            reporter,
        }
    }

    /// Runs `id` and its subtree, writing every output into `data`.
    pub fn execute_node(
        &self,
        id: DisciplineId,
        data: &mut LocalData,
        scope: ExecScope,
    ) -> Result<(), EngineError> {
        let node = self.factory.get(id)?;
        self.with_status(node, || match &node.behavior {
            NodeBehavior::Leaf(model) => {
                let outputs = self.compute_leaf(node, model, data, scope)?;
                data.extend(outputs);
                Ok(())
            }
            NodeBehavior::Coupling { .. } => coupling::run_coupling(self, node, data),
            NodeBehavior::Scatter(_) => {
                coupling::run_chain(self, node, &node.children, data, &self.config.mda, scope)
                    .map(|_| ())
            }
            NodeBehavior::EvalDriver(state) => driver::run_driver(self, node, state, data, scope),
        })
    }

    /// Runs `id` at `data` without modifying it and returns what it produced.
    pub fn evaluate_member(
        &self,
        id: DisciplineId,
        data: &LocalData,
        scope: ExecScope,
    ) -> Result<Vec<(VarId, Value)>, EngineError> {
        let node = self.factory.get(id)?;
        if let NodeBehavior::Leaf(model) = &node.behavior {
            return self.with_status(node, || self.compute_leaf(node, model, data, scope));
        }

        let mut local = data.clone();
        self.execute_node(id, &mut local, scope)?;
        let io = graph::subtree_io(self.factory, id)?;
        Ok(io
            .outputs
            .iter()
            .filter_map(|var| local.get(var).map(|v| (*var, v.clone())))
            .collect())
    }

    fn with_status<T>(
        &self,
        node: &DisciplineNode,
        f: impl FnOnce() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        node.set_status(Status::Running);
        let result = f();
        match &result {
            Ok(_) => node.set_status(Status::Done),
            Err(e) => {
                node.set_status(Status::Failed);
                if node.children.is_empty() {
                    error!(discipline = %node.full_name, error = %e, "Discipline failed");
                }
            }
        }
        result
    }

    /// Gathers the inputs of a leaf by short name.
    ///
    /// A missing input is an error unless it is declared optional.
    pub(crate) fn leaf_inputs(
        &self,
        node: &DisciplineNode,
        data: &LocalData,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let optional: HashSet<&str> = node
            .schema
            .inputs()
            .filter(|e| e.spec.optional)
            .map(|e| e.spec.name.as_str())
            .collect();
        let mut inputs = BTreeMap::new();
        for port in &node.inputs {
            match data.get(&port.var) {
                Some(value) => {
                    inputs.insert(port.name.clone(), value.clone());
                }
                None if optional.contains(port.name.as_str()) => {}
                None => {
                    return Err(EngineError::MissingInput {
                        discipline: node.full_name.clone(),
                        variable: port.path.clone(),
                    });
                }
            }
        }
        Ok(inputs)
    }

    fn compute_leaf(
        &self,
        node: &DisciplineNode,
        model: &Arc<dyn Model>,
        data: &LocalData,
        scope: ExecScope,
    ) -> Result<Vec<(VarId, Value)>, EngineError> {
        let cache_key: Option<Vec<Option<Value>>> = (scope.cache == CacheType::SimpleCache)
            .then(|| node.inputs.iter().map(|p| data.get(&p.var).cloned()).collect());
        if let Some(key) = &cache_key {
            if let Some(cached) = node.runtime().cache.as_ref().filter(|c| &c.inputs == key) {
                debug!(discipline = %node.full_name, "Inputs unchanged, reusing cached outputs");
                return Ok(cached.outputs.clone());
            }
        }

        let inputs = self.leaf_inputs(node, data)?;
        if node.debug.nan {
            if let Some((name, _)) = inputs.iter().find(|(_, v)| v.has_nan()) {
                return Err(EngineError::DebugCheck {
                    mode: "nan",
                    discipline: node.full_name.clone(),
                    reason: format!("input '{name}' contains NaN"),
                });
            }
        }

        let mut ctx = RunContext::new(node.full_name.clone(), inputs);
        model.run(&mut ctx).map_err(|source| EngineError::Model {
            discipline: node.full_name.clone(),
            source,
        })?;
        node.runtime().n_calls += 1;
        let mut produced = ctx.into_outputs();

        let mut outputs = Vec::with_capacity(node.outputs.len());
        for port in &node.outputs {
            let value = produced.remove(&port.name).ok_or_else(|| EngineError::Model {
                discipline: node.full_name.clone(),
                source: ModelError::MissingOutput(port.name.clone()),
            })?;
            if node.debug.nan && value.has_nan() {
                return Err(EngineError::DebugCheck {
                    mode: "nan",
                    discipline: node.full_name.clone(),
                    reason: format!("output '{}' contains NaN", port.name),
                });
            }
            outputs.push((port.var, value));
        }

        for name in produced.keys() {
            if node.input(name).is_some() {
                if node.debug.input_change {
                    return Err(EngineError::DebugCheck {
                        mode: "input_change",
                        discipline: node.full_name.clone(),
                        reason: format!("input '{name}' was overwritten by the run"),
                    });
                }
                warn!(discipline = %node.full_name, input = %name, "Run tried to overwrite an input, ignored");
            } else {
                warn!(discipline = %node.full_name, output = %name, "Undeclared output ignored");
            }
        }

        if let Some(inputs) = cache_key {
            node.runtime().cache = Some(CachedRun {
                inputs,
                outputs: outputs.clone(),
            });
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_manager::DataManager;
    use crate::core::namespace::NamespaceManager;
    use crate::engine::builder::Builder;
    use crate::engine::configure;
    use crate::engine::factory::EngineContext;
    use crate::engine::test_models::{Disc1, Overwriter};

    struct Tree {
        dm: DataManager,
        factory: Factory,
        config: EngineConfig,
    }

    fn configured(builder: Builder, config: EngineConfig) -> Tree {
        let mut dm = DataManager::new();
        let mut ns = NamespaceManager::new();
        ns.add_ns("ns_ac", "study");
        let mut factory = Factory::new();
        factory.set_root_builder(builder);
        {
            let mut ctx = EngineContext {
                dm: &mut dm,
                ns: &mut ns,
                study_name: "study",
                config: &config,
            };
            configure::configure_io(&mut factory, &mut ctx).unwrap();
        }
        Tree {
            dm,
            factory,
            config,
        }
    }

    fn set(tree: &mut Tree, values: &[(&str, f64)]) {
        for (path, v) in values {
            tree.dm.set_value(path, Value::Float(*v)).unwrap();
        }
    }

    #[test]
    fn leaf_outputs_are_written_and_status_is_done() {
        let mut tree = configured(
            Builder::discipline("Disc1", Disc1::default),
            EngineConfig::default(),
        );
        set(
            &mut tree,
            &[("study.x", 5.0), ("study.Disc1.a", 2.0), ("study.Disc1.b", 3.0)],
        );
        let reporter = ProgressReporter::new();
        let exec = Executor::new(&tree.factory, &tree.config, &reporter);
        let id = tree.factory.find("study.Disc1").unwrap();
        let mut data = tree.dm.local_data();

        exec.execute_node(id, &mut data, ExecScope::from_config(&tree.config))
            .unwrap();

        let y = tree.dm.var_id("study.y").unwrap();
        let indicator = tree.dm.var_id("study.Disc1.indicator").unwrap();
        assert_eq!(data[&y], Value::Float(13.0));
        assert_eq!(data[&indicator], Value::Float(6.0));
        assert_eq!(tree.factory.node(id).unwrap().status(), Status::Done);
    }

    #[test]
    fn missing_input_fails_and_marks_node_failed() {
        let mut tree = configured(
            Builder::discipline("Disc1", Disc1::default),
            EngineConfig::default(),
        );
        set(&mut tree, &[("study.Disc1.a", 2.0), ("study.Disc1.b", 3.0)]);
        let reporter = ProgressReporter::new();
        let exec = Executor::new(&tree.factory, &tree.config, &reporter);
        let id = tree.factory.find("study.Disc1").unwrap();
        let mut data = tree.dm.local_data();

        let err = exec
            .execute_node(id, &mut data, ExecScope::from_config(&tree.config))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingInput { ref variable, .. } if variable == "study.x"
        ));
        assert_eq!(tree.factory.node(id).unwrap().status(), Status::Failed);
    }

    #[test]
    fn simple_cache_skips_unchanged_inputs() {
        let mut tree = configured(
            Builder::discipline("Disc1", Disc1::default),
            EngineConfig::default(),
        );
        set(
            &mut tree,
            &[("study.x", 1.0), ("study.Disc1.a", 1.0), ("study.Disc1.b", 1.0)],
        );
        let reporter = ProgressReporter::new();
        let exec = Executor::new(&tree.factory, &tree.config, &reporter);
        let id = tree.factory.find("study.Disc1").unwrap();
        let scope = ExecScope {
            cache: CacheType::SimpleCache,
            n_processes: 1,
        };
        let data = tree.dm.local_data();

        exec.evaluate_member(id, &data, scope).unwrap();
        exec.evaluate_member(id, &data, scope).unwrap();
        assert_eq!(tree.factory.node(id).unwrap().n_calls(), 1);

        let mut changed = data.clone();
        changed.insert(tree.dm.var_id("study.x").unwrap(), Value::Float(2.0));
        exec.evaluate_member(id, &changed, scope).unwrap();
        assert_eq!(tree.factory.node(id).unwrap().n_calls(), 2);
    }

    #[test]
    fn overwritten_inputs_are_dropped_or_fail_under_input_change_check() {
        let mut tree = configured(
            Builder::discipline("Over", Overwriter::default),
            EngineConfig::default(),
        );
        set(&mut tree, &[("study.Over.u", 1.0)]);
        let id = tree.factory.find("study.Over").unwrap();
        let scope = ExecScope::from_config(&tree.config);

        {
            let reporter = ProgressReporter::new();
            let exec = Executor::new(&tree.factory, &tree.config, &reporter);
            let produced = exec
                .evaluate_member(id, &tree.dm.local_data(), scope)
                .unwrap();
            let u = tree.dm.var_id("study.Over.u").unwrap();
            let v = tree.dm.var_id("study.Over.v").unwrap();
            assert_eq!(produced, vec![(v, Value::Float(1.0))]);
            assert!(produced.iter().all(|(var, _)| *var != u));
        }

        tree.factory.get_mut(id).unwrap().debug.input_change = true;
        let reporter = ProgressReporter::new();
        let exec = Executor::new(&tree.factory, &tree.config, &reporter);
        let err = exec
            .evaluate_member(id, &tree.dm.local_data(), scope)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DebugCheck { mode: "input_change", .. }
        ));
    }

    #[test]
    fn nan_check_rejects_nan_inputs() {
        let mut tree = configured(
            Builder::discipline("Disc1", Disc1::default),
            EngineConfig::default(),
        );
        set(
            &mut tree,
            &[("study.x", f64::NAN), ("study.Disc1.a", 1.0), ("study.Disc1.b", 1.0)],
        );
        let id = tree.factory.find("study.Disc1").unwrap();
        tree.factory.get_mut(id).unwrap().debug.nan = true;
        let reporter = ProgressReporter::new();
        let exec = Executor::new(&tree.factory, &tree.config, &reporter);
        let err = exec
            .evaluate_member(id, &tree.dm.local_data(), ExecScope::from_config(&tree.config))
            .unwrap_err();
        assert!(matches!(err, EngineError::DebugCheck { mode: "nan", .. }));
    }
}
