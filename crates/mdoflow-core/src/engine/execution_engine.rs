use super::builder::Builder;
use super::config::{EngineConfig, MdaClass};
use super::configure;
use super::datasets::{DatasetConnector, DatasetsManager};
use super::debug::DebugFlags;
use super::discipline::{DisciplineNode, NodeBehavior, Status};
use super::error::EngineError;
use super::execution::{ExecScope, Executor};
use super::factory::{EngineContext, Factory};
use super::mda::{self, DEBUG_MODE, GaussSeidel, PureNewtonRaphson};
use super::progress::ProgressReporter;
use crate::core::anonymize::KeyAnonymizer;
use crate::core::data_manager::{DataError, DataManager};
use crate::core::ids::{DisciplineId, NamespaceId};
use crate::core::namespace::NamespaceManager;
use crate::core::value::Value;
use crate::core::variable::{ConnectorDescriptor, IoType};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Owner of a study: its data manager, namespaces, discipline tree and data sources.
///
/// Loading data runs the configuration loop until the tree stops changing; executing runs
/// the root process on a snapshot of the data and writes the results back.
pub struct ExecutionEngine {
    study_name: String,
    dm: DataManager,
    ns_manager: NamespaceManager,
    factory: Factory,
    config: EngineConfig,
    datasets: DatasetsManager,
}

impl ExecutionEngine {
    pub fn new(study_name: impl Into<String>) -> Self {
        Self::with_config(study_name, EngineConfig::default())
    }

    pub fn with_config(study_name: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            study_name: study_name.into(),
            dm: DataManager::new(),
            ns_manager: NamespaceManager::new(),
            factory: Factory::new(),
            config,
            datasets: DatasetsManager::new(),
        }
    }

    pub fn study_name(&self) -> &str {
        &self.study_name
    }

    pub fn dm(&self) -> &DataManager {
        &self.dm
    }

    pub fn dm_mut(&mut self) -> &mut DataManager {
        &mut self.dm
    }

    pub fn ns_manager(&self) -> &NamespaceManager {
        &self.ns_manager
    }

    pub fn factory(&self) -> &Factory {
        &self.factory
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn root_process(&self) -> Option<&DisciplineNode> {
        self.factory.root().and_then(|id| self.factory.node(id))
    }

    pub fn discipline(&self, full_name: &str) -> Option<&DisciplineNode> {
        self.dm
            .discipline_id(full_name)
            .and_then(|id| self.factory.node(id))
    }

    pub fn get_value(&self, full_path: &str) -> Result<&Value, DataError> {
        self.dm.get_value(full_path)
    }

    /// Binds a shared namespace. Rebinding to a new value re-paths the variables resolved
    /// through the previous binding and marks the tree for reconfiguration.
    pub fn add_ns(&mut self, name: &str, value: &str) -> NamespaceId {
        let binding = self.ns_manager.add_ns(name, value);
        if let Some(old) = binding.replaced {
            let moved = self.dm.remap_namespace(old, binding.id, value);
            self.ns_manager.release(old);
            debug!(namespace = name, value, moved = moved.len(), "Shared namespace rebound");
            for (_, node) in self.factory.nodes_mut() {
                node.configured = false;
            }
        }
        binding.id
    }

    pub fn add_ns_def(&mut self, definitions: &BTreeMap<String, String>) -> Vec<NamespaceId> {
        definitions
            .iter()
            .map(|(name, value)| self.add_ns(name, value))
            .collect()
    }

    /// Replaces the root process. The current tree and every variable are dropped.
    pub fn set_root_builder(&mut self, builder: Builder) {
        self.factory.clear();
        self.dm.reset();
        info!(study = %self.study_name, root = builder.name(), "Root process set");
        self.factory.set_root_builder(builder);
    }

    /// Uses a coupling named after the study, wrapping `builders`, as the root process.
    pub fn set_builders_to_coupling_builder(&mut self, builders: Vec<Builder>) {
        let root = Builder::coupling(self.study_name.clone(), builders);
        self.set_root_builder(root);
    }

    pub fn register_connector(
        &mut self,
        connector_id: impl Into<String>,
        connector: Arc<dyn DatasetConnector>,
    ) {
        self.datasets.register(connector_id, connector);
    }

    pub fn datasets(&self) -> &DatasetsManager {
        &self.datasets
    }

    /// One build and configure pass over the whole tree.
    pub fn configure(&mut self) -> Result<(), EngineError> {
        let mut ctx = EngineContext {
            dm: &mut self.dm,
            ns: &mut self.ns_manager,
            study_name: &self.study_name,
            config: &self.config,
        };
        configure::configure_io(&mut self.factory, &mut ctx)
    }

    /// Whether the whole tree is configured against the current data.
    pub fn is_configured(&self) -> bool {
        self.factory
            .root()
            .is_some_and(|root| configure::is_configured(&self.factory, &self.dm, root))
    }

    /// Key rewriter for this study and its current root process.
    pub fn anonymizer(&self) -> KeyAnonymizer {
        let root_name = self
            .factory
            .root_builder()
            .map(Builder::name)
            .unwrap_or(self.study_name.as_str());
        KeyAnonymizer::new(&self.study_name, root_name)
    }

    /// Loads `data` into the study, configuring the tree until it is stable.
    ///
    /// Input values are injected once each, as soon as their variable exists; output values
    /// are copied after the loop. The loop stops when the tree is configured and no loaded
    /// input is still waiting for its variable, or after `max_configure_iterations` passes.
    ///
    /// # Arguments
    ///
    /// * `data` - Values keyed by full path, or by anonymized key when `unanonymize` is set.
    /// * `unanonymize` - Maps incoming keys to full paths of this study.
    #[instrument(skip_all, name = "load_study", fields(study = %self.study_name))]
    pub fn load_study_from_dict(
        &mut self,
        data: &BTreeMap<String, Value>,
        unanonymize: Option<&dyn Fn(&str) -> String>,
    ) -> Result<(), EngineError> {
        let data: BTreeMap<String, Value> = match unanonymize {
            Some(f) => data.iter().map(|(k, v)| (f(k.as_str()), v.clone())).collect(),
            None => data.clone(),
        };
        let mut injected: HashSet<String> = HashSet::new();
        let max_iterations = self.config.max_configure_iterations;
        let mut iteration = 0;

        loop {
            for (path, value) in &data {
                if injected.contains(path) {
                    continue;
                }
                let Some(id) = self.dm.var_id(path) else {
                    continue;
                };
                if self.dm.variable(id).is_some_and(|v| v.io_type == IoType::In) {
                    self.dm.set_value_by_id(id, value.clone());
                    injected.insert(path.clone());
                }
            }

            self.configure()?;
            iteration += 1;

            let pending = data.keys().any(|path| {
                !injected.contains(path)
                    && self
                        .dm
                        .var_id(path)
                        .and_then(|id| self.dm.variable(id))
                        .is_some_and(|v| v.io_type == IoType::In)
            });
            if !pending && self.is_configured() {
                debug!(iterations = iteration, "Configuration converged");
                break;
            }
            if iteration >= max_iterations {
                warn!(
                    study = %self.study_name,
                    iterations = iteration,
                    "Configuration loop reached its iteration cap before the process was configured"
                );
                break;
            }
        }

        // Ids are resolved again since the last pass may have created variables.
        let resolved = self.dm.convert_data_dict_with_ids(&data);
        for (id, value) in &resolved {
            if self.dm.variable(*id).is_some_and(|v| v.io_type == IoType::Out) {
                self.dm.set_value_by_id(*id, value.clone());
            }
        }

        self.configure_execution()?;
        if !data.is_empty() {
            self.init_execution();
            self.dm.check_inputs(false)?;
        }
        self.update_status(Status::Configure);
        info!(
            study = %self.study_name,
            n_values = data.len(),
            n_disciplines = self.factory.len(),
            "Study loaded"
        );
        Ok(())
    }

    /// Loads values keyed by anonymized keys.
    pub fn load_study_from_input_dict(
        &mut self,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        let anonymizer = self.anonymizer();
        let unanonymize = |key: &str| anonymizer.unanonymize_key(key);
        self.load_study_from_dict(values, Some(&unanonymize))
    }

    /// Validates the MDA options of every coupling and applies their `debug_mode` inputs.
    pub fn configure_execution(&mut self) -> Result<(), EngineError> {
        let data = self.dm.local_data();
        let mut debug_targets: Vec<(DisciplineId, DebugFlags)> = Vec::new();
        for (id, node) in self.factory.nodes() {
            if !matches!(node.behavior, NodeBehavior::Coupling { .. }) {
                continue;
            }
            let options = mda::options_from_inputs(node, &data, &self.config.mda)?;
            match options.sub_mda_class {
                MdaClass::GaussSeidel => {
                    GaussSeidel::new(
                        options.over_relaxation_factor,
                        options.tolerance,
                        options.max_mda_iter,
                    )?;
                }
                MdaClass::PureNewtonRaphson => {
                    PureNewtonRaphson::new(
                        options.relax_factor,
                        options.tolerance,
                        options.max_mda_iter,
                    )?;
                }
            }

            let mode = node
                .input(DEBUG_MODE)
                .and_then(|p| data.get(&p.var))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !mode.is_empty() {
                debug_targets.push((id, DebugFlags::from_mode(mode)?));
            }
        }
        for (id, flags) in debug_targets {
            self.apply_debug_flags(id, flags);
        }
        Ok(())
    }

    fn apply_debug_flags(&mut self, id: DisciplineId, flags: DebugFlags) {
        for member in self.factory.subtree(id) {
            if let Some(node) = self.factory.node_mut(member) {
                node.debug = node.debug.union(flags);
            }
        }
    }

    /// Enables a debug check on `discipline` (the root when `None`) and its subtree.
    ///
    /// `mode` is one of `nan`, `input_change`, `linearize_data_change`, `min_max_grad`,
    /// `min_max_couplings`, or empty / `all` for every check.
    pub fn set_debug_mode(&mut self, mode: &str, discipline: Option<&str>) -> Result<(), EngineError> {
        let flags = DebugFlags::from_mode(mode)?;
        let target = match discipline {
            Some(name) => self
                .dm
                .discipline_id(name)
                .ok_or_else(|| EngineError::UnknownDiscipline(name.to_string()))?,
            None => self.factory.root().ok_or(EngineError::NoRootProcess)?,
        };
        self.apply_debug_flags(target, flags);
        let shown = if mode.is_empty() { "all" } else { mode };
        info!(mode = shown, "Debug mode set");
        Ok(())
    }

    /// Drops per-node run caches, whose variable ids may predate the last configuration.
    fn init_execution(&self) {
        for (_, node) in self.factory.nodes() {
            node.runtime().cache = None;
        }
    }

    fn update_status(&self, status: Status) {
        for (_, node) in self.factory.nodes() {
            node.set_status(status);
        }
    }

    /// Attaches connectors to variables, keyed by full path.
    pub fn load_connectors_from_dict(
        &mut self,
        connectors: &BTreeMap<String, ConnectorDescriptor>,
    ) -> Result<(), EngineError> {
        for (path, descriptor) in connectors {
            let id = self
                .dm
                .var_id(path)
                .ok_or_else(|| DataError::UnknownKey(path.clone()))?;
            self.dm.set_connector(id, descriptor.clone())?;
        }
        Ok(())
    }

    /// Fetches the value of every input that has a connector.
    ///
    /// # Return
    ///
    /// The number of inputs filled.
    pub fn fill_data_in_with_connector(&mut self) -> Result<usize, EngineError> {
        let targets: Vec<_> = self
            .dm
            .variables()
            .filter(|(_, v)| v.io_type == IoType::In)
            .filter_map(|(id, v)| {
                v.connector
                    .clone()
                    .map(|c| (id, v.name.clone(), v.full_path.clone(), c))
            })
            .collect();
        for (id, name, path, descriptor) in &targets {
            let value = self.datasets.fetch(descriptor, name)?;
            self.dm.set_value_by_id(*id, value);
            debug!(path = %path, connector = %descriptor.connector_id, "Input filled from dataset");
        }
        Ok(targets.len())
    }

    /// Writes the anonymized data dict into a dataset.
    pub fn write_data_to_dataset(
        &self,
        connector_id: &str,
        dataset_id: &str,
    ) -> Result<(), EngineError> {
        let values = self.get_anonymized_data_dict();
        self.datasets.write(connector_id, dataset_id, &values)?;
        Ok(())
    }

    pub fn execute(&mut self) -> Result<(), EngineError> {
        self.execute_with_reporter(&ProgressReporter::new())
    }

    /// Runs the root process and stores its results.
    ///
    /// Inputs backed by a connector are fetched first, then every input is checked; a
    /// missing or invalid input fails the run before anything executes.
    #[instrument(skip_all, name = "execute", fields(study = %self.study_name))]
    pub fn execute_with_reporter(&mut self, reporter: &ProgressReporter) -> Result<(), EngineError> {
        let root = self.factory.root().ok_or(EngineError::NoRootProcess)?;
        reporter.phase("Filling connector inputs", || self.fill_data_in_with_connector())?;
        self.dm.check_inputs(true)?;
        self.update_status(Status::Pending);

        let mut data = self.dm.local_data();
        reporter.phase("Executing process", || {
            let exec = Executor::new(&self.factory, &self.config, reporter);
            exec.execute_node(root, &mut data, ExecScope::from_config(&self.config))
        })?;
        self.dm.apply_local_data(&data);
        info!(study = %self.study_name, "Execution complete");
        Ok(())
    }

    pub fn get_anonymized_data_dict(&self) -> BTreeMap<String, Value> {
        let anonymizer = self.anonymizer();
        self.dm
            .data_dict()
            .into_iter()
            .map(|(k, v)| (anonymizer.anonymize_key(&k), v))
            .collect()
    }

    pub fn get_disciplines_status_dict(&self) -> BTreeMap<String, Status> {
        self.dm
            .disciplines()
            .iter()
            .filter_map(|(name, &id)| self.factory.node(id).map(|n| (name.clone(), n.status())))
            .collect()
    }

    pub fn get_anonymized_disciplines_status_dict(&self) -> BTreeMap<String, Status> {
        let anonymizer = self.anonymizer();
        self.get_disciplines_status_dict()
            .into_iter()
            .map(|(k, s)| (anonymizer.anonymize_key(&k), s))
            .collect()
    }

    /// Restores statuses. Keys are matched as full names first, then as anonymized keys;
    /// unknown keys are skipped.
    pub fn load_disciplines_status_dict(&mut self, statuses: &BTreeMap<String, Status>) {
        let anonymizer = self.anonymizer();
        for (key, status) in statuses {
            let id = self
                .dm
                .discipline_id(key)
                .or_else(|| self.dm.discipline_id(&anonymizer.unanonymize_key(key)));
            match id.and_then(|id| self.factory.node(id)) {
                Some(node) => node.set_status(*status),
                None => debug!(key = %key, "Status for an unknown discipline skipped"),
            }
        }
    }

    /// Writes every variable as CSV with anonymized keys.
    pub fn export_data_csv<W: Write>(&self, writer: W) -> Result<(), EngineError> {
        let anonymizer = self.anonymizer();
        self.dm
            .export_csv(writer, |key| anonymizer.anonymize_key(key))?;
        Ok(())
    }
}
