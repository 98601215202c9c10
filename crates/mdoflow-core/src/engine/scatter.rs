use super::builder::Builder;
use super::config::ConfigError;
use super::discipline::NodeBehavior;
use super::error::EngineError;
use super::factory::{EngineContext, Factory};
use crate::core::ids::{DisciplineId, NamespaceId};
use crate::core::namespace::{NamespaceError, compose_ns};
use crate::core::schema::{Provenance, SchemaDelta};
use crate::core::value::{DataFrame, Value, VarType};
use crate::core::variable::VariableSpec;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info};

pub const SCENARIO_DF: &str = "scenario_df";
pub const SELECTED_SCENARIO: &str = "selected_scenario";
pub const SCENARIO_NAME: &str = "scenario_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatterSource {
    /// A string list of instance names.
    NameList,
    /// A scenario table with a selection column, a name column and trade variables.
    ScenarioTable,
}

/// Describes where a scatter reads its instance names and which namespaces it rewrites.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterMap {
    input_name: String,
    input_ns: Option<String>,
    scatter_ns: Option<String>,
    ns_to_update: Vec<String>,
    source: ScatterSource,
}

impl ScatterMap {
    pub fn name_list(input_name: impl Into<String>) -> Self {
        Self {
            input_name: input_name.into(),
            input_ns: None,
            scatter_ns: None,
            ns_to_update: Vec::new(),
            source: ScatterSource::NameList,
        }
    }

    pub fn scenario_table() -> Self {
        Self {
            source: ScatterSource::ScenarioTable,
            ..Self::name_list(SCENARIO_DF)
        }
    }

    /// Reads the instance list from a shared namespace instead of the driver's local one.
    pub fn with_input_ns(mut self, ns: impl Into<String>) -> Self {
        self.input_ns = Some(ns.into());
        self
    }

    /// Namespace bound to `{driver}.{instance}` for each instance.
    pub fn with_scatter_ns(mut self, ns: impl Into<String>) -> Self {
        self.scatter_ns = Some(ns.into());
        self
    }

    /// Namespace whose value gets the instance name inserted for each instance.
    pub fn with_ns_to_update(mut self, ns: impl Into<String>) -> Self {
        self.ns_to_update.push(ns.into());
        self
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn source(&self) -> ScatterSource {
        self.source
    }

    pub(crate) fn validate(&self, driver: &str) -> Result<(), ConfigError> {
        let malformed = |reason: &str| ConfigError::MalformedScatterMap {
            driver: driver.to_string(),
            reason: reason.to_string(),
        };
        if self.input_name.is_empty() {
            return Err(malformed("input name is empty"));
        }
        if let Some(scatter_ns) = &self.scatter_ns {
            if self.ns_to_update.contains(scatter_ns) {
                return Err(malformed(
                    "a namespace cannot be both the scatter namespace and updated",
                ));
            }
        }
        let unique: BTreeSet<&String> = self.ns_to_update.iter().collect();
        if unique.len() != self.ns_to_update.len() {
            return Err(malformed("namespaces to update are listed twice"));
        }
        Ok(())
    }

    pub(crate) fn schema_delta(&self) -> SchemaDelta {
        let spec = match self.source {
            ScatterSource::NameList => VariableSpec::new(&self.input_name, VarType::StringList)
                .default_value(Vec::<String>::new()),
            ScatterSource::ScenarioTable => VariableSpec::new(&self.input_name, VarType::DataFrame)
                .default_value(DataFrame::new([SELECTED_SCENARIO, SCENARIO_NAME])),
        }
        .structuring();
        let spec = match &self.input_ns {
            Some(ns) => spec.shared(ns),
            None => spec,
        };
        SchemaDelta::new(Provenance::Scatter).input(spec)
    }

    /// Instance names requested by `value`, without duplicates. The first occurrence wins.
    pub(crate) fn requested_names(&self, value: Option<&Value>) -> Vec<String> {
        self.split_requested(value).0
    }

    /// Requested names without duplicates, and every extra occurrence that was dropped.
    fn split_requested(&self, value: Option<&Value>) -> (Vec<String>, Vec<String>) {
        let raw: Vec<String> = match (self.source, value) {
            (ScatterSource::NameList, Some(Value::StringList(names))) => names.clone(),
            (ScatterSource::ScenarioTable, Some(Value::DataFrame(df))) => selected_scenarios(df),
            _ => Vec::new(),
        };

        let mut seen = BTreeSet::new();
        let mut names = Vec::with_capacity(raw.len());
        let mut duplicates = Vec::new();
        for name in raw {
            if seen.insert(name.clone()) {
                names.push(name);
            } else {
                duplicates.push(name);
            }
        }
        (names, duplicates)
    }
}

fn selected_scenarios(df: &DataFrame) -> Vec<String> {
    let (Some(selected), Some(names)) = (df.column(SELECTED_SCENARIO), df.column(SCENARIO_NAME))
    else {
        return Vec::new();
    };
    selected
        .into_iter()
        .zip(names)
        .filter(|(s, _)| s.as_bool() == Some(true))
        .filter_map(|(_, n)| n.as_str().map(str::to_string))
        .collect()
}

/// Inserts `instance` as a path segment: right after the driver's full name when `value`
/// lives under the driver, appended otherwise.
pub(crate) fn insert_instance_segment(value: &str, driver: &str, instance: &str) -> String {
    match value.strip_prefix(driver) {
        Some(rest) if rest.is_empty() || rest.starts_with('.') => {
            format!("{driver}.{instance}{rest}")
        }
        _ => compose_ns([value, instance]),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScatterInstance {
    pub node: DisciplineId,
    pub namespaces: Vec<(String, NamespaceId)>,
}

pub(crate) struct ScatterState {
    pub map: ScatterMap,
    pub builders: Vec<Builder>,
    pub instances: BTreeMap<String, ScatterInstance>,
    /// Names applied by the last build, `None` before the first one.
    pub built_names: Option<Vec<String>>,
    /// Duplicated names already logged for the current list.
    pub reported_duplicates: Vec<String>,
}

impl ScatterState {
    pub(crate) fn new(map: ScatterMap, builders: Vec<Builder>) -> Self {
        Self {
            map,
            builders,
            instances: BTreeMap::new(),
            built_names: None,
            reported_duplicates: Vec::new(),
        }
    }
}

fn scatter_state(
    factory: &mut Factory,
    id: DisciplineId,
) -> Result<&mut ScatterState, EngineError> {
    match &mut factory.get_mut(id)?.behavior {
        NodeBehavior::Scatter(state) => Ok(state),
        _ => Err(EngineError::Internal("scatter build on a non-scatter node".into())),
    }
}

/// Namespace values for one instance, in the order scatter namespace then updated ones.
fn instance_namespace_values(
    factory: &Factory,
    id: DisciplineId,
    map: &ScatterMap,
    driver: &str,
    instance: &str,
    ctx: &EngineContext<'_>,
) -> Result<Vec<(String, String)>, EngineError> {
    let mut values = Vec::new();
    if let Some(scatter_ns) = &map.scatter_ns {
        values.push((scatter_ns.clone(), compose_ns([driver, instance])));
    }
    for ns_name in &map.ns_to_update {
        let base = factory
            .resolve_namespace(id, ns_name, ctx.ns)
            .ok_or_else(|| NamespaceError::Undefined {
                name: ns_name.clone(),
                discipline: driver.to_string(),
            })?;
        let base_value = ctx.ns.value(base)?;
        values.push((
            ns_name.clone(),
            insert_instance_segment(base_value, driver, instance),
        ));
    }
    Ok(values)
}

/// Applies the difference between the requested instance names and the built ones.
///
/// Removed instances are cleaned, new ones are built from a coupling of the sub-builders
/// under their own namespaces, and existing ones are kept, only re-pathed if a namespace
/// they depend on moved.
pub(crate) fn build_scatter(
    factory: &mut Factory,
    id: DisciplineId,
    ctx: &mut EngineContext<'_>,
) -> Result<(), EngineError> {
    let (map, builders, driver, existing, value) = {
        let node = factory.get(id)?;
        let NodeBehavior::Scatter(state) = &node.behavior else {
            return Err(EngineError::Internal("scatter build on a non-scatter node".into()));
        };
        let value = node
            .input(&state.map.input_name)
            .and_then(|p| ctx.dm.value_by_id(p.var))
            .cloned();
        (
            state.map.clone(),
            state.builders.clone(),
            node.full_name.clone(),
            state.instances.keys().cloned().collect::<BTreeSet<_>>(),
            value,
        )
    };

    let (names, duplicates) = map.split_requested(value.as_ref());
    {
        let state = scatter_state(factory, id)?;
        if state.reported_duplicates != duplicates {
            for name in &duplicates {
                error!(
                    driver = %driver,
                    instance = %name,
                    "Scatter instance name is used more than once, keeping the first occurrence"
                );
            }
            state.reported_duplicates = duplicates;
        }
    }
    if builders.is_empty() {
        scatter_state(factory, id)?.built_names = Some(names);
        return Ok(());
    }

    let wanted: BTreeSet<&String> = names.iter().collect();
    let removed: Vec<String> = existing
        .iter()
        .filter(|n| !wanted.contains(n))
        .cloned()
        .collect();
    for name in removed {
        if let Some(instance) = scatter_state(factory, id)?.instances.remove(&name) {
            factory.clean(instance.node, ctx.dm, ctx.ns);
            info!(driver = %driver, instance = %name, "Scatter instance removed");
        }
    }

    for name in &names {
        let values = instance_namespace_values(factory, id, &map, &driver, name, ctx)?;
        let current = scatter_state(factory, id)?.instances.get(name).cloned();
        match current {
            Some(instance) => rebind_instance(factory, id, name, instance, values, ctx)?,
            None => {
                let builder = Builder::coupling(name.clone(), builders.clone());
                let node_id = factory.instantiate(&builder, Some(id), ctx)?;
                let namespaces: Vec<(String, NamespaceId)> = values
                    .iter()
                    .map(|(ns_name, value)| (ns_name.clone(), ctx.ns.create(ns_name, value)))
                    .collect();
                factory
                    .get_mut(node_id)?
                    .namespaces
                    .extend(namespaces.iter().cloned());
                scatter_state(factory, id)?.instances.insert(
                    name.clone(),
                    ScatterInstance {
                        node: node_id,
                        namespaces,
                    },
                );
                info!(driver = %driver, instance = %name, "Scatter instance built");
            }
        }
    }

    let ordered: Vec<DisciplineId> = {
        let state = scatter_state(factory, id)?;
        names
            .iter()
            .filter_map(|n| state.instances.get(n).map(|i| i.node))
            .collect()
    };
    factory.get_mut(id)?.children = ordered;
    scatter_state(factory, id)?.built_names = Some(names);
    Ok(())
}

fn rebind_instance(
    factory: &mut Factory,
    id: DisciplineId,
    name: &str,
    mut instance: ScatterInstance,
    values: Vec<(String, String)>,
    ctx: &mut EngineContext<'_>,
) -> Result<(), EngineError> {
    let mut changed = false;
    for (ns_name, value) in values {
        let Some(slot) = instance.namespaces.iter_mut().find(|(n, _)| *n == ns_name) else {
            continue;
        };
        if ctx.ns.value(slot.1)? == value {
            continue;
        }
        let new_id = ctx.ns.create(&ns_name, &value);
        let moved = ctx.dm.remap_namespace(slot.1, new_id, &value);
        debug!(instance = name, namespace = %ns_name, moved = moved.len(), "Scatter namespace rebound");
        ctx.ns.release(slot.1);
        slot.1 = new_id;
        factory
            .get_mut(instance.node)?
            .namespaces
            .insert(ns_name, new_id);
        changed = true;
    }
    if changed {
        scatter_state(factory, id)?
            .instances
            .insert(name.to_string(), instance);
    }
    Ok(())
}

/// Copies the trade-variable columns of a scenario table into each built scenario.
///
/// Column `c` of the row for scenario `s` is written to `{driver}.{s}.{c}` when that
/// variable exists.
pub(crate) fn push_trade_values(
    factory: &Factory,
    id: DisciplineId,
    ctx: &mut EngineContext<'_>,
) -> Result<(), EngineError> {
    let node = factory.get(id)?;
    let NodeBehavior::Scatter(state) = &node.behavior else {
        return Ok(());
    };
    if state.map.source != ScatterSource::ScenarioTable {
        return Ok(());
    }
    let Some(df) = node
        .input(&state.map.input_name)
        .and_then(|p| ctx.dm.value_by_id(p.var))
        .and_then(Value::as_dataframe)
        .cloned()
    else {
        return Ok(());
    };

    let trade_columns: Vec<&String> = df
        .columns()
        .iter()
        .filter(|c| c.as_str() != SELECTED_SCENARIO && c.as_str() != SCENARIO_NAME)
        .collect();
    for row in 0..df.n_rows() {
        let selected = df.get(row, SELECTED_SCENARIO).and_then(Value::as_bool) == Some(true);
        let Some(scenario) = df.get(row, SCENARIO_NAME).and_then(Value::as_str) else {
            continue;
        };
        if !selected || !state.instances.contains_key(scenario) {
            continue;
        }
        for column in &trade_columns {
            let path = compose_ns([node.full_name.as_str(), scenario, column.as_str()]);
            let (Some(var), Some(value)) = (ctx.dm.var_id(&path), df.get(row, column)) else {
                continue;
            };
            if ctx.dm.value_by_id(var) != Some(value) {
                ctx.dm.set_value_by_id(var, value.clone());
                debug!(path = %path, "Trade variable pushed from scenario table");
            }
        }
    }
    Ok(())
}
