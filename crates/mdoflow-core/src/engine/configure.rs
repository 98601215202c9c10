use super::discipline::{NodeBehavior, PortBinding, Status};
use super::driver;
use super::error::EngineError;
use super::factory::{EngineContext, Factory};
use super::mda;
use super::model::SetupContext;
use super::scatter;
use crate::core::data_manager::DataManager;
use crate::core::ids::{DisciplineId, NamespaceId, VarId};
use crate::core::namespace::{NamespaceError, compose_ns};
use crate::core::schema::{Provenance, Schema, SchemaDelta};
use crate::core::variable::{IoType, Visibility};
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// One build-then-configure pass over the whole tree.
pub(crate) fn configure_io(
    factory: &mut Factory,
    ctx: &mut EngineContext<'_>,
) -> Result<(), EngineError> {
    factory.build(ctx)?;
    let root = factory.root().ok_or(EngineError::NoRootProcess)?;
    configure_node(factory, root, ctx)
}

fn configure_node(
    factory: &mut Factory,
    id: DisciplineId,
    ctx: &mut EngineContext<'_>,
) -> Result<(), EngineError> {
    let is_driver = matches!(factory.get(id)?.behavior, NodeBehavior::EvalDriver(_));
    if !is_driver {
        let schema = node_schema(factory, id, ctx)?;
        register_schema(factory, id, schema, ctx)?;
    }

    let children = factory.get(id)?.children.clone();
    for child in children {
        configure_node(factory, child, ctx)?;
    }

    // Drivers resolve paths into their sub-process, so they come after their children.
    if is_driver {
        let schema = driver::driver_schema(factory, id, ctx)?;
        register_schema(factory, id, schema, ctx)?;
        driver::resolve_eval_variables(factory, id, ctx)?;
    }
    scatter::push_trade_values(factory, id, ctx)?;

    let node = factory.get_mut(id)?;
    node.configured = true;
    if node.status() == Status::Virtual {
        node.set_status(Status::Configure);
    }
    trace!(discipline = %node.full_name, "Discipline configured");
    Ok(())
}

/// Static, numerical and setup declarations of a non-driver node.
fn node_schema(
    factory: &Factory,
    id: DisciplineId,
    ctx: &EngineContext<'_>,
) -> Result<Schema, EngineError> {
    let node = factory.get(id)?;
    let mut schema = Schema::new();
    match &node.behavior {
        NodeBehavior::Leaf(model) => {
            schema.merge(SchemaDelta {
                provenance: Provenance::Static,
                inputs: model.desc_in(),
                outputs: model.desc_out(),
            });
            let current: HashMap<&str, _> = node
                .inputs
                .iter()
                .filter_map(|p| ctx.dm.value_by_id(p.var).map(|v| (p.name.as_str(), v)))
                .collect();
            let setup = model
                .setup(&SetupContext::new(current))
                .map_err(|source| EngineError::Model {
                    discipline: node.full_name.clone(),
                    source,
                })?;
            if let Some(delta) = setup {
                schema.merge(delta);
            }
        }
        NodeBehavior::Coupling { .. } => {
            schema.merge(mda::numerical_inputs_delta(&ctx.config.mda));
        }
        NodeBehavior::Scatter(state) => {
            schema.merge(state.map.schema_delta());
        }
        NodeBehavior::EvalDriver(_) => {
            return Err(EngineError::Internal(
                "driver schema is built after its sub-process".into(),
            ));
        }
    }
    Ok(schema)
}

/// Resolves every declaration of `schema` to a full path, registers it in the data manager,
/// and releases what the node declared before but no longer does.
pub(crate) fn register_schema(
    factory: &mut Factory,
    id: DisciplineId,
    schema: Schema,
    ctx: &mut EngineContext<'_>,
) -> Result<(), EngineError> {
    let (full_name, resolved) = {
        let node = factory.get(id)?;
        let mut resolved: Vec<(String, Option<NamespaceId>)> = Vec::new();
        for entry in schema.entries() {
            let spec = &entry.spec;
            let path = match spec.visibility {
                Visibility::Local | Visibility::Internal => {
                    (compose_ns([node.full_name.as_str(), spec.name.as_str()]), None)
                }
                Visibility::Shared => {
                    let ns_name = spec.namespace.as_deref().unwrap_or_default();
                    let ns_id = factory
                        .resolve_namespace(id, ns_name, ctx.ns)
                        .ok_or_else(|| NamespaceError::Undefined {
                            name: ns_name.to_string(),
                            discipline: node.full_name.clone(),
                        })?;
                    let value = ctx.ns.value(ns_id)?;
                    (compose_ns([value, spec.name.as_str()]), Some(ns_id))
                }
            };
            resolved.push(path);
        }
        (node.full_name.clone(), resolved)
    };

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut structuring = Vec::new();
    for (entry, (path, ns_id)) in schema.entries().iter().zip(resolved) {
        let var = ctx
            .dm
            .declare(&path, &entry.spec, entry.io_type, ns_id, id)?;
        let port = PortBinding {
            name: entry.spec.name.clone(),
            path,
            var,
        };
        match entry.io_type {
            IoType::In => {
                if entry.spec.structuring {
                    structuring.push((var, ctx.dm.value_by_id(var).cloned()));
                }
                inputs.push(port);
            }
            IoType::Out => outputs.push(port),
        }
    }

    let node = factory.get_mut(id)?;
    let kept: HashSet<VarId> = inputs.iter().chain(outputs.iter()).map(|p| p.var).collect();
    let stale: Vec<VarId> = node
        .inputs
        .iter()
        .chain(node.outputs.iter())
        .map(|p| p.var)
        .filter(|v| !kept.contains(v))
        .collect();
    node.schema = schema;
    node.inputs = inputs;
    node.outputs = outputs;
    node.structuring = structuring;
    for var in stale {
        ctx.dm.release(var, id);
        trace!(discipline = %full_name, "Stale variable released");
    }
    Ok(())
}

/// Whether `id` and its whole subtree are configured against the current data.
///
/// A node is configured once it went through a configuration pass, its structuring inputs
/// still hold the values seen then, and its kind-specific build is complete.
pub(crate) fn is_configured(factory: &Factory, dm: &DataManager, id: DisciplineId) -> bool {
    let Some(node) = factory.node(id) else {
        return false;
    };
    if !node.configured {
        return false;
    }
    if node
        .structuring
        .iter()
        .any(|(var, seen)| dm.value_by_id(*var) != seen.as_ref())
    {
        return false;
    }
    let built = match &node.behavior {
        NodeBehavior::Leaf(_) => true,
        NodeBehavior::Coupling { built, .. } => *built,
        NodeBehavior::EvalDriver(state) => state.built,
        NodeBehavior::Scatter(state) => {
            let value = node
                .input(state.map.input_name())
                .and_then(|p| dm.value_by_id(p.var));
            state.built_names.as_ref()
                == Some(&state.map.requested_names(value))
        }
    };
    built
        && node
            .children
            .iter()
            .all(|&child| is_configured(factory, dm, child))
}
