use super::builder::Builder;
use super::debug::DebugFlags;
use super::driver::DriverState;
use super::model::Model;
use super::scatter::ScatterState;
use crate::core::data_manager::LocalData;
use crate::core::ids::{DisciplineId, NamespaceId, VarId};
use crate::core::schema::Schema;
use crate::core::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle status of a discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Virtual,
    Configure,
    Pending,
    Running,
    Done,
    Failed,
}

impl Status {
    fn to_u8(self) -> u8 {
        match self {
            Status::Virtual => 0,
            Status::Configure => 1,
            Status::Pending => 2,
            Status::Running => 3,
            Status::Done => 4,
            Status::Failed => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Status::Configure,
            2 => Status::Pending,
            3 => Status::Running,
            4 => Status::Done,
            5 => Status::Failed,
            _ => Status::Virtual,
        }
    }
}

/// Status storage that can be updated while the tree is shared across workers.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) fn new(status: Status) -> Self {
        Self(AtomicU8::new(status.to_u8()))
    }

    pub(crate) fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, status: Status) {
        self.0.store(status.to_u8(), Ordering::Release);
    }
}

/// A resolved input or output of a discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub name: String,
    pub path: String,
    pub var: VarId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisciplineKind {
    Leaf,
    Coupling,
    Scatter,
    EvalDriver,
}

pub(crate) enum NodeBehavior {
    Leaf(Arc<dyn Model>),
    Coupling { builders: Vec<Builder>, built: bool },
    Scatter(ScatterState),
    EvalDriver(DriverState),
}

#[derive(Debug, Clone)]
pub(crate) struct CachedRun {
    pub inputs: Vec<Option<Value>>,
    pub outputs: Vec<(VarId, Value)>,
}

/// Mutable state touched during execution.
#[derive(Debug, Default)]
pub(crate) struct RuntimeState {
    pub cache: Option<CachedRun>,
    pub warm_start: Option<LocalData>,
    pub residuals_history: Vec<f64>,
    pub n_calls: usize,
}

/// One node of the discipline tree.
pub struct DisciplineNode {
    pub(crate) name: String,
    pub(crate) full_name: String,
    pub(crate) parent: Option<DisciplineId>,
    pub(crate) children: Vec<DisciplineId>,
    pub(crate) behavior: NodeBehavior,
    /// Namespaces bound on this node, shadowing shared bindings for its subtree.
    pub(crate) namespaces: HashMap<String, NamespaceId>,
    pub(crate) schema: Schema,
    pub(crate) inputs: Vec<PortBinding>,
    pub(crate) outputs: Vec<PortBinding>,
    pub(crate) structuring: Vec<(VarId, Option<Value>)>,
    pub(crate) configured: bool,
    pub(crate) debug: DebugFlags,
    status: StatusCell,
    runtime: Mutex<RuntimeState>,
}

impl DisciplineNode {
    pub(crate) fn new(
        name: String,
        full_name: String,
        parent: Option<DisciplineId>,
        behavior: NodeBehavior,
    ) -> Self {
        Self {
            name,
            full_name,
            parent,
            children: Vec::new(),
            behavior,
            namespaces: HashMap::new(),
            schema: Schema::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            structuring: Vec::new(),
            configured: false,
            debug: DebugFlags::default(),
            status: StatusCell::new(Status::Virtual),
            runtime: Mutex::new(RuntimeState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn parent(&self) -> Option<DisciplineId> {
        self.parent
    }

    pub fn children(&self) -> &[DisciplineId] {
        &self.children
    }

    pub fn kind(&self) -> DisciplineKind {
        match self.behavior {
            NodeBehavior::Leaf(_) => DisciplineKind::Leaf,
            NodeBehavior::Coupling { .. } => DisciplineKind::Coupling,
            NodeBehavior::Scatter(_) => DisciplineKind::Scatter,
            NodeBehavior::EvalDriver(_) => DisciplineKind::EvalDriver,
        }
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: Status) {
        self.status.set(status);
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn inputs(&self) -> &[PortBinding] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortBinding] {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<&PortBinding> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&PortBinding> {
        self.outputs.iter().find(|p| p.name == name)
    }

    pub fn is_configured_flag(&self) -> bool {
        self.configured
    }

    pub fn debug_flags(&self) -> DebugFlags {
        self.debug
    }

    pub(crate) fn model(&self) -> Option<&Arc<dyn Model>> {
        match &self.behavior {
            NodeBehavior::Leaf(model) => Some(model),
            _ => None,
        }
    }

    /// Number of times the model or sub-process of this node actually ran.
    pub fn n_calls(&self) -> usize {
        self.runtime().n_calls
    }

    /// Normalized residuals recorded by the last MDA run of this coupling.
    pub fn residuals_history(&self) -> Vec<f64> {
        self.runtime().residuals_history.clone()
    }

    pub(crate) fn runtime(&self) -> MutexGuard<'_, RuntimeState> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for DisciplineNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisciplineNode")
            .field("full_name", &self.full_name)
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("children", &self.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_cell_round_trips_every_status() {
        let cell = StatusCell::new(Status::Virtual);
        for status in [
            Status::Configure,
            Status::Pending,
            Status::Running,
            Status::Done,
            Status::Failed,
            Status::Virtual,
        ] {
            cell.set(status);
            assert_eq!(cell.get(), status);
        }
    }

    #[test]
    fn status_serializes_in_upper_case() {
        assert_eq!(serde_json::to_string(&Status::Done).unwrap(), "\"DONE\"");
    }
}
