use super::builder::{Builder, BuilderKind};
use super::config::{ConfigError, EngineConfig};
use super::discipline::{DisciplineNode, NodeBehavior};
use super::driver::DriverState;
use super::error::EngineError;
use super::scatter::{self, ScatterState};
use crate::core::data_manager::DataManager;
use crate::core::ids::{DisciplineId, NamespaceId};
use crate::core::namespace::{NamespaceManager, compose_ns};
use slotmap::SlotMap;
use tracing::debug;

/// Mutable study state threaded through build and configuration passes.
pub(crate) struct EngineContext<'a> {
    pub dm: &'a mut DataManager,
    pub ns: &'a mut NamespaceManager,
    pub study_name: &'a str,
    pub config: &'a EngineConfig,
}

/// Owner of the discipline tree.
///
/// Nodes live in a slot map; parents hold the ids of the children they built and are the only
/// ones to destroy them. `built` keeps every live node in instantiation order.
#[derive(Default)]
pub struct Factory {
    nodes: SlotMap<DisciplineId, DisciplineNode>,
    root: Option<DisciplineId>,
    root_builder: Option<Builder>,
    built: Vec<DisciplineId>,
}

impl Factory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_root_builder(&mut self, builder: Builder) {
        self.root_builder = Some(builder);
    }

    pub fn root_builder(&self) -> Option<&Builder> {
        self.root_builder.as_ref()
    }

    pub fn root(&self) -> Option<DisciplineId> {
        self.root
    }

    pub fn node(&self, id: DisciplineId) -> Option<&DisciplineNode> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: DisciplineId) -> Option<&mut DisciplineNode> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn get(&self, id: DisciplineId) -> Result<&DisciplineNode, EngineError> {
        self.nodes
            .get(id)
            .ok_or_else(|| EngineError::Internal(format!("stale discipline id {id:?}")))
    }

    pub(crate) fn get_mut(&mut self, id: DisciplineId) -> Result<&mut DisciplineNode, EngineError> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| EngineError::Internal(format!("stale discipline id {id:?}")))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (DisciplineId, &DisciplineNode)> {
        self.nodes.iter()
    }

    pub(crate) fn nodes_mut(&mut self) -> impl Iterator<Item = (DisciplineId, &mut DisciplineNode)> {
        self.nodes.iter_mut()
    }

    /// Every live discipline, in the order it was built.
    pub fn built_disciplines(&self) -> &[DisciplineId] {
        &self.built
    }

    pub fn find(&self, full_name: &str) -> Option<DisciplineId> {
        self.nodes
            .iter()
            .find(|(_, n)| n.full_name == full_name)
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of `id` and all its descendants, parents before children.
    pub fn subtree(&self, id: DisciplineId) -> Vec<DisciplineId> {
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(current) {
                order.push(current);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }

    /// Drops the whole tree, keeping the root builder.
    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.built.clear();
        self.root = None;
    }

    /// Resolves a namespace name for `id`: bindings on the node and its ancestors first,
    /// then the shared binding.
    pub(crate) fn resolve_namespace(
        &self,
        id: DisciplineId,
        name: &str,
        ns: &NamespaceManager,
    ) -> Option<NamespaceId> {
        let mut current = Some(id);
        while let Some(node) = current.and_then(|c| self.nodes.get(c)) {
            if let Some(&bound) = node.namespaces.get(name) {
                return Some(bound);
            }
            current = node.parent;
        }
        ns.shared_id(name)
    }

    /// Creates one node from `builder` under `parent` (or as the root).
    pub(crate) fn instantiate(
        &mut self,
        builder: &Builder,
        parent: Option<DisciplineId>,
        ctx: &mut EngineContext<'_>,
    ) -> Result<DisciplineId, EngineError> {
        let (full_name, debug) = match parent {
            Some(p) => {
                let parent_node = self.get(p)?;
                (
                    compose_ns([parent_node.full_name.as_str(), builder.name()]),
                    parent_node.debug,
                )
            }
            None if builder.name() == ctx.study_name => (ctx.study_name.to_string(), Default::default()),
            None => (
                compose_ns([ctx.study_name, builder.name()]),
                Default::default(),
            ),
        };
        if ctx.dm.discipline_id(&full_name).is_some() {
            return Err(ConfigError::DuplicateDiscipline(full_name).into());
        }

        let behavior = match builder.kind() {
            BuilderKind::Discipline(constructor) => NodeBehavior::Leaf(constructor()),
            BuilderKind::Coupling(builders) => NodeBehavior::Coupling {
                builders: builders.clone(),
                built: false,
            },
            BuilderKind::Scatter { map, builders } => {
                map.validate(&full_name)?;
                NodeBehavior::Scatter(ScatterState::new(map.clone(), builders.clone()))
            }
            BuilderKind::EvalDriver { strategy, builders } => {
                NodeBehavior::EvalDriver(DriverState::new(strategy.clone(), builders.clone()))
            }
        };

        let mut node = DisciplineNode::new(
            builder.name().to_string(),
            full_name.clone(),
            parent,
            behavior,
        );
        node.debug = debug;
        for (ns_name, value) in builder.associated_namespaces() {
            node.namespaces
                .insert(ns_name.clone(), ctx.ns.create(ns_name, value));
        }

        let id = self.nodes.insert(node);
        match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(parent_node) => parent_node.children.push(id),
            None => self.root = Some(id),
        }
        ctx.dm.register_discipline(&full_name, id);
        self.built.push(id);
        debug!(discipline = %full_name, "Discipline instantiated");
        Ok(id)
    }

    /// Brings the tree in line with the builders and the current data.
    ///
    /// Idempotent: couplings and drivers build their children once, scatters only apply the
    /// difference between the requested and the existing instances.
    pub(crate) fn build(&mut self, ctx: &mut EngineContext<'_>) -> Result<(), EngineError> {
        let root = match self.root {
            Some(root) => root,
            None => {
                let builder = self.root_builder.clone().ok_or(EngineError::NoRootProcess)?;
                self.instantiate(&builder, None, ctx)?
            }
        };
        self.build_node(root, ctx)
    }

    fn build_node(
        &mut self,
        id: DisciplineId,
        ctx: &mut EngineContext<'_>,
    ) -> Result<(), EngineError> {
        enum Plan {
            Nothing,
            Children(Vec<Builder>),
            Scatter,
        }

        let plan = match &self.get(id)?.behavior {
            NodeBehavior::Leaf(_) => Plan::Nothing,
            NodeBehavior::Coupling { built: true, .. } => Plan::Nothing,
            NodeBehavior::Coupling { builders, .. } => Plan::Children(builders.clone()),
            NodeBehavior::EvalDriver(state) if state.built => Plan::Nothing,
            NodeBehavior::EvalDriver(state) => Plan::Children(state.builders.clone()),
            NodeBehavior::Scatter(_) => Plan::Scatter,
        };

        match plan {
            Plan::Nothing => {}
            Plan::Children(builders) => {
                for builder in &builders {
                    self.instantiate(builder, Some(id), ctx)?;
                }
                match &mut self.get_mut(id)?.behavior {
                    NodeBehavior::Coupling { built, .. } => *built = true,
                    NodeBehavior::EvalDriver(state) => state.built = true,
                    _ => {}
                }
            }
            Plan::Scatter => scatter::build_scatter(self, id, ctx)?,
        }

        let children = self.get(id)?.children.clone();
        for child in children {
            self.build_node(child, ctx)?;
        }
        Ok(())
    }

    /// Destroys `id` and its subtree, releasing their variables, registrations and the
    /// namespaces bound on them.
    pub(crate) fn clean(
        &mut self,
        id: DisciplineId,
        dm: &mut DataManager,
        ns: &mut NamespaceManager,
    ) {
        let children = match self.nodes.get(id) {
            Some(node) => node.children.clone(),
            None => return,
        };
        for child in children {
            self.clean(child, dm, ns);
        }

        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        for port in node.inputs.iter().chain(node.outputs.iter()) {
            dm.release(port.var, id);
        }
        dm.unregister_discipline(id);
        for &bound in node.namespaces.values() {
            ns.release(bound);
        }
        self.built.retain(|&b| b != id);
        if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(p)) {
            parent.children.retain(|&c| c != id);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        debug!(discipline = %node.full_name, "Discipline cleaned");
    }

    /// Cleans the given children of `parent`.
    pub(crate) fn clean_children(
        &mut self,
        parent: DisciplineId,
        children: &[DisciplineId],
        dm: &mut DataManager,
        ns: &mut NamespaceManager,
    ) {
        for &child in children {
            if self.nodes.get(child).and_then(|n| n.parent) == Some(parent) {
                self.clean(child, dm, ns);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::discipline::DisciplineKind;
    use crate::engine::test_models::{Disc1, Disc2};

    fn context<'a>(
        dm: &'a mut DataManager,
        ns: &'a mut NamespaceManager,
        config: &'a EngineConfig,
    ) -> EngineContext<'a> {
        EngineContext {
            dm,
            ns,
            study_name: "study",
            config,
        }
    }

    fn root_builder() -> Builder {
        Builder::coupling(
            "study",
            vec![
                Builder::discipline("Disc1", Disc1::default),
                Builder::discipline("Disc2", Disc2::default),
            ],
        )
    }

    #[test]
    fn build_is_idempotent() {
        let (mut dm, mut ns, config) = (
            DataManager::new(),
            NamespaceManager::new(),
            EngineConfig::default(),
        );
        let mut ctx = context(&mut dm, &mut ns, &config);
        let mut factory = Factory::new();
        factory.set_root_builder(root_builder());

        factory.build(&mut ctx).unwrap();
        let first: Vec<_> = factory.built_disciplines().to_vec();
        factory.build(&mut ctx).unwrap();

        assert_eq!(factory.built_disciplines(), first.as_slice());
        assert_eq!(first.len(), 3);
        let root = factory.node(factory.root().unwrap()).unwrap();
        assert_eq!(root.full_name(), "study");
        assert_eq!(root.kind(), DisciplineKind::Coupling);
        let names: Vec<_> = root
            .children()
            .iter()
            .map(|&c| factory.node(c).unwrap().full_name().to_string())
            .collect();
        assert_eq!(names, vec!["study.Disc1", "study.Disc2"]);
    }

    #[test]
    fn root_not_named_after_study_is_nested_under_it() {
        let (mut dm, mut ns, config) = (
            DataManager::new(),
            NamespaceManager::new(),
            EngineConfig::default(),
        );
        let mut ctx = context(&mut dm, &mut ns, &config);
        let mut factory = Factory::new();
        factory.set_root_builder(Builder::discipline("Disc1", Disc1::default));
        factory.build(&mut ctx).unwrap();
        assert!(factory.find("study.Disc1").is_some());
    }

    #[test]
    fn clean_detaches_subtree_from_parent_and_registry() {
        let (mut dm, mut ns, config) = (
            DataManager::new(),
            NamespaceManager::new(),
            EngineConfig::default(),
        );
        let mut ctx = context(&mut dm, &mut ns, &config);
        let mut factory = Factory::new();
        factory.set_root_builder(root_builder());
        factory.build(&mut ctx).unwrap();

        let root = factory.root().unwrap();
        let disc1 = factory.find("study.Disc1").unwrap();
        factory.clean_children(root, &[disc1], ctx.dm, ctx.ns);

        assert!(factory.node(disc1).is_none());
        assert!(!factory.built_disciplines().contains(&disc1));
        assert_eq!(factory.node(root).unwrap().children().len(), 1);
        assert!(ctx.dm.discipline_id("study.Disc1").is_none());
    }

    #[test]
    fn clean_releases_associated_namespaces() {
        let (mut dm, mut ns, config) = (
            DataManager::new(),
            NamespaceManager::new(),
            EngineConfig::default(),
        );
        let mut ctx = context(&mut dm, &mut ns, &config);
        let mut factory = Factory::new();
        factory.set_root_builder(Builder::coupling(
            "study",
            vec![Builder::discipline("Disc1", Disc1::default).with_namespace("ns_ac", "study.sub")],
        ));
        factory.build(&mut ctx).unwrap();
        assert_eq!(ctx.ns.len(), 1);

        let root = factory.root().unwrap();
        let disc1 = factory.find("study.Disc1").unwrap();
        factory.clean_children(root, &[disc1], ctx.dm, ctx.ns);
        assert!(ctx.ns.is_empty());
    }

    #[test]
    fn missing_root_builder_is_reported() {
        let (mut dm, mut ns, config) = (
            DataManager::new(),
            NamespaceManager::new(),
            EngineConfig::default(),
        );
        let mut ctx = context(&mut dm, &mut ns, &config);
        let mut factory = Factory::new();
        assert!(matches!(
            factory.build(&mut ctx),
            Err(EngineError::NoRootProcess)
        ));
    }

    #[test]
    fn duplicate_sibling_names_are_rejected() {
        let (mut dm, mut ns, config) = (
            DataManager::new(),
            NamespaceManager::new(),
            EngineConfig::default(),
        );
        let mut ctx = context(&mut dm, &mut ns, &config);
        let mut factory = Factory::new();
        factory.set_root_builder(Builder::coupling(
            "study",
            vec![
                Builder::discipline("Disc1", Disc1::default),
                Builder::discipline("Disc1", Disc1::default),
            ],
        ));
        assert!(matches!(
            factory.build(&mut ctx),
            Err(EngineError::Config(ConfigError::DuplicateDiscipline(name))) if name == "study.Disc1"
        ));
    }
}
