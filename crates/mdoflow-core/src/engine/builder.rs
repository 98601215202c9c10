use super::driver::DriverStrategy;
use super::model::Model;
use super::scatter::ScatterMap;
use std::fmt;
use std::sync::Arc;

pub type ModelConstructor = Arc<dyn Fn() -> Arc<dyn Model> + Send + Sync>;

/// What a builder produces when invoked.
#[derive(Clone)]
pub enum BuilderKind {
    /// A leaf wrapping a freshly constructed model.
    Discipline(ModelConstructor),
    /// A coupling whose children are built from the nested builders.
    Coupling(Vec<Builder>),
    /// A driver replicating the nested builders once per name of a runtime list.
    Scatter {
        map: ScatterMap,
        builders: Vec<Builder>,
    },
    /// A driver repeatedly evaluating the sub-process built from the nested builders.
    EvalDriver {
        strategy: DriverStrategy,
        builders: Vec<Builder>,
    },
}

/// A reusable descriptor producing discipline nodes on demand.
///
/// The same builder may be invoked several times (once per scatter instance); each
/// invocation creates a distinct node and, for leaves, a distinct model.
#[derive(Clone)]
pub struct Builder {
    name: String,
    kind: BuilderKind,
    associated_namespaces: Vec<(String, String)>,
}

impl Builder {
    pub fn discipline<M, F>(name: impl Into<String>, constructor: F) -> Self
    where
        M: Model + 'static,
        F: Fn() -> M + Send + Sync + 'static,
    {
        let constructor: ModelConstructor = Arc::new(move || Arc::new(constructor()));
        Self::new(name, BuilderKind::Discipline(constructor))
    }

    pub fn coupling(name: impl Into<String>, builders: Vec<Builder>) -> Self {
        Self::new(name, BuilderKind::Coupling(builders))
    }

    pub fn scatter(name: impl Into<String>, map: ScatterMap, builders: Vec<Builder>) -> Self {
        Self::new(name, BuilderKind::Scatter { map, builders })
    }

    pub fn eval_driver(
        name: impl Into<String>,
        strategy: DriverStrategy,
        builders: Vec<Builder>,
    ) -> Self {
        Self::new(name, BuilderKind::EvalDriver { strategy, builders })
    }

    fn new(name: impl Into<String>, kind: BuilderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            associated_namespaces: Vec::new(),
        }
    }

    /// Binds `name` to `value` for the nodes built from this builder and their subtree.
    pub fn with_namespace(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.associated_namespaces.push((name.into(), value.into()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &BuilderKind {
        &self.kind
    }

    pub fn associated_namespaces(&self) -> &[(String, String)] {
        &self.associated_namespaces
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            BuilderKind::Discipline(_) => "Discipline",
            BuilderKind::Coupling(_) => "Coupling",
            BuilderKind::Scatter { .. } => "Scatter",
            BuilderKind::EvalDriver { .. } => "EvalDriver",
        };
        f.debug_struct("Builder")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("associated_namespaces", &self.associated_namespaces)
            .finish()
    }
}
