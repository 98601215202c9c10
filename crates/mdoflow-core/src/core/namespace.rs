use super::ids::NamespaceId;
use slotmap::SlotMap;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum NamespaceError {
    #[error("Namespace '{name}' required by '{discipline}' is not defined")]
    Undefined { name: String, discipline: String },

    #[error("Unknown namespace id")]
    UnknownId,
}

/// An immutable `(name, value)` pair. Rebinding a name creates a new `Namespace`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub value: String,
}

/// Result of binding a shared namespace name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NsBinding {
    pub id: NamespaceId,
    /// Previous generation of the same name, if its value differed.
    pub replaced: Option<NamespaceId>,
}

/// Registry of namespace generations and of the study-wide shared bindings.
///
/// Namespaces created with [`NamespaceManager::create`] are not shared; they are attached to
/// individual disciplines (scatter instances, builder-associated namespaces) and shadow the
/// shared bindings for the subtree below that discipline.
#[derive(Debug, Clone, Default)]
pub struct NamespaceManager {
    namespaces: SlotMap<NamespaceId, Namespace>,
    shared: HashMap<String, NamespaceId>,
}

impl NamespaceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a shared namespace name to a value.
    ///
    /// Binding the same value again is a no-op returning the current id. A different value
    /// creates a new generation and reports the replaced id so that dependent variables can
    /// be re-pathed.
    pub fn add_ns(&mut self, name: &str, value: &str) -> NsBinding {
        if let Some(&current) = self.shared.get(name) {
            if self.namespaces.get(current).is_some_and(|ns| ns.value == value) {
                return NsBinding {
                    id: current,
                    replaced: None,
                };
            }
        }
        let id = self.create(name, value);
        let replaced = self.shared.insert(name.to_string(), id);
        debug!(namespace = name, value, "Shared namespace bound");
        NsBinding { id, replaced }
    }

    /// Binds several shared namespaces at once.
    pub fn add_ns_def(&mut self, definitions: &BTreeMap<String, String>) -> Vec<NsBinding> {
        definitions
            .iter()
            .map(|(name, value)| self.add_ns(name, value))
            .collect()
    }

    /// Creates a namespace generation that is not registered as shared.
    pub fn create(&mut self, name: &str, value: &str) -> NamespaceId {
        self.namespaces.insert(Namespace {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    /// Frees a generation that is no longer referenced. Shared bindings are kept.
    pub fn release(&mut self, id: NamespaceId) -> Option<Namespace> {
        if self.shared.values().any(|&shared| shared == id) {
            return None;
        }
        self.namespaces.remove(id)
    }

    /// Number of live generations, shared or not.
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn get(&self, id: NamespaceId) -> Option<&Namespace> {
        self.namespaces.get(id)
    }

    pub fn value(&self, id: NamespaceId) -> Result<&str, NamespaceError> {
        self.namespaces
            .get(id)
            .map(|ns| ns.value.as_str())
            .ok_or(NamespaceError::UnknownId)
    }

    pub fn shared_id(&self, name: &str) -> Option<NamespaceId> {
        self.shared.get(name).copied()
    }

    pub fn shared_value(&self, name: &str) -> Option<&str> {
        self.shared_id(name)
            .and_then(|id| self.namespaces.get(id))
            .map(|ns| ns.value.as_str())
    }

    pub fn shared_namespaces(&self) -> BTreeMap<String, String> {
        self.shared
            .iter()
            .filter_map(|(name, &id)| {
                self.namespaces
                    .get(id)
                    .map(|ns| (name.clone(), ns.value.clone()))
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.namespaces.clear();
        self.shared.clear();
    }
}

/// Joins path segments with `.`, skipping empty ones.
pub fn compose_ns<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}
