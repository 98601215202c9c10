use super::ids::{DisciplineId, NamespaceId};
use super::value::{Value, VarType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    In,
    Out,
}

/// Where a variable's full path comes from.
///
/// `Local` and `Internal` variables live under the declaring discipline's full name;
/// `Shared` variables live under the value of a named namespace. `Internal` variables are
/// numerical settings that are not meant to be exchanged between disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Local,
    Shared,
    Internal,
}

/// Where a variable's value can be fetched from outside the study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorDescriptor {
    pub connector_id: String,
    pub dataset_id: String,
    /// Key inside the dataset. Defaults to the variable short name.
    #[serde(default)]
    pub key: Option<String>,
}

/// Declaration of one input or output, as published by a discipline.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    pub var_type: VarType,
    pub visibility: Visibility,
    /// Namespace name for shared variables.
    pub namespace: Option<String>,
    pub default: Option<Value>,
    pub unit: Option<String>,
    pub structuring: bool,
    pub numerical: bool,
    pub optional: bool,
    pub editable: bool,
    pub possible_values: Option<Vec<Value>>,
    pub connector: Option<ConnectorDescriptor>,
}

impl VariableSpec {
    pub fn new(name: impl Into<String>, var_type: VarType) -> Self {
        Self {
            name: name.into(),
            var_type,
            visibility: Visibility::Local,
            namespace: None,
            default: None,
            unit: None,
            structuring: false,
            numerical: false,
            optional: false,
            editable: true,
            possible_values: None,
            connector: None,
        }
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, VarType::Float)
    }

    pub fn shared(mut self, namespace: impl Into<String>) -> Self {
        self.visibility = Visibility::Shared;
        self.namespace = Some(namespace.into());
        self
    }

    pub fn internal(mut self) -> Self {
        self.visibility = Visibility::Internal;
        self.namespace = None;
        self.editable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn structuring(mut self) -> Self {
        self.structuring = true;
        self
    }

    pub fn numerical(mut self) -> Self {
        self.numerical = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn possible_values(mut self, values: Vec<Value>) -> Self {
        self.possible_values = Some(values);
        self
    }

    pub fn connector(mut self, connector: ConnectorDescriptor) -> Self {
        self.connector = Some(connector);
        self
    }
}

/// A variable as stored in the data manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub full_path: String,
    pub name: String,
    pub io_type: IoType,
    pub var_type: VarType,
    pub visibility: Visibility,
    /// Namespace the path was resolved from, for shared variables.
    pub namespace: Option<NamespaceId>,
    pub structuring: bool,
    pub value: Option<Value>,
    pub default: Option<Value>,
    pub unit: Option<String>,
    pub numerical: bool,
    pub optional: bool,
    pub editable: bool,
    pub possible_values: Option<Vec<Value>>,
    pub connector: Option<ConnectorDescriptor>,
    /// The single discipline allowed to write this variable.
    pub owner: Option<DisciplineId>,
    pub readers: Vec<DisciplineId>,
}

impl Variable {
    pub(crate) fn from_spec(
        full_path: String,
        spec: &VariableSpec,
        io_type: IoType,
        namespace: Option<NamespaceId>,
    ) -> Self {
        Self {
            full_path,
            name: spec.name.clone(),
            io_type,
            var_type: spec.var_type,
            visibility: spec.visibility,
            namespace,
            structuring: spec.structuring,
            value: None,
            default: spec.default.clone(),
            unit: spec.unit.clone(),
            numerical: spec.numerical,
            optional: spec.optional,
            editable: spec.editable,
            possible_values: spec.possible_values.clone(),
            connector: spec.connector.clone(),
            owner: None,
            readers: Vec::new(),
        }
    }

    /// The value in effect: the explicitly set value, else the default.
    pub fn effective_value(&self) -> Option<&Value> {
        self.value.as_ref().or(self.default.as_ref())
    }

    pub fn is_orphan(&self) -> bool {
        self.owner.is_none() && self.readers.is_empty()
    }
}
