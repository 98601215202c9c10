use super::ids::{DisciplineId, NamespaceId, VarId};
use super::namespace::compose_ns;
use super::value::{Value, VarType};
use super::variable::{ConnectorDescriptor, IoType, Variable, VariableSpec};
use slotmap::SlotMap;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DataError {
    #[error("Unknown variable key: {0}")]
    UnknownKey(String),

    #[error("Variable '{0}' has no value")]
    NoValue(String),

    #[error("Variable '{path}' is already written by '{existing}'; '{requested}' cannot also write it")]
    DuplicateOutput {
        path: String,
        existing: String,
        requested: String,
    },

    #[error("Type mismatch for '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: VarType,
        found: VarType,
    },

    #[error("Invalid inputs:\n{}", .0.join("\n"))]
    InvalidInputs(Vec<String>),

    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("Value serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Field of a variable addressed by [`DataManager::set_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarField {
    Value,
    Default,
    Unit,
    Editable,
    Optional,
}

impl VarField {
    fn name(&self) -> &'static str {
        match self {
            VarField::Value => "value",
            VarField::Default => "default",
            VarField::Unit => "unit",
            VarField::Editable => "editable",
            VarField::Optional => "optional",
        }
    }
}

/// Values exchanged during execution, keyed by variable id.
pub type LocalData = HashMap<VarId, Value>;

/// The single store of every variable of a study.
///
/// Variables are kept in a slot map and indexed by full path. Each variable has at most one
/// owning (writing) discipline and any number of readers; it is dropped once the last
/// discipline referencing it releases it.
#[derive(Debug, Clone, Default)]
pub struct DataManager {
    vars: SlotMap<VarId, Variable>,
    index: HashMap<String, VarId>,
    disciplines: BTreeMap<String, DisciplineId>,
    discipline_names: HashMap<DisciplineId, String>,
}

impl DataManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every variable and discipline registration.
    pub fn reset(&mut self) {
        self.vars.clear();
        self.index.clear();
        self.disciplines.clear();
        self.discipline_names.clear();
    }

    pub fn register_discipline(&mut self, full_name: &str, id: DisciplineId) {
        self.disciplines.insert(full_name.to_string(), id);
        self.discipline_names.insert(id, full_name.to_string());
    }

    pub fn unregister_discipline(&mut self, id: DisciplineId) {
        if let Some(name) = self.discipline_names.remove(&id) {
            self.disciplines.remove(&name);
        }
    }

    pub fn discipline_id(&self, full_name: &str) -> Option<DisciplineId> {
        self.disciplines.get(full_name).copied()
    }

    pub fn discipline_name(&self, id: DisciplineId) -> Option<&str> {
        self.discipline_names.get(&id).map(String::as_str)
    }

    pub fn disciplines(&self) -> &BTreeMap<String, DisciplineId> {
        &self.disciplines
    }

    /// Registers a declaration of `discipline` at `full_path`.
    ///
    /// The first declaration creates the variable. Later declarations add a reader (inputs)
    /// or claim ownership (outputs); a second distinct writer is rejected.
    pub fn declare(
        &mut self,
        full_path: &str,
        spec: &VariableSpec,
        io_type: IoType,
        namespace: Option<NamespaceId>,
        discipline: DisciplineId,
    ) -> Result<VarId, DataError> {
        let id = match self.index.get(full_path) {
            Some(&id) => id,
            None => {
                let id = self.vars.insert(Variable::from_spec(
                    full_path.to_string(),
                    spec,
                    io_type,
                    namespace,
                ));
                self.index.insert(full_path.to_string(), id);
                debug!(path = full_path, "Variable registered");
                id
            }
        };

        if io_type == IoType::Out {
            let existing = self.vars.get(id).and_then(|v| v.owner);
            if let Some(owner) = existing.filter(|&o| o != discipline) {
                return Err(DataError::DuplicateOutput {
                    path: full_path.to_string(),
                    existing: self.discipline_name(owner).unwrap_or("?").to_string(),
                    requested: self.discipline_name(discipline).unwrap_or("?").to_string(),
                });
            }
        }

        let var = self
            .vars
            .get_mut(id)
            .ok_or_else(|| DataError::UnknownKey(full_path.to_string()))?;
        match io_type {
            IoType::Out => {
                var.owner = Some(discipline);
                var.io_type = IoType::Out;
            }
            IoType::In => {
                if !var.readers.contains(&discipline) {
                    var.readers.push(discipline);
                }
            }
        }
        if var.default.is_none() {
            var.default = spec.default.clone();
        }
        if var.unit.is_none() {
            var.unit = spec.unit.clone();
        }
        if var.connector.is_none() {
            var.connector = spec.connector.clone();
        }
        if var.namespace.is_none() {
            var.namespace = namespace;
        }
        var.structuring |= spec.structuring;
        Ok(id)
    }

    /// Removes `discipline`'s claim on a variable, dropping the variable once nobody uses it.
    pub fn release(&mut self, id: VarId, discipline: DisciplineId) {
        let Some(var) = self.vars.get_mut(id) else {
            return;
        };
        if var.owner == Some(discipline) {
            var.owner = None;
            var.io_type = IoType::In;
        }
        var.readers.retain(|&r| r != discipline);
        if var.is_orphan() {
            let path = var.full_path.clone();
            self.vars.remove(id);
            self.index.remove(&path);
            debug!(path = %path, "Variable released");
        }
    }

    pub fn var_id(&self, full_path: &str) -> Option<VarId> {
        self.index.get(full_path).copied()
    }

    pub fn variable(&self, id: VarId) -> Option<&Variable> {
        self.vars.get(id)
    }

    pub fn variable_by_path(&self, full_path: &str) -> Result<&Variable, DataError> {
        self.var_id(full_path)
            .and_then(|id| self.vars.get(id))
            .ok_or_else(|| DataError::UnknownKey(full_path.to_string()))
    }

    pub fn variables(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Returns the value in effect for `full_path` (set value, else default).
    pub fn get_value(&self, full_path: &str) -> Result<&Value, DataError> {
        self.try_get_value(full_path)?
            .ok_or_else(|| DataError::NoValue(full_path.to_string()))
    }

    pub fn try_get_value(&self, full_path: &str) -> Result<Option<&Value>, DataError> {
        Ok(self.variable_by_path(full_path)?.effective_value())
    }

    pub fn value_by_id(&self, id: VarId) -> Option<&Value> {
        self.vars.get(id).and_then(Variable::effective_value)
    }

    pub fn set_value(&mut self, full_path: &str, value: Value) -> Result<(), DataError> {
        self.set_data(full_path, VarField::Value, value)
    }

    pub fn set_value_by_id(&mut self, id: VarId, value: Value) {
        if let Some(var) = self.vars.get_mut(id) {
            var.value = Some(value);
        }
    }

    /// Sets one field of the variable at `full_path`.
    ///
    /// `Unit` expects a string value, `Editable` and `Optional` expect booleans.
    pub fn set_data(
        &mut self,
        full_path: &str,
        field: VarField,
        value: Value,
    ) -> Result<(), DataError> {
        let id = self
            .var_id(full_path)
            .ok_or_else(|| DataError::UnknownKey(full_path.to_string()))?;
        let var = self
            .vars
            .get_mut(id)
            .ok_or_else(|| DataError::UnknownKey(full_path.to_string()))?;
        let mismatch = |expected: VarType, found: &Value| DataError::TypeMismatch {
            path: full_path.to_string(),
            expected,
            found: found.var_type(),
        };
        match field {
            VarField::Value => var.value = Some(value),
            VarField::Default => var.default = Some(value),
            VarField::Unit => match value {
                Value::String(unit) => var.unit = Some(unit),
                other => return Err(mismatch(VarType::String, &other)),
            },
            VarField::Editable => match value {
                Value::Bool(flag) => var.editable = flag,
                other => return Err(mismatch(VarType::Bool, &other)),
            },
            VarField::Optional => match value {
                Value::Bool(flag) => var.optional = flag,
                other => return Err(mismatch(VarType::Bool, &other)),
            },
        }
        debug!(path = full_path, field = field.name(), "Variable field updated");
        Ok(())
    }

    pub fn set_connector(
        &mut self,
        id: VarId,
        connector: ConnectorDescriptor,
    ) -> Result<(), DataError> {
        let var = self
            .vars
            .get_mut(id)
            .ok_or_else(|| DataError::UnknownKey(format!("{id:?}")))?;
        var.connector = Some(connector);
        Ok(())
    }

    /// Sets the values of every known key; unknown keys are rejected.
    pub fn set_values_from_dict(
        &mut self,
        values: &BTreeMap<String, Value>,
    ) -> Result<(), DataError> {
        for (path, value) in values {
            self.set_value(path, value.clone())?;
        }
        Ok(())
    }

    /// Re-keys a path-indexed map by variable id, skipping paths that are not registered.
    pub fn convert_data_dict_with_ids<T: Clone>(
        &self,
        data: &BTreeMap<String, T>,
    ) -> HashMap<VarId, T> {
        data.iter()
            .filter_map(|(path, value)| self.var_id(path).map(|id| (id, value.clone())))
            .collect()
    }

    /// All effective values keyed by full path.
    pub fn data_dict(&self) -> BTreeMap<String, Value> {
        self.vars
            .values()
            .filter_map(|v| v.effective_value().map(|val| (v.full_path.clone(), val.clone())))
            .collect()
    }

    /// Snapshot of all effective values keyed by id, used as execution input.
    pub fn local_data(&self) -> LocalData {
        self.vars
            .iter()
            .filter_map(|(id, v)| v.effective_value().map(|val| (id, val.clone())))
            .collect()
    }

    /// Writes back execution results. Values equal to the one already in effect are skipped
    /// so that untouched defaults stay defaults.
    pub fn apply_local_data(&mut self, data: &LocalData) {
        for (&id, value) in data {
            if let Some(var) = self.vars.get_mut(id) {
                if var.effective_value() != Some(value) {
                    var.value = Some(value.clone());
                }
            }
        }
    }

    /// Re-paths every variable bound to namespace generation `old` onto `new`.
    ///
    /// # Return
    ///
    /// The mapping from old full path to new full path for every moved variable.
    pub fn remap_namespace(
        &mut self,
        old: NamespaceId,
        new: NamespaceId,
        new_value: &str,
    ) -> BTreeMap<String, String> {
        let bound: Vec<VarId> = self
            .vars
            .iter()
            .filter(|(_, v)| v.namespace == Some(old))
            .map(|(id, _)| id)
            .collect();

        let mut moved = BTreeMap::new();
        for id in bound {
            let Some(var) = self.vars.get_mut(id) else {
                continue;
            };
            let new_path = compose_ns([new_value, var.name.as_str()]);
            if self.index.contains_key(&new_path) {
                warn!(
                    from = %var.full_path,
                    to = %new_path,
                    "Namespace remap target already exists, variable left in place"
                );
                continue;
            }
            let old_path = std::mem::replace(&mut var.full_path, new_path.clone());
            var.namespace = Some(new);
            self.index.remove(&old_path);
            self.index.insert(new_path.clone(), id);
            moved.insert(old_path, new_path);
        }
        moved
    }

    /// Checks every input for a missing value, a type mismatch or a value outside its
    /// allowed set.
    ///
    /// # Arguments
    ///
    /// * `raise` - If `true`, any problem is returned as [`DataError::InvalidInputs`];
    ///   otherwise problems are logged as warnings and returned.
    pub fn check_inputs(&self, raise: bool) -> Result<Vec<String>, DataError> {
        let mut errors: Vec<String> = Vec::new();
        for var in self.vars.values().filter(|v| v.io_type == IoType::In) {
            match var.effective_value() {
                None if !var.optional => {
                    errors.push(format!("Variable: {} has no value", var.full_path));
                }
                None => {}
                Some(value) => {
                    if !var.var_type.accepts(value) {
                        errors.push(format!(
                            "Variable: {} expects type {}, found {}",
                            var.full_path,
                            var.var_type,
                            value.var_type()
                        ));
                    } else if let Some(allowed) = &var.possible_values {
                        if !allowed.contains(value) {
                            errors.push(format!(
                                "Variable: {} value {:?} not in possible values {:?}",
                                var.full_path, value, allowed
                            ));
                        }
                    }
                }
            }
        }
        errors.sort();

        if !errors.is_empty() {
            if raise {
                return Err(DataError::InvalidInputs(errors));
            }
            for error in &errors {
                warn!("{}", error);
            }
        }
        Ok(errors)
    }

    /// Writes one CSV row per variable: key, io type, type, unit and JSON-encoded value.
    pub fn export_csv<W, F>(&self, writer: W, key_fn: F) -> Result<(), DataError>
    where
        W: Write,
        F: Fn(&str) -> String,
    {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["variable", "io_type", "type", "unit", "value"])?;

        let mut vars: Vec<&Variable> = self.vars.values().collect();
        vars.sort_by(|a, b| a.full_path.cmp(&b.full_path));
        for var in vars {
            let value = match var.effective_value() {
                Some(v) => serde_json::to_string(v)?,
                None => String::new(),
            };
            let io_type = match var.io_type {
                IoType::In => "in",
                IoType::Out => "out",
            };
            csv_writer.write_record([
                key_fn(&var.full_path),
                io_type.to_string(),
                var.var_type.to_string(),
                var.unit.clone().unwrap_or_default(),
                value,
            ])?;
        }
        csv_writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn two_disciplines() -> (DataManager, DisciplineId, DisciplineId) {
        let mut ids: SlotMap<DisciplineId, ()> = SlotMap::with_key();
        let d1 = ids.insert(());
        let d2 = ids.insert(());
        let mut dm = DataManager::new();
        dm.register_discipline("study.Disc1", d1);
        dm.register_discipline("study.Disc2", d2);
        (dm, d1, d2)
    }

    #[test]
    fn one_path_maps_to_one_id_shared_by_writer_and_reader() {
        let (mut dm, d1, d2) = two_disciplines();
        let spec = VariableSpec::float("y");
        let out = dm.declare("study.y", &spec, IoType::Out, None, d1).unwrap();
        let inp = dm.declare("study.y", &spec, IoType::In, None, d2).unwrap();

        assert_eq!(out, inp);
        let var = dm.variable(out).unwrap();
        assert_eq!(var.owner, Some(d1));
        assert_eq!(var.readers, vec![d2]);
        assert_eq!(var.io_type, IoType::Out);
    }

    #[test]
    fn second_writer_is_rejected() {
        let (mut dm, d1, d2) = two_disciplines();
        let spec = VariableSpec::float("y");
        dm.declare("study.y", &spec, IoType::Out, None, d1).unwrap();
        let err = dm.declare("study.y", &spec, IoType::Out, None, d2).unwrap_err();
        assert!(matches!(
            err,
            DataError::DuplicateOutput { ref existing, .. } if existing == "study.Disc1"
        ));
    }

    #[test]
    fn release_drops_orphan_variables_only() {
        let (mut dm, d1, d2) = two_disciplines();
        let spec = VariableSpec::float("y");
        let id = dm.declare("study.y", &spec, IoType::Out, None, d1).unwrap();
        dm.declare("study.y", &spec, IoType::In, None, d2).unwrap();

        dm.release(id, d1);
        assert_eq!(dm.variable(id).unwrap().io_type, IoType::In);
        dm.release(id, d2);
        assert!(dm.variable(id).is_none());
        assert!(dm.var_id("study.y").is_none());
    }

    #[test]
    fn get_value_on_unknown_key_fails_and_default_is_visible() {
        let (mut dm, d1, _) = two_disciplines();
        let spec = VariableSpec::float("a").default_value(2.0);
        dm.declare("study.Disc1.a", &spec, IoType::In, None, d1).unwrap();

        assert!(matches!(
            dm.get_value("study.nope"),
            Err(DataError::UnknownKey(_))
        ));
        assert_eq!(dm.get_value("study.Disc1.a").unwrap(), &Value::Float(2.0));
        dm.set_value("study.Disc1.a", Value::Float(5.0)).unwrap();
        assert_eq!(dm.get_value("study.Disc1.a").unwrap(), &Value::Float(5.0));
    }

    #[test]
    fn set_data_validates_field_payload() {
        let (mut dm, d1, _) = two_disciplines();
        dm.declare("study.x", &VariableSpec::float("x"), IoType::In, None, d1)
            .unwrap();
        dm.set_data("study.x", VarField::Unit, Value::from("m")).unwrap();
        assert_eq!(
            dm.variable_by_path("study.x").unwrap().unit.as_deref(),
            Some("m")
        );
        assert!(matches!(
            dm.set_data("study.x", VarField::Optional, Value::Float(1.0)),
            Err(DataError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn convert_data_dict_with_ids_skips_unknown_keys() {
        let (mut dm, d1, _) = two_disciplines();
        let id = dm
            .declare("study.x", &VariableSpec::float("x"), IoType::In, None, d1)
            .unwrap();
        let mut data = BTreeMap::new();
        data.insert("study.x".to_string(), Value::Float(1.0));
        data.insert("study.unknown".to_string(), Value::Float(2.0));

        let converted = dm.convert_data_dict_with_ids(&data);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted.get(&id), Some(&Value::Float(1.0)));
    }

    #[test]
    fn check_inputs_reports_missing_and_mistyped_inputs() {
        let (mut dm, d1, _) = two_disciplines();
        dm.declare("study.x", &VariableSpec::float("x"), IoType::In, None, d1)
            .unwrap();
        dm.declare(
            "study.flag",
            &VariableSpec::new("flag", VarType::Bool),
            IoType::In,
            None,
            d1,
        )
        .unwrap();
        dm.declare(
            "study.opt",
            &VariableSpec::float("opt").optional(),
            IoType::In,
            None,
            d1,
        )
        .unwrap();
        dm.set_value("study.flag", Value::Float(1.0)).unwrap();

        let warnings = dm.check_inputs(false).unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(matches!(
            dm.check_inputs(true),
            Err(DataError::InvalidInputs(list)) if list.len() == 2
        ));
    }

    #[test]
    fn check_inputs_enforces_possible_values() {
        let (mut dm, d1, _) = two_disciplines();
        let spec = VariableSpec::new("mode", VarType::String)
            .possible_values(vec![Value::from("a"), Value::from("b")])
            .default_value("c");
        dm.declare("study.mode", &spec, IoType::In, None, d1).unwrap();
        assert_eq!(dm.check_inputs(false).unwrap().len(), 1);
        dm.set_value("study.mode", Value::from("b")).unwrap();
        assert!(dm.check_inputs(true).unwrap().is_empty());
    }

    #[test]
    fn remap_namespace_moves_bound_variables_and_keeps_values() {
        let (mut dm, d1, _) = two_disciplines();
        let mut namespaces = crate::core::namespace::NamespaceManager::new();
        let old = namespaces.add_ns("ns_ac", "study");
        let id = dm
            .declare(
                "study.x",
                &VariableSpec::float("x").shared("ns_ac"),
                IoType::In,
                Some(old.id),
                d1,
            )
            .unwrap();
        dm.set_value("study.x", Value::Float(3.0)).unwrap();

        let new = namespaces.add_ns("ns_ac", "study.sub");
        let moved = dm.remap_namespace(old.id, new.id, "study.sub");

        assert_eq!(moved.get("study.x").map(String::as_str), Some("study.sub.x"));
        assert_eq!(dm.var_id("study.sub.x"), Some(id));
        assert!(dm.var_id("study.x").is_none());
        assert_eq!(dm.get_value("study.sub.x").unwrap(), &Value::Float(3.0));
    }

    #[test]
    fn apply_local_data_keeps_untouched_defaults_as_defaults() {
        let (mut dm, d1, _) = two_disciplines();
        let a = dm
            .declare(
                "study.a",
                &VariableSpec::float("a").default_value(1.0),
                IoType::In,
                None,
                d1,
            )
            .unwrap();
        let y = dm
            .declare("study.y", &VariableSpec::float("y"), IoType::Out, None, d1)
            .unwrap();

        let mut data = dm.local_data();
        data.insert(y, Value::Float(4.0));
        dm.apply_local_data(&data);

        assert_eq!(dm.variable(a).unwrap().value, None);
        assert_eq!(dm.variable(y).unwrap().value, Some(Value::Float(4.0)));
    }

    #[test]
    fn export_csv_writes_one_row_per_variable() {
        let (mut dm, d1, _) = two_disciplines();
        dm.declare(
            "study.x",
            &VariableSpec::float("x").unit("m"),
            IoType::In,
            None,
            d1,
        )
        .unwrap();
        dm.set_value("study.x", Value::Float(1.5)).unwrap();

        let mut buffer = Vec::new();
        dm.export_csv(&mut buffer, |k| k.replace("study", "<study_ph>"))
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "variable,io_type,type,unit,value");
        assert!(lines[1].starts_with("<study_ph>.x,in,float,m,"));
        assert!(lines[1].contains("1.5"));
    }
}
