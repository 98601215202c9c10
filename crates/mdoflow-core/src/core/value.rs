use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Type tag attached to every declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    Float,
    Int,
    Bool,
    String,
    Array,
    StringList,
    List,
    Dict,
    DataFrame,
}

impl VarType {
    /// Checks whether a value can be stored in a variable of this type.
    ///
    /// Integers are accepted where floats are expected; every other type must match exactly.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (VarType::Float, Value::Float(_) | Value::Int(_))
                | (VarType::Int, Value::Int(_))
                | (VarType::Bool, Value::Bool(_))
                | (VarType::String, Value::String(_))
                | (VarType::Array, Value::Array(_))
                | (VarType::StringList, Value::StringList(_))
                | (VarType::List, Value::List(_))
                | (VarType::Dict, Value::Dict(_))
                | (VarType::DataFrame, Value::DataFrame(_))
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, VarType::Float | VarType::Int | VarType::Array)
    }
}

impl fmt::Display for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VarType::Float => "float",
            VarType::Int => "int",
            VarType::Bool => "bool",
            VarType::String => "string",
            VarType::Array => "array",
            VarType::StringList => "string_list",
            VarType::List => "list",
            VarType::Dict => "dict",
            VarType::DataFrame => "dataframe",
        };
        f.write_str(name)
    }
}

/// A small column-oriented table used for scenario lists, samples and design spaces.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataFrame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl DataFrame {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row. Returns `false` and leaves the frame untouched if the row length does
    /// not match the number of columns.
    pub fn push_row(&mut self, row: Vec<Value>) -> bool {
        if row.len() != self.columns.len() {
            return false;
        }
        self.rows.push(row);
        true
    }

    pub fn with_row(mut self, row: Vec<Value>) -> Self {
        self.push_row(row);
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(col))
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let col = self.column_index(name)?;
        Some(self.rows.iter().filter_map(|r| r.get(col)).collect())
    }
}

/// Dynamically typed payload stored in the data manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
    Array(Vec<f64>),
    StringList(Vec<String>),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    DataFrame(DataFrame),
}

impl Value {
    pub fn var_type(&self) -> VarType {
        match self {
            Value::Float(_) => VarType::Float,
            Value::Int(_) => VarType::Int,
            Value::Bool(_) => VarType::Bool,
            Value::String(_) => VarType::String,
            Value::Array(_) => VarType::Array,
            Value::StringList(_) => VarType::StringList,
            Value::List(_) => VarType::List,
            Value::Dict(_) => VarType::Dict,
            Value::DataFrame(_) => VarType::DataFrame,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Value::StringList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dataframe(&self) -> Option<&DataFrame> {
        match self {
            Value::DataFrame(v) => Some(v),
            _ => None,
        }
    }

    /// Flattens a numeric value into a vector of `f64`.
    ///
    /// # Return
    ///
    /// `Some(vec)` for `Float`, `Int` and `Array` values, `None` for everything else.
    pub fn to_vector(&self) -> Option<Vec<f64>> {
        match self {
            Value::Float(v) => Some(vec![*v]),
            Value::Int(v) => Some(vec![*v as f64]),
            Value::Array(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Number of scalar components once flattened, `None` if the value is not numeric.
    pub fn numeric_len(&self) -> Option<usize> {
        match self {
            Value::Float(_) | Value::Int(_) => Some(1),
            Value::Array(v) => Some(v.len()),
            _ => None,
        }
    }

    /// Rebuilds a value shaped like `self` from flattened components.
    ///
    /// Integer templates come back as floats since solver iterates are continuous.
    pub fn with_vector(&self, data: &[f64]) -> Option<Value> {
        match self {
            Value::Float(_) | Value::Int(_) if data.len() == 1 => Some(Value::Float(data[0])),
            Value::Array(v) if v.len() == data.len() => Some(Value::Array(data.to_vec())),
            _ => None,
        }
    }

    /// Returns `true` if any numeric component, at any depth, is NaN.
    pub fn has_nan(&self) -> bool {
        match self {
            Value::Float(v) => v.is_nan(),
            Value::Array(v) => v.iter().any(|x| x.is_nan()),
            Value::List(items) => items.iter().any(Value::has_nan),
            Value::Dict(map) => map.values().any(Value::has_nan),
            Value::DataFrame(df) => df.rows().iter().flatten().any(Value::has_nan),
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::StringList(v)
    }
}

impl From<DataFrame> for Value {
    fn from(v: DataFrame) -> Self {
        Value::DataFrame(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_type_accepts_integers_but_not_strings() {
        assert!(VarType::Float.accepts(&Value::Int(3)));
        assert!(VarType::Float.accepts(&Value::Float(3.0)));
        assert!(!VarType::Float.accepts(&Value::from("3")));
        assert!(!VarType::Int.accepts(&Value::Float(3.0)));
    }

    #[test]
    fn with_vector_rebuilds_shape_of_template() {
        let template = Value::Array(vec![0.0, 0.0]);
        assert_eq!(
            template.with_vector(&[1.0, 2.0]),
            Some(Value::Array(vec![1.0, 2.0]))
        );
        assert_eq!(template.with_vector(&[1.0]), None);
        assert_eq!(Value::Int(1).with_vector(&[4.5]), Some(Value::Float(4.5)));
        assert_eq!(Value::from("a").to_vector(), None);
    }

    #[test]
    fn has_nan_inspects_nested_containers() {
        let mut dict = BTreeMap::new();
        dict.insert("a".to_string(), Value::Array(vec![1.0, f64::NAN]));
        assert!(Value::Dict(dict).has_nan());
        assert!(!Value::List(vec![Value::Float(1.0)]).has_nan());
    }

    #[test]
    fn dataframe_rejects_rows_of_wrong_length() {
        let mut df = DataFrame::new(["a", "b"]);
        assert!(!df.push_row(vec![Value::Float(1.0)]));
        assert!(df.push_row(vec![Value::Float(1.0), Value::Float(2.0)]));
        assert_eq!(df.n_rows(), 1);
        assert_eq!(df.get(0, "b"), Some(&Value::Float(2.0)));
        assert_eq!(df.get(0, "c"), None);
    }

    #[test]
    fn values_round_trip_through_json() {
        let df = DataFrame::new(["name"]).with_row(vec![Value::from("A")]);
        let value = Value::List(vec![Value::Int(2), Value::DataFrame(df)]);
        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
