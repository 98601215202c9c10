use super::error::ModelError;
use crate::core::schema::SchemaDelta;
use crate::core::value::Value;
use crate::core::variable::VariableSpec;
use nalgebra::DMatrix;
use std::collections::{BTreeMap, HashMap};

/// The contract a user computation must satisfy to be wrapped as a leaf discipline.
///
/// Inputs and outputs are addressed by short name; the engine resolves them to full paths
/// through the discipline's namespaces.
pub trait Model: Send + Sync {
    fn desc_in(&self) -> Vec<VariableSpec> {
        Vec::new()
    }

    fn desc_out(&self) -> Vec<VariableSpec> {
        Vec::new()
    }

    /// Declares extra inputs and outputs from the current value of structuring inputs.
    ///
    /// Called on every configuration pass; returning a different delta when a structuring
    /// input changes is how a model grows or shrinks its schema.
    fn setup(&self, _ctx: &SetupContext<'_>) -> Result<Option<SchemaDelta>, ModelError> {
        Ok(None)
    }

    fn run(&self, ctx: &mut RunContext) -> Result<(), ModelError>;

    /// Fills analytic partial derivatives at the inputs held by `ctx`.
    ///
    /// # Return
    ///
    /// `Ok(false)` when the model has no analytic derivatives, in which case finite
    /// differences are used.
    fn compute_jacobian(
        &self,
        _ctx: &RunContext,
        _jacobian: &mut PartialDerivatives,
    ) -> Result<bool, ModelError> {
        Ok(false)
    }
}

/// Read-only view of a discipline's current input values during configuration.
pub struct SetupContext<'a> {
    inputs: HashMap<&'a str, &'a Value>,
}

impl<'a> SetupContext<'a> {
    pub(crate) fn new(inputs: HashMap<&'a str, &'a Value>) -> Self {
        Self { inputs }
    }

    pub fn get_input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).copied()
    }
}

/// Inputs handed to a model run and the outputs it stores.
#[derive(Debug, Clone)]
pub struct RunContext {
    discipline: String,
    inputs: BTreeMap<String, Value>,
    outputs: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(discipline: impl Into<String>, inputs: BTreeMap<String, Value>) -> Self {
        Self {
            discipline: discipline.into(),
            inputs,
            outputs: BTreeMap::new(),
        }
    }

    /// Full name of the discipline being run.
    pub fn discipline(&self) -> &str {
        &self.discipline
    }

    pub fn get_input(&self, name: &str) -> Result<&Value, ModelError> {
        self.inputs
            .get(name)
            .ok_or_else(|| ModelError::MissingInput(name.to_string()))
    }

    pub fn get_f64(&self, name: &str) -> Result<f64, ModelError> {
        self.get_input(name)?
            .as_f64()
            .ok_or_else(|| ModelError::InvalidInput {
                name: name.to_string(),
                reason: "expected a scalar".to_string(),
            })
    }

    pub fn get_vector(&self, name: &str) -> Result<Vec<f64>, ModelError> {
        self.get_input(name)?
            .to_vector()
            .ok_or_else(|| ModelError::InvalidInput {
                name: name.to_string(),
                reason: "expected a numeric value".to_string(),
            })
    }

    pub fn inputs(&self) -> &BTreeMap<String, Value> {
        &self.inputs
    }

    pub fn store_output(&mut self, name: &str, value: impl Into<Value>) {
        self.outputs.insert(name.to_string(), value.into());
    }

    pub fn store_outputs<I, S>(&mut self, outputs: I)
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        self.outputs
            .extend(outputs.into_iter().map(|(k, v)| (k.into(), v)));
    }

    pub fn output(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    pub(crate) fn into_outputs(self) -> BTreeMap<String, Value> {
        self.outputs
    }
}

/// Jacobian blocks keyed by `(output, input)` short names.
#[derive(Debug, Clone, Default)]
pub struct PartialDerivatives {
    blocks: HashMap<(String, String), DMatrix<f64>>,
}

impl PartialDerivatives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `d output / d input` as a `len(output) x len(input)` matrix.
    pub fn set_partial_derivative(&mut self, output: &str, input: &str, block: DMatrix<f64>) {
        self.blocks
            .insert((output.to_string(), input.to_string()), block);
    }

    pub fn get(&self, output: &str, input: &str) -> Option<&DMatrix<f64>> {
        self.blocks.get(&(output.to_string(), input.to_string()))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_context_reports_missing_and_mistyped_inputs() {
        let mut inputs = BTreeMap::new();
        inputs.insert("a".to_string(), Value::Float(2.0));
        inputs.insert("name".to_string(), Value::from("x"));
        let ctx = RunContext::new("study.Disc", inputs);

        assert_eq!(ctx.get_f64("a").unwrap(), 2.0);
        assert_eq!(
            ctx.get_f64("b"),
            Err(ModelError::MissingInput("b".to_string()))
        );
        assert!(matches!(
            ctx.get_vector("name"),
            Err(ModelError::InvalidInput { .. })
        ));
    }

    #[test]
    fn partial_derivatives_are_keyed_by_output_then_input() {
        let mut jac = PartialDerivatives::new();
        jac.set_partial_derivative("y", "x", DMatrix::from_element(1, 1, 3.0));
        assert_eq!(jac.get("y", "x").map(|m| m[(0, 0)]), Some(3.0));
        assert!(jac.get("x", "y").is_none());
    }
}
