use super::variable::{IoType, VariableSpec};

/// Origin of a group of declarations inside a discipline schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    /// Declared once by the model (`desc_in`/`desc_out`).
    Static,
    /// Produced by the model's `setup` from structuring inputs.
    Setup,
    /// Numerical settings added to couplings and drivers.
    Numerical,
    /// Inputs and outputs added by the scatter tool.
    Scatter,
    /// Inputs and outputs added by an evaluation driver.
    Driver,
}

/// A set of declarations to merge into a schema, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDelta {
    pub provenance: Provenance,
    pub inputs: Vec<VariableSpec>,
    pub outputs: Vec<VariableSpec>,
}

impl SchemaDelta {
    pub fn new(provenance: Provenance) -> Self {
        Self {
            provenance,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, spec: VariableSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn output(mut self, spec: VariableSpec) -> Self {
        self.outputs.push(spec);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEntry {
    pub spec: VariableSpec,
    pub io_type: IoType,
    pub provenance: Provenance,
}

/// The merged, per-pass snapshot of a discipline's declarations.
///
/// Deltas are applied in order; a later declaration of the same short name and io type
/// replaces the earlier one in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    entries: Vec<SchemaEntry>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_deltas<I>(deltas: I) -> Self
    where
        I: IntoIterator<Item = SchemaDelta>,
    {
        let mut schema = Self::new();
        for delta in deltas {
            schema.merge(delta);
        }
        schema
    }

    pub fn merge(&mut self, delta: SchemaDelta) {
        let provenance = delta.provenance;
        let tagged = delta
            .inputs
            .into_iter()
            .map(|s| (s, IoType::In))
            .chain(delta.outputs.into_iter().map(|s| (s, IoType::Out)));
        for (spec, io_type) in tagged {
            let entry = SchemaEntry {
                spec,
                io_type,
                provenance,
            };
            match self
                .entries
                .iter_mut()
                .find(|e| e.io_type == io_type && e.spec.name == entry.spec.name)
            {
                Some(existing) => *existing = entry,
                None => self.entries.push(entry),
            }
        }
    }

    pub fn entries(&self) -> &[SchemaEntry] {
        &self.entries
    }

    pub fn inputs(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.iter().filter(|e| e.io_type == IoType::In)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.iter().filter(|e| e.io_type == IoType::Out)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::VarType;

    #[test]
    fn later_delta_replaces_same_named_entry() {
        let schema = Schema::from_deltas([
            SchemaDelta::new(Provenance::Static)
                .input(VariableSpec::float("x"))
                .output(VariableSpec::float("x")),
            SchemaDelta::new(Provenance::Setup).input(VariableSpec::new("x", VarType::Array)),
        ]);

        assert_eq!(schema.len(), 2);
        let input = schema.inputs().next().unwrap();
        assert_eq!(input.spec.var_type, VarType::Array);
        assert_eq!(input.provenance, Provenance::Setup);
        let output = schema.outputs().next().unwrap();
        assert_eq!(output.provenance, Provenance::Static);
    }
}
