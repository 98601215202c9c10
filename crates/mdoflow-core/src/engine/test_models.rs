//! Small analytic models shared by the engine and workflow tests.

use super::error::ModelError;
use super::model::{Model, PartialDerivatives, RunContext};
use crate::core::variable::VariableSpec;
use nalgebra::DMatrix;

/// `y = a * x + b`, `indicator = a * b`, with `x` and `y` shared in `ns_ac`.
#[derive(Debug, Default)]
pub struct Disc1;

impl Model for Disc1 {
    fn desc_in(&self) -> Vec<VariableSpec> {
        vec![
            VariableSpec::float("x").shared("ns_ac"),
            VariableSpec::float("a"),
            VariableSpec::float("b"),
        ]
    }

    fn desc_out(&self) -> Vec<VariableSpec> {
        vec![
            VariableSpec::float("y").shared("ns_ac"),
            VariableSpec::float("indicator"),
        ]
    }

    fn run(&self, ctx: &mut RunContext) -> Result<(), ModelError> {
        let (x, a, b) = (ctx.get_f64("x")?, ctx.get_f64("a")?, ctx.get_f64("b")?);
        ctx.store_output("y", a * x + b);
        ctx.store_output("indicator", a * b);
        Ok(())
    }
}

/// `z = y + 1`.
#[derive(Debug, Default)]
pub struct Disc2;

impl Model for Disc2 {
    fn desc_in(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("y").shared("ns_ac")]
    }

    fn desc_out(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("z").shared("ns_ac")]
    }

    fn run(&self, ctx: &mut RunContext) -> Result<(), ModelError> {
        let y = ctx.get_f64("y")?;
        ctx.store_output("z", y + 1.0);
        Ok(())
    }
}

/// Stores `v = u` and also writes back its own input `u`.
#[derive(Debug, Default)]
pub struct Overwriter;

impl Model for Overwriter {
    fn desc_in(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("u")]
    }

    fn desc_out(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("v")]
    }

    fn run(&self, ctx: &mut RunContext) -> Result<(), ModelError> {
        let u = ctx.get_f64("u")?;
        ctx.store_output("v", u);
        ctx.store_output("u", u + 1.0);
        Ok(())
    }
}

/// `out = 2 * in`, both shared in `ns_scenario`.
#[derive(Debug, Default)]
pub struct Doubler;

impl Model for Doubler {
    fn desc_in(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("in").shared("ns_scenario")]
    }

    fn desc_out(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("out").shared("ns_scenario")]
    }

    fn run(&self, ctx: &mut RunContext) -> Result<(), ModelError> {
        let value = ctx.get_f64("in")?;
        ctx.store_output("out", 2.0 * value);
        Ok(())
    }
}

/// `y1 = 0.5 * y2 + 1`. With [`CycleB`] the fixed point is `(16/7, 18/7)`.
#[derive(Debug, Default)]
pub struct CycleA {
    pub analytic: bool,
}

impl Model for CycleA {
    fn desc_in(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("y2").shared("ns_ac")]
    }

    fn desc_out(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("y1").shared("ns_ac")]
    }

    fn run(&self, ctx: &mut RunContext) -> Result<(), ModelError> {
        let y2 = ctx.get_f64("y2")?;
        ctx.store_output("y1", 0.5 * y2 + 1.0);
        Ok(())
    }

    fn compute_jacobian(
        &self,
        _ctx: &RunContext,
        jacobian: &mut PartialDerivatives,
    ) -> Result<bool, ModelError> {
        if !self.analytic {
            return Ok(false);
        }
        jacobian.set_partial_derivative("y1", "y2", DMatrix::from_element(1, 1, 0.5));
        Ok(true)
    }
}

/// `y2 = 0.25 * y1 + 2`.
#[derive(Debug, Default)]
pub struct CycleB {
    pub analytic: bool,
}

impl Model for CycleB {
    fn desc_in(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("y1").shared("ns_ac")]
    }

    fn desc_out(&self) -> Vec<VariableSpec> {
        vec![VariableSpec::float("y2").shared("ns_ac")]
    }

    fn run(&self, ctx: &mut RunContext) -> Result<(), ModelError> {
        let y1 = ctx.get_f64("y1")?;
        ctx.store_output("y2", 0.25 * y1 + 2.0);
        Ok(())
    }

    fn compute_jacobian(
        &self,
        _ctx: &RunContext,
        jacobian: &mut PartialDerivatives,
    ) -> Result<bool, ModelError> {
        if !self.analytic {
            return Ok(false);
        }
        jacobian.set_partial_derivative("y2", "y1", DMatrix::from_element(1, 1, 0.25));
        Ok(true)
    }
}
