use super::{CoupledSystem, CouplingVector, MdaOutcome, normalized_residual};
use crate::core::data_manager::LocalData;
use crate::engine::error::{EngineError, MdaError};
use crate::engine::progress::ProgressReporter;
use nalgebra::DMatrix;
use tracing::{debug, instrument, warn};

/// Newton iteration on the fixed-point residual `R(x) = F(x) - x`.
///
/// Each iteration linearizes at the current couplings, evaluates every member at that
/// point, and steps by `relax_factor * (-J⁻¹ R)` with `J = dF/dX - I`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PureNewtonRaphson {
    relax_factor: f64,
    tolerance: f64,
    max_iter: usize,
}

impl PureNewtonRaphson {
    pub fn new(relax_factor: f64, tolerance: f64, max_iter: usize) -> Result<Self, MdaError> {
        if !(relax_factor > 0.0 && relax_factor <= 1.0) {
            return Err(MdaError::InvalidRelaxFactor(relax_factor));
        }
        Ok(Self {
            relax_factor,
            tolerance,
            max_iter: max_iter.max(1),
        })
    }

    pub fn relax_factor(&self) -> f64 {
        self.relax_factor
    }

    #[instrument(skip_all, name = "newton_raphson", fields(cycle = system.name()))]
    pub(crate) fn solve(
        &self,
        system: &dyn CoupledSystem,
        couplings: &CouplingVector,
        data: &mut LocalData,
        reporter: &ProgressReporter,
    ) -> Result<MdaOutcome, EngineError> {
        let n = couplings.size();
        let mut reference = None;
        let mut residuals = Vec::new();

        for iteration in 1..=self.max_iter {
            let x = couplings.gather(data)?;
            let dfdx = system.linearize(data, couplings)?;
            system.evaluate_all(data)?;
            let fx = couplings.gather(data)?;

            let r = &fx - &x;
            let norm = r.norm();
            let residual = normalized_residual(norm, *reference.get_or_insert(norm));
            residuals.push(residual);
            debug!(iteration, residual, "Newton-Raphson iteration");
            reporter.mda_iteration(system.name(), iteration, residual);

            if residual < self.tolerance {
                return Ok(MdaOutcome {
                    converged: true,
                    iterations: iteration,
                    residuals,
                });
            }

            let jacobian = dfdx - DMatrix::<f64>::identity(n, n);
            let newton = jacobian
                .lu()
                .solve(&r)
                .filter(|s| s.iter().all(|v| v.is_finite()))
                .ok_or_else(|| MdaError::SingularJacobian {
                    coupling: system.name().to_string(),
                    iteration,
                })?;
            let next = x - newton * self.relax_factor;
            couplings.scatter(data, &next)?;
        }

        warn!(
            cycle = system.name(),
            iterations = self.max_iter,
            residual = residuals.last().copied().unwrap_or_default(),
            "Newton-Raphson reached the iteration cap without converging"
        );
        Ok(MdaOutcome {
            converged: false,
            iterations: self.max_iter,
            residuals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mda::testing::LinearCycle;

    #[test]
    fn relax_factor_must_be_in_unit_interval() {
        assert_eq!(
            PureNewtonRaphson::new(0.0, 1e-6, 10),
            Err(MdaError::InvalidRelaxFactor(0.0))
        );
        assert_eq!(
            PureNewtonRaphson::new(-0.5, 1e-6, 10),
            Err(MdaError::InvalidRelaxFactor(-0.5))
        );
        assert_eq!(
            PureNewtonRaphson::new(1.5, 1e-6, 10),
            Err(MdaError::InvalidRelaxFactor(1.5))
        );
        assert!(PureNewtonRaphson::new(f64::NAN, 1e-6, 10).is_err());
        assert_eq!(PureNewtonRaphson::new(1.0, 1e-6, 10).unwrap().relax_factor(), 1.0);
    }

    #[test]
    fn converges_on_linear_two_cycle_in_few_iterations() {
        let (system, mut data) = LinearCycle::new();
        let couplings = system.couplings(&data);
        let outcome = PureNewtonRaphson::new(0.99, 1e-6, 20)
            .unwrap()
            .solve(&system, &couplings, &mut data, &ProgressReporter::new())
            .unwrap();

        assert!(outcome.converged);
        assert!(outcome.iterations <= 5);
        assert!((data[&system.y1].as_f64().unwrap() - 16.0 / 7.0).abs() < 1e-5);
        assert!((data[&system.y2].as_f64().unwrap() - 18.0 / 7.0).abs() < 1e-5);
    }

    #[test]
    fn full_step_solves_a_linear_cycle_at_once() {
        let (system, mut data) = LinearCycle::new();
        let couplings = system.couplings(&data);
        let outcome = PureNewtonRaphson::new(1.0, 1e-8, 20)
            .unwrap()
            .solve(&system, &couplings, &mut data, &ProgressReporter::new())
            .unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 2);
    }
}
