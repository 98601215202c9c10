use super::{CoupledSystem, CouplingVector, MdaOutcome, normalized_residual};
use crate::core::data_manager::LocalData;
use crate::engine::error::{EngineError, MdaError};
use crate::engine::progress::ProgressReporter;
use tracing::{debug, instrument, warn};

/// Fixed-point iteration over the members of a cycle, in order, with over-relaxation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussSeidel {
    over_relaxation_factor: f64,
    tolerance: f64,
    max_iter: usize,
}

impl GaussSeidel {
    pub fn new(
        over_relaxation_factor: f64,
        tolerance: f64,
        max_iter: usize,
    ) -> Result<Self, MdaError> {
        if !(over_relaxation_factor > 0.0 && over_relaxation_factor <= 2.0) {
            return Err(MdaError::InvalidOverRelaxationFactor(over_relaxation_factor));
        }
        Ok(Self {
            over_relaxation_factor,
            tolerance,
            max_iter: max_iter.max(1),
        })
    }

    /// Sweeps until the normalized residual `||x_{n+1} - x_n|| / ||x_1 - x_0||` drops
    /// below the tolerance or the iteration cap is reached. Always sweeps at least once.
    #[instrument(skip_all, name = "gauss_seidel", fields(cycle = system.name()))]
    pub(crate) fn solve(
        &self,
        system: &dyn CoupledSystem,
        couplings: &CouplingVector,
        data: &mut LocalData,
        reporter: &ProgressReporter,
    ) -> Result<MdaOutcome, EngineError> {
        let mut reference = None;
        let mut residuals = Vec::new();

        for iteration in 1..=self.max_iter {
            let previous = couplings.gather(data)?;
            system.sweep(data, self.over_relaxation_factor)?;
            let current = couplings.gather(data)?;

            let delta = (&current - &previous).norm();
            let residual = normalized_residual(delta, *reference.get_or_insert(delta));
            residuals.push(residual);
            debug!(iteration, residual, "Gauss-Seidel sweep");
            reporter.mda_iteration(system.name(), iteration, residual);

            if residual < self.tolerance {
                return Ok(MdaOutcome {
                    converged: true,
                    iterations: iteration,
                    residuals,
                });
            }
        }

        warn!(
            cycle = system.name(),
            iterations = self.max_iter,
            residual = residuals.last().copied().unwrap_or_default(),
            "Gauss-Seidel reached the iteration cap without converging"
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
    fn converges_on_linear_two_cycle_with_non_increasing_residuals() {
        let (system, mut data) = LinearCycle::new();
        let couplings = system.couplings(&data);
        let outcome = GaussSeidel::new(1.0, 1e-10, 100)
            .unwrap()
            .solve(&system, &couplings, &mut data, &ProgressReporter::new())
            .unwrap();

        assert!(outcome.converged);
        assert!((data[&system.y1].as_f64().unwrap() - 16.0 / 7.0).abs() < 1e-8);
        assert!((data[&system.y2].as_f64().unwrap() - 18.0 / 7.0).abs() < 1e-8);
        assert!(
            outcome
                .residuals
                .windows(2)
                .all(|w| w[1] <= w[0] + 1e-15)
        );
        assert_eq!(outcome.residuals[0], 1.0);
    }

    #[test]
    fn stops_at_iteration_cap_with_a_warning_not_an_error() {
        let (system, mut data) = LinearCycle::new();
        let couplings = system.couplings(&data);
        let outcome = GaussSeidel::new(1.0, 1e-12, 2)
            .unwrap()
            .solve(&system, &couplings, &mut data, &ProgressReporter::new())
            .unwrap();
        assert!(!outcome.converged);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.residuals.len(), 2);
    }

    #[test]
    fn zero_iteration_cap_still_sweeps_once() {
        let (system, mut data) = LinearCycle::new();
        let couplings = system.couplings(&data);
        let outcome = GaussSeidel::new(1.0, 1e-6, 0)
            .unwrap()
            .solve(&system, &couplings, &mut data, &ProgressReporter::new())
            .unwrap();
        assert_eq!(outcome.iterations, 1);
        assert_eq!(data[&system.y1].as_f64(), Some(1.0));
        assert_eq!(data[&system.y2].as_f64(), Some(2.25));
    }

    #[test]
    fn under_relaxation_still_converges() {
        let (system, mut data) = LinearCycle::new();
        let couplings = system.couplings(&data);
        let outcome = GaussSeidel::new(0.7, 1e-10, 200)
            .unwrap()
            .solve(&system, &couplings, &mut data, &ProgressReporter::new())
            .unwrap();
        assert!(outcome.converged);
        assert!((data[&system.y1].as_f64().unwrap() - 16.0 / 7.0).abs() < 1e-8);
    }

    #[test]
    fn rejects_out_of_range_over_relaxation() {
        assert_eq!(
            GaussSeidel::new(0.0, 1e-6, 10),
            Err(MdaError::InvalidOverRelaxationFactor(0.0))
        );
        let err = GaussSeidel::new(2.5, 1e-6, 10).unwrap_err();
        assert_eq!(err, MdaError::InvalidOverRelaxationFactor(2.5));
        assert!(err.to_string().contains("(0, 2]"));
        assert!(GaussSeidel::new(1.8, 1e-6, 10).is_ok());
    }
}
