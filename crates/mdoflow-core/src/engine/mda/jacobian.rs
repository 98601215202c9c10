use super::CouplingVector;
use crate::core::ids::VarId;
use crate::engine::error::MdaError;
use nalgebra::DMatrix;

/// Relative step of forward finite differences.
pub const FD_STEP: f64 = 1e-7;

pub(crate) fn finite_difference_step(x: f64) -> f64 {
    FD_STEP * x.abs().max(1.0)
}

/// Places discipline-level derivative blocks into the coupling-level `dF/dX`.
pub(crate) struct JacobianAssembler<'a> {
    couplings: &'a CouplingVector,
    matrix: DMatrix<f64>,
}

impl<'a> JacobianAssembler<'a> {
    pub fn new(couplings: &'a CouplingVector) -> Self {
        let n = couplings.size();
        Self {
            couplings,
            matrix: DMatrix::zeros(n, n),
        }
    }

    /// Writes `d output / d input`. Pairs that are not both couplings are ignored.
    pub fn add_block(
        &mut self,
        discipline: &str,
        output: VarId,
        input: VarId,
        block: &DMatrix<f64>,
    ) -> Result<(), MdaError> {
        let (Some((row, rows)), Some((col, cols))) =
            (self.couplings.span(output), self.couplings.span(input))
        else {
            return Ok(());
        };
        if block.shape() != (rows, cols) {
            return Err(MdaError::JacobianShape {
                discipline: discipline.to_string(),
                output: self.couplings.path(output).unwrap_or_default().to_string(),
                input: self.couplings.path(input).unwrap_or_default().to_string(),
                expected: (rows, cols),
                found: block.shape(),
            });
        }
        self.matrix
            .view_mut((row, col), (rows, cols))
            .copy_from(block);
        Ok(())
    }

    pub fn finish(self) -> DMatrix<f64> {
        self.matrix
    }
}

/// Smallest and largest entry of a block, `None` if it is empty.
pub(crate) fn block_min_max(block: &DMatrix<f64>) -> Option<(f64, f64)> {
    if block.is_empty() {
        return None;
    }
    Some((block.min(), block.max()))
}
