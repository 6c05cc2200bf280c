use nalgebra::DMatrix;

use super::{commit, reduced_chisq, Callback, FitDriver, FitError, FitOutcome, FitState, FitTarget};
use crate::{
    deriv::{orm_derivatives, progress_bar},
    simulator::Simulator,
    ErrorParameter, Result,
};

/// Iterated linear least-squares fit
///
/// Each iteration computes the derivatives of the model orbit response
/// matrix at the current state and solves
/// `min ‖(A/S)·x − (Y/S)‖²` where `Y` is the residual between the measured
/// and the model matrices, `A` the stacked derivatives and `S` the
/// measurement uncertainty. The solution is applied before the next
/// iteration.
/// There is no convergence check, all the iterations are run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeastSquares {
    /// Singular values below `rcond` times the largest one are discarded
    pub rcond: f64,
    /// Shows a progress bar while computing the derivatives
    pub progress: bool,
}
impl Default for LeastSquares {
    fn default() -> Self {
        Self {
            rcond: 1e-8,
            progress: false,
        }
    }
}

/// Truncated SVD solution of `a·x = b`, with the rank of `a`
pub(crate) fn solve(
    a: DMatrix<f64>,
    b: &DMatrix<f64>,
    rcond: f64,
) -> std::result::Result<(DMatrix<f64>, usize), String> {
    if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
        return Err("the system is not finite".into());
    }
    let svd = a.svd(true, true);
    let s_max = svd.singular_values.max();
    let eps = rcond * s_max;
    let rank = svd.rank(eps);
    log::debug!(
        "least-squares singular values range: [{:e},{:e}], rank {}",
        svd.singular_values.min(),
        s_max,
        rank
    );
    let x = svd.solve(b, eps).map_err(|msg| msg.to_string())?;
    Ok((x, rank))
}

impl FitDriver for LeastSquares {
    fn fit<S: Simulator + ?Sized>(
        &self,
        sim: &mut S,
        target: &FitTarget<'_>,
        errors: &mut [ErrorParameter],
        iterations: usize,
        callback: &mut Callback<'_>,
    ) -> Result<FitOutcome> {
        if errors.is_empty() {
            return Err(FitError::NoErrors.into());
        }
        target.validate()?;
        let planes = target.mode.planes();
        let ddof = errors.len();
        let weights = target.weights();
        let mut model = target.model_orm(sim)?;
        let mut outcome = FitOutcome {
            success: true,
            message: format!("{} iterations completed", iterations),
            x: vec![0.; errors.len()],
            chisq: reduced_chisq(target.residuals(&model).as_slice(), ddof),
            ..Default::default()
        };
        for nit in 1..=iterations {
            let pb = self
                .progress
                .then(|| progress_bar(errors.len(), &format!("derivatives #{}", nit)));
            let derivatives =
                orm_derivatives(sim, target.monitors, target.knobs, &model, errors, pb)?;
            let columns: Vec<_> = derivatives
                .iter()
                .map(|d| {
                    d.select_vector(target.monitor_subset, planes)
                        .component_mul(&weights)
                })
                .collect();
            let a = DMatrix::from_columns(&columns);
            let y = DMatrix::from_column_slice(
                weights.len(),
                1,
                target.residuals(&model).as_slice(),
            );
            let dx = match solve(a, &y, self.rcond) {
                Ok((dx, rank)) => {
                    if rank < errors.len() {
                        log::warn!("rank deficient system: rank {} for {} errors", rank, errors.len());
                    }
                    dx.column(0).iter().copied().collect::<Vec<f64>>()
                }
                Err(msg) => {
                    log::warn!("least-squares solve failed: {}", msg);
                    outcome.success = false;
                    outcome.message = format!("least-squares solve failed at iteration {}: {}", nit, msg);
                    break;
                }
            };
            if dx.iter().any(|x| !x.is_finite()) {
                log::warn!("least-squares solution is not finite: {:?}", dx);
                outcome.success = false;
                outcome.message = format!("non finite solution at iteration {}", nit);
                break;
            }
            commit(sim, errors, &dx)?;
            outcome.x.iter_mut().zip(&dx).for_each(|(x, dx)| *x += dx);
            model = target.model_orm(sim)?;
            outcome.chisq = reduced_chisq(target.residuals(&model).as_slice(), ddof);
            outcome.history.push(outcome.chisq);
            outcome.nit = nit;
            log::info!("lstsq #{}: red χ² = {:e}", nit, outcome.chisq);
            callback(&FitState {
                stage: "lstsq",
                nit,
                chisq: outcome.chisq,
                dx: &dx,
                x: &outcome.x,
                model_orm: &model,
                monitor_subset: target.monitor_subset,
                errors,
            });
        }
        Ok(outcome)
    }
}
