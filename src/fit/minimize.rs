use std::cell::RefCell;

use nalgebra::DVector;

use super::{commit, reduced_chisq, Callback, FitDriver, FitError, FitOutcome, FitState, FitTarget};
use crate::{
    params::vary_all,
    simulator::{Simulator, SimulatorError},
    ErrorParameter, Orm, OrmError, Result,
};

/// Objective value when the simulator fails to compute the twiss
const TWISS_FAILED_PENALTY: f64 = 1e5;
/// Sufficient decrease coefficient of the line search
const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACK: usize = 60;

/// Outcome of [minimize_bounded]
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeResult {
    pub x: Vec<f64>,
    pub fun: f64,
    pub nit: usize,
    /// Number of objective evaluations
    pub nfev: usize,
    pub success: bool,
    pub message: String,
}

fn project(x: &mut DVector<f64>, bounds: Option<&[(f64, f64)]>) {
    if let Some(bounds) = bounds {
        x.iter_mut()
            .zip(bounds)
            .for_each(|(x, (lower, upper))| *x = x.clamp(*lower, *upper));
    }
}

/// Minimizes `f` within `bounds` starting from `x0`
///
/// Projected gradient descent with Barzilai-Borwein steps and an Armijo
/// backtracking line search. The gradient is estimated with central
/// differences of step `delta`, one-sided at the bounds.
/// It stops when the projected gradient or the relative decrease of the
/// objective falls below `tol`, or after `max_iter` iterations.
/// `on_iter` is called after each iteration with the iteration number,
/// the step, the new point and the new objective value; the last
/// evaluation of `f` before the call is at the new point.
pub fn minimize_bounded<F, C>(
    mut f: F,
    x0: &[f64],
    bounds: Option<&[(f64, f64)]>,
    tol: f64,
    delta: f64,
    max_iter: usize,
    mut on_iter: C,
) -> Result<MinimizeResult>
where
    F: FnMut(&[f64]) -> Result<f64>,
    C: FnMut(usize, &[f64], &[f64], f64),
{
    let n = x0.len();
    let mut nfev = 0usize;
    let mut eval = |x: &DVector<f64>| -> Result<f64> {
        nfev += 1;
        f(x.as_slice())
    };
    let mut x = DVector::from_column_slice(x0);
    project(&mut x, bounds);
    let mut fx = eval(&x)?;
    let mut previous: Option<(DVector<f64>, DVector<f64>)> = None;
    let mut result = MinimizeResult {
        x: vec![],
        fun: fx,
        nit: 0,
        nfev: 0,
        success: false,
        message: "maximum number of iterations reached".into(),
    };
    for nit in 1..=max_iter {
        let mut g = DVector::zeros(n);
        for i in 0..n {
            let (lower, upper) = bounds.map_or((f64::NEG_INFINITY, f64::INFINITY), |b| b[i]);
            let (mut xp, mut xm) = (x.clone(), x.clone());
            xp[i] = (x[i] + delta).min(upper);
            xm[i] = (x[i] - delta).max(lower);
            let h = xp[i] - xm[i];
            if h > 0. {
                g[i] = (eval(&xp)? - eval(&xm)?) / h;
            }
        }
        let mut pg = &x - &g;
        project(&mut pg, bounds);
        if (&pg - &x).amax() <= tol {
            result.success = true;
            result.message = "projected gradient below tolerance".into();
            break;
        }
        let mut alpha = match &previous {
            Some((s, g_previous)) => {
                let y = &g - g_previous;
                let sy = s.dot(&y);
                if sy > 0. {
                    s.dot(s) / sy
                } else {
                    1. / g.amax()
                }
            }
            None => 1. / g.amax(),
        };
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACK {
            let mut trial = &x - &g * alpha;
            project(&mut trial, bounds);
            let step = &trial - &x;
            let f_trial = eval(&trial)?;
            if f_trial <= fx + ARMIJO * g.dot(&step) {
                accepted = Some((trial, step, f_trial));
                break;
            }
            alpha *= 0.5;
        }
        let Some((trial, step, f_trial)) = accepted else {
            result.message = "line search failed to decrease the objective".into();
            break;
        };
        let decrease = fx - f_trial;
        x = trial;
        fx = f_trial;
        result.nit = nit;
        on_iter(nit, step.as_slice(), x.as_slice(), fx);
        if decrease <= tol * fx.abs().max(1.) {
            result.success = true;
            result.message = "relative decrease of the objective below tolerance".into();
            break;
        }
        previous = Some((step, g));
    }
    drop(eval);
    result.x = x.as_slice().to_vec();
    result.fun = fx;
    result.nfev = nfev;
    Ok(result)
}

/// Bound-constrained minimization of the reduced χ²
///
/// The objective moves every error by the trial vector, computes the model
/// orbit response matrix and returns its reduced χ² (`ddof = 1`), the
/// errors being restored after each evaluation.
/// A twiss failure of the simulator evaluates to a large penalty.
/// The final vector is applied once, at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct Minimize {
    /// Convergence tolerance
    pub tol: f64,
    /// Finite-difference step of the gradient
    pub delta: f64,
    /// Optional `(lower, upper)` bounds of each error change
    pub bounds: Option<Vec<(f64, f64)>>,
}
impl Default for Minimize {
    fn default() -> Self {
        Self {
            tol: 1e-6,
            delta: 1e-4,
            bounds: None,
        }
    }
}

impl FitDriver for Minimize {
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
        if let Some(bounds) = &self.bounds {
            if bounds.len() != errors.len() {
                return Err(FitError::BoundsMismatch {
                    n_bounds: bounds.len(),
                    n_errors: errors.len(),
                }
                .into());
            }
            if let Some((error, &(lower, upper))) =
                errors.iter().zip(bounds).find(|(_, (l, u))| !(l <= u))
            {
                return Err(FitError::InvalidBounds {
                    name: error.name.clone(),
                    lower,
                    upper,
                }
                .into());
            }
        }

        let last_model: RefCell<Option<Orm>> = RefCell::new(None);
        let mut history = vec![];
        let result = {
            let trial_errors: &[ErrorParameter] = errors;
            let sim_ref = &mut *sim;
            let objective = |x: &[f64]| -> Result<f64> {
                let model = vary_all(sim_ref, trial_errors, x, |sim| -> Result<Orm> {
                    target.model_orm(sim)
                });
                match model {
                    Ok(model) => {
                        let chisq = reduced_chisq(target.residuals(&model).as_slice(), 1);
                        last_model.replace(Some(model));
                        Ok(chisq)
                    }
                    Err(OrmError::Simulator(SimulatorError::TwissFailed(reason))) => {
                        log::warn!("twiss failed: {}", reason);
                        Ok(TWISS_FAILED_PENALTY)
                    }
                    Err(e) => Err(e),
                }
            };
            let on_iter = |nit: usize, dx: &[f64], x: &[f64], chisq: f64| {
                log::info!("minimize #{}: red χ² = {:e}", nit, chisq);
                history.push(chisq);
                if let Some(model) = last_model.borrow().as_ref() {
                    callback(&FitState {
                        stage: "minimize",
                        nit,
                        chisq,
                        dx,
                        x,
                        model_orm: model,
                        monitor_subset: target.monitor_subset,
                        errors: trial_errors,
                    });
                }
            };
            minimize_bounded(
                objective,
                &vec![0.; trial_errors.len()],
                self.bounds.as_deref(),
                self.tol,
                self.delta,
                iterations,
                on_iter,
            )?
        };
        log::info!("{}", result.message);
        commit(sim, errors, &result.x)?;
        Ok(FitOutcome {
            success: result.success,
            message: result.message,
            nit: result.nit,
            x: result.x,
            chisq: result.fun,
            history,
        })
    }
}
