//!
//! # Orbit response derivatives
//!
//! Finite-difference derivatives of the model orbit response matrix with
//! respect to machine errors.
//! Each derivative is computed inside a transient [rollback] scope so the
//! simulator is left exactly as it was found.

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::{
    fit::FitError,
    simulator::{rollback, Simulator},
    ErrorParameter, Orm, Result,
};

/// Derivative of the orbit response matrix with respect to `param`
///
/// The parameter is moved by its default step, the model orbit response
/// matrix is recomputed and `(varied - base_orm) / step` is returned.
pub fn orm_derivative<S: Simulator + ?Sized>(
    sim: &mut S,
    monitors: &[String],
    knobs: &[String],
    base_orm: &Orm,
    param: &ErrorParameter,
) -> Result<Orm> {
    if param.step == 0. {
        return Err(FitError::ZeroStep(param.name.clone()).into());
    }
    let now = Instant::now();
    let mut scope = rollback(sim, &format!("orm derivative of {}", param.name), true);
    let (varied, step) = param.vary(&mut *scope, None, |sim, step| -> Result<(Orm, f64)> {
        sim.invalidate_twiss();
        Ok((sim.orbit_response_matrix(monitors, knobs)?, step))
    })?;
    drop(scope);
    log::debug!(
        "derivative of {} in {}ms",
        param.name,
        now.elapsed().as_millis()
    );
    Ok((varied - base_orm) / step)
}

/// Progress bar for derivative sweeps
pub fn progress_bar(len: usize, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("{msg} [{eta_precise}] {bar:50.cyan/blue} {pos:>7}/{len:7}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    pb.set_message(message.to_string());
    pb
}

/// Derivatives with respect to every error, one after the other
pub fn orm_derivatives<S: Simulator + ?Sized>(
    sim: &mut S,
    monitors: &[String],
    knobs: &[String],
    base_orm: &Orm,
    errors: &[ErrorParameter],
    pb: Option<ProgressBar>,
) -> Result<Vec<Orm>> {
    let now = Instant::now();
    let mut derivatives = Vec::with_capacity(errors.len());
    for error in errors {
        derivatives.push(orm_derivative(sim, monitors, knobs, base_orm, error)?);
        if let Some(pb) = pb.as_ref() {
            pb.inc(1);
        }
    }
    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    log::debug!(
        "{} derivatives in {}ms",
        errors.len(),
        now.elapsed().as_millis()
    );
    Ok(derivatives)
}

/// Derivatives with respect to every error, in parallel
///
/// Every worker owns a clone of `sim`, the given simulator is not modified.
pub fn orm_derivatives_par<S>(
    sim: &S,
    monitors: &[String],
    knobs: &[String],
    base_orm: &Orm,
    errors: &[ErrorParameter],
) -> Result<Vec<Orm>>
where
    S: Simulator + Clone + Send + Sync,
{
    let now = Instant::now();
    let derivatives = errors
        .par_iter()
        .map_init(
            || sim.clone(),
            |sim, error| orm_derivative(sim, monitors, knobs, base_orm, error),
        )
        .collect::<Result<Vec<Orm>>>()?;
    log::debug!(
        "{} derivatives in {}ms on {} threads",
        errors.len(),
        now.elapsed().as_millis(),
        rayon::current_num_threads()
    );
    Ok(derivatives)
}
