use std::ops::{Deref, DerefMut};

use super::{ErrorParam, ErrorParameter};
use crate::simulator::{Checkpoint, Simulator, SimulatorError, SimulatorResult};

/// Scoped perturbation of an [ErrorParam]
///
/// The simulator is restored to the checkpoint taken before the step,
/// either by [Varied::finish], which reports failures, or when the guard
/// is dropped. Every modification made while the guard is alive is undone
/// with it, element by element for range selections.
/// Global variables and element attributes are not written if the step
/// left their value unchanged.
pub struct Varied<'a, S: Simulator + ?Sized> {
    sim: &'a mut S,
    param: &'a ErrorParam,
    checkpoint: Option<Checkpoint>,
}

impl<'a, S: Simulator + ?Sized> Varied<'a, S> {
    /// Moves `param` by `step`
    pub fn new(sim: &'a mut S, param: &'a ErrorParam, step: f64) -> SimulatorResult<Self> {
        let checkpoint = sim.checkpoint();
        if let Err(e) = param.shift(&mut *sim, step) {
            sim.restore(checkpoint)?;
            return Err(e);
        }
        Ok(Self {
            sim,
            param,
            checkpoint: Some(checkpoint),
        })
    }
    /// Restores the prior state
    pub fn finish(mut self) -> SimulatorResult<()> {
        match self.checkpoint.take() {
            Some(checkpoint) => self.sim.restore(checkpoint),
            None => Ok(()),
        }
    }
}

impl<'a, S: Simulator + ?Sized> Deref for Varied<'a, S> {
    type Target = S;
    fn deref(&self) -> &S {
        &*self.sim
    }
}
impl<'a, S: Simulator + ?Sized> DerefMut for Varied<'a, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.sim
    }
}

impl<'a, S: Simulator + ?Sized> Drop for Varied<'a, S> {
    fn drop(&mut self) {
        if let Some(checkpoint) = self.checkpoint.take() {
            if let Err(e) = self.sim.restore(checkpoint) {
                log::error!("failed to restore {}: {}", self.param, e);
            }
        }
    }
}

/// Runs `f` with every error moved by the matching value
///
/// The errors are varied in nested scopes and restored in reverse order.
pub fn vary_all<S, T, E, F>(
    sim: &mut S,
    errors: &[ErrorParameter],
    values: &[f64],
    f: F,
) -> Result<T, E>
where
    S: Simulator + ?Sized,
    E: From<SimulatorError>,
    F: FnOnce(&mut S) -> Result<T, E>,
{
    match (errors.split_first(), values.split_first()) {
        (Some((error, errors)), Some((&value, values))) => {
            error.vary(sim, Some(value), |sim, _| vary_all(sim, errors, values, f))
        }
        _ => f(sim),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, FromBuilder, InMemorySimulator};

    #[test]
    fn nested() {
        let mut sim = InMemorySimulator::builder()
            .element("q1", "quadrupole", 1.)
            .attr("q1", "k1", "kq1")
            .global("kq1", 1.)
            .global("kq2", 2.)
            .build()
            .unwrap();
        let errors: Vec<ErrorParameter> = ["kq2", "q1->k1", "q1<dy>"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let history = sim.history_len();
        let values = vary_all(&mut sim, &errors, &[0.5, 0.25, 1e-3], |sim| {
            Ok::<_, SimulatorError>([
                sim.global("kq2")?,
                sim.element_attr("q1", "k1")?,
                errors[2].get(sim)?,
            ])
        })
        .unwrap();
        assert_eq!(values, [2.5, 1.25, 1e-3]);
        assert_eq!(sim.global("kq2").unwrap(), 2.);
        assert_eq!(sim.element_attr("q1", "k1").unwrap(), 1.);
        assert_eq!(errors[2].get(&sim).unwrap(), 0.);
        assert_eq!(sim.history_len(), history);
    }

    #[test]
    fn unchanged_is_not_written() {
        let mut sim = InMemorySimulator::builder().global("k", 1.).build().unwrap();
        let history = sim.history_len();
        let param = ErrorParam::Global("k".into());
        Varied::new(&mut sim, &param, 0.).unwrap().finish().unwrap();
        assert_eq!(sim.history_len(), history);
    }
}
