use std::ops::{Deref, DerefMut};

use super::{Checkpoint, Simulator};

/// Transactional scope over a [Simulator]
///
/// Every modification done through the guard is undone when the guard is
/// dropped, whether the scope exits normally, through `?` or by unwinding.
/// A transient rollback also drops the cached twiss results.
pub struct Rollback<'a, S: Simulator + ?Sized> {
    sim: &'a mut S,
    checkpoint: Checkpoint,
    label: String,
    transient: bool,
}

/// Opens a [Rollback] scope on `sim`
pub fn rollback<'a, S: Simulator + ?Sized>(
    sim: &'a mut S,
    label: &str,
    transient: bool,
) -> Rollback<'a, S> {
    let checkpoint = sim.checkpoint();
    log::trace!("rollback `{}` opened at {:?}", label, checkpoint);
    Rollback {
        sim,
        checkpoint,
        label: label.into(),
        transient,
    }
}

impl<'a, S: Simulator + ?Sized> Deref for Rollback<'a, S> {
    type Target = S;
    fn deref(&self) -> &Self::Target {
        &*self.sim
    }
}
impl<'a, S: Simulator + ?Sized> DerefMut for Rollback<'a, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.sim
    }
}

impl<'a, S: Simulator + ?Sized> Drop for Rollback<'a, S> {
    fn drop(&mut self) {
        if let Err(e) = self.sim.restore(self.checkpoint) {
            log::error!("rollback `{}` failed: {}", self.label, e);
        }
        if self.transient {
            self.sim.invalidate_twiss();
        }
    }
}
