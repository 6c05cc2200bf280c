//!
//! # Fit drivers
//!
//! Two interchangeable strategies adjust the machine errors so that the
//! model orbit response matrix reproduces the measured one:
//!  - [LeastSquares] linearizes the model with finite-difference
//!    derivatives and solves the weighted linear least-squares problem,
//!    a fixed number of times,
//!  - [Minimize] minimizes the reduced χ² directly with a bound-constrained
//!    gradient method.
//!
//! Both implement [FitDriver], update the `base` of the errors and leave
//! the fitted errors applied to the simulator.
//! Numerical failures are reported in [FitOutcome], not raised.

use std::{fmt::Display, str::FromStr};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::{simulator::Simulator, ErrorParameter, Orm, Result};

mod config;
mod lstsq;
mod minimize;

pub use config::{Algorithm, ConfigError, FitConfig};
pub use lstsq::LeastSquares;
pub use minimize::{minimize_bounded, Minimize, MinimizeResult};

#[derive(Debug, thiserror::Error)]
pub enum FitError {
    #[error("no error parameter to fit")]
    NoErrors,
    #[error("no monitor selected for the fit")]
    NoMonitors,
    #[error("zero step for error parameter {0}")]
    ZeroStep(String),
    #[error("{n_bounds} bounds given for {n_errors} error parameters")]
    BoundsMismatch { n_bounds: usize, n_errors: usize },
    #[error("invalid bounds [{lower}, {upper}] for error parameter {name}")]
    InvalidBounds { name: String, lower: f64, upper: f64 },
    #[error("monitor index {0} is out of range")]
    MonitorIndex(usize),
    #[error("measurement uncertainty {stddev} of monitor {monitor} is not a positive number, fit without weights instead")]
    InvalidStddev { monitor: usize, stddev: f64 },
    #[error("invalid fit mode `{0}`, expected `x`, `y` or `xy`")]
    Mode(String),
}

/// Reduced χ²: `r·r / (n - ddof)`
///
/// It is not defined (NaN) when `ddof` is not less than the number of
/// residuals.
pub fn reduced_chisq(residuals: &[f64], ddof: usize) -> f64 {
    let n = residuals.len();
    if ddof >= n {
        return f64::NAN;
    }
    residuals.iter().map(|r| r * r).sum::<f64>() / (n - ddof) as f64
}

/// Planes entering the fit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "x")]
    X,
    #[serde(rename = "y")]
    Y,
    #[default]
    #[serde(rename = "xy")]
    XY,
}
impl Mode {
    /// Plane indices, `x` is 0 and `y` is 1
    pub fn planes(&self) -> &'static [usize] {
        match self {
            Mode::X => &[0],
            Mode::Y => &[1],
            Mode::XY => &[0, 1],
        }
    }
}
impl FromStr for Mode {
    type Err = FitError;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "x" => Ok(Mode::X),
            "y" => Ok(Mode::Y),
            "xy" | "yx" => Ok(Mode::XY),
            _ => Err(FitError::Mode(s.into())),
        }
    }
}
impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::X => write!(f, "x"),
            Mode::Y => write!(f, "y"),
            Mode::XY => write!(f, "xy"),
        }
    }
}

/// Measured data a fit is matched against
#[derive(Debug, Clone, Copy)]
pub struct FitTarget<'a> {
    /// Monitors of the orbit response matrix
    pub monitors: &'a [String],
    /// Knobs of the orbit response matrix
    pub knobs: &'a [String],
    /// Measured orbit response matrix
    pub measured: &'a Orm,
    /// Measurement uncertainty, unit weights if `None`
    pub stddev: Option<&'a Orm>,
    /// Indices of the monitors entering the fit
    pub monitor_subset: &'a [usize],
    pub mode: Mode,
}

impl<'a> FitTarget<'a> {
    /// Checks the monitor subset and the uncertainties against the measured data
    pub fn validate(&self) -> std::result::Result<(), FitError> {
        if self.monitor_subset.is_empty() {
            return Err(FitError::NoMonitors);
        }
        if let Some(&m) = self
            .monitor_subset
            .iter()
            .find(|&&m| m >= self.measured.n_monitor())
        {
            return Err(FitError::MonitorIndex(m));
        }
        if let Some(stddev) = self.stddev {
            for &monitor in self.monitor_subset {
                if monitor >= stddev.n_monitor() {
                    return Err(FitError::MonitorIndex(monitor));
                }
                for value in stddev.select(&[monitor], self.mode.planes()) {
                    if !(value.is_finite() && value > 0.) {
                        return Err(FitError::InvalidStddev {
                            monitor,
                            stddev: value,
                        });
                    }
                }
            }
        }
        Ok(())
    }
    /// Model orbit response matrix at the current simulator state
    pub fn model_orm<S: Simulator + ?Sized>(&self, sim: &mut S) -> Result<Orm> {
        Ok(sim.orbit_response_matrix(self.monitors, self.knobs)?)
    }
    /// Weights of the selected entries, the inverse of the uncertainty
    pub fn weights(&self) -> DVector<f64> {
        let n = self.monitor_subset.len() * self.mode.planes().len() * self.knobs.len();
        match self.stddev {
            Some(stddev) => stddev
                .select_vector(self.monitor_subset, self.mode.planes())
                .map(|s| 1. / s),
            None => DVector::from_element(n, 1.),
        }
    }
    /// Weighted residuals `(measured - model) / stddev` of the selected entries
    pub fn residuals(&self, model: &Orm) -> DVector<f64> {
        let planes = self.mode.planes();
        let measured = self.measured.select_vector(self.monitor_subset, planes);
        let model = model.select_vector(self.monitor_subset, planes);
        (measured - model).component_mul(&self.weights())
    }
}

/// Progress of a fit passed to the callback after each stage
#[derive(Debug)]
pub struct FitState<'a> {
    /// Driver name
    pub stage: &'a str,
    /// Iteration number, starting at 1
    pub nit: usize,
    /// Reduced χ² at the end of the stage
    pub chisq: f64,
    /// Error changes of the stage
    pub dx: &'a [f64],
    /// Error changes since the start of the fit
    pub x: &'a [f64],
    /// Model orbit response matrix at the end of the stage
    pub model_orm: &'a Orm,
    pub monitor_subset: &'a [usize],
    pub errors: &'a [ErrorParameter],
}

/// Fit callback
pub type Callback<'a> = dyn FnMut(&FitState<'_>) + 'a;

/// Outcome of a fit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    /// Solver status
    pub success: bool,
    pub message: String,
    /// Number of iterations
    pub nit: usize,
    /// Fitted error changes
    pub x: Vec<f64>,
    /// Final reduced χ²
    pub chisq: f64,
    /// Reduced χ² after each iteration
    pub history: Vec<f64>,
}
impl Display for FitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Fit outcome ({}):", if self.success { "success" } else { "failure" })?;
        writeln!(f, " * message: {}", self.message)?;
        writeln!(f, " * iterations: {}", self.nit)?;
        writeln!(f, " * red χ²: {:e}", self.chisq)?;
        write!(f, " * x: {:?}", self.x)
    }
}

/// Fit strategy
pub trait FitDriver {
    /// Fits `errors` to the target
    ///
    /// `iterations` is the number of iterations or the iteration cap,
    /// depending on the driver.
    /// On return, the `base` of each error is increased by the fitted
    /// change and the change is applied to the simulator.
    fn fit<S: Simulator + ?Sized>(
        &self,
        sim: &mut S,
        target: &FitTarget<'_>,
        errors: &mut [ErrorParameter],
        iterations: usize,
        callback: &mut Callback<'_>,
    ) -> Result<FitOutcome>;
}

// Commits fitted changes to the errors and to the simulator
fn commit<S: Simulator + ?Sized>(
    sim: &mut S,
    errors: &mut [ErrorParameter],
    dx: &[f64],
) -> Result<()> {
    for (error, &dx) in errors.iter_mut().zip(dx) {
        error.base += dx;
        error.apply(sim, dx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chisq() {
        assert_eq!(reduced_chisq(&[1., 2., 2.], 0), 3.);
        assert_eq!(reduced_chisq(&[1., 2., 2.], 1), 4.5);
        assert_eq!(reduced_chisq(&[0.; 5], 2), 0.);
        assert!(reduced_chisq(&[1.], 1).is_nan());
    }

    #[test]
    fn modes() {
        assert_eq!("XY".parse::<Mode>().unwrap(), Mode::XY);
        assert_eq!("y".parse::<Mode>().unwrap().planes(), &[1]);
        assert!("z".parse::<Mode>().is_err());
        assert_eq!(Mode::X.to_string(), "x");
    }

    #[test]
    fn residuals() {
        let measured = Orm::from_fn(3, 2, |m, p, k| (m * 4 + p * 2 + k) as f64);
        let stddev = Orm::filled(3, 2, 0.5);
        let model = Orm::zeros(3, 2);
        let (monitors, knobs) = (vec![String::new(); 3], vec![String::new(); 2]);
        let target = FitTarget {
            monitors: &monitors,
            knobs: &knobs,
            measured: &measured,
            stddev: Some(&stddev),
            monitor_subset: &[2, 0],
            mode: Mode::Y,
        };
        assert_eq!(
            target.residuals(&model).as_slice(),
            &[20., 22., 4., 6.]
        );
        assert!(target.validate().is_ok());
        let target = FitTarget {
            monitor_subset: &[3],
            ..target
        };
        assert!(target.validate().is_err());
    }

    #[test]
    fn invalid_stddev() {
        let measured = Orm::zeros(2, 1);
        let mut stddev = Orm::filled(2, 1, 1e-3);
        stddev[(1, 0, 0)] = 0.;
        let (monitors, knobs) = (vec![String::new(); 2], vec![String::new()]);
        let target = FitTarget {
            monitors: &monitors,
            knobs: &knobs,
            measured: &measured,
            stddev: Some(&stddev),
            monitor_subset: &[0, 1],
            mode: Mode::Y,
        };
        assert!(target.validate().is_ok());
        assert!(matches!(
            FitTarget {
                mode: Mode::XY,
                ..target
            }
            .validate(),
            Err(FitError::InvalidStddev { monitor: 1, stddev }) if stddev == 0.
        ));
        assert!(FitTarget {
            mode: Mode::X,
            monitor_subset: &[0],
            ..target
        }
        .validate()
        .is_ok());
        assert!(FitTarget {
            stddev: None,
            mode: Mode::XY,
            ..target
        }
        .validate()
        .is_ok());
    }
}
