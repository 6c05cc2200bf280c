//!
//! # Fit session
//!
//! [Analysis] ties a [Simulator] to the measured [OrbitResponse] and keeps
//! the model orbit response matrix in sync with the simulator state.
//!
//! A typical session:
//!  1. [Analysis::load] the record files,
//!  2. [Analysis::init] the model with the baseline knob strengths,
//!  3. optionally [Analysis::backtrack] the initial orbit,
//!  4. one or several [Analysis::fit] stages, or [Analysis::run] for an
//!     [AnalysisSpec].

use std::{collections::BTreeMap, fmt::Display, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    fit::{reduced_chisq, FitError, FitState, FitTarget, Mode},
    simulator::Simulator,
    ErrorParameter, FitConfig, FitOutcome, OrbitResponse, Orm, Result,
};

mod report;
mod spec;

pub use report::{FitReport, ReportError};
pub use spec::{AnalysisSpec, StageSpec};

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("cannot read analysis file: {1}")]
    Open(#[source] std::io::Error, std::path::PathBuf),
    #[error("unknown analysis file format: {0}, expected toml or yaml")]
    Format(std::path::PathBuf),
    #[error("cannot deserialize analysis from toml")]
    Toml(#[from] toml::de::Error),
    #[error("cannot deserialize analysis from yaml")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no baseline orbit at monitor `{0}`")]
    NoBaseOrbit(String),
    #[error("no monitor to backtrack the initial orbit from")]
    NoReadouts,
}

/// Reduced χ² overall and per plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChiSquared {
    pub total: f64,
    pub x: f64,
    pub y: f64,
}
impl ChiSquared {
    /// Reduced χ² of `(measured - model) / stddev` over the monitor selection
    pub fn new(
        measured: &Orm,
        stddev: &Orm,
        model: &Orm,
        selection: &[usize],
        ddof: usize,
    ) -> Self {
        let chisq = |mode: Mode| {
            let residuals = (measured.select_vector(selection, mode.planes())
                - model.select_vector(selection, mode.planes()))
            .component_div(&stddev.select_vector(selection, mode.planes()));
            reduced_chisq(residuals.as_slice(), ddof)
        };
        Self {
            total: chisq(Mode::XY),
            x: chisq(Mode::X),
            y: chisq(Mode::Y),
        }
    }
}
impl Display for ChiSquared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "red χ² = {:e} (x: {:e}, y: {:e})",
            self.total, self.x, self.y
        )
    }
}

/// Monitor reading used to backtrack the initial orbit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readout {
    pub name: String,
    pub posx: f64,
    pub posy: f64,
}

/// Initial orbit coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InitialOrbit {
    pub x: f64,
    pub px: f64,
    pub y: f64,
    pub py: f64,
}
impl InitialOrbit {
    fn coordinates(&self) -> [(&'static str, f64); 4] {
        [("x", self.x), ("px", self.px), ("y", self.y), ("py", self.py)]
    }
}

/// Initial orbit fit from monitor readouts
///
/// The particle orbit fit belongs to the simulator side; [Analysis::backtrack]
/// only gathers the readouts and applies the result.
pub trait InitialOrbitFit {
    /// Fits the initial orbit reproducing `readouts`, given in lattice order
    fn fit_initial_orbit(&self, sim: &dyn Simulator, readouts: &[Readout]) -> Result<InitialOrbit>;
}
impl<F> InitialOrbitFit for F
where
    F: Fn(&dyn Simulator, &[Readout]) -> Result<InitialOrbit>,
{
    fn fit_initial_orbit(&self, sim: &dyn Simulator, readouts: &[Readout]) -> Result<InitialOrbit> {
        self(sim, readouts)
    }
}

/// Fit session over a simulator and a measured orbit response
pub struct Analysis<S: Simulator> {
    sim: S,
    measured: OrbitResponse,
    model_orm: Orm,
}

impl<S: Simulator> Analysis<S> {
    /// Creates a session and computes the model orbit response matrix
    pub fn new(mut sim: S, measured: OrbitResponse) -> Result<Self> {
        let model_orm = sim.orbit_response_matrix(measured.monitors(), measured.knobs())?;
        Ok(Self {
            sim,
            measured,
            model_orm,
        })
    }
    /// Creates a session from record files
    pub fn load<P: AsRef<Path>>(sim: S, paths: &[P]) -> Result<Self> {
        let measured = OrbitResponse::load(&sim, paths)?;
        Self::new(sim, measured)
    }
    pub fn simulator(&self) -> &S {
        &self.sim
    }
    pub fn simulator_mut(&mut self) -> &mut S {
        &mut self.sim
    }
    pub fn into_simulator(self) -> S {
        self.sim
    }
    pub fn measured(&self) -> &OrbitResponse {
        &self.measured
    }
    /// Model orbit response matrix at the current simulator state
    pub fn model_orm(&self) -> &Orm {
        &self.model_orm
    }
    fn update_model(&mut self) -> Result<()> {
        self.sim.invalidate_twiss();
        self.model_orm = self
            .sim
            .orbit_response_matrix(self.measured.monitors(), self.measured.knobs())?;
        Ok(())
    }
    /// Applies the baseline knob strengths and recomputes the model
    ///
    /// The strengths default to the ones of the records.
    pub fn init(&mut self, strengths: Option<&BTreeMap<String, f64>>) -> Result<ChiSquared> {
        log::info!("initial model");
        let strengths = strengths.unwrap_or_else(|| self.measured.strengths());
        self.sim
            .update_globals(strengths.iter().map(|(k, v)| (k.as_str(), *v)))?;
        self.update_model()?;
        self.info(None, 0)
    }
    /// Reduced χ² of the model over the monitor selection, all monitors if `None`
    pub fn info(&self, selection: Option<&[usize]>, ddof: usize) -> Result<ChiSquared> {
        let all: Vec<usize> = (0..self.measured.monitors().len()).collect();
        let selection = selection.unwrap_or(&all);
        if let Some(&m) = selection.iter().find(|&&m| m >= all.len()) {
            return Err(FitError::MonitorIndex(m).into());
        }
        let chisq = ChiSquared::new(
            self.measured.orm(),
            self.measured.stddev(),
            &self.model_orm,
            selection,
            ddof,
        );
        log::info!("{}", chisq);
        Ok(chisq)
    }
    /// Backtracks the initial orbit from the baseline orbit at `monitors`
    ///
    /// The fitted initial orbit is applied to the simulator and the model is
    /// recomputed.
    pub fn backtrack<F: InitialOrbitFit + ?Sized>(
        &mut self,
        monitors: &[String],
        fitter: &F,
    ) -> Result<InitialOrbit> {
        let mut sorted = monitors
            .iter()
            .map(|m| {
                let index = self
                    .sim
                    .element_index(m)
                    .ok_or_else(|| crate::response::ResponseError::UnknownMonitor(m.clone()))?;
                Ok((index, m.to_lowercase()))
            })
            .collect::<Result<Vec<_>>>()?;
        sorted.sort();
        if sorted.is_empty() {
            return Err(AnalysisError::NoReadouts.into());
        }
        let readouts = sorted
            .into_iter()
            .map(|(_, name)| match self.measured.base_orbit(&name) {
                Some([posx, posy]) => Ok(Readout { name, posx, posy }),
                None => Err(AnalysisError::NoBaseOrbit(name).into()),
            })
            .collect::<Result<Vec<_>>>()?;
        log::info!(
            "backtracking initial orbit from {} monitor(s) starting at `{}`",
            readouts.len(),
            readouts[0].name
        );
        let initial = fitter.fit_initial_orbit(&self.sim, &readouts)?;
        for (name, value) in initial.coordinates() {
            self.sim.set_initial_condition(name, value)?;
        }
        self.update_model()?;
        log::info!("initial orbit: {:?}", initial);
        Ok(initial)
    }
    /// Fits `errors` to the measured orbit response
    ///
    /// Only the `monitors` (all if `None`) enter the fit. After each
    /// iteration the reduced χ² is logged for the fitted monitors, the
    /// other ones and all of them. The fitted errors stay applied to the
    /// simulator and their `base` holds the fitted values.
    /// If `save_to` is given, the [FitReport] is written there.
    pub fn fit(
        &mut self,
        errors: &mut [ErrorParameter],
        monitors: Option<&[String]>,
        config: &FitConfig,
        save_to: Option<&Path>,
    ) -> Result<FitOutcome> {
        let selected = match monitors {
            Some(monitors) => self.measured.monitor_indices(monitors)?,
            None => (0..self.measured.monitors().len()).collect(),
        };
        let elsewhere: Vec<usize> = (0..self.measured.monitors().len())
            .filter(|m| !selected.contains(m))
            .collect();
        let names: Vec<String> = errors.iter().map(|e| e.name.clone()).collect();
        log::info!(
            "fit of {} on {}",
            names.join(", "),
            selected
                .iter()
                .map(|&m| self.measured.monitors()[m].as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        log::info!("{}", config);

        let Self {
            sim,
            measured,
            model_orm,
        } = self;
        let target = FitTarget {
            monitors: measured.monitors(),
            knobs: measured.knobs(),
            measured: measured.orm(),
            stddev: config.use_stddev.then(|| measured.stddev()),
            monitor_subset: &selected,
            mode: config.mode,
        };
        let mut callback = |state: &FitState<'_>| {
            let chisq = |selection: &[usize]| {
                ChiSquared::new(measured.orm(), measured.stddev(), state.model_orm, selection, 0)
            };
            log::info!("{} #{}: {}", state.stage, state.nit, names.join(", "));
            log::info!(" ΔX = {:?}", state.dx);
            log::info!(" X  = {:?}", state.x);
            log::info!(" (fit) {}", chisq(state.monitor_subset));
            if !elsewhere.is_empty() {
                log::info!(" (elsewhere) {}", chisq(&elsewhere));
                let all: Vec<usize> = (0..measured.monitors().len()).collect();
                log::info!(" (overall) {}", chisq(&all));
            }
        };
        let outcome = config.fit(sim, &target, errors, &mut callback)?;
        sim.invalidate_twiss();
        *model_orm = target.model_orm(sim)?;
        log::info!("{}", outcome.message);

        if let Some(path) = save_to {
            FitReport::new(errors, &outcome).save(path)?;
            log::info!("fit report saved to {:?}", path);
        }
        Ok(outcome)
    }
    /// Runs every stage of `spec`
    ///
    /// The model is initialized with the [AnalysisSpec] strengths first.
    pub fn run(&mut self, spec: &AnalysisSpec) -> Result<Vec<FitReport>> {
        self.init(spec.strengths.as_ref())?;
        let mut reports = Vec::with_capacity(spec.stages.len());
        for (i, stage) in spec.stages.iter().enumerate() {
            log::info!(
                "stage #{}: {}",
                i + 1,
                stage.name.as_deref().unwrap_or("unnamed")
            );
            let mut errors = stage.errors.errors()?;
            let outcome = self.fit(
                &mut errors,
                stage.monitors.as_deref(),
                &stage.config,
                stage.save_to.as_deref(),
            )?;
            reports.push(FitReport::new(&errors, &outcome));
        }
        Ok(reports)
    }
}

impl<S: Simulator> Display for Analysis<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ORM analysis:")?;
        write!(f, "{}", self.measured)
    }
}
