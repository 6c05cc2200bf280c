//!
//! # Measured orbit response
//!
//! [OrbitResponse] turns orbit records into the measured orbit response
//! matrix and its uncertainty.
//! For every monitor and knob the response is the orbit difference between
//! the knob optics and the baseline optics, divided by the knob strength
//! difference.
//! Monitors and knobs are sorted in lattice order, a knob being located at
//! the first element it affects: its steerer.
//!
//! Pairs without data are kept as `None` and resolved at assembly into
//! [Response::MISSING], a response with zero orbit change, a very large
//! knob change and unit variance. Such pairs have a null response and a
//! negligible weight in the fits.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    path::Path,
};

use crate::{
    record::{RecordError, RecordFile},
    simulator::Simulator,
    Orm,
};

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("no orbit record")]
    NoRecords,
    #[error("failed to load orbit records")]
    Record(#[from] RecordError),
    #[error("monitor `{0}` is not in the lattice")]
    UnknownMonitor(String),
    #[error("knob `{0}` does not affect any element of the lattice")]
    UnknownKnob(String),
    #[error("no baseline strength for knob `{0}`")]
    MissingStrength(String),
}
type Result<T> = std::result::Result<T, ResponseError>;

/// Orbit response of a monitor to a knob
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Response {
    /// `[x, y]` orbit change
    pub orbit: [f64; 2],
    /// Knob strength change
    pub delta: f64,
    /// `[x, y]` variance of the orbit change
    pub variance: [f64; 2],
}

impl Response {
    /// Stand-in for pairs without measurement
    pub const MISSING: Response = Response {
        orbit: [0.; 2],
        delta: 1e5,
        variance: [1.; 2],
    };
    /// Orbit change per unit knob change
    pub fn slope(&self) -> [f64; 2] {
        [self.orbit[0] / self.delta, self.orbit[1] / self.delta]
    }
    /// Uncertainty of [Response::slope]
    pub fn stddev(&self) -> [f64; 2] {
        [
            self.variance[0].sqrt() / self.delta.abs(),
            self.variance[1].sqrt() / self.delta.abs(),
        ]
    }
}

/// Measured orbit response matrix
///
/// Immutable once loaded.
#[derive(Debug, Clone)]
pub struct OrbitResponse {
    monitors: Vec<String>,
    knobs: Vec<String>,
    steerers: Vec<String>,
    strengths: BTreeMap<String, f64>,
    base_orbit: Vec<Option<[f64; 2]>>,
    responses: Vec<Option<Response>>,
    orm: Orm,
    stddev: Orm,
}

impl OrbitResponse {
    /// Loads and merges record files, later files override earlier ones
    pub fn load<S, P>(sim: &S, paths: &[P]) -> Result<Self>
    where
        S: Simulator + ?Sized,
        P: AsRef<Path>,
    {
        let files = paths
            .iter()
            .map(RecordFile::load)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Self::from_records(sim, files)
    }
    /// Builds the response from already loaded records
    pub fn from_records<S, I>(sim: &S, files: I) -> Result<Self>
    where
        S: Simulator + ?Sized,
        I: IntoIterator<Item = RecordFile>,
    {
        let mut merged = RecordFile::default();
        let mut n_file = 0;
        for file in files {
            merged.merge(file);
            n_file += 1;
        }
        if merged.records.is_empty() {
            return Err(ResponseError::NoRecords);
        }
        let RecordFile { strengths, records } = merged;

        let mut monitors: Vec<(usize, String)> = vec![];
        let mut knobs: Vec<String> = vec![];
        for (monitor, knob) in records.keys() {
            if !monitors.iter().any(|(_, m)| m == monitor) {
                let index = sim
                    .element_index(monitor)
                    .ok_or_else(|| ResponseError::UnknownMonitor(monitor.clone()))?;
                monitors.push((index, monitor.clone()));
            }
            if let Some(knob) = knob {
                if !knobs.contains(knob) {
                    knobs.push(knob.clone());
                }
            }
        }
        monitors.sort();
        let monitors: Vec<String> = monitors.into_iter().map(|(_, m)| m).collect();

        let mut steerer_of: HashMap<String, (usize, String)> = HashMap::new();
        for (index, element) in sim.elements().into_iter().enumerate() {
            for knob in element.knobs {
                steerer_of
                    .entry(knob.to_lowercase())
                    .or_insert_with(|| (index, element.name.clone()));
            }
        }
        let mut sorted_knobs = knobs
            .into_iter()
            .map(|knob| match steerer_of.get(&knob) {
                Some((index, steerer)) => Ok((*index, knob, steerer.clone())),
                None => Err(ResponseError::UnknownKnob(knob)),
            })
            .collect::<Result<Vec<_>>>()?;
        sorted_knobs.sort();
        let knobs: Vec<String> = sorted_knobs.iter().map(|(_, k, _)| k.clone()).collect();
        let steerers: Vec<String> = sorted_knobs.into_iter().map(|(_, _, s)| s).collect();

        let base_orbit: Vec<Option<[f64; 2]>> = monitors
            .iter()
            .map(|m| records.get(&(m.clone(), None)).map(|r| r.orbit))
            .collect();
        let mut responses = Vec::with_capacity(monitors.len() * knobs.len());
        for monitor in &monitors {
            let base = records.get(&(monitor.clone(), None));
            for knob in &knobs {
                let baseline = *strengths
                    .get(knob)
                    .ok_or_else(|| ResponseError::MissingStrength(knob.clone()))?;
                let response = match (records.get(&(monitor.clone(), Some(knob.clone()))), base) {
                    (Some(kicked), Some(base)) => {
                        let delta = kicked.strength.unwrap_or(baseline) - baseline;
                        if delta == 0. {
                            log::warn!("no strength change of `{}` at `{}`", knob, monitor);
                            None
                        } else {
                            Some(Response {
                                orbit: [
                                    kicked.orbit[0] - base.orbit[0],
                                    kicked.orbit[1] - base.orbit[1],
                                ],
                                delta,
                                variance: [
                                    kicked.variance[0] + base.variance[0],
                                    kicked.variance[1] + base.variance[1],
                                ],
                            })
                        }
                    }
                    _ => None,
                };
                responses.push(response);
            }
        }

        let n_missing = responses.iter().filter(|r| r.is_none()).count();
        if n_missing > 0 {
            log::warn!(
                "{} of {} monitor/knob pairs without data",
                n_missing,
                responses.len()
            );
        }
        let n_knob = knobs.len();
        let resolved = |m: usize, k: usize| responses[m * n_knob + k].unwrap_or(Response::MISSING);
        let orm = Orm::from_fn(monitors.len(), n_knob, |m, p, k| resolved(m, k).slope()[p]);
        let stddev = Orm::from_fn(monitors.len(), n_knob, |m, p, k| resolved(m, k).stddev()[p]);

        log::info!(
            "orbit response from {} file(s): {} monitors x {} knobs",
            n_file,
            monitors.len(),
            n_knob
        );
        Ok(Self {
            monitors,
            knobs,
            steerers,
            strengths,
            base_orbit,
            responses,
            orm,
            stddev,
        })
    }
    /// Monitors in lattice order
    pub fn monitors(&self) -> &[String] {
        &self.monitors
    }
    /// Knobs in lattice order of their steerers
    pub fn knobs(&self) -> &[String] {
        &self.knobs
    }
    /// First element affected by each knob
    pub fn steerers(&self) -> &[String] {
        &self.steerers
    }
    /// Baseline knob strengths
    pub fn strengths(&self) -> &BTreeMap<String, f64> {
        &self.strengths
    }
    /// Measured orbit response matrix
    pub fn orm(&self) -> &Orm {
        &self.orm
    }
    /// Uncertainty of the measured orbit response matrix
    pub fn stddev(&self) -> &Orm {
        &self.stddev
    }
    /// Measured response, `None` if the pair has no data
    pub fn response(&self, monitor: &str, knob: &str) -> Option<&Response> {
        let m = self.monitor_index(monitor)?;
        let k = self
            .knobs
            .iter()
            .position(|x| x.eq_ignore_ascii_case(knob))?;
        self.responses[m * self.knobs.len() + k].as_ref()
    }
    /// Baseline `[x, y]` orbit at a monitor
    pub fn base_orbit(&self, monitor: &str) -> Option<[f64; 2]> {
        self.base_orbit[self.monitor_index(monitor)?]
    }
    /// Knob strength change per knob
    ///
    /// If a knob was measured with different strengths at different
    /// monitors, the change at the last monitor in lattice order is used.
    pub fn deltas(&self) -> BTreeMap<String, f64> {
        let mut deltas = BTreeMap::new();
        for (i, response) in self.responses.iter().enumerate() {
            if let Some(response) = response {
                deltas.insert(self.knobs[i % self.knobs.len()].clone(), response.delta);
            }
        }
        deltas
    }
    fn monitor_index(&self, monitor: &str) -> Option<usize> {
        self.monitors
            .iter()
            .position(|m| m.eq_ignore_ascii_case(monitor))
    }
    /// Indices of monitors given by name, case insensitive
    pub fn monitor_indices<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.monitor_index(name.as_ref())
                    .ok_or_else(|| ResponseError::UnknownMonitor(name.as_ref().into()))
            })
            .collect()
    }
}

impl Display for OrbitResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n_missing = self.responses.iter().filter(|r| r.is_none()).count();
        writeln!(f, "Orbit response:")?;
        writeln!(f, " * monitors ({}): {}", self.monitors.len(), self.monitors.join(" "))?;
        writeln!(f, " * knobs ({}): {}", self.knobs.len(), self.knobs.join(" "))?;
        writeln!(f, " * steerers: {}", self.steerers.join(" "))?;
        write!(f, " * missing pairs: {}/{}", n_missing, self.responses.len())
    }
}
