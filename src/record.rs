//!
//! # Orbit record files
//!
//! Record files are written by the orbit response measurement procedure.
//! They are YAML documents with the baseline knob strengths (`model`), the
//! monitors that were read out and one entry per optics setting:
//!
//! ```yaml
//! model:
//!   kh1: 0.0
//! monitors: [m1, m2]
//! records:
//!   - optics: ~              # baseline
//!     shots:
//!       - {m1: [1.0e-3, 2.0e-4], m2: [0.0, 1.0e-4]}
//!       - {m1: [1.1e-3, 2.1e-4], m2: [0.1e-4, 1.0e-4]}
//!   - optics: {kh1: 1.0e-4}
//!     shots:
//!       - {m1: [1.5e-3, 2.0e-4], m2: [0.5e-4, 1.0e-4]}
//! ```
//!
//! Each shot maps a monitor to `[x, y, ...]`; only the first two
//! coordinates are used.

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("cannot open record file: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("cannot parse record file: {1}")]
    Parse(#[source] serde_yaml::Error, PathBuf),
    #[error("record #{record} of {path} has no shot")]
    NoShot { path: PathBuf, record: usize },
    #[error("monitor `{monitor}` is missing from a shot of record #{record} of {path}")]
    MissingMonitor {
        path: PathBuf,
        record: usize,
        monitor: String,
    },
    #[error("monitor `{monitor}` reading has less than 2 coordinates in {path}")]
    ShortReading { path: PathBuf, monitor: String },
}
type Result<T> = std::result::Result<T, RecordError>;

#[derive(Debug, Deserialize, Serialize)]
struct RawRecord {
    optics: Option<BTreeMap<String, f64>>,
    shots: Vec<BTreeMap<String, Vec<f64>>>,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawFile {
    model: BTreeMap<String, f64>,
    monitors: Vec<String>,
    records: Vec<RawRecord>,
}

/// Averaged monitor reading for one optics setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Knob strength, `None` for the baseline optics
    pub strength: Option<f64>,
    /// Mean `[x, y]` orbit
    pub orbit: [f64; 2],
    /// Variance of the mean orbit
    pub variance: [f64; 2],
}

impl Measurement {
    /// Averages the shots
    ///
    /// The variance of the mean is the unbiased sample variance divided by
    /// the number of shots. It is undefined for a single shot and set to 1.
    pub fn from_shots(strength: Option<f64>, shots: &[[f64; 2]]) -> Self {
        let n = shots.len() as f64;
        let mut orbit = [0f64; 2];
        let mut variance = [1f64; 2];
        for i in 0..2 {
            orbit[i] = shots.iter().map(|s| s[i]).sum::<f64>() / n;
            if shots.len() > 1 {
                variance[i] = shots.iter().map(|s| (s[i] - orbit[i]).powi(2)).sum::<f64>()
                    / (n - 1.)
                    / n;
            }
        }
        Self {
            strength,
            orbit,
            variance,
        }
    }
}

/// Record key: monitor and knob (`None` for the baseline)
pub type RecordKey = (String, Option<String>);

/// Content of a record file with lower-cased names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFile {
    /// Baseline knob strengths
    pub strengths: BTreeMap<String, f64>,
    /// Measurements per monitor and knob
    pub records: BTreeMap<RecordKey, Measurement>,
}

impl RecordFile {
    /// Loads a YAML record file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RecordError::Open(e, path.to_path_buf()))?;
        let raw: RawFile =
            serde_yaml::from_reader(file).map_err(|e| RecordError::Parse(e, path.to_path_buf()))?;
        let records = Self::from_raw(raw, path)?;
        log::info!(
            "loaded {} records from {}",
            records.records.len(),
            path.display()
        );
        Ok(records)
    }
    /// Parses YAML records, `origin` is only used in error messages
    pub fn from_yaml(yaml: &str, origin: impl AsRef<Path>) -> Result<Self> {
        let origin = origin.as_ref();
        let raw: RawFile =
            serde_yaml::from_str(yaml).map_err(|e| RecordError::Parse(e, origin.to_path_buf()))?;
        Self::from_raw(raw, origin)
    }
    fn from_raw(raw: RawFile, path: &Path) -> Result<Self> {
        let strengths = raw
            .model
            .into_iter()
            .map(|(knob, value)| (knob.to_lowercase(), value))
            .collect();
        let mut records = BTreeMap::new();
        for (i, record) in raw.records.iter().enumerate() {
            if record.shots.is_empty() {
                return Err(RecordError::NoShot {
                    path: path.to_path_buf(),
                    record: i,
                });
            }
            let optics: Vec<(Option<String>, Option<f64>)> = match &record.optics {
                Some(optics) => optics
                    .iter()
                    .map(|(knob, &value)| (Some(knob.to_lowercase()), Some(value)))
                    .collect(),
                None => vec![(None, None)],
            };
            for monitor in &raw.monitors {
                let shots = record
                    .shots
                    .iter()
                    .map(|shot| -> Result<[f64; 2]> {
                        let reading = shot
                            .iter()
                            .find(|(name, _)| name.eq_ignore_ascii_case(monitor))
                            .map(|(_, reading)| reading)
                            .ok_or_else(|| RecordError::MissingMonitor {
                                path: path.to_path_buf(),
                                record: i,
                                monitor: monitor.clone(),
                            })?;
                        match reading.as_slice() {
                            [x, y, ..] => Ok([*x, *y]),
                            _ => Err(RecordError::ShortReading {
                                path: path.to_path_buf(),
                                monitor: monitor.clone(),
                            }),
                        }
                    })
                    .collect::<Result<Vec<[f64; 2]>>>()?;
                for (knob, strength) in &optics {
                    records.insert(
                        (monitor.to_lowercase(), knob.clone()),
                        Measurement::from_shots(*strength, &shots),
                    );
                }
            }
        }
        Ok(Self { strengths, records })
    }
    /// Merges `other` into `self`, entries of `other` take precedence
    pub fn merge(&mut self, other: RecordFile) {
        self.strengths.extend(other.strengths);
        self.records.extend(other.records);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDS: &str = r#"
model: {KH1: 0.5, kv1: -0.25}
monitors: [M1, m2]
records:
  - optics: null
    shots:
      - {m1: [1.0, 2.0, 9.0], M2: [0.0, 0.0]}
      - {m1: [3.0, 4.0, 9.0], M2: [0.0, 0.0]}
  - optics: {kh1: 0.6}
    shots:
      - {m1: [2.0, 2.0], m2: [1.0, 0.0]}
"#;

    #[test]
    fn parse() {
        let records = RecordFile::from_yaml(RECORDS, "test.yml").unwrap();
        assert_eq!(records.strengths["kh1"], 0.5);
        assert_eq!(records.records.len(), 4);
        let base = records.records[&("m1".to_string(), None)];
        assert_eq!(base.strength, None);
        assert_eq!(base.orbit, [2., 3.]);
        assert_eq!(base.variance, [1., 1.]);
        let kicked = records.records[&("m2".to_string(), Some("kh1".to_string()))];
        assert_eq!(kicked.strength, Some(0.6));
        assert_eq!(kicked.orbit, [1., 0.]);
    }

    #[test]
    fn variance_of_mean() {
        let m = Measurement::from_shots(None, &[[0., 1.], [2., 1.], [4., 1.]]);
        assert_eq!(m.orbit, [2., 1.]);
        assert!((m.variance[0] - 4. / 3.).abs() < 1e-15);
        assert_eq!(m.variance[1], 0.);
    }

    #[test]
    fn invalid() {
        let missing = RECORDS.replace("M2: [0.0, 0.0]}\n      - {m1: [3.0", "m3: [0.0, 0.0]}\n      - {m1: [3.0");
        assert!(matches!(
            RecordFile::from_yaml(&missing, "test.yml"),
            Err(RecordError::MissingMonitor { record: 0, .. })
        ));
        let short = RECORDS.replace("[2.0, 2.0]", "[2.0]");
        assert!(matches!(
            RecordFile::from_yaml(&short, "test.yml"),
            Err(RecordError::ShortReading { .. })
        ));
        assert!(matches!(
            RecordFile::from_yaml("model: {}", "test.yml"),
            Err(RecordError::Parse(..))
        ));
        assert!(matches!(
            RecordFile::load("/nonexistent/records.yml"),
            Err(RecordError::Open(..))
        ));
    }

    #[test]
    fn merge() {
        let mut first = RecordFile::from_yaml(RECORDS, "a.yml").unwrap();
        let second = RecordFile::from_yaml(&RECORDS.replace("0.6", "0.7"), "b.yml").unwrap();
        first.merge(second);
        let kicked = first.records[&("m1".to_string(), Some("kh1".to_string()))];
        assert_eq!(kicked.strength, Some(0.7));
    }
}
