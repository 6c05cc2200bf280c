use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::AnalysisError;
use crate::{FitConfig, FitSpec};

/// One fit of an analysis
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    /// Stage label used in the logs
    #[serde(default)]
    pub name: Option<String>,
    /// Errors to fit with their initial steps
    pub errors: FitSpec,
    /// Monitors entering the fit, all monitors if `None`
    #[serde(default)]
    pub monitors: Option<Vec<String>>,
    #[serde(default)]
    pub config: FitConfig,
    /// Fit report file, pickle if the extension is `pkl`, text otherwise
    #[serde(default)]
    pub save_to: Option<PathBuf>,
}

/// Sequence of fits over a set of orbit records
///
/// ```yaml
/// records: [orm-1.yml, orm-2.yml]
/// stages:
///   - name: quadrupoles
///     errors: {"δq1->k1": ~, "δq2->k1": 1.0e-3}
///     config: {algorithm: lstsq, iterations: 3}
///   - errors: {"q1<dx>": ~}
///     monitors: [m1, m2]
///     config: {algorithm: minimize, mode: x}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSpec {
    /// Record files, relative paths are resolved against the spec file directory
    #[serde(default)]
    pub records: Vec<PathBuf>,
    /// Baseline strengths applied at initialization, the measured ones if `None`
    #[serde(default)]
    pub strengths: Option<std::collections::BTreeMap<String, f64>>,
    pub stages: Vec<StageSpec>,
}

impl AnalysisSpec {
    /// Loads the analysis from a TOML (`.toml`) or YAML (`.yml`, `.yaml`) file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AnalysisError> {
        let path = path.as_ref();
        let mut contents = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut contents))
            .map_err(|e| AnalysisError::Open(e, path.into()))?;
        let mut spec: AnalysisSpec = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&contents)?,
            Some("yml") | Some("yaml") => serde_yaml::from_str(&contents)?,
            _ => return Err(AnalysisError::Format(path.into())),
        };
        if let Some(dir) = path.parent() {
            spec.records = spec
                .records
                .into_iter()
                .map(|record| {
                    if record.is_relative() {
                        dir.join(record)
                    } else {
                        record
                    }
                })
                .collect();
        }
        log::info!(
            "analysis {:?}: {} record file(s), {} stage(s)",
            path,
            spec.records.len(),
            spec.stages.len()
        );
        Ok(spec)
    }
}
