use std::{
    fmt::Display,
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{ErrorParameter, FitOutcome};

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("cannot open fit report: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("cannot create fit report: {1}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("cannot write fit report: {1}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("failed to (de)serialize fit report to/from pickle")]
    Pickle(#[from] serde_pickle::Error),
}
type Result<T> = std::result::Result<T, ReportError>;

/// Fitted errors of one fit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    /// Error names
    pub names: Vec<String>,
    /// Fitted error values, the accumulated `base` of each error
    pub values: Vec<f64>,
    /// Error changes of this fit
    pub changes: Vec<f64>,
    /// Reduced χ² after each iteration
    pub history: Vec<f64>,
    pub success: bool,
    pub message: String,
}

impl FitReport {
    pub fn new(errors: &[ErrorParameter], outcome: &FitOutcome) -> Self {
        Self {
            names: errors.iter().map(|e| e.name.clone()).collect(),
            values: errors.iter().map(|e| e.base).collect(),
            changes: outcome.x.clone(),
            history: outcome.history.clone(),
            success: outcome.success,
            message: outcome.message.clone(),
        }
    }
    /// Final reduced χ², `None` if no iteration completed
    pub fn chisq(&self) -> Option<f64> {
        self.history.last().copied()
    }
    /// Saves the report to a pickle file
    pub fn to_pickle<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|e| ReportError::Create(e, path.into()))?;
        serde_pickle::to_writer(&mut file, self, Default::default())?;
        Ok(())
    }
    /// Loads a report from a pickle file
    pub fn from_pickle<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ReportError::Open(e, path.into()))?;
        Ok(serde_pickle::from_reader(
            BufReader::new(file),
            Default::default(),
        )?)
    }
    /// Writes `name: value` lines
    pub fn save_text<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut file = File::create(path).map_err(|e| ReportError::Create(e, path.into()))?;
        let text: Vec<String> = self
            .names
            .iter()
            .zip(&self.values)
            .map(|(name, value)| format!("{}: {}", name, value))
            .collect();
        file.write_all(text.join("\n").as_bytes())
            .map_err(|e| ReportError::Write(e, path.into()))
    }
    /// Saves to pickle if the extension is `pkl` or `pickle`, to text otherwise
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("pkl") | Some("pickle") => self.to_pickle(path),
            _ => self.save_text(path),
        }
    }
}

impl Display for FitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Fit report ({}):", self.message)?;
        for ((name, value), change) in self.names.iter().zip(&self.values).zip(&self.changes) {
            writeln!(f, " * {}: {:e} ({:+e})", name, value, change)?;
        }
        match self.chisq() {
            Some(chisq) => write!(f, " * red χ²: {:e}", chisq),
            None => write!(f, " * red χ²: n/a"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> FitReport {
        let errors: Vec<ErrorParameter> = ["kq1", "q1<dx>"]
            .iter()
            .zip([0.5, -1e-3])
            .map(|(s, base)| ErrorParameter {
                base,
                ..s.parse().unwrap()
            })
            .collect();
        let outcome = FitOutcome {
            success: true,
            message: "done".into(),
            nit: 2,
            x: vec![0.25, -1e-3],
            chisq: 0.5,
            history: vec![2., 0.5],
        };
        FitReport::new(&errors, &outcome)
    }

    #[test]
    fn pickle() {
        let report = report();
        let path = std::env::temp_dir().join(format!("ormfit-report-{}.pkl", std::process::id()));
        report.save(&path).unwrap();
        let loaded = FitReport::from_pickle(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(report, loaded);
        assert_eq!(loaded.chisq(), Some(0.5));
    }

    #[test]
    fn text() {
        let report = report();
        let path = std::env::temp_dir().join(format!("ormfit-report-{}.txt", std::process::id()));
        report.save(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(text, "kq1: 0.5\nq1<dx>: -0.001");
    }
}
