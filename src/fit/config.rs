use std::{
    fmt::Display,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::{Callback, FitDriver, FitOutcome, FitTarget, LeastSquares, Minimize, Mode};
use crate::{simulator::Simulator, ErrorParameter, Result};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot open `FitConfig` toml file: {1}")]
    Open(#[source] std::io::Error, PathBuf),
    #[error("cannot create `FitConfig` toml file: {1}")]
    Create(#[source] std::io::Error, PathBuf),
    #[error("cannot read `FitConfig` toml file: {1}")]
    Read(#[source] std::io::Error, PathBuf),
    #[error("cannot write `FitConfig` toml file: {1}")]
    Write(#[source] std::io::Error, PathBuf),
    #[error("cannot deserialize `FitConfig` from toml")]
    Load(#[from] toml::de::Error),
    #[error("cannot serialize `FitConfig` into toml")]
    Save(#[from] toml::ser::Error),
    #[error("invalid `FitConfig`: {0}")]
    Invalid(String),
}

/// Fit strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// [LeastSquares]
    #[default]
    Lstsq,
    /// [Minimize]
    Minimize,
}
impl Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::Lstsq => write!(f, "lstsq"),
            Algorithm::Minimize => write!(f, "minimize"),
        }
    }
}

/// Fit configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub algorithm: Algorithm,
    pub mode: Mode,
    /// Number of least-squares iterations or iteration cap of the minimizer
    pub iterations: usize,
    /// Relative singular value cutoff of the least-squares solver
    pub rcond: f64,
    /// Convergence tolerance of the minimizer
    pub tol: f64,
    /// Finite-difference step of the minimizer gradient
    pub delta: f64,
    /// `(lower, upper)` bounds of the minimizer, one per error
    pub bounds: Option<Vec<(f64, f64)>>,
    /// Weights the residuals with the measurement uncertainty
    pub use_stddev: bool,
    /// Shows progress bars
    pub progress: bool,
}
/// Default properties:
///  * algorithm  : least squares
///  * mode       : xy
///  * iterations : 50
///  * rcond      : 1e-8
///  * tol        : 1e-6
///  * delta      : 1e-4
///  * bounds     : none
///  * use_stddev : true
impl Default for FitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Lstsq,
            mode: Mode::XY,
            iterations: 50,
            rcond: 1e-8,
            tol: 1e-6,
            delta: 1e-4,
            bounds: None,
            use_stddev: true,
            progress: false,
        }
    }
}

impl FitConfig {
    /// Loads the configuration from a toml file
    pub fn load<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let mut file =
            File::open(&path).map_err(|e| ConfigError::Open(e, path.as_ref().to_path_buf()))?;
        let mut toml = String::new();
        file.read_to_string(&mut toml)
            .map_err(|e| ConfigError::Read(e, path.as_ref().to_path_buf()))?;
        let config: FitConfig = toml::from_str(&toml)?;
        config.validate()?;
        Ok(config)
    }
    /// Saves the configuration to a toml file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> std::result::Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)?;
        let mut file =
            File::create(&path).map_err(|e| ConfigError::Create(e, path.as_ref().to_path_buf()))?;
        write!(file, "# ormfit::FitConfig\n\n{}", toml)
            .map_err(|e| ConfigError::Write(e, path.as_ref().to_path_buf()))?;
        Ok(())
    }
    /// Checks the numerical settings
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if !(self.rcond >= 0.) {
            return Err(ConfigError::Invalid(format!("rcond must be positive, found {}", self.rcond)));
        }
        if !(self.tol >= 0.) {
            return Err(ConfigError::Invalid(format!("tol must be positive, found {}", self.tol)));
        }
        if !(self.delta > 0. && self.delta.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "delta must be strictly positive, found {}",
                self.delta
            )));
        }
        Ok(())
    }
    /// Sets the fit strategy
    pub fn algorithm(self, algorithm: Algorithm) -> Self {
        Self { algorithm, ..self }
    }
    /// Sets the fitted planes
    pub fn mode(self, mode: Mode) -> Self {
        Self { mode, ..self }
    }
    /// Sets the number of iterations
    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }
    pub fn rcond(self, rcond: f64) -> Self {
        Self { rcond, ..self }
    }
    pub fn tol(self, tol: f64) -> Self {
        Self { tol, ..self }
    }
    pub fn delta(self, delta: f64) -> Self {
        Self { delta, ..self }
    }
    /// Sets the minimizer bounds
    pub fn bounds(self, bounds: Vec<(f64, f64)>) -> Self {
        Self {
            bounds: Some(bounds),
            ..self
        }
    }
    /// Disables the weighting with the measurement uncertainty
    pub fn unweighted(self) -> Self {
        Self {
            use_stddev: false,
            ..self
        }
    }
    pub fn progress(self, progress: bool) -> Self {
        Self { progress, ..self }
    }
    /// Runs the configured driver
    pub fn fit<S: Simulator + ?Sized>(
        &self,
        sim: &mut S,
        target: &FitTarget<'_>,
        errors: &mut [ErrorParameter],
        callback: &mut Callback<'_>,
    ) -> Result<FitOutcome> {
        self.validate()?;
        match self.algorithm {
            Algorithm::Lstsq => LeastSquares {
                rcond: self.rcond,
                progress: self.progress,
            }
            .fit(sim, target, errors, self.iterations, callback),
            Algorithm::Minimize => Minimize {
                tol: self.tol,
                delta: self.delta,
                bounds: self.bounds.clone(),
            }
            .fit(sim, target, errors, self.iterations, callback),
        }
    }
}

impl Display for FitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Fit config:")?;
        writeln!(f, " * algorithm: {}", self.algorithm)?;
        writeln!(f, " * mode: {}", self.mode)?;
        writeln!(f, " * iterations: {}", self.iterations)?;
        match self.algorithm {
            Algorithm::Lstsq => writeln!(f, " * rcond: {:e}", self.rcond)?,
            Algorithm::Minimize => writeln!(f, " * tol: {:e}, delta: {:e}", self.tol, self.delta)?,
        }
        write!(f, " * weighted: {}", self.use_stddev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_round_trip() {
        let config = FitConfig::default()
            .algorithm(Algorithm::Minimize)
            .mode(Mode::Y)
            .iterations(7)
            .bounds(vec![(-1e-3, 1e-3), (0., 2.)]);
        let path = std::env::temp_dir().join(format!("ormfit-config-{}.toml", std::process::id()));
        config.save(&path).unwrap();
        let loaded = FitConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn partial_toml() {
        let config: FitConfig = toml::from_str("algorithm = \"minimize\"\nmode = \"x\"\n").unwrap();
        assert_eq!(config.algorithm, Algorithm::Minimize);
        assert_eq!(config.mode, Mode::X);
        assert_eq!(config.iterations, 50);
        assert_eq!(config.rcond, 1e-8);
        assert!(config.use_stddev);
    }

    #[test]
    fn invalid() {
        assert!(FitConfig::default().delta(0.).validate().is_err());
        assert!(FitConfig::default().rcond(f64::NAN).validate().is_err());
        assert!(toml::from_str::<FitConfig>("mode = \"z\"").is_err());
        assert!(matches!(
            FitConfig::load("/nonexistent/fit.toml"),
            Err(ConfigError::Open(..))
        ));
    }
}
