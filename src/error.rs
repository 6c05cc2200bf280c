#[derive(Debug, thiserror::Error)]
pub enum OrmError {
    #[error("simulator failure")]
    Simulator(#[from] crate::simulator::SimulatorError),
    #[error("invalid machine error specification")]
    Parse(#[from] crate::params::ParseError),
    #[error("cannot load orbit records")]
    Record(#[from] crate::record::RecordError),
    #[error("cannot build the orbit response")]
    Response(#[from] crate::response::ResponseError),
    #[error("fit failed")]
    Fit(#[from] crate::fit::FitError),
    #[error("invalid fit configuration")]
    Config(#[from] crate::fit::ConfigError),
    #[error("analysis failed")]
    Analysis(#[from] crate::analysis::AnalysisError),
    #[error("cannot save or load the fit report")]
    Report(#[from] crate::analysis::ReportError),
}
