//!
//! # Orbit response matrix fitting
//!
//! Fits accelerator machine errors (global parameters, element attributes,
//! alignment and field errors) to a measured orbit response matrix (ORM),
//! using an external accelerator simulator as the forward model.
//!
//! The main pieces are:
//!  - [Simulator]: the interface to the external engine, with
//!    [InMemorySimulator] as a state-only implementation
//!  - [ErrorParameter]: one adjustable machine error, parsed from a spec
//!    string such as `kq1`, `q1->k1`, `δq1->k1` or `q1<dx>`
//!  - [OrbitResponse]: the measured ORM loaded from YAML record files
//!  - [deriv]: finite-difference derivatives of the model ORM
//!  - [fit]: least-squares and minimization drivers
//!  - [Analysis]: a fit session tying everything together
//!
//! # Examples
//!
//! ```
//! use ormfit::{Builder, FromBuilder, InMemorySimulator, ErrorParameter, Simulator};
//!
//! let mut sim = InMemorySimulator::builder()
//!     .element("q1", "quadrupole", 1.0)
//!     .attr("q1", "k1", "kq1")
//!     .global("kq1", 0.5)
//!     .build()
//!     .unwrap();
//! let param: ErrorParameter = "q1->k1".parse().unwrap();
//! let varied = param
//!     .vary(&mut sim, Some(0.1), |sim, _| sim.element_attr("q1", "k1"))
//!     .unwrap();
//! assert!((varied - 0.6).abs() < 1e-12);
//! assert_eq!(sim.element_attr("q1", "k1").unwrap(), 0.5);
//! ```

pub mod analysis;
pub mod deriv;
pub mod error;
pub mod fit;
pub mod orm;
pub mod params;
pub mod record;
pub mod response;
pub mod simulator;

#[doc(inline)]
pub use self::analysis::{Analysis, AnalysisSpec, ChiSquared, FitReport};
#[doc(inline)]
pub use self::error::OrmError;
#[doc(inline)]
pub use self::fit::{FitConfig, FitDriver, FitOutcome, LeastSquares, Minimize, Mode};
#[doc(inline)]
pub use self::orm::Orm;
#[doc(inline)]
pub use self::params::{ErrorParam, ErrorParameter, FitSpec};
#[doc(inline)]
pub use self::record::RecordFile;
#[doc(inline)]
pub use self::response::OrbitResponse;
#[doc(inline)]
pub use self::simulator::{InMemorySimulator, Simulator};

pub type Result<T> = std::result::Result<T, OrmError>;

/// Builder type trait
pub trait Builder: Default {
    type Component;
    fn new() -> Self {
        Default::default()
    }
    fn build(self) -> Result<Self::Component>;
}

/// Access to the builder of a type
pub trait FromBuilder {
    type ComponentBuilder: Builder;
    fn builder() -> Self::ComponentBuilder {
        Self::ComponentBuilder::default()
    }
}
