//!
//! # Simulator interface
//!
//! The fitting engine never computes beam dynamics itself. Every physical
//! quantity comes from a [Simulator]: an external accelerator-physics engine
//! exposing its global variables, element attributes, alignment and field
//! error commands, and the model orbit response matrix.
//!
//! The simulator is mutable, non-reentrant state. It is always passed as an
//! explicit `&mut` handle and every trial modification is undone through
//! either [ErrorParameter::vary](crate::ErrorParameter::vary) or a
//! [Rollback] scope.
//!
//! [InMemorySimulator] is a state-only implementation with a caller-provided
//! response function. It is used for offline analysis and tests.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::Orm;

mod builder;
pub mod expr;
mod memory;
mod rollback;

pub use builder::InMemorySimulatorBuilder;
pub use memory::{InMemorySimulator, ResponseFn, State};
pub use rollback::{rollback, Rollback};

#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    #[error("unknown element `{0}`")]
    UnknownElement(String),
    #[error("element `{elem}` has no attribute `{attr}`")]
    UnknownAttribute { elem: String, attr: String },
    #[error("`{0}` cannot be assigned a symbolic expression")]
    NotANumber(String),
    #[error("cannot evaluate expression `{expr}`: {reason}")]
    Expression { expr: String, reason: String },
    #[error("no element selected for error assignment")]
    EmptySelection,
    #[error("twiss computation failed: {0}")]
    TwissFailed(String),
    #[error("checkpoint #{0} is ahead of the undo history")]
    InvalidCheckpoint(usize),
    #[error("response matrix of shape {found:?} instead of {expected:?}")]
    ResponseShape {
        expected: (usize, usize, usize),
        found: (usize, usize, usize),
    },
}
pub type SimulatorResult<T> = std::result::Result<T, SimulatorError>;

/// Attribute definition: either a plain number or a deferred expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Expression(String),
}
impl Value {
    /// Returns the number if the value is not symbolic
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            Value::Expression(_) => None,
        }
    }
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}
impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Expression(value.into())
    }
}
impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(value) => write!(f, "{}", value),
            Value::Expression(expr) => write!(f, "{}", expr),
        }
    }
}

/// Element selection for alignment and field error commands
///
/// `range` is either a single element name or a `first/last` range, `#s` and
/// `#e` standing for the first and the last element of the lattice.
/// `class` restricts the selection to a given element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selection {
    pub range: String,
    #[serde(default)]
    pub class: Option<String>,
}
impl Selection {
    pub fn range<S: Into<String>>(range: S) -> Self {
        Self {
            range: range.into(),
            class: None,
        }
    }
    pub fn class<S: Into<String>>(self, class: S) -> Self {
        Self {
            class: Some(class.into()),
            ..self
        }
    }
}
impl Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.class {
            Some(class) => write!(f, "{}[{}]", self.range, class),
            None => write!(f, "{}", self.range),
        }
    }
}

/// Field error component as assigned by the `efcomp` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComponent {
    /// `dkn` (normal) or `dks` (skew) multipoles
    pub attr: String,
    /// Multipole coefficients, index is the multipole order
    pub values: Vec<f64>,
    pub order: Option<u32>,
    pub radius: Option<f64>,
}

/// Lattice element summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub name: String,
    /// Element type, e.g. `quadrupole`, `sbend`, `hkicker`
    pub base_name: String,
    /// Longitudinal position `[m]`
    pub position: f64,
    /// Global variables the element attributes depend on
    pub knobs: Vec<String>,
}

/// Position in the simulator undo history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(pub usize);

/// Accelerator simulator handle
pub trait Simulator {
    /// Reads a global variable, undefined variables evaluate to 0
    fn global(&self, name: &str) -> SimulatorResult<f64>;
    fn set_global(&mut self, name: &str, value: f64) -> SimulatorResult<()>;
    /// Sets several global variables
    fn update_globals<'a, I>(&mut self, values: I) -> SimulatorResult<()>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
        Self: Sized,
    {
        for (name, value) in values {
            self.set_global(name, value)?;
        }
        Ok(())
    }
    /// Evaluated value of an element attribute
    fn element_attr(&self, elem: &str, attr: &str) -> SimulatorResult<f64>;
    /// Definition of an element attribute, possibly a deferred expression
    fn element_attr_definition(&self, elem: &str, attr: &str) -> SimulatorResult<Value>;
    fn set_element_attr(&mut self, elem: &str, attr: &str, value: Value) -> SimulatorResult<()>;
    /// Names of the elements matched by `selection`, in lattice order
    fn selected_elements(&self, selection: &Selection) -> SimulatorResult<Vec<String>>;
    /// Selects the elements the next `ealign`/`efcomp` commands apply to
    fn select_errors(&mut self, selection: &Selection) -> SimulatorResult<()>;
    /// Assigns an alignment error to the selected elements
    fn ealign(&mut self, attr: &str, value: f64) -> SimulatorResult<()>;
    /// Assigns a field error to the selected elements
    fn efcomp(&mut self, component: &FieldComponent) -> SimulatorResult<()>;
    /// Reads back an alignment error, `None` if unsupported
    fn alignment_error(&self, _selection: &Selection, _attr: &str) -> Option<f64> {
        None
    }
    /// Reads back a field error, `None` if unsupported
    fn field_error(&self, _selection: &Selection, _attr: &str) -> Option<Vec<f64>> {
        None
    }
    /// Initial orbit coordinate (`x`, `px`, `y`, `py`), `None` if unsupported
    fn initial_condition(&self, _name: &str) -> Option<f64> {
        None
    }
    fn set_initial_condition(&mut self, name: &str, value: f64) -> SimulatorResult<()>;
    /// Lattice elements in lattice order
    fn elements(&self) -> Vec<ElementInfo>;
    /// Case insensitive index of an element in the lattice
    fn element_index(&self, name: &str) -> Option<usize> {
        self.elements()
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }
    /// Drops cached twiss results
    fn invalidate_twiss(&mut self);
    /// Computes the model orbit response matrix at the current state
    fn orbit_response_matrix(&mut self, monitors: &[String], knobs: &[String])
        -> SimulatorResult<Orm>;
    /// Marks the current position in the undo history
    fn checkpoint(&mut self) -> Checkpoint;
    /// Undoes every modification since `checkpoint`
    fn restore(&mut self, checkpoint: Checkpoint) -> SimulatorResult<()>;
}
