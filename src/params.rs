//!
//! # Machine error parameters
//!
//! An [ErrorParameter] is one adjustable quantity of the machine model:
//! a global variable, an element attribute, an alignment offset, a field
//! error multipole or a coordinate of the initial orbit.
//! Parameters are usually parsed from their spec string:
//!
//! | spec          | parameter                                  |
//! |---------------|--------------------------------------------|
//! | `kq1`         | global variable `kq1`                      |
//! | `q1->k1`      | attribute `k1` of element `q1`             |
//! | `δkq1`, `kq1*`| relative (scaled) version of the above     |
//! | `Δkq1`        | explicitly absolute                        |
//! | `q1<dx>`      | `dx` alignment error of `q1`               |
//! | `q1/q5<dpsi>` | `dpsi` alignment error over a range        |
//! | `b1<dkn0>`    | normal field error of order 0 of `b1`      |
//! | `x`, `py`, …  | initial orbit coordinate                   |
//!
//! Every trial modification goes through [ErrorParameter::vary] which
//! restores the prior simulator state when it returns, whatever the
//! outcome of the enclosed computation.

use std::fmt::Display;

use crate::simulator::{FieldComponent, Selection, Simulator, SimulatorError, SimulatorResult, Value};

mod parse;
mod spec;
mod vary;

pub use spec::{
    alignment_errors_for, attr_errors_for, err_attrs, field_errors_for, FitSpec, DEFAULT_STEP,
    ERR_ATTR, ERR_EALIGN, MAX_MULTIPOLE_ORDER,
};
pub use vary::{vary_all, Varied};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("invalid error spec `{0}`")]
    InvalidSpec(String),
    #[error("error spec `{0}` cannot be relative")]
    NotScalable(String),
}

/// Initial orbit coordinates
pub const INITIAL_ORBIT: [&str; 4] = ["x", "px", "y", "py"];

/// Machine error kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorParam {
    /// Global variable
    Global(String),
    /// Element attribute
    ElementAttr { elem: String, attr: String },
    /// Global variable with relative steps
    ScaledGlobal(String),
    /// Element attribute with relative steps
    ScaledElementAttr { elem: String, attr: String },
    /// Alignment error (`dx`, `dy`, `ds`, `dpsi`, `dphi`, `dtheta`)
    Alignment { selection: Selection, attr: String },
    /// Field error (`dkn`, `dks`) along the multipole direction `values`
    Field {
        selection: Selection,
        attr: String,
        values: Vec<f64>,
        order: Option<u32>,
        radius: Option<f64>,
    },
    /// Initial orbit coordinate (`x`, `px`, `y`, `py`)
    InitialOrbit(String),
}

impl ErrorParam {
    /// Returns `true` for multiplicative errors
    pub fn is_relative(&self) -> bool {
        matches!(
            self,
            ErrorParam::ScaledGlobal(_) | ErrorParam::ScaledElementAttr { .. }
        )
    }
    /// Current value, 0 if the simulator does not support reading it back
    pub fn get<S: Simulator + ?Sized>(&self, sim: &S) -> SimulatorResult<f64> {
        use ErrorParam::*;
        match self {
            Global(name) | ScaledGlobal(name) => sim.global(name),
            ElementAttr { elem, attr } | ScaledElementAttr { elem, attr } => {
                sim.element_attr(elem, attr)
            }
            Alignment { selection, attr } => {
                Ok(sim.alignment_error(selection, attr).unwrap_or_default())
            }
            Field {
                selection,
                attr,
                values,
                ..
            } => Ok(sim
                .field_error(selection, attr)
                .map(|stored| project(&stored, values))
                .unwrap_or_default()),
            InitialOrbit(name) => Ok(sim.initial_condition(name).unwrap_or_default()),
        }
    }
    /// Writes a value through the simulator command interface
    pub fn set<S: Simulator + ?Sized>(&self, sim: &mut S, value: f64) -> SimulatorResult<()> {
        use ErrorParam::*;
        match self {
            Global(name) | ScaledGlobal(name) => sim.set_global(name, value),
            ElementAttr { elem, attr } | ScaledElementAttr { elem, attr } => {
                sim.set_element_attr(elem, attr, Value::Number(value))
            }
            Alignment { selection, attr } => {
                sim.select_errors(selection)?;
                sim.ealign(attr, value)
            }
            Field { values, .. } => self.each_field(sim, |stored| {
                let current = project(stored, values);
                stored
                    .iter()
                    .zip(values)
                    .map(|(s, v)| s - current * v + value * v)
                    .collect()
            }),
            InitialOrbit(name) => sim.set_initial_condition(name, value),
        }
    }
    /// Moves the error of every selected element by `step`
    ///
    /// Alignment and field errors of a range keep their per element
    /// differences and field errors keep their other multipole orders.
    fn shift<S: Simulator + ?Sized>(&self, sim: &mut S, step: f64) -> SimulatorResult<()> {
        match self {
            ErrorParam::Alignment { selection, attr } => {
                for elem in selected(&*sim, selection)? {
                    let single = Selection::range(elem);
                    let old = sim.alignment_error(&single, attr).unwrap_or_default();
                    sim.select_errors(&single)?;
                    sim.ealign(attr, old + step)?;
                }
                Ok(())
            }
            ErrorParam::Field { values, .. } => self.each_field(sim, |stored| {
                stored.iter().zip(values).map(|(s, v)| s + step * v).collect()
            }),
            _ => {
                let old = self.read(sim)?;
                let new = self.tinker(&old, step);
                if new != old {
                    self.write(sim, &new)?;
                }
                Ok(())
            }
        }
    }
    // Rewrites the field error multipoles of each selected element
    fn each_field<S, F>(&self, sim: &mut S, update: F) -> SimulatorResult<()>
    where
        S: Simulator + ?Sized,
        F: Fn(&[f64]) -> Vec<f64>,
    {
        if let ErrorParam::Field {
            selection,
            attr,
            values,
            order,
            radius,
        } = self
        {
            for elem in selected(&*sim, selection)? {
                let single = Selection::range(elem);
                let mut stored = sim.field_error(&single, attr).unwrap_or_default();
                if stored.len() < values.len() {
                    stored.resize(values.len(), 0.);
                }
                let mut multipoles = update(&stored[..values.len()]);
                multipoles.extend_from_slice(&stored[values.len()..]);
                sim.select_errors(&single)?;
                sim.efcomp(&FieldComponent {
                    attr: attr.clone(),
                    values: multipoles,
                    order: *order,
                    radius: *radius,
                })?;
            }
        }
        Ok(())
    }
    /// Current definition, element attributes may be deferred expressions
    pub(crate) fn read<S: Simulator + ?Sized>(&self, sim: &S) -> SimulatorResult<Value> {
        match self {
            ErrorParam::ElementAttr { elem, attr } | ErrorParam::ScaledElementAttr { elem, attr } => {
                sim.element_attr_definition(elem, attr)
            }
            _ => self.get(sim).map(Value::Number),
        }
    }
    /// Writes back a definition obtained from [ErrorParam::read] or [ErrorParam::tinker]
    pub(crate) fn write<S: Simulator + ?Sized>(
        &self,
        sim: &mut S,
        value: &Value,
    ) -> SimulatorResult<()> {
        match (self, value) {
            (
                ErrorParam::ElementAttr { elem, attr } | ErrorParam::ScaledElementAttr { elem, attr },
                value,
            ) => sim.set_element_attr(elem, attr, value.clone()),
            (_, Value::Number(value)) => self.set(sim, *value),
            (_, Value::Expression(_)) => Err(SimulatorError::NotANumber(self.to_string())),
        }
    }
    /// Value after a step from `old`
    ///
    /// Absolute errors add the step, relative errors scale by `1 + step`.
    /// Symbolic definitions are extended with the corresponding term.
    pub fn tinker(&self, old: &Value, step: f64) -> Value {
        match (old, self.is_relative()) {
            (Value::Number(old), false) => Value::Number(old + step),
            (Value::Number(old), true) => Value::Number(old * (1. + step)),
            (Value::Expression(old), false) => Value::Expression(format!("({}) + ({})", old, step)),
            (Value::Expression(old), true) => {
                Value::Expression(format!("({}) * (1 + ({}))", old, step))
            }
        }
    }
}

fn selected<S: Simulator + ?Sized>(sim: &S, selection: &Selection) -> SimulatorResult<Vec<String>> {
    let names = sim.selected_elements(selection)?;
    if names.is_empty() {
        return Err(SimulatorError::EmptySelection);
    }
    Ok(names)
}

// Field error strength along the multipole direction
fn project(stored: &[f64], direction: &[f64]) -> f64 {
    let norm: f64 = direction.iter().map(|v| v * v).sum();
    if norm == 0. {
        return 0.;
    }
    stored
        .iter()
        .zip(direction)
        .map(|(s, v)| s * v)
        .sum::<f64>()
        / norm
}

/// A fitted machine error
///
/// `base` accumulates the fitted value and `step` is the default trial
/// perturbation used by [ErrorParameter::vary].
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorParameter {
    pub param: ErrorParam,
    pub name: String,
    pub base: f64,
    pub step: f64,
}

impl ErrorParameter {
    /// Creates a parameter with the given default step
    pub fn new(param: ErrorParam, step: f64) -> Self {
        Self {
            name: param.to_string(),
            param,
            base: 0.,
            step,
        }
    }
    /// Parses an error spec string
    pub fn parse(spec: &str) -> Result<Self, ParseError> {
        Ok(Self::new(ErrorParam::parse(spec)?, DEFAULT_STEP))
    }
    /// Sets the default step
    pub fn step(self, step: f64) -> Self {
        Self { step, ..self }
    }
    /// Current value, see [ErrorParam::get]
    pub fn get<S: Simulator + ?Sized>(&self, sim: &S) -> SimulatorResult<f64> {
        self.param.get(sim)
    }
    /// Writes a value, see [ErrorParam::set]
    pub fn set<S: Simulator + ?Sized>(&self, sim: &mut S, value: f64) -> SimulatorResult<()> {
        self.param.set(sim, value)
    }
    /// See [ErrorParam::tinker]
    pub fn tinker(&self, old: &Value, step: f64) -> Value {
        self.param.tinker(old, step)
    }
    /// Runs `f` with the parameter moved by `step` (default: [ErrorParameter::step])
    ///
    /// The prior value is restored when `f` returns, when it fails and
    /// when it panics. `f` is given the step actually used.
    ///
    /// # Examples
    ///
    /// ```
    /// use ormfit::{Builder, FromBuilder, InMemorySimulator, ErrorParameter, Simulator};
    ///
    /// let mut sim = InMemorySimulator::builder().global("kq1", 1.0).build().unwrap();
    /// let param = ErrorParameter::parse("δkq1").unwrap();
    /// let varied = param
    ///     .vary(&mut sim, Some(0.5), |sim, _| sim.global("kq1"))
    ///     .unwrap();
    /// assert_eq!(varied, 1.5);
    /// assert_eq!(sim.global("kq1").unwrap(), 1.0);
    /// ```
    pub fn vary<S, T, E, F>(&self, sim: &mut S, step: Option<f64>, f: F) -> Result<T, E>
    where
        S: Simulator + ?Sized,
        E: From<SimulatorError>,
        F: FnOnce(&mut S, f64) -> Result<T, E>,
    {
        let step = step.unwrap_or(self.step);
        let mut varied = Varied::new(sim, &self.param, step)?;
        let value = f(&mut *varied, step)?;
        varied.finish()?;
        Ok(value)
    }
    /// Permanently moves the parameter by `value`
    pub fn apply<S: Simulator + ?Sized>(&self, sim: &mut S, value: f64) -> SimulatorResult<()> {
        self.param.shift(sim, value)
    }
}

impl std::str::FromStr for ErrorParameter {
    type Err = ParseError;
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        Self::parse(spec)
    }
}

impl Display for ErrorParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}={}]", self.name, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Builder, FromBuilder, InMemorySimulator};

    fn sim() -> InMemorySimulator {
        InMemorySimulator::builder()
            .element("b1", "sbend", 1.)
            .attr("b1", "angle", 0.1)
            .element("q1", "quadrupole", 2.)
            .attr("q1", "k1", "kq1")
            .element("q2", "quadrupole", 3.)
            .attr("q2", "k1", -0.5)
            .global("kq1", 0.25)
            .build()
            .unwrap()
    }

    fn specs() -> Vec<&'static str> {
        vec![
            "kq1", "δkq1", "q1->k1", "q2->k1", "q2->k1*", "q1<dx>", "q1/q2<dpsi>", "b1<dkn0>",
            "q2<dks1>", "px",
        ]
    }

    #[test]
    fn get_set() {
        let mut sim = sim();
        for spec in specs() {
            let param = ErrorParameter::parse(spec).unwrap();
            for v in [0., 1e-3, -2.5, 7.] {
                param.set(&mut sim, v).unwrap();
                assert_eq!(param.get(&sim).unwrap(), v, "{}", spec);
            }
        }
    }

    #[test]
    fn vary_restores() {
        let mut sim = sim();
        for spec in specs() {
            let param = ErrorParameter::parse(spec).unwrap();
            let before = param.get(&sim).unwrap();
            for step in [1e-4, -0.3, 0., 12.] {
                param
                    .vary(&mut sim, Some(step), |sim, used| {
                        assert_eq!(used, step);
                        sim.invalidate_twiss();
                        Ok::<_, SimulatorError>(())
                    })
                    .unwrap();
                assert_eq!(param.get(&sim).unwrap(), before, "{}", spec);
            }
        }
    }

    #[test]
    fn vary_expression() {
        let mut sim = sim();
        let param = ErrorParameter::parse("q1->k1").unwrap();
        let (value, definition) = param
            .vary(&mut sim, Some(0.5), |sim, _| {
                Ok::<_, SimulatorError>((
                    sim.element_attr("q1", "k1")?,
                    sim.element_attr_definition("q1", "k1")?,
                ))
            })
            .unwrap();
        assert_eq!(value, 0.75);
        assert_eq!(definition, Value::from("(kq1) + (0.5)"));
        assert_eq!(
            sim.element_attr_definition("q1", "k1").unwrap(),
            Value::from("kq1")
        );
    }

    #[test]
    fn vary_restores_on_error() {
        let mut sim = sim();
        let param = ErrorParameter::parse("q2->k1").unwrap();
        let result: Result<(), SimulatorError> = param.vary(&mut sim, Some(1.), |sim, _| {
            assert_eq!(sim.element_attr("q2", "k1")?, 0.5);
            Err(SimulatorError::TwissFailed("forced".into()))
        });
        assert!(result.is_err());
        assert_eq!(sim.element_attr("q2", "k1").unwrap(), -0.5);
    }

    #[test]
    fn vary_restores_on_panic() {
        let mut sim = sim();
        let param = ErrorParameter::parse("kq1").unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = param.vary(&mut sim, Some(1.), |_, _| -> Result<(), SimulatorError> {
                panic!("forced")
            });
        }));
        assert!(result.is_err());
        assert_eq!(sim.global("kq1").unwrap(), 0.25);
    }

    #[test]
    fn tinker() {
        let abs = ErrorParam::Global("k".into());
        let rel = ErrorParam::ScaledGlobal("k".into());
        assert_eq!(abs.tinker(&Value::Number(2.), 0.5), Value::Number(2.5));
        assert_eq!(rel.tinker(&Value::Number(2.), 0.5), Value::Number(3.));
        assert_eq!(
            rel.tinker(&Value::from("k0"), -0.1),
            Value::from("(k0) * (1 + (-0.1))")
        );
    }

    #[test]
    fn field_orders_are_independent() {
        let mut sim = sim();
        let dkn0 = ErrorParameter::parse("q1<dkn0>").unwrap();
        let dkn1 = ErrorParameter::parse("q1<dkn1>").unwrap();
        dkn0.set(&mut sim, 0.1).unwrap();
        let history = sim.history_len();
        let varied = dkn1
            .vary(&mut sim, Some(1e-3), |sim, _| {
                Ok::<_, SimulatorError>((dkn0.get(sim)?, dkn1.get(sim)?))
            })
            .unwrap();
        assert_eq!(varied, (0.1, 1e-3));
        assert_eq!(dkn0.get(&sim).unwrap(), 0.1);
        assert_eq!(dkn1.get(&sim).unwrap(), 0.);
        assert_eq!(sim.history_len(), history);

        dkn1.apply(&mut sim, 2e-3).unwrap();
        dkn0.apply(&mut sim, 0.05).unwrap();
        assert!((dkn0.get(&sim).unwrap() - 0.15).abs() < 1e-15);
        assert_eq!(dkn1.get(&sim).unwrap(), 2e-3);
        dkn1.set(&mut sim, -1e-3).unwrap();
        assert!((dkn0.get(&sim).unwrap() - 0.15).abs() < 1e-15);
        assert_eq!(dkn1.get(&sim).unwrap(), -1e-3);
    }

    #[test]
    fn range_keeps_element_offsets() {
        let mut sim = sim();
        let dx = |sim: &InMemorySimulator, elem: &str| {
            sim.alignment_error(&Selection::range(elem), "dx").unwrap()
        };
        ErrorParameter::parse("q2<dx>")
            .unwrap()
            .set(&mut sim, 1e-3)
            .unwrap();
        let range = ErrorParameter::parse("q1/q2<dx>").unwrap();
        let history = sim.history_len();
        let varied = range
            .vary(&mut sim, Some(1e-4), |sim, _| {
                Ok::<_, SimulatorError>((dx(sim, "q1"), dx(sim, "q2")))
            })
            .unwrap();
        assert_eq!(varied, (1e-4, 1e-3 + 1e-4));
        assert_eq!(dx(&sim, "q1"), 0.);
        assert_eq!(dx(&sim, "q2"), 1e-3);
        assert_eq!(sim.history_len(), history);

        range.apply(&mut sim, 2e-4).unwrap();
        assert_eq!(dx(&sim, "q1"), 2e-4);
        assert_eq!(dx(&sim, "q2"), 1e-3 + 2e-4);
        assert!(matches!(
            ErrorParameter::parse("q2/q1<dx>").unwrap().apply(&mut sim, 1.),
            Err(SimulatorError::EmptySelection)
        ));
    }

    #[test]
    fn apply_is_permanent() {
        let mut sim = sim();
        let param = ErrorParameter::parse("q1->k1*").unwrap();
        param.apply(&mut sim, 1.).unwrap();
        assert_eq!(sim.element_attr("q1", "k1").unwrap(), 0.5);
        sim.set_global("kq1", 1.).unwrap();
        assert_eq!(sim.element_attr("q1", "k1").unwrap(), 2.);
    }
}
