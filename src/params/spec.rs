use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ErrorParam, ErrorParameter, ParseError};
use crate::simulator::{Selection, Simulator, SimulatorError, SimulatorResult};

/// Default trial step of an error parameter
pub const DEFAULT_STEP: f64 = 1e-4;

/// Alignment error attributes
pub const ERR_EALIGN: &[&str] = &["dx", "dy", "ds", "dpsi", "dphi", "dtheta"];

/// Highest field error multipole order
pub const MAX_MULTIPOLE_ORDER: usize = 20;

/// Attributes subject to errors per element type
pub const ERR_ATTR: &[(&str, &[&str])] = &[
    ("sbend", &["angle", "e1", "e2", "k0", "hgap", "fint"]),
    ("quadrupole", &["k1", "k1s"]),
    ("hkicker", &["kick", "tilt"]),
    ("vkicker", &["kick", "tilt"]),
    ("srotation", &["angle"]),
];

/// Attributes subject to errors for an element type
pub fn err_attrs(base_name: &str) -> &'static [&'static str] {
    ERR_ATTR
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(base_name))
        .map(|(_, attrs)| *attrs)
        .unwrap_or(&[])
}

/// All alignment errors of an element
pub fn alignment_errors_for(elem: &str, step: f64) -> Vec<ErrorParameter> {
    ERR_EALIGN
        .iter()
        .map(|attr| {
            ErrorParameter::new(
                ErrorParam::Alignment {
                    selection: Selection::range(elem.to_lowercase()),
                    attr: attr.to_string(),
                },
                step,
            )
        })
        .collect()
}

fn base_name<S: Simulator + ?Sized>(sim: &S, elem: &str) -> SimulatorResult<String> {
    sim.elements()
        .into_iter()
        .find(|e| e.name.eq_ignore_ascii_case(elem))
        .map(|e| e.base_name)
        .ok_or_else(|| SimulatorError::UnknownElement(elem.into()))
}

/// Field errors of an element
///
/// Bends get a dipole error, quadrupoles normal and skew quadrupole errors,
/// other elements none.
pub fn field_errors_for<S: Simulator + ?Sized>(
    sim: &S,
    elem: &str,
    step: f64,
) -> SimulatorResult<Vec<ErrorParameter>> {
    let field = |attr: &str, values: Vec<f64>| {
        ErrorParameter::new(
            ErrorParam::Field {
                selection: Selection::range(elem.to_lowercase()),
                attr: attr.into(),
                values,
                order: None,
                radius: None,
            },
            step,
        )
    };
    Ok(match base_name(sim, elem)?.as_str() {
        "sbend" => vec![field("dkn", vec![1.])],
        "quadrupole" => vec![field("dkn", vec![0., 1.]), field("dks", vec![0., 1.])],
        _ => vec![],
    })
}

/// Attribute errors of an element according to [ERR_ATTR]
pub fn attr_errors_for<S: Simulator + ?Sized>(
    sim: &S,
    elem: &str,
    step: f64,
) -> SimulatorResult<Vec<ErrorParameter>> {
    Ok(err_attrs(&base_name(sim, elem)?)
        .iter()
        .map(|attr| {
            ErrorParameter::new(
                ErrorParam::ElementAttr {
                    elem: elem.to_lowercase(),
                    attr: attr.to_string(),
                },
                step,
            )
        })
        .collect())
}

/// Errors to fit and their initial steps
///
/// A null step defaults to [DEFAULT_STEP]:
///
/// ```yaml
/// q1->k1: 1.0e-3
/// q2<dx>: ~
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FitSpec(pub BTreeMap<String, Option<f64>>);

impl FitSpec {
    /// Adds an error spec
    pub fn error(mut self, spec: &str, step: Option<f64>) -> Self {
        self.0.insert(spec.into(), step);
        self
    }
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// Parses every error spec
    pub fn errors(&self) -> Result<Vec<ErrorParameter>, ParseError> {
        self.0
            .iter()
            .map(|(spec, step)| Ok(ErrorParameter::parse(spec)?.step(step.unwrap_or(DEFAULT_STEP))))
            .collect()
    }
}

impl<'a> FromIterator<(&'a str, Option<f64>)> for FitSpec {
    fn from_iter<T: IntoIterator<Item = (&'a str, Option<f64>)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(s, v)| (s.to_string(), v)).collect())
    }
}
