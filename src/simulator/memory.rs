use std::{
    collections::{BTreeMap, HashMap},
    fmt::Display,
    sync::Arc,
};

use super::{
    expr, Checkpoint, ElementInfo, FieldComponent, InMemorySimulatorBuilder, Selection, Simulator,
    SimulatorError, SimulatorResult, Value,
};
use crate::{FromBuilder, Orm};

/// Model orbit response function of an [InMemorySimulator]
///
/// The function is given the simulator [State], the monitor and the knob
/// names and returns the `monitor × 2 × knob` model response.
pub type ResponseFn =
    dyn Fn(&State, &[String], &[String]) -> SimulatorResult<Orm> + Send + Sync + 'static;

#[derive(Debug, Clone)]
pub(crate) struct Element {
    pub(crate) name: String,
    pub(crate) base_name: String,
    pub(crate) position: f64,
    pub(crate) attrs: BTreeMap<String, Value>,
}

/// Machine state of an [InMemorySimulator]
///
/// All names are stored lower-cased.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub(crate) elements: Vec<Element>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) globals: BTreeMap<String, f64>,
    pub(crate) alignments: BTreeMap<(String, String), f64>,
    pub(crate) fields: BTreeMap<(String, String), Vec<f64>>,
    pub(crate) initial: BTreeMap<String, f64>,
}

impl State {
    /// Global variable value, 0 if undefined
    pub fn global(&self, name: &str) -> f64 {
        self.globals
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or_default()
    }
    fn element(&self, name: &str) -> SimulatorResult<&Element> {
        self.index
            .get(&name.to_lowercase())
            .map(|&i| &self.elements[i])
            .ok_or_else(|| SimulatorError::UnknownElement(name.into()))
    }
    fn definition(&self, elem: &str, attr: &str) -> SimulatorResult<&Value> {
        self.element(elem)?
            .attrs
            .get(&attr.to_lowercase())
            .ok_or_else(|| SimulatorError::UnknownAttribute {
                elem: elem.into(),
                attr: attr.into(),
            })
    }
    /// Evaluates a value, resolving expressions against the global variables
    pub fn evaluate(&self, value: &Value) -> SimulatorResult<f64> {
        match value {
            Value::Number(value) => Ok(*value),
            Value::Expression(e) => {
                expr::evaluate(e, &|name: &str| self.global(name)).map_err(|reason| {
                    SimulatorError::Expression {
                        expr: e.clone(),
                        reason,
                    }
                })
            }
        }
    }
    /// Evaluated element attribute
    pub fn element_attr(&self, elem: &str, attr: &str) -> SimulatorResult<f64> {
        self.evaluate(self.definition(elem, attr)?)
    }
    /// Element attribute, 0 if the element or the attribute is undefined
    pub fn element_attr_or_zero(&self, elem: &str, attr: &str) -> f64 {
        self.element_attr(elem, attr).unwrap_or_default()
    }
    /// Alignment error of an element, 0 if unset
    pub fn alignment(&self, elem: &str, attr: &str) -> f64 {
        self.alignments
            .get(&(elem.to_lowercase(), attr.to_lowercase()))
            .copied()
            .unwrap_or_default()
    }
    /// Field error multipoles of an element, empty if unset
    pub fn field(&self, elem: &str, attr: &str) -> &[f64] {
        self.fields
            .get(&(elem.to_lowercase(), attr.to_lowercase()))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
    /// Initial orbit coordinate, 0 if unset
    pub fn initial(&self, name: &str) -> f64 {
        self.initial
            .get(&name.to_lowercase())
            .copied()
            .unwrap_or_default()
    }
    /// Names of the elements matched by the selection, in lattice order
    pub fn select(&self, selection: &Selection) -> SimulatorResult<Vec<String>> {
        let bound = |name: &str, default: usize| -> SimulatorResult<usize> {
            match name.trim().to_lowercase().as_str() {
                "#s" => Ok(0),
                "#e" => Ok(self.elements.len().saturating_sub(1)),
                "" => Ok(default),
                name => self
                    .index
                    .get(name)
                    .copied()
                    .ok_or_else(|| SimulatorError::UnknownElement(name.into())),
            }
        };
        let (first, last) = match selection.range.split_once('/') {
            Some((first, last)) => (
                bound(first, 0)?,
                bound(last, self.elements.len().saturating_sub(1))?,
            ),
            None => {
                let i = bound(&selection.range, 0)?;
                (i, i)
            }
        };
        if self.elements.is_empty() || first > last {
            return Ok(vec![]);
        }
        Ok(self.elements[first..=last]
            .iter()
            .filter(|e| {
                selection
                    .class
                    .as_ref()
                    .map_or(true, |c| e.base_name.eq_ignore_ascii_case(c))
            })
            .map(|e| e.name.clone())
            .collect())
    }
}

/// Reversible modification of the [State]
#[derive(Debug, Clone)]
enum Mutation {
    Global(String, Option<f64>),
    Attr(usize, String, Option<Value>),
    Alignment((String, String), Option<f64>),
    Field((String, String), Option<Vec<f64>>),
    Initial(String, Option<f64>),
    Selection(Option<Vec<String>>),
}

/// Simulator holding the machine state in memory
///
/// Every modification is recorded in an undo log that backs
/// [Simulator::checkpoint] and [Simulator::restore], so that restoring a
/// checkpoint brings back the exact prior state.
/// The orbit response matrix is delegated to a [ResponseFn].
#[derive(Clone)]
pub struct InMemorySimulator {
    pub(crate) state: State,
    pub(crate) response: Arc<ResponseFn>,
    log: Vec<Mutation>,
    selection: Option<Vec<String>>,
    twiss_valid: bool,
    n_twiss: usize,
}

impl FromBuilder for InMemorySimulator {
    type ComponentBuilder = InMemorySimulatorBuilder;
}

impl InMemorySimulator {
    pub(crate) fn new(state: State, response: Arc<ResponseFn>) -> Self {
        Self {
            state,
            response,
            log: vec![],
            selection: None,
            twiss_valid: false,
            n_twiss: 0,
        }
    }
    /// Read-only access to the machine state
    pub fn state(&self) -> &State {
        &self.state
    }
    /// Number of orbit response matrix evaluations so far
    pub fn n_twiss(&self) -> usize {
        self.n_twiss
    }
    /// Returns `true` if no modification happened since the last twiss
    pub fn is_twiss_valid(&self) -> bool {
        self.twiss_valid
    }
    /// Length of the undo history
    pub fn history_len(&self) -> usize {
        self.log.len()
    }
    fn record(&mut self, mutation: Mutation) {
        self.twiss_valid = false;
        self.log.push(mutation);
    }
    fn undo(&mut self, mutation: Mutation) {
        match mutation {
            Mutation::Global(name, old) => {
                put(&mut self.state.globals, name, old);
            }
            Mutation::Attr(i, attr, old) => {
                put(&mut self.state.elements[i].attrs, attr, old);
            }
            Mutation::Alignment(key, old) => {
                put(&mut self.state.alignments, key, old);
            }
            Mutation::Field(key, old) => {
                put(&mut self.state.fields, key, old);
            }
            Mutation::Initial(name, old) => {
                put(&mut self.state.initial, name, old);
            }
            Mutation::Selection(old) => self.selection = old,
        }
        self.twiss_valid = false;
    }
    fn selected(&self) -> SimulatorResult<Vec<String>> {
        match &self.selection {
            Some(names) if !names.is_empty() => Ok(names.clone()),
            _ => Err(SimulatorError::EmptySelection),
        }
    }
}

fn put<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: Option<V>) {
    match value {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Simulator for InMemorySimulator {
    fn global(&self, name: &str) -> SimulatorResult<f64> {
        Ok(self.state.global(name))
    }
    fn set_global(&mut self, name: &str, value: f64) -> SimulatorResult<()> {
        let name = name.to_lowercase();
        let old = self.state.globals.insert(name.clone(), value);
        self.record(Mutation::Global(name, old));
        Ok(())
    }
    fn element_attr(&self, elem: &str, attr: &str) -> SimulatorResult<f64> {
        self.state.element_attr(elem, attr)
    }
    fn element_attr_definition(&self, elem: &str, attr: &str) -> SimulatorResult<Value> {
        self.state.definition(elem, attr).cloned()
    }
    fn set_element_attr(&mut self, elem: &str, attr: &str, value: Value) -> SimulatorResult<()> {
        let i = *self
            .state
            .index
            .get(&elem.to_lowercase())
            .ok_or_else(|| SimulatorError::UnknownElement(elem.into()))?;
        self.state.evaluate(&value)?;
        let attr = attr.to_lowercase();
        let old = self.state.elements[i].attrs.insert(attr.clone(), value);
        self.record(Mutation::Attr(i, attr, old));
        Ok(())
    }
    fn selected_elements(&self, selection: &Selection) -> SimulatorResult<Vec<String>> {
        self.state.select(selection)
    }
    fn select_errors(&mut self, selection: &Selection) -> SimulatorResult<()> {
        let names = self.state.select(selection)?;
        let old = self.selection.replace(names);
        self.record(Mutation::Selection(old));
        Ok(())
    }
    fn ealign(&mut self, attr: &str, value: f64) -> SimulatorResult<()> {
        for name in self.selected()? {
            let key = (name, attr.to_lowercase());
            let old = self.state.alignments.insert(key.clone(), value);
            self.record(Mutation::Alignment(key, old));
        }
        Ok(())
    }
    fn efcomp(&mut self, component: &FieldComponent) -> SimulatorResult<()> {
        for name in self.selected()? {
            let key = (name, component.attr.to_lowercase());
            let old = self
                .state
                .fields
                .insert(key.clone(), component.values.clone());
            self.record(Mutation::Field(key, old));
        }
        Ok(())
    }
    fn alignment_error(&self, selection: &Selection, attr: &str) -> Option<f64> {
        let names = self.state.select(selection).ok()?;
        names.first().map(|name| self.state.alignment(name, attr))
    }
    fn field_error(&self, selection: &Selection, attr: &str) -> Option<Vec<f64>> {
        let names = self.state.select(selection).ok()?;
        names
            .first()
            .map(|name| self.state.field(name, attr).to_vec())
    }
    fn initial_condition(&self, name: &str) -> Option<f64> {
        Some(self.state.initial(name))
    }
    fn set_initial_condition(&mut self, name: &str, value: f64) -> SimulatorResult<()> {
        let name = name.to_lowercase();
        let old = self.state.initial.insert(name.clone(), value);
        self.record(Mutation::Initial(name, old));
        Ok(())
    }
    fn elements(&self) -> Vec<ElementInfo> {
        self.state
            .elements
            .iter()
            .map(|e| {
                let mut knobs: Vec<String> = vec![];
                for value in e.attrs.values() {
                    if let Value::Expression(definition) = value {
                        for name in expr::identifiers(definition) {
                            if !knobs.contains(&name) {
                                knobs.push(name);
                            }
                        }
                    }
                }
                ElementInfo {
                    name: e.name.clone(),
                    base_name: e.base_name.clone(),
                    position: e.position,
                    knobs,
                }
            })
            .collect()
    }
    fn element_index(&self, name: &str) -> Option<usize> {
        self.state.index.get(&name.to_lowercase()).copied()
    }
    fn invalidate_twiss(&mut self) {
        self.twiss_valid = false;
    }
    fn orbit_response_matrix(
        &mut self,
        monitors: &[String],
        knobs: &[String],
    ) -> SimulatorResult<Orm> {
        for monitor in monitors {
            self.state.element(monitor)?;
        }
        self.n_twiss += 1;
        let orm = (self.response)(&self.state, monitors, knobs)?;
        let expected = (monitors.len(), 2, knobs.len());
        if orm.shape() != expected {
            return Err(SimulatorError::ResponseShape {
                expected,
                found: orm.shape(),
            });
        }
        self.twiss_valid = true;
        Ok(orm)
    }
    fn checkpoint(&mut self) -> Checkpoint {
        Checkpoint(self.log.len())
    }
    fn restore(&mut self, checkpoint: Checkpoint) -> SimulatorResult<()> {
        if checkpoint.0 > self.log.len() {
            return Err(SimulatorError::InvalidCheckpoint(checkpoint.0));
        }
        while self.log.len() > checkpoint.0 {
            if let Some(mutation) = self.log.pop() {
                self.undo(mutation);
            }
        }
        Ok(())
    }
}

impl Display for InMemorySimulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "InMemorySimulator:")?;
        writeln!(f, " * elements: {}", self.state.elements.len())?;
        writeln!(f, " * globals: {}", self.state.globals.len())?;
        writeln!(f, " * alignment errors: {}", self.state.alignments.len())?;
        writeln!(f, " * field errors: {}", self.state.fields.len())?;
        write!(f, " * undo history: {}", self.log.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Builder;

    fn sim() -> InMemorySimulator {
        InMemorySimulator::builder()
            .element("m1", "monitor", 0.5)
            .element("h1", "hkicker", 1.)
            .attr("h1", "kick", "kh1")
            .element("q1", "quadrupole", 2.)
            .attr("q1", "k1", "kq1 * 2")
            .element("m2", "monitor", 3.)
            .global("kq1", 0.5)
            .response(|state, monitors, knobs| {
                let k1 = state.element_attr_or_zero("q1", "k1");
                Ok(Orm::filled(monitors.len(), knobs.len(), k1))
            })
            .build()
            .unwrap()
    }

    #[test]
    fn attributes() {
        let mut sim = sim();
        assert_eq!(sim.element_attr("Q1", "K1").unwrap(), 1.);
        assert_eq!(
            sim.element_attr_definition("q1", "k1").unwrap(),
            Value::from("kq1 * 2")
        );
        sim.set_global("KQ1", 1.).unwrap();
        assert_eq!(sim.element_attr("q1", "k1").unwrap(), 2.);
        assert!(matches!(
            sim.element_attr("q1", "k2"),
            Err(SimulatorError::UnknownAttribute { .. })
        ));
    }

    #[test]
    fn knobs_from_expressions() {
        let sim = sim();
        let elements = sim.elements();
        assert_eq!(elements[1].knobs, vec!["kh1"]);
        assert_eq!(elements[2].knobs, vec!["kq1"]);
        assert_eq!(sim.element_index("M2"), Some(3));
    }

    #[test]
    fn selection() {
        let sim = sim();
        let all = sim.state().select(&Selection::range("#s/#e")).unwrap();
        assert_eq!(all.len(), 4);
        let monitors = sim
            .state()
            .select(&Selection::range("#s/#e").class("monitor"))
            .unwrap();
        assert_eq!(monitors, vec!["m1", "m2"]);
        let span = sim.state().select(&Selection::range("h1/q1")).unwrap();
        assert_eq!(span, vec!["h1", "q1"]);
        assert_eq!(sim.selected_elements(&Selection::range("H1/Q1")).unwrap(), span);
    }

    #[test]
    fn errors_and_undo() {
        let mut sim = sim();
        let cp = sim.checkpoint();
        sim.select_errors(&Selection::range("q1")).unwrap();
        sim.ealign("dx", 1e-3).unwrap();
        sim.efcomp(&FieldComponent {
            attr: "dkn".into(),
            values: vec![0., 1e-4],
            order: None,
            radius: None,
        })
        .unwrap();
        assert_eq!(sim.alignment_error(&Selection::range("q1"), "dx"), Some(1e-3));
        assert_eq!(
            sim.field_error(&Selection::range("q1"), "dkn"),
            Some(vec![0., 1e-4])
        );
        sim.restore(cp).unwrap();
        assert_eq!(sim.alignment_error(&Selection::range("q1"), "dx"), Some(0.));
        assert!(sim.state().fields.is_empty());
        assert!(sim.ealign("dx", 1.).is_err());
    }

    #[test]
    fn response() {
        let mut sim = sim();
        let orm = sim
            .orbit_response_matrix(&["m1".into(), "m2".into()], &["kh1".into()])
            .unwrap();
        assert_eq!(orm.shape(), (2, 2, 1));
        assert_eq!(orm[(1, 1, 0)], 1.);
        assert_eq!(sim.n_twiss(), 1);
        assert!(sim
            .orbit_response_matrix(&["m9".into()], &["kh1".into()])
            .is_err());
    }

    #[test]
    fn response_shape() {
        let mut sim = InMemorySimulator::builder()
            .element("m1", "monitor", 0.5)
            .response(|_, _, knobs| Ok(Orm::zeros(3, knobs.len())))
            .build()
            .unwrap();
        assert!(matches!(
            sim.orbit_response_matrix(&["m1".into()], &["kh1".into()]),
            Err(SimulatorError::ResponseShape {
                expected: (1, 2, 1),
                found: (3, 2, 1)
            })
        ));
        assert!(!sim.is_twiss_valid());
    }
}
