use std::{collections::HashMap, sync::Arc};

use super::{
    memory::{Element, State},
    InMemorySimulator, ResponseFn, SimulatorError, SimulatorResult, Value,
};
use crate::{Builder, Orm, OrmError};

/// [InMemorySimulator] builder
///
/// Elements are sorted by position when the simulator is built.
/// Without a response function, the model orbit response is zero.
///
/// # Examples
///
/// ```
/// use ormfit::{Builder, FromBuilder, InMemorySimulator, Orm};
/// let sim = InMemorySimulator::builder()
///     .element("h1", "hkicker", 1.0)
///     .attr("h1", "kick", "kh1")
///     .element("m1", "monitor", 2.0)
///     .global("kh1", 0.0)
///     .response(|state, monitors, knobs| {
///         Ok(Orm::filled(monitors.len(), knobs.len(), 2.0 * state.global("gain")))
///     })
///     .build()
///     .unwrap();
/// ```
#[derive(Default)]
pub struct InMemorySimulatorBuilder {
    elements: Vec<(String, String, f64)>,
    attrs: Vec<(String, String, Value)>,
    globals: Vec<(String, f64)>,
    initial: Vec<(String, f64)>,
    response: Option<Arc<ResponseFn>>,
}

impl InMemorySimulatorBuilder {
    /// Adds an element of type `base_name` at `position`
    pub fn element(mut self, name: &str, base_name: &str, position: f64) -> Self {
        self.elements
            .push((name.to_lowercase(), base_name.to_lowercase(), position));
        self
    }
    /// Defines an element attribute, either a number or an expression
    pub fn attr<V: Into<Value>>(mut self, elem: &str, attr: &str, value: V) -> Self {
        self.attrs
            .push((elem.to_lowercase(), attr.to_lowercase(), value.into()));
        self
    }
    /// Defines a global variable
    pub fn global(mut self, name: &str, value: f64) -> Self {
        self.globals.push((name.to_lowercase(), value));
        self
    }
    /// Sets an initial orbit coordinate
    pub fn initial_condition(mut self, name: &str, value: f64) -> Self {
        self.initial.push((name.to_lowercase(), value));
        self
    }
    /// Sets the model orbit response function
    pub fn response<F>(self, response: F) -> Self
    where
        F: Fn(&State, &[String], &[String]) -> SimulatorResult<Orm> + Send + Sync + 'static,
    {
        Self {
            response: Some(Arc::new(response)),
            ..self
        }
    }
}

impl Builder for InMemorySimulatorBuilder {
    type Component = InMemorySimulator;
    fn build(self) -> crate::Result<InMemorySimulator> {
        let mut elements: Vec<Element> = self
            .elements
            .into_iter()
            .map(|(name, base_name, position)| Element {
                name,
                base_name,
                position,
                attrs: Default::default(),
            })
            .collect();
        elements.sort_by(|a, b| a.position.total_cmp(&b.position));
        let index: HashMap<String, usize> = elements
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        let mut state = State {
            elements,
            index,
            globals: self.globals.into_iter().collect(),
            initial: self.initial.into_iter().collect(),
            ..Default::default()
        };
        for (elem, attr, value) in self.attrs {
            let i = *state
                .index
                .get(&elem)
                .ok_or(OrmError::Simulator(SimulatorError::UnknownElement(elem)))?;
            state.elements[i].attrs.insert(attr, value);
        }
        for e in &state.elements {
            for value in e.attrs.values() {
                state.evaluate(value)?;
            }
        }
        log::debug!(
            "in-memory simulator with {} elements and {} globals",
            state.elements.len(),
            state.globals.len()
        );
        let response: Arc<ResponseFn> = match self.response {
            Some(response) => response,
            None => Arc::new(
                |_: &State, monitors: &[String], knobs: &[String]| -> SimulatorResult<Orm> {
                    Ok(Orm::zeros(monitors.len(), knobs.len()))
                },
            ),
        };
        Ok(InMemorySimulator::new(state, response))
    }
}
