//!
//! # Orbit response matrix
//!
//! [Orm] is a dense `monitor × plane × knob` tensor where the plane axis is
//! `[x, y]`. Every entry is `Δorbit/Δknob`.
//!
//! The same layout is used for measured responses, their standard deviation,
//! model responses and derivatives of the model responses with respect to a
//! machine error.

use std::{
    fmt::Display,
    ops::{Add, Div, Index, IndexMut, Mul, Sub},
};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Number of transverse planes, `x` and `y`
pub const N_PLANE: usize = 2;

/// Orbit response matrix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Orm {
    n_monitor: usize,
    n_knob: usize,
    data: Vec<f64>,
}

impl Orm {
    /// Creates a `n_monitor × 2 × n_knob` matrix filled with `value`
    pub fn filled(n_monitor: usize, n_knob: usize, value: f64) -> Self {
        Self {
            n_monitor,
            n_knob,
            data: vec![value; n_monitor * N_PLANE * n_knob],
        }
    }
    /// Creates a zero matrix
    pub fn zeros(n_monitor: usize, n_knob: usize) -> Self {
        Self::filled(n_monitor, n_knob, 0f64)
    }
    /// Creates a matrix from a function of `(monitor, plane, knob)`
    pub fn from_fn<F>(n_monitor: usize, n_knob: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> f64,
    {
        let mut data = Vec::with_capacity(n_monitor * N_PLANE * n_knob);
        for m in 0..n_monitor {
            for p in 0..N_PLANE {
                for k in 0..n_knob {
                    data.push(f(m, p, k));
                }
            }
        }
        Self {
            n_monitor,
            n_knob,
            data,
        }
    }
    /// Stacks knob columns, each column being a `n_monitor × 2` slice of `[x, y]` pairs
    pub fn from_columns(columns: &[Vec<[f64; N_PLANE]>]) -> Self {
        let n_knob = columns.len();
        let n_monitor = columns.first().map_or(0, |c| c.len());
        assert!(
            columns.iter().all(|c| c.len() == n_monitor),
            "all knob columns must have {} monitors",
            n_monitor
        );
        Self::from_fn(n_monitor, n_knob, |m, p, k| columns[k][m][p])
    }
    /// Returns `(n_monitor, 2, n_knob)`
    #[inline]
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_monitor, N_PLANE, self.n_knob)
    }
    #[inline]
    pub fn n_monitor(&self) -> usize {
        self.n_monitor
    }
    #[inline]
    pub fn n_knob(&self) -> usize {
        self.n_knob
    }
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    #[inline]
    fn offset(&self, monitor: usize, plane: usize, knob: usize) -> usize {
        assert!(
            monitor < self.n_monitor && plane < N_PLANE && knob < self.n_knob,
            "index ({}, {}, {}) out of bounds for ORM of shape {:?}",
            monitor,
            plane,
            knob,
            self.shape()
        );
        (monitor * N_PLANE + plane) * self.n_knob + knob
    }
    /// Returns the raw data in `(monitor, plane, knob)` row-major order
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.data.iter()
    }
    /// Applies `f` to every entry
    pub fn map<F: FnMut(f64) -> f64>(&self, f: F) -> Self {
        Self {
            data: self.data.iter().cloned().map(f).collect(),
            ..*self
        }
    }
    /// Combines two matrices of identical shape entry-wise
    pub fn zip_map<F: FnMut(f64, f64) -> f64>(&self, other: &Orm, mut f: F) -> Self {
        assert_eq!(
            self.shape(),
            other.shape(),
            "ORM shape mismatch: {:?} vs {:?}",
            self.shape(),
            other.shape()
        );
        Self {
            data: self
                .data
                .iter()
                .zip(&other.data)
                .map(|(a, b)| f(*a, *b))
                .collect(),
            ..*self
        }
    }
    /// Returns the `[x, y]` response of a monitor to a knob
    pub fn response(&self, monitor: usize, knob: usize) -> [f64; N_PLANE] {
        [self[(monitor, 0, knob)], self[(monitor, 1, knob)]]
    }
    /// Flattens the entries of the given monitors and planes
    ///
    /// The entries are ordered monitor first, then plane, then knob.
    pub fn select(&self, monitors: &[usize], planes: &[usize]) -> Vec<f64> {
        let mut v = Vec::with_capacity(monitors.len() * planes.len() * self.n_knob);
        if self.n_knob == 0 {
            return v;
        }
        for &m in monitors {
            for &p in planes {
                let o = self.offset(m, p, 0);
                v.extend_from_slice(&self.data[o..o + self.n_knob]);
            }
        }
        v
    }
    /// Same as [Orm::select] as a column vector
    pub fn select_vector(&self, monitors: &[usize], planes: &[usize]) -> DVector<f64> {
        DVector::from_vec(self.select(monitors, planes))
    }
    /// Maximum absolute entry
    pub fn max_abs(&self) -> f64 {
        self.data.iter().fold(0f64, |a, x| a.max(x.abs()))
    }
}

impl Index<(usize, usize, usize)> for Orm {
    type Output = f64;
    fn index(&self, (m, p, k): (usize, usize, usize)) -> &Self::Output {
        &self.data[self.offset(m, p, k)]
    }
}
impl IndexMut<(usize, usize, usize)> for Orm {
    fn index_mut(&mut self, (m, p, k): (usize, usize, usize)) -> &mut Self::Output {
        let o = self.offset(m, p, k);
        &mut self.data[o]
    }
}

impl Sub<&Orm> for &Orm {
    type Output = Orm;
    fn sub(self, rhs: &Orm) -> Self::Output {
        self.zip_map(rhs, |a, b| a - b)
    }
}
impl Sub<&Orm> for Orm {
    type Output = Orm;
    fn sub(self, rhs: &Orm) -> Self::Output {
        &self - rhs
    }
}
impl Add<&Orm> for &Orm {
    type Output = Orm;
    fn add(self, rhs: &Orm) -> Self::Output {
        self.zip_map(rhs, |a, b| a + b)
    }
}
/// Entry-wise division
impl Div<&Orm> for &Orm {
    type Output = Orm;
    fn div(self, rhs: &Orm) -> Self::Output {
        self.zip_map(rhs, |a, b| a / b)
    }
}
impl Div<&Orm> for Orm {
    type Output = Orm;
    fn div(self, rhs: &Orm) -> Self::Output {
        &self / rhs
    }
}
impl Div<f64> for Orm {
    type Output = Orm;
    fn div(mut self, rhs: f64) -> Self::Output {
        self.data.iter_mut().for_each(|x| *x /= rhs);
        self
    }
}
impl Mul<f64> for Orm {
    type Output = Orm;
    fn mul(mut self, rhs: f64) -> Self::Output {
        self.data.iter_mut().for_each(|x| *x *= rhs);
        self
    }
}

impl Display for Orm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "ORM {:?}:", self.shape())?;
        if self.n_knob == 0 {
            return Ok(());
        }
        for m in 0..self.n_monitor {
            for (p, plane) in ["x", "y"].iter().enumerate() {
                let o = self.offset(m, p, 0);
                writeln!(
                    f,
                    " #{:<3} {}: [{}]",
                    m,
                    plane,
                    self.data[o..o + self.n_knob]
                        .iter()
                        .map(|x| format!("{:>+10.3e}", x))
                        .collect::<Vec<String>>()
                        .join(", ")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        let orm = Orm::from_fn(3, 4, |m, p, k| (100 * m + 10 * p + k) as f64);
        assert_eq!(orm.shape(), (3, 2, 4));
        assert_eq!(orm[(2, 1, 3)], 213.);
        assert_eq!(orm.response(1, 2), [102., 112.]);
    }

    #[test]
    fn select_monitors_and_planes() {
        let orm = Orm::from_fn(3, 2, |m, p, k| (100 * m + 10 * p + k) as f64);
        assert_eq!(orm.select(&[2, 0], &[1]), vec![210., 211., 10., 11.]);
        assert_eq!(orm.select(&[1], &[0, 1]).len(), 4);
    }

    #[test]
    fn from_columns() {
        let orm = Orm::from_columns(&[vec![[1., 2.], [3., 4.]], vec![[5., 6.], [7., 8.]]]);
        assert_eq!(orm.shape(), (2, 2, 2));
        assert_eq!(orm[(1, 0, 1)], 7.);
        assert_eq!(orm[(0, 1, 0)], 2.);
    }

    #[test]
    fn arithmetic() {
        let a = Orm::filled(2, 2, 3.);
        let b = Orm::filled(2, 2, 1.);
        let d = (&a - &b) / 4.;
        assert!(d.iter().all(|&x| x == 0.5));
        let r = &a / &Orm::filled(2, 2, 2.);
        assert!(r.iter().all(|&x| x == 1.5));
    }

    #[test]
    #[should_panic]
    fn shape_mismatch() {
        let _ = &Orm::zeros(2, 2) - &Orm::zeros(2, 3);
    }
}
