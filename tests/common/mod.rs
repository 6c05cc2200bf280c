#![allow(dead_code)]

use ormfit::{
    simulator::{SimulatorError, State},
    Builder, FromBuilder, InMemorySimulator, Orm, Simulator,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const MONITORS: [(&str, f64); 3] = [("m1", 2.), ("m2", 4.), ("m3", 5.)];
// knob, steerer position, plane
pub const KNOBS: [(&str, f64, usize); 2] = [("kh1", 0., 0), ("kv1", 0.5, 1)];
pub const QUADS: [(&str, f64); 2] = [("q1", 1.), ("q2", 3.)];

/// Thin-lens focusing factor of the quadrupoles between a steerer and a monitor
fn focusing(state: &State, plane: usize, from: f64, to: f64) -> f64 {
    QUADS
        .iter()
        .filter(|(_, s)| *s > from && *s < to)
        .map(|(q, s)| {
            let k1 = state.element_attr_or_zero(q, "k1");
            let sign = if plane == 0 { -1. } else { 1. };
            1. + sign * k1 * (to - s)
        })
        .product()
}

/// Response of a toy drift-and-thin-lens lattice
///
/// A steerer only kicks its own plane. A horizontal quadrupole offset adds
/// `k1 * dx` to the horizontal response downstream.
pub fn response(state: &State, monitors: &[String], knobs: &[String]) -> Result<Orm, SimulatorError> {
    let position = |name: &str| {
        MONITORS
            .iter()
            .find(|(m, _)| *m == name)
            .map(|(_, s)| *s)
            .ok_or_else(|| SimulatorError::UnknownElement(name.into()))
    };
    let knob = |name: &str| {
        KNOBS
            .iter()
            .find(|(k, ..)| *k == name)
            .map(|(_, s, p)| (*s, *p))
            .ok_or_else(|| SimulatorError::UnknownElement(name.into()))
    };
    let s_monitors = monitors
        .iter()
        .map(|m| position(m))
        .collect::<Result<Vec<_>, _>>()?;
    let s_knobs = knobs
        .iter()
        .map(|k| knob(k))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Orm::from_fn(monitors.len(), knobs.len(), |m, p, k| {
        let s_m = s_monitors[m];
        let (s_k, plane) = s_knobs[k];
        if plane != p || s_m <= s_k {
            return 0.;
        }
        let mut r = (s_m - s_k) * focusing(state, p, s_k, s_m);
        if p == 0 {
            r += QUADS
                .iter()
                .filter(|(_, s)| *s < s_m)
                .map(|(q, _)| state.element_attr_or_zero(q, "k1") * state.alignment(q, "dx"))
                .sum::<f64>();
        }
        r
    }))
}

pub fn lattice(kq1: f64, kq2: f64) -> InMemorySimulator {
    InMemorySimulator::builder()
        .element("h1", "hkicker", 0.)
        .attr("h1", "kick", "kh1")
        .element("v1", "vkicker", 0.5)
        .attr("v1", "kick", "kv1")
        .element("q1", "quadrupole", 1.)
        .attr("q1", "k1", "kq1")
        .element("m1", "monitor", 2.)
        .element("q2", "quadrupole", 3.)
        .attr("q2", "k1", "kq2")
        .element("m2", "monitor", 4.)
        .element("m3", "monitor", 5.)
        .global("kq1", kq1)
        .global("kq2", kq2)
        .global("kh1", 0.)
        .global("kv1", 0.)
        .response(response)
        .build()
        .unwrap()
}

pub fn monitors() -> Vec<String> {
    MONITORS.iter().map(|(m, _)| m.to_string()).collect()
}

pub fn knobs() -> Vec<String> {
    KNOBS.iter().map(|(k, ..)| k.to_string()).collect()
}

/// YAML records measured on `truth`, with `n_shot` shots of uniform noise in `[-noise, noise)`
///
/// Monitor names are written upper case.
pub fn records(truth: &mut InMemorySimulator, delta: f64, n_shot: usize, noise: f64, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    let (monitors, knobs) = (monitors(), knobs());
    let orm = truth.orbit_response_matrix(&monitors, &knobs).unwrap();
    let base: Vec<[f64; 2]> = (0..monitors.len())
        .map(|m| [1e-4 * (m + 1) as f64, -2e-4 * m as f64])
        .collect();
    let mut shots = |orbit: &dyn Fn(usize, usize) -> f64| {
        (0..n_shot)
            .map(|_| {
                let readings: Vec<String> = monitors
                    .iter()
                    .enumerate()
                    .map(|(m, name)| {
                        let mut reading = [orbit(m, 0), orbit(m, 1)];
                        if noise > 0. {
                            reading
                                .iter_mut()
                                .for_each(|r| *r += rng.gen_range(-noise..noise));
                        }
                        format!("{}: [{}, {}]", name.to_uppercase(), reading[0], reading[1])
                    })
                    .collect();
                format!("      - {{{}}}\n", readings.join(", "))
            })
            .collect::<String>()
    };
    let mut yaml = format!(
        "model: {{kh1: 0.0, kv1: 0.0}}\nmonitors: [{}]\nrecords:\n",
        monitors
            .iter()
            .map(|m| m.to_uppercase())
            .collect::<Vec<_>>()
            .join(", ")
    );
    yaml.push_str("  - optics: ~\n    shots:\n");
    yaml.push_str(&shots(&|m: usize, p: usize| base[m][p]));
    for (k, knob) in knobs.iter().enumerate() {
        yaml.push_str(&format!("  - optics: {{{}: {}}}\n    shots:\n", knob.to_uppercase(), delta));
        yaml.push_str(&shots(&|m: usize, p: usize| base[m][p] + orm[(m, p, k)] * delta));
    }
    yaml
}

/// Writes `contents` to a unique file of the temporary directory
pub fn temp_file(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("ormfit-{}-{}", std::process::id(), name));
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
