use criterion::*;
use ormfit::{
    deriv::{orm_derivatives, orm_derivatives_par},
    fit::{FitState, FitTarget},
    Builder, ErrorParameter, FitDriver, FromBuilder, InMemorySimulator, LeastSquares, Mode, Orm,
    Simulator,
};

// `n` monitors and quadrupoles interleaved after `n` steerers
fn lattice(n: usize) -> InMemorySimulator {
    let mut builder = InMemorySimulator::builder();
    for i in 0..n {
        builder = builder
            .element(&format!("h{}", i), "hkicker", i as f64)
            .attr(&format!("h{}", i), "kick", format!("kh{}", i).as_str())
            .global(&format!("kh{}", i), 0.);
    }
    for i in 0..n {
        let s = (n + 2 * i) as f64;
        builder = builder
            .element(&format!("q{}", i), "quadrupole", s)
            .attr(&format!("q{}", i), "k1", format!("kq{}", i).as_str())
            .global(&format!("kq{}", i), 0.1)
            .element(&format!("m{}", i), "monitor", s + 1.);
    }
    builder
        .response(move |state, monitors, knobs| {
            let k1: Vec<f64> = (0..n)
                .map(|i| state.element_attr_or_zero(&format!("q{}", i), "k1"))
                .collect();
            Ok(Orm::from_fn(monitors.len(), knobs.len(), |m, p, k| {
                let focusing: f64 = k1[..=m].iter().map(|k1| 1. + k1 * (p as f64 - 0.5)).product();
                (n + 2 * m + 1 - k) as f64 * focusing
            }))
        })
        .build()
        .unwrap()
}

fn names(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{}{}", prefix, i)).collect()
}

pub fn derivatives_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("orm_derivatives");
    for n in [8, 32] {
        let mut sim = lattice(n);
        let (monitors, knobs) = (names("m", n), names("kh", n));
        let base = sim.orbit_response_matrix(&monitors, &knobs).unwrap();
        let errors: Vec<ErrorParameter> = names("kq", n)
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        group.bench_with_input(BenchmarkId::new("serial", n), &n, |b, _| {
            b.iter(|| orm_derivatives(&mut sim, &monitors, &knobs, &base, &errors, None).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("parallel", n), &n, |b, _| {
            b.iter(|| orm_derivatives_par(&sim, &monitors, &knobs, &base, &errors).unwrap())
        });
    }
    group.finish();
}

pub fn lstsq_benchmark(c: &mut Criterion) {
    let n = 16;
    let mut truth = lattice(n);
    let (monitors, knobs) = (names("m", n), names("kh", n));
    truth.set_global("kq3", 0.12).unwrap();
    let measured = truth.orbit_response_matrix(&monitors, &knobs).unwrap();
    let subset: Vec<usize> = (0..n).collect();
    let target = FitTarget {
        monitors: &monitors,
        knobs: &knobs,
        measured: &measured,
        stddev: None,
        monitor_subset: &subset,
        mode: Mode::XY,
    };
    c.bench_function("lstsq", |b| {
        b.iter_batched(
            || {
                let errors: Vec<ErrorParameter> =
                    names("kq", n).iter().map(|s| s.parse().unwrap()).collect();
                (lattice(n), errors)
            },
            |(mut sim, mut errors)| {
                LeastSquares::default()
                    .fit(&mut sim, &target, &mut errors, 2, &mut |_: &FitState<'_>| ())
                    .unwrap()
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, derivatives_benchmark, lstsq_benchmark);
criterion_main!(benches);
