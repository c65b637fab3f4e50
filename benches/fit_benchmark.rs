use std::{f64::consts::TAU, time::Duration};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kinfit::{FitSystem, Fitter, MassConstraint, ParameterBlock, Parametrization, Vec3};
use nalgebra::{DMatrix, DVector};
use rayon::ThreadPoolBuilder;

const KAON_MASS: f64 = 0.493677;
const PION_MASS: f64 = 0.13957;
const D0_MASS: f64 = 1.86484;
const N_CANDIDATES: usize = 1000;

fn gaussian(rng: &mut fastrand::Rng) -> f64 {
    let u1 = 1.0 - rng.f64();
    let u2 = rng.f64();
    f64::sqrt(-2.0 * u1.ln()) * f64::cos(TAU * u2)
}

/// A D0 -> K pi decay with both tracks smeared by 5% in pT and 10 mrad in angle.
fn smeared_candidate(rng: &mut fastrand::Rng) -> FitSystem {
    let phi = TAU * rng.f64();
    let cos_theta = 2.0 * rng.f64() - 1.0;
    let sin_theta = f64::sqrt(1.0 - cos_theta * cos_theta);
    let direction = Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);
    let boost = Vec3::new(0.0, 0.0, 1.5 * rng.f64()).with_mass(D0_MASS).beta();
    // back-to-back in the rest frame, with the momentum fixed by the D0 mass
    let p_star = f64::sqrt(
        (D0_MASS.powi(2) - (KAON_MASS + PION_MASS).powi(2))
            * (D0_MASS.powi(2) - (KAON_MASS - PION_MASS).powi(2)),
    ) / (2.0 * D0_MASS);
    let kaon = (direction * p_star).with_mass(KAON_MASS).boost(&boost);
    let pion = (-direction * p_star).with_mass(PION_MASS).boost(&boost);
    let mut system = FitSystem::default();
    let mut ids = Vec::new();
    for (name, p4, mass) in [("K-", kaon, KAON_MASS), ("pi+", pion, PION_MASS)] {
        let pt = p4.pt() * (1.0 + 0.05 * gaussian(rng));
        let eta = p4.eta() + 0.01 * gaussian(rng);
        let phi = p4.phi() + 0.01 * gaussian(rng);
        let cov = DMatrix::from_diagonal(&DVector::from_vec(vec![(0.05 * pt).powi(2), 1e-4, 1e-4]));
        let block = ParameterBlock::new(name, Parametrization::PtEtaPhi, mass, &[pt, eta, phi], &cov)
            .unwrap();
        ids.push(system.add_block(block));
    }
    system
        .add_constraint(MassConstraint::new("m(D0)", &ids, D0_MASS))
        .unwrap();
    system
}

fn mass_fit_benchmark(c: &mut Criterion) {
    let mut rng = fastrand::Rng::with_seed(0);
    let systems: Vec<FitSystem> = (0..N_CANDIDATES)
        .map(|_| smeared_candidate(&mut rng))
        .collect();
    let fitter = Fitter::default();
    let mut group = c.benchmark_group("D0 mass fit");
    let n_threads: Vec<usize> = (0..)
        .map(|x| 1 << x)
        .take_while(|&p| p <= num_cpus::get())
        .collect();
    for threads in n_threads {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap();
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &_threads| b.iter(|| pool.install(|| black_box(fitter.fit_many(&systems)))),
        );
    }
    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default().measurement_time(Duration::from_secs(10)).sample_size(50);
    targets = mass_fit_benchmark
}
criterion_main!(benches);
