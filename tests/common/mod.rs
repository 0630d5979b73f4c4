#![allow(dead_code)]

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use spline_unfold::{Measurement, Response};

pub const RANGE: (f64, f64) = (-5.0, 5.0);
const SMEARING_SIGMA: f64 = 0.5;
const EFFICIENCY: f64 = 0.8;
const SIGNAL_FRACTION: f64 = 0.7;
const SUBDIVISIONS: usize = 16;

/// Gaussian peak on a flat background, smeared and partly lost in detection.
pub struct ToyProblem {
    pub response: Response,
    pub truth: Array1<f64>,
    pub expected: Array1<f64>,
    pub measurement: Measurement,
}

fn gaussian(x: f64, mean: f64, sigma: f64) -> f64 {
    let z = (x - mean) / sigma;
    (-0.5 * z * z).exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt())
}

fn truth_density(x: f64) -> f64 {
    let width = RANGE.1 - RANGE.0;
    SIGNAL_FRACTION * gaussian(x, 0.5, 1.0) + (1.0 - SIGNAL_FRACTION) / width
}

/// Midpoint rule over `[lo, hi]`.
fn integrate(lo: f64, hi: f64, f: impl Fn(f64) -> f64) -> f64 {
    let h = (hi - lo) / SUBDIVISIONS as f64;
    (0..SUBDIVISIONS)
        .map(|k| f(lo + (k as f64 + 0.5) * h))
        .sum::<f64>()
        * h
}

pub fn edges(bins: usize) -> Array1<f64> {
    Array1::linspace(RANGE.0, RANGE.1, bins + 1)
}

/// Migration matrix with Gaussian smearing, averaged over each truth bin.
pub fn smearing_response(truth_edges: &Array1<f64>, measured_edges: &Array1<f64>) -> Array2<f64> {
    let num_truth = truth_edges.len() - 1;
    let num_measured = measured_edges.len() - 1;
    Array2::from_shape_fn((num_measured, num_truth), |(i, j)| {
        let (t_lo, t_hi) = (truth_edges[j], truth_edges[j + 1]);
        let (m_lo, m_hi) = (measured_edges[i], measured_edges[i + 1]);
        let migration = integrate(t_lo, t_hi, |x| {
            integrate(m_lo, m_hi, |m| gaussian(m, x, SMEARING_SIGMA))
        }) / (t_hi - t_lo);
        EFFICIENCY * migration
    })
}

pub fn toy_problem(num_truth: usize, num_measured: usize, events: f64, seed: u64) -> ToyProblem {
    let truth_edges = edges(num_truth);
    let measured_edges = edges(num_measured);
    let matrix = smearing_response(&truth_edges, &measured_edges);

    let truth = Array1::from_shape_fn(num_truth, |j| {
        events * integrate(truth_edges[j], truth_edges[j + 1], truth_density)
    });
    let expected = matrix.dot(&truth);

    let mut rng = StdRng::seed_from_u64(seed);
    let counts = expected.mapv(|lambda| {
        let poisson = Poisson::new(lambda).expect("expected counts are positive");
        poisson.sample(&mut rng)
    });

    ToyProblem {
        response: Response::new(matrix, truth_edges).expect("toy response is consistent"),
        truth,
        expected,
        measurement: Measurement::from_counts(counts),
    }
}

/// Square problem on unit-width bins `0..n` whose response is a Gaussian of
/// `sigma_bins` bins around the diagonal. Wide smearing leaves the
/// full-resolution information matrix numerically singular.
pub fn banded_problem(n: usize, sigma_bins: f64, seed: u64) -> ToyProblem {
    let matrix = Array2::from_shape_fn((n, n), |(i, j)| gaussian(i as f64, j as f64, sigma_bins));
    let centre = 0.5 * (n as f64 - 1.0);
    let truth = Array1::from_shape_fn(n, |j| {
        let z = (j as f64 - centre) / 4.0;
        1000.0 * (-0.5 * z * z).exp() + 50.0
    });
    let expected = matrix.dot(&truth);

    let mut rng = StdRng::seed_from_u64(seed);
    let counts = expected.mapv(|lambda| {
        let poisson = Poisson::new(lambda).expect("expected counts are positive");
        poisson.sample(&mut rng)
    });

    ToyProblem {
        response: Response::new(matrix, Array1::linspace(0.0, n as f64, n + 1))
            .expect("banded response is consistent"),
        truth,
        expected,
        measurement: Measurement::from_counts(counts),
    }
}
