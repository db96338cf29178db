//! Central finite-difference verification of every analytic gradient family
//! against the covariance evaluators they differentiate.

use gpcov::{
    CovarianceFunction, GammaPrior, GaussianPrior, ScaledEuclidean, SquaredExponential,
    UniformPrior,
};
use approx::assert_relative_eq;
use ndarray::{Array2, ArrayView2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_inputs(seed: u64, n: usize, m: usize) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, m), |_| rng.random_range(-2.0..2.0))
}

fn isotropic_kernel() -> SquaredExponential {
    SquaredExponential::isotropic(0.8, 1.2)
        .unwrap()
        .with_magnitude_prior(Some(Box::new(GaussianPrior::new(0.5, 2.0).unwrap())))
        .with_length_scale_prior(Some(Box::new(GammaPrior::new(2.0, 1.5).unwrap())))
        .unwrap()
}

fn ard_kernel(m: usize) -> SquaredExponential {
    let scales: Vec<f64> = (0..m).map(|j| 0.8 + 0.3 * j as f64).collect();
    SquaredExponential::ard(1.1, &scales)
        .unwrap()
        .with_magnitude_prior(Some(Box::new(GaussianPrior::new(0.0, 3.0).unwrap())))
        .with_length_scale_prior(Some(Box::new(GammaPrior::new(3.0, 2.0).unwrap())))
        .unwrap()
}

/// Finite-difference check of the covariance derivative matrices against a
/// perturbation of the packed (log-space) hyperparameter vector.
fn check_hyper_gradients(kernel: &SquaredExponential, x: ArrayView2<'_, f64>) {
    let (w, _) = kernel.pack();
    let grads = kernel.hyper_gradients(x).unwrap();
    assert_eq!(grads.matrices.len(), w.len());
    assert_eq!(grads.prior.len(), w.len());

    let h = 1e-5;
    for idx in 0..w.len() {
        let mut wp = w.clone();
        let mut wm = w.clone();
        wp[idx] += h;
        wm[idx] -= h;
        let (kp, _) = kernel.unpack(&wp).unwrap();
        let (km, _) = kernel.unpack(&wm).unwrap();
        let cp = kp.train_covariance(x).unwrap();
        let cm = km.train_covariance(x).unwrap();
        for ((plus, minus), analytic) in cp.iter().zip(cm.iter()).zip(grads.matrices[idx].iter()) {
            let fd = (plus - minus) / (2.0 * h);
            assert_relative_eq!(*analytic, fd, epsilon = 1e-7, max_relative = 1e-5);
        }

        // Prior-energy gradient against the same perturbation.
        let fd_energy = (kp.prior_energy() - km.prior_energy()) / (2.0 * h);
        assert_relative_eq!(grads.prior[idx], fd_energy, epsilon = 1e-7, max_relative = 1e-5);
    }
}

#[test]
fn hyper_gradients_match_finite_differences() {
    for &n in &[2usize, 5] {
        let x = random_inputs(7 + n as u64, n, 1);
        check_hyper_gradients(&isotropic_kernel(), x.view());
    }
    for &m in &[1usize, 2, 3] {
        for &n in &[2usize, 5] {
            let x = random_inputs(11 + (n * m) as u64, n, m);
            check_hyper_gradients(&ard_kernel(m), x.view());
        }
    }
}

#[test]
fn hyper_gradients_match_finite_differences_under_metric() {
    let scales = [0.9, 1.6];
    let metric = ScaledEuclidean::new(&scales)
        .unwrap()
        .with_prior(Some(Box::new(GammaPrior::new(2.0, 1.0).unwrap())));
    let kernel = SquaredExponential::with_metric(0.7, Box::new(metric))
        .unwrap()
        .with_magnitude_prior(Some(Box::new(GaussianPrior::new(0.0, 2.0).unwrap())));
    let x = random_inputs(23, 4, 2);
    check_hyper_gradients(&kernel, x.view());
}

#[test]
fn cross_hyper_gradients_match_finite_differences() {
    let kernel = ard_kernel(2);
    let x = random_inputs(31, 4, 2);
    let x2 = random_inputs(32, 3, 2);
    let (w, _) = kernel.pack();
    let grads = kernel.hyper_gradients_cross(x.view(), x2.view()).unwrap();
    assert_eq!(grads.matrices.len(), w.len());

    let h = 1e-5;
    for idx in 0..w.len() {
        let mut wp = w.clone();
        let mut wm = w.clone();
        wp[idx] += h;
        wm[idx] -= h;
        let (kp, _) = kernel.unpack(&wp).unwrap();
        let (km, _) = kernel.unpack(&wm).unwrap();
        let cp = kp.covariance(x.view(), x2.view()).unwrap();
        let cm = km.covariance(x.view(), x2.view()).unwrap();
        for ((plus, minus), analytic) in cp.iter().zip(cm.iter()).zip(grads.matrices[idx].iter()) {
            let fd = (plus - minus) / (2.0 * h);
            assert_relative_eq!(*analytic, fd, epsilon = 1e-7, max_relative = 1e-5);
        }
    }
}

#[test]
fn input_gradients_match_finite_differences() {
    for &m in &[1usize, 2, 3] {
        for &n in &[2usize, 5] {
            let kernel = ard_kernel(m);
            let x = random_inputs(41 + (n * m) as u64, n, m);
            let grads = kernel.input_gradients(x.view()).unwrap();
            assert_eq!(grads.len(), n * m);

            let h = 1e-5;
            for i in 0..m {
                for p in 0..n {
                    let mut xp = x.clone();
                    let mut xm = x.clone();
                    xp[[p, i]] += h;
                    xm[[p, i]] -= h;
                    let cp = kernel.train_covariance(xp.view()).unwrap();
                    let cm = kernel.train_covariance(xm.view()).unwrap();
                    let analytic = &grads[i * n + p];
                    for a in 0..n {
                        for b in 0..n {
                            let fd = (cp[[a, b]] - cm[[a, b]]) / (2.0 * h);
                            assert_relative_eq!(
                                analytic[[a, b]],
                                fd,
                                epsilon = 1e-7,
                                max_relative = 1e-5
                            );
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn cross_input_gradients_match_finite_differences() {
    let m = 2;
    let kernel = ard_kernel(m);
    let x = random_inputs(51, 3, m);
    let x2 = random_inputs(52, 4, m);
    let grads = kernel.input_gradients_cross(x.view(), x2.view()).unwrap();
    assert_eq!(grads.len(), 3 * m);

    let h = 1e-5;
    for i in 0..m {
        for p in 0..3 {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[[p, i]] += h;
            xm[[p, i]] -= h;
            let cp = kernel.covariance(xp.view(), x2.view()).unwrap();
            let cm = kernel.covariance(xm.view(), x2.view()).unwrap();
            let analytic = &grads[i * 3 + p];
            for a in 0..3 {
                for b in 0..4 {
                    let fd = (cp[[a, b]] - cm[[a, b]]) / (2.0 * h);
                    assert_relative_eq!(analytic[[a, b]], fd, epsilon = 1e-7, max_relative = 1e-5);
                }
            }
        }
    }
}

#[test]
fn dense_input_gradients_agree_with_per_coordinate_form() {
    let m = 3;
    let n = 5;
    let kernel = ard_kernel(m);
    let x = random_inputs(61, n, m);
    let dense = kernel.input_gradients_dense(x.view()).unwrap();
    let per_coordinate = kernel.input_gradients(x.view()).unwrap();
    // Row p of the dense per-dimension block is exactly the one-sided row of
    // the per-coordinate matrix before symmetrization.
    for i in 0..m {
        for p in 0..n {
            for q in 0..n {
                if q == p {
                    continue;
                }
                assert_relative_eq!(
                    dense[i][[p, q]],
                    per_coordinate[i * n + p][[p, q]],
                    epsilon = 1e-12,
                    max_relative = 1e-10
                );
            }
        }
    }
}

#[test]
fn dense_cross_input_gradients_match_finite_differences() {
    let m = 2;
    let kernel = ard_kernel(m);
    let x = random_inputs(71, 3, m);
    let x2 = random_inputs(72, 4, m);
    let dense = kernel
        .input_gradients_dense_cross(x.view(), x2.view())
        .unwrap();

    let h = 1e-5;
    for i in 0..m {
        for p in 0..3 {
            let mut xp = x.clone();
            let mut xm = x.clone();
            xp[[p, i]] += h;
            xm[[p, i]] -= h;
            let cp = kernel.covariance(xp.view(), x2.view()).unwrap();
            let cm = kernel.covariance(xm.view(), x2.view()).unwrap();
            for q in 0..4 {
                let fd = (cp[[p, q]] - cm[[p, q]]) / (2.0 * h);
                assert_relative_eq!(dense[i][[p, q]], fd, epsilon = 1e-7, max_relative = 1e-5);
            }
        }
    }
}

/// Four-point stencil for the mixed second derivative
/// `d^2 k(x1, x2) / d x1[p,i] d x2[q,j]`.
fn fd_mixed_second(
    kernel: &SquaredExponential,
    x1: &Array2<f64>,
    x2: &Array2<f64>,
    p: usize,
    q: usize,
    i: usize,
    j: usize,
    h: f64,
) -> f64 {
    let eval = |si: f64, sj: f64| {
        let mut a = x1.clone();
        let mut b = x2.clone();
        a[[p, i]] += si * h;
        b[[q, j]] += sj * h;
        kernel.covariance(a.view(), b.view()).unwrap()[[p, q]]
    };
    (eval(1.0, 1.0) - eval(1.0, -1.0) - eval(-1.0, 1.0) + eval(-1.0, -1.0)) / (4.0 * h * h)
}

#[test]
fn second_input_gradients_match_finite_differences() {
    for &m in &[2usize, 3] {
        let kernel = ard_kernel(m);
        let x = random_inputs(81 + m as u64, 2, m);
        let x2 = random_inputs(91 + m as u64, 3, m);
        let same = kernel
            .second_input_gradients_same(x.view(), x2.view())
            .unwrap();
        let pairs = kernel
            .second_input_gradients_pairs(x.view(), x2.view())
            .unwrap();
        assert_eq!(same.combined.len(), m);
        assert_eq!(pairs.len(), m * (m - 1) / 2);

        let h = 1e-4;
        for p in 0..2 {
            for q in 0..3 {
                for i in 0..m {
                    let fd = fd_mixed_second(&kernel, &x, &x2, p, q, i, i, h);
                    assert_relative_eq!(
                        same.combined[i][[p, q]],
                        fd,
                        epsilon = 1e-6,
                        max_relative = 1e-4
                    );
                }
                let mut idx = 0;
                for j in 1..m {
                    for i in 0..j {
                        let fd = fd_mixed_second(&kernel, &x, &x2, p, q, i, j, h);
                        assert_relative_eq!(
                            pairs[idx][[p, q]],
                            fd,
                            epsilon = 1e-6,
                            max_relative = 1e-4
                        );
                        idx += 1;
                    }
                }
            }
        }
    }
}

/// Stack the dense per-dimension input-derivative blocks the way the
/// derivative-observation gradient engine lays them out.
fn stacked_dense(kernel: &SquaredExponential, x: ArrayView2<'_, f64>) -> Array2<f64> {
    let blocks = kernel.input_gradients_dense(x).unwrap();
    let n = x.nrows();
    let mut out = Array2::<f64>::zeros((blocks.len() * n, n));
    for (i, block) in blocks.iter().enumerate() {
        out.slice_mut(s![i * n..(i + 1) * n, ..]).assign(block);
    }
    out
}

#[test]
fn deriv_hyper_gradients_match_finite_differences() {
    for &m in &[1usize, 2, 3] {
        let kernel = ard_kernel(m);
        let x = random_inputs(101 + m as u64, 3, m);
        let (w, _) = kernel.pack();
        let grads = kernel.hyper_gradients_deriv(x.view()).unwrap();
        assert_eq!(grads.len(), w.len());

        let h = 1e-5;
        for idx in 0..w.len() {
            let mut wp = w.clone();
            let mut wm = w.clone();
            wp[idx] += h;
            wm[idx] -= h;
            let (kp, _) = kernel.unpack(&wp).unwrap();
            let (km, _) = kernel.unpack(&wm).unwrap();
            let fp = stacked_dense(&kp, x.view());
            let fm = stacked_dense(&km, x.view());
            for ((plus, minus), analytic) in fp.iter().zip(fm.iter()).zip(grads[idx].iter()) {
                let fd = (plus - minus) / (2.0 * h);
                assert_relative_eq!(*analytic, fd, epsilon = 1e-6, max_relative = 1e-4);
            }
        }
    }
}

/// Assemble the twice-differentiated block matrix from the second-derivative
/// primitives, diagonal blocks per dimension and symmetric off-diagonal
/// blocks in column-wise pair order.
fn assembled_second(kernel: &SquaredExponential, x: ArrayView2<'_, f64>) -> Array2<f64> {
    let same = kernel.second_input_gradients_same(x, x).unwrap();
    let pair = kernel.second_input_gradients_pairs(x, x).unwrap();
    let m = same.combined.len();
    let n = x.nrows();
    let mut out = Array2::<f64>::zeros((m * n, m * n));
    for (i, block) in same.combined.iter().enumerate() {
        out.slice_mut(s![i * n..(i + 1) * n, i * n..(i + 1) * n])
            .assign(block);
    }
    let mut idx = 0;
    for j in 1..m {
        for i in 0..j {
            out.slice_mut(s![i * n..(i + 1) * n, j * n..(j + 1) * n])
                .assign(&pair[idx]);
            out.slice_mut(s![j * n..(j + 1) * n, i * n..(i + 1) * n])
                .assign(&pair[idx]);
            idx += 1;
        }
    }
    out
}

#[test]
fn deriv2_hyper_gradients_match_finite_differences() {
    for &m in &[1usize, 2, 3] {
        let kernel = ard_kernel(m);
        let x = random_inputs(111 + m as u64, 3, m);
        let (w, _) = kernel.pack();
        let grads = kernel.hyper_gradients_deriv2(x.view()).unwrap();
        assert_eq!(grads.len(), w.len());

        let h = 1e-5;
        for idx in 0..w.len() {
            let mut wp = w.clone();
            let mut wm = w.clone();
            wp[idx] += h;
            wm[idx] -= h;
            let (kp, _) = kernel.unpack(&wp).unwrap();
            let (km, _) = kernel.unpack(&wm).unwrap();
            let fp = assembled_second(&kp, x.view());
            let fm = assembled_second(&km, x.view());
            for ((plus, minus), analytic) in fp.iter().zip(fm.iter()).zip(grads[idx].iter()) {
                let fd = (plus - minus) / (2.0 * h);
                assert_relative_eq!(*analytic, fd, epsilon = 1e-6, max_relative = 1e-4);
            }
        }
    }
}

#[test]
fn isotropic_deriv_gradients_match_collapsed_ard() {
    // With every ARD scale equal, the isotropic scale gradient must equal
    // the sum of the per-dimension ARD gradients, block for block.
    let m = 2;
    let x = random_inputs(121, 3, m);
    let iso = SquaredExponential::isotropic(0.9, 1.4)
        .unwrap()
        .with_length_scale_prior(Some(Box::new(UniformPrior)))
        .unwrap();
    let ard = SquaredExponential::ard(0.9, &[1.4, 1.4])
        .unwrap()
        .with_length_scale_prior(Some(Box::new(UniformPrior)))
        .unwrap();
    let g_iso = iso.hyper_gradients_deriv(x.view()).unwrap();
    let g_ard = ard.hyper_gradients_deriv(x.view()).unwrap();
    assert_eq!(g_iso.len(), 2);
    assert_eq!(g_ard.len(), 3);
    let summed = &g_ard[1] + &g_ard[2];
    for (a, b) in g_iso[1].iter().zip(summed.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-10, max_relative = 1e-8);
    }

    let g2_iso = iso.hyper_gradients_deriv2(x.view()).unwrap();
    let g2_ard = ard.hyper_gradients_deriv2(x.view()).unwrap();
    let summed2 = &g2_ard[1] + &g2_ard[2];
    for (a, b) in g2_iso[1].iter().zip(summed2.iter()) {
        assert_relative_eq!(a, b, epsilon = 1e-10, max_relative = 1e-8);
    }
}
