//! End-to-end checks for the linear-Gaussian state space model.
//!
//! - sampling shapes and reproducibility
//! - batch filter vs chained online updates
//! - smoother / filter agreement at the last timestep
//! - EM monotonicity with every parameter selected
//! - dimension inference and serialization

use lgss_core::Error;
use lgss_inference::timeseries::{
    EmVars, FilterConfig, KalmanEmConfig, KalmanFilter, LinearGaussianParams, StateSpaceParams,
    filter_update, kalman_em, kalman_filter, kalman_simulate, rts_smoother,
};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn tracking_2d() -> LinearGaussianParams {
    LinearGaussianParams::new(
        DMatrix::from_row_slice(2, 2, &[1.0, 0.1, 0.0, 0.9]),
        DMatrix::from_row_slice(2, 2, &[0.05, 0.01, 0.01, 0.04]),
        DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.3, 1.0]),
        DMatrix::from_row_slice(2, 2, &[0.2, 0.0, 0.0, 0.3]),
        DVector::from_row_slice(&[0.5, -0.5]),
        DMatrix::<f64>::identity(2, 2),
    )
    .unwrap()
}

fn assert_close_vec(a: &DVector<f64>, b: &DVector<f64>, tol: f64) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < tol, "{x} vs {y}");
    }
}

fn assert_close_mat(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < tol, "{x} vs {y}");
    }
}

fn assert_symmetric_psd(p: &DMatrix<f64>) {
    let scale = p.amax().max(1.0);
    assert_close_mat(p, &p.transpose(), 1e-10 * scale);
    let eig = p.clone().symmetric_eigen();
    assert!(eig.eigenvalues.iter().all(|&l| l > -1e-10 * scale), "{:?}", eig.eigenvalues);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn sample_has_requested_shapes() {
    let kf = KalmanFilter::new(&StateSpaceParams::new().with_n_dim_state(2).with_n_dim_obs(3))
        .unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    let sim = kf.sample(5, None, &mut rng).unwrap();
    assert_eq!(sim.xs.len(), 5);
    assert_eq!(sim.ys.len(), 5);
    assert!(sim.xs.iter().all(|x| x.len() == 2));
    assert!(sim.ys.iter().all(|y| y.len() == 3));
}

#[test]
fn chained_filter_update_matches_batch_filter() {
    let params = tracking_2d();
    let mut ys = kalman_simulate(&params, 25, 3).unwrap().ys;
    ys[7] = DVector::from_row_slice(&[f64::NAN, 1.0]);
    let cfg = FilterConfig::default();
    let fr = kalman_filter(&params, &ys, cfg).unwrap();

    let mut mean = fr.filtered_means[0].clone();
    let mut cov = fr.filtered_covs[0].clone();
    for t in 1..ys.len() {
        let (m, p) = filter_update(&mean, &cov, Some(&ys[t]), &params.step_model(t).unwrap(), cfg).unwrap();
        assert_close_vec(&m, &fr.filtered_means[t], 1e-10);
        assert_close_mat(&p, &fr.filtered_covs[t], 1e-10);
        mean = m;
        cov = p;
    }
}

#[test]
fn missing_step_keeps_predicted_distribution() {
    let params = tracking_2d();
    let mut ys = kalman_simulate(&params, 10, 5).unwrap().ys;
    ys[4] = DVector::from_row_slice(&[f64::NAN, f64::NAN]);
    let fr = kalman_filter(&params, &ys, FilterConfig::default()).unwrap();
    assert_eq!(fr.filtered_means[4], fr.predicted_means[4]);
    assert_eq!(fr.filtered_covs[4], fr.predicted_covs[4]);
}

#[test]
fn smoother_agrees_with_filter_at_last_step() {
    let params = tracking_2d();
    let ys = kalman_simulate(&params, 40, 11).unwrap().ys;
    let cfg = FilterConfig::default();
    let fr = kalman_filter(&params, &ys, cfg).unwrap();
    let sr = rts_smoother(&params, &fr, cfg).unwrap();

    let last = ys.len() - 1;
    assert_close_vec(&sr.smoothed_means[last], &fr.filtered_means[last], 1e-12);
    assert_close_mat(&sr.smoothed_covs[last], &fr.filtered_covs[last], 1e-12);
    assert_eq!(sr.pairwise_covs.len(), last);

    for t in 0..ys.len() {
        assert_symmetric_psd(&fr.predicted_covs[t]);
        assert_symmetric_psd(&fr.filtered_covs[t]);
        assert_symmetric_psd(&sr.smoothed_covs[t]);
        // Smoothing never increases marginal variance.
        for i in 0..2 {
            assert!(sr.smoothed_covs[t][(i, i)] <= fr.filtered_covs[t][(i, i)] + 1e-12);
        }
    }
}

#[test]
fn em_with_all_parameters_is_monotone() {
    let params = tracking_2d();
    let ys = kalman_simulate(&params, 30, 17).unwrap().ys;
    let init = LinearGaussianParams::new(
        DMatrix::<f64>::identity(2, 2) * 0.5,
        DMatrix::<f64>::identity(2, 2),
        DMatrix::<f64>::identity(2, 2),
        DMatrix::<f64>::identity(2, 2),
        DVector::<f64>::zeros(2),
        DMatrix::<f64>::identity(2, 2),
    )
    .unwrap();

    let cfg = KalmanEmConfig { n_iter: 10, em_vars: EmVars::All, ..KalmanEmConfig::default() };
    let res = kalman_em(&init, &ys, &cfg).unwrap();
    assert_eq!(res.loglik_trace.len(), 11);
    for w in res.loglik_trace.windows(2) {
        assert!(w[1] >= w[0] - 1e-6 * w[0].abs().max(1.0), "{} -> {}", w[0], w[1]);
    }
}

#[test]
fn facade_em_improves_loglikelihood() {
    let truth = LinearGaussianParams::local_linear_trend(0.01, 0.001, 0.5, 0.0, 0.1, 1.0).unwrap();
    let ys = kalman_simulate(&truth, 200, 23).unwrap().ys;
    let mut kf = KalmanFilter::from_params(
        LinearGaussianParams::local_linear_trend(1.0, 1.0, 1.0, 0.0, 0.0, 1.0).unwrap(),
    );
    let before = kf.loglikelihood(&ys).unwrap();
    let after = kf.em(&ys, 5, None).unwrap().loglikelihood(&ys).unwrap();
    assert!(after > before);
}

#[test]
fn transition_identity_fixes_state_dim() {
    let kf = KalmanFilter::new(
        &StateSpaceParams::new().with_transition_matrices(DMatrix::<f64>::identity(5, 5)),
    )
    .unwrap();
    let p = kf.resolved_parameters();
    assert_eq!(p.n_dim_state(), 5);
    assert_eq!(p.n_dim_obs(), 1);
    assert_eq!(p.observation_matrices.first().unwrap().shape(), (1, 5));
    assert_eq!(p.initial_state_covariance, DMatrix::<f64>::identity(5, 5));
}

#[test]
fn model_types_are_thread_safe() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<KalmanFilter>();
    assert_send_sync::<LinearGaussianParams>();
    assert_send_sync::<KalmanEmConfig>();
}

#[test]
fn observation_dim_fixes_rectangular_identity() {
    let kf = KalmanFilter::new(&StateSpaceParams::new().with_n_dim_obs(5)).unwrap();
    let p = kf.resolved_parameters();
    assert_eq!(p.n_dim_state(), 1);
    assert_eq!(p.n_dim_obs(), 5);
    let c = p.observation_matrices.first().unwrap();
    assert_eq!(c.shape(), (5, 1));
    assert_eq!(c[(0, 0)], 1.0);
    assert!((1..5).all(|i| c[(i, 0)] == 0.0));
}

#[test]
fn conflicting_dimensions_are_reported() {
    let err = KalmanFilter::new(
        &StateSpaceParams::new()
            .with_transition_matrices(DMatrix::<f64>::identity(2, 2))
            .with_initial_state_mean(DVector::<f64>::zeros(3)),
    )
    .unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { .. }), "{err}");
}

#[test]
fn serialized_model_reproduces_loglikelihood() {
    let kf = KalmanFilter::from_params(tracking_2d());
    let ys = kalman_simulate(kf.resolved_parameters(), 20, 29).unwrap().ys;
    let json = serde_json::to_string(&kf).unwrap();
    let back: KalmanFilter = serde_json::from_str(&json).unwrap();
    let a = kf.loglikelihood(&ys).unwrap();
    let b = back.loglikelihood(&ys).unwrap();
    assert!((a - b).abs() < 1e-9 * a.abs().max(1.0));
}

#[test]
fn strict_policy_rejects_degenerate_innovation() {
    let params = LinearGaussianParams::new(
        DMatrix::<f64>::identity(1, 1),
        DMatrix::<f64>::identity(1, 1),
        DMatrix::<f64>::zeros(1, 1),
        DMatrix::<f64>::zeros(1, 1),
        DVector::<f64>::zeros(1),
        DMatrix::<f64>::identity(1, 1),
    )
    .unwrap();
    let ys = vec![DVector::from_row_slice(&[0.0]); 3];

    let strict = KalmanFilter::from_params(params.clone()).with_config(FilterConfig::strict());
    assert!(matches!(
        strict.filter(&ys),
        Err(Error::SingularCovariance { timestep: Some(0), .. })
    ));

    let lenient = KalmanFilter::from_params(params);
    let (means, _) = lenient.filter(&ys).unwrap();
    assert_eq!(means.len(), 3);
}
