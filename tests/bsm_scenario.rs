use nalgebra::DVector;

use ssf_rs::components::{LocalLevel, LocalLinearTrend};
use ssf_rs::simulate::simulate_from;
use ssf_rs::smoother::smooth;
use ssf_rs::types::observations;
use ssf_rs::{
    compute_likelihood, fit_bsm, BsmSpec, ErrorKind, FilterAlgorithm, FilterConfig, FitConfig,
    Ssf, SsfError,
};

fn monthly_series() -> Vec<Option<f64>> {
    let spec = BsmSpec::basic(12);
    let model = spec.build_from_ratios(&[0.01, 0.0, 0.001]).unwrap();
    let mut initial = DVector::zeros(13);
    initial[0] = 100.0;
    initial[1] = 0.3;
    let pattern = [4.0, -2.0, 1.5, 3.0, -1.0, -4.5, 2.5, 0.5, -3.0, 1.0, -0.5];
    for (i, v) in pattern.iter().enumerate() {
        initial[2 + i] = *v;
    }
    observations(&simulate_from(model.ssf(), 120, &initial, 2024).unwrap().observations)
}

#[test]
fn monthly_bsm_fit_converges_with_small_gradient() {
    let spec = BsmSpec::basic(12);
    assert_eq!(spec.diffuse_dim(), 13);
    let data = monthly_series();
    let config = FitConfig::default();

    let fit = fit_bsm(&data, &spec, &config).unwrap();
    assert!(fit.converged, "{:?}", fit);
    assert!(fit.n_iter <= config.maxiter + 20, "n_iter {}", fit.n_iter);
    assert!(fit.gradient_norm < 1e-6, "gradient norm {}", fit.gradient_norm);
    assert_eq!(fit.n_obs, 120);
    assert_eq!(fit.n_params, 3);
    assert_eq!(fit.variances.len(), 4);
    assert!(fit.variances.iter().all(|v| *v >= 0.0));

    // The optimum is at least as likely as the generating ratios.
    let truth = spec.build_from_ratios(&[0.01, 0.0, 0.001]).unwrap();
    let ll_true = compute_likelihood(truth.ssf(), &data, &FilterConfig::default()).unwrap();
    assert!(fit.loglike >= ll_true.loglike - 1e-3, "{} < {}", fit.loglike, ll_true.loglike);
    assert_eq!(ll_true.nd, 13);
}

#[test]
fn smoothed_components_add_up_to_signal() {
    let spec = BsmSpec::basic(12);
    let model = spec.build_from_ratios(&[0.01, 0.0, 0.001]).unwrap();
    let mut data = monthly_series();
    data[40] = None;
    let sm = smooth(model.ssf(), &data).unwrap();
    let trend = sm.component_signal(&model, 0).unwrap();
    let seasonal = sm.component_signal(&model, 1).unwrap();
    for t in 0..data.len() {
        let z = model.ssf().loading.z(t);
        let total = z.dot(sm.a(t).unwrap());
        assert!(
            (trend[t] + seasonal[t] - total).abs() < 1e-6,
            "period {}: {} + {} != {}",
            t,
            trend[t],
            seasonal[t],
            total
        );
    }
}

#[test]
fn constant_series_is_rejected() {
    let data = observations(&[3.5; 48]);
    for ssf in [
        Ssf::from_component(LocalLevel::new(0.1).unwrap(), Some(1.0)).unwrap(),
        Ssf::from_component(LocalLinearTrend::new(0.1, 0.01).unwrap(), Some(1.0)).unwrap(),
    ] {
        for algorithm in [
            FilterAlgorithm::Ordinary,
            FilterAlgorithm::SquareRoot,
            FilterAlgorithm::Augmented,
            FilterAlgorithm::Ckms,
        ] {
            let err = compute_likelihood(&ssf, &data, &FilterConfig::with_algorithm(algorithm))
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Filter, "{:?}: {:?}", algorithm, err);
            assert!(matches!(err, SsfError::DegenerateLikelihood(_)), "{:?}", algorithm);
        }
    }
    let err = fit_bsm(&data, &BsmSpec::local_level(), &FitConfig::default()).unwrap_err();
    assert!(matches!(err, SsfError::DegenerateLikelihood(_)), "{:?}", err);
}

#[test]
fn short_series_does_not_resolve_diffuse_part() {
    let model = BsmSpec::basic(12).build_from_ratios(&[0.01, 0.0, 0.001]).unwrap();
    let data = observations(&[1.0, 2.0, 3.0, 4.0, 5.0]);
    let err = compute_likelihood(model.ssf(), &data, &FilterConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Initialization);
    assert!(matches!(
        err,
        SsfError::DiffuseNotConverged {
            remaining: 8,
            periods: 5
        }
    ));
}
