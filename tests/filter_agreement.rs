use nalgebra::DVector;

use ssf_rs::arima::{Sarima, SarimaOrder};
use ssf_rs::components::{LocalLevel, SeasonalModel};
use ssf_rs::initialization::KalmanInit;
use ssf_rs::kalman::{diffuse_filter, ordinary_filter};
use ssf_rs::likelihood::LikelihoodAccumulator;
use ssf_rs::multivariate::{multivariate_likelihood, MultivariateSsf};
use ssf_rs::simulate::{simulate, simulate_from};
use ssf_rs::types::observations;
use ssf_rs::{
    compute_likelihood, BsmSpec, BsmVariances, CompositeSsf, FilterAlgorithm, FilterConfig, Ssf,
    SsfError,
};

const ALGORITHMS: [FilterAlgorithm; 4] = [
    FilterAlgorithm::Ordinary,
    FilterAlgorithm::SquareRoot,
    FilterAlgorithm::Augmented,
    FilterAlgorithm::Ckms,
];

fn assert_close(a: f64, b: f64, what: &str) {
    let tol = 1e-6 * a.abs().max(b.abs()).max(1.0);
    assert!((a - b).abs() < tol, "{}: {} vs {}", what, a, b);
}

fn loglikes(ssf: &Ssf, data: &[Option<f64>], concentrated: bool) -> Vec<f64> {
    ALGORITHMS
        .iter()
        .map(|&algorithm| {
            let config = FilterConfig {
                concentrate_scale: concentrated,
                ..FilterConfig::with_algorithm(algorithm)
            };
            compute_likelihood(ssf, data, &config)
                .unwrap_or_else(|e| panic!("{:?}: {}", algorithm, e))
                .loglike
        })
        .collect()
}

fn bsm12() -> (CompositeSsf, Vec<Option<f64>>) {
    let model = BsmSpec::basic(12)
        .build_from_ratios(&[0.01, 0.001, 0.001])
        .unwrap();
    let mut initial = DVector::zeros(13);
    initial[0] = 50.0;
    initial[1] = 0.2;
    for i in 0..11 {
        initial[2 + i] = ((i as f64) * 0.7).sin() * 3.0;
    }
    let y = simulate_from(model.ssf(), 120, &initial, 21).unwrap().observations;
    (model, observations(&y))
}

#[test]
fn bsm_filters_agree() {
    let (model, data) = bsm12();
    for concentrated in [true, false] {
        let ll = loglikes(model.ssf(), &data, concentrated);
        for (i, algorithm) in ALGORITHMS.iter().enumerate().skip(1) {
            assert_close(ll[0], ll[i], &format!("{:?}", algorithm));
        }
    }
}

#[test]
fn airline_filters_agree() {
    let model = Sarima::new(SarimaOrder::airline(12), &[], &[-0.4], &[], &[-0.6], 1.0).unwrap();
    let ssf = Ssf::from_component(model, None).unwrap();
    let data = observations(&simulate(&ssf, 144, 3).unwrap().observations);
    let ll = loglikes(&ssf, &data, true);
    for (i, algorithm) in ALGORITHMS.iter().enumerate().skip(1) {
        assert_close(ll[0], ll[i], &format!("{:?}", algorithm));
    }
}

#[test]
fn arima_with_noise_filters_agree() {
    let model = Sarima::new(SarimaOrder::arima(1, 1, 1), &[0.5], &[0.3], &[], &[], 0.8).unwrap();
    let composite = CompositeSsf::builder().add(model).measurement(0.5).build().unwrap();
    let data = observations(&simulate(composite.ssf(), 80, 9).unwrap().observations);
    let ll = loglikes(composite.ssf(), &data, false);
    for (i, algorithm) in ALGORITHMS.iter().enumerate().skip(1) {
        assert_close(ll[0], ll[i], &format!("{:?}", algorithm));
    }
}

#[test]
fn missing_values_agree_except_ckms() {
    let (model, mut data) = bsm12();
    for k in [20, 57, 58, 101] {
        data[k] = None;
    }
    let config = |a| FilterConfig::with_algorithm(a);
    let ordinary = compute_likelihood(model.ssf(), &data, &config(FilterAlgorithm::Ordinary)).unwrap();
    assert_eq!(ordinary.n, 116);
    for algorithm in [FilterAlgorithm::SquareRoot, FilterAlgorithm::Augmented] {
        let other = compute_likelihood(model.ssf(), &data, &config(algorithm)).unwrap();
        assert_close(ordinary.loglike, other.loglike, &format!("{:?}", algorithm));
        assert_close(ordinary.scale, other.scale, &format!("{:?} scale", algorithm));
    }
    let err = compute_likelihood(model.ssf(), &data, &config(FilterAlgorithm::Ckms)).unwrap_err();
    assert!(matches!(err, SsfError::DataError(_)), "{:?}", err);
}

#[test]
fn noise_free_local_level_filters_agree() {
    // Random walk observed without noise: the first value is diffuse, the
    // others have e = first difference and F = 1.
    let ssf = Ssf::from_component(LocalLevel::new(1.0).unwrap(), None).unwrap();
    let data = observations(&[1.0, 2.5, 2.0, 4.0, 3.5, 5.0]);
    // Squared differences sum to 9, m = 5.
    let m = 5.0;
    let expected = -0.5 * (m * (2.0 * std::f64::consts::PI).ln() + m * (1.0 + (9.0f64 / m).ln()));
    for algorithm in ALGORITHMS {
        let ll = compute_likelihood(&ssf, &data, &FilterConfig::with_algorithm(algorithm))
            .unwrap_or_else(|e| panic!("{:?}: {}", algorithm, e));
        assert_eq!((ll.n, ll.nd), (6, 1), "{:?}", algorithm);
        assert_close(ll.loglike, expected, &format!("{:?}", algorithm));
    }
    let rows: Vec<Vec<Option<f64>>> = data.iter().map(|&y| vec![y]).collect();
    let multi = multivariate_likelihood(&MultivariateSsf::from_univariate(&ssf).unwrap(), &rows, true)
        .unwrap();
    assert_eq!((multi.n, multi.nd), (6, 1));
    assert_close(multi.loglike, expected, "multivariate");
}

#[test]
fn noise_free_trend_and_seasonal_filters_agree() {
    let spec = BsmSpec::new(true, true, Some((4, SeasonalModel::Dummy)), false).unwrap();
    let variances = BsmVariances {
        level: 0.3,
        slope: 0.02,
        seasonal: 0.1,
        noise: 0.0,
    };
    let model = spec.build(&variances).unwrap();
    let pattern = [1.0, -0.5, 0.2, -0.7];
    let y: Vec<f64> = (0..30)
        .map(|t| 10.0 + 0.3 * t as f64 + pattern[t % 4] + 0.4 * (1.3 * t as f64).sin())
        .collect();
    let mut data = observations(&y);
    for concentrated in [true, false] {
        let ll = loglikes(model.ssf(), &data, concentrated);
        for (i, algorithm) in ALGORITHMS.iter().enumerate().skip(1) {
            assert_close(ll[0], ll[i], &format!("{:?}", algorithm));
        }
    }

    for k in [3, 6, 7] {
        data[k] = None;
    }
    let config = |a| FilterConfig::with_algorithm(a);
    let ordinary = compute_likelihood(model.ssf(), &data, &config(FilterAlgorithm::Ordinary)).unwrap();
    assert_eq!(ordinary.n, 27);
    for algorithm in [FilterAlgorithm::SquareRoot, FilterAlgorithm::Augmented] {
        let other = compute_likelihood(model.ssf(), &data, &config(algorithm)).unwrap();
        assert_eq!((other.n, other.nd), (ordinary.n, ordinary.nd), "{:?}", algorithm);
        assert_close(ordinary.loglike, other.loglike, &format!("{:?}", algorithm));
    }
    let rows: Vec<Vec<Option<f64>>> = data.iter().map(|&y| vec![y]).collect();
    let multi = multivariate_likelihood(&MultivariateSsf::from_univariate(model.ssf()).unwrap(), &rows, true)
        .unwrap();
    assert_eq!(multi.n, 27);
    assert_close(ordinary.loglike, multi.loglike, "multivariate");
}

#[test]
fn concentrated_likelihood_follows_the_data_scale() {
    // ll(c y) = ll(y) - m ln c once the scale is concentrated out, also when
    // the rescaled values are far below the variance tolerance.
    let (model, data) = bsm12();
    let c = 1e-6;
    let scaled: Vec<Option<f64>> = data.iter().map(|y| y.map(|v| v * c)).collect();
    let ll = loglikes(model.ssf(), &data, true);
    let ll_scaled = loglikes(model.ssf(), &scaled, true);
    let m = (120 - 13) as f64;
    for (i, algorithm) in ALGORITHMS.iter().enumerate() {
        assert_close(ll_scaled[i], ll[i] - m * c.ln(), &format!("{:?}", algorithm));
    }
}

#[test]
fn univariate_and_multivariate_agree() {
    let (model, data) = bsm12();
    let uni = compute_likelihood(model.ssf(), &data, &FilterConfig::default()).unwrap();
    let multi_ssf = MultivariateSsf::from_univariate(model.ssf()).unwrap();
    let rows: Vec<Vec<Option<f64>>> = data.iter().map(|&y| vec![y]).collect();
    let multi = multivariate_likelihood(&multi_ssf, &rows, true).unwrap();
    assert_close(uni.loglike, multi.loglike, "multivariate");
}

#[test]
fn stationary_model_diffuse_and_ordinary_paths_identical() {
    let model = Sarima::new(SarimaOrder::arima(1, 0, 1), &[0.7], &[-0.2], &[], &[], 1.5).unwrap();
    let composite = CompositeSsf::builder().add(model).measurement(0.3).build().unwrap();
    let ssf = composite.ssf();
    assert_eq!(ssf.diffuse_dim(), 0);
    let mut data = observations(&simulate(ssf, 60, 4).unwrap().observations);
    data[10] = None;

    let mut diffuse = LikelihoodAccumulator::default();
    let end_diffuse = diffuse_filter(ssf, &data, &mut diffuse).unwrap();
    let mut plain = LikelihoodAccumulator::default();
    let end_plain = ordinary_filter(ssf, &data, 0, ssf.initial_state().unwrap(), &mut plain).unwrap();
    assert_eq!(end_diffuse, end_plain);

    let a = diffuse.finish(true).unwrap();
    let b = plain.finish(true).unwrap();
    assert_eq!(a, b);

    // Approximate diffuse initialization has nothing to inflate here.
    let init = KalmanInit::approximate_diffuse(ssf, KalmanInit::default_kappa()).unwrap();
    assert_eq!(init.loglikelihood_burn, 0);
    let mut approx = LikelihoodAccumulator::default();
    ordinary_filter(ssf, &data, 0, init.state(), &mut approx).unwrap();
    assert_eq!(approx.finish(true).unwrap().loglike, a.loglike);
}
