//! Maximum-likelihood estimation of BSM variance ratios.
//!
//! The scale is concentrated out of the likelihood; the free variance ratios
//! are optimized in log space (ratio = exp(x)) with L-BFGS-B,
//! L-BFGS or Nelder-Mead, followed by a Newton refinement on a numerical
//! Hessian so that the reported gradient is at the noise level of the
//! likelihood.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::bsm::BsmSpec;
use crate::error::{Result, SsfError};
use crate::likelihood::{compute_likelihood, DiffuseLikelihood};
use crate::params::{
    default_start_ratios, transform_params, untransform_params, LOG_RATIO_BOUNDS,
};
use crate::types::{FilterConfig, FitConfig, FitMethod, FitResult};

/// Cost assigned to parameter points where the likelihood cannot be evaluated.
const PENALTY: f64 = f64::MAX / 2.0;
/// Finite-difference step in the unconstrained space.
const FD_STEP: f64 = 1e-4;
/// Gradient norm at which the refinement stops.
const REFINE_TOL: f64 = 1e-9;
const REFINE_MAX_STEPS: usize = 20;
const MAX_RESTARTS: usize = 2;

/// Negative concentrated log-likelihood of a BSM as a function of the
/// unconstrained parameters.
#[derive(Clone)]
struct BsmObjective {
    data: Vec<Option<f64>>,
    spec: BsmSpec,
    filter: FilterConfig,
}

impl BsmObjective {
    fn new(data: &[Option<f64>], spec: &BsmSpec, filter: &FilterConfig) -> Self {
        Self {
            data: data.to_vec(),
            spec: *spec,
            filter: FilterConfig {
                concentrate_scale: true,
                ..*filter
            },
        }
    }

    fn likelihood(&self, unconstrained: &[f64]) -> Result<DiffuseLikelihood> {
        let model = self.spec.build_from_ratios(&transform_params(unconstrained))?;
        compute_likelihood(model.ssf(), &self.data, &self.filter)
    }

    /// Negative log-likelihood, or the penalty when the pass fails.
    fn penalized_cost(&self, unconstrained: &[f64]) -> f64 {
        match self.likelihood(unconstrained) {
            Ok(ll) => -ll.loglike,
            Err(e) => {
                warn!("likelihood evaluation failed at {:?}: {}", unconstrained, e);
                PENALTY
            }
        }
    }

    /// Central differences, one-sided next to a failed point.
    fn numerical_gradient(&self, x: &[f64]) -> Vec<f64> {
        let n = x.len();
        let mut grad = vec![0.0; n];
        let mut work = x.to_vec();
        let mut f0: Option<f64> = None;
        for i in 0..n {
            let h = FD_STEP * x[i].abs().max(1.0);
            work[i] = x[i] + h;
            let fp = self.penalized_cost(&work);
            work[i] = x[i] - h;
            let fm = self.penalized_cost(&work);
            work[i] = x[i];

            grad[i] = match (fp < PENALTY, fm < PENALTY) {
                (true, true) => (fp - fm) / (2.0 * h),
                (true, false) => {
                    let c = *f0.get_or_insert_with(|| self.penalized_cost(x));
                    (fp - c) / h
                }
                (false, true) => {
                    let c = *f0.get_or_insert_with(|| self.penalized_cost(x));
                    (c - fm) / h
                }
                (false, false) => 0.0,
            };
            if !grad[i].is_finite() {
                grad[i] = 0.0;
            }
        }
        grad
    }

    /// Symmetrized Hessian from differences of the numerical gradient.
    fn numerical_hessian(&self, x: &[f64]) -> DMatrix<f64> {
        let n = x.len();
        let mut hess = DMatrix::zeros(n, n);
        let mut work = x.to_vec();
        for j in 0..n {
            let h = FD_STEP * x[j].abs().max(1.0);
            work[j] = x[j] + h;
            let gp = self.numerical_gradient(&work);
            work[j] = x[j] - h;
            let gm = self.numerical_gradient(&work);
            work[j] = x[j];
            for i in 0..n {
                hess[(i, j)] = (gp[i] - gm[i]) / (2.0 * h);
            }
        }
        (&hess + hess.transpose()) * 0.5
    }
}

impl CostFunction for BsmObjective {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Vec<f64>) -> std::result::Result<f64, argmin::core::Error> {
        Ok(self.penalized_cost(param))
    }
}

impl Gradient for BsmObjective {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Vec<f64>) -> std::result::Result<Vec<f64>, argmin::core::Error> {
        Ok(self.numerical_gradient(param))
    }
}

fn norm(g: &[f64]) -> f64 {
    g.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// (best parameters, best cost, iterations, converged)
type RunOutput = (Vec<f64>, f64, u64, bool);

fn run_lbfgs(
    objective: BsmObjective,
    init_params: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<RunOutput, String> {
    let linesearch = MoreThuenteLineSearch::new();
    let solver = LBFGS::new(linesearch, 10)
        .with_tolerance_grad(1e-6)
        .map_err(|e| e.to_string())?
        .with_tolerance_cost(1e-12)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, Vec<f64>, (), (), (), f64>| {
                state.param(init_params).max_iters(maxiter)
            },
        )
        .run()
        .map_err(|e| format!("L-BFGS failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("L-BFGS: no best parameter found")?
        .clone();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, state.get_best_cost(), state.get_iter(), converged))
}

fn run_nelder_mead(
    objective: BsmObjective,
    init_params: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<RunOutput, String> {
    let mut simplex = vec![init_params.clone()];
    for i in 0..init_params.len() {
        let mut vertex = init_params.clone();
        vertex[i] += if vertex[i].abs() > 1e-8 {
            vertex[i] * 0.1
        } else {
            0.05
        };
        simplex.push(vertex);
    }

    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(1e-10)
        .map_err(|e| e.to_string())?;

    let result = Executor::new(objective, solver)
        .configure(
            |state: argmin::core::IterState<Vec<f64>, (), (), (), (), f64>| {
                state.max_iters(maxiter)
            },
        )
        .run()
        .map_err(|e| format!("Nelder-Mead failed: {}", e))?;

    let state = result.state();
    let best_param = state
        .get_best_param()
        .ok_or("Nelder-Mead: no best parameter found")?
        .clone();
    let term_reason = state.get_termination_reason();
    let converged = term_reason == Some(&TerminationReason::SolverConverged)
        || term_reason == Some(&TerminationReason::TargetCostReached);

    Ok((best_param, state.get_best_cost(), state.get_iter(), converged))
}

/// L-BFGS-B on the unconstrained parameters. `maxiter` caps the number of
/// function evaluations.
fn run_lbfgsb(
    objective: &BsmObjective,
    init_params: Vec<f64>,
    maxiter: u64,
) -> std::result::Result<RunOutput, String> {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    let n = init_params.len();
    let obj = objective.clone();
    let eval_count = Arc::new(AtomicU64::new(0));
    let eval_count_inner = eval_count.clone();
    let hit_limit = Arc::new(AtomicBool::new(false));
    let hit_limit_inner = hit_limit.clone();

    let evaluate = move |x: &[f64], g: &mut [f64]| -> anyhow::Result<f64> {
        // Past the budget: zero gradient makes the solver stop.
        if eval_count_inner.load(Ordering::Relaxed) >= maxiter {
            hit_limit_inner.store(true, Ordering::Relaxed);
            g.iter_mut().for_each(|gi| *gi = 0.0);
            return Ok(obj.penalized_cost(x));
        }
        eval_count_inner.fetch_add(1, Ordering::Relaxed);

        let cost = obj.penalized_cost(x);
        if cost >= PENALTY {
            g.iter_mut().for_each(|gi| *gi = 0.0);
            return Ok(PENALTY);
        }
        g[..n].copy_from_slice(&obj.numerical_gradient(x));
        Ok(cost)
    };

    let param = lbfgsb::LbfgsbParameter {
        m: 10,
        factr: 1e5,
        pgtol: 1e-7,
        iprint: -1,
    };

    let mut problem = lbfgsb::LbfgsbProblem::build(init_params, evaluate);
    let (lo, hi) = LOG_RATIO_BOUNDS;
    problem.set_bounds(vec![(Some(lo), Some(hi)); n]);

    let mut state = lbfgsb::LbfgsbState::new(problem, param);
    state
        .minimize()
        .map_err(|e| format!("L-BFGS-B failed: {}", e))?;

    let x = state.x().to_vec();
    let cost = state.fx();
    let n_eval = eval_count.load(Ordering::Relaxed);
    let converged = !hit_limit.load(Ordering::Relaxed);

    Ok((x, cost, n_eval, converged))
}

fn consume_budget(remaining: &mut u64, total_work: &mut u64, n: u64) {
    let used = n.min(*remaining);
    *total_work = total_work.saturating_add(used);
    *remaining = remaining.saturating_sub(used);
}

/// One optimizer run with the configured method; L-BFGS(-B) falls back to
/// Nelder-Mead when the solver itself fails.
fn run_method(
    objective: &BsmObjective,
    method: FitMethod,
    start: Vec<f64>,
    maxiter: u64,
) -> Result<(RunOutput, String)> {
    let primary = match method {
        FitMethod::Lbfgsb => run_lbfgsb(objective, start.clone(), maxiter),
        FitMethod::Lbfgs => run_lbfgs(objective.clone(), start.clone(), maxiter),
        FitMethod::NelderMead => {
            return run_nelder_mead(objective.clone(), start, maxiter)
                .map(|out| (out, method.name().to_string()))
                .map_err(SsfError::OptimizationFailed);
        }
    };
    match primary {
        Ok(out) if out.1 < PENALTY => return Ok((out, method.name().to_string())),
        Ok(_) => warn!(
            "{} ended on a failed point; falling back to Nelder-Mead",
            method.name()
        ),
        Err(e) => warn!("{}; falling back to Nelder-Mead", e),
    }
    run_nelder_mead(objective.clone(), start, maxiter)
        .map(|out| (out, "nelder-mead (fallback)".to_string()))
        .map_err(SsfError::OptimizationFailed)
}

/// Damped Newton steps on the numerical Hessian. Returns the refined point
/// and the number of accepted steps.
fn refine(objective: &BsmObjective, start: Vec<f64>) -> (Vec<f64>, u64) {
    let n = start.len();
    let mut x = start;
    let mut f = objective.penalized_cost(&x);
    let mut g = objective.numerical_gradient(&x);
    let mut steps = 0u64;

    for _ in 0..REFINE_MAX_STEPS {
        let gnorm = norm(&g);
        if f >= PENALTY || gnorm < REFINE_TOL {
            break;
        }
        let hess = objective.numerical_hessian(&x);
        let grad = DVector::from_column_slice(&g);
        let scale = hess.diagonal().amax().max(1.0);

        let mut accepted = false;
        for damping in [0.0, 1e-8, 1e-6, 1e-4, 1e-2, 1.0] {
            let shifted = &hess + DMatrix::identity(n, n) * (damping * scale);
            let Some(chol) = shifted.cholesky() else {
                continue;
            };
            let d = chol.solve(&(-&grad));
            let (lo, hi) = LOG_RATIO_BOUNDS;
            let candidate: Vec<f64> = x
                .iter()
                .zip(d.iter())
                .map(|(a, b)| (a + b).clamp(lo, hi))
                .collect();
            let fc = objective.penalized_cost(&candidate);
            if fc >= PENALTY {
                continue;
            }
            let gc = objective.numerical_gradient(&candidate);
            let flat = fc <= f + 1e-10 * f.abs().max(1.0);
            if fc < f || (flat && norm(&gc) < gnorm) {
                x = candidate;
                f = fc;
                g = gc;
                accepted = true;
                break;
            }
        }
        if !accepted {
            break;
        }
        steps += 1;
    }
    (x, steps)
}

/// Fit a BSM by concentrated maximum likelihood, starting from ratios of 0.1.
pub fn fit_bsm(data: &[Option<f64>], spec: &BsmSpec, config: &FitConfig) -> Result<FitResult> {
    fit_bsm_with_start(data, spec, None, config)
}

/// Fit a BSM by concentrated maximum likelihood.
///
/// `start_ratios` are the variance ratios of `spec.free_components()`
/// relative to the scale component.
pub fn fit_bsm_with_start(
    data: &[Option<f64>],
    spec: &BsmSpec,
    start_ratios: Option<&[f64]>,
    config: &FitConfig,
) -> Result<FitResult> {
    spec.validate()?;
    let n_params = spec.n_params();
    let n_obs = data.iter().filter(|y| y.is_some()).count();
    let min_obs = spec.diffuse_dim() + n_params;
    if n_obs <= min_obs {
        return Err(SsfError::DataError(format!(
            "Not enough observations: n={} <= minimum required {} for the model",
            n_obs, min_obs
        )));
    }

    let start = match start_ratios {
        Some(r) => untransform_params(r, n_params)?,
        None => untransform_params(&default_start_ratios(n_params), n_params)?,
    };
    let objective = BsmObjective::new(data, spec, &config.filter);

    // Degenerate data fails at every point; report it rather than optimize.
    objective.likelihood(&start)?;

    let (best, n_iter, converged, method) = if config.maxiter == 0 || n_params == 0 {
        (start, 0, n_params == 0, config.method.name().to_string())
    } else {
        let mut remaining = config.maxiter;
        let mut total_work = 0u64;
        let ((mut best, mut best_cost, n, mut converged), method) =
            run_method(&objective, config.method, start, remaining)?;
        consume_budget(&mut remaining, &mut total_work, n);

        let mut restarts = 0;
        while !converged && remaining > 0 && restarts < MAX_RESTARTS {
            restarts += 1;
            debug!(
                "restart {} of {} from cost {:.6} ({} iterations left)",
                restarts,
                config.method.name(),
                best_cost,
                remaining
            );
            let ((p, c, n, conv), _) =
                run_method(&objective, config.method, best.clone(), remaining)?;
            consume_budget(&mut remaining, &mut total_work, n);
            if c <= best_cost {
                best = p;
                best_cost = c;
            }
            converged = conv;
        }

        let (refined, steps) = refine(&objective, best);
        let gnorm = norm(&objective.numerical_gradient(&refined));
        debug!(
            "refinement: {} Newton step(s), gradient norm {:.3e}",
            steps, gnorm
        );
        (
            refined,
            total_work + steps,
            converged || gnorm < 1e-6,
            method,
        )
    };

    let ll = objective.likelihood(&best)?;
    let gradient_norm = if n_params == 0 {
        0.0
    } else {
        norm(&objective.numerical_gradient(&best))
    };
    let ratios = transform_params(&best);
    let variances = spec.variances_from_ratios(&ratios, ll.scale)?.to_vec(spec);

    Ok(FitResult {
        params: ratios,
        variances,
        loglike: ll.loglike,
        scale: ll.scale,
        n_obs,
        n_params,
        n_iter,
        converged,
        method,
        gradient_norm,
        aic: 0.0,
        bic: 0.0,
    }
    .with_information_criteria())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulate::simulate;
    use crate::types::observations;

    fn local_level_data(seed: u64) -> Vec<Option<f64>> {
        let spec = BsmSpec::local_level();
        let model = spec.build_from_ratios(&[0.5]).unwrap();
        observations(&simulate(model.ssf(), 150, seed).unwrap().observations)
    }

    #[test]
    fn test_objective_finite() {
        let data = local_level_data(3);
        let obj = BsmObjective::new(&data, &BsmSpec::local_level(), &FilterConfig::default());
        let c = obj.penalized_cost(&[0.7]);
        assert!(c.is_finite() && c < PENALTY);
        let g = obj.numerical_gradient(&[0.7]);
        assert!(g[0].is_finite());
    }

    #[test]
    fn test_fit_local_level() {
        let data = local_level_data(11);
        let result = fit_bsm(&data, &BsmSpec::local_level(), &FitConfig::default()).unwrap();
        assert_eq!(result.n_params, 1);
        assert_eq!(result.variances.len(), 2);
        assert!(result.params[0] > 0.05 && result.params[0] < 5.0, "ratio {}", result.params[0]);
        assert!(result.gradient_norm < 1e-4, "gradient norm {}", result.gradient_norm);
        assert!(result.loglike.is_finite());
    }

    #[test]
    fn test_fit_methods_agree() {
        let data = local_level_data(5);
        let spec = BsmSpec::local_level();
        let lbfgsb = fit_bsm(&data, &spec, &FitConfig::default()).unwrap();
        for method in [FitMethod::Lbfgs, FitMethod::NelderMead] {
            let config = FitConfig {
                method,
                ..FitConfig::default()
            };
            let r = fit_bsm(&data, &spec, &config).unwrap();
            assert!(
                (r.loglike - lbfgsb.loglike).abs() < 1e-4,
                "{}: {} vs {}",
                method.name(),
                r.loglike,
                lbfgsb.loglike
            );
        }
    }

    #[test]
    fn test_zero_maxiter_not_converged() {
        let data = local_level_data(2);
        let config = FitConfig {
            maxiter: 0,
            ..FitConfig::default()
        };
        let r = fit_bsm(&data, &BsmSpec::local_level(), &config).unwrap();
        assert!(!r.converged);
        assert_eq!(r.n_iter, 0);
        assert!((r.params[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_aic_bic() {
        let data = local_level_data(8);
        let r = fit_bsm(&data, &BsmSpec::local_level(), &FitConfig::default()).unwrap();
        let k = 2.0;
        assert!((r.aic - (-2.0 * r.loglike + 2.0 * k)).abs() < 1e-9);
        assert!((r.bic - (-2.0 * r.loglike + k * (r.n_obs as f64).ln())).abs() < 1e-9);
    }

    #[test]
    fn test_constant_series_is_degenerate() {
        let data = observations(&[5.0; 40]);
        let err = fit_bsm(&data, &BsmSpec::local_level(), &FitConfig::default()).unwrap_err();
        assert!(matches!(err, SsfError::DegenerateLikelihood(_)), "{:?}", err);
    }

    #[test]
    fn test_too_few_observations() {
        let data = observations(&[1.0, 2.0, 3.0]);
        let err = fit_bsm(&data, &BsmSpec::basic(4), &FitConfig::default()).unwrap_err();
        assert!(matches!(err, SsfError::DataError(_)));
    }

    #[test]
    fn test_start_length_checked() {
        let data = local_level_data(1);
        let err = fit_bsm_with_start(&data, &BsmSpec::local_level(), Some(&[0.1, 0.2]), &FitConfig::default())
            .unwrap_err();
        assert!(matches!(err, SsfError::ParamLengthMismatch { expected: 1, got: 2 }));
    }
}
