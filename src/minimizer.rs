use argmin::core::{
    CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use derive_builder::Builder;
use log::{debug, trace};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fit status: minimum found and covariance matrix accurate
pub const STATUS_OK: i32 = 0;
/// The minimizer did not converge
pub const STATUS_NOT_CONVERGED: i32 = 1;
/// The Hessian is not positive definite
pub const STATUS_NOT_POS_DEF: i32 = 2;
/// The Hessian could not be inverted
pub const STATUS_SINGULAR: i32 = 3;

const GRADIENT_STEP: f64 = 1e-6;
const HESSIAN_STEP: f64 = 1e-4;
/// Distance from the bounds for starting values
const START_MARGIN: f64 = 1e-6;
/// Largest estimated distance to the minimum for a converged fit
const EDM_TOLERANCE: f64 = 1e-4;
const MAX_RESTARTS: usize = 3;

/// A function to be minimised
pub trait Objective: Sync {
    fn value(&self, params: &[f64]) -> f64;
}

impl<F: Fn(&[f64]) -> f64 + Sync> Objective for F {
    fn value(&self, params: &[f64]) -> f64 {
        self(params)
    }
}

/// Settings for the minimizer
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MinimizerOptions {
    /// Maximum number of L-BFGS iterations
    #[builder(default = "1000")]
    pub max_iters: u64,
    /// Convergence tolerance on the gradient norm
    #[builder(default = "1e-6")]
    pub tolerance: f64,
    /// Number of past updates kept for the inverse Hessian approximation
    #[builder(default = "10")]
    pub history: usize,
}

impl Default for MinimizerOptions {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            tolerance: 1e-6,
            history: 10,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MinimizerError {
    #[error("Got {0} starting values but {1} bounds")]
    Length(usize, usize),
    #[error("Invalid bounds [{0}, {1}] for parameter {2}")]
    Bounds(String, String, usize),
    #[error("Invalid minimizer settings: {0}")]
    Settings(String),
    #[error("Minimization failed: {0}")]
    Failed(String),
}

/// Result of a minimization
#[derive(Clone, Debug)]
pub struct Minimum {
    pub params: Vec<f64>,
    pub value: f64,
    pub iterations: u64,
    pub converged: bool,
    pub message: String,
    /// Hessian of the objective at the minimum
    pub hessian: DMatrix<f64>,
    /// Inverse of the Hessian, if it exists
    pub covariance: Option<DMatrix<f64>>,
    pub status: i32,
}

impl Minimum {
    /// Square root of the covariance diagonal
    ///
    /// Falls back to `1/√|H_ii|` if the Hessian cannot be inverted.
    pub fn errors(&self) -> Vec<f64> {
        let n = self.params.len();
        match &self.covariance {
            Some(cov) => (0..n).map(|i| cov[(i, i)].max(0.).sqrt()).collect(),
            None => (0..n)
                .map(|i| 1. / self.hessian[(i, i)].abs().max(1e-300).sqrt())
                .collect(),
        }
    }
}

/// Linear map from the parameter bounds to the unit interval
#[derive(Clone, Debug)]
struct Scaling<'a> {
    bounds: &'a [(f64, f64)],
}

impl<'a> Scaling<'a> {
    fn to_internal(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(self.bounds)
            .map(|(x, (lo, hi))| ((x - lo) / (hi - lo)).clamp(0., 1.))
            .collect()
    }

    fn to_external(&self, u: &[f64]) -> Vec<f64> {
        u.iter()
            .zip(self.bounds)
            .map(|(u, (lo, hi))| lo + u * (hi - lo))
            .collect()
    }

    fn width(&self, i: usize) -> f64 {
        self.bounds[i].1 - self.bounds[i].0
    }
}

/// Smooth map from an unbounded internal coordinate to the unit interval
///
/// `u = (sin θ + 1) / 2`, so the minimizer never leaves the box.
fn unit_from_angle(theta: &[f64]) -> Vec<f64> {
    theta.iter().map(|t| 0.5 * (t.sin() + 1.)).collect()
}

fn angle_from_unit(u: &[f64]) -> Vec<f64> {
    u.iter()
        .map(|u| {
            let u = u.clamp(START_MARGIN, 1. - START_MARGIN);
            (2. * u - 1.).asin()
        })
        .collect()
}

/// The objective in internal coordinates
#[derive(Clone)]
struct Problem<'a> {
    objective: &'a dyn Objective,
    scaling: Scaling<'a>,
}

impl<'a> Problem<'a> {
    fn value(&self, u: &[f64]) -> f64 {
        self.objective.value(&self.scaling.to_external(u))
    }

    fn numeric_gradient(&self, u: &[f64]) -> Vec<f64> {
        let mut grad = vec![0.; u.len()];
        let mut shifted = u.to_vec();
        for i in 0..u.len() {
            shifted[i] = u[i] + GRADIENT_STEP;
            let f_plus = self.value(&shifted);
            shifted[i] = u[i] - GRADIENT_STEP;
            let f_minus = self.value(&shifted);
            shifted[i] = u[i];
            grad[i] = (f_plus - f_minus) / (2. * GRADIENT_STEP);
        }
        grad
    }

    /// Hessian from differences of the gradient
    ///
    /// Steps are taken towards the interior of the unit interval.
    fn hessian(&self, u: &[f64]) -> DMatrix<f64> {
        let n = u.len();
        let grad = self.numeric_gradient(u);
        let mut hessian = DMatrix::zeros(n, n);
        let mut shifted = u.to_vec();
        for j in 0..n {
            let step = if u[j] + HESSIAN_STEP <= 1. {
                HESSIAN_STEP
            } else {
                -HESSIAN_STEP
            };
            shifted[j] = u[j] + step;
            let grad_shifted = self.numeric_gradient(&shifted);
            shifted[j] = u[j];
            for i in 0..n {
                hessian[(i, j)] = (grad_shifted[i] - grad[i]) / step;
            }
        }
        let transposed = hessian.transpose();
        (hessian + transposed) * 0.5
    }
}

/// The objective as a function of the unbounded angles
#[derive(Clone)]
struct AngleProblem<'a> {
    problem: Problem<'a>,
}

impl<'a> AngleProblem<'a> {
    fn value(&self, theta: &[f64]) -> f64 {
        self.problem.value(&unit_from_angle(theta))
    }

    fn numeric_gradient(&self, theta: &[f64]) -> Vec<f64> {
        let mut grad = vec![0.; theta.len()];
        let mut shifted = theta.to_vec();
        for i in 0..theta.len() {
            shifted[i] = theta[i] + GRADIENT_STEP;
            let f_plus = self.value(&shifted);
            shifted[i] = theta[i] - GRADIENT_STEP;
            let f_minus = self.value(&shifted);
            shifted[i] = theta[i];
            grad[i] = (f_plus - f_minus) / (2. * GRADIENT_STEP);
        }
        grad
    }

    /// Estimated distance to the minimum, `g^T H^-1 g / 2`
    ///
    /// Falls back to `g^T g / 2` if the Hessian in the angles is not
    /// positive definite.
    fn edm(&self, theta: &[f64]) -> f64 {
        let n = theta.len();
        let grad = DVector::from_vec(self.numeric_gradient(theta));
        let mut hessian = DMatrix::zeros(n, n);
        let mut shifted = theta.to_vec();
        for j in 0..n {
            shifted[j] = theta[j] + HESSIAN_STEP;
            let grad_shifted = self.numeric_gradient(&shifted);
            shifted[j] = theta[j];
            for i in 0..n {
                hessian[(i, j)] = (grad_shifted[i] - grad[i]) / HESSIAN_STEP;
            }
        }
        let hessian = (&hessian + hessian.transpose()) * 0.5;
        match hessian.cholesky() {
            Some(chol) => 0.5 * grad.dot(&chol.solve(&grad)),
            None => 0.5 * grad.norm_squared(),
        }
    }
}

impl<'a> CostFunction for AngleProblem<'a> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, theta: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.value(theta))
    }
}

impl<'a> Gradient for AngleProblem<'a> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, theta: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        Ok(self.numeric_gradient(theta))
    }
}

/// Bounded L-BFGS minimizer followed by a Hessian evaluation
#[derive(Clone, Debug, Default)]
pub struct Minimizer {
    options: MinimizerOptions,
}

impl Minimizer {
    pub fn new(options: MinimizerOptions) -> Self {
        Self { options }
    }

    /// Minimise `objective` starting from `init` within `bounds`
    pub fn minimize(
        &self,
        objective: &dyn Objective,
        init: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<Minimum, MinimizerError> {
        if init.len() != bounds.len() {
            return Err(MinimizerError::Length(init.len(), bounds.len()));
        }
        for (n, (lo, hi)) in bounds.iter().enumerate() {
            if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                return Err(MinimizerError::Bounds(lo.to_string(), hi.to_string(), n));
            }
        }
        let scaling = Scaling { bounds };
        let start = scaling.to_internal(init);

        let (best, iterations, converged, message) = if start.is_empty() {
            (start, 0, true, "No free parameters".to_owned())
        } else {
            let problem = AngleProblem {
                problem: Problem { objective, scaling: scaling.clone() },
            };
            self.run_lbfgs(&problem, angle_from_unit(&start))?
        };
        let problem = Problem { objective, scaling: scaling.clone() };
        let value = problem.value(&best);
        let params = scaling.to_external(&best);
        debug!("Minimum {value} after {iterations} iterations: {message}");
        trace!("Parameters at minimum: {params:?}");

        let hessian = self.hessian(objective, &params, bounds);
        let (covariance, hessian_status) = invert_hessian(&hessian);
        let status = if !converged {
            STATUS_NOT_CONVERGED
        } else {
            hessian_status
        };
        Ok(Minimum {
            params,
            value,
            iterations,
            converged,
            message,
            hessian,
            covariance,
            status,
        })
    }

    /// L-BFGS in the angles, restarted until the estimated distance to
    /// the minimum is small
    fn run_lbfgs(
        &self,
        problem: &AngleProblem<'_>,
        start: Vec<f64>,
    ) -> Result<(Vec<f64>, u64, bool, String), MinimizerError> {
        let mut theta = start;
        let mut iterations = 0;
        let mut message = String::new();
        for restart in 0..=MAX_RESTARTS {
            let max_iters = self.options.max_iters.saturating_sub(iterations);
            if max_iters == 0 {
                break;
            }
            let (best, iters, solver_converged, termination) =
                match self.lbfgs_once(problem, theta.clone(), max_iters) {
                    Ok(res) => res,
                    // keep the last good point if a restart fails
                    Err(err) if restart > 0 => {
                        debug!("L-BFGS restart failed: {err}");
                        break;
                    }
                    Err(err) => return Err(err),
                };
            iterations += iters;
            message = termination;
            if problem.value(&best) <= problem.value(&theta) {
                theta = best;
            }
            let edm = problem.edm(&theta);
            trace!("EDM after L-BFGS run {restart}: {edm}");
            if solver_converged && edm <= EDM_TOLERANCE {
                return Ok((unit_from_angle(&theta), iterations, true, message));
            }
        }
        Ok((unit_from_angle(&theta), iterations, false, message))
    }

    fn lbfgs_once(
        &self,
        problem: &AngleProblem<'_>,
        start: Vec<f64>,
        max_iters: u64,
    ) -> Result<(Vec<f64>, u64, bool, String), MinimizerError> {
        let linesearch = MoreThuenteLineSearch::new();
        let tol_cost = if self.options.tolerance == 0. {
            0.
        } else {
            (0.1 * self.options.tolerance).max(1e-12)
        };
        let solver = LBFGS::new(linesearch, self.options.history)
            .with_tolerance_grad(self.options.tolerance)
            .map_err(|err| MinimizerError::Settings(err.to_string()))?
            .with_tolerance_cost(tol_cost)
            .map_err(|err| MinimizerError::Settings(err.to_string()))?;
        let res = Executor::new(problem.clone(), solver)
            .configure(|state| state.param(start).max_iters(max_iters))
            .run()
            .map_err(|err| MinimizerError::Failed(err.to_string()))?;

        let state = res.state();
        let best = state
            .get_best_param()
            .cloned()
            .ok_or_else(|| MinimizerError::Failed("No best parameters found".to_owned()))?;
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(TerminationReason::SolverConverged)
                | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
        );
        Ok((best, state.get_iter(), converged, termination.to_string()))
    }

    /// Hessian of `objective` at `params`, with the same step strategy as for the minimum
    pub fn hessian(
        &self,
        objective: &dyn Objective,
        params: &[f64],
        bounds: &[(f64, f64)],
    ) -> DMatrix<f64> {
        let scaling = Scaling { bounds };
        let n = params.len();
        let problem = Problem { objective, scaling: scaling.clone() };
        let internal = problem.hessian(&scaling.to_internal(params));
        let jacobian = DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                1. / scaling.width(i)
            } else {
                0.
            }
        });
        &jacobian * internal * &jacobian
    }
}

/// Invert a Hessian, reporting whether it is positive definite
pub fn invert_hessian(hessian: &DMatrix<f64>) -> (Option<DMatrix<f64>>, i32) {
    let n = hessian.nrows();
    if n == 0 {
        return (Some(DMatrix::zeros(0, 0)), STATUS_OK);
    }
    if let Some(chol) = hessian.clone().cholesky() {
        return (Some(chol.inverse()), STATUS_OK);
    }
    debug!("Hessian is not positive definite");
    match hessian.clone().try_inverse() {
        Some(inv) => (Some(inv), STATUS_NOT_POS_DEF),
        None => (None, STATUS_SINGULAR),
    }
}

/// Correlation matrix for a covariance matrix
pub fn correlation(cov: &DMatrix<f64>) -> DMatrix<f64> {
    let n = cov.nrows();
    DMatrix::from_fn(n, n, |i, j| {
        let norm = (cov[(i, i)] * cov[(j, j)]).sqrt();
        if norm > 0. {
            cov[(i, j)] / norm
        } else if i == j {
            1.
        } else {
            0.
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn quadratic() {
        let f = |x: &[f64]| {
            (x[0] - 2.).powi(2) / (2. * 0.5_f64.powi(2))
                + (x[1] - 300.).powi(2) / (2. * 20_f64.powi(2))
        };
        let minimizer = Minimizer::new(
            MinimizerOptionsBuilder::default()
                .max_iters(200)
                .build()
                .unwrap(),
        );
        let min = minimizer
            .minimize(&f, &[0., 100.], &[(-10., 10.), (0., 1000.)])
            .unwrap();
        assert!(min.converged);
        assert_eq!(min.status, STATUS_OK);
        assert_relative_eq!(min.params[0], 2., epsilon = 1e-3);
        assert_relative_eq!(min.params[1], 300., epsilon = 1e-1);
        let errors = min.errors();
        assert_relative_eq!(errors[0], 0.5, max_relative = 1e-2);
        assert_relative_eq!(errors[1], 20., max_relative = 1e-2);
    }

    #[test]
    fn at_bound() {
        let f = |x: &[f64]| (x[0] + 1.).powi(2);
        let min = Minimizer::default()
            .minimize(&f, &[0.5], &[(0., 1.)])
            .unwrap();
        assert_relative_eq!(min.params[0], 0., epsilon = 1e-4);
    }

    #[test]
    fn far_from_start() {
        let data = [100., 400.];
        let f = |x: &[f64]| {
            x.iter()
                .zip(data)
                .map(|(nu, n)| nu - n * nu.ln())
                .sum::<f64>()
        };
        let min = Minimizer::default()
            .minimize(&f, &[900., 10.], &[(0., 1000.), (0., 1000.)])
            .unwrap();
        assert!(min.converged);
        assert_eq!(min.status, STATUS_OK);
        assert_relative_eq!(min.params[0], 100., max_relative = 1e-3);
        assert_relative_eq!(min.params[1], 400., max_relative = 1e-3);
        let errors = min.errors();
        assert_relative_eq!(errors[0], 10., max_relative = 1e-2);
        assert_relative_eq!(errors[1], 20., max_relative = 1e-2);
    }

    #[test]
    fn invalid() {
        let f = |x: &[f64]| x[0];
        let minimizer = Minimizer::default();
        assert!(minimizer.minimize(&f, &[0.], &[]).is_err());
        assert!(minimizer.minimize(&f, &[0.], &[(1., 0.)]).is_err());
        assert!(minimizer
            .minimize(&f, &[0.], &[(0., f64::INFINITY)])
            .is_err());
    }

    #[test]
    fn correlations() {
        let cov = DMatrix::from_row_slice(2, 2, &[4., 1., 1., 1.]);
        let corr = correlation(&cov);
        assert_relative_eq!(corr[(0, 0)], 1.);
        assert_relative_eq!(corr[(0, 1)], 0.5);
        let (inv, status) = invert_hessian(&DMatrix::from_row_slice(2, 2, &[1., 0., 0., -1.]));
        assert!(inv.is_some());
        assert_eq!(status, STATUS_NOT_POS_DEF);
    }
}
