//! Bounded minimization of negative log-likelihoods, and the covariance
//! matrix of the minimum

use crate::{
    config::FitSettings,
    error::{Error, Result},
    numeric::Float,
};
use argmin::{
    core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus},
    solver::{linesearch::MoreThuenteLineSearch, quasinewton::LBFGS},
};
use nalgebra::{linalg::Cholesky, DMatrix};
use prefix_num_ops::real::*;
use std::fmt;

/// Function to be minimized
pub trait ObjectiveFunction: Send + Sync {
    /// Evaluate the function at given parameters
    ///
    /// The function must remain well-defined slightly outside of the
    /// parameter bounds, which the finite difference steps may cross.
    fn eval(&self, params: &[Float]) -> Float;

    /// Gradient of the function (central differences if not overridden)
    fn gradient(&self, params: &[Float]) -> Vec<Float> {
        let mut shifted = params.to_vec();
        (0..params.len())
            .map(|i| {
                let eps = 1e-7 * abs(params[i]).max(1.);
                shifted[i] = params[i] + eps;
                let f_plus = self.eval(&shifted);
                shifted[i] = params[i] - eps;
                let f_minus = self.eval(&shifted);
                shifted[i] = params[i];
                (f_plus - f_minus) / (2. * eps)
            })
            .collect()
    }
}

/// Allowed range of one fit parameter
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    /// Lower limit
    pub low: Float,
    /// Upper limit
    pub high: Float,
}
//
impl Bounds {
    /// Build a parameter range
    pub const fn new(low: Float, high: Float) -> Self {
        Self { low, high }
    }

    /// Width of the range
    pub fn width(&self) -> Float {
        self.high - self.low
    }

    /// Bring a value within the range
    pub fn clamp(&self, value: Float) -> Float {
        value.clamp(self.low, self.high)
    }

    /// Truth that a value sits on one of the limits
    pub fn at_limit(&self, value: Float) -> bool {
        let tolerance = 1e-9 * self.width();
        value <= self.low + tolerance || value >= self.high - tolerance
    }
}

fn clamp_params(params: &[Float], bounds: &[Bounds]) -> Vec<Float> {
    params
        .iter()
        .zip(bounds)
        .map(|(&value, bounds)| bounds.clamp(value))
        .collect()
}

/// Result of one minimization
#[derive(Clone, Debug)]
pub struct Minimum {
    /// Best-fit parameters
    pub params: Vec<Float>,

    /// Function value at the minimum
    pub value: Float,

    /// Number of iterations
    pub iterations: u64,

    /// Truth that the convergence criterion was met
    pub converged: bool,

    /// Why the minimizer stopped
    pub termination: String,
}
//
impl fmt::Display for Minimum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "minimum {:.6} after {} iterations ({})",
            self.value, self.iterations, self.termination
        )
    }
}

/// Adapter which makes an objective function look like an argmin problem
struct BoundedProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [Bounds],
}
//
impl CostFunction for BoundedProblem<'_> {
    type Param = Vec<Float>;
    type Output = Float;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Float, argmin::core::Error> {
        Ok(self.objective.eval(&clamp_params(params, self.bounds)))
    }
}
//
impl Gradient for BoundedProblem<'_> {
    type Param = Vec<Float>;
    type Gradient = Vec<Float>;

    fn gradient(&self, params: &Self::Param) -> std::result::Result<Vec<Float>, argmin::core::Error> {
        let clamped = clamp_params(params, self.bounds);
        let mut gradient = self.objective.gradient(&clamped);

        // Components which push against a limit are projected out, so that the
        // line search does not keep stepping into the clamped region
        for ((g, &x), bounds) in gradient.iter_mut().zip(&clamped).zip(self.bounds) {
            let tolerance = 1e-12 * bounds.width();
            if (x <= bounds.low + tolerance && *g > 0.) || (x >= bounds.high - tolerance && *g < 0.) {
                *g = 0.;
            }
        }
        Ok(gradient)
    }
}

/// L-BFGS minimizer with box constraints enforced by clamping
pub struct Minimizer<'cfg> {
    settings: &'cfg FitSettings,
}
//
impl<'cfg> Minimizer<'cfg> {
    /// Set up a minimizer
    pub fn new(settings: &'cfg FitSettings) -> Self {
        Self { settings }
    }

    /// Minimize an objective function from a starting point
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        start: &[Float],
        bounds: &[Bounds],
    ) -> Result<Minimum> {
        assert_eq!(start.len(), bounds.len(), "Each parameter needs bounds");
        let failure = |reason: String| Error::FitConvergence {
            attempts: 1,
            reason,
        };

        let problem = BoundedProblem { objective, bounds };
        let tolerance = self.settings.gradient_tolerance;
        let solver = LBFGS::new(MoreThuenteLineSearch::new(), self.settings.lbfgs_memory)
            .with_tolerance_grad(tolerance)
            .and_then(|solver| solver.with_tolerance_cost((0.1 * tolerance).max(1e-12)))
            .map_err(|e| failure(format!("invalid minimizer settings: {e}")))?;
        let result = Executor::new(problem, solver)
            .configure(|state| {
                state
                    .param(clamp_params(start, bounds))
                    .max_iters(self.settings.max_iter)
            })
            .run()
            .map_err(|e| failure(format!("minimizer error: {e}")))?;

        let state = result.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| failure("no best parameters".to_owned()))?;
        let termination = state.get_termination_status();
        let converged = matches!(
            termination,
            TerminationStatus::Terminated(
                TerminationReason::SolverConverged | TerminationReason::TargetCostReached
            )
        );
        Ok(Minimum {
            params: clamp_params(best, bounds),
            value: state.get_best_cost(),
            iterations: state.get_iter(),
            converged,
            termination: termination.to_string(),
        })
    }
}

/// Covariance matrix of the parameters at a minimum
///
/// The Hessian is estimated by finite differences over the parameters which
/// do not sit on one of their limits, then inverted through a Cholesky
/// decomposition. Parameters on a limit, and parameters with no influence on
/// the objective, get zero (co)variance. Returns `None` if the Hessian is not
/// positive definite.
///
pub fn covariance(
    objective: &dyn ObjectiveFunction,
    params: &[Float],
    bounds: &[Bounds],
) -> Option<DMatrix<Float>> {
    let free = (0..params.len())
        .filter(|&i| !bounds[i].at_limit(params[i]))
        .collect::<Vec<_>>();
    let num_free = free.len();
    let mut covariance = DMatrix::zeros(params.len(), params.len());
    if num_free == 0 {
        return Some(covariance);
    }

    // Second differences of the objective
    let steps = free
        .iter()
        .map(|&i| 1e-4 * abs(params[i]).max(1e-2 * bounds[i].width()))
        .collect::<Vec<_>>();
    let mut shifted = params.to_vec();
    let mut eval_shifted = |shifts: &[(usize, Float)]| {
        for &(i, delta) in shifts {
            shifted[i] = params[i] + delta;
        }
        let value = objective.eval(&shifted);
        for &(i, _) in shifts {
            shifted[i] = params[i];
        }
        value
    };
    let center = objective.eval(params);
    let mut hessian = DMatrix::zeros(num_free, num_free);
    for a in 0..num_free {
        let (i, h_i) = (free[a], steps[a]);
        let plus = eval_shifted(&[(i, h_i)]);
        let minus = eval_shifted(&[(i, -h_i)]);
        hessian[(a, a)] = (plus - 2. * center + minus) / (h_i * h_i);
        for b in 0..a {
            let (j, h_j) = (free[b], steps[b]);
            let mixed = eval_shifted(&[(i, h_i), (j, h_j)]) - eval_shifted(&[(i, h_i), (j, -h_j)])
                - eval_shifted(&[(i, -h_i), (j, h_j)])
                + eval_shifted(&[(i, -h_i), (j, -h_j)]);
            hessian[(a, b)] = mixed / (4. * h_i * h_j);
            hessian[(b, a)] = hessian[(a, b)];
        }
    }
    if hessian.iter().any(|x| !x.is_finite()) {
        return None;
    }

    // Parameters that the objective does not depend on at this point (e.g.
    // the slope of a vanishing background) are left out too
    let max_curvature = (0..num_free)
        .map(|a| abs(hessian[(a, a)]))
        .fold(0., Float::max);
    let kept = (0..num_free)
        .filter(|&a| abs(hessian[(a, a)]) > 1e-12 * max_curvature)
        .collect::<Vec<_>>();
    let reduced = DMatrix::from_fn(kept.len(), kept.len(), |a, b| hessian[(kept[a], kept[b])]);

    let inverse = Cholesky::new(reduced)?.inverse();
    for (a, &row) in kept.iter().enumerate() {
        for (b, &column) in kept.iter().enumerate() {
            covariance[(free[row], free[column])] = inverse[(a, b)];
        }
    }
    Some(covariance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x, y) = (x - 2)² + 4 (y - 3)² + (x - 2)(y - 3)
    struct Quadratic;

    impl ObjectiveFunction for Quadratic {
        fn eval(&self, params: &[Float]) -> Float {
            let (dx, dy) = (params[0] - 2., params[1] - 3.);
            dx * dx + 4. * dy * dy + dx * dy
        }
    }

    fn settings() -> FitSettings {
        FitSettings {
            max_iter: 200,
            gradient_tolerance: 1e-8,
            ..FitSettings::default()
        }
    }

    #[test]
    fn finds_unconstrained_minimum() {
        let settings = settings();
        let bounds = [Bounds::new(-10., 10.); 2];
        let minimum = Minimizer::new(&settings)
            .minimize(&Quadratic, &[0., 0.], &bounds)
            .unwrap();
        assert!(minimum.converged, "{minimum}");
        assert_relative_eq!(minimum.params[0], 2., epsilon = 1e-4);
        assert_relative_eq!(minimum.params[1], 3., epsilon = 1e-4);
    }

    #[test]
    fn respects_bounds() {
        let settings = settings();
        let bounds = [Bounds::new(3., 5.), Bounds::new(-10., 10.)];
        let minimum = Minimizer::new(&settings)
            .minimize(&Quadratic, &[4., 0.], &bounds)
            .unwrap();
        assert_relative_eq!(minimum.params[0], 3., epsilon = 1e-6);
        // With x pinned to 3, the best y solves 8 (y - 3) + 1 = 0
        assert_relative_eq!(minimum.params[1], 3. - 1. / 8., epsilon = 1e-3);
        assert!(bounds[0].at_limit(minimum.params[0]));
    }

    #[test]
    fn covariance_inverts_the_hessian() {
        // Hessian is [[2, 1], [1, 8]], its inverse is [[8, -1], [-1, 2]] / 15
        let bounds = [Bounds::new(-10., 10.); 2];
        let covariance = covariance(&Quadratic, &[2., 3.], &bounds).unwrap();
        assert_relative_eq!(covariance[(0, 0)], 8. / 15., epsilon = 1e-4);
        assert_relative_eq!(covariance[(0, 1)], -1. / 15., epsilon = 1e-4);
        assert_relative_eq!(covariance[(1, 1)], 2. / 15., epsilon = 1e-4);
    }

    #[test]
    fn parameters_at_limits_are_left_out_of_the_covariance() {
        let bounds = [Bounds::new(2., 10.), Bounds::new(-10., 10.)];
        let covariance = covariance(&Quadratic, &[2., 3.], &bounds).unwrap();
        assert_eq!(covariance[(0, 0)], 0.);
        assert_eq!(covariance[(0, 1)], 0.);
        assert_relative_eq!(covariance[(1, 1)], 1. / 8., epsilon = 1e-4);
    }

    #[test]
    fn flat_directions_are_left_out_of_the_covariance() {
        struct IgnoresSecond;
        impl ObjectiveFunction for IgnoresSecond {
            fn eval(&self, params: &[Float]) -> Float {
                4. * (params[0] - 1.) * (params[0] - 1.)
            }
        }
        let bounds = [Bounds::new(-10., 10.); 2];
        let covariance = covariance(&IgnoresSecond, &[1., 0.3], &bounds).unwrap();
        assert_relative_eq!(covariance[(0, 0)], 1. / 8., epsilon = 1e-4);
        assert_eq!(covariance[(1, 1)], 0.);
    }

    #[test]
    fn saddle_points_have_no_covariance() {
        struct Saddle;
        impl ObjectiveFunction for Saddle {
            fn eval(&self, params: &[Float]) -> Float {
                params[0] * params[0] - params[1] * params[1]
            }
        }
        let bounds = [Bounds::new(-1., 1.); 2];
        assert!(covariance(&Saddle, &[0., 0.], &bounds).is_none());
    }
}
