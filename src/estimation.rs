//! Joint GMM estimation: the objective that nests the contraction mapping
//! and cost recovery, and the two-step estimator that drives an external
//! minimizer over it.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::data::ProductData;
use crate::demand::{logit_delta, solve_delta};
use crate::error::{BlpError, Result};
use crate::integration::AgentDraws;
use crate::parameters::{NonlinearParameters, PriceHeterogeneity};
use crate::solving::{ContractionOptions, ContractionSummary, SupplyOptions};
use crate::supply::recover_marginal_costs;

/// The estimation-run context: observed product data tied to the fixed
/// simulated agent population that every objective evaluation reuses.
#[derive(Clone, Debug)]
pub struct JointProblem {
    data: ProductData,
    draws: AgentDraws,
}

impl JointProblem {
    /// Constructs a new joint demand and supply estimation problem.
    ///
    /// Validates that the taste draws span `[price, characteristics]` and
    /// that every market label in the data has an agent population.
    pub fn new(data: ProductData, draws: AgentDraws) -> Result<Self> {
        let dim = data.characteristic_count() + 1;
        if draws.taste_dim() != dim {
            return Err(BlpError::dimension_mismatch(
                "taste draw dimension",
                dim,
                draws.taste_dim(),
            ));
        }
        for segment in data.partition().markets() {
            let market_id = segment.id();
            if market_id == 0 || market_id as usize > draws.market_count() {
                return Err(BlpError::MissingMarketDraws { market_id });
            }
        }
        Ok(Self { data, draws })
    }

    /// Accessor for product data.
    pub fn data(&self) -> &ProductData {
        &self.data
    }

    /// Accessor for the simulated agent population.
    pub fn draws(&self) -> &AgentDraws {
        &self.draws
    }

    /// Length of the nonlinear parameter vector (price parameter plus one
    /// variance per characteristic).
    pub fn nonlinear_dimension(&self) -> usize {
        self.data.characteristic_count() + 1
    }

    /// Number of stacked demand and supply moments.
    pub fn moment_dimension(&self) -> usize {
        self.data.demand_instruments().ncols() + self.data.supply_instruments().ncols()
    }
}

/// The GMM weighting matrix together with its inverse, factorized once per
/// estimation stage.
#[derive(Clone, Debug)]
pub struct Weighting {
    matrix: DMatrix<f64>,
    inverse: DMatrix<f64>,
}

impl Weighting {
    /// The identity weighting used in the first estimation stage.
    pub fn identity(dimension: usize) -> Self {
        Self {
            matrix: DMatrix::identity(dimension, dimension),
            inverse: DMatrix::identity(dimension, dimension),
        }
    }

    /// Wraps a positive-definite weighting matrix, inverting it up front.
    pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
        if matrix.nrows() != matrix.ncols() {
            return Err(BlpError::dimension_mismatch(
                "weighting matrix columns",
                matrix.nrows(),
                matrix.ncols(),
            ));
        }
        let inverse = Cholesky::new(matrix.clone())
            .ok_or_else(|| BlpError::singular("GMM weighting matrix"))?
            .inverse();
        Ok(Self { matrix, inverse })
    }

    /// Estimates the efficient weighting matrix from the empirical
    /// covariance of per-observation moment contributions `z_i xi_i`.
    pub fn efficient(instruments: &DMatrix<f64>, residuals: &DVector<f64>) -> Result<Self> {
        let rows = instruments.nrows();
        if residuals.len() != rows {
            return Err(BlpError::dimension_mismatch(
                "residual length",
                rows,
                residuals.len(),
            ));
        }
        let dimension = instruments.ncols();
        let mut matrix = DMatrix::zeros(dimension, dimension);
        for row in 0..rows {
            let contribution = instruments.row(row).transpose() * residuals[row];
            matrix.ger(1.0, &contribution, &contribution, 1.0);
        }
        matrix /= rows as f64;
        Self::new(matrix)
    }

    /// The weighting matrix `phi`.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// The precomputed inverse `phi^{-1}`.
    pub fn inverse(&self) -> &DMatrix<f64> {
        &self.inverse
    }

    /// Side length of the weighting matrix.
    pub fn dimension(&self) -> usize {
        self.matrix.nrows()
    }
}

/// Configuration for a joint estimation run.
#[derive(Clone, Debug)]
pub struct EstimationOptions {
    /// Options for the inner contraction mapping.
    pub contraction: ContractionOptions,
    /// Options for the marginal-cost recovery.
    pub supply: SupplyOptions,
    /// Where price heterogeneity enters the model.
    pub price_heterogeneity: PriceHeterogeneity,
    /// Starting mean utilities for every contraction call. Defaults to the
    /// closed-form logit utilities; the same start is reused on every
    /// evaluation so the objective stays a pure function of `theta_2`.
    pub initial_delta: Option<DVector<f64>>,
    /// Objective value reported to the minimizer for candidate vectors
    /// whose evaluation fails recoverably.
    pub rejection_value: f64,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            contraction: ContractionOptions::default(),
            supply: SupplyOptions::default(),
            price_heterogeneity: PriceHeterogeneity::Demographic,
            initial_delta: None,
            rejection_value: 1e12,
        }
    }
}

impl EstimationOptions {
    /// Overrides the contraction options while keeping other defaults.
    pub fn with_contraction(mut self, contraction: ContractionOptions) -> Self {
        self.contraction = contraction;
        self
    }

    /// Overrides the supply-side options while keeping other defaults.
    pub fn with_supply(mut self, supply: SupplyOptions) -> Self {
        self.supply = supply;
        self
    }

    /// Overrides the price-heterogeneity placement.
    pub fn with_price_heterogeneity(mut self, mode: PriceHeterogeneity) -> Self {
        self.price_heterogeneity = mode;
        self
    }

    /// Overrides the contraction starting point.
    pub fn with_initial_delta(mut self, delta: DVector<f64>) -> Self {
        self.initial_delta = Some(delta);
        self
    }
}

/// Everything produced by one evaluation of the GMM objective.
#[derive(Clone, Debug)]
pub struct ObjectiveEvaluation {
    /// The scalar GMM objective `g' phi^{-1} g`.
    pub value: f64,
    /// Linear parameters recovered by the IV projection.
    pub theta_1: DVector<f64>,
    /// Mean utilities recovered by the contraction mapping.
    pub delta: DVector<f64>,
    /// Marginal costs implied by Bertrand-Nash pricing, floored positive.
    pub marginal_costs: DVector<f64>,
    /// Stacked structural residuals `(xi, omega_s)`.
    pub xi: DVector<f64>,
    /// The moment vector `Z' xi / N`.
    pub moments: DVector<f64>,
    /// Diagnostics from the contraction mapping.
    pub contraction: ContractionSummary,
}

/// The GMM objective for one estimation stage: a pure function of the
/// nonlinear parameters given the problem data, the fixed agent draws and
/// the stage's weighting matrix.
///
/// The stacked design `blockdiag(X, W)`, stacked instruments
/// `blockdiag(Z, Z_s)` and their cross product do not depend on `theta_2`
/// and are assembled once at construction.
#[derive(Clone, Debug)]
pub struct GmmObjective<'a> {
    problem: &'a JointProblem,
    options: &'a EstimationOptions,
    weighting: Weighting,
    design: DMatrix<f64>,
    instruments: DMatrix<f64>,
    instruments_design: DMatrix<f64>,
    delta_0: DVector<f64>,
}

impl<'a> GmmObjective<'a> {
    /// Builds the objective for one stage.
    pub fn new(
        problem: &'a JointProblem,
        weighting: Weighting,
        options: &'a EstimationOptions,
    ) -> Result<Self> {
        let data = problem.data();
        let moment_dim = problem.moment_dimension();
        if weighting.dimension() != moment_dim {
            return Err(BlpError::dimension_mismatch(
                "weighting dimension",
                moment_dim,
                weighting.dimension(),
            ));
        }

        let design = block_diagonal(data.characteristics(), data.cost_shifters());
        let instruments = block_diagonal(data.demand_instruments(), data.supply_instruments());
        let instruments_design = instruments.tr_mul(&design);

        let delta_0 = match &options.initial_delta {
            Some(delta) => {
                if delta.len() != data.product_count() {
                    return Err(BlpError::dimension_mismatch(
                        "initial delta length",
                        data.product_count(),
                        delta.len(),
                    ));
                }
                delta.clone()
            }
            None => logit_delta(data),
        };

        Ok(Self {
            problem,
            options,
            weighting,
            design,
            instruments,
            instruments_design,
            delta_0,
        })
    }

    /// The stacked instrument matrix `blockdiag(Z, Z_s)`, used to update
    /// the weighting matrix between stages.
    pub fn stacked_instruments(&self) -> &DMatrix<f64> {
        &self.instruments
    }

    /// The weighting matrix in force for this stage.
    pub fn weighting(&self) -> &Weighting {
        &self.weighting
    }

    /// Evaluates the GMM objective at a candidate nonlinear parameter
    /// vector: inverts shares into mean utilities, recovers log marginal
    /// costs, projects the stacked system on the instruments and reduces
    /// the residual moments to a scalar quadratic form.
    pub fn evaluate(&self, theta_2: &DVector<f64>) -> Result<ObjectiveEvaluation> {
        let data = self.problem.data();
        let draws = self.problem.draws();
        let params = NonlinearParameters::from_vector(
            theta_2,
            data.characteristic_count(),
            draws.demographic_dim(),
            self.options.price_heterogeneity,
        )?;

        let (delta, contraction) =
            solve_delta(&self.delta_0, data, &params, draws, &self.options.contraction)?;
        let marginal_costs =
            recover_marginal_costs(&delta, data, &params, draws, &self.options.supply)?;

        let n = data.product_count();
        let mut outcome = DVector::zeros(2 * n);
        outcome.rows_mut(0, n).copy_from(&delta);
        outcome
            .rows_mut(n, n)
            .copy_from(&marginal_costs.map(f64::ln));

        let projected_outcome = self.instruments.tr_mul(&outcome);
        let weighted_design = self.instruments_design.transpose() * self.weighting.inverse();
        let normal_matrix = &weighted_design * &self.instruments_design;
        let normal_rhs = &weighted_design * &projected_outcome;

        let theta_1 = Cholesky::new(normal_matrix)
            .ok_or(BlpError::CollinearDesign {
                context: "IV projection",
            })?
            .solve(&normal_rhs);

        let xi = &outcome - &self.design * &theta_1;
        let moments = self.instruments.tr_mul(&xi) / n as f64;
        let value = moments.dot(&(self.weighting.inverse() * &moments));

        log::debug!(
            target: "blpnash::gmm",
            "objective {value:.6e} at theta_2 {:?} ({} contraction iterations)",
            theta_2.as_slice(),
            contraction.iterations
        );

        Ok(ObjectiveEvaluation {
            value,
            theta_1,
            delta,
            marginal_costs,
            xi,
            moments,
            contraction,
        })
    }
}

/// Stacks two matrices into a block diagonal.
fn block_diagonal(upper: &DMatrix<f64>, lower: &DMatrix<f64>) -> DMatrix<f64> {
    let mut stacked = DMatrix::zeros(
        upper.nrows() + lower.nrows(),
        upper.ncols() + lower.ncols(),
    );
    stacked
        .view_mut((0, 0), (upper.nrows(), upper.ncols()))
        .copy_from(upper);
    stacked
        .view_mut((upper.nrows(), upper.ncols()), (lower.nrows(), lower.ncols()))
        .copy_from(lower);
    stacked
}

/// The external bound-constrained minimizer collaborator.
///
/// Implementations receive the objective as a callback, a starting vector
/// and elementwise box constraints, and return the minimizing vector. The
/// callback never fails: candidate evaluations that error recoverably are
/// reported as a large penalty value instead.
pub trait Minimizer {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&DVector<f64>) -> f64,
        start: &DVector<f64>,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
    ) -> Result<DVector<f64>>;
}

/// Linear parameters with their semantic split.
#[derive(Clone, Debug, Serialize)]
pub struct LinearParameters {
    /// Coefficients on the demand characteristics.
    pub characteristics: DVector<f64>,
    /// Coefficients on the supply-side cost shifters.
    pub cost_shifters: DVector<f64>,
}

/// The outcome of one estimation stage.
#[derive(Clone, Debug, Serialize)]
pub struct StageEstimate {
    /// Nonlinear parameters at the stage optimum: price sensitivity first,
    /// then one taste-heterogeneity variance per characteristic.
    pub theta_2: DVector<f64>,
    /// Linear parameters recovered at the stage optimum.
    pub linear: LinearParameters,
    /// GMM objective value at the optimum.
    pub objective_value: f64,
}

impl StageEstimate {
    /// The price-related nonlinear parameter.
    pub fn price_sensitivity(&self) -> f64 {
        self.theta_2[0]
    }

    /// Per-characteristic taste-heterogeneity parameters.
    pub fn taste_variances(&self) -> DVector<f64> {
        self.theta_2.rows(1, self.theta_2.len() - 1).into_owned()
    }
}

/// Final output of the two-step estimator.
#[derive(Clone, Debug, Serialize)]
pub struct TwoStepResult {
    /// Estimates under the identity weighting.
    pub first_stage: StageEstimate,
    /// Estimates under the efficient weighting.
    pub second_stage: StageEstimate,
    /// The efficient weighting matrix used in the second stage.
    pub weighting: DMatrix<f64>,
}

/// Drives the external minimizer through the two GMM stages: identity
/// weighting first, then a re-minimization under the efficient weighting
/// estimated from the stage-one residuals. Both stages share the starting
/// point, the contraction tolerance and the fixed agent draws.
pub struct TwoStepEstimator<'a, M: Minimizer> {
    problem: &'a JointProblem,
    minimizer: &'a M,
    options: EstimationOptions,
}

impl<'a, M: Minimizer> TwoStepEstimator<'a, M> {
    /// Creates a new estimator over the given problem.
    pub fn new(problem: &'a JointProblem, minimizer: &'a M, options: EstimationOptions) -> Self {
        Self {
            problem,
            minimizer,
            options,
        }
    }

    /// Runs both estimation stages from `theta_2_start`.
    ///
    /// Every nonlinear parameter is constrained to `[0, inf)`: variances
    /// cannot be negative and the price parameter follows the same sign
    /// convention through its input orientation.
    pub fn estimate(&self, theta_2_start: &DVector<f64>) -> Result<TwoStepResult> {
        let dimension = self.problem.nonlinear_dimension();
        if theta_2_start.len() != dimension {
            return Err(BlpError::dimension_mismatch(
                "theta_2 start length",
                dimension,
                theta_2_start.len(),
            ));
        }

        let moment_dim = self.problem.moment_dimension();
        let first_objective =
            GmmObjective::new(self.problem, Weighting::identity(moment_dim), &self.options)?;
        let (first_theta, first_eval) = self.run_stage(&first_objective, theta_2_start)?;
        log::info!(
            target: "blpnash::estimation",
            "first stage converged: objective {:.6e}",
            first_eval.value
        );

        let weighting =
            Weighting::efficient(first_objective.stacked_instruments(), &first_eval.xi)?;
        let weighting_matrix = weighting.matrix().clone();

        let second_objective = GmmObjective::new(self.problem, weighting, &self.options)?;
        let (second_theta, second_eval) = self.run_stage(&second_objective, theta_2_start)?;
        log::info!(
            target: "blpnash::estimation",
            "second stage converged: objective {:.6e}",
            second_eval.value
        );

        Ok(TwoStepResult {
            first_stage: self.stage_estimate(first_theta, first_eval),
            second_stage: self.stage_estimate(second_theta, second_eval),
            weighting: weighting_matrix,
        })
    }

    /// Minimizes one stage's objective and re-evaluates the projection at
    /// the optimum.
    ///
    /// Candidates that fail recoverably (non-convergence, ill-conditioned
    /// Jacobian, numerical failure) are penalized rather than aborted;
    /// fatal failures surface once the minimizer returns, and the final
    /// evaluation at the optimum propagates every error.
    fn run_stage(
        &self,
        objective: &GmmObjective<'_>,
        start: &DVector<f64>,
    ) -> Result<(DVector<f64>, ObjectiveEvaluation)> {
        let dimension = start.len();
        let lower = DVector::zeros(dimension);
        let upper = DVector::from_element(dimension, f64::INFINITY);

        let mut fatal: Option<BlpError> = None;
        let mut callback = |theta_2: &DVector<f64>| match objective.evaluate(theta_2) {
            Ok(evaluation) => evaluation.value,
            Err(error) => {
                if error.rejects_candidate() {
                    log::warn!(
                        target: "blpnash::estimation",
                        "rejecting candidate {:?}: {error}",
                        theta_2.as_slice()
                    );
                } else if fatal.is_none() {
                    fatal = Some(error);
                }
                self.options.rejection_value
            }
        };

        let optimum = self
            .minimizer
            .minimize(&mut callback, start, &lower, &upper)?;
        if let Some(error) = fatal {
            return Err(error);
        }

        let evaluation = objective.evaluate(&optimum)?;
        Ok((optimum, evaluation))
    }

    fn stage_estimate(&self, theta_2: DVector<f64>, evaluation: ObjectiveEvaluation) -> StageEstimate {
        let k = self.problem.data().characteristic_count();
        let k_s = self.problem.data().cost_shifter_count();
        StageEstimate {
            theta_2,
            linear: LinearParameters {
                characteristics: evaluation.theta_1.rows(0, k).into_owned(),
                cost_shifters: evaluation.theta_1.rows(k, k_s).into_owned(),
            },
            objective_value: evaluation.value,
        }
    }
}
