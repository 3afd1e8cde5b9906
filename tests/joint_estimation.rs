use approx::assert_relative_eq;
use blpnash::data::{ProductData, ProductDataBuilder};
use blpnash::demand::{logit_delta, predict_shares, solve_delta};
use blpnash::estimation::{
    EstimationOptions, GmmObjective, JointProblem, Minimizer, TwoStepEstimator, Weighting,
};
use blpnash::integration::{AgentDraws, PopulationSpec};
use blpnash::parameters::{NonlinearParameters, PriceHeterogeneity};
use blpnash::supply::recover_marginal_costs;
use blpnash::{BlpError, ContractionOptions, Result, SupplyOptions};
use nalgebra::{DMatrix, DVector};

fn homogeneous_draws(markets: usize, agents: usize) -> AgentDraws {
    AgentDraws::new(
        vec![DMatrix::zeros(2, agents); markets],
        vec![DMatrix::from_element(1, agents, 1.0); markets],
    )
    .unwrap()
}

fn params(theta_2: &[f64]) -> NonlinearParameters {
    NonlinearParameters::from_vector(
        &DVector::from_vec(theta_2.to_vec()),
        1,
        1,
        PriceHeterogeneity::Demographic,
    )
    .unwrap()
}

/// Homogeneous logit mean utilities have the closed form
/// `ln(s_j) - ln(s_0)`; the contraction must reproduce it in one step.
#[test]
fn logit_delta_matches_closed_form() {
    let data = ProductDataBuilder::new(
        vec![1, 1, 2],
        vec![1, 2, 1],
        DVector::from_vec(vec![0.3, 0.2, 0.4]),
        DVector::from_vec(vec![1.0, 1.5, 1.2]),
    )
    .characteristics(DMatrix::from_row_slice(3, 2, &[1.0, 10.0, 1.0, 15.0, 1.0, 12.0]))
    .cost_shifters(DMatrix::from_row_slice(3, 1, &[1.0, 1.0, 1.0]))
    .build()
    .unwrap();

    let draws = AgentDraws::new(
        vec![DMatrix::zeros(3, 1), DMatrix::zeros(3, 1)],
        vec![DMatrix::from_element(1, 1, 1.0), DMatrix::from_element(1, 1, 1.0)],
    )
    .unwrap();
    let params = NonlinearParameters::from_vector(
        &DVector::zeros(3),
        2,
        1,
        PriceHeterogeneity::Demographic,
    )
    .unwrap();

    let (delta, summary) = solve_delta(
        &logit_delta(&data),
        &data,
        &params,
        &draws,
        &ContractionOptions::default(),
    )
    .unwrap();
    assert_eq!(summary.iterations, 1);

    let expected_delta = DVector::from_vec(vec![
        -0.510_825_623_765_9907,
        -0.916_290_731_874_155,
        -0.405_465_108_108_1644,
    ]);
    assert_relative_eq!(delta, expected_delta, epsilon = 1e-12);

    let predicted = predict_shares(&delta, &data, &params, &draws).unwrap();
    assert_relative_eq!(predicted.aggregate, data.shares().clone(), epsilon = 1e-12);
}

fn duopoly_data(firm_ids: Vec<u32>) -> ProductData {
    ProductDataBuilder::new(
        vec![1, 1],
        firm_ids,
        DVector::from_vec(vec![0.3, 0.2]),
        DVector::from_vec(vec![2.0, 2.5]),
    )
    .characteristics(DMatrix::from_row_slice(2, 1, &[1.0, 0.7]))
    .cost_shifters(DMatrix::from_row_slice(2, 1, &[1.0, 1.0]))
    .build()
    .unwrap()
}

/// One market, two single-product firms, no heterogeneity: markups follow
/// the scalar logit formula and costs sit strictly below prices.
#[test]
fn duopoly_recovers_closed_form_markups() {
    let alpha = 2.0;
    let data = duopoly_data(vec![1, 2]);
    let draws = homogeneous_draws(1, 4);
    let params = params(&[alpha, 0.0]);

    let options = ContractionOptions {
        tolerance: 1e-13,
        max_iterations: 10_000,
        ..ContractionOptions::default()
    };
    let (delta, _) = solve_delta(&logit_delta(&data), &data, &params, &draws, &options).unwrap();

    let costs =
        recover_marginal_costs(&delta, &data, &params, &draws, &SupplyOptions::default()).unwrap();
    assert_relative_eq!(costs[0], 2.0 - 1.0 / (alpha * (1.0 - 0.3)), epsilon = 1e-8);
    assert_relative_eq!(costs[1], 2.5 - 1.0 / (alpha * (1.0 - 0.2)), epsilon = 1e-8);
    assert!(costs[0] < data.prices()[0] && costs[1] < data.prices()[1]);
}

/// Merging both products under one firm internalizes substitution: the
/// common markup rises to `1 / (alpha (1 - s_1 - s_2))`.
#[test]
fn merged_duopoly_raises_markups() {
    let alpha = 2.0;
    let data = duopoly_data(vec![1, 1]);
    let draws = homogeneous_draws(1, 4);
    let params = params(&[alpha, 0.0]);

    let options = ContractionOptions {
        tolerance: 1e-13,
        max_iterations: 10_000,
        ..ContractionOptions::default()
    };
    let (delta, _) = solve_delta(&logit_delta(&data), &data, &params, &draws, &options).unwrap();

    let costs =
        recover_marginal_costs(&delta, &data, &params, &draws, &SupplyOptions::default()).unwrap();
    let markup = 1.0 / (alpha * (1.0 - 0.3 - 0.2));
    assert_relative_eq!(costs[0], 2.0 - markup, epsilon = 1e-8);
    assert_relative_eq!(costs[1], 2.5 - markup, epsilon = 1e-8);

    let single_product_markup = 1.0 / (alpha * (1.0 - 0.3));
    assert!(markup > single_product_markup);
}

/// Deterministic coordinate search standing in for the external minimizer.
struct GridMinimizer {
    candidates: Vec<f64>,
}

impl Minimizer for GridMinimizer {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&DVector<f64>) -> f64,
        start: &DVector<f64>,
        lower: &DVector<f64>,
        upper: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let mut best = start.clone();
        let mut best_value = objective(&best);
        for _ in 0..2 {
            for coordinate in 0..best.len() {
                for &candidate in &self.candidates {
                    if candidate < lower[coordinate] || candidate > upper[coordinate] {
                        continue;
                    }
                    let mut trial = best.clone();
                    trial[coordinate] = candidate;
                    let value = objective(&trial);
                    if value < best_value {
                        best_value = value;
                        best = trial;
                    }
                }
            }
        }
        Ok(best)
    }
}

fn synthetic_problem() -> JointProblem {
    let spec = PopulationSpec {
        agents_per_market: 30,
        characteristic_count: 1,
        taste_mean: 0.0,
        taste_var: 1.0,
        demographic_means: DMatrix::from_element(1, 2, 2.0),
        demographic_vars: DMatrix::from_element(1, 2, 0.25),
        price_heterogeneity: PriceHeterogeneity::Demographic,
    };
    let draws = AgentDraws::draw_population(&spec, 29).unwrap();
    let truth = params(&[1.0, 0.5]);

    let x = DMatrix::from_row_slice(4, 1, &[1.0, 0.5, 0.8, 1.2]);
    let w = DMatrix::from_row_slice(4, 1, &[1.0, 1.1, 0.9, 1.05]);
    let prices = DVector::from_vec(vec![1.5, 1.7, 1.6, 1.4]);
    let mut z = DMatrix::zeros(4, 2);
    for row in 0..4 {
        z[(row, 0)] = x[(row, 0)];
        z[(row, 1)] = x[(row, 0)] * x[(row, 0)];
    }

    let build = |shares: DVector<f64>| {
        ProductDataBuilder::new(vec![1, 1, 2, 2], vec![1, 2, 1, 1], shares, prices.clone())
            .characteristics(x.clone())
            .cost_shifters(w.clone())
            .demand_instruments(z.clone())
            .supply_instruments(w.clone())
            .build()
            .unwrap()
    };

    let delta_star = DVector::from_vec(vec![1.12, 0.35, 0.88, 1.1]);
    let scaffold = build(DVector::from_vec(vec![0.1, 0.1, 0.1, 0.1]));
    let shares = predict_shares(&delta_star, &scaffold, &truth, &draws)
        .unwrap()
        .aggregate;

    JointProblem::new(build(shares), draws).unwrap()
}

/// A full two-step run over internally-consistent synthetic data, finishing
/// with the serialized artifacts the result writer consumes.
#[test]
fn two_step_estimation_end_to_end() {
    let problem = synthetic_problem();
    let minimizer = GridMinimizer {
        candidates: vec![0.25, 0.5, 0.75, 1.0, 1.25],
    };
    let estimator = TwoStepEstimator::new(&problem, &minimizer, EstimationOptions::default());

    let result = estimator
        .estimate(&DVector::from_vec(vec![0.75, 0.25]))
        .unwrap();

    assert!(result.first_stage.objective_value.is_finite());
    assert!(result.second_stage.objective_value.is_finite());
    assert!(result.second_stage.theta_2.iter().all(|value| *value >= 0.0));
    assert_eq!(result.second_stage.linear.characteristics.len(), 1);
    assert_eq!(result.second_stage.linear.cost_shifters.len(), 1);
    assert_eq!(result.weighting.nrows(), problem.moment_dimension());

    let json = serde_json::to_value(&result).unwrap();
    assert!(json.get("first_stage").is_some());
    assert!(json.get("second_stage").is_some());
    assert!(json.get("weighting").is_some());
}

/// Repeated evaluations with the same fixed draws are bit-identical, so the
/// outer minimizer always sees a deterministic objective.
#[test]
fn objective_is_deterministic_across_evaluations() {
    let problem = synthetic_problem();
    let options = EstimationOptions::default();
    let objective = GmmObjective::new(
        &problem,
        Weighting::identity(problem.moment_dimension()),
        &options,
    )
    .unwrap();

    let theta_2 = DVector::from_vec(vec![0.9, 0.4]);
    let first = objective.evaluate(&theta_2).unwrap();
    let second = objective.evaluate(&theta_2).unwrap();
    assert_eq!(first.value.to_bits(), second.value.to_bits());
}

/// Non-convergence inside the contraction surfaces as a typed error rather
/// than a NaN objective.
#[test]
fn non_convergence_is_reported_as_an_error() {
    let problem = synthetic_problem();
    let options = EstimationOptions::default().with_contraction(ContractionOptions {
        tolerance: 1e-14,
        max_iterations: 1,
        ..ContractionOptions::default()
    });
    let objective = GmmObjective::new(
        &problem,
        Weighting::identity(problem.moment_dimension()),
        &options,
    )
    .unwrap();

    let result = objective.evaluate(&DVector::from_vec(vec![0.9, 0.4]));
    match result {
        Err(error @ BlpError::ContractionDidNotConverge { .. }) => {
            assert!(error.rejects_candidate());
        }
        other => panic!("expected non-convergence, got {other:?}"),
    }
}
