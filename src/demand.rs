//! Demand-side primitives: simulated share prediction and the BLP
//! contraction mapping.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::data::{MarketSegment, ProductData};
use crate::error::{BlpError, Result};
use crate::integration::AgentDraws;
use crate::parameters::NonlinearParameters;
use crate::solving::{ContractionOptions, ContractionSummary};

/// Model-implied shares at a given mean-utility vector.
#[derive(Clone, Debug)]
pub struct SharePrediction {
    /// Aggregate market shares, one entry per product-market observation.
    pub aggregate: DVector<f64>,
    /// Per-agent choice probabilities, products x agents. Row `j` holds the
    /// probabilities each simulated agent assigns to product `j`; the
    /// ownership-block Jacobian integrates over these.
    pub agent: DMatrix<f64>,
}

struct MarketShareBlock {
    start: usize,
    aggregate: DVector<f64>,
    probabilities: DMatrix<f64>,
}

/// Computes model-implied product shares given mean utilities `delta` and
/// nonlinear parameters, by integrating the multinomial logit choice
/// probabilities over the simulated agents.
///
/// Each market is computed independently from its own slice of the inputs;
/// markets are fanned out across threads and merged by index.
pub fn predict_shares(
    delta: &DVector<f64>,
    data: &ProductData,
    params: &NonlinearParameters,
    draws: &AgentDraws,
) -> Result<SharePrediction> {
    let n = data.product_count();
    if delta.len() != n {
        return Err(BlpError::dimension_mismatch("delta length", n, delta.len()));
    }
    let dim = data.characteristic_count() + 1;
    if params.dimension() != dim {
        return Err(BlpError::dimension_mismatch(
            "nonlinear parameter dimension",
            dim,
            params.dimension(),
        ));
    }
    if draws.taste_dim() != dim {
        return Err(BlpError::dimension_mismatch(
            "taste draw dimension",
            dim,
            draws.taste_dim(),
        ));
    }
    if draws.demographic_dim() != params.demographic_dim() {
        return Err(BlpError::dimension_mismatch(
            "demographic dimension",
            params.demographic_dim(),
            draws.demographic_dim(),
        ));
    }

    let segments: Vec<&MarketSegment> = data.partition().markets().collect();
    let blocks: Vec<Result<MarketShareBlock>> = segments
        .par_iter()
        .map(|segment| market_shares(segment, delta, data, params, draws))
        .collect();

    let agents = draws.agents_per_market();
    let mut aggregate = DVector::zeros(n);
    let mut agent = DMatrix::zeros(n, agents);
    for block in blocks {
        let block = block?;
        let products = block.aggregate.len();
        aggregate
            .rows_mut(block.start, products)
            .copy_from(&block.aggregate);
        agent
            .rows_mut(block.start, products)
            .copy_from(&block.probabilities);
    }

    Ok(SharePrediction { aggregate, agent })
}

/// Share computation for one market: the per-agent utility perturbation is
/// `[p | X] (sigma nu_i - gamma D_i)`, added to the market's mean utilities
/// and pushed through the outside-good-normalized logit form.
fn market_shares(
    segment: &MarketSegment,
    delta: &DVector<f64>,
    data: &ProductData,
    params: &NonlinearParameters,
    draws: &AgentDraws,
) -> Result<MarketShareBlock> {
    let nu = draws.tastes_for(segment.id())?;
    let demographics = draws.demographics_for(segment.id())?;
    let products = segment.product_count();
    let agents = draws.agents_per_market();
    let dim = params.dimension();
    let start = segment.range().start;

    let mut design = DMatrix::zeros(products, dim);
    for (row, index) in segment.range().enumerate() {
        design[(row, 0)] = data.prices()[index];
        for col in 0..dim - 1 {
            design[(row, col + 1)] = data.characteristics()[(index, col)];
        }
    }

    let shocks = params.sigma() * nu - params.gamma() * demographics;
    let mu = &design * &shocks;

    let mut aggregate = DVector::zeros(products);
    let mut probabilities = DMatrix::zeros(products, agents);
    let mut scratch = vec![0.0f64; products];
    for agent in 0..agents {
        // The outside good pins the utility scale at zero; shifting every
        // exponent by the per-agent maximum keeps the exponentials bounded.
        let mut max_utility = 0.0f64;
        for row in 0..products {
            let utility = delta[start + row] + mu[(row, agent)];
            scratch[row] = utility;
            if utility > max_utility {
                max_utility = utility;
            }
        }
        let mut denominator = (-max_utility).exp();
        for row in 0..products {
            let weight = (scratch[row] - max_utility).exp();
            scratch[row] = weight;
            denominator += weight;
        }
        for row in 0..products {
            let probability = scratch[row] / denominator;
            probabilities[(row, agent)] = probability;
            aggregate[row] += probability;
        }
    }
    aggregate /= agents as f64;

    if aggregate.iter().any(|share| !share.is_finite()) {
        return Err(BlpError::NumericalError {
            context: "share simulation",
        });
    }

    Ok(MarketShareBlock {
        start,
        aggregate,
        probabilities,
    })
}

/// Solves the BLP fixed-point equation for mean utilities `delta`, starting
/// from `delta_0` and applying `delta += damping (ln s - ln s_model)` until
/// the largest elementwise update falls below the tolerance.
pub fn solve_delta(
    delta_0: &DVector<f64>,
    data: &ProductData,
    params: &NonlinearParameters,
    draws: &AgentDraws,
    options: &ContractionOptions,
) -> Result<(DVector<f64>, ContractionSummary)> {
    let n = data.product_count();
    if delta_0.len() != n {
        return Err(BlpError::dimension_mismatch(
            "delta_0 length",
            n,
            delta_0.len(),
        ));
    }

    let mut delta = delta_0.clone();
    let mut max_gap = f64::INFINITY;
    let mut iteration = 0usize;

    while iteration < options.max_iterations {
        let predicted = predict_shares(&delta, data, params, draws)?;
        max_gap = 0.0;

        for product_index in 0..n {
            let observed = data.shares()[product_index];
            let model = predicted.aggregate[product_index];
            if !(model >= options.minimum_share) {
                return Err(BlpError::NumericalError {
                    context: "predicted share underflow",
                });
            }
            let update = options.damping * (observed / model).ln();
            delta[product_index] += update;
            max_gap = max_gap.max(update.abs());
        }

        iteration += 1;
        log::trace!(
            target: "blpnash::contraction",
            "iteration {iteration}: max gap {max_gap:e}"
        );
        if max_gap < options.tolerance {
            return Ok((
                delta,
                ContractionSummary {
                    iterations: iteration,
                    max_gap,
                },
            ));
        }
    }

    Err(BlpError::ContractionDidNotConverge {
        iterations: iteration,
        max_gap,
    })
}

/// Closed-form homogeneous-logit mean utilities `ln s_j - ln s_0`, the
/// standard starting point for the contraction.
pub fn logit_delta(data: &ProductData) -> DVector<f64> {
    let n = data.product_count();
    let mut delta = DVector::zeros(n);
    for product_index in 0..n {
        let share = data.shares()[product_index];
        let outside = data.outside_share_for_product(product_index);
        delta[product_index] = (share / outside).ln();
    }
    delta
}
