//! Supply-side primitives: the ownership-block share-price Jacobian and
//! Bertrand-Nash marginal cost recovery.

use nalgebra::{DMatrix, DVector, RowDVector};
use rayon::prelude::*;

use crate::data::{MarketSegment, ProductData};
use crate::demand::predict_shares;
use crate::error::{BlpError, Result};
use crate::integration::AgentDraws;
use crate::parameters::NonlinearParameters;
use crate::solving::SupplyOptions;

/// Floor applied to recovered marginal costs. Negative costs are
/// economically inadmissible, so the Bertrand-Nash first-order condition is
/// clipped here instead of failing; the value is a policy constant and
/// keeps `ln(mc)` defined everywhere downstream.
pub const MARGINAL_COST_FLOOR: f64 = 0.001;

struct MarketJacobianBlock {
    start: usize,
    entries: DMatrix<f64>,
}

/// Computes the matrix of (negated) share-price derivatives restricted to
/// the ownership structure: entry `[j, k]` is
/// `mean_i(alpha_i f_ij (1 - f_ij))` on the diagonal and
/// `mean_i(-alpha_i f_ij f_ik)` when products `j` and `k` are sold by the
/// same firm in the same market, and exactly zero otherwise.
///
/// `alpha_i` is agent `i`'s price sensitivity, the negated derivative of
/// utility with respect to price: `gamma[0, :] D_i - sigma[0, :] nu_i`.
pub fn price_jacobian(
    delta: &DVector<f64>,
    data: &ProductData,
    params: &NonlinearParameters,
    draws: &AgentDraws,
) -> Result<DMatrix<f64>> {
    let prediction = predict_shares(delta, data, params, draws)?;
    let n = data.product_count();

    let segments: Vec<&MarketSegment> = data.partition().markets().collect();
    let blocks: Vec<Result<MarketJacobianBlock>> = segments
        .par_iter()
        .map(|segment| market_jacobian(segment, &prediction.agent, params, draws))
        .collect();

    let mut omega = DMatrix::zeros(n, n);
    for block in blocks {
        let block = block?;
        let products = block.entries.nrows();
        omega
            .view_mut((block.start, block.start), (products, products))
            .copy_from(&block.entries);
    }
    Ok(omega)
}

fn market_jacobian(
    segment: &MarketSegment,
    agent_probabilities: &DMatrix<f64>,
    params: &NonlinearParameters,
    draws: &AgentDraws,
) -> Result<MarketJacobianBlock> {
    let demographics = draws.demographics_for(segment.id())?;
    let tastes = draws.tastes_for(segment.id())?;
    let agents = draws.agents_per_market();
    let start = segment.range().start;

    // Per-agent price sensitivities. The sigma term vanishes under the
    // demographic configuration where the price row of sigma is pinned to
    // zero.
    let alpha: RowDVector<f64> =
        params.gamma().row(0) * demographics - params.sigma().row(0) * tastes;

    let products = segment.product_count();
    let mut entries = DMatrix::zeros(products, products);
    for block in segment.ownership_blocks() {
        for &j in block.products() {
            for &k in block.products() {
                let mut sum = 0.0f64;
                if j == k {
                    for agent in 0..agents {
                        let own = agent_probabilities[(j, agent)];
                        sum += alpha[agent] * own * (1.0 - own);
                    }
                } else {
                    for agent in 0..agents {
                        sum -= alpha[agent]
                            * agent_probabilities[(j, agent)]
                            * agent_probabilities[(k, agent)];
                    }
                }
                entries[(j - start, k - start)] = sum / agents as f64;
            }
        }
    }

    Ok(MarketJacobianBlock { start, entries })
}

/// Recovers marginal costs from the Bertrand-Nash first-order condition
/// `mc = p - omega^{-1} s`, exploiting the block-diagonal ownership
/// structure of the Jacobian: each firm's block is factorized and solved
/// independently, and blocks whose condition number exceeds
/// [`SupplyOptions::max_condition`] are rejected instead of force-inverted.
///
/// Entries below [`MARGINAL_COST_FLOOR`] are raised to the floor.
pub fn recover_marginal_costs(
    delta: &DVector<f64>,
    data: &ProductData,
    params: &NonlinearParameters,
    draws: &AgentDraws,
    options: &SupplyOptions,
) -> Result<DVector<f64>> {
    let omega = price_jacobian(delta, data, params, draws)?;
    let mut costs = data.prices().clone();

    for segment in data.partition().markets() {
        for block in segment.ownership_blocks() {
            let size = block.products().len();
            let mut sub = DMatrix::zeros(size, size);
            let mut observed = DVector::zeros(size);
            for (row, &j) in block.products().iter().enumerate() {
                observed[row] = data.shares()[j];
                for (col, &k) in block.products().iter().enumerate() {
                    sub[(row, col)] = omega[(j, k)];
                }
            }

            let svd = sub.svd(true, true);
            let largest = svd.singular_values.max();
            let smallest = svd.singular_values.min();
            let condition = if smallest > 0.0 {
                largest / smallest
            } else {
                f64::INFINITY
            };
            if !condition.is_finite() || condition > options.max_condition {
                return Err(BlpError::IllConditionedJacobian {
                    market_id: segment.id(),
                    firm_id: block.firm_id(),
                    condition,
                });
            }

            let markup = svd
                .solve(&observed, 0.0)
                .map_err(|_| BlpError::singular("ownership block solve"))?;
            for (row, &j) in block.products().iter().enumerate() {
                costs[j] -= markup[row];
            }
        }
    }

    let mut floored = 0usize;
    for cost in costs.iter_mut() {
        if *cost < MARGINAL_COST_FLOOR {
            *cost = MARGINAL_COST_FLOOR;
            floored += 1;
        }
    }
    if floored > 0 {
        log::debug!(
            target: "blpnash::supply",
            "floored {floored} marginal cost(s) to {MARGINAL_COST_FLOOR}"
        );
    }

    Ok(costs)
}
