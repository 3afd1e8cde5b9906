//! Simulated agent populations used to approximate the heterogeneous
//! consumer integral.
//!
//! Draws are created once per estimation run with a fixed seed and held
//! immutable thereafter: every contraction and objective evaluation within
//! a run must integrate over the same agents, otherwise the GMM objective
//! is not a deterministic function of the parameters.

use nalgebra::DMatrix;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{BlpError, Result};
use crate::parameters::PriceHeterogeneity;

/// Simulated agents for every market: taste shocks `nu` ((K+1) x R per
/// market) and demographics `D` (L x R per market), indexed by 1-based
/// market label.
#[derive(Clone, Debug)]
pub struct AgentDraws {
    tastes: Vec<DMatrix<f64>>,
    demographics: Vec<DMatrix<f64>>,
}

impl AgentDraws {
    /// Builds agent draws from per-market taste and demographic matrices.
    ///
    /// Market `t` (labels 1..T) uses `tastes[t-1]` and `demographics[t-1]`.
    /// All markets must share the same number of agents and the same taste
    /// and demographic dimensions.
    pub fn new(tastes: Vec<DMatrix<f64>>, demographics: Vec<DMatrix<f64>>) -> Result<Self> {
        if tastes.is_empty() {
            return Err(BlpError::dimension_mismatch("market count", 1, 0));
        }
        if demographics.len() != tastes.len() {
            return Err(BlpError::dimension_mismatch(
                "demographic market count",
                tastes.len(),
                demographics.len(),
            ));
        }

        let taste_dim = tastes[0].nrows();
        let agents = tastes[0].ncols();
        let demographic_dim = demographics[0].nrows();
        if taste_dim == 0 {
            return Err(BlpError::dimension_mismatch("taste dimension", 1, 0));
        }
        if agents == 0 {
            return Err(BlpError::dimension_mismatch("agents per market", 1, 0));
        }

        for taste in &tastes {
            if taste.nrows() != taste_dim {
                return Err(BlpError::dimension_mismatch(
                    "taste dimension",
                    taste_dim,
                    taste.nrows(),
                ));
            }
            if taste.ncols() != agents {
                return Err(BlpError::dimension_mismatch(
                    "agents per market",
                    agents,
                    taste.ncols(),
                ));
            }
        }
        for demo in &demographics {
            if demo.nrows() != demographic_dim {
                return Err(BlpError::dimension_mismatch(
                    "demographic dimension",
                    demographic_dim,
                    demo.nrows(),
                ));
            }
            if demo.ncols() != agents {
                return Err(BlpError::dimension_mismatch(
                    "agents per market",
                    agents,
                    demo.ncols(),
                ));
            }
        }

        Ok(Self {
            tastes,
            demographics,
        })
    }

    /// Draws a fresh population from parametric distributions, the
    /// collaborator contract `draw_population`.
    ///
    /// Taste shocks are `Normal(taste_mean, taste_var)` per characteristic;
    /// demographics are `Normal(demographic_means[l, t],
    /// demographic_vars[l, t])`. Under [`PriceHeterogeneity::Demographic`]
    /// the price row of the taste array is structurally zero. The seed fixes
    /// the population for the whole estimation run.
    pub fn draw_population(spec: &PopulationSpec, seed: u64) -> Result<Self> {
        spec.validate()?;
        let taste_dim = spec.characteristic_count + 1;
        let markets = spec.demographic_means.ncols();
        let demographic_dim = spec.demographic_means.nrows();
        let agents = spec.agents_per_market;
        let taste_sd = spec.taste_var.sqrt();

        let mut rng = SmallRng::seed_from_u64(seed);
        let mut tastes = Vec::with_capacity(markets);
        let mut demographics = Vec::with_capacity(markets);
        for market in 0..markets {
            let mut nu = DMatrix::zeros(taste_dim, agents);
            let skip_price_row = spec.price_heterogeneity == PriceHeterogeneity::Demographic;
            for row in 0..taste_dim {
                if row == 0 && skip_price_row {
                    continue;
                }
                for agent in 0..agents {
                    let shock: f64 = StandardNormal.sample(&mut rng);
                    nu[(row, agent)] = spec.taste_mean + taste_sd * shock;
                }
            }

            let mut demo = DMatrix::zeros(demographic_dim, agents);
            for row in 0..demographic_dim {
                let mean = spec.demographic_means[(row, market)];
                let sd = spec.demographic_vars[(row, market)].sqrt();
                for agent in 0..agents {
                    let shock: f64 = StandardNormal.sample(&mut rng);
                    demo[(row, agent)] = mean + sd * shock;
                }
            }

            tastes.push(nu);
            demographics.push(demo);
        }

        Self::new(tastes, demographics)
    }

    /// Number of markets the draws cover (T).
    pub fn market_count(&self) -> usize {
        self.tastes.len()
    }

    /// Number of simulated agents per market (R).
    pub fn agents_per_market(&self) -> usize {
        self.tastes[0].ncols()
    }

    /// Dimension of the taste shock vector (K+1).
    pub fn taste_dim(&self) -> usize {
        self.tastes[0].nrows()
    }

    /// Dimension of the demographic vector (L).
    pub fn demographic_dim(&self) -> usize {
        self.demographics[0].nrows()
    }

    /// Taste draws for the market with the given 1-based label.
    pub fn tastes_for(&self, market_id: u32) -> Result<&DMatrix<f64>> {
        self.slice_for(market_id, &self.tastes)
    }

    /// Demographic draws for the market with the given 1-based label.
    pub fn demographics_for(&self, market_id: u32) -> Result<&DMatrix<f64>> {
        self.slice_for(market_id, &self.demographics)
    }

    fn slice_for<'a>(
        &self,
        market_id: u32,
        slices: &'a [DMatrix<f64>],
    ) -> Result<&'a DMatrix<f64>> {
        if market_id == 0 || market_id as usize > slices.len() {
            return Err(BlpError::MissingMarketDraws { market_id });
        }
        Ok(&slices[market_id as usize - 1])
    }
}

/// Parameters of the population distribution handed to
/// [`AgentDraws::draw_population`].
#[derive(Clone, Debug)]
pub struct PopulationSpec {
    /// Number of simulated agents per market (R).
    pub agents_per_market: usize,
    /// Number of observed product characteristics (K); taste vectors have
    /// one additional leading entry for the price.
    pub characteristic_count: usize,
    /// Mean of the taste shock distribution.
    pub taste_mean: f64,
    /// Variance of the taste shock distribution.
    pub taste_var: f64,
    /// L x T matrix of demographic means, one column per market.
    pub demographic_means: DMatrix<f64>,
    /// L x T matrix of demographic variances, one column per market.
    pub demographic_vars: DMatrix<f64>,
    /// Where price heterogeneity enters the model.
    pub price_heterogeneity: PriceHeterogeneity,
}

impl PopulationSpec {
    fn validate(&self) -> Result<()> {
        if self.agents_per_market == 0 {
            return Err(BlpError::dimension_mismatch("agents per market", 1, 0));
        }
        if self.demographic_means.ncols() == 0 {
            return Err(BlpError::dimension_mismatch("market count", 1, 0));
        }
        if self.demographic_vars.shape() != self.demographic_means.shape() {
            return Err(BlpError::dimension_mismatch(
                "demographic variance rows",
                self.demographic_means.nrows(),
                self.demographic_vars.nrows(),
            ));
        }
        if self.taste_var < 0.0 {
            return Err(BlpError::NegativeVariance {
                index: 0,
                value: self.taste_var,
            });
        }
        for (index, value) in self.demographic_vars.iter().enumerate() {
            if *value < 0.0 {
                return Err(BlpError::NegativeVariance {
                    index,
                    value: *value,
                });
            }
        }
        Ok(())
    }
}
