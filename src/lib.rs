//! Joint estimation of random coefficients logit demand and Bertrand-Nash
//! supply for differentiated products markets.
//!
//! This crate implements the numerical core of the Berry-Levinsohn-Pakes
//! (BLP) estimator with a supply side: given observed market data and a
//! fixed population of simulated agents, it
//!
//! - predicts market shares by simulated integration (`demand` module),
//! - inverts observed shares into mean utilities with the BLP contraction
//!   mapping (`demand` module),
//! - recovers marginal costs from the Bertrand-Nash first-order condition
//!   through the ownership-restricted share-price Jacobian (`supply`
//!   module), and
//! - assembles a two-step GMM estimator over the stacked demand and supply
//!   moments (`estimation` module).
//!
//! Reading tabular data, drawing the agent population and minimizing the
//! objective are collaborator concerns: the crate consumes ready matrices,
//! offers a seeded [`integration::AgentDraws::draw_population`] helper, and
//! drives any [`estimation::Minimizer`] implementation as an opaque
//! bound-constrained optimizer.
//!
//! # Quick start
//!
//! ```no_run
//! use blpnash::data::ProductDataBuilder;
//! use blpnash::estimation::{EstimationOptions, GmmObjective, JointProblem, Weighting};
//! use blpnash::integration::{AgentDraws, PopulationSpec};
//! use blpnash::parameters::PriceHeterogeneity;
//! use nalgebra::{DMatrix, DVector};
//!
//! // Two products in one market, sold by different firms.
//! let data = ProductDataBuilder::new(
//!     vec![1, 1],
//!     vec![1, 2],
//!     DVector::from_vec(vec![0.3, 0.2]),
//!     DVector::from_vec(vec![2.0, 2.5]),
//! )
//! .characteristics(DMatrix::from_row_slice(2, 1, &[1.0, 0.7]))
//! .cost_shifters(DMatrix::from_row_slice(2, 1, &[1.0, 1.0]))
//! .build()
//! .expect("validated product data");
//!
//! // One fixed agent population per market, reused for the whole run.
//! let spec = PopulationSpec {
//!     agents_per_market: 200,
//!     characteristic_count: 1,
//!     taste_mean: 0.0,
//!     taste_var: 1.0,
//!     demographic_means: DMatrix::from_element(1, 1, 2.0),
//!     demographic_vars: DMatrix::from_element(1, 1, 0.5),
//!     price_heterogeneity: PriceHeterogeneity::Demographic,
//! };
//! let draws = AgentDraws::draw_population(&spec, 1234).expect("drawn population");
//!
//! let problem = JointProblem::new(data, draws).expect("well-formed problem");
//! let options = EstimationOptions::default();
//! let objective = GmmObjective::new(
//!     &problem,
//!     Weighting::identity(problem.moment_dimension()),
//!     &options,
//! )
//! .expect("well-formed objective");
//!
//! let theta_2 = DVector::from_vec(vec![1.0, 0.5]);
//! let evaluation = objective.evaluate(&theta_2).expect("converged");
//! println!("GMM objective: {}", evaluation.value);
//! ```
//!
//! Market partitioning is the central invariant: products in different
//! markets never interact in shares or derivatives, and cross-price effects
//! exist only inside a firm's ownership block within one market. Both loops
//! are data-parallel across markets and are fanned out with `rayon`.

pub mod data;
pub mod demand;
pub mod error;
pub mod estimation;
pub mod integration;
pub mod parameters;
pub mod solving;
pub mod supply;

pub use error::{BlpError, Result};
pub use estimation::{
    EstimationOptions, GmmObjective, JointProblem, Minimizer, TwoStepEstimator, TwoStepResult,
    Weighting,
};
pub use parameters::{NonlinearParameters, PriceHeterogeneity};
pub use solving::{ContractionOptions, ContractionSummary, SupplyOptions};
pub use supply::MARGINAL_COST_FLOOR;
