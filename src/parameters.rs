//! Nonlinear parameter handling: unpacking the optimizer's candidate vector
//! into the structural `gamma` and `sigma` matrices.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{BlpError, Result};

/// Where taste heterogeneity over the price enters the model.
///
/// The two placements are structurally exclusive: exactly one of the price
/// entries of `gamma` and `sigma` is free, the other is pinned to zero
/// before any solver sees the parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceHeterogeneity {
    /// Price sensitivity varies with observed demographics through
    /// `gamma[0, :]`; the price entry of `sigma` is structurally zero.
    /// This is the classic BLP price-income interaction.
    #[default]
    Demographic,
    /// Price sensitivity carries an unobserved random coefficient through
    /// `sigma[0, 0]`; `gamma` is structurally zero.
    RandomCoefficient,
}

/// The nonlinear taste parameters `theta_2` in structural form.
///
/// `gamma` is the (K+1) x L matrix of demographic interactions and `sigma`
/// the (K+1) x (K+1) diagonal matrix of unobserved heterogeneity, both
/// indexed with the price in position zero followed by the K observed
/// characteristics.
#[derive(Clone, Debug)]
pub struct NonlinearParameters {
    gamma: DMatrix<f64>,
    sigma: DMatrix<f64>,
}

impl NonlinearParameters {
    /// Unpacks a candidate vector from the optimizer.
    ///
    /// `theta_2` has length K+1: the price-related parameter first, then one
    /// heterogeneity variance per observed characteristic. Variance entries
    /// must be non-negative; the bound-constrained minimizer enforces this
    /// during search and this constructor re-checks it.
    pub fn from_vector(
        theta_2: &DVector<f64>,
        characteristic_count: usize,
        demographic_dim: usize,
        mode: PriceHeterogeneity,
    ) -> Result<Self> {
        let dim = characteristic_count + 1;
        if theta_2.len() != dim {
            return Err(BlpError::dimension_mismatch(
                "theta_2 length",
                dim,
                theta_2.len(),
            ));
        }
        if mode == PriceHeterogeneity::Demographic && demographic_dim == 0 {
            return Err(BlpError::dimension_mismatch(
                "demographic dimension",
                1,
                0,
            ));
        }

        let variance_start = match mode {
            PriceHeterogeneity::Demographic => 1,
            PriceHeterogeneity::RandomCoefficient => 0,
        };
        for index in variance_start..dim {
            let value = theta_2[index];
            if value < 0.0 {
                return Err(BlpError::NegativeVariance { index, value });
            }
        }

        let mut gamma = DMatrix::zeros(dim, demographic_dim);
        let mut sigma = DMatrix::zeros(dim, dim);
        match mode {
            PriceHeterogeneity::Demographic => {
                gamma[(0, 0)] = theta_2[0];
                for index in 1..dim {
                    sigma[(index, index)] = theta_2[index];
                }
            }
            PriceHeterogeneity::RandomCoefficient => {
                for index in 0..dim {
                    sigma[(index, index)] = theta_2[index];
                }
            }
        }

        Ok(Self { gamma, sigma })
    }

    /// The demographic interaction matrix, (K+1) x L.
    pub fn gamma(&self) -> &DMatrix<f64> {
        &self.gamma
    }

    /// The diagonal unobserved-heterogeneity matrix, (K+1) x (K+1).
    pub fn sigma(&self) -> &DMatrix<f64> {
        &self.sigma
    }

    /// Dimension of the stacked `[price, characteristics]` vector (K+1).
    pub fn dimension(&self) -> usize {
        self.sigma.nrows()
    }

    /// Number of demographic variables the parameters interact with.
    pub fn demographic_dim(&self) -> usize {
        self.gamma.ncols()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demographic_mode_pins_price_variance_to_zero() {
        let theta_2 = DVector::from_vec(vec![1.5, 0.4, 0.7]);
        let params =
            NonlinearParameters::from_vector(&theta_2, 2, 1, PriceHeterogeneity::Demographic)
                .unwrap();

        assert_eq!(params.gamma()[(0, 0)], 1.5);
        assert_eq!(params.gamma()[(1, 0)], 0.0);
        assert_eq!(params.sigma()[(0, 0)], 0.0);
        assert_eq!(params.sigma()[(1, 1)], 0.4);
        assert_eq!(params.sigma()[(2, 2)], 0.7);
        assert_eq!(params.sigma()[(1, 2)], 0.0);
    }

    #[test]
    fn random_coefficient_mode_pins_gamma_to_zero() {
        let theta_2 = DVector::from_vec(vec![0.2, 0.4]);
        let params =
            NonlinearParameters::from_vector(&theta_2, 1, 1, PriceHeterogeneity::RandomCoefficient)
                .unwrap();

        assert_eq!(params.gamma()[(0, 0)], 0.0);
        assert_eq!(params.sigma()[(0, 0)], 0.2);
        assert_eq!(params.sigma()[(1, 1)], 0.4);
    }

    #[test]
    fn rejects_negative_variance() {
        let theta_2 = DVector::from_vec(vec![1.0, -0.3]);
        let result =
            NonlinearParameters::from_vector(&theta_2, 1, 1, PriceHeterogeneity::Demographic);
        assert!(matches!(
            result,
            Err(BlpError::NegativeVariance { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_wrong_length() {
        let theta_2 = DVector::from_vec(vec![1.0, 0.3]);
        let result =
            NonlinearParameters::from_vector(&theta_2, 2, 1, PriceHeterogeneity::Demographic);
        assert!(matches!(result, Err(BlpError::DimensionMismatch { .. })));
    }

    #[test]
    fn demographic_mode_requires_demographics() {
        let theta_2 = DVector::from_vec(vec![1.0, 0.3]);
        let result =
            NonlinearParameters::from_vector(&theta_2, 1, 0, PriceHeterogeneity::Demographic);
        assert!(matches!(result, Err(BlpError::DimensionMismatch { .. })));
    }
}
