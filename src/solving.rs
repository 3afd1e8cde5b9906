//! Configuration and diagnostics for the numerical solvers: the share
//! inversion fixed point and the Bertrand-Nash cost recovery.

/// Configuration for the BLP fixed-point contraction that recovers mean utilities.
#[derive(Clone, Debug)]
pub struct ContractionOptions {
    /// Supremum norm tolerance for convergence.
    pub tolerance: f64,
    /// Maximum number of iterations allowed before aborting.
    pub max_iterations: usize,
    /// Damping factor applied to the log-share update (1.0 is standard BLP).
    pub damping: f64,
    /// Lower bound enforced on predicted shares to avoid taking `ln(0)`.
    pub minimum_share: f64,
}

impl Default for ContractionOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-9,
            max_iterations: 1_000,
            damping: 1.0,
            minimum_share: 1e-16,
        }
    }
}

/// Diagnostics returned alongside the contracted mean utilities.
#[derive(Clone, Debug)]
pub struct ContractionSummary {
    /// Number of iterations performed.
    pub iterations: usize,
    /// Maximum absolute change observed in the final iteration.
    pub max_gap: f64,
}

/// Configuration for the marginal-cost recovery step.
#[derive(Clone, Debug)]
pub struct SupplyOptions {
    /// Largest acceptable condition number for a firm's ownership block of
    /// the share-price Jacobian. Blocks beyond this bound are reported as
    /// ill-conditioned instead of being force-inverted.
    pub max_condition: f64,
}

impl Default for SupplyOptions {
    fn default() -> Self {
        Self {
            max_condition: 1e12,
        }
    }
}
