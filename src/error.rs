use thiserror::Error;

/// Unified error type for `blpnash` operations.
#[derive(Debug, Error)]
pub enum BlpError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when the supplied market ids are not grouped contiguously.
    #[error("market identifiers must appear in contiguous blocks; market `{market_id}` is split")]
    NonContiguousMarket { market_id: u32 },

    /// Raised when product shares are missing or non-positive.
    #[error("product share at index {index} must be positive, found {share}")]
    NonPositiveShare { index: usize, share: f64 },

    /// Raised when the outside good share becomes non-positive.
    #[error("outside share for market `{market_id}` must be positive, found {share}")]
    NonPositiveOutsideShare { market_id: u32, share: f64 },

    /// Raised when a product's market label has no agent draws attached.
    #[error("market `{market_id}` has no simulated agent draws")]
    MissingMarketDraws { market_id: u32 },

    /// Raised when a taste-heterogeneity variance is negative.
    #[error("variance parameter at index {index} must be non-negative, found {value}")]
    NegativeVariance { index: usize, value: f64 },

    /// Raised when the contraction mapping fails to meet the tolerance.
    #[error(
        "BLP contraction did not converge after {iterations} iterations; best max gap {max_gap}"
    )]
    ContractionDidNotConverge {
        /// Number of iterations performed before termination.
        iterations: usize,
        /// Maximum absolute change in the last iteration.
        max_gap: f64,
    },

    /// Raised when a firm's ownership block of the share-price Jacobian
    /// cannot be inverted reliably.
    #[error(
        "share-price Jacobian block for firm `{firm_id}` in market `{market_id}` is \
         ill-conditioned (condition number {condition:e})"
    )]
    IllConditionedJacobian {
        market_id: u32,
        firm_id: u32,
        condition: f64,
    },

    /// Raised when the IV cross-product matrix of the GMM projection is not
    /// positive-definite, typically because instruments or regressors are
    /// collinear.
    #[error("collinear design in {context}: cross-product matrix is not positive-definite")]
    CollinearDesign { context: &'static str },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when numerical routines produce NaN or underflow.
    #[error("encountered a numerical failure during {context}")]
    NumericalError { context: &'static str },

    /// Raised when a required component has not been provided to a builder or solver.
    #[error("{component} must be provided before solving the problem")]
    MissingComponent { component: &'static str },

    /// Raised when the external minimizer collaborator reports failure.
    #[error("minimization failed: {detail}")]
    MinimizationFailed { detail: String },
}

impl BlpError {
    /// Helper to format a [`DimensionMismatch`](BlpError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper for bubbling up missing component errors from builders.
    pub fn missing_component(component: &'static str) -> Self {
        Self::MissingComponent { component }
    }

    /// Whether this failure invalidates only the candidate parameter vector
    /// that produced it. The two-step driver reports a penalty objective
    /// value for such candidates instead of aborting the minimization;
    /// every other failure is fatal for the estimation run.
    pub fn rejects_candidate(&self) -> bool {
        matches!(
            self,
            Self::ContractionDidNotConverge { .. }
                | Self::IllConditionedJacobian { .. }
                | Self::NumericalError { .. }
        )
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, BlpError>;
