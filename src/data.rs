//! Product-level data containers and validation utilities used by the joint
//! demand and supply estimator.

use std::collections::HashSet;

use nalgebra::{DMatrix, DVector};

use crate::error::{BlpError, Result};

/// Represents observed product-market data required for joint estimation:
/// demand characteristics, prices, shares, cost shifters and both
/// instrument blocks, together with the market/firm partition.
#[derive(Clone, Debug)]
pub struct ProductData {
    market_ids: Vec<u32>,
    firm_ids: Vec<u32>,
    shares: DVector<f64>,
    prices: DVector<f64>,
    characteristics: DMatrix<f64>,
    cost_shifters: DMatrix<f64>,
    demand_instruments: DMatrix<f64>,
    supply_instruments: DMatrix<f64>,
    partition: MarketPartition,
}

impl ProductData {
    /// Number of product-market observations.
    pub fn product_count(&self) -> usize {
        self.shares.len()
    }

    /// Number of observed demand characteristics (`K`).
    pub fn characteristic_count(&self) -> usize {
        self.characteristics.ncols()
    }

    /// Number of observed cost shifters (`K_s`).
    pub fn cost_shifter_count(&self) -> usize {
        self.cost_shifters.ncols()
    }

    /// Returns a read-only view of the demand characteristics matrix (`X`).
    pub fn characteristics(&self) -> &DMatrix<f64> {
        &self.characteristics
    }

    /// Returns a read-only view of the cost shifter matrix (`W`).
    pub fn cost_shifters(&self) -> &DMatrix<f64> {
        &self.cost_shifters
    }

    /// Returns a read-only view of the demand-side instrument matrix (`Z`).
    pub fn demand_instruments(&self) -> &DMatrix<f64> {
        &self.demand_instruments
    }

    /// Returns a read-only view of the supply-side instrument matrix (`Z_s`).
    pub fn supply_instruments(&self) -> &DMatrix<f64> {
        &self.supply_instruments
    }

    /// Returns a read-only view of observed product market shares.
    pub fn shares(&self) -> &DVector<f64> {
        &self.shares
    }

    /// Returns a read-only view of observed prices.
    pub fn prices(&self) -> &DVector<f64> {
        &self.prices
    }

    /// Provides access to the precomputed market partition.
    pub fn partition(&self) -> &MarketPartition {
        &self.partition
    }

    /// Returns the outside share for the market containing product `i`.
    pub fn outside_share_for_product(&self, product_index: usize) -> f64 {
        let market_idx = self.partition.market_of(product_index);
        self.partition.markets[market_idx].outside_share
    }

    /// Returns the market label for a given product index.
    pub fn market_id(&self, product_index: usize) -> u32 {
        self.market_ids[product_index]
    }

    /// Returns the firm label for a given product index.
    pub fn firm_id(&self, product_index: usize) -> u32 {
        self.firm_ids[product_index]
    }
}

/// Builder that validates dimensions and market structure before
/// constructing [`ProductData`].
#[derive(Debug)]
pub struct ProductDataBuilder {
    market_ids: Vec<u32>,
    firm_ids: Vec<u32>,
    shares: DVector<f64>,
    prices: DVector<f64>,
    characteristics: Option<DMatrix<f64>>,
    cost_shifters: Option<DMatrix<f64>>,
    demand_instruments: Option<DMatrix<f64>>,
    supply_instruments: Option<DMatrix<f64>>,
}

impl ProductDataBuilder {
    /// Start building product data from market and firm labels, observed
    /// shares and observed prices.
    pub fn new(
        market_ids: Vec<u32>,
        firm_ids: Vec<u32>,
        shares: DVector<f64>,
        prices: DVector<f64>,
    ) -> Self {
        Self {
            market_ids,
            firm_ids,
            shares,
            prices,
            characteristics: None,
            cost_shifters: None,
            demand_instruments: None,
            supply_instruments: None,
        }
    }

    /// Sets the demand characteristics matrix (`X`).
    pub fn characteristics(mut self, matrix: DMatrix<f64>) -> Self {
        self.characteristics = Some(matrix);
        self
    }

    /// Sets the cost shifter matrix (`W`).
    pub fn cost_shifters(mut self, matrix: DMatrix<f64>) -> Self {
        self.cost_shifters = Some(matrix);
        self
    }

    /// Sets the demand-side instrument matrix (`Z`). Defaults to the
    /// characteristics when omitted.
    pub fn demand_instruments(mut self, matrix: DMatrix<f64>) -> Self {
        self.demand_instruments = Some(matrix);
        self
    }

    /// Sets the supply-side instrument matrix (`Z_s`). Defaults to the cost
    /// shifters when omitted.
    pub fn supply_instruments(mut self, matrix: DMatrix<f64>) -> Self {
        self.supply_instruments = Some(matrix);
        self
    }

    /// Finalizes construction after validating shapes and market structure.
    pub fn build(self) -> Result<ProductData> {
        let n = self.market_ids.len();
        if self.firm_ids.len() != n {
            return Err(BlpError::dimension_mismatch(
                "firm labels length",
                n,
                self.firm_ids.len(),
            ));
        }
        if self.shares.len() != n {
            return Err(BlpError::dimension_mismatch(
                "shares length",
                n,
                self.shares.len(),
            ));
        }
        if self.prices.len() != n {
            return Err(BlpError::dimension_mismatch(
                "prices length",
                n,
                self.prices.len(),
            ));
        }

        for (index, share) in self.shares.iter().enumerate() {
            if !share.is_finite() {
                return Err(BlpError::NumericalError {
                    context: "share validation",
                });
            }
            if *share <= 0.0 {
                return Err(BlpError::NonPositiveShare {
                    index,
                    share: *share,
                });
            }
        }

        let characteristics = self
            .characteristics
            .ok_or_else(|| BlpError::missing_component("characteristics"))?;
        if characteristics.nrows() != n {
            return Err(BlpError::dimension_mismatch(
                "characteristics rows",
                n,
                characteristics.nrows(),
            ));
        }

        let cost_shifters = self
            .cost_shifters
            .ok_or_else(|| BlpError::missing_component("cost shifters"))?;
        if cost_shifters.nrows() != n {
            return Err(BlpError::dimension_mismatch(
                "cost shifter rows",
                n,
                cost_shifters.nrows(),
            ));
        }

        let demand_instruments = self
            .demand_instruments
            .unwrap_or_else(|| characteristics.clone());
        if demand_instruments.nrows() != n {
            return Err(BlpError::dimension_mismatch(
                "demand instrument rows",
                n,
                demand_instruments.nrows(),
            ));
        }

        let supply_instruments = self
            .supply_instruments
            .unwrap_or_else(|| cost_shifters.clone());
        if supply_instruments.nrows() != n {
            return Err(BlpError::dimension_mismatch(
                "supply instrument rows",
                n,
                supply_instruments.nrows(),
            ));
        }

        let partition = MarketPartition::new(&self.market_ids, &self.firm_ids, &self.shares)?;

        Ok(ProductData {
            market_ids: self.market_ids,
            firm_ids: self.firm_ids,
            shares: self.shares,
            prices: self.prices,
            characteristics,
            cost_shifters,
            demand_instruments,
            supply_instruments,
            partition,
        })
    }
}

/// Describes the markets contained in the product data, with each market's
/// products grouped by owning firm.
#[derive(Clone, Debug)]
pub struct MarketPartition {
    markets: Vec<MarketSegment>,
    product_to_market: Vec<usize>,
}

impl MarketPartition {
    /// Constructs a partition by scanning contiguous market identifiers and
    /// grouping each market's products by firm.
    fn new(market_ids: &[u32], firm_ids: &[u32], shares: &DVector<f64>) -> Result<Self> {
        let n = market_ids.len();
        let mut markets = Vec::new();
        let mut product_to_market = vec![0usize; n];
        let mut seen = HashSet::new();

        let mut start = 0usize;
        while start < n {
            let market_id = market_ids[start];
            if !seen.insert(market_id) {
                return Err(BlpError::NonContiguousMarket { market_id });
            }

            let mut end = start + 1;
            while end < n && market_ids[end] == market_id {
                end += 1;
            }

            let mut total_share = 0.0f64;
            let mut blocks: Vec<OwnershipBlock> = Vec::new();
            for product_idx in start..end {
                product_to_market[product_idx] = markets.len();
                total_share += shares[product_idx];

                let firm_id = firm_ids[product_idx];
                match blocks.iter_mut().find(|block| block.firm_id == firm_id) {
                    Some(block) => block.products.push(product_idx),
                    None => blocks.push(OwnershipBlock {
                        firm_id,
                        products: vec![product_idx],
                    }),
                }
            }
            let outside_share = 1.0 - total_share;
            if outside_share <= 0.0 {
                return Err(BlpError::NonPositiveOutsideShare {
                    market_id,
                    share: outside_share,
                });
            }

            markets.push(MarketSegment {
                market_id,
                start,
                end,
                outside_share,
                blocks,
            });
            start = end;
        }

        Ok(Self {
            markets,
            product_to_market,
        })
    }

    /// Returns the number of distinct markets.
    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    /// Iterates over market segments.
    pub fn markets(&self) -> impl Iterator<Item = &MarketSegment> {
        self.markets.iter()
    }

    /// Finds the index of the market containing `product_index`.
    pub fn market_of(&self, product_index: usize) -> usize {
        self.product_to_market[product_index]
    }
}

/// Metadata for a single market.
#[derive(Clone, Debug)]
pub struct MarketSegment {
    /// Identifier carried from the original data.
    market_id: u32,
    /// Start index (inclusive) of this market in the flattened product arrays.
    pub(crate) start: usize,
    /// End index (exclusive) of this market.
    pub(crate) end: usize,
    /// Observed outside option share: `1 - sum_j s_j`.
    pub outside_share: f64,
    /// Products grouped by owning firm. Cross-price effects exist only
    /// inside these groups.
    blocks: Vec<OwnershipBlock>,
}

impl MarketSegment {
    /// Returns the identifier of the market.
    pub fn id(&self) -> u32 {
        self.market_id
    }

    /// Returns the range of product indices that belong to this market.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.end
    }

    /// Number of products inside the market.
    pub fn product_count(&self) -> usize {
        self.end - self.start
    }

    /// Iterates over the firm ownership blocks of this market.
    pub fn ownership_blocks(&self) -> impl Iterator<Item = &OwnershipBlock> {
        self.blocks.iter()
    }
}

/// The products owned by one firm within one market.
#[derive(Clone, Debug)]
pub struct OwnershipBlock {
    firm_id: u32,
    products: Vec<usize>,
}

impl OwnershipBlock {
    /// Returns the identifier of the owning firm.
    pub fn firm_id(&self) -> u32 {
        self.firm_id
    }

    /// Product indices (into the flattened arrays) owned by this firm in
    /// this market.
    pub fn products(&self) -> &[usize] {
        &self.products
    }
}
