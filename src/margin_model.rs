use serde::{Deserialize, Serialize};

use crate::campaigns::{ConversionModel, Product};
use crate::errors::BidderError;

/// One grid point: the margin achievable when bidding `cpm`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarginPoint {
    pub margin: f64,
    pub cpm: f64,
}

/// Discretization of the CPM search space.
#[derive(Debug, Clone)]
pub struct GridConfig {
    pub min_cpm: f64,
    pub max_cpm: f64,
    pub step: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            min_cpm: 0.0,
            max_cpm: 1000.0,
            step: 10.0,
        }
    }
}

/// Maps target profit margins to achievable CPM bids for one campaign.
///
/// For each CPM on the grid the achievable margin is
/// `1 - cost/price - cpm/(cr(cpm) * price)`. Points with a negative margin
/// are dropped (bidding there loses money); the survivors are kept sorted
/// ascending by margin so closest-margin lookups are a binary search.
pub struct BidMarginModel {
    /// Retained points, margin >= 0, ascending by margin.
    points: Vec<MarginPoint>,
    /// Every computable grid point, in grid order, kept for the audit record.
    raw_points: Vec<MarginPoint>,
}

impl BidMarginModel {
    pub fn build(
        campaign_id: u64,
        product: &Product,
        model: &dyn ConversionModel,
        grid: &GridConfig,
    ) -> Result<Self, BidderError> {
        if !product.price.is_finite() || product.price <= 0.0 {
            return Err(BidderError::Configuration {
                campaign_id,
                reason: format!(
                    "product {} has unusable price {}",
                    product.product_id, product.price
                ),
            });
        }
        if !grid.min_cpm.is_finite()
            || !grid.max_cpm.is_finite()
            || !grid.step.is_finite()
            || grid.step <= 0.0
            || grid.max_cpm < grid.min_cpm
        {
            return Err(BidderError::Configuration {
                campaign_id,
                reason: format!(
                    "unusable cpm grid [{}, {}] step {}",
                    grid.min_cpm, grid.max_cpm, grid.step
                ),
            });
        }

        let mut raw_points = Vec::new();
        // Floor, not round: a range that is not a whole multiple of the
        // step must never yield a grid point above the configured maximum.
        let steps = (((grid.max_cpm - grid.min_cpm) / grid.step) + 1e-9).floor() as i64;
        for i in 0..=steps {
            let cpm = grid.min_cpm + grid.step * i as f64;
            if let Some(margin) = achievable_margin(product, model, cpm) {
                raw_points.push(MarginPoint { margin, cpm });
            }
        }

        let mut points: Vec<MarginPoint> = raw_points
            .iter()
            .copied()
            .filter(|p| p.margin >= 0.0)
            .collect();
        points.sort_by(|a, b| a.margin.total_cmp(&b.margin));

        Ok(Self { points, raw_points })
    }

    /// Retained (margin, cpm) pairs, ascending by margin.
    pub fn points(&self) -> &[MarginPoint] {
        &self.points
    }

    /// The pre-filter grid, in grid order.
    pub fn raw_points(&self) -> &[MarginPoint] {
        &self.raw_points
    }

    /// The CPM whose achievable margin is closest to `target`.
    ///
    /// Below the lowest retained margin the lowest-margin CPM is returned,
    /// above the highest the highest-margin CPM; in between, the closer of
    /// the two neighbors, an exact tie going to the lower CPM. `None` means
    /// no grid point is profitable at all.
    pub fn find_closest_cpm(&self, target: f64) -> Option<f64> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.margin < target);
        if idx == 0 {
            return Some(self.points[0].cpm);
        }
        if idx == self.points.len() {
            return Some(self.points[self.points.len() - 1].cpm);
        }
        let left = self.points[idx - 1];
        let right = self.points[idx];
        let d_left = target - left.margin;
        let d_right = right.margin - target;
        if d_left < d_right {
            Some(left.cpm)
        } else if d_right < d_left {
            Some(right.cpm)
        } else {
            Some(left.cpm.min(right.cpm))
        }
    }
}

/// Margin achievable at one CPM, or `None` when the point is not computable
/// (a positive bid with a zero predicted conversion rate buys views that
/// never convert, so no margin exists there).
fn achievable_margin(product: &Product, model: &dyn ConversionModel, cpm: f64) -> Option<f64> {
    let ad_term = if cpm == 0.0 {
        // No spend, no ad cost, whatever the conversion rate is.
        0.0
    } else {
        let cr = model.conversion_rate(cpm);
        if cr <= 0.0 {
            return None;
        }
        cpm / (cr * product.price)
    };
    Some(1.0 - product.cost / product.price - ad_term)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Product {
        Product {
            product_id: 1,
            price: 1000.0,
            cost: 600.0,
        }
    }

    fn grid(max_cpm: f64, step: f64) -> GridConfig {
        GridConfig {
            min_cpm: 0.0,
            max_cpm,
            step,
        }
    }

    #[test]
    fn test_grid_retains_only_nonnegative_sorted_ascending() {
        let model = |cpm: f64| if cpm < 100.0 { 0.05 } else { 0.002 };
        let m = BidMarginModel::build(1, &product(), &model, &grid(300.0, 10.0)).unwrap();
        for p in m.points() {
            assert!(p.margin >= 0.0);
        }
        for w in m.points().windows(2) {
            assert!(w[0].margin <= w[1].margin);
        }
    }

    #[test]
    fn test_flat_conversion_scenario() {
        // price 1000, cost 600, cr = 0.05 everywhere, cpm in {0, 50, .., 300}:
        // margin = 0.4 - cpm/50, so only cpm = 0 survives the >= 0 filter.
        let model = |_cpm: f64| 0.05;
        let m = BidMarginModel::build(1, &product(), &model, &grid(300.0, 50.0)).unwrap();
        assert_eq!(m.raw_points().len(), 7);
        assert_eq!(m.points().len(), 1);
        assert_eq!(m.points()[0].cpm, 0.0);
        assert_eq!(m.points()[0].margin, 0.4);
        assert_eq!(m.find_closest_cpm(0.0), Some(0.0));
    }

    #[test]
    fn test_grid_never_exceeds_configured_maximum() {
        // 25 is not a whole multiple of the step; the grid must stop at 20
        // rather than overshoot to 30.
        let model = |_cpm: f64| 0.05;
        let m = BidMarginModel::build(1, &product(), &model, &grid(25.0, 10.0)).unwrap();
        for p in m.raw_points() {
            assert!(
                p.cpm <= 25.0,
                "grid point {} exceeds max_cpm 25",
                p.cpm
            );
        }
        let cpms: Vec<f64> = m.raw_points().iter().map(|p| p.cpm).collect();
        assert_eq!(cpms, vec![0.0, 10.0, 20.0]);
    }

    #[test]
    fn test_closest_cpm_clamps_at_both_ends() {
        let model = |cpm: f64| if cpm <= 10.0 { 0.05 } else { 0.5 };
        let m = BidMarginModel::build(1, &product(), &model, &grid(20.0, 10.0)).unwrap();
        // cpm 0 -> 0.4, cpm 10 -> 0.4 - 10/50 = 0.2, cpm 20 -> 0.4 - 20/500 = 0.36
        let lowest = m.points()[0];
        let highest = m.points()[m.points().len() - 1];
        assert_eq!(m.find_closest_cpm(-5.0), Some(lowest.cpm));
        assert_eq!(m.find_closest_cpm(5.0), Some(highest.cpm));
    }

    #[test]
    fn test_closest_cpm_exact_tie_prefers_lower_cpm() {
        // Margins 0.4 (cpm 0), 0.2 (cpm 10), 0.0 (cpm 20); target 0.1 sits
        // exactly between 0.0 and 0.2.
        let model = |_cpm: f64| 0.05;
        let m = BidMarginModel::build(1, &product(), &model, &grid(20.0, 10.0)).unwrap();
        assert_eq!(m.points().len(), 3);
        assert_eq!(m.find_closest_cpm(0.1), Some(10.0));
    }

    #[test]
    fn test_closest_cpm_is_idempotent() {
        let model = |_cpm: f64| 0.05;
        let m = BidMarginModel::build(1, &product(), &model, &grid(20.0, 10.0)).unwrap();
        let first = m.find_closest_cpm(0.15);
        for _ in 0..10 {
            assert_eq!(m.find_closest_cpm(0.15), first);
        }
    }

    #[test]
    fn test_empty_grid_is_surfaced_not_defaulted() {
        // cost above price: every margin is negative.
        let expensive = Product {
            product_id: 2,
            price: 100.0,
            cost: 150.0,
        };
        let model = |_cpm: f64| 0.05;
        let m = BidMarginModel::build(1, &expensive, &model, &grid(300.0, 50.0)).unwrap();
        assert!(m.points().is_empty());
        assert_eq!(m.find_closest_cpm(0.0), None);
    }

    #[test]
    fn test_zero_conversion_rate_excluded_except_free_bid() {
        let model = |_cpm: f64| 0.0;
        let m = BidMarginModel::build(1, &product(), &model, &grid(300.0, 50.0)).unwrap();
        // Only cpm = 0 is computable; it costs nothing.
        assert_eq!(m.raw_points().len(), 1);
        assert_eq!(m.raw_points()[0].cpm, 0.0);
    }

    #[test]
    fn test_nonpositive_price_is_configuration_error() {
        let broken = Product {
            product_id: 3,
            price: 0.0,
            cost: 10.0,
        };
        let model = |_cpm: f64| 0.05;
        let err = BidMarginModel::build(7, &broken, &model, &GridConfig::default());
        assert!(err.is_err());
    }
}
