use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CPM quantized to hundredths of a currency unit, used wherever a CPM acts
/// as a map key. Raw f64 values are never compared for key equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CpmKey(i64);

impl CpmKey {
    pub fn from_cpm(cpm: f64) -> Self {
        Self((cpm * 100.0).round() as i64)
    }

    pub fn as_cpm(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

/// Observed performance at one rounded CPM for one (campaign, hour-of-week)
/// pair: summed counters, the mean margin seen at that CPM, and a 95% Wilson
/// interval on the view-to-order rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpmStats {
    pub views: f64,
    pub clicks: f64,
    pub carts: f64,
    pub orders: f64,
    pub avg_margin: f64,
    pub order_rate_low: f64,
    pub order_rate_high: f64,
}

impl CpmStats {
    /// View-to-order conversion rate. Rows only enter the table with
    /// `views > 0`, so the division is safe.
    pub fn order_rate(&self) -> f64 {
        self.orders / self.views
    }
}

/// Aggregate bundle for one (campaign, hour-of-week) pair.
///
/// Any field may be legitimately absent. Absence is `None` (or an empty
/// table), never zero: a pair without history must not look like a pair
/// with zero margin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignData {
    /// Mean margin for this exact pair.
    pub avg_margin: Option<f64>,
    /// Max margin for this exact pair.
    pub max_margin: Option<f64>,
    /// Observed per-CPM performance for this exact pair.
    pub cpm_stats: BTreeMap<CpmKey, CpmStats>,
    /// Mean margin across all campaigns at this hour-of-week.
    pub hourly_avg_margin: Option<f64>,
    /// Max margin across all campaigns at this hour-of-week.
    pub hourly_max_margin: Option<f64>,
    /// All-time mean margin across everything.
    pub overall_avg_margin: Option<f64>,
}

/// Per-run snapshot of a product: sale price and fee-inclusive cost per
/// unit, both built by the stat aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_id: u64,
    pub price: f64,
    pub cost: f64,
}

/// Predictive model mapping a CPM to an expected conversion rate in [0, 1].
/// Supplied externally per campaign; this crate never trains one.
pub trait ConversionModel {
    fn conversion_rate(&self, cpm: f64) -> f64;
}

impl<F> ConversionModel for F
where
    F: Fn(f64) -> f64,
{
    fn conversion_rate(&self, cpm: f64) -> f64 {
        self(cpm)
    }
}

/// One (product, ad-campaign) pair as the decision engine sees it for a
/// single run: the product snapshot, the aggregate bundle for the current
/// hour-of-week, and the injected conversion model.
pub struct AdsCampaign {
    pub product_id: u64,
    pub campaign_id: u64,
    pub product: Product,
    pub data: CampaignData,
    pub conversion_model: Box<dyn ConversionModel>,
}
