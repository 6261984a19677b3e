use serde::Serialize;
use std::collections::BTreeMap;

use crate::campaigns::{AdsCampaign, CpmKey};
use crate::margin_model::BidMarginModel;

/// A historical candidate must be backed by at least this many views.
pub const HISTORICAL_MIN_VIEWS: f64 = 100.0;

/// Effective sample size for a margin-derived candidate whose CPM has no
/// observed history to borrow from.
pub const DEFAULT_PRIOR_VIEWS: f64 = 1000.0;

/// The "+2 points" offset applied on top of every base margin target.
pub const MARGIN_STEP_UP: f64 = 0.02;

/// One bidding hypothesis. `Historical` carries a rate and sample size read
/// directly off observed performance at its CPM; `MarginDerived` carries the
/// predictive model's rate at a CPM resolved from a margin target.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BidCandidate {
    Historical {
        name: String,
        cpm: f64,
        conversion_rate: f64,
        views: f64,
        info: String,
    },
    MarginDerived {
        name: String,
        cpm: f64,
        conversion_rate: f64,
        views: f64,
        info: String,
    },
}

impl BidCandidate {
    /// Historical candidates are only valid with strictly positive rate and
    /// sample size; aggregates that cannot honor that produce no candidate.
    pub fn historical(
        name: &str,
        cpm: f64,
        conversion_rate: f64,
        views: f64,
        info: String,
    ) -> Option<Self> {
        if conversion_rate > 0.0 && views > 0.0 {
            Some(Self::Historical {
                name: name.to_string(),
                cpm,
                conversion_rate,
                views,
                info,
            })
        } else {
            None
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Historical { name, .. } | Self::MarginDerived { name, .. } => name,
        }
    }

    pub fn cpm(&self) -> f64 {
        match self {
            Self::Historical { cpm, .. } | Self::MarginDerived { cpm, .. } => *cpm,
        }
    }

    pub fn conversion_rate(&self) -> f64 {
        match self {
            Self::Historical {
                conversion_rate, ..
            }
            | Self::MarginDerived {
                conversion_rate, ..
            } => *conversion_rate,
        }
    }

    pub fn views(&self) -> f64 {
        match self {
            Self::Historical { views, .. } | Self::MarginDerived { views, .. } => *views,
        }
    }

    pub fn info(&self) -> &str {
        match self {
            Self::Historical { info, .. } | Self::MarginDerived { info, .. } => info,
        }
    }

    pub fn is_historical(&self) -> bool {
        matches!(self, Self::Historical { .. })
    }

    /// Beta belief parameters: alpha = rate * views, beta = (1 - rate) * views.
    pub fn beta_params(&self) -> (f64, f64) {
        let rate = self.conversion_rate();
        let views = self.views();
        (rate * views, (1.0 - rate) * views)
    }
}

/// The bid candidates for one campaign, grouped by quantized CPM.
/// Candidates that land on the same CPM stay side by side in one group;
/// they are never numerically merged. Rebuilt fresh every run.
pub struct ArmCatalog {
    pub groups: BTreeMap<CpmKey, Vec<BidCandidate>>,
}

impl ArmCatalog {
    /// Assemble the catalog from every heuristic that has its inputs.
    /// Sources with missing data are skipped one by one; a fully empty
    /// catalog is a legitimate result.
    pub fn build(campaign: &AdsCampaign, model: &BidMarginModel) -> Self {
        let mut catalog = Self {
            groups: BTreeMap::new(),
        };
        let data = &campaign.data;

        // Best observed row: orders > 0 and enough views to trust the rate.
        let mut best: Option<(CpmKey, f64, f64, f64)> = None; // (key, margin, rate, views)
        for (key, row) in &data.cpm_stats {
            if row.orders > 0.0 && row.views >= HISTORICAL_MIN_VIEWS {
                let better = match best {
                    None => true,
                    Some((_, margin, _, _)) => row.avg_margin > margin,
                };
                if better {
                    best = Some((*key, row.avg_margin, row.order_rate(), row.views));
                }
            }
        }
        if let Some((key, margin, rate, views)) = best {
            if let Some(candidate) = BidCandidate::historical(
                "historical",
                key.as_cpm(),
                rate,
                views,
                format!("best observed margin {:.4}", margin),
            ) {
                catalog.push(candidate);
            }
            catalog.try_margin_target(campaign, model, "historical_p02", margin + MARGIN_STEP_UP);
        }

        // Breakeven exploration, once the pair has observations of its own.
        if !data.cpm_stats.is_empty() {
            catalog.try_margin_target(campaign, model, "zero_margin", 0.0);
            catalog.try_margin_target(campaign, model, "zero_margin_p02", MARGIN_STEP_UP);
        }

        // Cross-campaign seasonality, falling back to the all-time mean.
        if let Some(margin) = data.hourly_avg_margin {
            catalog.try_margin_target(campaign, model, "hourly_avg_margin", margin);
            catalog.try_margin_target(
                campaign,
                model,
                "hourly_avg_margin_p02",
                margin + MARGIN_STEP_UP,
            );
        } else if let Some(margin) = data.overall_avg_margin {
            catalog.try_margin_target(campaign, model, "overall_avg_margin", margin);
            catalog.try_margin_target(
                campaign,
                model,
                "overall_avg_margin_p02",
                margin + MARGIN_STEP_UP,
            );
        }

        // The pair's own seasonality.
        if let Some(margin) = data.avg_margin {
            if margin > 0.0 {
                catalog.try_margin_target(campaign, model, "campaign_avg_margin", margin);
                catalog.try_margin_target(
                    campaign,
                    model,
                    "campaign_avg_margin_p02",
                    margin + MARGIN_STEP_UP,
                );
            }
        }
        if let Some(margin) = data.max_margin {
            if margin > 0.0 {
                catalog.try_margin_target(campaign, model, "campaign_max_margin", margin);
                catalog.try_margin_target(
                    campaign,
                    model,
                    "campaign_max_margin_p02",
                    margin + MARGIN_STEP_UP,
                );
            }
        }

        catalog
    }

    /// Resolve one margin target into a candidate: closest achievable CPM,
    /// sample size borrowed from the pair's history at that CPM when there
    /// is any, rate from the predictive model.
    fn try_margin_target(
        &mut self,
        campaign: &AdsCampaign,
        model: &BidMarginModel,
        name: &str,
        target: f64,
    ) {
        let Some(cpm) = model.find_closest_cpm(target) else {
            return;
        };
        // The history table is keyed by integer-rounded CPM; a fractional
        // grid CPM has to be rounded the same way or the lookup never hits.
        let key = CpmKey::from_cpm(cpm.round());
        let views = campaign
            .data
            .cpm_stats
            .get(&key)
            .map(|row| row.views)
            .filter(|v| *v > 0.0)
            .unwrap_or(DEFAULT_PRIOR_VIEWS);
        let rate = campaign.conversion_model.conversion_rate(cpm);
        self.push(BidCandidate::MarginDerived {
            name: name.to_string(),
            cpm,
            conversion_rate: rate,
            views,
            info: format!("target margin {:.4}", target),
        });
    }

    fn push(&mut self, candidate: BidCandidate) {
        self.groups
            .entry(CpmKey::from_cpm(candidate.cpm()))
            .or_default()
            .push(candidate);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// All candidates, in CPM-group order.
    pub fn candidates(&self) -> impl Iterator<Item = &BidCandidate> {
        self.groups.values().flatten()
    }
}
