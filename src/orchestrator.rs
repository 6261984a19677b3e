use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::arms::{ArmCatalog, BidCandidate};
use crate::bandit::{self, ArmPullResult, SkippedPull};
use crate::campaigns::AdsCampaign;
use crate::errors::BidderError;
use crate::margin_model::{BidMarginModel, GridConfig, MarginPoint};

/// Full state of one candidate as it entered selection.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateAudit {
    pub name: String,
    pub cpm: f64,
    pub conversion_rate: f64,
    pub views: f64,
    pub alpha: f64,
    pub beta: f64,
    pub historical: bool,
    pub info: String,
}

impl From<&BidCandidate> for CandidateAudit {
    fn from(candidate: &BidCandidate) -> Self {
        let (alpha, beta) = candidate.beta_params();
        Self {
            name: candidate.name().to_string(),
            cpm: candidate.cpm(),
            conversion_rate: candidate.conversion_rate(),
            views: candidate.views(),
            alpha,
            beta,
            historical: candidate.is_historical(),
            info: candidate.info().to_string(),
        }
    }
}

/// Everything needed to replay one campaign's decision: candidates, draws,
/// the winner and the margin grid before and after the profitability
/// filter. Produced for every campaign, failed ones included.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditRecord {
    pub product_id: u64,
    pub campaign_id: u64,
    pub candidates: Vec<CandidateAudit>,
    pub pulls: Vec<ArmPullResult>,
    pub skipped_pulls: Vec<SkippedPull>,
    pub winner: Option<ArmPullResult>,
    pub margin_grid: Vec<MarginPoint>,
    pub margin_grid_raw: Vec<MarginPoint>,
    /// A per-campaign computation failure. `None` together with a missing
    /// CPM means "no recommendation", a legitimate terminal outcome.
    pub failure: Option<String>,
}

/// The per-campaign output: a chosen CPM or none, plus the audit record.
#[derive(Debug, Serialize)]
pub struct BidRecommendation {
    pub product_id: u64,
    pub campaign_id: u64,
    pub cpm: Option<f64>,
    pub audit: AuditRecord,
}

/// Recommend a bid for every campaign in the batch. A batch of N campaigns
/// always produces N results; only a structurally empty batch is refused.
pub fn run_batch(
    campaigns: &[AdsCampaign],
    grid: &GridConfig,
) -> Result<Vec<BidRecommendation>, BidderError> {
    run_batch_with_rng(campaigns, grid, &mut rand::thread_rng())
}

/// `run_batch` with an injected randomness source, for reproducible runs.
pub fn run_batch_with_rng(
    campaigns: &[AdsCampaign],
    grid: &GridConfig,
    rng: &mut impl Rng,
) -> Result<Vec<BidRecommendation>, BidderError> {
    if campaigns.is_empty() {
        return Err(BidderError::EmptyBatch);
    }
    Ok(campaigns
        .iter()
        .map(|campaign| recommend(campaign, grid, rng))
        .collect())
}

/// One campaign's decision. Never panics and never propagates: whatever
/// goes wrong lands in the audit record's failure field.
pub fn recommend(campaign: &AdsCampaign, grid: &GridConfig, rng: &mut impl Rng) -> BidRecommendation {
    let mut audit = AuditRecord {
        product_id: campaign.product_id,
        campaign_id: campaign.campaign_id,
        ..Default::default()
    };

    let model = match BidMarginModel::build(
        campaign.campaign_id,
        &campaign.product,
        campaign.conversion_model.as_ref(),
        grid,
    ) {
        Ok(model) => model,
        Err(err) => {
            warn!(campaign_id = campaign.campaign_id, error = %err, "campaign skipped");
            audit.failure = Some(err.to_string());
            return BidRecommendation {
                product_id: campaign.product_id,
                campaign_id: campaign.campaign_id,
                cpm: None,
                audit,
            };
        }
    };
    audit.margin_grid = model.points().to_vec();
    audit.margin_grid_raw = model.raw_points().to_vec();

    let catalog = ArmCatalog::build(campaign, &model);
    audit.candidates = catalog.candidates().map(CandidateAudit::from).collect();

    let outcome = bandit::select(&catalog, rng);
    audit.pulls = outcome.pulls;
    audit.skipped_pulls = outcome.skipped;
    audit.winner = outcome.winner.clone();

    let cpm = outcome.winner.map(|pull| pull.cpm);
    info!(
        campaign_id = campaign.campaign_id,
        product_id = campaign.product_id,
        cpm = ?cpm,
        candidates = audit.candidates.len(),
        "bid recommendation"
    );
    BidRecommendation {
        product_id: campaign.product_id,
        campaign_id: campaign.campaign_id,
        cpm,
        audit,
    }
}
