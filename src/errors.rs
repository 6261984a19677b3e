use thiserror::Error;

/// Errors surfaced by the recommendation core.
///
/// Missing data is not an error here: zero denominators, empty margin grids
/// and absent aggregates flow through the data path as `None` and only ever
/// skip the affected candidate. `BidderError` covers the two cases that are
/// genuinely someone's fault.
#[derive(Debug, Error)]
pub enum BidderError {
    /// The caller handed over a batch with no campaigns at all.
    #[error("empty campaign batch")]
    EmptyBatch,

    /// Malformed campaign or product input, e.g. a non-positive price.
    /// Scoped to one campaign; siblings in the batch are unaffected.
    #[error("campaign {campaign_id}: {reason}")]
    Configuration { campaign_id: u64, reason: String },
}
