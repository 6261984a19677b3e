//! Per-tick CPM bid recommendation for marketplace ad campaigns.
//!
//! Once per scheduling tick, for each (product, ad-campaign) pair, this
//! crate turns historical order and ad statistics into a single recommended
//! CPM bid (or an explicit "no recommendation"):
//!
//! - [`stats::StatAggregator`] condenses raw order and cumulative hourly ad
//!   rows into per-pair margin aggregates and per-CPM history;
//! - [`margin_model::BidMarginModel`] maps target profit margins to
//!   achievable CPMs over a discretized grid;
//! - [`arms::ArmCatalog`] builds competing bid hypotheses from several
//!   heuristics;
//! - [`bandit`] pulls each hypothesis' Beta belief once and keeps the arm
//!   minimizing expected spend per order;
//! - [`orchestrator`] runs the pipeline per campaign over a batch and emits
//!   a full audit record alongside every decision.
//!
//! The core is synchronous, I/O-free and stateless across runs. Storage,
//! the conversion-rate model and bid submission are injected collaborators.

pub mod arms;
pub mod bandit;
pub mod campaigns;
pub mod errors;
pub mod margin_model;
pub mod orchestrator;
pub mod stats;

pub use arms::{ArmCatalog, BidCandidate};
pub use bandit::{ArmPullResult, SelectionOutcome};
pub use campaigns::{AdsCampaign, CampaignData, ConversionModel, CpmKey, CpmStats, Product};
pub use errors::BidderError;
pub use margin_model::{BidMarginModel, GridConfig, MarginPoint};
pub use orchestrator::{run_batch, run_batch_with_rng, AuditRecord, BidRecommendation};
pub use stats::{hour_of_week, AdRow, OrderRow, StatAggregator};
