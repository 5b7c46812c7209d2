//! Mailout Core - Campaign scheduling and delivery
//!
//! This crate provides the account rotation and sticky recipient assignment,
//! the business window and quota gates, the send scheduler with its delivery
//! outcome handling, operator notifications and the single-leader lock.

pub mod accounts;
pub mod delivery;
pub mod leader;
pub mod notify;
pub mod scheduled;

pub use accounts::{AccountRotationQueue, PendingPartition, RecipientAssignmentStore};
pub use delivery::{
    classify, DeliveryError, Envelope, OutcomePolicy, RecipientContext, RenderError,
    RenderedEmail, Renderer, SmtpTransport, StoredMessageRenderer, Transport,
};
pub use leader::{acquire_leadership, AdvisoryLeaderLock, LeaderLock, LocalLeaderLock};
pub use notify::{notifier_from_config, EmailNotifier, OperatorNotifier, TracingNotifier};
pub use scheduled::{
    AccountQuotaTracker, ArmReport, ArmWarning, BusinessWindowGate, CampaignError,
    CampaignManager, PassSummary, SendScheduler,
};
