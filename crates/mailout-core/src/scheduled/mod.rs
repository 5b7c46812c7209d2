//! Scheduled sending - Campaign lifecycle, business window, quotas and the send loop

mod manager;
mod quota;
mod scheduler;
mod window;

pub use manager::{ArmReport, ArmWarning, CampaignError, CampaignManager};
pub use quota::AccountQuotaTracker;
pub use scheduler::{select_campaigns, PassSummary, SendScheduler};
pub use window::BusinessWindowGate;
