//! Campaign Manager - Operator controls over the campaign lifecycle

use crate::accounts::AccountRotationQueue;
use chrono::Utc;
use mailout_common::types::CampaignId;
use mailout_storage::{
    report_line, CampaignProgress, CampaignStatus, MailingOut, MailoutStore, NewMailingOut,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Campaign manager errors
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("Campaign {0} not found")]
    NotFound(CampaignId),

    #[error("Campaign {0} is already active")]
    AlreadyActive(CampaignId),

    #[error("Campaign has no recipients")]
    EmptySnapshot,

    #[error("Storage error: {0}")]
    Storage(#[from] mailout_common::Error),
}

/// Configuration problems found when arming; the campaign arms anyway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmWarning {
    /// The owner has no account allowed to send mass mail
    NoUsableAccount,
    /// Unsubscribing recipients will not be redirected anywhere
    NoUnsubscribeRedirect,
}

impl std::fmt::Display for ArmWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArmWarning::NoUsableAccount => write!(f, "owner has no account allowed to send mass mail"),
            ArmWarning::NoUnsubscribeRedirect => write!(f, "no unsubscribe redirect url configured"),
        }
    }
}

/// Result of arming a campaign
#[derive(Debug, Clone)]
pub struct ArmReport {
    pub campaign: MailingOut,
    pub warnings: Vec<ArmWarning>,
}

/// Campaign Manager - create, arm, pause, interrupt and repair campaigns
pub struct CampaignManager {
    store: Arc<dyn MailoutStore>,
    rotation: AccountRotationQueue,
    redirect_configured: bool,
}

impl CampaignManager {
    pub fn new(
        store: Arc<dyn MailoutStore>,
        rotation: AccountRotationQueue,
        redirect_configured: bool,
    ) -> Self {
        Self {
            store,
            rotation,
            redirect_configured,
        }
    }

    /// Create a paused campaign over a recipient snapshot
    pub async fn create(&self, input: NewMailingOut) -> Result<MailingOut, CampaignError> {
        if input.recipient_ids.is_empty() {
            return Err(CampaignError::EmptySnapshot);
        }
        let campaign = self.store.create_campaign(input).await?;
        info!(
            campaign_id = campaign.id,
            owner_id = campaign.owner_id,
            kind = %campaign.recipient_kind,
            recipients = campaign.recipients_number,
            "Campaign created"
        );
        Ok(campaign)
    }

    async fn load(&self, id: CampaignId) -> Result<MailingOut, CampaignError> {
        self.store
            .get_campaign(id)
            .await?
            .ok_or(CampaignError::NotFound(id))
    }

    async fn transition(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        message: &str,
    ) -> Result<MailingOut, CampaignError> {
        let line = report_line(Utc::now(), message);
        if !self.store.set_campaign_status(id, status, Some(&line)).await? {
            return Err(CampaignError::NotFound(id));
        }
        self.load(id).await
    }

    /// Make a campaign eligible for the scheduler
    pub async fn arm(&self, id: CampaignId) -> Result<ArmReport, CampaignError> {
        let campaign = self.load(id).await?;
        if campaign.status.is_sendable() {
            return Err(CampaignError::AlreadyActive(id));
        }

        let mut warnings = Vec::new();
        if self.rotation.sync_owner(campaign.owner_id).await? == 0 {
            warnings.push(ArmWarning::NoUsableAccount);
        }
        if !self.redirect_configured {
            warnings.push(ArmWarning::NoUnsubscribeRedirect);
        }
        for warning in &warnings {
            warn!(campaign_id = id, owner_id = campaign.owner_id, %warning, "Arming with warning");
        }

        let campaign = self
            .transition(id, CampaignStatus::Active, "Campaign armed")
            .await?;
        info!(campaign_id = id, warnings = warnings.len(), "Campaign armed");
        Ok(ArmReport { campaign, warnings })
    }

    /// Stop picking the campaign up; observed at the next pass
    pub async fn pause(&self, id: CampaignId) -> Result<MailingOut, CampaignError> {
        let campaign = self.transition(id, CampaignStatus::Paused, "Campaign paused").await?;
        info!(campaign_id = id, "Campaign paused");
        Ok(campaign)
    }

    pub async fn interrupt(&self, id: CampaignId, reason: &str) -> Result<MailingOut, CampaignError> {
        let campaign = self
            .transition(id, CampaignStatus::Interrupted, &format!("Interrupted: {}", reason))
            .await?;
        warn!(campaign_id = id, reason, "Campaign interrupted");
        Ok(campaign)
    }

    /// Move every failed recipient back to pending. The status is left
    /// alone; the campaign has to be armed again to resume.
    pub async fn retry_failed(&self, id: CampaignId) -> Result<usize, CampaignError> {
        self.load(id).await?;
        let moved = self.store.retry_failed(id).await?;
        if moved > 0 {
            let line = report_line(Utc::now(), &format!("{} failed recipients queued again", moved));
            self.store.append_campaign_report(id, &line).await?;
        }
        info!(campaign_id = id, moved, "Failed recipients retried");
        Ok(moved)
    }

    /// Drop pending recipients already reached by another campaign of the
    /// same message
    pub async fn exclude_delivered(&self, id: CampaignId) -> Result<usize, CampaignError> {
        self.load(id).await?;
        let excluded = self.store.exclude_delivered(id).await?;
        if excluded > 0 {
            let line = report_line(
                Utc::now(),
                &format!("{} recipients already reached by this message excluded", excluded),
            );
            self.store.append_campaign_report(id, &line).await?;
        }
        info!(campaign_id = id, excluded, "Delivered recipients excluded");
        Ok(excluded)
    }

    pub async fn progress(&self, id: CampaignId) -> Result<CampaignProgress, CampaignError> {
        self.load(id).await?;
        Ok(self.store.load_progress(id).await?)
    }
}
