//! In-memory store
//!
//! Holds everything behind a single tokio mutex, so each trait method is
//! one critical section and therefore atomic like a database transaction.

use async_trait::async_trait;
use chrono::Utc;
use mailout_common::types::{
    AccountId, CampaignId, MessageRef, RecipientId, RecipientKey, UserId,
};
use mailout_common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::MailoutStore;
use crate::models::{
    prepend_report, CampaignProgress, CampaignStatus, DailyCounter, DeliverySuccess, MailingOut,
    MassMailMessage, NewMailingOut, NewSendingAccount, Recipient, RecipientAssignment,
    RecipientSet, RotationQueue, SendingAccount,
};

#[derive(Debug, Clone)]
struct StoredAssignment {
    account_id: Option<AccountId>,
    allow_mass_mail: bool,
    unsubscribe_token: Uuid,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_account_id: AccountId,
    next_campaign_id: CampaignId,
    accounts: BTreeMap<AccountId, SendingAccount>,
    queues: HashMap<UserId, RotationQueue>,
    recipients: HashMap<RecipientKey, Recipient>,
    assignments: HashMap<RecipientKey, StoredAssignment>,
    campaigns: BTreeMap<CampaignId, MailingOut>,
    progress: HashMap<CampaignId, CampaignProgress>,
    messages: HashMap<MessageRef, MassMailMessage>,
}

impl MemoryState {
    fn assignment_view(&self, key: RecipientKey) -> Option<RecipientAssignment> {
        let stored = self.assignments.get(&key)?;
        let account_owner = stored
            .account_id
            .and_then(|id| self.accounts.get(&id))
            .map(|account| account.owner_id);
        Some(RecipientAssignment {
            recipient: key,
            account_id: stored.account_id,
            account_owner,
            allow_mass_mail: stored.allow_mass_mail,
            unsubscribe_token: stored.unsubscribe_token,
        })
    }

    fn campaign_mut(&mut self, id: CampaignId) -> Result<&mut MailingOut> {
        self.campaigns
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Campaign {}", id)))
    }
}

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MailoutStore for MemoryStore {
    async fn create_account(&self, input: NewSendingAccount) -> Result<SendingAccount> {
        let mut state = self.state.lock().await;
        state.next_account_id += 1;
        let now = Utc::now();
        let account = SendingAccount {
            id: state.next_account_id,
            owner_id: input.owner_id,
            from_address: input.from_address,
            from_name: input.from_name,
            smtp_host: input.smtp_host,
            smtp_port: input.smtp_port,
            smtp_username: input.smtp_username,
            smtp_password: input.smtp_password,
            use_starttls: input.use_starttls,
            allow_mass_mail: input.allow_mass_mail,
            is_primary: input.is_primary,
            quota: DailyCounter::default(),
            report: String::new(),
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<SendingAccount>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn list_owner_accounts(&self, owner: UserId) -> Result<Vec<SendingAccount>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<_> = state
            .accounts
            .values()
            .filter(|account| account.owner_id == owner)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| (!account.is_primary, account.id));
        Ok(accounts)
    }

    async fn transfer_account(&self, id: AccountId, new_owner: UserId) -> Result<Option<UserId>> {
        let mut state = self.state.lock().await;
        let Some(account) = state.accounts.get_mut(&id) else {
            return Ok(None);
        };
        let previous = account.owner_id;
        account.owner_id = new_owner;
        account.updated_at = Utc::now();
        let allowed = account.allow_mass_mail;

        if let Some(queue) = state.queues.get_mut(&previous) {
            queue.remove(id);
        }
        if allowed {
            state.queues.entry(new_owner).or_default().add(id);
        }
        Ok(Some(previous))
    }

    async fn set_account_mass_mail(&self, id: AccountId, allowed: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.accounts.get_mut(&id) {
            Some(account) => {
                account.allow_mass_mail = allowed;
                account.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.accounts.remove(&id).is_none() {
            return Ok(false);
        }
        for queue in state.queues.values_mut() {
            queue.remove(id);
        }
        for assignment in state.assignments.values_mut() {
            if assignment.account_id == Some(id) {
                assignment.account_id = None;
            }
        }
        Ok(true)
    }

    async fn rotation_next(&self, owner: UserId) -> Result<Option<AccountId>> {
        let mut state = self.state.lock().await;
        Ok(state.queues.get_mut(&owner).and_then(RotationQueue::next))
    }

    async fn rotation_add(&self, owner: UserId, account: AccountId) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.queues.entry(owner).or_default().add(account))
    }

    async fn rotation_remove(&self, owner: UserId, account: AccountId) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .queues
            .get_mut(&owner)
            .map(|queue| queue.remove(account))
            .unwrap_or(false))
    }

    async fn rotation_snapshot(&self, owner: UserId) -> Result<Vec<AccountId>> {
        let state = self.state.lock().await;
        Ok(state
            .queues
            .get(&owner)
            .map(RotationQueue::to_vec)
            .unwrap_or_default())
    }

    async fn upsert_recipient(&self, recipient: Recipient) -> Result<()> {
        let mut state = self.state.lock().await;
        state.recipients.insert(recipient.key(), recipient);
        Ok(())
    }

    async fn get_recipient(&self, key: RecipientKey) -> Result<Option<Recipient>> {
        Ok(self.state.lock().await.recipients.get(&key).cloned())
    }

    async fn delete_recipient(&self, key: RecipientKey) -> Result<bool> {
        Ok(self.state.lock().await.recipients.remove(&key).is_some())
    }

    async fn get_assignment(&self, key: RecipientKey) -> Result<Option<RecipientAssignment>> {
        Ok(self.state.lock().await.assignment_view(key))
    }

    async fn assign_recipient(
        &self,
        key: RecipientKey,
        account: AccountId,
    ) -> Result<RecipientAssignment> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&account) {
            return Err(Error::NotFound(format!("Sending account {}", account)));
        }
        state
            .assignments
            .entry(key)
            .and_modify(|stored| stored.account_id = Some(account))
            .or_insert_with(|| StoredAssignment {
                account_id: Some(account),
                allow_mass_mail: true,
                unsubscribe_token: Uuid::new_v4(),
            });
        state
            .assignment_view(key)
            .ok_or_else(|| Error::Internal(format!("Assignment for {} vanished", key)))
    }

    async fn unsubscribe(&self, token: Uuid) -> Result<Option<RecipientKey>> {
        let mut state = self.state.lock().await;
        let Some(key) = state
            .assignments
            .iter()
            .find(|(_, stored)| stored.unsubscribe_token == token)
            .map(|(key, _)| *key)
        else {
            return Ok(None);
        };
        if let Some(stored) = state.assignments.get_mut(&key) {
            stored.allow_mass_mail = false;
        }
        if let Some(recipient) = state.recipients.get_mut(&key) {
            recipient.set_allow_mass_mail(false);
        }
        Ok(Some(key))
    }

    async fn create_campaign(&self, input: NewMailingOut) -> Result<MailingOut> {
        let mut state = self.state.lock().await;
        state.next_campaign_id += 1;
        let progress = CampaignProgress::from_snapshot(input.recipient_ids);
        let now = Utc::now();
        let campaign = MailingOut {
            id: state.next_campaign_id,
            owner_id: input.owner_id,
            message_ref: input.message_ref,
            recipient_kind: input.recipient_kind,
            status: CampaignStatus::Paused,
            recipients_number: progress.total() as i32,
            today: DailyCounter::default(),
            report: String::new(),
            created_at: now,
            updated_at: now,
        };
        state.campaigns.insert(campaign.id, campaign.clone());
        state.progress.insert(campaign.id, progress);
        Ok(campaign)
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<MailingOut>> {
        Ok(self.state.lock().await.campaigns.get(&id).cloned())
    }

    async fn list_campaigns_by_status(
        &self,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<MailingOut>> {
        let state = self.state.lock().await;
        Ok(state
            .campaigns
            .values()
            .filter(|campaign| statuses.contains(&campaign.status))
            .cloned()
            .collect())
    }

    async fn load_progress(&self, id: CampaignId) -> Result<CampaignProgress> {
        let state = self.state.lock().await;
        state
            .progress
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Campaign {}", id)))
    }

    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        report_line: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        campaign.status = status;
        if let Some(line) = report_line {
            prepend_report(&mut campaign.report, line);
        }
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_campaign_report(&self, id: CampaignId, line: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(campaign) = state.campaigns.get_mut(&id) else {
            return Ok(false);
        };
        prepend_report(&mut campaign.report, line);
        campaign.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_success(&self, success: &DeliverySuccess) -> Result<bool> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&success.account_id) {
            return Err(Error::NotFound(format!("Sending account {}", success.account_id)));
        }
        state.campaign_mut(success.campaign_id)?;

        let moved = state
            .progress
            .get_mut(&success.campaign_id)
            .map(|progress| progress.mark_succeeded(success.recipient_id))
            .unwrap_or(false);
        if !moved {
            return Ok(false);
        }

        let now = Utc::now();
        if let Some(account) = state.accounts.get_mut(&success.account_id) {
            account.quota.record(success.today);
            account.updated_at = now;
        }
        let campaign = state.campaign_mut(success.campaign_id)?;
        campaign.today.record(success.today);
        campaign.updated_at = now;
        Ok(true)
    }

    async fn record_failure(
        &self,
        campaign: CampaignId,
        recipient: RecipientId,
        report_line: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.campaign_mut(campaign)?;
        let moved = state
            .progress
            .get_mut(&campaign)
            .map(|progress| progress.mark_failed(recipient))
            .unwrap_or(false);
        if !moved {
            return Ok(false);
        }

        let record = state.campaign_mut(campaign)?;
        if record.status.is_sendable() {
            record.status = CampaignStatus::ActiveWithError;
        }
        prepend_report(&mut record.report, report_line);
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn drop_recipient(&self, campaign: CampaignId, recipient: RecipientId) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.campaign_mut(campaign)?;
        let dropped = state
            .progress
            .get_mut(&campaign)
            .map(|progress| progress.drop_pending(recipient))
            .unwrap_or(false);
        if dropped {
            let record = state.campaign_mut(campaign)?;
            record.recipients_number -= 1;
            record.updated_at = Utc::now();
        }
        Ok(dropped)
    }

    async fn suspend_account(
        &self,
        account: AccountId,
        campaign: CampaignId,
        report_line: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let Some(record) = state.accounts.get_mut(&account) else {
            return Ok(false);
        };
        record.allow_mass_mail = false;
        prepend_report(&mut record.report, report_line);
        record.updated_at = now;
        let owner = record.owner_id;

        if let Some(queue) = state.queues.get_mut(&owner) {
            queue.remove(account);
        }
        if let Some(campaign) = state.campaigns.get_mut(&campaign) {
            prepend_report(&mut campaign.report, report_line);
            campaign.updated_at = now;
        }
        Ok(true)
    }

    async fn retry_failed(&self, campaign: CampaignId) -> Result<usize> {
        let mut state = self.state.lock().await;
        state
            .progress
            .get_mut(&campaign)
            .map(CampaignProgress::retry_failed)
            .ok_or_else(|| Error::NotFound(format!("Campaign {}", campaign)))
    }

    async fn exclude_delivered(&self, campaign: CampaignId) -> Result<usize> {
        let mut state = self.state.lock().await;
        let target = state.campaign_mut(campaign)?.clone();

        let delivered: RecipientSet = state
            .campaigns
            .values()
            .filter(|other| {
                other.id != target.id
                    && other.message_ref == target.message_ref
                    && other.recipient_kind == target.recipient_kind
            })
            .filter_map(|other| state.progress.get(&other.id))
            .flat_map(|progress| progress.succeeded.iter())
            .collect();

        let removed = state
            .progress
            .get_mut(&campaign)
            .map(|progress| progress.exclude(&delivered))
            .unwrap_or(0);
        if removed > 0 {
            let record = state.campaign_mut(campaign)?;
            record.recipients_number -= removed as i32;
            record.updated_at = Utc::now();
        }
        Ok(removed)
    }

    async fn get_message(&self, id: MessageRef) -> Result<Option<MassMailMessage>> {
        Ok(self.state.lock().await.messages.get(&id).cloned())
    }

    async fn put_message(&self, message: MassMailMessage) -> Result<()> {
        self.state.lock().await.messages.insert(message.id, message);
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
