//! Repository layer for data access
//!
//! `MailoutStore` is the transactional boundary of the scheduler: every
//! method that mutates more than one record commits all of its writes or
//! none of them.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use mailout_common::types::{AccountId, CampaignId, MessageRef, RecipientId, RecipientKey, UserId};
use mailout_common::Result;
use uuid::Uuid;

use crate::models::{
    CampaignProgress, CampaignStatus, DeliverySuccess, MailingOut, MassMailMessage,
    NewMailingOut, NewSendingAccount, Recipient, RecipientAssignment, SendingAccount,
};

pub use memory::MemoryStore;
pub use postgres::PgMailoutStore;

/// Store trait consumed by the scheduler, the operator controls and the API
#[async_trait]
pub trait MailoutStore: Send + Sync {
    // ------------------------------------------------------------------
    // Sending accounts
    // ------------------------------------------------------------------

    async fn create_account(&self, input: NewSendingAccount) -> Result<SendingAccount>;
    async fn get_account(&self, id: AccountId) -> Result<Option<SendingAccount>>;
    /// Accounts of an owner, primary account first, then by id
    async fn list_owner_accounts(&self, owner: UserId) -> Result<Vec<SendingAccount>>;
    /// Hand an account to another owner, moving it between rotation queues.
    /// Returns the previous owner, or None if the account does not exist.
    async fn transfer_account(&self, id: AccountId, new_owner: UserId) -> Result<Option<UserId>>;
    async fn set_account_mass_mail(&self, id: AccountId, allowed: bool) -> Result<bool>;
    /// Delete an account, purge it from every rotation queue and clear every
    /// assignment pointing at it
    async fn delete_account(&self, id: AccountId) -> Result<bool>;

    // ------------------------------------------------------------------
    // Rotation queues
    // ------------------------------------------------------------------

    /// Pop the head of the owner's queue and re-append it at the tail
    async fn rotation_next(&self, owner: UserId) -> Result<Option<AccountId>>;
    async fn rotation_add(&self, owner: UserId, account: AccountId) -> Result<bool>;
    async fn rotation_remove(&self, owner: UserId, account: AccountId) -> Result<bool>;
    async fn rotation_snapshot(&self, owner: UserId) -> Result<Vec<AccountId>>;

    // ------------------------------------------------------------------
    // Recipients and assignments
    // ------------------------------------------------------------------

    async fn upsert_recipient(&self, recipient: Recipient) -> Result<()>;
    async fn get_recipient(&self, key: RecipientKey) -> Result<Option<Recipient>>;
    async fn delete_recipient(&self, key: RecipientKey) -> Result<bool>;
    async fn get_assignment(&self, key: RecipientKey) -> Result<Option<RecipientAssignment>>;
    /// Point a recipient at an account. An existing assignment keeps its
    /// unsubscribe token and flag.
    async fn assign_recipient(
        &self,
        key: RecipientKey,
        account: AccountId,
    ) -> Result<RecipientAssignment>;
    /// Clear the mass-mail flag of the assignment holding `token` and of its
    /// recipient record
    async fn unsubscribe(&self, token: Uuid) -> Result<Option<RecipientKey>>;

    // ------------------------------------------------------------------
    // Campaigns
    // ------------------------------------------------------------------

    /// Create a paused campaign over a deduplicated recipient snapshot
    async fn create_campaign(&self, input: NewMailingOut) -> Result<MailingOut>;
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<MailingOut>>;
    async fn list_campaigns_by_status(&self, statuses: &[CampaignStatus])
        -> Result<Vec<MailingOut>>;
    async fn load_progress(&self, id: CampaignId) -> Result<CampaignProgress>;
    /// Set the status and optionally prepend a report line
    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        report_line: Option<&str>,
    ) -> Result<bool>;
    async fn append_campaign_report(&self, id: CampaignId, line: &str) -> Result<bool>;
    /// Pending -> Succeeded plus both daily counters, in one transaction.
    /// Returns false (and changes nothing) when the recipient was not pending.
    async fn record_success(&self, success: &DeliverySuccess) -> Result<bool>;
    /// Pending -> Failed, flag the campaign ActiveWithError if it is still
    /// active and prepend a report line
    async fn record_failure(
        &self,
        campaign: CampaignId,
        recipient: RecipientId,
        report_line: &str,
    ) -> Result<bool>;
    /// Remove a pending recipient from the campaign altogether
    async fn drop_recipient(&self, campaign: CampaignId, recipient: RecipientId) -> Result<bool>;
    /// Disable an account for mass mail, take it out of its owner's rotation
    /// and log the event on both the account and the campaign
    async fn suspend_account(
        &self,
        account: AccountId,
        campaign: CampaignId,
        report_line: &str,
    ) -> Result<bool>;
    /// Failed -> Pending; returns the number of recipients moved
    async fn retry_failed(&self, campaign: CampaignId) -> Result<usize>;
    /// Drop from Pending every recipient already delivered by another
    /// campaign with the same message and recipient kind
    async fn exclude_delivered(&self, campaign: CampaignId) -> Result<usize>;

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn get_message(&self, id: MessageRef) -> Result<Option<MassMailMessage>>;
    async fn put_message(&self, message: MassMailMessage) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}
