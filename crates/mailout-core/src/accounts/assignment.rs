//! Recipient Assignment Store - Sticky recipient to account mapping
//!
//! A recipient, once assigned, is always mailed from the same account as
//! long as that account still belongs to the sending owner. Stale or
//! missing assignments are re-resolved through the owner's rotation queue.

use super::rotation::AccountRotationQueue;
use mailout_common::types::{AccountId, RecipientId, RecipientKey, RecipientKind, UserId};
use mailout_common::Result;
use mailout_storage::{MailoutStore, Recipient, RecipientAssignment};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// A pending recipient ready for delivery
#[derive(Debug, Clone)]
pub struct PendingRecipient {
    pub recipient: Recipient,
    pub assignment: RecipientAssignment,
}

/// Pending recipients of one campaign, grouped by sending account
#[derive(Debug, Default)]
pub struct PendingPartition {
    /// Deliverable recipients per account, in pending order
    pub by_account: BTreeMap<AccountId, Vec<PendingRecipient>>,
    /// No account available for the owner this pass
    pub unassigned: Vec<RecipientId>,
    /// The CRM record no longer exists
    pub vanished: Vec<RecipientId>,
    /// The recipient opted out of mass mail
    pub unsubscribed: Vec<RecipientId>,
}

impl PendingPartition {
    pub fn deliverable(&self) -> usize {
        self.by_account.values().map(Vec::len).sum()
    }
}

/// Resolves and repairs recipient assignments
#[derive(Clone)]
pub struct RecipientAssignmentStore {
    store: Arc<dyn MailoutStore>,
    rotation: AccountRotationQueue,
}

impl RecipientAssignmentStore {
    pub fn new(store: Arc<dyn MailoutStore>, rotation: AccountRotationQueue) -> Self {
        Self { store, rotation }
    }

    /// Account to send from when mailing `recipient` on behalf of `owner`
    pub async fn resolve(&self, recipient: RecipientKey, owner: UserId) -> Result<Option<AccountId>> {
        Ok(self
            .resolve_assignment(recipient, owner)
            .await?
            .and_then(|assignment| assignment.account_id))
    }

    async fn resolve_assignment(
        &self,
        recipient: RecipientKey,
        owner: UserId,
    ) -> Result<Option<RecipientAssignment>> {
        let existing = self.store.get_assignment(recipient).await?;
        if let Some(assignment) = &existing {
            if assignment.is_valid_for(owner) {
                return Ok(existing);
            }
        }

        let Some(account) = self.rotation.next(owner).await? else {
            debug!(%recipient, owner_id = owner, "No account available for assignment");
            return Ok(None);
        };

        let assignment = self.store.assign_recipient(recipient, account).await?;
        debug!(
            %recipient,
            owner_id = owner,
            account_id = account,
            previous = ?existing.and_then(|a| a.account_id),
            "Recipient assigned"
        );
        Ok(Some(assignment))
    }

    /// Re-resolve a record and its dependents after the record changed owner.
    /// The parent goes first so that it takes the first rotation slot.
    pub async fn repair_for_owner_change(
        &self,
        parent: RecipientKey,
        dependents: &[RecipientKey],
        new_owner: UserId,
    ) -> Result<Vec<(RecipientKey, Option<AccountId>)>> {
        let mut repaired = Vec::with_capacity(dependents.len() + 1);
        for key in std::iter::once(&parent).chain(dependents.iter()) {
            let account = self.resolve(*key, new_owner).await?;
            repaired.push((*key, account));
        }
        info!(
            %parent,
            dependents = dependents.len(),
            owner_id = new_owner,
            "Assignments repaired after owner change"
        );
        Ok(repaired)
    }

    /// Hand a sending account to another owner. Recipients assigned to it
    /// become stale for their owner and are re-resolved lazily.
    pub async fn transfer_account(
        &self,
        account: AccountId,
        new_owner: UserId,
    ) -> Result<Option<UserId>> {
        let previous = self.store.transfer_account(account, new_owner).await?;
        if let Some(previous) = previous {
            info!(
                account_id = account,
                from_owner = previous,
                to_owner = new_owner,
                "Sending account transferred"
            );
        }
        Ok(previous)
    }

    /// Resolve every pending recipient of a campaign once and group the
    /// deliverable ones by account
    pub async fn partition_pending(
        &self,
        kind: RecipientKind,
        pending: &[RecipientId],
        owner: UserId,
    ) -> Result<PendingPartition> {
        let mut partition = PendingPartition::default();

        for &id in pending {
            let key = RecipientKey::new(kind, id);
            let Some(recipient) = self.store.get_recipient(key).await? else {
                partition.vanished.push(id);
                continue;
            };
            if !recipient.allow_mass_mail() {
                partition.unsubscribed.push(id);
                continue;
            }

            match self.resolve_assignment(key, owner).await? {
                Some(assignment) if !assignment.allow_mass_mail => {
                    partition.unsubscribed.push(id);
                }
                Some(assignment) => {
                    if let Some(account) = assignment.account_id {
                        partition
                            .by_account
                            .entry(account)
                            .or_default()
                            .push(PendingRecipient {
                                recipient,
                                assignment,
                            });
                    }
                }
                None => partition.unassigned.push(id),
            }
        }

        debug!(
            owner_id = owner,
            deliverable = partition.deliverable(),
            unassigned = partition.unassigned.len(),
            vanished = partition.vanished.len(),
            unsubscribed = partition.unsubscribed.len(),
            "Pending recipients partitioned"
        );
        Ok(partition)
    }
}
