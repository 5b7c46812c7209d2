//! Account Rotation Queue - Per-owner round robin over sending accounts

use mailout_common::types::{AccountId, UserId};
use mailout_common::Result;
use mailout_storage::MailoutStore;
use std::sync::Arc;
use tracing::debug;

/// Round-robin queue of the sending accounts of each owner
///
/// The queue itself lives in the store so that rotation survives restarts;
/// every `next` is a single atomic pop-and-append.
#[derive(Clone)]
pub struct AccountRotationQueue {
    store: Arc<dyn MailoutStore>,
}

impl AccountRotationQueue {
    pub fn new(store: Arc<dyn MailoutStore>) -> Self {
        Self { store }
    }

    /// Next account to assign for `owner`, or None if the owner has no queue
    pub async fn next(&self, owner: UserId) -> Result<Option<AccountId>> {
        let next = self.store.rotation_next(owner).await?;
        debug!(owner_id = owner, account_id = ?next, "Rotated account queue");
        Ok(next)
    }

    /// Append an account to the owner's queue; no-op if already queued
    pub async fn add(&self, owner: UserId, account: AccountId) -> Result<bool> {
        self.store.rotation_add(owner, account).await
    }

    /// Remove an account from the owner's queue; no-op if absent
    pub async fn remove(&self, owner: UserId, account: AccountId) -> Result<bool> {
        self.store.rotation_remove(owner, account).await
    }

    pub async fn snapshot(&self, owner: UserId) -> Result<Vec<AccountId>> {
        self.store.rotation_snapshot(owner).await
    }

    /// Bring the queue in line with the owner's accounts: usable accounts are
    /// appended, disabled ones removed. Returns the number of usable accounts.
    pub async fn sync_owner(&self, owner: UserId) -> Result<usize> {
        let accounts = self.store.list_owner_accounts(owner).await?;
        let mut usable = 0;
        for account in accounts {
            if account.allow_mass_mail {
                usable += 1;
                if self.store.rotation_add(owner, account.id).await? {
                    debug!(owner_id = owner, account_id = account.id, "Account joined rotation");
                }
            } else {
                self.store.rotation_remove(owner, account.id).await?;
            }
        }
        Ok(usable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailout_storage::{MemoryStore, NewSendingAccount};
    use pretty_assertions::assert_eq;

    async fn queue_with_accounts(count: usize) -> (AccountRotationQueue, Vec<AccountId>) {
        let store = Arc::new(MemoryStore::new());
        let queue = AccountRotationQueue::new(store.clone());
        let mut ids = Vec::new();
        for n in 0..count {
            let account = store
                .create_account(NewSendingAccount::new(
                    1,
                    format!("sender{}@example.com", n),
                    "smtp.example.com",
                ))
                .await
                .unwrap();
            ids.push(account.id);
        }
        queue.sync_owner(1).await.unwrap();
        (queue, ids)
    }

    #[tokio::test]
    async fn test_next_is_cyclic() {
        let (queue, ids) = queue_with_accounts(3).await;

        let mut seen = Vec::new();
        for _ in 0..ids.len() {
            seen.push(queue.next(1).await.unwrap().unwrap());
        }
        assert_eq!(seen, ids);
        assert_eq!(queue.next(1).await.unwrap(), Some(ids[0]));
    }

    #[tokio::test]
    async fn test_missing_queue_yields_none() {
        let (queue, _) = queue_with_accounts(0).await;
        assert_eq!(queue.next(42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_add_and_remove_are_idempotent() {
        let (queue, ids) = queue_with_accounts(2).await;

        assert!(!queue.add(1, ids[0]).await.unwrap());
        assert!(queue.remove(1, ids[0]).await.unwrap());
        assert!(!queue.remove(1, ids[0]).await.unwrap());
        assert_eq!(queue.snapshot(1).await.unwrap(), vec![ids[1]]);
    }

    #[tokio::test]
    async fn test_sync_owner_drops_disabled_accounts() {
        let store = Arc::new(MemoryStore::new());
        let queue = AccountRotationQueue::new(store.clone());
        let enabled = store
            .create_account(NewSendingAccount::new(1, "a@example.com", "smtp.example.com"))
            .await
            .unwrap();
        let disabled = store
            .create_account(NewSendingAccount::new(1, "b@example.com", "smtp.example.com"))
            .await
            .unwrap();
        queue.add(1, disabled.id).await.unwrap();
        store.set_account_mass_mail(disabled.id, false).await.unwrap();

        assert_eq!(queue.sync_owner(1).await.unwrap(), 1);
        assert_eq!(queue.snapshot(1).await.unwrap(), vec![enabled.id]);
    }
}
