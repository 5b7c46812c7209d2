//! Send Scheduler - Drives active campaigns through their sending accounts
//!
//! One pass picks at most one active campaign per owner, resolves every
//! pending recipient to its sticky account and delivers through the owner's
//! accounts in order (primary first) until each account's daily quota is
//! spent. Every outcome is committed on its own, so an interrupted pass can
//! simply be run again.

use super::quota::AccountQuotaTracker;
use super::window::BusinessWindowGate;
use crate::accounts::{AccountRotationQueue, RecipientAssignmentStore};
use crate::delivery::{
    classify, DeliveryError, Envelope, EscalationCounter, OutcomePolicy, RecipientContext,
    Renderer, Transport,
};
use crate::notify::OperatorNotifier;
use chrono::{NaiveDate, Utc};
use mailout_common::config::SchedulerConfig;
use mailout_common::types::UserId;
use mailout_common::Result;
use mailout_storage::{
    report_line, CampaignStatus, DeliverySuccess, MailingOut, MailoutStore, SendingAccount,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters for one scheduler pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub campaigns: usize,
    pub delivered: usize,
    pub failed: usize,
    pub suspended: usize,
    pub completed: usize,
    pub errors: usize,
}

/// Shuffle the active campaigns and keep the first one of each owner
pub fn select_campaigns<R: Rng + ?Sized>(mut campaigns: Vec<MailingOut>, rng: &mut R) -> Vec<MailingOut> {
    campaigns.shuffle(rng);
    let mut owners = HashSet::new();
    campaigns.retain(|campaign| owners.insert(campaign.owner_id));
    campaigns
}

fn random_duration(min_secs: u64, max_secs: u64) -> Duration {
    if max_secs <= min_secs {
        return Duration::from_secs(min_secs);
    }
    Duration::from_secs(rand::rng().random_range(min_secs..=max_secs))
}

/// Send Scheduler
pub struct SendScheduler {
    store: Arc<dyn MailoutStore>,
    rotation: AccountRotationQueue,
    assignments: RecipientAssignmentStore,
    window: BusinessWindowGate,
    quota: AccountQuotaTracker,
    renderer: Arc<dyn Renderer>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn OperatorNotifier>,
    config: SchedulerConfig,
    unsubscribe_base_url: String,
}

impl SendScheduler {
    pub fn new(
        store: Arc<dyn MailoutStore>,
        renderer: Arc<dyn Renderer>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn OperatorNotifier>,
        config: SchedulerConfig,
        unsubscribe_base_url: impl Into<String>,
    ) -> Result<Self> {
        let rotation = AccountRotationQueue::new(store.clone());
        Ok(Self {
            assignments: RecipientAssignmentStore::new(store.clone(), rotation.clone()),
            rotation,
            window: BusinessWindowGate::from_config(&config)?,
            quota: AccountQuotaTracker::new(config.daily_limit),
            store,
            renderer,
            transport,
            notifier,
            config,
            unsubscribe_base_url: unsubscribe_base_url.into(),
        })
    }

    /// Run forever: sleep until the business window opens, run a pass, repeat
    pub async fn run(&self) {
        info!(
            daily_limit = self.config.daily_limit,
            mode = ?self.config.mode,
            "Send scheduler started"
        );

        loop {
            let until_open = self.window.seconds_until_open_at(Utc::now());
            let jitter = random_duration(self.config.wake_jitter_min_secs, self.config.wake_jitter_max_secs);
            let wait = Duration::from_secs_f64(until_open) + jitter;
            debug!(wait_secs = wait.as_secs(), "Scheduler sleeping");
            tokio::time::sleep(wait).await;

            let today = self.window.local_date(Utc::now());
            match self.run_pass(today).await {
                Ok(summary) => info!(?summary, "Scheduler pass finished"),
                Err(e) => {
                    error!(error = %e, "Scheduler pass failed");
                    self.notifier
                        .notify("Scheduler pass failed", &e.to_string())
                        .await;
                }
            }
        }
    }

    /// One pass over the active campaigns, at most one per owner
    pub async fn run_pass(&self, today: NaiveDate) -> Result<PassSummary> {
        let active = self
            .store
            .list_campaigns_by_status(&CampaignStatus::SENDABLE)
            .await?;
        let selected = {
            let mut rng = rand::rng();
            select_campaigns(active, &mut rng)
        };

        let mut summary = PassSummary {
            campaigns: selected.len(),
            ..Default::default()
        };
        for campaign in &selected {
            if let Err(e) = self.process_campaign(campaign, today, &mut summary).await {
                summary.errors += 1;
                error!(campaign_id = campaign.id, error = %e, "Campaign processing failed");
                self.notifier
                    .notify(
                        &format!("Campaign {} failed", campaign.id),
                        &e.to_string(),
                    )
                    .await;
            }
        }
        Ok(summary)
    }

    async fn complete_if_drained(&self, campaign: &MailingOut, summary: &mut PassSummary) -> Result<bool> {
        let progress = self.store.load_progress(campaign.id).await?;
        if !progress.pending.is_empty() {
            return Ok(false);
        }
        let line = report_line(Utc::now(), "Done successfully");
        self.store
            .set_campaign_status(campaign.id, CampaignStatus::Done, Some(&line))
            .await?;
        summary.completed += 1;
        info!(
            campaign_id = campaign.id,
            succeeded = progress.succeeded.len(),
            failed = progress.failed.len(),
            "Campaign done"
        );
        Ok(true)
    }

    async fn usable_accounts(&self, owner: UserId) -> Result<Vec<SendingAccount>> {
        Ok(self
            .store
            .list_owner_accounts(owner)
            .await?
            .into_iter()
            .filter(|account| account.allow_mass_mail)
            .collect())
    }

    fn unsubscribe_url(&self, token: &uuid::Uuid) -> String {
        format!("{}/{}", self.unsubscribe_base_url.trim_end_matches('/'), token)
    }

    async fn pace(&self) {
        if !self.config.mode.is_production() {
            return;
        }
        let delay = random_duration(self.config.pacing_min_secs, self.config.pacing_max_secs);
        tokio::time::sleep(delay).await;
    }

    async fn process_campaign(
        &self,
        campaign: &MailingOut,
        today: NaiveDate,
        summary: &mut PassSummary,
    ) -> Result<()> {
        if self.complete_if_drained(campaign, summary).await? {
            return Ok(());
        }

        // Accounts added or re-enabled since the campaign was armed join the rotation here.
        self.rotation.sync_owner(campaign.owner_id).await?;

        let progress = self.store.load_progress(campaign.id).await?;
        let mut partition = self
            .assignments
            .partition_pending(campaign.recipient_kind, &progress.pending.to_vec(), campaign.owner_id)
            .await?;

        for &id in partition.vanished.iter().chain(partition.unsubscribed.iter()) {
            if self.store.drop_recipient(campaign.id, id).await? {
                debug!(campaign_id = campaign.id, recipient_id = id, "Recipient dropped");
            }
        }
        if !partition.unassigned.is_empty() {
            warn!(
                campaign_id = campaign.id,
                owner_id = campaign.owner_id,
                unassigned = partition.unassigned.len(),
                "Recipients without a sending account"
            );
        }

        let mut escalation = EscalationCounter::new(self.config.escalation_threshold);
        let accounts = self.usable_accounts(campaign.owner_id).await?;

        'accounts: for mut account in accounts {
            let Some(share) = partition.by_account.remove(&account.id) else {
                continue;
            };

            for pending in share {
                if !self.quota.has_capacity(&account, today) {
                    debug!(
                        campaign_id = campaign.id,
                        account_id = account.id,
                        "Account quota spent for today"
                    );
                    continue 'accounts;
                }
                if self.config.mode.is_production() && !self.window.is_open_at(Utc::now()) {
                    info!(campaign_id = campaign.id, "Business window closed, stopping campaign");
                    return Ok(());
                }

                let recipient = &pending.recipient;
                let url = self.unsubscribe_url(&pending.assignment.unsubscribe_token);
                let context = RecipientContext::new(recipient, url.clone());
                let result = match self.renderer.render(campaign.message_ref, &context).await {
                    Ok(email) => {
                        let envelope = Envelope::new(recipient, email, Some(url));
                        self.transport.deliver(&account, &envelope).await
                    }
                    Err(e) => Err(DeliveryError::from(e)),
                };
                let reason = match &result {
                    Ok(()) => String::new(),
                    Err(e) => e.to_string(),
                };

                match classify(&result) {
                    OutcomePolicy::Succeeded => {
                        let success = DeliverySuccess {
                            campaign_id: campaign.id,
                            recipient_id: recipient.id(),
                            account_id: account.id,
                            today,
                        };
                        if self.store.record_success(&success).await? {
                            account.quota.record(today);
                            summary.delivered += 1;
                            debug!(
                                campaign_id = campaign.id,
                                account_id = account.id,
                                recipient = %recipient.key(),
                                "Delivered"
                            );
                        }
                        self.pace().await;
                    }
                    policy @ (OutcomePolicy::SkipRecipient | OutcomePolicy::SkipAndEscalate) => {
                        let line = report_line(Utc::now(), &format!("{}: {}", recipient.email(), reason));
                        if self.store.record_failure(campaign.id, recipient.id(), &line).await? {
                            summary.failed += 1;
                        }
                        warn!(
                            campaign_id = campaign.id,
                            recipient = %recipient.key(),
                            reason = %reason,
                            "Recipient skipped"
                        );
                        if policy == OutcomePolicy::SkipAndEscalate && escalation.record() {
                            self.notifier
                                .notify(
                                    &format!("Repeated unexpected errors in campaign {}", campaign.id),
                                    &format!(
                                        "{} unexpected delivery errors this pass, latest: {}",
                                        escalation.count(),
                                        reason
                                    ),
                                )
                                .await;
                        }
                    }
                    OutcomePolicy::SuspendAccount => {
                        let line = report_line(
                            Utc::now(),
                            &format!("Account {} suspended: {}", account.from_address, reason),
                        );
                        self.store.suspend_account(account.id, campaign.id, &line).await?;
                        summary.suspended += 1;
                        error!(
                            campaign_id = campaign.id,
                            account_id = account.id,
                            reason = %reason,
                            "Sending account suspended"
                        );
                        self.notifier
                            .notify(
                                &format!("Sending account {} suspended", account.from_address),
                                &format!("Campaign {}: {}", campaign.id, reason),
                            )
                            .await;

                        if self.usable_accounts(campaign.owner_id).await?.is_empty() {
                            let line = report_line(Utc::now(), "Interrupted: no usable sending account left");
                            self.store
                                .set_campaign_status(campaign.id, CampaignStatus::Interrupted, Some(&line))
                                .await?;
                            warn!(
                                campaign_id = campaign.id,
                                owner_id = campaign.owner_id,
                                "Campaign interrupted, owner has no usable account"
                            );
                            self.notifier
                                .notify(
                                    &format!("Campaign {} interrupted", campaign.id),
                                    "The owner has no sending account allowed to send mass mail",
                                )
                                .await;
                            return Ok(());
                        }
                        continue 'accounts;
                    }
                    OutcomePolicy::AbortAccountShare => {
                        warn!(
                            campaign_id = campaign.id,
                            account_id = account.id,
                            reason = %reason,
                            "Account unavailable, leaving its share for the next pass"
                        );
                        continue 'accounts;
                    }
                }
            }
        }

        self.complete_if_drained(campaign, summary).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{RenderError, RenderedEmail};
    use crate::scheduled::{ArmWarning, CampaignManager};
    use async_trait::async_trait;
    use mailout_common::types::{AccountId, ExecutionMode, MessageRef, RecipientId, RecipientKey, RecipientKind};
    use mailout_storage::{DailyCounter, Lead, MemoryStore, NewMailingOut, NewSendingAccount, Recipient};
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    type DeliverFn = dyn Fn(&SendingAccount, &Envelope) -> std::result::Result<(), DeliveryError> + Send + Sync;

    struct ScriptedTransport {
        script: Box<DeliverFn>,
        sent: Mutex<Vec<(AccountId, String)>>,
    }

    impl ScriptedTransport {
        fn new(
            script: impl Fn(&SendingAccount, &Envelope) -> std::result::Result<(), DeliveryError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Box::new(script),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn accepting() -> Arc<Self> {
            Self::new(|_, _| Ok(()))
        }

        fn sent(&self) -> Vec<(AccountId, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn deliver(
            &self,
            account: &SendingAccount,
            envelope: &Envelope,
        ) -> std::result::Result<(), DeliveryError> {
            let result = (self.script)(account, envelope);
            if result.is_ok() {
                self.sent
                    .lock()
                    .unwrap()
                    .push((account.id, envelope.to_address.clone()));
            }
            result
        }
    }

    /// Fails for recipients whose address starts with "broken"
    struct FakeRenderer;

    #[async_trait]
    impl Renderer for FakeRenderer {
        async fn render(
            &self,
            message: MessageRef,
            context: &RecipientContext,
        ) -> std::result::Result<RenderedEmail, RenderError> {
            if context.email.starts_with("broken") {
                return Err(RenderError::MissingAsset {
                    path: "logo.png".to_string(),
                    reason: "gone".to_string(),
                });
            }
            Ok(RenderedEmail {
                subject: format!("Message {} for {}", message, context.full_name),
                html_body: format!("<a href=\"{}\">unsubscribe</a>", context.unsubscribe_url),
                plain_body: context.unsubscribe_url.clone(),
                inline_assets: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        subjects: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        fn subjects(&self) -> Vec<String> {
            self.subjects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperatorNotifier for RecordingNotifier {
        async fn notify(&self, subject: &str, _body: &str) {
            self.subjects.lock().unwrap().push(subject.to_string());
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        today: NaiveDate,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                notifier: Arc::new(RecordingNotifier::default()),
                today: NaiveDate::from_ymd_opt(2026, 10, 14).unwrap(),
            }
        }

        async fn account(&self, from: &str) -> AccountId {
            self.store
                .create_account(NewSendingAccount::new(1, from, "smtp.example.com"))
                .await
                .unwrap()
                .id
        }

        async fn lead(&self, id: RecipientId, email: &str) {
            self.store
                .upsert_recipient(Recipient::Lead(Lead {
                    id,
                    owner_id: 1,
                    first_name: "Lead".to_string(),
                    last_name: id.to_string(),
                    company_name: None,
                    email: email.to_string(),
                    allow_mass_mail: true,
                }))
                .await
                .unwrap();
        }

        async fn armed_campaign(&self, ids: Vec<RecipientId>) -> MailingOut {
            let manager = CampaignManager::new(
                self.store.clone(),
                AccountRotationQueue::new(self.store.clone()),
                true,
            );
            let campaign = manager
                .create(NewMailingOut {
                    owner_id: 1,
                    message_ref: 1,
                    recipient_kind: RecipientKind::Lead,
                    recipient_ids: ids,
                })
                .await
                .unwrap();
            manager.arm(campaign.id).await.unwrap().campaign
        }

        fn scheduler(&self, transport: Arc<ScriptedTransport>, config: SchedulerConfig) -> SendScheduler {
            SendScheduler::new(
                self.store.clone(),
                Arc::new(FakeRenderer),
                transport,
                self.notifier.clone(),
                config,
                "https://crm.example.com/unsubscribe/",
            )
            .unwrap()
        }

        async fn campaign(&self, id: i64) -> MailingOut {
            self.store.get_campaign(id).await.unwrap().unwrap()
        }

        async fn account_record(&self, id: AccountId) -> SendingAccount {
            self.store.get_account(id).await.unwrap().unwrap()
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            mode: ExecutionMode::Test,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_two_recipients_both_delivered() {
        let fx = Fixture::new();
        let a = fx.account("a@example.com").await;
        let b = fx.account("b@example.com").await;
        fx.lead(1, "one@example.com").await;
        fx.lead(2, "two@example.com").await;
        let campaign = fx.armed_campaign(vec![1, 2]).await;

        let transport = ScriptedTransport::accepting();
        let scheduler = fx.scheduler(transport.clone(), test_config());
        let summary = scheduler.run_pass(fx.today).await.unwrap();

        assert_eq!(summary.delivered, 2);
        assert_eq!(summary.completed, 1);
        assert_eq!(
            transport.sent(),
            vec![(a, "one@example.com".to_string()), (b, "two@example.com".to_string())]
        );

        let campaign = fx.campaign(campaign.id).await;
        assert_eq!(campaign.status, CampaignStatus::Done);
        assert!(campaign.report.contains("Done successfully"));
        assert_eq!(campaign.today, DailyCounter::new(2, Some(fx.today)));
        assert_eq!(fx.account_record(a).await.quota.current(fx.today), 1);
        assert_eq!(fx.account_record(b).await.quota.current(fx.today), 1);

        let progress = fx.store.load_progress(campaign.id).await.unwrap();
        assert_eq!(progress.succeeded.to_vec(), vec![1, 2]);
        assert!(progress.is_consistent());
    }

    #[tokio::test]
    async fn test_authentication_failure_suspends_account() {
        let fx = Fixture::new();
        let a = fx.account("a@example.com").await;
        let b = fx.account("b@example.com").await;
        fx.lead(1, "one@example.com").await;
        fx.lead(2, "two@example.com").await;
        let campaign = fx.armed_campaign(vec![1, 2]).await;

        let transport = ScriptedTransport::new(move |account, _| {
            if account.id == a {
                Err(DeliveryError::Authentication("535 bad credentials".to_string()))
            } else {
                Ok(())
            }
        });
        let scheduler = fx.scheduler(transport.clone(), test_config());
        let summary = scheduler.run_pass(fx.today).await.unwrap();
        assert_eq!(summary.suspended, 1);
        assert_eq!(summary.delivered, 1);

        let suspended = fx.account_record(a).await;
        assert!(!suspended.allow_mass_mail);
        assert!(suspended.report.contains("535 bad credentials"));
        assert_eq!(fx.store.rotation_snapshot(1).await.unwrap(), vec![b]);

        let progress = fx.store.load_progress(campaign.id).await.unwrap();
        assert_eq!(progress.pending.to_vec(), vec![1]);
        assert_eq!(progress.succeeded.to_vec(), vec![2]);

        let campaign = fx.campaign(campaign.id).await;
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert!(campaign.report.contains("a@example.com suspended"));
        assert_eq!(fx.notifier.subjects(), vec!["Sending account a@example.com suspended".to_string()]);
    }

    #[tokio::test]
    async fn test_last_account_suspended_interrupts_campaign() {
        let fx = Fixture::new();
        fx.account("a@example.com").await;
        fx.lead(1, "one@example.com").await;
        let campaign = fx.armed_campaign(vec![1]).await;

        let transport =
            ScriptedTransport::new(|_, _| Err(DeliveryError::SenderRejected("553 not yours".to_string())));
        fx.scheduler(transport, test_config())
            .run_pass(fx.today)
            .await
            .unwrap();

        let campaign = fx.campaign(campaign.id).await;
        assert_eq!(campaign.status, CampaignStatus::Interrupted);
        assert_eq!(
            fx.store.load_progress(campaign.id).await.unwrap().pending.to_vec(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_account_added_after_arming_picks_up_campaign() {
        let fx = Fixture::new();
        fx.lead(1, "one@example.com").await;
        let manager = CampaignManager::new(
            fx.store.clone(),
            AccountRotationQueue::new(fx.store.clone()),
            true,
        );
        let campaign = manager
            .create(NewMailingOut {
                owner_id: 1,
                message_ref: 1,
                recipient_kind: RecipientKind::Lead,
                recipient_ids: vec![1],
            })
            .await
            .unwrap();
        let report = manager.arm(campaign.id).await.unwrap();
        assert_eq!(report.warnings, vec![ArmWarning::NoUsableAccount]);

        let a = fx.account("a@example.com").await;
        let transport = ScriptedTransport::accepting();
        let summary = fx
            .scheduler(transport.clone(), test_config())
            .run_pass(fx.today)
            .await
            .unwrap();

        assert_eq!(summary.delivered, 1);
        assert_eq!(transport.sent(), vec![(a, "one@example.com".to_string())]);
        assert_eq!(fx.store.rotation_snapshot(1).await.unwrap(), vec![a]);
        assert_eq!(fx.campaign(campaign.id).await.status, CampaignStatus::Done);
    }

    #[tokio::test]
    async fn test_quota_leaves_remaining_recipients_pending() {
        let fx = Fixture::new();
        let a = fx.account("a@example.com").await;
        for id in 1..=3 {
            fx.lead(id, &format!("r{}@example.com", id)).await;
        }
        let campaign = fx.armed_campaign(vec![1, 2, 3]).await;

        let config = SchedulerConfig {
            daily_limit: 1,
            ..test_config()
        };
        let summary = fx
            .scheduler(ScriptedTransport::accepting(), config.clone())
            .run_pass(fx.today)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 2);
        assert_eq!(fx.account_record(a).await.quota.current(fx.today), 2);

        let progress = fx.store.load_progress(campaign.id).await.unwrap();
        assert_eq!(progress.pending.to_vec(), vec![3]);
        assert_eq!(fx.campaign(campaign.id).await.status, CampaignStatus::Active);

        // The counter rolls over on the next business date.
        let tomorrow = fx.today.succ_opt().unwrap();
        fx.scheduler(ScriptedTransport::accepting(), config)
            .run_pass(tomorrow)
            .await
            .unwrap();
        assert_eq!(fx.campaign(campaign.id).await.status, CampaignStatus::Done);
        assert_eq!(fx.account_record(a).await.quota, DailyCounter::new(1, Some(tomorrow)));
    }

    #[tokio::test]
    async fn test_vanished_and_unsubscribed_recipients_are_dropped() {
        let fx = Fixture::new();
        fx.account("a@example.com").await;
        fx.lead(1, "one@example.com").await;
        fx.lead(3, "three@example.com").await;
        let mut opted_out = fx
            .store
            .get_recipient(RecipientKey::lead(3))
            .await
            .unwrap()
            .unwrap();
        opted_out.set_allow_mass_mail(false);
        fx.store.upsert_recipient(opted_out).await.unwrap();
        let campaign = fx.armed_campaign(vec![1, 2, 3]).await;

        let summary = fx
            .scheduler(ScriptedTransport::accepting(), test_config())
            .run_pass(fx.today)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 0);

        let campaign = fx.campaign(campaign.id).await;
        assert_eq!(campaign.status, CampaignStatus::Done);
        assert_eq!(campaign.recipients_number, 1);
    }

    #[tokio::test]
    async fn test_skips_record_failures_and_escalate_once() {
        let fx = Fixture::new();
        fx.account("a@example.com").await;
        fx.lead(1, "broken@example.com").await;
        for id in 2..=4 {
            fx.lead(id, &format!("r{}@example.com", id)).await;
        }
        let campaign = fx.armed_campaign(vec![1, 2, 3, 4]).await;

        let transport =
            ScriptedTransport::new(|_, _| Err(DeliveryError::Unexpected("connection reset".to_string())));
        let config = SchedulerConfig {
            escalation_threshold: 2,
            ..test_config()
        };
        let summary = fx.scheduler(transport, config).run_pass(fx.today).await.unwrap();
        assert_eq!(summary.failed, 4);

        let progress = fx.store.load_progress(campaign.id).await.unwrap();
        assert_eq!(progress.failed.to_vec(), vec![1, 2, 3, 4]);
        let campaign = fx.campaign(campaign.id).await;
        assert_eq!(campaign.status, CampaignStatus::Done);
        assert!(campaign.report.contains("broken@example.com: Missing attachment"));
        assert_eq!(
            fx.notifier.subjects(),
            vec![format!("Repeated unexpected errors in campaign {}", campaign.id)]
        );
    }

    #[tokio::test]
    async fn test_unavailable_account_keeps_recipients_pending() {
        let fx = Fixture::new();
        let a = fx.account("a@example.com").await;
        let b = fx.account("b@example.com").await;
        for id in 1..=4 {
            fx.lead(id, &format!("r{}@example.com", id)).await;
        }
        let campaign = fx.armed_campaign(vec![1, 2, 3, 4]).await;

        let transport = ScriptedTransport::new(move |account, _| {
            if account.id == a {
                Err(DeliveryError::Unavailable("421 try later".to_string()))
            } else {
                Ok(())
            }
        });
        let summary = fx
            .scheduler(transport.clone(), test_config())
            .run_pass(fx.today)
            .await
            .unwrap();
        assert_eq!(summary.delivered, 2);
        assert!(transport.sent().iter().all(|(account, _)| *account == b));

        let progress = fx.store.load_progress(campaign.id).await.unwrap();
        assert_eq!(progress.pending.to_vec(), vec![1, 3]);
        assert!(progress.failed.is_empty());
        assert!(fx.account_record(a).await.allow_mass_mail);
    }

    #[tokio::test]
    async fn test_paused_campaigns_are_ignored() {
        let fx = Fixture::new();
        fx.account("a@example.com").await;
        fx.lead(1, "one@example.com").await;
        let campaign = fx.armed_campaign(vec![1]).await;
        fx.store
            .set_campaign_status(campaign.id, CampaignStatus::Paused, None)
            .await
            .unwrap();

        let transport = ScriptedTransport::accepting();
        let summary = fx
            .scheduler(transport.clone(), test_config())
            .run_pass(fx.today)
            .await
            .unwrap();
        assert_eq!(summary, PassSummary::default());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_url_carries_assignment_token() {
        let fx = Fixture::new();
        fx.account("a@example.com").await;
        fx.lead(1, "one@example.com").await;
        fx.armed_campaign(vec![1]).await;

        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let transport = ScriptedTransport::new(move |_, envelope| {
            *captured.lock().unwrap() = envelope.unsubscribe_url.clone();
            Ok(())
        });
        fx.scheduler(transport, test_config())
            .run_pass(fx.today)
            .await
            .unwrap();

        let token = fx
            .store
            .get_assignment(RecipientKey::lead(1))
            .await
            .unwrap()
            .unwrap()
            .unsubscribe_token;
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(format!("https://crm.example.com/unsubscribe/{}", token))
        );
    }

    fn campaign_of(id: i64, owner_id: UserId) -> MailingOut {
        MailingOut {
            id,
            owner_id,
            message_ref: 1,
            recipient_kind: RecipientKind::Lead,
            status: CampaignStatus::Active,
            recipients_number: 1,
            today: DailyCounter::default(),
            report: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_select_campaigns_keeps_one_per_owner() {
        let campaigns = vec![campaign_of(1, 1), campaign_of(2, 1), campaign_of(3, 2), campaign_of(4, 1)];
        let mut rng = rand::rng();
        for _ in 0..20 {
            let selected = select_campaigns(campaigns.clone(), &mut rng);
            let mut owners: Vec<UserId> = selected.iter().map(|c| c.owner_id).collect();
            owners.sort();
            assert_eq!(owners, vec![1, 2]);
        }
    }
}
