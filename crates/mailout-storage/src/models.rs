//! Data model
//!
//! Plain domain types shared by every store implementation. The progress
//! bookkeeping of a campaign (`CampaignProgress`) and the rotation ring
//! (`RotationQueue`) carry their own invariants here so that all stores
//! apply identical transitions.

use chrono::{DateTime, NaiveDate, Utc};
use mailout_common::types::{
    AccountId, CampaignId, MessageRef, RecipientId, RecipientKey, RecipientKind, Timestamp,
    UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

// ============================================================================
// Daily counters
// ============================================================================

/// A counter that restarts from zero on every new date
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCounter {
    pub count: i32,
    pub date: Option<NaiveDate>,
}

impl DailyCounter {
    pub fn new(count: i32, date: Option<NaiveDate>) -> Self {
        Self { count, date }
    }

    /// Reset the counter when it was last touched on another date.
    /// Returns true when a reset happened.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.date == Some(today) {
            return false;
        }
        self.count = 0;
        self.date = Some(today);
        true
    }

    /// Value of the counter as seen on `today`
    pub fn current(&self, today: NaiveDate) -> i32 {
        if self.date == Some(today) {
            self.count
        } else {
            0
        }
    }

    /// Count one event on `today`
    pub fn record(&mut self, today: NaiveDate) {
        self.roll_over(today);
        self.count += 1;
    }
}

// ============================================================================
// Sending accounts
// ============================================================================

/// Outgoing mail account eligible for mass mail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendingAccount {
    pub id: AccountId,
    pub owner_id: UserId,
    pub from_address: String,
    pub from_name: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    #[serde(skip_serializing)]
    pub smtp_password: Option<String>,
    pub use_starttls: bool,
    pub allow_mass_mail: bool,
    pub is_primary: bool,
    /// Deliveries made today (`count`) and the date of the last reset (`date`)
    pub quota: DailyCounter,
    /// Reverse-chronological log of failures and suspensions
    pub report: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create sending account input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSendingAccount {
    pub owner_id: UserId,
    pub from_address: String,
    pub from_name: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub use_starttls: bool,
    pub allow_mass_mail: bool,
    pub is_primary: bool,
}

impl NewSendingAccount {
    /// Minimal account for an owner, relaying through `smtp_host`
    pub fn new(owner_id: UserId, from_address: impl Into<String>, smtp_host: impl Into<String>) -> Self {
        Self {
            owner_id,
            from_address: from_address.into(),
            from_name: None,
            smtp_host: smtp_host.into(),
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            use_starttls: true,
            allow_mass_mail: true,
            is_primary: false,
        }
    }
}

// ============================================================================
// Rotation queue
// ============================================================================

/// Per-owner round-robin ring of account ids
///
/// Ids are unique; `next` pops the head and re-appends it at the tail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationQueue {
    ids: VecDeque<AccountId>,
}

impl RotationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: impl IntoIterator<Item = AccountId>) -> Self {
        let mut queue = Self::new();
        for id in ids {
            queue.add(id);
        }
        queue
    }

    /// Rotate the ring and return the account that was at its head
    pub fn next(&mut self) -> Option<AccountId> {
        let head = self.ids.pop_front()?;
        self.ids.push_back(head);
        Some(head)
    }

    /// Append an account unless it is already queued
    pub fn add(&mut self, id: AccountId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push_back(id);
        true
    }

    /// Remove an account if queued
    pub fn remove(&mut self, id: AccountId) -> bool {
        match self.ids.iter().position(|queued| *queued == id) {
            Some(index) => {
                self.ids.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: AccountId) -> bool {
        self.ids.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn to_vec(&self) -> Vec<AccountId> {
        self.ids.iter().copied().collect()
    }
}

// ============================================================================
// Recipients
// ============================================================================

/// Company record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: RecipientId,
    pub owner_id: UserId,
    pub name: String,
    pub email: String,
    pub allow_mass_mail: bool,
}

/// Contact person, usually attached to a company
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: RecipientId,
    pub owner_id: UserId,
    pub company_id: Option<RecipientId>,
    pub first_name: String,
    pub last_name: String,
    pub company_name: Option<String>,
    pub email: String,
    pub allow_mass_mail: bool,
}

/// Lead (prospect not yet converted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: RecipientId,
    pub owner_id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub company_name: Option<String>,
    pub email: String,
    pub allow_mass_mail: bool,
}

/// A CRM record a campaign can target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    Company(Company),
    Contact(Contact),
    Lead(Lead),
}

impl Recipient {
    pub fn kind(&self) -> RecipientKind {
        match self {
            Recipient::Company(_) => RecipientKind::Company,
            Recipient::Contact(_) => RecipientKind::Contact,
            Recipient::Lead(_) => RecipientKind::Lead,
        }
    }

    pub fn id(&self) -> RecipientId {
        match self {
            Recipient::Company(c) => c.id,
            Recipient::Contact(c) => c.id,
            Recipient::Lead(l) => l.id,
        }
    }

    pub fn key(&self) -> RecipientKey {
        RecipientKey::new(self.kind(), self.id())
    }

    pub fn email(&self) -> &str {
        match self {
            Recipient::Company(c) => &c.email,
            Recipient::Contact(c) => &c.email,
            Recipient::Lead(l) => &l.email,
        }
    }

    pub fn owner(&self) -> UserId {
        match self {
            Recipient::Company(c) => c.owner_id,
            Recipient::Contact(c) => c.owner_id,
            Recipient::Lead(l) => l.owner_id,
        }
    }

    pub fn first_name(&self) -> &str {
        match self {
            Recipient::Company(_) => "",
            Recipient::Contact(c) => &c.first_name,
            Recipient::Lead(l) => &l.first_name,
        }
    }

    pub fn last_name(&self) -> &str {
        match self {
            Recipient::Company(_) => "",
            Recipient::Contact(c) => &c.last_name,
            Recipient::Lead(l) => &l.last_name,
        }
    }

    pub fn company_name(&self) -> &str {
        match self {
            Recipient::Company(c) => &c.name,
            Recipient::Contact(c) => c.company_name.as_deref().unwrap_or(""),
            Recipient::Lead(l) => l.company_name.as_deref().unwrap_or(""),
        }
    }

    /// Display name used in salutations and `To:` headers
    pub fn full_name(&self) -> String {
        match self {
            Recipient::Company(c) => c.name.clone(),
            Recipient::Contact(_) | Recipient::Lead(_) => {
                let first = self.first_name().trim();
                let last = self.last_name().trim();
                match (first.is_empty(), last.is_empty()) {
                    (false, false) => format!("{} {}", first, last),
                    (false, true) => first.to_string(),
                    (true, false) => last.to_string(),
                    (true, true) => String::new(),
                }
            }
        }
    }

    /// Path of the record in the CRM
    pub fn absolute_reference(&self) -> String {
        format!("/crm/{}/{}/", self.kind(), self.id())
    }

    pub fn allow_mass_mail(&self) -> bool {
        match self {
            Recipient::Company(c) => c.allow_mass_mail,
            Recipient::Contact(c) => c.allow_mass_mail,
            Recipient::Lead(l) => l.allow_mass_mail,
        }
    }

    pub fn set_allow_mass_mail(&mut self, allowed: bool) {
        match self {
            Recipient::Company(c) => c.allow_mass_mail = allowed,
            Recipient::Contact(c) => c.allow_mass_mail = allowed,
            Recipient::Lead(l) => l.allow_mass_mail = allowed,
        }
    }

    /// The record this one depends on for ownership (a contact's company)
    pub fn parent(&self) -> Option<RecipientKey> {
        match self {
            Recipient::Contact(c) => c.company_id.map(RecipientKey::company),
            Recipient::Company(_) | Recipient::Lead(_) => None,
        }
    }
}

// ============================================================================
// Recipient assignments
// ============================================================================

/// Sticky recipient -> sending account mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientAssignment {
    pub recipient: RecipientKey,
    /// None once the account has been deleted
    pub account_id: Option<AccountId>,
    /// Owner of `account_id` at read time
    pub account_owner: Option<UserId>,
    /// Cleared when the recipient unsubscribes
    pub allow_mass_mail: bool,
    pub unsubscribe_token: Uuid,
}

impl RecipientAssignment {
    /// True when the assignment can be used for sends on behalf of `owner`
    pub fn is_valid_for(&self, owner: UserId) -> bool {
        self.account_id.is_some() && self.account_owner == Some(owner)
    }
}

// ============================================================================
// Campaigns
// ============================================================================

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    ActiveWithError,
    Paused,
    Interrupted,
    Done,
}

impl CampaignStatus {
    /// Statuses the scheduler picks up
    pub const SENDABLE: [CampaignStatus; 2] = [CampaignStatus::Active, CampaignStatus::ActiveWithError];

    pub fn is_sendable(&self) -> bool {
        Self::SENDABLE.contains(self)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Active => write!(f, "active"),
            CampaignStatus::ActiveWithError => write!(f, "active_with_error"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Interrupted => write!(f, "interrupted"),
            CampaignStatus::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CampaignStatus::Active),
            "active_with_error" => Ok(CampaignStatus::ActiveWithError),
            "paused" => Ok(CampaignStatus::Paused),
            "interrupted" => Ok(CampaignStatus::Interrupted),
            "done" => Ok(CampaignStatus::Done),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Campaign ("mailing out") model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailingOut {
    pub id: CampaignId,
    pub owner_id: UserId,
    pub message_ref: MessageRef,
    pub recipient_kind: RecipientKind,
    pub status: CampaignStatus,
    pub recipients_number: i32,
    /// Deliveries made today (`count`) and the date of the last send (`date`)
    pub today: DailyCounter,
    /// Reverse-chronological log of failures and status changes
    pub report: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMailingOut {
    pub owner_id: UserId,
    pub message_ref: MessageRef,
    pub recipient_kind: RecipientKind,
    /// Recipient snapshot; duplicates are collapsed
    pub recipient_ids: Vec<RecipientId>,
}

/// Insertion-ordered set of recipient ids
///
/// Its text form is the comma-joined id list, e.g. `"3,1,2"`. Each id keeps
/// the sequence number it was inserted with, so removal does not shift the rest.
#[derive(Debug, Clone, Default)]
pub struct RecipientSet {
    order: BTreeMap<u64, RecipientId>,
    members: HashMap<RecipientId, u64>,
    next_seq: u64,
}

impl RecipientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: RecipientId) -> bool {
        self.members.contains_key(&id)
    }

    /// Append an id; returns false if it was already present
    pub fn insert(&mut self, id: RecipientId) -> bool {
        if self.members.contains_key(&id) {
            return false;
        }
        self.members.insert(id, self.next_seq);
        self.order.insert(self.next_seq, id);
        self.next_seq += 1;
        true
    }

    pub fn remove(&mut self, id: RecipientId) -> bool {
        match self.members.remove(&id) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = RecipientId> + '_ {
        self.order.values().copied()
    }

    pub fn to_vec(&self) -> Vec<RecipientId> {
        self.iter().collect()
    }

    /// Remove every id also present in `other`; returns how many were removed
    pub fn subtract(&mut self, other: &RecipientSet) -> usize {
        other.iter().filter(|id| self.remove(*id)).count()
    }

    pub fn is_disjoint(&self, other: &RecipientSet) -> bool {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        small.iter().all(|id| !large.contains(id))
    }

    fn take(&mut self) -> Vec<RecipientId> {
        let ids = self.to_vec();
        *self = Self::default();
        ids
    }
}

impl PartialEq for RecipientSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}

impl Eq for RecipientSet {}

impl FromIterator<RecipientId> for RecipientSet {
    fn from_iter<I: IntoIterator<Item = RecipientId>>(iter: I) -> Self {
        let mut set = RecipientSet::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl std::fmt::Display for RecipientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (index, id) in self.iter().enumerate() {
            if index > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", id)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for RecipientSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<RecipientId>()
                    .map_err(|_| format!("Invalid recipient id: {}", part))
            })
            .collect()
    }
}

impl Serialize for RecipientSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecipientSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Which progress set a recipient sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientState {
    Pending,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RecipientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientState::Pending => write!(f, "pending"),
            RecipientState::Succeeded => write!(f, "succeeded"),
            RecipientState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RecipientState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientState::Pending),
            "succeeded" => Ok(RecipientState::Succeeded),
            "failed" => Ok(RecipientState::Failed),
            _ => Err(format!("Invalid recipient state: {}", s)),
        }
    }
}

/// Pending / Succeeded / Failed sets of one campaign
///
/// The three sets are pairwise disjoint after every transition; a recipient
/// only ever leaves Pending, except through `retry_failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub pending: RecipientSet,
    pub succeeded: RecipientSet,
    pub failed: RecipientSet,
}

impl CampaignProgress {
    /// Fresh progress for a recipient snapshot
    pub fn from_snapshot(ids: impl IntoIterator<Item = RecipientId>) -> Self {
        Self {
            pending: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.pending.len() + self.succeeded.len() + self.failed.len()
    }

    pub fn state_of(&self, id: RecipientId) -> Option<RecipientState> {
        if self.pending.contains(id) {
            Some(RecipientState::Pending)
        } else if self.succeeded.contains(id) {
            Some(RecipientState::Succeeded)
        } else if self.failed.contains(id) {
            Some(RecipientState::Failed)
        } else {
            None
        }
    }

    /// Pending -> Succeeded
    pub fn mark_succeeded(&mut self, id: RecipientId) -> bool {
        if !self.pending.remove(id) {
            return false;
        }
        self.succeeded.insert(id)
    }

    /// Pending -> Failed
    pub fn mark_failed(&mut self, id: RecipientId) -> bool {
        if !self.pending.remove(id) {
            return false;
        }
        self.failed.insert(id)
    }

    /// Remove a pending recipient from the campaign altogether
    pub fn drop_pending(&mut self, id: RecipientId) -> bool {
        self.pending.remove(id)
    }

    /// Failed -> Pending for every failed recipient
    pub fn retry_failed(&mut self) -> usize {
        let failed = self.failed.take();
        failed.into_iter().filter(|id| self.pending.insert(*id)).count()
    }

    /// Remove from Pending every id already delivered elsewhere
    pub fn exclude(&mut self, delivered: &RecipientSet) -> usize {
        self.pending.subtract(delivered)
    }

    pub fn is_consistent(&self) -> bool {
        self.pending.is_disjoint(&self.succeeded)
            && self.pending.is_disjoint(&self.failed)
            && self.succeeded.is_disjoint(&self.failed)
    }
}

/// Outcome of one successful delivery, committed atomically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySuccess {
    pub campaign_id: CampaignId,
    pub recipient_id: RecipientId,
    pub account_id: AccountId,
    pub today: NaiveDate,
}

// ============================================================================
// Messages
// ============================================================================

/// Inline asset (image, signature) referenced by a message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineAssetRef {
    pub content_id: String,
    pub path: String,
    pub content_type: String,
}

/// Message a campaign sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MassMailMessage {
    pub id: MessageRef,
    pub subject: String,
    pub html_body: String,
    pub plain_body: String,
    #[serde(default)]
    pub inline_assets: Vec<InlineAssetRef>,
}

// ============================================================================
// Reports
// ============================================================================

/// Format one report line
pub fn report_line(at: Timestamp, message: &str) -> String {
    format!("{} {}", at.format("%Y-%m-%d %H:%M:%S"), message)
}

/// Prepend a line to a reverse-chronological report
pub fn prepend_report(report: &mut String, line: &str) {
    if report.is_empty() {
        *report = line.to_string();
    } else {
        *report = format!("{}\n{}", line, report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[test]
    fn test_daily_counter_rolls_over() {
        let mut counter = DailyCounter::default();
        counter.record(date(4));
        counter.record(date(4));
        assert_eq!(counter, DailyCounter::new(2, Some(date(4))));
        assert_eq!(counter.current(date(5)), 0);

        counter.record(date(5));
        assert_eq!(counter, DailyCounter::new(1, Some(date(5))));
        assert!(!counter.roll_over(date(5)));
    }

    #[test]
    fn test_rotation_queue_cycles() {
        let mut queue = RotationQueue::from_ids([10, 20, 30]);
        let first_round: Vec<_> = (0..3).filter_map(|_| queue.next()).collect();
        assert_eq!(first_round, vec![10, 20, 30]);
        assert_eq!(queue.next(), Some(10));
    }

    #[test]
    fn test_rotation_queue_unique() {
        let mut queue = RotationQueue::new();
        assert!(queue.add(1));
        assert!(!queue.add(1));
        assert!(queue.add(2));
        assert_eq!(queue.to_vec(), vec![1, 2]);
        assert!(queue.remove(1));
        assert!(!queue.remove(1));
        assert_eq!(queue.to_vec(), vec![2]);
        assert_eq!(RotationQueue::new().next(), None);
    }

    #[test]
    fn test_recipient_accessors() {
        let contact = Recipient::Contact(Contact {
            id: 7,
            owner_id: 1,
            company_id: Some(3),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            company_name: Some("Engines Ltd".to_string()),
            email: "ada@example.com".to_string(),
            allow_mass_mail: true,
        });
        assert_eq!(contact.key(), RecipientKey::contact(7));
        assert_eq!(contact.full_name(), "Ada Lovelace");
        assert_eq!(contact.company_name(), "Engines Ltd");
        assert_eq!(contact.absolute_reference(), "/crm/contact/7/");
        assert_eq!(contact.parent(), Some(RecipientKey::company(3)));

        let company = Recipient::Company(Company {
            id: 3,
            owner_id: 1,
            name: "Engines Ltd".to_string(),
            email: "info@engines.example".to_string(),
            allow_mass_mail: true,
        });
        assert_eq!(company.full_name(), "Engines Ltd");
        assert_eq!(company.first_name(), "");
        assert_eq!(company.parent(), None);
    }

    #[test]
    fn test_lead_full_name_trims_missing_parts() {
        let mut lead = Recipient::Lead(Lead {
            id: 1,
            owner_id: 1,
            first_name: String::new(),
            last_name: "Hopper".to_string(),
            company_name: None,
            email: "grace@example.com".to_string(),
            allow_mass_mail: true,
        });
        assert_eq!(lead.full_name(), "Hopper");
        lead.set_allow_mass_mail(false);
        assert!(!lead.allow_mass_mail());
    }

    #[test]
    fn test_assignment_validity() {
        let assignment = RecipientAssignment {
            recipient: RecipientKey::lead(1),
            account_id: Some(5),
            account_owner: Some(9),
            allow_mass_mail: true,
            unsubscribe_token: Uuid::new_v4(),
        };
        assert!(assignment.is_valid_for(9));
        assert!(!assignment.is_valid_for(8));

        let orphaned = RecipientAssignment {
            account_id: None,
            account_owner: None,
            ..assignment
        };
        assert!(!orphaned.is_valid_for(9));
    }

    #[test]
    fn test_campaign_status_strings() {
        for status in [
            CampaignStatus::Active,
            CampaignStatus::ActiveWithError,
            CampaignStatus::Paused,
            CampaignStatus::Interrupted,
            CampaignStatus::Done,
        ] {
            assert_eq!(status.to_string().parse::<CampaignStatus>().unwrap(), status);
        }
        assert!(CampaignStatus::ActiveWithError.is_sendable());
        assert!(!CampaignStatus::Paused.is_sendable());
    }

    #[test]
    fn test_recipient_set_text_form() {
        let set: RecipientSet = "3, 1,2,3,".parse().unwrap();
        assert_eq!(set.to_vec(), vec![3, 1, 2]);
        assert_eq!(set.to_string(), "3,1,2");
        assert_eq!(RecipientSet::new().to_string(), "");
        assert!("1,x".parse::<RecipientSet>().is_err());

        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, "\"3,1,2\"");
        let back: RecipientSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn test_recipient_set_removal_keeps_order() {
        let mut set: RecipientSet = [5, 4, 3, 2, 1].into_iter().collect();
        assert!(set.remove(3));
        assert!(!set.remove(3));
        assert!(set.insert(3));
        assert_eq!(set.to_vec(), vec![5, 4, 2, 1, 3]);
        assert_eq!(set, [5, 4, 2, 1, 3].into_iter().collect());
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn test_recipient_set_drains_large_snapshot() {
        let ids: Vec<RecipientId> = (1..=200_000).collect();
        let mut progress = CampaignProgress::from_snapshot(ids.iter().copied());
        for &id in ids.iter().rev().step_by(2).chain(ids.iter().step_by(2)) {
            assert!(progress.mark_succeeded(id));
        }
        assert!(progress.pending.is_empty());
        assert_eq!(progress.succeeded.len(), ids.len());
        assert!(progress.is_consistent());
    }

    #[test]
    fn test_progress_transitions_keep_sets_disjoint() {
        let mut progress = CampaignProgress::from_snapshot([1, 2, 3, 4, 2]);
        assert_eq!(progress.total(), 4);

        assert!(progress.mark_succeeded(1));
        assert!(!progress.mark_succeeded(1));
        assert!(!progress.mark_failed(1));
        assert!(progress.mark_failed(2));
        assert!(progress.drop_pending(3));
        assert!(progress.is_consistent());

        assert_eq!(progress.pending.to_vec(), vec![4]);
        assert_eq!(progress.succeeded.to_vec(), vec![1]);
        assert_eq!(progress.failed.to_vec(), vec![2]);
        assert_eq!(progress.total(), 3);
        assert_eq!(progress.state_of(2), Some(RecipientState::Failed));
        assert_eq!(progress.state_of(3), None);
    }

    #[test]
    fn test_progress_retry_and_exclude() {
        let mut progress = CampaignProgress::from_snapshot([1, 2, 3]);
        progress.mark_failed(1);
        progress.mark_failed(2);

        assert_eq!(progress.retry_failed(), 2);
        assert!(progress.failed.is_empty());
        assert_eq!(progress.pending.to_vec(), vec![3, 1, 2]);

        let delivered: RecipientSet = [2, 3, 99].into_iter().collect();
        assert_eq!(progress.exclude(&delivered), 2);
        assert_eq!(progress.pending.to_vec(), vec![1]);
        assert!(progress.is_consistent());
    }

    #[test]
    fn test_report_prepends_newest_first() {
        let mut report = String::new();
        prepend_report(&mut report, "first");
        prepend_report(&mut report, "second");
        assert_eq!(report, "second\nfirst");

        let at = DateTime::parse_from_rfc3339("2024-03-04T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(report_line(at, "Done successfully"), "2024-03-04 10:00:00 Done successfully");
    }
}
