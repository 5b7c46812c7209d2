//! PostgreSQL store

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use mailout_common::types::{
    AccountId, CampaignId, MessageRef, RecipientId, RecipientKey, RecipientKind, UserId,
};
use mailout_common::{Error, Result};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::MailoutStore;
use crate::db::DatabasePool;
use crate::models::{
    CampaignProgress, CampaignStatus, Company, Contact, DailyCounter, DeliverySuccess, Lead,
    MailingOut, MassMailMessage, InlineAssetRef, NewMailingOut, NewSendingAccount, Recipient,
    RecipientAssignment, RecipientSet, RecipientState, SendingAccount,
};

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

// ============================================================================
// Row types
// ============================================================================

#[derive(FromRow)]
struct AccountRow {
    id: i64,
    owner_id: i64,
    from_address: String,
    from_name: Option<String>,
    smtp_host: String,
    smtp_port: i32,
    smtp_username: Option<String>,
    smtp_password: Option<String>,
    use_starttls: bool,
    allow_mass_mail: bool,
    is_primary: bool,
    sent_today: i32,
    quota_date: Option<NaiveDate>,
    report: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for SendingAccount {
    type Error = Error;

    fn try_from(row: AccountRow) -> Result<Self> {
        let smtp_port = u16::try_from(row.smtp_port)
            .map_err(|_| Error::Storage(format!("Invalid SMTP port {}", row.smtp_port)))?;
        Ok(SendingAccount {
            id: row.id,
            owner_id: row.owner_id,
            from_address: row.from_address,
            from_name: row.from_name,
            smtp_host: row.smtp_host,
            smtp_port,
            smtp_username: row.smtp_username,
            smtp_password: row.smtp_password,
            use_starttls: row.use_starttls,
            allow_mass_mail: row.allow_mass_mail,
            is_primary: row.is_primary,
            quota: DailyCounter::new(row.sent_today, row.quota_date),
            report: row.report,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct RecipientRow {
    kind: String,
    id: i64,
    owner_id: i64,
    parent_id: Option<i64>,
    email: String,
    name: String,
    first_name: String,
    last_name: String,
    company_name: Option<String>,
    allow_mass_mail: bool,
}

impl TryFrom<RecipientRow> for Recipient {
    type Error = Error;

    fn try_from(row: RecipientRow) -> Result<Self> {
        let recipient = match row.kind.parse::<RecipientKind>()? {
            RecipientKind::Company => Recipient::Company(Company {
                id: row.id,
                owner_id: row.owner_id,
                name: row.name,
                email: row.email,
                allow_mass_mail: row.allow_mass_mail,
            }),
            RecipientKind::Contact => Recipient::Contact(Contact {
                id: row.id,
                owner_id: row.owner_id,
                company_id: row.parent_id,
                first_name: row.first_name,
                last_name: row.last_name,
                company_name: row.company_name,
                email: row.email,
                allow_mass_mail: row.allow_mass_mail,
            }),
            RecipientKind::Lead => Recipient::Lead(Lead {
                id: row.id,
                owner_id: row.owner_id,
                first_name: row.first_name,
                last_name: row.last_name,
                company_name: row.company_name,
                email: row.email,
                allow_mass_mail: row.allow_mass_mail,
            }),
        };
        Ok(recipient)
    }
}

#[derive(FromRow)]
struct AssignmentRow {
    kind: String,
    id: i64,
    account_id: Option<i64>,
    account_owner: Option<i64>,
    allow_mass_mail: bool,
    unsubscribe_token: Uuid,
}

impl TryFrom<AssignmentRow> for RecipientAssignment {
    type Error = Error;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        Ok(RecipientAssignment {
            recipient: RecipientKey::new(row.kind.parse()?, row.id),
            account_id: row.account_id,
            account_owner: row.account_owner,
            allow_mass_mail: row.allow_mass_mail,
            unsubscribe_token: row.unsubscribe_token,
        })
    }
}

#[derive(FromRow)]
struct CampaignRow {
    id: i64,
    owner_id: i64,
    message_ref: i64,
    recipient_kind: String,
    status: String,
    recipients_number: i32,
    today_count: i32,
    last_send_date: Option<NaiveDate>,
    report: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CampaignRow> for MailingOut {
    type Error = Error;

    fn try_from(row: CampaignRow) -> Result<Self> {
        Ok(MailingOut {
            id: row.id,
            owner_id: row.owner_id,
            message_ref: row.message_ref,
            recipient_kind: row.recipient_kind.parse()?,
            status: row.status.parse().map_err(Error::Storage)?,
            recipients_number: row.recipients_number,
            today: DailyCounter::new(row.today_count, row.last_send_date),
            report: row.report,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    subject: String,
    html_body: String,
    plain_body: String,
    inline_assets: Json<Vec<InlineAssetRef>>,
}

impl From<MessageRow> for MassMailMessage {
    fn from(row: MessageRow) -> Self {
        MassMailMessage {
            id: row.id,
            subject: row.subject,
            html_body: row.html_body,
            plain_body: row.plain_body,
            inline_assets: row.inline_assets.0,
        }
    }
}

const ASSIGNMENT_SELECT: &str = r#"
    SELECT ra.kind, ra.id, ra.account_id, sa.owner_id AS account_owner,
           ra.allow_mass_mail, ra.unsubscribe_token
    FROM recipient_assignments ra
    LEFT JOIN sending_accounts sa ON sa.id = ra.account_id
    WHERE ra.kind = $1 AND ra.id = $2
"#;

const REPORT_PREPEND: &str = r#"
    CASE WHEN report = '' THEN $2 ELSE $2 || E'\n' || report END
"#;

// ============================================================================
// Store
// ============================================================================

/// Store backed by PostgreSQL
#[derive(Clone)]
pub struct PgMailoutStore {
    pool: DatabasePool,
}

impl PgMailoutStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        self.pool.pool().begin().await.map_err(db_err)
    }

    async fn prepend_campaign_report(
        tx: &mut Transaction<'static, Postgres>,
        id: CampaignId,
        line: &str,
    ) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE mailing_outs SET report = {}, updated_at = NOW() WHERE id = $1",
            REPORT_PREPEND
        ))
        .bind(id)
        .bind(line)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl MailoutStore for PgMailoutStore {
    async fn create_account(&self, input: NewSendingAccount) -> Result<SendingAccount> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            INSERT INTO sending_accounts (
                owner_id, from_address, from_name, smtp_host, smtp_port, smtp_username,
                smtp_password, use_starttls, allow_mass_mail, is_primary
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(input.owner_id)
        .bind(&input.from_address)
        .bind(&input.from_name)
        .bind(&input.smtp_host)
        .bind(i32::from(input.smtp_port))
        .bind(&input.smtp_username)
        .bind(&input.smtp_password)
        .bind(input.use_starttls)
        .bind(input.allow_mass_mail)
        .bind(input.is_primary)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_err)?;

        row.try_into()
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<SendingAccount>> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM sending_accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(SendingAccount::try_from)
            .transpose()
    }

    async fn list_owner_accounts(&self, owner: UserId) -> Result<Vec<SendingAccount>> {
        sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM sending_accounts WHERE owner_id = $1 ORDER BY is_primary DESC, id",
        )
        .bind(owner)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?
        .into_iter()
        .map(SendingAccount::try_from)
        .collect()
    }

    async fn transfer_account(&self, id: AccountId, new_owner: UserId) -> Result<Option<UserId>> {
        let mut tx = self.begin().await?;

        let current: Option<(i64, bool)> = sqlx::query_as(
            "SELECT owner_id, allow_mass_mail FROM sending_accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some((previous, allowed)) = current else {
            return Ok(None);
        };

        sqlx::query("UPDATE sending_accounts SET owner_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(new_owner)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "UPDATE account_rotation_queues SET account_ids = array_remove(account_ids, $2) WHERE owner_id = $1",
        )
        .bind(previous)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if allowed {
            rotation_add_in(&mut tx, new_owner, id).await?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(Some(previous))
    }

    async fn set_account_mass_mail(&self, id: AccountId, allowed: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sending_accounts SET allow_mass_mail = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(allowed)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool> {
        let mut tx = self.begin().await?;

        sqlx::query(
            "UPDATE account_rotation_queues SET account_ids = array_remove(account_ids, $1) WHERE $1 = ANY(account_ids)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("UPDATE recipient_assignments SET account_id = NULL WHERE account_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let result = sqlx::query("DELETE FROM sending_accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn rotation_next(&self, owner: UserId) -> Result<Option<AccountId>> {
        // The popped head is the last element of the rotated array.
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE account_rotation_queues
            SET account_ids = account_ids[2:cardinality(account_ids)] || account_ids[1]
            WHERE owner_id = $1 AND cardinality(account_ids) > 0
            RETURNING account_ids[cardinality(account_ids)]
            "#,
        )
        .bind(owner)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)
    }

    async fn rotation_add(&self, owner: UserId, account: AccountId) -> Result<bool> {
        let mut tx = self.begin().await?;
        let added = rotation_add_in(&mut tx, owner, account).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(added)
    }

    async fn rotation_remove(&self, owner: UserId, account: AccountId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE account_rotation_queues
            SET account_ids = array_remove(account_ids, $2)
            WHERE owner_id = $1 AND $2 = ANY(account_ids)
            "#,
        )
        .bind(owner)
        .bind(account)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn rotation_snapshot(&self, owner: UserId) -> Result<Vec<AccountId>> {
        let ids: Option<Vec<i64>> = sqlx::query_scalar(
            "SELECT account_ids FROM account_rotation_queues WHERE owner_id = $1",
        )
        .bind(owner)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(ids.unwrap_or_default())
    }

    async fn upsert_recipient(&self, recipient: Recipient) -> Result<()> {
        let (name, parent_id) = match &recipient {
            Recipient::Company(c) => (c.name.clone(), None),
            Recipient::Contact(c) => (String::new(), c.company_id),
            Recipient::Lead(_) => (String::new(), None),
        };
        let company_name = match &recipient {
            Recipient::Company(_) => None,
            Recipient::Contact(c) => c.company_name.clone(),
            Recipient::Lead(l) => l.company_name.clone(),
        };

        sqlx::query(
            r#"
            INSERT INTO crm_recipients (
                kind, id, owner_id, parent_id, email, name, first_name, last_name,
                company_name, allow_mass_mail
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (kind, id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                parent_id = EXCLUDED.parent_id,
                email = EXCLUDED.email,
                name = EXCLUDED.name,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                company_name = EXCLUDED.company_name,
                allow_mass_mail = EXCLUDED.allow_mass_mail
            "#,
        )
        .bind(recipient.kind().to_string())
        .bind(recipient.id())
        .bind(recipient.owner())
        .bind(parent_id)
        .bind(recipient.email())
        .bind(name)
        .bind(recipient.first_name())
        .bind(recipient.last_name())
        .bind(company_name)
        .bind(recipient.allow_mass_mail())
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_recipient(&self, key: RecipientKey) -> Result<Option<Recipient>> {
        sqlx::query_as::<_, RecipientRow>("SELECT * FROM crm_recipients WHERE kind = $1 AND id = $2")
            .bind(key.kind.to_string())
            .bind(key.id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(Recipient::try_from)
            .transpose()
    }

    async fn delete_recipient(&self, key: RecipientKey) -> Result<bool> {
        let result = sqlx::query("DELETE FROM crm_recipients WHERE kind = $1 AND id = $2")
            .bind(key.kind.to_string())
            .bind(key.id)
            .execute(self.pool.pool())
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_assignment(&self, key: RecipientKey) -> Result<Option<RecipientAssignment>> {
        sqlx::query_as::<_, AssignmentRow>(ASSIGNMENT_SELECT)
            .bind(key.kind.to_string())
            .bind(key.id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(RecipientAssignment::try_from)
            .transpose()
    }

    async fn assign_recipient(
        &self,
        key: RecipientKey,
        account: AccountId,
    ) -> Result<RecipientAssignment> {
        sqlx::query(
            r#"
            INSERT INTO recipient_assignments (kind, id, account_id, allow_mass_mail, unsubscribe_token)
            VALUES ($1, $2, $3, TRUE, $4)
            ON CONFLICT (kind, id) DO UPDATE SET account_id = EXCLUDED.account_id
            "#,
        )
        .bind(key.kind.to_string())
        .bind(key.id)
        .bind(account)
        .bind(Uuid::new_v4())
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;

        self.get_assignment(key)
            .await?
            .ok_or_else(|| Error::Internal(format!("Assignment for {} vanished", key)))
    }

    async fn unsubscribe(&self, token: Uuid) -> Result<Option<RecipientKey>> {
        let mut tx = self.begin().await?;

        let row: Option<(String, i64)> = sqlx::query_as(
            "UPDATE recipient_assignments SET allow_mass_mail = FALSE WHERE unsubscribe_token = $1 RETURNING kind, id",
        )
        .bind(token)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some((kind, id)) = row else {
            return Ok(None);
        };

        sqlx::query("UPDATE crm_recipients SET allow_mass_mail = FALSE WHERE kind = $1 AND id = $2")
            .bind(&kind)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(Some(RecipientKey::new(kind.parse()?, id)))
    }

    async fn create_campaign(&self, input: NewMailingOut) -> Result<MailingOut> {
        let snapshot: RecipientSet = input.recipient_ids.into_iter().collect();
        let mut tx = self.begin().await?;

        let row = sqlx::query_as::<_, CampaignRow>(
            r#"
            INSERT INTO mailing_outs (owner_id, message_ref, recipient_kind, status, recipients_number)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(input.owner_id)
        .bind(input.message_ref)
        .bind(input.recipient_kind.to_string())
        .bind(CampaignStatus::Paused.to_string())
        .bind(snapshot.len() as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO mailing_out_recipients (mailing_out_id, recipient_id, state, position)
            SELECT $1, t.recipient_id, 'pending', t.position
            FROM UNNEST($2::BIGINT[]) WITH ORDINALITY AS t(recipient_id, position)
            "#,
        )
        .bind(row.id)
        .bind(snapshot.to_vec())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        debug!(campaign_id = row.id, recipients = snapshot.len(), "Campaign created");
        row.try_into()
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<Option<MailingOut>> {
        sqlx::query_as::<_, CampaignRow>("SELECT * FROM mailing_outs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_err)?
            .map(MailingOut::try_from)
            .transpose()
    }

    async fn list_campaigns_by_status(
        &self,
        statuses: &[CampaignStatus],
    ) -> Result<Vec<MailingOut>> {
        let statuses: Vec<String> = statuses.iter().map(ToString::to_string).collect();
        sqlx::query_as::<_, CampaignRow>(
            "SELECT * FROM mailing_outs WHERE status = ANY($1) ORDER BY id",
        )
        .bind(statuses)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?
        .into_iter()
        .map(MailingOut::try_from)
        .collect()
    }

    async fn load_progress(&self, id: CampaignId) -> Result<CampaignProgress> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT recipient_id, state FROM mailing_out_recipients
            WHERE mailing_out_id = $1
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_err)?;

        let mut progress = CampaignProgress::default();
        for (recipient_id, state) in rows {
            let set = match state.parse::<RecipientState>().map_err(Error::Storage)? {
                RecipientState::Pending => &mut progress.pending,
                RecipientState::Succeeded => &mut progress.succeeded,
                RecipientState::Failed => &mut progress.failed,
            };
            set.insert(recipient_id);
        }
        Ok(progress)
    }

    async fn set_campaign_status(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        report_line: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            "UPDATE mailing_outs SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if let Some(line) = report_line {
            Self::prepend_campaign_report(&mut tx, id, line).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_campaign_report(&self, id: CampaignId, line: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE mailing_outs SET report = {}, updated_at = NOW() WHERE id = $1",
            REPORT_PREPEND
        ))
        .bind(id)
        .bind(line)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_success(&self, success: &DeliverySuccess) -> Result<bool> {
        let mut tx = self.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE mailing_out_recipients SET state = 'succeeded'
            WHERE mailing_out_id = $1 AND recipient_id = $2 AND state = 'pending'
            "#,
        )
        .bind(success.campaign_id)
        .bind(success.recipient_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();
        if moved == 0 {
            return Ok(false);
        }

        let account = sqlx::query(
            r#"
            UPDATE sending_accounts SET
                sent_today = CASE WHEN quota_date = $2 THEN sent_today + 1 ELSE 1 END,
                quota_date = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(success.account_id)
        .bind(success.today)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if account.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Sending account {}", success.account_id)));
        }

        sqlx::query(
            r#"
            UPDATE mailing_outs SET
                today_count = CASE WHEN last_send_date = $2 THEN today_count + 1 ELSE 1 END,
                last_send_date = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(success.campaign_id)
        .bind(success.today)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn record_failure(
        &self,
        campaign: CampaignId,
        recipient: RecipientId,
        report_line: &str,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;

        let moved = sqlx::query(
            r#"
            UPDATE mailing_out_recipients SET state = 'failed'
            WHERE mailing_out_id = $1 AND recipient_id = $2 AND state = 'pending'
            "#,
        )
        .bind(campaign)
        .bind(recipient)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();
        if moved == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE mailing_outs SET status = 'active_with_error'
            WHERE id = $1 AND status IN ('active', 'active_with_error')
            "#,
        )
        .bind(campaign)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        Self::prepend_campaign_report(&mut tx, campaign, report_line).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn drop_recipient(&self, campaign: CampaignId, recipient: RecipientId) -> Result<bool> {
        let mut tx = self.begin().await?;

        let dropped = sqlx::query(
            r#"
            DELETE FROM mailing_out_recipients
            WHERE mailing_out_id = $1 AND recipient_id = $2 AND state = 'pending'
            "#,
        )
        .bind(campaign)
        .bind(recipient)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if dropped > 0 {
            sqlx::query(
                "UPDATE mailing_outs SET recipients_number = recipients_number - 1, updated_at = NOW() WHERE id = $1",
            )
            .bind(campaign)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(dropped > 0)
    }

    async fn suspend_account(
        &self,
        account: AccountId,
        campaign: CampaignId,
        report_line: &str,
    ) -> Result<bool> {
        let mut tx = self.begin().await?;

        let owner: Option<i64> = sqlx::query_scalar(&format!(
            r#"
            UPDATE sending_accounts
            SET allow_mass_mail = FALSE, report = {}, updated_at = NOW()
            WHERE id = $1
            RETURNING owner_id
            "#,
            REPORT_PREPEND
        ))
        .bind(account)
        .bind(report_line)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        let Some(owner) = owner else {
            return Ok(false);
        };

        sqlx::query(
            "UPDATE account_rotation_queues SET account_ids = array_remove(account_ids, $2) WHERE owner_id = $1",
        )
        .bind(owner)
        .bind(account)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        Self::prepend_campaign_report(&mut tx, campaign, report_line).await?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn retry_failed(&self, campaign: CampaignId) -> Result<usize> {
        // Retried recipients go to the back of the pending order.
        let result = sqlx::query(
            r#"
            UPDATE mailing_out_recipients
            SET state = 'pending',
                position = position + (
                    SELECT COALESCE(MAX(position), 0) FROM mailing_out_recipients WHERE mailing_out_id = $1
                )
            WHERE mailing_out_id = $1 AND state = 'failed'
            "#,
        )
        .bind(campaign)
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() as usize)
    }

    async fn exclude_delivered(&self, campaign: CampaignId) -> Result<usize> {
        let mut tx = self.begin().await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM mailing_out_recipients target
            USING mailing_outs this
            WHERE target.mailing_out_id = $1
              AND target.state = 'pending'
              AND this.id = $1
              AND EXISTS (
                  SELECT 1
                  FROM mailing_out_recipients delivered
                  JOIN mailing_outs other ON other.id = delivered.mailing_out_id
                  WHERE other.id <> $1
                    AND other.message_ref = this.message_ref
                    AND other.recipient_kind = this.recipient_kind
                    AND delivered.state = 'succeeded'
                    AND delivered.recipient_id = target.recipient_id
              )
            "#,
        )
        .bind(campaign)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        if removed > 0 {
            sqlx::query(
                "UPDATE mailing_outs SET recipients_number = recipients_number - $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(campaign)
            .bind(removed as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(removed as usize)
    }

    async fn get_message(&self, id: MessageRef) -> Result<Option<MassMailMessage>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT id, subject, html_body, plain_body, inline_assets FROM mass_mail_messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(row.map(MassMailMessage::from))
    }

    async fn put_message(&self, message: MassMailMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mass_mail_messages (id, subject, html_body, plain_body, inline_assets)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                subject = EXCLUDED.subject,
                html_body = EXCLUDED.html_body,
                plain_body = EXCLUDED.plain_body,
                inline_assets = EXCLUDED.inline_assets
            "#,
        )
        .bind(message.id)
        .bind(&message.subject)
        .bind(&message.html_body)
        .bind(&message.plain_body)
        .bind(Json(&message.inline_assets))
        .execute(self.pool.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.pool.health_check().await
    }
}

async fn rotation_add_in(
    tx: &mut Transaction<'static, Postgres>,
    owner: UserId,
    account: AccountId,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO account_rotation_queues (owner_id, account_ids)
        VALUES ($1, ARRAY[$2::BIGINT])
        ON CONFLICT (owner_id) DO UPDATE
            SET account_ids = array_append(account_rotation_queues.account_ids, $2::BIGINT)
            WHERE NOT ($2::BIGINT = ANY(account_rotation_queues.account_ids))
        "#,
    )
    .bind(owner)
    .bind(account)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(result.rows_affected() > 0)
}
