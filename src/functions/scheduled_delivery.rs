use crate::schema::{ScheduledMessage, WhatsappChannel};
use crate::services::chat_id::{WHATSAPP_USER_SUFFIX, to_chat_id};
use crate::services::delivery_settings::{DeliverySettings, MAX_BATCH_LIMIT};
use crate::services::waha_client::{ChannelCredentials, MessageSender, SendTextRequest};
use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Failed attempts allowed before a message is given up on.
pub const RETRY_LIMIT: i32 = 3;
/// Fixed, non-exponential delay between attempts.
pub const RETRY_DELAY_MINUTES: i64 = 5;
pub const BLOCKED_DIAGNOSTIC: &str = "Contact blocked from bot";

const EVENT_SOURCE: &str = "scheduler";

const MESSAGE_COLUMNS: &str = "id, owner_id, recipient_identifier, body, channel_name, retry_count, \
     scheduled_for, status, error_message, sent_at, last_retry_at, claim_token, claim_expires_at, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Reschedule {
        retry_count: i32,
        scheduled_for: DateTime<Utc>,
        error_message: String,
    },
    GiveUp {
        error_message: String,
    },
}

pub fn retry_decision(retry_count: i32, detail: &str, now: DateTime<Utc>) -> RetryDecision {
    if retry_count < RETRY_LIMIT {
        RetryDecision::Reschedule {
            retry_count: retry_count + 1,
            scheduled_for: now + chrono::Duration::minutes(RETRY_DELAY_MINUTES),
            error_message: detail.to_string(),
        }
    } else {
        RetryDecision::GiveUp {
            error_message: format!("Max retries ({RETRY_LIMIT}) exceeded. Last error: {detail}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Sent,
    Skipped,
    Rescheduled,
    Failed,
    /// Left claimed after a store error or a lost lease; lease expiry requeues it.
    Deferred,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub total: u32,
    pub sent: u32,
    pub failed: u32,
    pub skipped: u32,
    pub retrying: u32,
}

impl DeliverySummary {
    pub fn record(&mut self, outcome: MessageOutcome) {
        self.total += 1;
        match outcome {
            MessageOutcome::Sent => self.sent += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::Failed => self.failed += 1,
            MessageOutcome::Rescheduled | MessageOutcome::Deferred => self.retrying += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Sent {
        at: DateTime<Utc>,
    },
    Skipped,
    Rescheduled {
        retry_count: i32,
        at: DateTime<Utc>,
        scheduled_for: DateTime<Utc>,
        error_message: String,
    },
    Failed {
        error_message: String,
    },
}

impl Transition {
    fn action(&self) -> &'static str {
        match self {
            Self::Sent { .. } => "message_sent",
            Self::Skipped => "message_skipped",
            Self::Rescheduled { .. } => "message_rescheduled",
            Self::Failed { .. } => "message_failed",
        }
    }

    fn outcome(&self) -> MessageOutcome {
        match self {
            Self::Sent { .. } => MessageOutcome::Sent,
            Self::Skipped => MessageOutcome::Skipped,
            Self::Rescheduled { .. } => MessageOutcome::Rescheduled,
            Self::Failed { .. } => MessageOutcome::Failed,
        }
    }

    fn payload(&self, message: &ScheduledMessage) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "message_id": message.id,
            "owner_id": message.owner_id,
            "channel_name": message.channel_name,
        });
        match self {
            Self::Sent { .. } => {}
            Self::Skipped => payload["error"] = BLOCKED_DIAGNOSTIC.into(),
            Self::Rescheduled {
                retry_count,
                scheduled_for,
                error_message,
                ..
            } => {
                payload["retry_count"] = (*retry_count).into();
                payload["scheduled_for"] = scheduled_for.to_rfc3339().into();
                payload["error"] = error_message.as_str().into();
            }
            Self::Failed { error_message } => payload["error"] = error_message.as_str().into(),
        }
        payload
    }
}

/// Moves claims whose lease ran out back to `pending`. Counters are untouched:
/// an expired claim is not a delivery attempt.
pub async fn requeue_expired_claims(db: &PgPool, now: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_messages
        SET status = 'pending', claim_token = NULL, claim_expires_at = NULL
        WHERE status = 'processing' AND claim_expires_at <= $1
        "#,
    )
    .bind(now)
    .execute(db)
    .await?;
    Ok(result.rows_affected())
}

/// Claims up to `limit` due rows for `claim_token`, earliest due first.
/// Rows locked or claimed by a concurrent invocation are skipped.
pub async fn claim_due_messages(
    db: &PgPool,
    claim_token: Uuid,
    now: DateTime<Utc>,
    lease_until: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ScheduledMessage>> {
    let sql = format!(
        r#"
        UPDATE scheduled_messages
        SET status = 'processing', claim_token = $1, claim_expires_at = $3
        WHERE id IN (
            SELECT id FROM scheduled_messages
            WHERE status = 'pending' AND scheduled_for <= $2
            ORDER BY scheduled_for, created_at, id
            LIMIT $4
            FOR UPDATE SKIP LOCKED
        )
        RETURNING {MESSAGE_COLUMNS}
        "#
    );
    let mut claimed = sqlx::query_as::<_, ScheduledMessage>(&sql)
        .bind(claim_token)
        .bind(now)
        .bind(lease_until)
        .bind(limit.clamp(1, MAX_BATCH_LIMIT))
        .fetch_all(db)
        .await?;

    // RETURNING carries no order
    claimed.sort_by(|a, b| {
        (a.scheduled_for, a.created_at, a.id).cmp(&(b.scheduled_for, b.created_at, b.id))
    });
    Ok(claimed)
}

pub async fn is_blocked(db: &PgPool, owner_id: Uuid, recipient_identifier: &str) -> Result<bool> {
    let blocked = sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM bot_blocked_contacts
            WHERE owner_id = $1 AND recipient_identifier = $2
        )
        "#,
    )
    .bind(owner_id)
    .bind(recipient_identifier)
    .fetch_one(db)
    .await?;
    Ok(blocked)
}

/// Writes a transition and its audit event, guarded by the claim token.
/// Returns false when the claim was lost to lease expiry.
async fn apply_transition(
    db: &PgPool,
    message: &ScheduledMessage,
    claim_token: Uuid,
    transition: &Transition,
) -> Result<bool> {
    let mut tx = db.begin().await?;

    let result = match transition {
        Transition::Sent { at } => {
            sqlx::query(
                r#"
                UPDATE scheduled_messages
                SET status = 'sent', sent_at = $3, claim_token = NULL, claim_expires_at = NULL
                WHERE id = $1 AND claim_token = $2 AND status = 'processing'
                "#,
            )
            .bind(message.id)
            .bind(claim_token)
            .bind(*at)
            .execute(&mut *tx)
            .await?
        }
        Transition::Skipped => {
            sqlx::query(
                r#"
                UPDATE scheduled_messages
                SET status = 'skipped', error_message = $3, claim_token = NULL, claim_expires_at = NULL
                WHERE id = $1 AND claim_token = $2 AND status = 'processing'
                "#,
            )
            .bind(message.id)
            .bind(claim_token)
            .bind(BLOCKED_DIAGNOSTIC)
            .execute(&mut *tx)
            .await?
        }
        Transition::Rescheduled {
            retry_count,
            at,
            scheduled_for,
            error_message,
        } => {
            sqlx::query(
                r#"
                UPDATE scheduled_messages
                SET status = 'pending', retry_count = $3, last_retry_at = $4, scheduled_for = $5,
                    error_message = $6, claim_token = NULL, claim_expires_at = NULL
                WHERE id = $1 AND claim_token = $2 AND status = 'processing'
                "#,
            )
            .bind(message.id)
            .bind(claim_token)
            .bind(*retry_count)
            .bind(*at)
            .bind(*scheduled_for)
            .bind(error_message)
            .execute(&mut *tx)
            .await?
        }
        Transition::Failed { error_message } => {
            sqlx::query(
                r#"
                UPDATE scheduled_messages
                SET status = 'failed', error_message = $3, claim_token = NULL, claim_expires_at = NULL
                WHERE id = $1 AND claim_token = $2 AND status = 'processing'
                "#,
            )
            .bind(message.id)
            .bind(claim_token)
            .bind(error_message)
            .execute(&mut *tx)
            .await?
        }
    };

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO events (trace_id, source, action, payload)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(claim_token)
    .bind(EVENT_SOURCE)
    .bind(transition.action())
    .bind(transition.payload(message))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Source of wall-clock time for claim cutoffs and row timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Extends a live claim before the send it guards. Returns false once the row
/// has been requeued or re-claimed under another token.
pub async fn renew_claim(
    db: &PgPool,
    message_id: Uuid,
    claim_token: Uuid,
    lease_until: DateTime<Utc>,
) -> Result<bool> {
    let renewed = sqlx::query_scalar::<_, Uuid>(
        r#"
        UPDATE scheduled_messages
        SET claim_expires_at = $3
        WHERE id = $1 AND claim_token = $2 AND status = 'processing'
        RETURNING id
        "#,
    )
    .bind(message_id)
    .bind(claim_token)
    .bind(lease_until)
    .fetch_optional(db)
    .await?;
    Ok(renewed.is_some())
}

pub struct DeliveryWorker {
    sender: Arc<dyn MessageSender>,
    settings: DeliverySettings,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    pub fn new(sender: Arc<dyn MessageSender>, settings: DeliverySettings) -> Self {
        Self {
            sender,
            settings,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn lease_from(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        at.checked_add_signed(self.settings.lease).ok_or_else(|| {
            ForgeError::Internal(format!(
                "claim lease of {}s overflows from {at}",
                self.settings.lease.num_seconds()
            ))
        })
    }

    /// One pass over at most one batch. The clock reading taken here is only
    /// the due cutoff and the initial lease; each row's timestamps are read
    /// again when its send returns. Only a failure to claim the batch is
    /// returned as an error; every per-message failure becomes a row
    /// transition and a count in the summary.
    pub async fn run_once(&self, db: &PgPool) -> Result<DeliverySummary> {
        let cutoff = self.clock.now();
        let lease_until = self.lease_from(cutoff)?;

        let requeued = requeue_expired_claims(db, cutoff).await?;
        if requeued > 0 {
            tracing::warn!(requeued, "scheduled delivery: requeued expired claims");
        }

        let claim_token = Uuid::new_v4();
        let batch = claim_due_messages(
            db,
            claim_token,
            cutoff,
            lease_until,
            self.settings.batch_limit,
        )
        .await?;

        let mut summary = DeliverySummary::default();
        if batch.is_empty() {
            return Ok(summary);
        }

        tracing::debug!(
            count = batch.len(),
            %claim_token,
            "scheduled delivery: processing batch"
        );

        for message in &batch {
            let outcome = match self.process_message(db, message, claim_token).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(
                        message_id = %message.id,
                        owner_id = %message.owner_id,
                        error = %e,
                        "scheduled delivery: message left claimed until lease expiry"
                    );
                    MessageOutcome::Deferred
                }
            };
            summary.record(outcome);
        }

        tracing::info!(
            total = summary.total,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            retrying = summary.retrying,
            "scheduled delivery: batch done"
        );
        Ok(summary)
    }

    async fn process_message(
        &self,
        db: &PgPool,
        message: &ScheduledMessage,
        claim_token: Uuid,
    ) -> Result<MessageOutcome> {
        let transition = if is_blocked(db, message.owner_id, &message.recipient_identifier).await? {
            tracing::info!(
                message_id = %message.id,
                owner_id = %message.owner_id,
                "scheduled delivery: recipient blocked, skipping"
            );
            Transition::Skipped
        } else {
            let lease_until = self.lease_from(self.clock.now())?;
            if !renew_claim(db, message.id, claim_token, lease_until).await? {
                tracing::warn!(
                    message_id = %message.id,
                    %claim_token,
                    "scheduled delivery: claim lost before send, not dispatching"
                );
                return Ok(MessageOutcome::Deferred);
            }
            self.dispatch(db, message).await?
        };

        if !apply_transition(db, message, claim_token, &transition).await? {
            tracing::warn!(
                message_id = %message.id,
                action = transition.action(),
                "scheduled delivery: claim lost before state write"
            );
            return Ok(MessageOutcome::Deferred);
        }
        Ok(transition.outcome())
    }

    async fn dispatch(&self, db: &PgPool, message: &ScheduledMessage) -> Result<Transition> {
        let channel = self
            .resolve_channel(db, message.owner_id, &message.channel_name)
            .await?;
        let request = SendTextRequest::new(
            to_chat_id(&message.recipient_identifier, WHATSAPP_USER_SUFFIX),
            message.body.clone(),
            channel.session.clone(),
        );

        tracing::info!(
            message_id = %message.id,
            chat_id = %request.chat_id,
            session = %request.session,
            attempt = message.retry_count + 1,
            "scheduled delivery: sending message"
        );

        let result = self.sender.send_text(&channel, &request).await;
        let at = self.clock.now();
        let transition = match result {
            Ok(()) => Transition::Sent { at },
            Err(e) => {
                let detail = format!("{e:#}");
                match retry_decision(message.retry_count, &detail, at) {
                    RetryDecision::Reschedule {
                        retry_count,
                        scheduled_for,
                        error_message,
                    } => {
                        tracing::warn!(
                            message_id = %message.id,
                            retry_count,
                            error = %detail,
                            "scheduled delivery: send failed, rescheduling"
                        );
                        Transition::Rescheduled {
                            retry_count,
                            at,
                            scheduled_for,
                            error_message,
                        }
                    }
                    RetryDecision::GiveUp { error_message } => {
                        tracing::error!(
                            message_id = %message.id,
                            retry_count = message.retry_count,
                            error = %detail,
                            "scheduled delivery: retries exhausted"
                        );
                        Transition::Failed { error_message }
                    }
                }
            }
        };
        Ok(transition)
    }

    async fn resolve_channel(
        &self,
        db: &PgPool,
        owner_id: Uuid,
        channel_name: &str,
    ) -> Result<ChannelCredentials> {
        let configured = sqlx::query_as::<_, WhatsappChannel>(
            r#"
            SELECT owner_id, session_name, api_url, api_key, created_at
            FROM whatsapp_channels
            WHERE owner_id = $1 AND session_name = $2
            "#,
        )
        .bind(owner_id)
        .bind(channel_name)
        .fetch_optional(db)
        .await?;

        Ok(match configured {
            Some(row) => ChannelCredentials {
                api_url: row.api_url,
                api_key: row.api_key,
                session: row.session_name,
            },
            None => self.settings.fallback_channel(channel_name),
        })
    }
}

#[forge::daemon]
pub async fn scheduled_delivery(ctx: &DaemonContext) -> Result<()> {
    let poll_ms: u64 = ctx.env_parse("SCHEDULED_DELIVERY_POLL_MS").unwrap_or(60_000);
    let worker = crate::get_delivery_worker()?;

    loop {
        tokio::select! {
            _ = ctx.shutdown_signal() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(poll_ms)) => {
                match worker.run_once(ctx.db()).await {
                    Ok(summary) if summary.total > 0 => {
                        tracing::info!(total = summary.total, "scheduled delivery tick")
                    }
                    Err(e) => tracing::error!(error = %e, "scheduled delivery tick failed"),
                    _ => {}
                }
            }
        }
    }
    Ok(())
}
