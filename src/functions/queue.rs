use crate::schema::*;
use forge::prelude::*;
use uuid::Uuid;

const MAX_LIST_LIMIT: i64 = 500;

fn list_limit(requested: Option<i64>) -> i64 {
    requested.unwrap_or(100).clamp(1, MAX_LIST_LIMIT)
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListScheduledMessagesInput {
    pub status: Option<String>,
    pub owner_id: Option<Uuid>,
    pub limit: Option<i64>,
}

pub async fn fetch_scheduled_messages<'e, E>(
    db: E,
    input: &ListScheduledMessagesInput,
) -> Result<Vec<ScheduledMessage>>
where
    E: sqlx::PgExecutor<'e>,
{
    let status = input
        .status
        .as_deref()
        .map(str::parse::<MessageStatus>)
        .transpose()
        .map_err(ForgeError::Validation)?;

    sqlx::query_as::<_, ScheduledMessage>(
        r#"
        SELECT id, owner_id, recipient_identifier, body, channel_name, retry_count,
               scheduled_for, status, error_message, sent_at, last_retry_at,
               claim_token, claim_expires_at, created_at
        FROM scheduled_messages
        WHERE ($1::text IS NULL OR status = $1)
          AND ($2::uuid IS NULL OR owner_id = $2)
        ORDER BY scheduled_for DESC, id DESC
        LIMIT $3
        "#,
    )
    .bind(status.map(MessageStatus::as_str))
    .bind(input.owner_id)
    .bind(list_limit(input.limit))
    .fetch_all(db)
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))
}

#[forge::query]
pub async fn list_scheduled_messages(
    ctx: &QueryContext,
    input: ListScheduledMessagesInput,
) -> Result<Vec<ScheduledMessage>> {
    fetch_scheduled_messages(ctx.db(), &input).await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetQueueHealthInput {}

#[derive(Debug, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct QueueHealthView {
    pub pending: i64,
    pub due: i64,
    pub processing: i64,
    /// Claims past their lease that the next invocation will requeue.
    pub stale_claims: i64,
    pub sent: i64,
    pub failed: i64,
    pub skipped: i64,
}

pub async fn fetch_queue_health<'e, E>(db: E) -> Result<QueueHealthView>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, QueueHealthView>(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'pending') AS pending,
            COUNT(*) FILTER (WHERE status = 'pending' AND scheduled_for <= now()) AS due,
            COUNT(*) FILTER (WHERE status = 'processing') AS processing,
            COUNT(*) FILTER (WHERE status = 'processing'
                AND claim_expires_at <= now()) AS stale_claims,
            COUNT(*) FILTER (WHERE status = 'sent') AS sent,
            COUNT(*) FILTER (WHERE status = 'failed') AS failed,
            COUNT(*) FILTER (WHERE status = 'skipped') AS skipped
        FROM scheduled_messages
        "#,
    )
    .fetch_one(db)
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))
}

#[forge::query]
pub async fn get_queue_health(
    ctx: &QueryContext,
    _input: GetQueueHealthInput,
) -> Result<QueueHealthView> {
    fetch_queue_health(ctx.db()).await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListBlockedContactsInput {
    pub owner_id: Uuid,
}

pub async fn fetch_blocked_contacts<'e, E>(db: E, owner_id: Uuid) -> Result<Vec<BlockedContact>>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, BlockedContact>(
        r#"
        SELECT owner_id, recipient_identifier, created_at
        FROM bot_blocked_contacts
        WHERE owner_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(owner_id)
    .fetch_all(db)
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))
}

#[forge::query]
pub async fn list_blocked_contacts(
    ctx: &QueryContext,
    input: ListBlockedContactsInput,
) -> Result<Vec<BlockedContact>> {
    fetch_blocked_contacts(ctx.db(), input.owner_id).await
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListDeliveryEventsInput {
    pub message_id: Option<Uuid>,
    pub limit: Option<i64>,
}

pub async fn fetch_delivery_events<'e, E>(db: E, input: &ListDeliveryEventsInput) -> Result<Vec<Event>>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, Event>(
        r#"
        SELECT id, trace_id, source, action, payload, created_at
        FROM events
        WHERE source = 'scheduler'
          AND ($1::uuid IS NULL OR payload->>'message_id' = $1::text)
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(input.message_id)
    .bind(list_limit(input.limit))
    .fetch_all(db)
    .await
    .map_err(|e| ForgeError::Database(e.to_string()))
}

#[forge::query]
pub async fn list_delivery_events(
    ctx: &QueryContext,
    input: ListDeliveryEventsInput,
) -> Result<Vec<Event>> {
    fetch_delivery_events(ctx.db(), &input).await
}
