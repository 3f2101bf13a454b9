use chrono::{DateTime, Utc};
use forge::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[forge::model]
pub struct BlockedContact {
    pub owner_id: Uuid,
    pub recipient_identifier: String,
    pub created_at: DateTime<Utc>,
}
