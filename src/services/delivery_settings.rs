use crate::services::waha_client::{ChannelCredentials, REQUEST_TIMEOUT};

/// Hard ceiling on rows claimed per invocation.
pub const MAX_BATCH_LIMIT: i64 = 50;

const DEFAULT_API_URL: &str = "http://localhost:3000";
const DEFAULT_SESSION: &str = "default";
const DEFAULT_LEASE_SECS: i64 = 900;

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Fallback channel for tenants without a row in `whatsapp_channels`.
    pub default_channel: ChannelCredentials,
    pub batch_limit: i64,
    pub lease: chrono::Duration,
}

impl DeliverySettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_key = lookup("WAHA_API_KEY")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("WAHA_API_KEY required for scheduled delivery"))?;
        let api_url = lookup("WAHA_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let session = lookup("WAHA_SESSION").unwrap_or_else(|| DEFAULT_SESSION.to_string());

        let batch_limit = match lookup("SCHEDULED_DELIVERY_BATCH_LIMIT") {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| anyhow::anyhow!("invalid SCHEDULED_DELIVERY_BATCH_LIMIT `{raw}`: {e}"))?,
            None => MAX_BATCH_LIMIT,
        };
        let lease_secs = match lookup("SCHEDULED_DELIVERY_LEASE_SECS") {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| anyhow::anyhow!("invalid SCHEDULED_DELIVERY_LEASE_SECS `{raw}`: {e}"))?,
            None => DEFAULT_LEASE_SECS,
        };
        let batch_limit = batch_limit.clamp(1, MAX_BATCH_LIMIT);
        // a whole batch of timed-out sends must fit inside one lease
        let min_lease_secs = batch_limit * REQUEST_TIMEOUT.as_secs() as i64;
        if lease_secs < min_lease_secs {
            anyhow::bail!(
                "SCHEDULED_DELIVERY_LEASE_SECS must be at least {min_lease_secs} for a batch of {batch_limit}"
            );
        }
        let lease = chrono::Duration::try_seconds(lease_secs)
            .ok_or_else(|| anyhow::anyhow!("SCHEDULED_DELIVERY_LEASE_SECS `{lease_secs}` out of range"))?;

        Ok(Self {
            default_channel: ChannelCredentials {
                api_url,
                api_key,
                session,
            },
            batch_limit,
            lease,
        })
    }

    /// Credentials for a channel with no tenant-specific row. The message's own
    /// session name wins over the process default when it has one.
    pub fn fallback_channel(&self, channel_name: &str) -> ChannelCredentials {
        let mut channel = self.default_channel.clone();
        if !channel_name.trim().is_empty() {
            channel.session = channel_name.to_string();
        }
        channel
    }
}
