use forge::prelude::*;
use std::sync::Arc;

mod functions;
mod schema;
mod services;

static DELIVERY_WORKER: tokio::sync::OnceCell<Arc<functions::DeliveryWorker>> =
    tokio::sync::OnceCell::const_new();

fn init_delivery_worker() -> anyhow::Result<Arc<functions::DeliveryWorker>> {
    let settings = services::DeliverySettings::from_env()?;
    let sender = Arc::new(services::WahaClient::new()?);
    tracing::info!(
        api_url = %settings.default_channel.api_url,
        session = %settings.default_channel.session,
        batch_limit = settings.batch_limit,
        lease_secs = settings.lease.num_seconds(),
        "scheduled delivery configured"
    );
    Ok(Arc::new(functions::DeliveryWorker::new(sender, settings)))
}

pub fn get_delivery_worker() -> Result<Arc<functions::DeliveryWorker>> {
    DELIVERY_WORKER
        .get()
        .cloned()
        .ok_or_else(|| ForgeError::Internal("delivery worker not initialized".to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let worker = init_delivery_worker()
        .map_err(|e| ForgeError::Internal(format!("failed to configure delivery: {e:#}")))?;
    DELIVERY_WORKER.set(worker).ok();

    let config = ForgeConfig::from_file("forge.toml")?;
    let mut builder = Forge::builder();

    let fns = builder.function_registry_mut();
    fns.register_query::<functions::ListScheduledMessagesQuery>();
    fns.register_query::<functions::GetQueueHealthQuery>();
    fns.register_query::<functions::ListBlockedContactsQuery>();
    fns.register_query::<functions::ListDeliveryEventsQuery>();

    let daemons = builder.daemon_registry_mut();
    daemons.register::<functions::ScheduledDeliveryDaemon>();
    daemons.register::<functions::DeliveryTriggerDaemon>();

    builder.config(config).build()?.run().await
}
