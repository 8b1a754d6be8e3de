use meter_rs::api::ApiServer;
use meter_rs::bus::{BusConsumer, Dispatcher, RedisBus};
use meter_rs::cache::DecisionCache;
use meter_rs::config::Config;
use meter_rs::gateway::PluginGateway;
use meter_rs::ledger::PgLedgerStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first; logging level comes from it
    let config = if std::path::Path::new("config.toml").exists() {
        Config::from_file("config.toml")?
    } else {
        Config::default()
    };

    let level = config
        .logging
        .level
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Starting meter-rs");
    info!("  Hook API on: {}", config.server.listen_addr);
    info!("  Database: {}", config.database.url);
    info!("  Bus channel: {}", config.bus.channel);

    let node_id = if config.server.node_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        config.server.node_id.clone()
    };
    info!("  Node id: {}", node_id);

    // Ledger store
    let store = Arc::new(
        PgLedgerStore::connect(&config.database.url, config.database.max_connections).await?,
    );
    store.migrate().await?;

    // Invalidation bus; a missing shared key only disables inbound
    // validation until the first reconnect re-reads it
    let bus = Arc::new(RedisBus::new(
        &config.bus.redis_url,
        &config.bus.channel,
        &config.bus.api_key_name,
    )?);
    if let Err(e) = bus.load_api_key().await {
        warn!("Could not load shared API key yet: {}", e);
    }

    let cache = Arc::new(DecisionCache::new(
        Duration::from_secs(config.cache.auth_ttl_secs),
        Duration::from_secs(config.cache.limiter_ttl_secs),
    ));

    let gateway = Arc::new(PluginGateway::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&bus) as Arc<dyn meter_rs::bus::BusPublisher>,
        config.metering.batch_size,
        config.metering.server_reset_ceiling as u128,
    ));

    // Every node evicts the subscriber named in a deleteUser broadcast
    let mut dispatcher = Dispatcher::new(bus.api_key());
    let handler_cache = Arc::clone(&cache);
    dispatcher.register("deleteUser", move |params| {
        let cache = Arc::clone(&handler_cache);
        async move {
            if let Some(user_id) = params.get("userID").and_then(|v| v.as_str()) {
                info!("Invalidation received for {}", user_id);
                cache.purge_user(user_id).await;
            } else {
                warn!("deleteUser event without userID: {}", params);
            }
            Ok(())
        }
    });

    let consumer = BusConsumer::new(
        Arc::clone(&bus),
        Arc::new(dispatcher),
        Duration::from_secs(config.bus.reconnect_interval_secs),
        config.bus.max_reconnect_attempts,
    );
    let bus_handle = tokio::spawn(consumer.run());

    // Hook API server
    let api_server = ApiServer::new(Arc::clone(&gateway), &config.server.listen_addr);
    let api_handle = tokio::spawn(async move {
        info!("Starting hook API server...");
        api_server.run().await
    });

    // Periodic cache sweep keeps the decision map from accumulating
    // expired entries between hook calls
    let sweep_cache = Arc::clone(&cache);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            sweep_cache.sweep().await;
        }
    });

    tokio::select! {
        result = api_handle => {
            match result {
                Ok(Ok(())) => info!("Hook API server exited"),
                Ok(Err(e)) => error!("Hook API server error: {}", e),
                Err(e) => error!("Hook API task panic: {}", e),
            }
        }
        result = bus_handle => {
            match result {
                Ok(()) => error!("Bus consumer stopped; operator intervention required"),
                Err(e) => error!("Bus consumer task panic: {}", e),
            }
        }
    }

    Ok(())
}
