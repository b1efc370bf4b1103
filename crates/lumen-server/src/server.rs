//! Process wiring

use std::sync::Arc;

use lumen_config::Config;
use lumen_gateway::{
    ClientBindings, FanoutRouter, FanoutSubscriber, Gateway, GatewayConfig, Hub, HubSettings,
    KvStore, MemoryMessageRepository, MemoryStore, MessageService, PresenceReporter, RedisStore,
    SequenceGenerator, ServerRegistry, StoreGroupDirectory,
};
use lumen_observability::{FnHealthCheck, HealthCheckResult, Observability};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::StoreTokenAuthenticator;
use crate::handler::{ChatHandler, EchoHandler};

pub async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    match &config.store.redis_url {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            info!("Connected to Redis");
            Ok(Arc::new(store))
        }
        None => {
            warn!("No store.redis_url configured, using the in-process store (single node only)");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Builds every component and serves until `cancel` fires.
pub async fn run_server(
    config: Config,
    sid: String,
    observability: &Observability,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;

    let health_store = Arc::clone(&store);
    observability
        .health_server()
        .register(FnHealthCheck::new("store", move || {
            let store = Arc::clone(&health_store);
            async move {
                match store.ping().await {
                    Ok(()) => HealthCheckResult::healthy("store"),
                    Err(e) => HealthCheckResult::unhealthy("store", e.to_string()),
                }
            }
        }));

    let bindings = ClientBindings::new(Arc::clone(&store), sid.clone());
    let registry = ServerRegistry::new(Arc::clone(&store), config.presence.overtime());
    let hub = Hub::new(HubSettings::from(&config)).with_storage(Arc::new(bindings.clone()));

    // 消息持久化由外部服务负责，这里只保留进程内记录
    let repository = Arc::new(MemoryMessageRepository::new());
    let router = Arc::new(FanoutRouter::new(
        Arc::clone(&store),
        registry.clone(),
        bindings,
        config.presence.private_fanout_threshold,
    ));
    // 发号器 key 过期后从已保存的最大时序继续
    let sequences = SequenceGenerator::new(Arc::clone(&store), config.sequence.ttl())
        .with_seed(repository.clone());
    let service = MessageService::new(sequences, repository, router);

    let gateway = Gateway::new(
        GatewayConfig::from(&config),
        hub.clone(),
        Arc::new(StoreTokenAuthenticator::new(Arc::clone(&store))),
    );
    gateway.register_channel("chat", Arc::new(ChatHandler::new(service)));
    gateway.register_channel("example", Arc::new(EchoHandler));

    let health_hub = hub.clone();
    observability
        .health_server()
        .register(FnHealthCheck::new("gateway", move || {
            let hub = health_hub.clone();
            async move {
                HealthCheckResult::healthy("gateway").with_metadata(serde_json::json!({
                    "clients": hub.channels().total_clients(),
                    "channels": hub.channels().names(),
                    "pending_acks": hub.ack().len(),
                }))
            }
        }));

    let mut tasks = hub.start(cancel.clone());

    let reporter = PresenceReporter::new(registry, sid.clone(), config.presence.report_interval());
    tasks.push(tokio::spawn(reporter.run(cancel.clone())));

    let subscriber = FanoutSubscriber::new(
        Arc::clone(&store),
        sid.clone(),
        Arc::clone(hub.channels()),
        Arc::new(StoreGroupDirectory::new(Arc::clone(&store))),
        config.ack.deliver_with_ack,
    );
    let subscriber_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = subscriber.run(subscriber_cancel.clone()).await {
            warn!("Fanout subscriber failed: {}", e);
            subscriber_cancel.cancel();
        }
    }));

    observability.health_server().set_ready(true);
    info!(sid = %sid, "Lumen gateway started");

    let result = gateway.run(cancel.clone()).await;
    // a listener that fails to bind still has to stop the background tasks
    cancel.cancel();
    observability.health_server().set_ready(false);

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    result?;
    info!(sid = %sid, "Lumen gateway stopped");
    Ok(())
}
