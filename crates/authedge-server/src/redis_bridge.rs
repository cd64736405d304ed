//! Redis Pub/Sub bridge for cross-instance invalidation.
//!
//! ## How It Works
//!
//! ```text
//! Instance A: bus.publish(event{origin: A})
//!   ↓ forwarder
//! Redis: PUBLISH authedge:invalidate <json>
//!   ↓ listener
//! Instance B: bus.publish(event)  → token cache, permission filter
//! Instance A: ignores its own echo
//! ```
//!
//! Only events stamped with this instance's id are forwarded, so events
//! received from Redis are never sent back out.
//!
//! Pub/sub does not replay what was published while the listener was
//! disconnected, so every (re)subscribe runs the resync hook.

use std::sync::Arc;
use std::time::Duration;

use authedge_cache::{BusError, InvalidationBus};
use authedge_core::InvalidationEvent;
use deadpool_redis::Pool;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::RedisConfig;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

type ResyncHook = Arc<dyn Fn() + Send + Sync>;

pub struct RedisBridge {
    pool: Pool,
    url: String,
    channel: String,
    instance_id: String,
    bus: InvalidationBus,
    resync: Option<ResyncHook>,
}

impl RedisBridge {
    /// Connects to Redis, or returns `None` to run local-only.
    pub async fn connect(
        config: &RedisConfig,
        bus: InvalidationBus,
        instance_id: impl Into<String>,
    ) -> Option<Self> {
        if !config.enabled {
            tracing::info!("Redis disabled, invalidation stays local to this instance");
            return None;
        }

        tracing::info!(url = %config.url, channel = %config.channel, "Connecting to Redis");

        let timeout = Duration::from_millis(config.timeout_ms);
        let mut redis_config = deadpool_redis::Config::from_url(&config.url);
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = config.pool_size;
            pool_config.timeouts.wait = Some(timeout);
            pool_config.timeouts.create = Some(timeout);
            pool_config.timeouts.recycle = Some(timeout);
        }

        let pool = match redis_config.create_pool(Some(deadpool_redis::Runtime::Tokio1)) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create Redis pool, running local-only");
                return None;
            }
        };

        if let Err(e) = pool.get().await {
            tracing::warn!(error = %e, "Failed to connect to Redis, running local-only");
            return None;
        }
        tracing::info!("Connected to Redis");

        Some(Self {
            pool,
            url: config.url.clone(),
            channel: config.channel.clone(),
            instance_id: instance_id.into(),
            bus,
            resync: None,
        })
    }

    /// Runs `resync` after every successful subscribe, covering events
    /// published while no subscription was active.
    #[must_use]
    pub fn on_resubscribe(mut self, resync: impl Fn() + Send + Sync + 'static) -> Self {
        self.resync = Some(Arc::new(resync));
        self
    }

    fn resubscribed(&self) {
        if let Some(resync) = &self.resync {
            resync();
        }
    }

    /// Spawns the forwarder and the listener.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let forwarder = {
            let pool = self.pool.clone();
            let channel = self.channel.clone();
            let instance_id = self.instance_id.clone();
            let mut receiver = self.bus.receiver();
            tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if event.is_from(&instance_id) => {
                            if let Err(e) = publish_event(&pool, &channel, &event).await {
                                tracing::warn!(
                                    error = %e,
                                    kind = event.kind.as_str(),
                                    "failed to forward invalidation to Redis"
                                );
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Redis forwarder lagged, events not forwarded");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        let listener = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match self.listen().await {
                    Ok(()) => backoff = INITIAL_BACKOFF,
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Invalidation listener error, reconnecting..."
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        });

        vec![forwarder, listener]
    }

    async fn listen(&self) -> Result<(), BusError> {
        // SUBSCRIBE needs a dedicated connection, not a pooled one.
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| BusError::Transport(format!("failed to create Redis client: {e}")))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Transport(format!("failed to get pub/sub connection: {e}")))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BusError::Transport(format!("failed to subscribe: {e}")))?;

        tracing::info!(channel = %self.channel, "Subscribed to invalidation channel");
        self.resubscribed();

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable invalidation payload");
                    continue;
                }
            };
            self.inject(&payload);
        }
        Err(BusError::Transport("pub/sub connection closed".to_string()))
    }

    /// Publishes a remote event on the local bus. Own echoes are dropped.
    fn inject(&self, payload: &str) {
        match InvalidationEvent::from_json(payload) {
            Ok(event) if event.is_from(&self.instance_id) => {}
            Ok(event) => {
                tracing::debug!(
                    kind = event.kind.as_str(),
                    tenant_id = %event.tenant_id,
                    origin = event.origin.as_deref().unwrap_or("unknown"),
                    "received invalidation from Redis"
                );
                self.bus.publish(event);
            }
            Err(e) => tracing::warn!(error = %e, "failed to decode invalidation event"),
        }
    }
}

/// Publishes one event on `channel`.
pub async fn publish_event(
    pool: &Pool,
    channel: &str,
    event: &InvalidationEvent,
) -> Result<(), BusError> {
    let payload = event.to_json()?;
    let mut conn = pool
        .get()
        .await
        .map_err(|e| BusError::Transport(format!("failed to get Redis connection: {e}")))?;
    conn.publish::<_, _, ()>(channel, payload)
        .await
        .map_err(|e| BusError::Transport(format!("failed to publish invalidation: {e}")))?;
    tracing::debug!(kind = event.kind.as_str(), channel, "published invalidation");
    Ok(())
}
