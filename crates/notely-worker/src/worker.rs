//! Consumer loops that drain broker topics through the [`Applier`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use notely_core::defaults::{
    BROKER_LEASE_SECS, EVENT_BUS_CAPACITY, WORKER_COMMAND_TIMEOUT_SECS, WORKER_MAX_DELIVERIES,
    WORKER_POLL_INTERVAL_MS, WORKER_REPLICAS_PER_TOPIC,
};
use notely_core::{Broker, Command, Delivery, Error, Result, SearchIndex, Topic, WriteStore};

use crate::applier::{Applier, Outcome};

/// Configuration for the command worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Whether to start consumer loops at all.
    pub enabled: bool,
    /// Sleep between polls of an empty topic, in milliseconds.
    pub poll_interval_ms: u64,
    /// Consumer loops per topic.
    pub replicas_per_topic: usize,
    /// Budget for applying one command.
    pub command_timeout: Duration,
    /// How long a received message stays leased to this worker.
    pub lease: Duration,
    /// Deliveries after which a message is dropped as poison.
    pub max_deliveries: i32,
    /// Topics to consume.
    pub topics: Vec<Topic>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: WORKER_POLL_INTERVAL_MS,
            replicas_per_topic: WORKER_REPLICAS_PER_TOPIC,
            command_timeout: Duration::from_secs(WORKER_COMMAND_TIMEOUT_SECS),
            lease: Duration::from_secs(BROKER_LEASE_SECS),
            max_deliveries: WORKER_MAX_DELIVERIES,
            topics: Topic::ALL.to_vec(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `WORKER_ENABLED` | `true` | Enable/disable consumers |
    /// | `WORKER_POLL_INTERVAL_MS` | `250` | Poll interval when a topic is empty |
    /// | `WORKER_REPLICAS_PER_TOPIC` | `1` | Consumer loops per topic |
    /// | `WORKER_COMMAND_TIMEOUT_SECS` | `30` | Budget per command |
    /// | `WORKER_LEASE_SECS` | `60` | Message lease duration |
    /// | `WORKER_MAX_DELIVERIES` | `10` | Deliveries before a message is dropped |
    pub fn from_env() -> Self {
        let enabled = std::env::var("WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let poll_interval_ms = env_parse("WORKER_POLL_INTERVAL_MS").unwrap_or(WORKER_POLL_INTERVAL_MS);

        let replicas_per_topic = env_parse::<usize>("WORKER_REPLICAS_PER_TOPIC")
            .unwrap_or(WORKER_REPLICAS_PER_TOPIC)
            .max(1);

        let command_timeout = Duration::from_secs(
            env_parse("WORKER_COMMAND_TIMEOUT_SECS").unwrap_or(WORKER_COMMAND_TIMEOUT_SECS),
        );

        let lease = Duration::from_secs(env_parse("WORKER_LEASE_SECS").unwrap_or(BROKER_LEASE_SECS));

        let max_deliveries = env_parse::<i32>("WORKER_MAX_DELIVERIES")
            .unwrap_or(WORKER_MAX_DELIVERIES)
            .max(1);

        Self {
            enabled,
            poll_interval_ms,
            replicas_per_topic,
            command_timeout,
            lease,
            max_deliveries,
            topics: Topic::ALL.to_vec(),
        }
    }

    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas_per_topic = replicas.max(1);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_max_deliveries(mut self, max: i32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn with_topics(mut self, topics: Vec<Topic>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Event emitted by the command worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Consumer loops are running.
    WorkerStarted,
    /// All consumer loops have exited.
    WorkerStopped,
    /// A command was committed to the store and index.
    CommandApplied {
        topic: Topic,
        request_id: Uuid,
        kind: &'static str,
    },
    /// A redelivered command had already been applied.
    CommandDuplicate { topic: Topic, request_id: Uuid },
    /// A message was acknowledged without effect.
    CommandDropped {
        topic: Topic,
        message_id: i64,
        request_id: Option<Uuid>,
        reason: String,
    },
    /// A message was released for redelivery after a transient failure.
    CommandRetried {
        topic: Topic,
        message_id: i64,
        request_id: Option<Uuid>,
        error: String,
    },
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Ack(WorkerEvent),
    Nack(WorkerEvent),
}

impl Disposition {
    pub fn event(&self) -> &WorkerEvent {
        match self {
            Disposition::Ack(event) | Disposition::Nack(event) => event,
        }
    }
}

/// Handle for controlling a running worker.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops
/// the consumer loops once they go idle.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<WorkerEvent>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal every consumer loop to stop after its current message.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(true)
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Wait until every consumer loop has exited.
    pub async fn join(self) {
        if let Err(e) = self.supervisor.await {
            error!(error = ?e, "Worker supervisor panicked");
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }
}

/// Applies commands from the broker, one message at a time per consumer loop.
#[derive(Clone)]
pub struct CommandWorker {
    broker: Arc<dyn Broker>,
    applier: Applier,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl CommandWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn WriteStore>,
        index: Arc<dyn SearchIndex>,
        config: WorkerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            broker,
            applier: Applier::new(store, index),
            config,
            event_tx,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Start the consumer loops and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let event_tx = self.event_tx.clone();

        let supervisor = tokio::spawn(async move {
            self.run(shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_tx,
            supervisor,
        }
    }

    async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Command worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            replicas_per_topic = self.config.replicas_per_topic,
            command_timeout_secs = self.config.command_timeout.as_secs(),
            max_deliveries = self.config.max_deliveries,
            topics = ?self.config.topics,
            "Command worker started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let mut loops = JoinSet::new();
        for topic in self.config.topics.clone() {
            for replica in 0..self.config.replicas_per_topic {
                let worker = self.clone();
                let shutdown_rx = shutdown_rx.clone();
                loops.spawn(async move { worker.consume(topic, replica, shutdown_rx).await });
            }
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = ?e, "Consumer loop panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Command worker stopped");
    }

    #[instrument(skip(self, shutdown_rx))]
    async fn consume(&self, topic: Topic, replica: usize, mut shutdown_rx: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let notify = self.broker.notifier();
        debug!(replica, "Consumer loop started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Register for wake-ups before polling so a publish in between is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.broker.receive(topic, self.config.lease).await {
                Ok(Some(delivery)) => {
                    let disposition = self.process(&delivery).await;
                    self.settle(&delivery, disposition).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Failed to receive from broker");
                }
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // The handle was dropped; nothing can signal shutdown anymore.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = &mut notified => {}
                _ = sleep(poll_interval) => {}
            }
        }

        debug!(replica, "Consumer loop stopped");
    }

    /// Decide the fate of one delivery. Does not ack or nack.
    pub async fn process(&self, delivery: &Delivery) -> Disposition {
        let start = Instant::now();
        let topic = delivery.topic;
        let message_id = delivery.id;

        let drop_message = |request_id: Option<Uuid>, reason: String| {
            Disposition::Ack(WorkerEvent::CommandDropped {
                topic,
                message_id,
                request_id,
                reason,
            })
        };

        if delivery.delivery_count > self.config.max_deliveries {
            error!(
                message_id,
                delivery_count = delivery.delivery_count,
                "Message exceeded max deliveries, dropping"
            );
            return drop_message(None, "exceeded max deliveries".to_string());
        }

        let cmd = match Command::decode(&delivery.payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                error!(message_id, error = %e, "Undecodable message, dropping");
                return drop_message(None, e.to_string());
            }
        };
        let request_id = cmd.request_id();

        if cmd.topic() != topic {
            error!(message_id, %request_id, kind = cmd.kind(), "Command on wrong topic, dropping");
            return drop_message(Some(request_id), format!("{} does not belong on {}", cmd.kind(), topic));
        }

        if let Err(e) = cmd.validate() {
            warn!(message_id, %request_id, kind = cmd.kind(), error = %e, "Invalid command, dropping");
            return drop_message(Some(request_id), Error::from(e).to_string());
        }

        match self.applier.apply(&cmd, self.config.command_timeout).await {
            Ok(Outcome::Applied) => {
                info!(
                    message_id,
                    %request_id,
                    kind = cmd.kind(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Command applied"
                );
                Disposition::Ack(WorkerEvent::CommandApplied {
                    topic,
                    request_id,
                    kind: cmd.kind(),
                })
            }
            Ok(Outcome::Duplicate) => {
                Disposition::Ack(WorkerEvent::CommandDuplicate { topic, request_id })
            }
            Err(e) if e.is_transient() => {
                warn!(
                    message_id,
                    %request_id,
                    kind = cmd.kind(),
                    delivery_count = delivery.delivery_count,
                    error = %e,
                    "Transient failure, message will be redelivered"
                );
                Disposition::Nack(WorkerEvent::CommandRetried {
                    topic,
                    message_id,
                    request_id: Some(request_id),
                    error: e.to_string(),
                })
            }
            Err(e) => {
                warn!(
                    message_id,
                    %request_id,
                    kind = cmd.kind(),
                    error = %e,
                    "Command rejected by store, dropping"
                );
                drop_message(Some(request_id), e.to_string())
            }
        }
    }

    async fn settle(&self, delivery: &Delivery, disposition: Disposition) {
        let result = match &disposition {
            Disposition::Ack(_) => self.broker.ack(delivery).await,
            Disposition::Nack(_) => self.broker.nack(delivery).await,
        };
        if let Err(e) = result {
            // An unsettled message is redelivered when its lease expires.
            error!(message_id = delivery.id, error = %e, "Failed to settle message");
        }

        let event = match disposition {
            Disposition::Ack(event) | Disposition::Nack(event) => event,
        };
        let _ = self.event_tx.send(event);
    }
}

/// Builder for creating a command worker.
pub struct WorkerBuilder {
    broker: Arc<dyn Broker>,
    store: Arc<dyn WriteStore>,
    index: Arc<dyn SearchIndex>,
    config: WorkerConfig,
}

impl WorkerBuilder {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn WriteStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        Self {
            broker,
            store,
            index,
            config: WorkerConfig::default(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build and return the worker.
    pub fn build(self) -> CommandWorker {
        CommandWorker::new(self.broker, self.store, self.index, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval_ms, WORKER_POLL_INTERVAL_MS);
        assert_eq!(config.replicas_per_topic, 1);
        assert_eq!(config.max_deliveries, 10);
        assert_eq!(config.topics, vec![Topic::Notes, Topic::Spaces]);
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::default()
            .with_poll_interval(1000)
            .with_replicas(3)
            .with_command_timeout(Duration::from_secs(5))
            .with_max_deliveries(2)
            .with_topics(vec![Topic::Spaces])
            .with_enabled(false);

        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.replicas_per_topic, 3);
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.max_deliveries, 2);
        assert_eq!(config.topics, vec![Topic::Spaces]);
        assert!(!config.enabled);
    }

    #[test]
    fn test_worker_config_clamps_to_one() {
        let config = WorkerConfig::default().with_replicas(0).with_max_deliveries(0);
        assert_eq!(config.replicas_per_topic, 1);
        assert_eq!(config.max_deliveries, 1);
    }

    #[test]
    fn test_worker_config_from_env() {
        // Single test touches these variables to avoid races between tests.
        std::env::set_var("WORKER_ENABLED", "false");
        std::env::set_var("WORKER_REPLICAS_PER_TOPIC", "0");
        std::env::set_var("WORKER_MAX_DELIVERIES", "3");
        std::env::set_var("WORKER_COMMAND_TIMEOUT_SECS", "not-a-number");

        let config = WorkerConfig::from_env();
        assert!(!config.enabled);
        assert_eq!(config.replicas_per_topic, 1);
        assert_eq!(config.max_deliveries, 3);
        assert_eq!(
            config.command_timeout,
            Duration::from_secs(WORKER_COMMAND_TIMEOUT_SECS)
        );

        std::env::remove_var("WORKER_ENABLED");
        std::env::remove_var("WORKER_REPLICAS_PER_TOPIC");
        std::env::remove_var("WORKER_MAX_DELIVERIES");
        std::env::remove_var("WORKER_COMMAND_TIMEOUT_SECS");
    }

    #[test]
    fn test_disposition_event() {
        let event = WorkerEvent::CommandDuplicate {
            topic: Topic::Notes,
            request_id: Uuid::nil(),
        };
        assert_eq!(Disposition::Ack(event.clone()).event(), &event);
    }
}
