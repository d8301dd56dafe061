//! Object uploaded events.
//!
//! The updater publishes on a bounded channel and never waits on
//! subscribers. An [`EventDispatcher`] task drains the channel and hands each
//! event to every registered [`UploadSubscriber`].

use crate::config::KafkaConfig;
use crate::models::UploadableModel;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Event emitted by the upload state updater
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UploadEvent {
    /// An object reached READY from another state
    ObjectUploaded {
        model: UploadableModel,
        object_id: Uuid,
        uploaded_on: Option<DateTime<Utc>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        extension: Option<String>,
    },
}

impl UploadEvent {
    pub fn message_type(&self) -> &'static str {
        match self {
            UploadEvent::ObjectUploaded { .. } => "object_uploaded",
        }
    }

    pub fn model(&self) -> UploadableModel {
        match self {
            UploadEvent::ObjectUploaded { model, .. } => *model,
        }
    }

    pub fn object_id(&self) -> Uuid {
        match self {
            UploadEvent::ObjectUploaded { object_id, .. } => *object_id,
        }
    }
}

/// Create the channel between request handlers and the dispatcher
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<UploadEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender { tx }, rx)
}

/// Sending half of the event bus, cheap to clone into handlers
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<UploadEvent>,
}

impl EventSender {
    /// Queue an event for the subscribers without waiting.
    ///
    /// Returns false when the event had to be dropped.
    pub fn publish(&self, event: UploadEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                metrics::counter!("callbacks.events.published").increment(1);
                true
            }
            Err(TrySendError::Full(event)) => {
                warn!(
                    object_id = %event.object_id(),
                    model = %event.model(),
                    "Event bus full, dropping event"
                );
                metrics::counter!("callbacks.events.dropped").increment(1);
                false
            }
            Err(TrySendError::Closed(event)) => {
                error!(
                    object_id = %event.object_id(),
                    model = %event.model(),
                    "Event dispatcher stopped, dropping event"
                );
                metrics::counter!("callbacks.events.dropped").increment(1);
                false
            }
        }
    }
}

/// Downstream consumer of upload events
#[async_trait]
pub trait UploadSubscriber: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn notify(&self, event: &UploadEvent) -> Result<()>;
}

/// Drains the event bus into the subscribers
pub struct EventDispatcher {
    receiver: mpsc::Receiver<UploadEvent>,
    subscribers: Vec<Arc<dyn UploadSubscriber>>,
}

impl EventDispatcher {
    pub fn new(receiver: mpsc::Receiver<UploadEvent>) -> Self {
        Self {
            receiver,
            subscribers: Vec::new(),
        }
    }

    /// Register a subscriber; subscribers are notified in registration order
    pub fn subscribe(mut self, subscriber: Arc<dyn UploadSubscriber>) -> Self {
        info!(subscriber = subscriber.name(), "Registered upload event subscriber");
        self.subscribers.push(subscriber);
        self
    }

    /// Dispatch events until the channel closes or `shutdown` is cancelled.
    ///
    /// On cancellation the events already queued are still delivered.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Starting upload event dispatcher");

        loop {
            tokio::select! {
                biased;
                event = self.receiver.recv() => match event {
                    Some(event) => self.dispatch(&event).await,
                    None => break,
                },
                _ = shutdown.cancelled() => {
                    self.receiver.close();
                    while let Some(event) = self.receiver.recv().await {
                        self.dispatch(&event).await;
                    }
                    break;
                }
            }
        }

        info!("Upload event dispatcher stopped");
    }

    #[instrument(skip(self, event), fields(object_id = %event.object_id(), model = %event.model()))]
    async fn dispatch(&self, event: &UploadEvent) {
        for subscriber in &self.subscribers {
            match subscriber.notify(event).await {
                Ok(()) => {
                    metrics::counter!("callbacks.events.delivered").increment(1);
                }
                Err(e) => {
                    // One failing subscriber must not starve the others
                    error!(
                        error = %e,
                        subscriber = subscriber.name(),
                        "Failed to deliver upload event"
                    );
                    metrics::counter!("callbacks.events.failed").increment(1);
                }
            }
        }
    }
}

/// Stop the API task, then the dispatcher.
///
/// The dispatcher is only cancelled once the API task has returned, so
/// requests still in flight when shutdown starts can publish their events.
pub async fn shutdown_in_order(
    api_shutdown: &CancellationToken,
    api: JoinHandle<()>,
    dispatcher_shutdown: &CancellationToken,
    dispatcher: JoinHandle<()>,
    drain_timeout: Duration,
) {
    api_shutdown.cancel();
    if let Err(e) = api.await {
        error!(error = %e, "API server task failed");
    }

    dispatcher_shutdown.cancel();
    match tokio::time::timeout(drain_timeout, dispatcher).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Event dispatcher task failed"),
        Err(_) => warn!("Event dispatcher did not drain in time"),
    }
}

/// Subscriber that only logs events
pub struct LoggingSubscriber;

#[async_trait]
impl UploadSubscriber for LoggingSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &UploadEvent) -> Result<()> {
        info!(
            event = event.message_type(),
            object_id = %event.object_id(),
            model = %event.model(),
            "Object uploaded"
        );
        Ok(())
    }
}

/// Subscriber publishing events as JSON to a Kafka topic, keyed by object id
pub struct KafkaUploadPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaUploadPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let bootstrap_servers = config
            .bootstrap_servers
            .as_deref()
            .context("Kafka bootstrap servers are not configured")?;

        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all");

        // Configure SSL if enabled
        if config.ssl_enabled {
            client_config.set("security.protocol", "SASL_SSL");
            if let Some(ref ca_location) = config.ssl_ca_location {
                client_config.set("ssl.ca.location", ca_location);
            }
        }

        // Configure SASL if credentials provided
        if let (Some(ref username), Some(ref password)) =
            (&config.sasl_username, &config.sasl_password)
        {
            client_config
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let producer: FutureProducer = client_config
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic = %config.uploaded_topic, "Kafka upload publisher initialized");

        Ok(Self {
            producer,
            topic: config.uploaded_topic.clone(),
            timeout: config.message_timeout(),
        })
    }
}

#[async_trait]
impl UploadSubscriber for KafkaUploadPublisher {
    fn name(&self) -> &str {
        "kafka"
    }

    async fn notify(&self, event: &UploadEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("Failed to serialize upload event")?;
        let key = event.object_id().to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "message-type",
                value: Some(event.message_type()),
            })
            .insert(Header {
                key: "model",
                value: Some(event.model().s3_identifier()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(&payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| e)
            .with_context(|| format!("Failed to send upload event to topic {}", self.topic))?;

        debug!(partition, offset, "Upload event delivered to Kafka");

        Ok(())
    }
}
