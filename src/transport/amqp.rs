//! AMQP (RabbitMQ) transport: durable publishes to the workers/jobs
//! exchanges. Routing key is the worker id, or `{client_id}.{job_id}` for
//! client-bound notifications.

use std::sync::Mutex;

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio_util::sync::CancellationToken;

use crate::config::AmqpConfig;
use crate::model::{DownlinkAudience, DownlinkMessage};
use crate::transport::{DownlinkEnvelope, TransportError};

const PERSISTENT_DELIVERY: u8 = 2;

pub struct AmqpTransport {
    config: AmqpConfig,
    channel: Mutex<Option<Channel>>,
}

impl AmqpTransport {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
        }
    }

    pub async fn start(&self, _shutdown: CancellationToken) -> Result<(), TransportError> {
        let connection = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        for exchange in [&self.config.workers_exchange, &self.config.jobs_exchange] {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        }

        tracing::info!(url = %self.config.url, "amqp broker connected");
        *self.channel.lock().expect("amqp channel mutex poisoned") = Some(channel);
        Ok(())
    }

    pub async fn stop(&self) {
        let channel = self
            .channel
            .lock()
            .expect("amqp channel mutex poisoned")
            .take();
        if let Some(channel) = channel {
            let _ = channel.close(200, "shutting down").await;
        }
    }

    pub fn can_send(&self, _recipient: &str) -> bool {
        self.channel
            .lock()
            .expect("amqp channel mutex poisoned")
            .as_ref()
            .is_some_and(|channel| channel.status().connected())
    }

    pub async fn send(&self, msg: DownlinkMessage) -> Result<(), TransportError> {
        let channel = self
            .channel
            .lock()
            .expect("amqp channel mutex poisoned")
            .clone()
            .ok_or_else(|| TransportError::Unavailable("amqp not connected".to_string()))?;

        let (exchange, routing_key) = self.route_for(&msg);
        let payload = serde_json::to_vec(&DownlinkEnvelope::from_message(&msg))?;

        channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT_DELIVERY),
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    fn route_for(&self, msg: &DownlinkMessage) -> (String, String) {
        match (msg.audience, msg.job_id) {
            (DownlinkAudience::Worker, _) => (
                self.config.workers_exchange.clone(),
                msg.recipient_id.clone(),
            ),
            (DownlinkAudience::Client, Some(job_id)) => (
                self.config.jobs_exchange.clone(),
                format!("{}.{}", msg.recipient_id, job_id),
            ),
            (DownlinkAudience::Client, None) => (
                self.config.jobs_exchange.clone(),
                msg.recipient_id.clone(),
            ),
        }
    }
}
