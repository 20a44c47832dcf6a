//! Server-side transports and downlink delivery.
//!
//! A transport is a named plugin with a fixed interface (name, start, stop,
//! can_send, send). The registry is assembled once at init from the enabled
//! set in configuration; http_polling is always registered because it is the
//! universal negotiation fallback.
//!
//! Downlink messages are notifications, not commands: receipt only prompts
//! the peer to read authoritative state over HTTP. For http_polling they are
//! persisted and drained at-least-once; for brokers they are fire-and-forget
//! and peers reconcile by polling on reconnect.

pub mod amqp;
pub mod http_polling;
pub mod mqtt;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::TransportsConfig;
use crate::error::ApiError;
use crate::model::{DownlinkKind, DownlinkMessage};
use crate::repo::{RepoError, Repository};

pub use amqp::AmqpTransport;
pub use http_polling::HttpPollingTransport;
pub use mqtt::MqttTransport;

pub const HTTP_POLLING: &str = "http_polling";
pub const MQTT: &str = "mqtt";
pub const AMQP: &str = "amqp";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected: {0}")]
    Unavailable(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error(transparent)]
    Storage(#[from] RepoError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The fixed wire envelope every downlink notification travels in,
/// regardless of transport.
#[derive(Debug, Clone, Serialize)]
pub struct DownlinkEnvelope {
    pub id: String,
    pub kind: DownlinkKind,
    pub created_at: DateTime<Utc>,
    pub schema: &'static str,
    pub payload: serde_json::Value,
}

impl DownlinkEnvelope {
    pub fn from_message(msg: &DownlinkMessage) -> Self {
        Self {
            id: msg.message_id.to_string(),
            kind: msg.kind,
            created_at: msg.created_at,
            schema: "v1",
            payload: msg.payload.clone(),
        }
    }
}

/// Wake-up registry for long-poll waiters, keyed by recipient. Enqueuing a
/// downlink (or assigning a job) notifies the recipient's waiter so a
/// blocked drain re-checks the queue immediately.
#[derive(Default)]
pub struct DownlinkWaiters {
    inner: Mutex<HashMap<String, Arc<Notify>>>,
}

impl DownlinkWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waiter(&self, recipient: &str) -> Arc<Notify> {
        let mut map = self.inner.lock().expect("waiter map mutex poisoned");
        map.entry(recipient.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify(&self, recipient: &str) {
        // notify_one stores a permit, so a wake-up between the queue check
        // and the wait is never lost.
        self.waiter(recipient).notify_one();
    }
}

/// The compile-time transport registry.
pub enum ServerTransport {
    HttpPolling(HttpPollingTransport),
    Mqtt(MqttTransport),
    Amqp(AmqpTransport),
}

impl ServerTransport {
    pub fn name(&self) -> &'static str {
        match self {
            ServerTransport::HttpPolling(_) => HTTP_POLLING,
            ServerTransport::Mqtt(_) => MQTT,
            ServerTransport::Amqp(_) => AMQP,
        }
    }

    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), TransportError> {
        match self {
            ServerTransport::HttpPolling(t) => t.start(shutdown).await,
            ServerTransport::Mqtt(t) => t.start(shutdown).await,
            ServerTransport::Amqp(t) => t.start(shutdown).await,
        }
    }

    pub async fn stop(&self) {
        match self {
            ServerTransport::HttpPolling(t) => t.stop().await,
            ServerTransport::Mqtt(t) => t.stop().await,
            ServerTransport::Amqp(t) => t.stop().await,
        }
    }

    pub fn can_send(&self, recipient: &str) -> bool {
        match self {
            ServerTransport::HttpPolling(t) => t.can_send(recipient),
            ServerTransport::Mqtt(t) => t.can_send(recipient),
            ServerTransport::Amqp(t) => t.can_send(recipient),
        }
    }

    pub async fn send(&self, msg: DownlinkMessage) -> Result<(), TransportError> {
        match self {
            ServerTransport::HttpPolling(t) => t.send(msg).await,
            ServerTransport::Mqtt(t) => t.send(msg).await,
            ServerTransport::Amqp(t) => t.send(msg).await,
        }
    }
}

pub struct TransportRegistry {
    transports: Vec<ServerTransport>,
}

impl TransportRegistry {
    /// Build the enabled set in configuration order. Unknown names are
    /// logged and skipped; http_polling is appended if the configuration
    /// left it out.
    pub fn from_config(
        config: &TransportsConfig,
        repo: Repository,
        waiters: Arc<DownlinkWaiters>,
    ) -> Self {
        let mut transports: Vec<ServerTransport> = Vec::new();
        for name in &config.enabled {
            if transports.iter().any(|t| t.name() == name.as_str()) {
                continue;
            }
            match name.as_str() {
                HTTP_POLLING => transports.push(ServerTransport::HttpPolling(
                    HttpPollingTransport::new(repo.clone(), waiters.clone()),
                )),
                MQTT => transports.push(ServerTransport::Mqtt(MqttTransport::new(
                    config.mqtt.clone(),
                ))),
                AMQP => transports.push(ServerTransport::Amqp(AmqpTransport::new(
                    config.amqp.clone(),
                ))),
                other => {
                    tracing::warn!(transport = other, "unknown transport requested, skipping");
                }
            }
        }
        if !transports.iter().any(|t| t.name() == HTTP_POLLING) {
            transports.push(ServerTransport::HttpPolling(HttpPollingTransport::new(
                repo, waiters,
            )));
        }
        Self { transports }
    }

    pub async fn start_all(&self, shutdown: &CancellationToken) {
        for transport in &self.transports {
            if let Err(e) = transport.start(shutdown.clone()).await {
                // A broker being down at boot is not fatal; sends will be
                // suppressed until it connects.
                tracing::warn!(transport = transport.name(), error = %e,
                    "transport failed to start");
            } else {
                tracing::info!(transport = transport.name(), "transport started");
            }
        }
    }

    pub async fn stop_all(&self) {
        for transport in &self.transports {
            transport.stop().await;
        }
    }

    pub fn enabled_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(ServerTransport::name).collect()
    }

    /// Transport negotiation: intersect the peer's ordered preference list
    /// with the enabled set, preserving peer order, and take the first
    /// match.
    pub fn negotiate(&self, peer_preference: &[String]) -> Result<String, ApiError> {
        for name in peer_preference {
            if self.transports.iter().any(|t| t.name() == name.as_str()) {
                return Ok(name.clone());
            }
        }
        Err(ApiError::Validation(format!(
            "no mutually supported transport in: {}",
            peer_preference.join(", ")
        )))
    }

    pub fn http_polling(&self) -> &HttpPollingTransport {
        self.transports
            .iter()
            .find_map(|t| match t {
                ServerTransport::HttpPolling(t) => Some(t),
                _ => None,
            })
            .expect("http_polling is always registered")
    }

    fn by_name(&self, name: &str) -> Option<&ServerTransport> {
        self.transports.iter().find(|t| t.name() == name)
    }

    /// Deliver a downlink notification over the peer's negotiated transport.
    /// Failures are logged and suppressed: the repository stays the
    /// authoritative record, and peers reconcile over HTTP.
    pub async fn deliver(&self, choice: Option<&str>, msg: DownlinkMessage) {
        let transport = choice
            .and_then(|name| self.by_name(name))
            .unwrap_or_else(|| {
                // Unknown or absent choice falls back to the universal
                // transport.
                self.by_name(HTTP_POLLING)
                    .expect("http_polling is always registered")
            });

        if !transport.can_send(&msg.recipient_id) {
            tracing::warn!(
                transport = transport.name(),
                recipient = %msg.recipient_id,
                kind = msg.kind.as_str(),
                "transport cannot deliver right now, dropping notification"
            );
            return;
        }

        let recipient = msg.recipient_id.clone();
        let kind = msg.kind;
        if let Err(e) = transport.send(msg).await {
            tracing::warn!(
                transport = transport.name(),
                recipient = %recipient,
                kind = kind.as_str(),
                error = %e,
                "downlink delivery failed"
            );
        }
    }
}

/// The standard payload for job_state_changed / job_canceled notifications.
pub fn job_state_payload(job: &crate::model::Job) -> serde_json::Value {
    serde_json::json!({
        "job_id": job.job_id.to_string(),
        "state": job.state.as_str(),
        "exit_code": job.exit_code,
        "failure_kind": job.failure_kind.map(|k| k.as_str()),
    })
}
