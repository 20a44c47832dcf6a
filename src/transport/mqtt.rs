//! MQTT transport: QoS-1 publishes to per-peer topics, fire-and-forget.
//! Workers listen on `{prefix}/workers/{worker_id}`; clients listen on
//! `{prefix}/jobs/{client_id}/{job_id}`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::model::{DownlinkAudience, DownlinkMessage};
use crate::transport::{DownlinkEnvelope, TransportError};

pub struct MqttTransport {
    client: AsyncClient,
    event_loop: Mutex<Option<EventLoop>>,
    connected: Arc<AtomicBool>,
    topic_prefix: String,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        let (client, event_loop) = AsyncClient::new(options, 32);

        Self {
            client,
            event_loop: Mutex::new(Some(event_loop)),
            connected: Arc::new(AtomicBool::new(false)),
            topic_prefix: config.topic_prefix.trim_matches('/').to_string(),
        }
    }

    /// Spawn the broker event loop. Reconnection is handled by polling: the
    /// loop backs off on error and rumqttc re-dials on the next poll.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), TransportError> {
        let Some(mut event_loop) = self
            .event_loop
            .lock()
            .expect("mqtt event loop mutex poisoned")
            .take()
        else {
            return Ok(());
        };
        let connected = self.connected.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!("mqtt broker connected");
                            connected.store(true, Ordering::SeqCst);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            if connected.swap(false, Ordering::SeqCst) {
                                tracing::warn!(error = %e, "mqtt connection lost");
                            }
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
            tracing::info!("mqtt event loop stopped");
        });
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.client.disconnect().await;
    }

    pub fn can_send(&self, _recipient: &str) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn send(&self, msg: DownlinkMessage) -> Result<(), TransportError> {
        let topic = self.topic_for(&msg);
        let payload = serde_json::to_vec(&DownlinkEnvelope::from_message(&msg))?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    fn topic_for(&self, msg: &DownlinkMessage) -> String {
        match (msg.audience, msg.job_id) {
            (DownlinkAudience::Worker, _) => {
                format!("{}/workers/{}", self.topic_prefix, msg.recipient_id)
            }
            (DownlinkAudience::Client, Some(job_id)) => {
                format!("{}/jobs/{}/{}", self.topic_prefix, msg.recipient_id, job_id)
            }
            (DownlinkAudience::Client, None) => {
                format!("{}/jobs/{}", self.topic_prefix, msg.recipient_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DownlinkKind;
    use chrono::Utc;
    use ulid::Ulid;

    fn transport() -> MqttTransport {
        MqttTransport::new(MqttConfig::default())
    }

    #[test]
    fn worker_topic_shape() {
        let msg = DownlinkMessage::to_worker(
            "worker-1",
            DownlinkKind::JobAssigned,
            Some(Ulid::new()),
            serde_json::json!({}),
            Utc::now(),
        );
        assert_eq!(transport().topic_for(&msg), "dffmpeg/workers/worker-1");
    }

    #[test]
    fn client_topic_shape() {
        let job_id = Ulid::new();
        let msg = DownlinkMessage::to_client(
            "client-1",
            DownlinkKind::JobStateChanged,
            Some(job_id),
            serde_json::json!({}),
            Utc::now(),
        );
        assert_eq!(
            transport().topic_for(&msg),
            format!("dffmpeg/jobs/client-1/{job_id}")
        );
    }

    #[test]
    fn not_sendable_until_connected() {
        assert!(!transport().can_send("anyone"));
    }
}
