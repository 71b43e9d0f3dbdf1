//! STOMP broker delivery, grounded on the `NotificationDelivery`
//! trait-at-the-seam shape: the loop logic (retrieve, publish, delete,
//! differentiate failure modes) never touches `tokio_stomp` directly, only
//! through the [`BrokerClient`] trait. That keeps the one place the crate's
//! exact API surface matters small and swappable.

use crate::error::HermesError;
use crate::model::{BrokerEnvelope, OutboxMessage};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

/// A connected STOMP destination. Implementations own their own
/// reconnection state; `publish` returning `Err(NotConnected)` tells the
/// caller to drop the connection and try a different broker next tick.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&mut self) -> Result<(), HermesError>;
    async fn publish(&mut self, destination: &str, body: &[u8], persistent: bool) -> Result<(), HermesError>;
    async fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
}

/// Resolves the configured broker alias to concrete host:port pairs once
/// per process start, the way the original daemon resolves a DNS alias
/// covering a pool of equivalent brokers before picking one at random
/// each publish.
pub async fn resolve_broker_hosts(alias: &str, port: u16) -> Result<Vec<(String, u16)>, HermesError> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()
        .map_err(|e| HermesError::DnsResolution(e.to_string()))?;
    let response = resolver
        .lookup_ip(alias)
        .await
        .map_err(|e| HermesError::DnsResolution(e.to_string()))?;
    let hosts: Vec<(String, u16)> = response.iter().map(|ip| (ip.to_string(), port)).collect();
    if hosts.is_empty() {
        return Err(HermesError::DnsResolution(format!("alias '{alias}' resolved to no hosts")));
    }
    Ok(hosts)
}

/// `tokio_stomp`-backed [`BrokerClient`]. Connection setup and the STOMP
/// handshake are confined here; everything above this module is
/// transport-agnostic.
pub struct StompBrokerClient {
    host: String,
    port: u16,
    use_ssl: bool,
    login: Option<(String, String)>,
    connection: Option<tokio_stomp::client::Client>,
}

impl StompBrokerClient {
    pub fn new(host: String, port: u16, use_ssl: bool, login: Option<(String, String)>) -> Self {
        Self { host, port, use_ssl, login, connection: None }
    }
}

#[async_trait]
impl BrokerClient for StompBrokerClient {
    async fn connect(&mut self) -> Result<(), HermesError> {
        let addr = format!("{}:{}", self.host, self.port);
        let (login, passcode) = self
            .login
            .clone()
            .unwrap_or_else(|| ("guest".to_string(), "guest".to_string()));

        let client = if self.use_ssl {
            tokio_stomp::client::Client::connect_tls(&addr, &self.host, &login, &passcode)
                .await
                .map_err(|e| HermesError::NotConnected(e.to_string()))?
        } else {
            tokio_stomp::client::Client::connect(&addr, &login, &passcode)
                .await
                .map_err(|e| HermesError::NotConnected(e.to_string()))?
        };

        self.connection = Some(client);
        Ok(())
    }

    async fn publish(&mut self, destination: &str, body: &[u8], persistent: bool) -> Result<(), HermesError> {
        let client = self.connection.as_mut().ok_or_else(|| HermesError::NotConnected(self.host.clone()))?;
        client
            .send_persistent(destination, body, persistent)
            .await
            .map_err(|e| HermesError::NotConnected(e.to_string()))
    }

    async fn disconnect(&mut self) {
        if let Some(mut client) = self.connection.take() {
            let _ = client.disconnect().await;
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

/// Publishes `messages` to whichever connected broker is picked for this
/// attempt, returning what happened so the caller can decide whether to
/// delete (success, or poison) or leave the row (transient failure).
pub enum PublishOutcome {
    Delivered,
    Poisoned(String),
    Transient(HermesError),
}

pub async fn publish_one(
    client: &mut dyn BrokerClient,
    destination: &str,
    message: &OutboxMessage,
) -> PublishOutcome {
    let envelope = BrokerEnvelope::from(message);
    let body = match serde_json::to_vec(&envelope) {
        Ok(b) => b,
        // A message that can't even serialize will never succeed on
        // retry either: treat it as poison and let the caller delete it.
        Err(e) => return PublishOutcome::Poisoned(e.to_string()),
    };

    match client.publish(destination, &body, true).await {
        Ok(()) => PublishOutcome::Delivered,
        Err(e @ HermesError::NotConnected(_)) => PublishOutcome::Transient(e),
        Err(e) => PublishOutcome::Transient(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeClient {
        connected: Arc<AtomicBool>,
        fail_next: bool,
    }

    #[async_trait]
    impl BrokerClient for FakeClient {
        async fn connect(&mut self) -> Result<(), HermesError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn publish(&mut self, _destination: &str, _body: &[u8], _persistent: bool) -> Result<(), HermesError> {
            if self.fail_next {
                Err(HermesError::NotConnected("simulated drop".to_string()))
            } else {
                Ok(())
            }
        }

        async fn disconnect(&mut self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    fn sample_message() -> OutboxMessage {
        OutboxMessage {
            id: uuid::Uuid::new_v4(),
            event_type: "dataset_ok".to_string(),
            payload: serde_json::json!({"scope": "u", "name": "ds1"}),
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_succeeds_against_connected_client() {
        let mut client = FakeClient { connected: Arc::new(AtomicBool::new(true)), fail_next: false };
        let outcome = publish_one(&mut client, "/topic/rucio.events", &sample_message()).await;
        assert!(matches!(outcome, PublishOutcome::Delivered));
    }

    #[tokio::test]
    async fn publish_reports_transient_on_disconnect() {
        let mut client = FakeClient { connected: Arc::new(AtomicBool::new(true)), fail_next: true };
        let outcome = publish_one(&mut client, "/topic/rucio.events", &sample_message()).await;
        assert!(matches!(outcome, PublishOutcome::Transient(_)));
    }

}
