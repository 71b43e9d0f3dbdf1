//! The outbox: append-only messages awaiting delivery by Hermes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message written by any producer and delivered (then deleted) at
/// least once by the broker or email loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The wire envelope published to the broker: `{event_type, payload,
/// created_at}` as JSON, with a `persistent=true` STOMP header set
/// separately by the publish call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<&OutboxMessage> for BrokerEnvelope {
    fn from(msg: &OutboxMessage) -> Self {
        Self {
            event_type: msg.event_type.clone(),
            payload: msg.payload.clone(),
            created_at: msg.created_at,
        }
    }
}
