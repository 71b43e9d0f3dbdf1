//! SMTP delivery loop, parallel in shape to [`super::broker`] but with no
//! poison path: a message that fails to send by email is left for the
//! next tick rather than deleted, since transient SMTP failures (auth
//! hiccups, rate limiting) are far more common than malformed payloads
//! here — the payload is already known-good JSON once it reaches this
//! stage, built by the producer, not re-serialized.

use crate::error::HermesError;
use crate::model::OutboxMessage;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub credentials: Option<(String, String)>,
    pub from: String,
}

pub struct EmailSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    pub fn new(config: EmailConfig) -> Result<Self, HermesError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| HermesError::Smtp(e.to_string()))?
            .port(config.smtp_port);

        if let Some((user, pass)) = config.credentials {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        let from: Mailbox = config.from.parse().map_err(|e: lettre::address::AddressError| HermesError::Smtp(e.to_string()))?;

        Ok(Self { transport: builder.build(), from })
    }

    /// Sends one outbox message's payload as the email body to
    /// `recipient`. The event type becomes the subject line.
    pub async fn send(&self, message: &OutboxMessage, recipient: &str) -> Result<(), HermesError> {
        let to: Mailbox = recipient.parse().map_err(|e: lettre::address::AddressError| HermesError::Smtp(e.to_string()))?;
        let body = serde_json::to_string_pretty(&message.payload)?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(format!("[rucio] {}", message.event_type))
            .body(body)
            .map_err(|e| HermesError::Smtp(e.to_string()))?;

        self.transport.send(email).await.map_err(|e| HermesError::Smtp(e.to_string()))?;
        Ok(())
    }
}
