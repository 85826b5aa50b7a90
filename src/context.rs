//! Per-identity façade over a [`MailboxClient`], normalizing raw envelopes
//! into typed [`CoordinationMessage`]s.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::CoordinationError;
use crate::mailbox::MailboxClient;
use crate::protocol::CoordinationMessage;

/// A message as delivered to the coordinator, after codec decoding.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub sender_identity_id: String,
    pub message: CoordinationMessage,
    pub from_room: bool,
    pub received_at: DateTime<Utc>,
}

pub struct CoordinationContext {
    mailbox: Arc<dyn MailboxClient>,
    namespace: String,
    identity_id: String,
    secret: String,
    room_id: String,
    coordinator_identity_id: String,
    last_seen: Mutex<Option<DateTime<Utc>>>,
}

impl CoordinationContext {
    /// `coordinator_identity_id` is the session's coordinator identity, used
    /// by [`Self::send_to_coordinator`]. For the coordinator's own context
    /// this is its own identity id; worker-side contexts pass the
    /// coordinator id they received in their spawn invite.
    pub fn new(
        mailbox: Arc<dyn MailboxClient>,
        namespace: impl Into<String>,
        identity_id: impl Into<String>,
        secret: impl Into<String>,
        room_id: impl Into<String>,
        coordinator_identity_id: impl Into<String>,
    ) -> Self {
        Self {
            mailbox,
            namespace: namespace.into(),
            identity_id: identity_id.into(),
            secret: secret.into(),
            room_id: room_id.into(),
            coordinator_identity_id: coordinator_identity_id.into(),
            last_seen: Mutex::new(None),
        }
    }

    pub async fn send(
        &self,
        peer_identity_id: &str,
        msg: &CoordinationMessage,
        compress: bool,
    ) -> Result<(), CoordinationError> {
        let payload = msg.encode(compress)?;
        self.mailbox
            .send_message(
                &self.namespace,
                peer_identity_id,
                &payload.body,
                &self.secret,
                &payload.content_type,
            )
            .await?;
        Ok(())
    }

    pub async fn broadcast(
        &self,
        msg: &CoordinationMessage,
        compress: bool,
    ) -> Result<(), CoordinationError> {
        let payload = msg.encode(compress)?;
        self.mailbox
            .send_room_message(
                &self.namespace,
                &self.room_id,
                &payload.body,
                &self.secret,
                &payload.content_type,
            )
            .await?;
        Ok(())
    }

    /// Send `msg` directly to the session's coordinator identity. Provided
    /// for symmetry with [`Self::send`] and for worker-side test doubles —
    /// the coordinator's own context never needs to call this.
    pub async fn send_to_coordinator(
        &self,
        msg: &CoordinationMessage,
    ) -> Result<(), CoordinationError> {
        let coordinator_identity_id = self.coordinator_identity_id.clone();
        self.send(&coordinator_identity_id, msg, false).await
    }

    /// Poll the inbox (and optionally the coordination room) for new
    /// messages, skipping any that fail to decode.
    pub async fn receive(
        &self,
        wait: Duration,
        include_room: bool,
    ) -> Result<Vec<ReceivedMessage>, CoordinationError> {
        let since = *self.last_seen.lock().unwrap();

        let inbox = if self.mailbox.supports_long_poll() {
            tokio::time::timeout(
                wait.max(Duration::from_millis(1)),
                self.mailbox
                    .get_inbox(&self.namespace, &self.identity_id, &self.secret, since),
            )
            .await
            .unwrap_or_else(|_| Ok(Vec::new()))?
        } else {
            self.poll_with_retry(wait, |mb| {
                let ns = self.namespace.clone();
                let id = self.identity_id.clone();
                let secret = self.secret.clone();
                async move { mb.get_inbox(&ns, &id, &secret, since).await }
            })
            .await?
        };

        let room = if include_room {
            self.mailbox
                .get_room_messages(&self.namespace, &self.room_id, &self.secret, since)
                .await?
        } else {
            Vec::new()
        };

        let mut out = Vec::new();
        for envelope in inbox.into_iter().chain(room.into_iter()) {
            match CoordinationMessage::decode(&envelope.content_type, &envelope.body) {
                Ok(message) => out.push(ReceivedMessage {
                    sender_identity_id: envelope.from,
                    message,
                    from_room: include_room,
                    received_at: envelope.created_at,
                }),
                Err(err) => {
                    tracing::warn!(error = %err, sender = %envelope.from, "skipping undecodable message");
                }
            }
        }
        out.sort_by_key(|m| m.received_at);

        if let Some(latest) = out.last().map(|m| m.received_at) {
            let mut guard = self.last_seen.lock().unwrap();
            *guard = Some(latest);
        }

        Ok(out)
    }

    async fn poll_with_retry<F, Fut>(
        &self,
        wait: Duration,
        f: F,
    ) -> Result<Vec<crate::mailbox::RawEnvelope>, CoordinationError>
    where
        F: Fn(&Arc<dyn MailboxClient>) -> Fut,
        Fut: std::future::Future<
            Output = Result<Vec<crate::mailbox::RawEnvelope>, crate::mailbox::MailboxError>,
        >,
    {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = f(&self.mailbox).await?;
            if !batch.is_empty() || wait.is_zero() || tokio::time::Instant::now() >= deadline {
                return Ok(batch);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(remaining.min(Duration::from_millis(200))).await;
        }
    }
}
