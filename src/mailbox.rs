//! The external mailbox ("deaddrop") service boundary.
//!
//! This crate never implements the mailbox itself — only the trait the
//! coordination core drives it through, plus an in-memory double for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone)]
pub enum MailboxError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("auth error: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceHandle {
    pub namespace: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub identity_id: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMember {
    pub identity_id: String,
}

/// A message as delivered by the mailbox, before codec decoding.
///
/// The mailbox's own wire shape is out of this crate's control; field names
/// vary between a `from`/`created_at` shape and a `sender_id`/`timestamp`
/// shape depending on backend, so this deserializes either.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEnvelope {
    #[serde(alias = "sender_id")]
    pub from: String,
    pub body: Vec<u8>,
    pub content_type: String,
    #[serde(alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait MailboxClient: Send + Sync {
    async fn create_namespace(&self, display_name: &str) -> Result<NamespaceHandle, MailboxError>;

    async fn create_identity(
        &self,
        namespace: &str,
        display_name: &str,
        namespace_secret: &str,
    ) -> Result<Identity, MailboxError>;

    async fn create_room(
        &self,
        namespace: &str,
        creator_secret: &str,
        display_name: &str,
    ) -> Result<RoomHandle, MailboxError>;

    async fn add_room_member(
        &self,
        namespace: &str,
        room_id: &str,
        identity_id: &str,
        secret: &str,
    ) -> Result<(), MailboxError>;

    async fn list_room_members(
        &self,
        namespace: &str,
        room_id: &str,
        secret: &str,
    ) -> Result<Vec<RoomMember>, MailboxError>;

    async fn list_rooms(
        &self,
        namespace: &str,
        secret: &str,
    ) -> Result<Vec<RoomHandle>, MailboxError>;

    async fn send_message(
        &self,
        namespace: &str,
        to_id: &str,
        body: &[u8],
        from_secret: &str,
        content_type: &str,
    ) -> Result<(), MailboxError>;

    async fn send_room_message(
        &self,
        namespace: &str,
        room_id: &str,
        body: &[u8],
        secret: &str,
        content_type: &str,
    ) -> Result<(), MailboxError>;

    async fn get_inbox(
        &self,
        namespace: &str,
        identity_id: &str,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawEnvelope>, MailboxError>;

    async fn get_room_messages(
        &self,
        namespace: &str,
        room_id: &str,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawEnvelope>, MailboxError>;

    /// Whether `get_inbox`/`get_room_messages` block server-side until a
    /// message arrives (true) or return immediately with whatever is
    /// currently available (false). `CoordinationContext` picks its waiting
    /// strategy based on this.
    fn supports_long_poll(&self) -> bool {
        false
    }
}

/// In-memory `MailboxClient` double. Used by this crate's own tests, and
/// available to downstream consumers for their integration tests.
#[derive(Default)]
pub struct InMemoryMailbox {
    inner: Mutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    namespaces: HashMap<String, String>,
    identities: HashMap<String, String>,
    rooms: HashMap<String, Vec<String>>,
    inboxes: HashMap<String, Vec<(DateTime<Utc>, RawEnvelope)>>,
    room_messages: HashMap<String, Vec<(DateTime<Utc>, RawEnvelope)>>,
}

impl InMemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_secret(
        state: &InMemoryState,
        store: &HashMap<String, String>,
        id: &str,
        secret: &str,
    ) -> Result<(), MailboxError> {
        let _ = state;
        match store.get(id) {
            Some(expected) if expected == secret => Ok(()),
            Some(_) => Err(MailboxError::Auth(format!("bad secret for {id}"))),
            None => Err(MailboxError::Auth(format!("unknown id {id}"))),
        }
    }
}

#[async_trait]
impl MailboxClient for InMemoryMailbox {
    async fn create_namespace(&self, display_name: &str) -> Result<NamespaceHandle, MailboxError> {
        let mut state = self.inner.lock().unwrap();
        let namespace = format!("ns-{}", Uuid::new_v4());
        let secret = format!("secret-{}", Uuid::new_v4());
        state.namespaces.insert(namespace.clone(), secret.clone());
        tracing::debug!(namespace = %namespace, display_name, "created namespace");
        Ok(NamespaceHandle { namespace, secret })
    }

    async fn create_identity(
        &self,
        namespace: &str,
        display_name: &str,
        namespace_secret: &str,
    ) -> Result<Identity, MailboxError> {
        let mut state = self.inner.lock().unwrap();
        let expected = state
            .namespaces
            .get(namespace)
            .cloned()
            .ok_or_else(|| MailboxError::Auth(format!("unknown namespace {namespace}")))?;
        if expected != namespace_secret {
            return Err(MailboxError::Auth("bad namespace secret".into()));
        }
        let identity_id = format!("id-{}", Uuid::new_v4());
        let secret = format!("secret-{}", Uuid::new_v4());
        state.identities.insert(identity_id.clone(), secret.clone());
        state.inboxes.entry(identity_id.clone()).or_default();
        tracing::debug!(identity_id = %identity_id, display_name, "created identity");
        Ok(Identity { identity_id, secret })
    }

    async fn create_room(
        &self,
        _namespace: &str,
        creator_secret: &str,
        display_name: &str,
    ) -> Result<RoomHandle, MailboxError> {
        let mut state = self.inner.lock().unwrap();
        if !state.identities.values().any(|s| s == creator_secret) {
            return Err(MailboxError::Auth("unknown creator secret".into()));
        }
        let room_id = format!("room-{}", Uuid::new_v4());
        state.rooms.insert(room_id.clone(), Vec::new());
        state.room_messages.entry(room_id.clone()).or_default();
        tracing::debug!(room_id = %room_id, display_name, "created room");
        Ok(RoomHandle { room_id })
    }

    async fn add_room_member(
        &self,
        _namespace: &str,
        room_id: &str,
        identity_id: &str,
        secret: &str,
    ) -> Result<(), MailboxError> {
        let mut state = self.inner.lock().unwrap();
        // `secret` authenticates the adder, not the identity being added — a
        // member with add rights (in this double, any identity known to the
        // namespace) may add someone else. This lets the coordinator's own
        // identity add agents to its rooms without needing their secrets.
        if !state.identities.values().any(|s| s == secret) {
            return Err(MailboxError::Auth("unknown adder secret".into()));
        }
        if !state.identities.contains_key(identity_id) {
            return Err(MailboxError::Transport(format!("unknown identity {identity_id}")));
        }
        let members = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| MailboxError::Transport(format!("unknown room {room_id}")))?;
        if !members.contains(&identity_id.to_string()) {
            members.push(identity_id.to_string());
        }
        Ok(())
    }

    async fn list_room_members(
        &self,
        _namespace: &str,
        room_id: &str,
        _secret: &str,
    ) -> Result<Vec<RoomMember>, MailboxError> {
        let state = self.inner.lock().unwrap();
        let members = state
            .rooms
            .get(room_id)
            .ok_or_else(|| MailboxError::Transport(format!("unknown room {room_id}")))?;
        Ok(members
            .iter()
            .map(|id| RoomMember {
                identity_id: id.clone(),
            })
            .collect())
    }

    async fn list_rooms(
        &self,
        _namespace: &str,
        _secret: &str,
    ) -> Result<Vec<RoomHandle>, MailboxError> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .rooms
            .keys()
            .map(|room_id| RoomHandle {
                room_id: room_id.clone(),
            })
            .collect())
    }

    async fn send_message(
        &self,
        _namespace: &str,
        to_id: &str,
        body: &[u8],
        from_secret: &str,
        content_type: &str,
    ) -> Result<(), MailboxError> {
        let mut state = self.inner.lock().unwrap();
        if !state.identities.values().any(|s| s == from_secret) {
            return Err(MailboxError::Auth("unknown sender secret".into()));
        }
        let from = state
            .identities
            .iter()
            .find(|(_, s)| *s == from_secret)
            .map(|(id, _)| id.clone())
            .unwrap_or_default();
        let inbox = state
            .inboxes
            .get_mut(to_id)
            .ok_or_else(|| MailboxError::Transport(format!("unknown recipient {to_id}")))?;
        let now = chrono::Utc::now();
        inbox.push((
            now,
            RawEnvelope {
                from,
                body: body.to_vec(),
                content_type: content_type.to_string(),
                created_at: now,
            },
        ));
        Ok(())
    }

    async fn send_room_message(
        &self,
        _namespace: &str,
        room_id: &str,
        body: &[u8],
        secret: &str,
        content_type: &str,
    ) -> Result<(), MailboxError> {
        let mut state = self.inner.lock().unwrap();
        let from = state
            .identities
            .iter()
            .find(|(_, s)| *s == secret)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| MailboxError::Auth("unknown sender secret".into()))?;
        let messages = state
            .room_messages
            .get_mut(room_id)
            .ok_or_else(|| MailboxError::Transport(format!("unknown room {room_id}")))?;
        let now = chrono::Utc::now();
        messages.push((
            now,
            RawEnvelope {
                from,
                body: body.to_vec(),
                content_type: content_type.to_string(),
                created_at: now,
            },
        ));
        Ok(())
    }

    async fn get_inbox(
        &self,
        _namespace: &str,
        identity_id: &str,
        secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawEnvelope>, MailboxError> {
        let state = self.inner.lock().unwrap();
        Self::check_secret(&state, &state.identities.clone(), identity_id, secret)?;
        let inbox = state
            .inboxes
            .get(identity_id)
            .ok_or_else(|| MailboxError::Transport(format!("unknown identity {identity_id}")))?;
        Ok(inbox
            .iter()
            .filter(|(ts, _)| since.map(|s| *ts > s).unwrap_or(true))
            .map(|(_, env)| env.clone())
            .collect())
    }

    async fn get_room_messages(
        &self,
        _namespace: &str,
        room_id: &str,
        _secret: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawEnvelope>, MailboxError> {
        let state = self.inner.lock().unwrap();
        let messages = state
            .room_messages
            .get(room_id)
            .ok_or_else(|| MailboxError::Transport(format!("unknown room {room_id}")))?;
        Ok(messages
            .iter()
            .filter(|(ts, _)| since.map(|s| *ts > s).unwrap_or(true))
            .map(|(_, env)| env.clone())
            .collect())
    }
}
