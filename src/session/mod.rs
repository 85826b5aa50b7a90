//! Durable session state: the registry of agents, humans, and pending
//! permission requests the coordinator maintains across restarts.

mod reconciler;
mod store;

pub use reconciler::{reconcile, ReconciliationOutcome};
pub use store::{delete_session, list_sessions, SessionStore};

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Spawning,
    Starting,
    Idle,
    Working,
    WaitingPermission,
    Terminated,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentState::Spawning => "spawning",
            AgentState::Starting => "starting",
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::WaitingPermission => "waiting_permission",
            AgentState::Terminated => "terminated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Pending,
    Granted,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub identity_id: String,
    pub display_name: String,
    pub workspace_name: Option<String>,
    pub state: AgentState,
    pub current_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub tmux_session: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Human {
    pub identity_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPermission {
    pub request_id: String,
    pub agent_id: String,
    pub action: String,
    pub resource: String,
    pub context: String,
    pub requested_at: DateTime<Utc>,
    pub status: PermissionStatus,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub namespace: String,
    #[serde(rename = "namespace_secret")]
    pub namespace_secret: String,
    pub coordinator_identity_id: String,
    pub coordinator_secret: String,
    pub coordination_room_id: String,
    pub agents: HashMap<String, Agent>,
    pub humans: HashMap<String, Human>,
    pub pending_permissions: HashMap<String, PendingPermission>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("session_id", &self.session_id)
            .field("display_name", &self.display_name)
            .field("created_at", &self.created_at)
            .field("namespace", &self.namespace)
            .field("namespace_secret", &"<redacted>")
            .field("coordinator_identity_id", &self.coordinator_identity_id)
            .field("coordinator_secret", &"<redacted>")
            .field("coordination_room_id", &self.coordination_room_id)
            .field("agents", &self.agents)
            .field("humans", &self.humans)
            .field("pending_permissions", &self.pending_permissions)
            .finish()
    }
}
