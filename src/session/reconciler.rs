//! Pure replay of coordination-room history into inferred agent state.
//!
//! This never touches storage itself — [`SessionStore::sync_agent_states`]
//! applies the [`ReconciliationOutcome`] as a single transaction.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::{Agent, AgentState, PendingPermission, PermissionStatus};
use crate::mailbox::RawEnvelope;
use crate::protocol::CoordinationMessage;

const MAX_MESSAGES: usize = 500;

pub struct AgentUpdate {
    pub agent_id: String,
    pub state: AgentState,
    pub last_seen: DateTime<Utc>,
    /// The task id carried by the classifying message, when `state ==
    /// Working` — `TaskAck`/`Progress` always carry one, so this is only
    /// `None` for inferred states other than `Working`.
    pub task_id: Option<String>,
}

#[derive(Default)]
pub struct ReconciliationOutcome {
    pub updates: Vec<AgentUpdate>,
    pub newly_pending: Vec<PendingPermission>,
}

/// Replay `messages` (already ordered ascending by server timestamp, though
/// this function sorts defensively) against the currently known agents and
/// derive the latest inferable state for each.
pub fn reconcile(
    messages: &[RawEnvelope],
    known_agents: &HashMap<String, Agent>,
) -> ReconciliationOutcome {
    let mut ordered: Vec<&RawEnvelope> = messages.iter().collect();
    ordered.sort_by_key(|m| m.created_at);

    if ordered.len() > MAX_MESSAGES {
        let dropped = ordered.len() - MAX_MESSAGES;
        tracing::warn!(dropped, "room history exceeds reconciliation window, dropping oldest");
        ordered = ordered.split_off(dropped);
    }

    let mut latest: HashMap<String, (AgentState, DateTime<Utc>, Option<String>)> = HashMap::new();
    let mut newly_pending = Vec::new();

    for envelope in ordered {
        let Ok(message) = CoordinationMessage::decode(&envelope.content_type, &envelope.body)
        else {
            continue;
        };

        let Some(agent) = known_agents
            .values()
            .find(|a| a.identity_id == envelope.from)
        else {
            continue;
        };

        if agent.state.is_terminal() {
            continue;
        }

        let inferred: Option<(AgentState, Option<String>)> = match &message {
            CoordinationMessage::Idle { .. } => Some((AgentState::Idle, None)),
            CoordinationMessage::TaskAck { task_id, .. }
            | CoordinationMessage::Progress { task_id, .. } => {
                Some((AgentState::Working, Some(task_id.clone())))
            }
            CoordinationMessage::Result { status, .. } => {
                if status == "terminated" {
                    Some((AgentState::Terminated, None))
                } else {
                    Some((AgentState::Idle, None))
                }
            }
            CoordinationMessage::PermissionRequest {
                request_id,
                action,
                resource,
                context,
            } => {
                newly_pending.push(PendingPermission {
                    request_id: request_id.clone(),
                    agent_id: agent.agent_id.clone(),
                    action: action.clone(),
                    resource: resource.clone(),
                    context: context.clone(),
                    requested_at: envelope.created_at,
                    status: PermissionStatus::Pending,
                });
                Some((AgentState::WaitingPermission, None))
            }
            _ => None,
        };

        let Some((inferred, task_id)) = inferred else {
            continue;
        };

        let entry = latest.entry(agent.agent_id.clone());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let (current_state, current_ts, _) = slot.get().clone();
                if current_state.is_terminal() {
                    continue;
                }
                if envelope.created_at >= current_ts {
                    slot.insert((inferred, envelope.created_at, task_id));
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert((inferred, envelope.created_at, task_id));
            }
        }
    }

    let updates = latest
        .into_iter()
        .map(|(agent_id, (state, last_seen, task_id))| AgentUpdate {
            agent_id,
            task_id,
            state,
            last_seen,
        })
        .collect();

    ReconciliationOutcome {
        updates,
        newly_pending,
    }
}
