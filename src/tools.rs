//! The coordinator's tool surface: the only entry points a driving agent
//! (human or LLM) calls into this crate through.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::context::CoordinationContext;
use crate::error::CoordinationError;
use crate::launcher::{AgentLauncher, SpawnInvite};
use crate::mailbox::MailboxClient;
use crate::protocol::CoordinationMessage;
use crate::session::{AgentState, PermissionStatus, SessionStore};

/// What kind of message `message_agent` should send, and the state
/// transition it implies.
pub enum MessageKind {
    Task {
        task_id: String,
        description: String,
        context: Value,
        deadline: Option<chrono::DateTime<Utc>>,
    },
    Answer {
        question_id: String,
        task_id: String,
        answer: String,
        context: Option<Value>,
    },
    Terminate {
        reason: Option<String>,
    },
}

pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
        }
    }
}

pub struct SpawnReport {
    pub agent_id: String,
    pub invite: SpawnInvite,
    pub summary: String,
}

pub struct HealthReport {
    pub healthy: Vec<String>,
    pub stale: Vec<String>,
    pub never_seen: Vec<String>,
    pub summary: String,
}

/// The coordinator's callable surface, scoped to one session. Holds no
/// module-level or global state — every operation goes through `self`.
pub struct CoordinatorTools {
    store: Arc<SessionStore>,
    context: CoordinationContext,
    mailbox: Arc<dyn MailboxClient>,
    launcher: Arc<dyn AgentLauncher>,
}

impl CoordinatorTools {
    pub fn new(
        store: Arc<SessionStore>,
        context: CoordinationContext,
        mailbox: Arc<dyn MailboxClient>,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Self {
        Self {
            store,
            context,
            mailbox,
            launcher,
        }
    }

    pub async fn spawn_agent(
        &self,
        workspace_name: Option<String>,
        display_name: Option<String>,
        remote: bool,
    ) -> Result<SpawnReport, CoordinationError> {
        let namespace = self.store.namespace();
        let namespace_secret = {
            let snapshot = self.store.snapshot();
            snapshot.namespace_secret.clone()
        };

        let display = display_name
            .clone()
            .unwrap_or_else(|| "agent".to_string());
        let identity = self
            .mailbox
            .create_identity(&namespace, &display, &namespace_secret)
            .await?;

        let agent_id = format!("agent-{}", Uuid::new_v4());
        self.store.register_agent(
            &agent_id,
            &identity.identity_id,
            &display,
            workspace_name,
        )?;

        self.add_agent_to_room(&agent_id).await?;

        let room_id = self.store.coordination_room_id();
        let invite = SpawnInvite {
            namespace: namespace.clone(),
            identity_id: identity.identity_id.clone(),
            identity_secret: identity.secret.clone(),
            coordinator_identity_id: self.store.coordinator_identity_id(),
            room_id,
        };

        let launch_label = match self.launcher.launch(&invite, remote).await {
            Ok(label) => label,
            Err(err) => {
                tracing::warn!(error = %err, agent_id = %agent_id, "launcher failed; agent remains registered as spawning");
                format!("launch-failed: {err}")
            }
        };

        let summary = format!(
            "Agent Created\nagent_id: {agent_id}\nidentity_id: {identity_id}\nlauncher: {launch_label}",
            identity_id = invite.identity_id,
        );

        Ok(SpawnReport {
            agent_id,
            invite,
            summary,
        })
    }

    pub async fn message_agent(
        &self,
        agent_id: &str,
        kind: MessageKind,
    ) -> Result<String, CoordinationError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .ok_or_else(|| CoordinationError::AgentUnknown {
                agent_id: agent_id.to_string(),
            })?;

        match kind {
            MessageKind::Task {
                task_id,
                description,
                context,
                deadline,
            } => {
                let msg = CoordinationMessage::TaskAssign {
                    task_id: task_id.clone(),
                    description,
                    context,
                    deadline,
                };
                self.context.send(&agent.identity_id, &msg, false).await?;
                self.store.update_agent_state(
                    agent_id,
                    AgentState::Working,
                    Some(task_id.clone()),
                    None,
                )?;
                Ok(format!("Task {task_id} assigned to {agent_id}"))
            }
            MessageKind::Answer {
                question_id,
                task_id,
                answer,
                context,
            } => {
                let msg = CoordinationMessage::Answer {
                    question_id: question_id.clone(),
                    task_id,
                    answer,
                    context,
                };
                self.context.send(&agent.identity_id, &msg, false).await?;
                Ok(format!("Answer sent for question {question_id}"))
            }
            MessageKind::Terminate { reason } => {
                let msg = CoordinationMessage::Terminate {
                    reason: reason.clone(),
                };
                self.context.send(&agent.identity_id, &msg, false).await?;
                self.store
                    .update_agent_state(agent_id, AgentState::Terminated, None, None)?;
                Ok(format!("✓ Terminated {agent_id}"))
            }
        }
    }

    pub async fn broadcast(
        &self,
        message: &str,
        message_type: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<String, CoordinationError> {
        let msg = CoordinationMessage::Progress {
            task_id: task_id.unwrap_or_default().to_string(),
            agent_id: self.store.coordinator_identity_id(),
            progress: 0.0,
            message: message.to_string(),
        };
        let _ = message_type;
        self.context.broadcast(&msg, false).await?;
        Ok("Broadcast sent".to_string())
    }

    pub async fn poll_messages(
        &self,
        wait: Duration,
        include_room: bool,
    ) -> Result<String, CoordinationError> {
        let received = self.context.receive(wait, include_room).await?;

        if received.is_empty() {
            return Ok("No new messages".to_string());
        }

        let mut lines = Vec::new();
        for item in &received {
            let agent = self.store.get_agent_by_identity(&item.sender_identity_id);
            if let Some(agent) = &agent {
                self.store.update_agent_last_seen(&agent.agent_id)?;
            }

            match &item.message {
                CoordinationMessage::Idle { agent_id } => {
                    if self.store.get_agent(agent_id).is_some() {
                        self.store
                            .update_agent_state(agent_id, AgentState::Idle, None, None)?;
                    }
                    lines.push(format!("**type**: idle — {agent_id}"));
                }
                CoordinationMessage::TaskAck { task_id, agent_id } => {
                    if self.store.get_agent(agent_id).is_some() {
                        self.store.update_agent_state(
                            agent_id,
                            AgentState::Working,
                            Some(task_id.clone()),
                            None,
                        )?;
                    }
                    lines.push(format!("**type**: task_ack — {agent_id} ({task_id})"));
                }
                CoordinationMessage::Progress {
                    task_id,
                    agent_id,
                    progress,
                    message,
                } => {
                    if self.store.get_agent(agent_id).is_some() {
                        self.store.update_agent_state(
                            agent_id,
                            AgentState::Working,
                            Some(task_id.clone()),
                            None,
                        )?;
                    }
                    lines.push(format!(
                        "**type**: progress — {agent_id} {progress:.0}% {message}"
                    ));
                }
                CoordinationMessage::Result {
                    task_id,
                    agent_id,
                    status,
                    summary,
                } => {
                    if self.store.get_agent(agent_id).is_some() {
                        let new_state = if status == "terminated" {
                            AgentState::Terminated
                        } else {
                            AgentState::Idle
                        };
                        self.store.update_agent_state(agent_id, new_state, None, None)?;
                    }
                    lines.push(format!(
                        "**type**: result — {agent_id} {task_id} {status}: {summary}"
                    ));
                }
                CoordinationMessage::Question {
                    question_id,
                    task_id,
                    agent_id,
                    question,
                    ..
                } => {
                    lines.push(format!(
                        "**type**: question — {agent_id} ({task_id}) {question_id}: {question}"
                    ));
                }
                CoordinationMessage::PermissionRequest {
                    request_id,
                    action,
                    resource,
                    context,
                } => {
                    if let Some(agent) = &agent {
                        if self.store.get_pending_permission(request_id).is_none() {
                            self.store.queue_permission(
                                request_id, &agent.agent_id, action, resource, context,
                            )?;
                        }
                        self.store.update_agent_state(
                            &agent.agent_id,
                            AgentState::WaitingPermission,
                            None,
                            None,
                        )?;
                    }
                    lines.push(format!(
                        "**type**: permission_request — {request_id}: {action} on {resource}"
                    ));
                }
                other => {
                    lines.push(format!("**type**: {}", other.type_name()));
                }
            }
        }

        Ok(format!("{} new message(s)\n{}", received.len(), lines.join("\n")))
    }

    pub fn list_agents(&self, state_filter: Option<AgentState>, show_details: bool) -> String {
        let agents = self.store.list_agents(state_filter);
        if agents.is_empty() {
            return "No agents".to_string();
        }
        agents
            .iter()
            .map(|a| {
                if show_details {
                    format!(
                        "{} [{}] task={} last_seen={:?}",
                        a.agent_id,
                        a.state.as_str(),
                        a.current_task_id.as_deref().unwrap_or("-"),
                        a.last_seen
                    )
                } else {
                    format!("{} [{}]", a.agent_id, a.state.as_str())
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn get_session_state(&self) -> String {
        let snapshot = self.store.snapshot();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for agent in snapshot.agents.values() {
            *counts.entry(agent.state.as_str()).or_insert(0) += 1;
        }
        format!(
            "Workspace: {}\nAgents: {}\nHumans: {}\nPending permissions: {}\nState counts: {:?}",
            snapshot.display_name,
            snapshot.agents.len(),
            snapshot.humans.len(),
            snapshot.pending_permissions.len(),
            counts
        )
    }

    pub async fn create_human_invite(&self, display_name: &str) -> Result<String, CoordinationError> {
        let namespace = self.store.namespace();
        let namespace_secret = self.store.snapshot().namespace_secret.clone();
        let identity = self
            .mailbox
            .create_identity(&namespace, display_name, &namespace_secret)
            .await?;

        self.store
            .register_human(&identity.identity_id, display_name)?;

        self.add_human_to_room(&identity.identity_id).await?;

        Ok(format!(
            "Human invited\nCOORDINATION_AGENT_ID: {}\nDEADDROP_INVITE_URL: {}/{}",
            identity.identity_id, namespace, identity.identity_id
        ))
    }

    /// Add a registered agent's identity to the coordination room. Idempotent
    /// in observable effect — adding an existing member is a no-op on the
    /// mailbox side. Authorized by the coordinator's own secret, per the
    /// session invariant that the coordinator is the sole identity allowed
    /// to mutate session-owned rooms.
    pub async fn add_agent_to_room(&self, agent_id: &str) -> Result<bool, CoordinationError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .ok_or_else(|| CoordinationError::AgentUnknown {
                agent_id: agent_id.to_string(),
            })?;
        let namespace = self.store.namespace();
        let room_id = self.store.coordination_room_id();
        let coordinator_secret = self.store.coordinator_secret();
        self.mailbox
            .add_room_member(&namespace, &room_id, &agent.identity_id, &coordinator_secret)
            .await?;
        Ok(true)
    }

    /// Add a registered human's identity to the coordination room. See
    /// [`Self::add_agent_to_room`] for the idempotency and authorization
    /// rationale.
    pub async fn add_human_to_room(&self, identity_id: &str) -> Result<bool, CoordinationError> {
        let namespace = self.store.namespace();
        let room_id = self.store.coordination_room_id();
        let coordinator_secret = self.store.coordinator_secret();
        self.mailbox
            .add_room_member(&namespace, &room_id, identity_id, &coordinator_secret)
            .await?;
        Ok(true)
    }

    pub async fn grant_permission(
        &self,
        request_id: &str,
        decision: Decision,
        agent_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<String, CoordinationError> {
        let pending = self.resolve_pending(request_id, agent_id)?;

        let agent = self
            .store
            .get_agent(&pending.agent_id)
            .ok_or_else(|| CoordinationError::AgentUnknown {
                agent_id: pending.agent_id.clone(),
            })?;

        let msg = CoordinationMessage::PermissionResponse {
            request_id: request_id.to_string(),
            decision: decision.as_str().to_string(),
            reason: reason.map(|s| s.to_string()),
        };
        self.context.send(&agent.identity_id, &msg, false).await?;

        let status = match decision {
            Decision::Allow => PermissionStatus::Granted,
            Decision::Deny => PermissionStatus::Denied,
        };
        self.store.update_pending_permission(request_id, status)?;

        if agent.state == AgentState::WaitingPermission {
            self.store.update_agent_state(
                &agent.agent_id,
                AgentState::Working,
                agent.current_task_id.clone(),
                None,
            )?;
        }

        Ok(format!("✓ {} for request {request_id}", decision.as_str()))
    }

    pub async fn grant_queued_permission(
        &self,
        request_id: &str,
        decision: Decision,
        reason: Option<&str>,
    ) -> Result<String, CoordinationError> {
        self.grant_permission(request_id, decision, None, reason).await
    }

    fn resolve_pending(
        &self,
        request_id: &str,
        agent_id: Option<&str>,
    ) -> Result<crate::session::PendingPermission, CoordinationError> {
        if let Some(pending) = self.store.get_pending_permission(request_id) {
            if let Some(agent_id) = agent_id {
                if pending.agent_id != agent_id {
                    return Err(CoordinationError::PermissionAmbiguousAgent {
                        request_id: request_id.to_string(),
                    });
                }
            }
            return Ok(pending);
        }
        Err(CoordinationError::PermissionUnknownRequest {
            request_id: request_id.to_string(),
        })
    }

    pub async fn escalate_to_user(
        &self,
        request_id: &str,
        context: &str,
    ) -> Result<String, CoordinationError> {
        let humans = self.store.list_humans();
        if humans.is_empty() {
            return Ok(format!(
                "No human participants; request {request_id} queued"
            ));
        }

        let question = CoordinationMessage::Question {
            question_id: format!("escalation-{request_id}"),
            task_id: String::new(),
            agent_id: self.store.coordinator_identity_id(),
            question: context.to_string(),
            options: vec!["allow".to_string(), "deny".to_string()],
        };

        for human in &humans {
            self.context.send(&human.identity_id, &question, false).await?;
        }

        Ok(format!(
            "Escalated request {request_id} to {} human(s)",
            humans.len()
        ))
    }

    pub fn check_agent_health(&self, stale_minutes: i64) -> HealthReport {
        let threshold = Utc::now() - chrono::Duration::minutes(stale_minutes);
        let mut healthy = Vec::new();
        let mut stale = Vec::new();
        let mut never_seen = Vec::new();

        for agent in self.store.list_agents(None) {
            if agent.state.is_terminal() {
                continue;
            }
            match agent.last_seen {
                Some(last_seen) if last_seen >= threshold => healthy.push(agent.agent_id),
                Some(_) => stale.push(agent.agent_id),
                None if agent.created_at >= threshold => healthy.push(agent.agent_id),
                None => never_seen.push(agent.agent_id),
            }
        }

        let summary = format!(
            "healthy={} stale={} never_seen={}",
            healthy.len(),
            stale.len(),
            never_seen.len()
        );

        HealthReport {
            healthy,
            stale,
            never_seen,
            summary,
        }
    }

    pub fn list_pending_permissions(
        &self,
        agent_id: Option<&str>,
        status: Option<PermissionStatus>,
    ) -> Vec<crate::session::PendingPermission> {
        self.store.list_pending_permissions(agent_id, status)
    }

    pub fn clear_expired_permissions(&self, max_age_hours: i64) -> Result<usize, CoordinationError> {
        self.store.clear_expired_permissions(max_age_hours)
    }

    /// Replay the coordination room's history on demand, outside of
    /// `resume_session`'s automatic sync. Returns the number of agents whose
    /// state was updated.
    pub async fn sync_agent_states(&self) -> Result<usize, CoordinationError> {
        self.store.sync_agent_states(&self.mailbox).await
    }
}
