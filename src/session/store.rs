use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use fs2::FileExt;
use uuid::Uuid;

use super::{Agent, AgentState, Human, PendingPermission, PermissionStatus, SessionState};
use crate::error::CoordinationError;
use crate::mailbox::MailboxClient;

/// Owns the in-memory [`SessionState`] for one session and persists it to
/// disk on every mutating call.
pub struct SessionStore {
    state: Mutex<SessionState>,
    sessions_dir: PathBuf,
    /// Advisory exclusive lock on the session's lock file, held for the
    /// lifetime of this store. A second coordinator resuming the same
    /// session is unsupported (§5); this makes that case loud instead of
    /// silently corrupting the document. Acquisition failure is logged, not
    /// fatal — the lock is hardening, not a correctness requirement.
    _lock_file: Option<File>,
}

impl SessionStore {
    fn path_for(sessions_dir: &Path, session_id: &str) -> PathBuf {
        sessions_dir.join(format!("{session_id}.json"))
    }

    fn lock_path_for(sessions_dir: &Path, session_id: &str) -> PathBuf {
        sessions_dir.join(format!("{session_id}.lock"))
    }

    fn try_acquire_lock(sessions_dir: &Path, session_id: &str) -> Option<File> {
        fs::create_dir_all(sessions_dir).ok()?;
        let path = Self::lock_path_for(sessions_dir, session_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .ok()?;
        match file.try_lock_exclusive() {
            Ok(()) => Some(file),
            Err(err) => {
                tracing::warn!(
                    session_id,
                    error = %err,
                    "could not acquire advisory session lock; another coordinator may be resuming this session"
                );
                None
            }
        }
    }

    /// Allocate a fresh namespace, coordinator identity, and coordination
    /// room via the mailbox, and persist the resulting session.
    pub async fn create_session(
        mailbox: &Arc<dyn MailboxClient>,
        sessions_dir: impl Into<PathBuf>,
        display_name: &str,
    ) -> Result<Self, CoordinationError> {
        let sessions_dir = sessions_dir.into();
        let ns = mailbox.create_namespace(display_name).await?;
        let coordinator = mailbox
            .create_identity(&ns.namespace, "coordinator", &ns.secret)
            .await?;
        let room = mailbox
            .create_room(&ns.namespace, &coordinator.secret, "coordination")
            .await?;

        let session_id = Uuid::new_v4().to_string();
        let state = SessionState {
            session_id: session_id.clone(),
            display_name: display_name.to_string(),
            created_at: Utc::now(),
            namespace: ns.namespace,
            namespace_secret: ns.secret,
            coordinator_identity_id: coordinator.identity_id,
            coordinator_secret: coordinator.secret,
            coordination_room_id: room.room_id,
            agents: Default::default(),
            humans: Default::default(),
            pending_permissions: Default::default(),
        };

        let lock_file = Self::try_acquire_lock(&sessions_dir, &session_id);
        let store = Self {
            state: Mutex::new(state),
            sessions_dir,
            _lock_file: lock_file,
        };
        store.persist()?;
        Ok(store)
    }

    /// Load a persisted session from disk. When `sync` is true, the
    /// coordination room's history is replayed to repair agent state.
    pub async fn resume_session(
        mailbox: &Arc<dyn MailboxClient>,
        sessions_dir: impl Into<PathBuf>,
        session_id: &str,
        sync: bool,
    ) -> Result<Self, CoordinationError> {
        let sessions_dir = sessions_dir.into();
        let path = Self::path_for(&sessions_dir, session_id);
        let raw = fs::read_to_string(&path).map_err(|_| CoordinationError::SessionNotFound {
            session_id: session_id.to_string(),
        })?;
        let state: SessionState = serde_json::from_str(&raw).map_err(|e| {
            CoordinationError::SessionPersistFailed {
                session_id: session_id.to_string(),
                message: e.to_string(),
            }
        })?;

        let lock_file = Self::try_acquire_lock(&sessions_dir, session_id);
        let store = Self {
            state: Mutex::new(state),
            sessions_dir,
            _lock_file: lock_file,
        };

        if sync {
            store.sync_agent_states(mailbox).await?;
        }

        Ok(store)
    }

    /// Replay recent coordination-room history and apply the inferred agent
    /// states as a single transaction.
    pub async fn sync_agent_states(
        &self,
        mailbox: &Arc<dyn MailboxClient>,
    ) -> Result<usize, CoordinationError> {
        let (namespace, secret, room_id) = {
            let state = self.state.lock().unwrap();
            (
                state.namespace.clone(),
                state.coordinator_secret.clone(),
                state.coordination_room_id.clone(),
            )
        };

        let messages = match mailbox
            .get_room_messages(&namespace, &room_id, &secret, None)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(error = %err, "reconciliation degraded: mailbox unavailable");
                return Ok(0);
            }
        };

        let outcome = {
            let state = self.state.lock().unwrap();
            super::reconcile(&messages, &state.agents)
        };

        let applied = outcome.updates.len();
        {
            let mut state = self.state.lock().unwrap();
            for update in outcome.updates {
                if let Some(agent) = state.agents.get_mut(&update.agent_id) {
                    agent.state = update.state;
                    agent.last_seen = Some(update.last_seen);
                    if update.state == AgentState::Working {
                        agent.current_task_id = update.task_id;
                    } else {
                        agent.current_task_id = None;
                    }
                }
            }
            for queued in outcome.newly_pending {
                state
                    .pending_permissions
                    .entry(queued.request_id.clone())
                    .or_insert(queued);
            }
        }
        self.persist()?;
        Ok(applied)
    }

    pub fn session_id(&self) -> String {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    pub fn namespace(&self) -> String {
        self.state.lock().unwrap().namespace.clone()
    }

    pub fn coordinator_identity_id(&self) -> String {
        self.state.lock().unwrap().coordinator_identity_id.clone()
    }

    pub fn coordinator_secret(&self) -> String {
        self.state.lock().unwrap().coordinator_secret.clone()
    }

    pub fn coordination_room_id(&self) -> String {
        self.state.lock().unwrap().coordination_room_id.clone()
    }

    pub fn register_agent(
        &self,
        agent_id: &str,
        identity_id: &str,
        display_name: &str,
        workspace_name: Option<String>,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            state.agents.insert(
                agent_id.to_string(),
                Agent {
                    agent_id: agent_id.to_string(),
                    identity_id: identity_id.to_string(),
                    display_name: display_name.to_string(),
                    workspace_name,
                    state: AgentState::Spawning,
                    current_task_id: None,
                    created_at: Utc::now(),
                    last_seen: None,
                    tmux_session: None,
                },
            );
        }
        self.persist()
    }

    pub fn update_agent_state(
        &self,
        agent_id: &str,
        new_state: AgentState,
        task_id: Option<String>,
        tmux_session: Option<String>,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            let agent = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| CoordinationError::AgentUnknown {
                    agent_id: agent_id.to_string(),
                })?;
            if agent.state.is_terminal() && new_state != AgentState::Terminated {
                return Err(CoordinationError::AgentIllegalTransition {
                    agent_id: agent_id.to_string(),
                    from: agent.state.as_str().to_string(),
                    to: new_state.as_str().to_string(),
                });
            }
            if new_state == AgentState::Working && task_id.is_none() {
                return Err(CoordinationError::AgentIllegalTransition {
                    agent_id: agent_id.to_string(),
                    from: agent.state.as_str().to_string(),
                    to: "working (missing task_id)".to_string(),
                });
            }
            agent.state = new_state;
            agent.last_seen = Some(Utc::now());
            match new_state {
                AgentState::Working => agent.current_task_id = task_id,
                AgentState::Idle => agent.current_task_id = None,
                _ => {}
            }
            if tmux_session.is_some() {
                agent.tmux_session = tmux_session;
            }
        }
        self.persist()
    }

    pub fn update_agent_last_seen(&self, agent_id: &str) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            let agent = state
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| CoordinationError::AgentUnknown {
                    agent_id: agent_id.to_string(),
                })?;
            agent.last_seen = Some(Utc::now());
        }
        self.persist()
    }

    pub fn remove_agent(&self, agent_id: &str) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            state.agents.remove(agent_id);
        }
        self.persist()
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.state.lock().unwrap().agents.get(agent_id).cloned()
    }

    pub fn get_agent_by_identity(&self, identity_id: &str) -> Option<Agent> {
        self.state
            .lock()
            .unwrap()
            .agents
            .values()
            .find(|a| a.identity_id == identity_id)
            .cloned()
    }

    pub fn list_agents(&self, state_filter: Option<AgentState>) -> Vec<Agent> {
        self.state
            .lock()
            .unwrap()
            .agents
            .values()
            .filter(|a| state_filter.map(|f| a.state == f).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn register_human(
        &self,
        identity_id: &str,
        display_name: &str,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            state.humans.insert(
                identity_id.to_string(),
                Human {
                    identity_id: identity_id.to_string(),
                    display_name: display_name.to_string(),
                    joined_at: Utc::now(),
                },
            );
        }
        self.persist()
    }

    pub fn list_humans(&self) -> Vec<Human> {
        self.state.lock().unwrap().humans.values().cloned().collect()
    }

    pub fn queue_permission(
        &self,
        request_id: &str,
        agent_id: &str,
        action: &str,
        resource: &str,
        context: &str,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            state.pending_permissions.insert(
                request_id.to_string(),
                PendingPermission {
                    request_id: request_id.to_string(),
                    agent_id: agent_id.to_string(),
                    action: action.to_string(),
                    resource: resource.to_string(),
                    context: context.to_string(),
                    requested_at: Utc::now(),
                    status: PermissionStatus::Pending,
                },
            );
        }
        self.persist()
    }

    pub fn get_pending_permission(&self, request_id: &str) -> Option<PendingPermission> {
        self.state
            .lock()
            .unwrap()
            .pending_permissions
            .get(request_id)
            .cloned()
    }

    pub fn list_pending_permissions(
        &self,
        agent_id: Option<&str>,
        status: Option<PermissionStatus>,
    ) -> Vec<PendingPermission> {
        self.state
            .lock()
            .unwrap()
            .pending_permissions
            .values()
            .filter(|p| agent_id.map(|a| p.agent_id == a).unwrap_or(true))
            .filter(|p| status.map(|s| p.status == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn update_pending_permission(
        &self,
        request_id: &str,
        status: PermissionStatus,
    ) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            let pending = state
                .pending_permissions
                .get_mut(request_id)
                .ok_or_else(|| CoordinationError::PermissionUnknownRequest {
                    request_id: request_id.to_string(),
                })?;
            pending.status = status;
        }
        self.persist()
    }

    pub fn remove_pending_permission(&self, request_id: &str) -> Result<(), CoordinationError> {
        {
            let mut state = self.state.lock().unwrap();
            state.pending_permissions.remove(request_id);
        }
        self.persist()
    }

    pub fn clear_expired_permissions(&self, max_age_hours: i64) -> Result<usize, CoordinationError> {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let count;
        {
            let mut state = self.state.lock().unwrap();
            let mut n = 0;
            for pending in state.pending_permissions.values_mut() {
                if pending.status == PermissionStatus::Pending && pending.requested_at < cutoff {
                    pending.status = PermissionStatus::Expired;
                    n += 1;
                }
            }
            count = n;
        }
        self.persist()?;
        Ok(count)
    }

    /// Write-to-temp-then-rename atomic persistence.
    fn persist(&self) -> Result<(), CoordinationError> {
        let state = self.state.lock().unwrap();
        fs::create_dir_all(&self.sessions_dir).map_err(|e| {
            CoordinationError::SessionPersistFailed {
                session_id: state.session_id.clone(),
                message: e.to_string(),
            }
        })?;
        let path = Self::path_for(&self.sessions_dir, &state.session_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&*state).map_err(|e| {
            CoordinationError::SessionPersistFailed {
                session_id: state.session_id.clone(),
                message: e.to_string(),
            }
        })?;
        fs::write(&tmp_path, json).map_err(|e| CoordinationError::SessionPersistFailed {
            session_id: state.session_id.clone(),
            message: e.to_string(),
        })?;
        fs::rename(&tmp_path, &path).map_err(|e| CoordinationError::SessionPersistFailed {
            session_id: state.session_id.clone(),
            message: e.to_string(),
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o600);
                let _ = fs::set_permissions(&path, perms);
            }
        }

        Ok(())
    }
}

/// List the session ids persisted under `sessions_dir`.
pub fn list_sessions(sessions_dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(sessions_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Delete a session's persisted document. Not an error if it is already gone.
pub fn delete_session(sessions_dir: &Path, session_id: &str) -> Result<(), CoordinationError> {
    let _ = fs::remove_file(SessionStore::lock_path_for(sessions_dir, session_id));
    let path = SessionStore::path_for(sessions_dir, session_id);
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoordinationError::SessionPersistFailed {
            session_id: session_id.to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::InMemoryMailbox;
    use std::sync::Arc;

    fn mailbox() -> Arc<dyn MailboxClient> {
        Arc::new(InMemoryMailbox::new())
    }

    #[tokio::test]
    async fn create_then_resume_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        let session_id = store.session_id();
        store
            .register_agent("agent-1", "identity-1", "worker one", None)
            .unwrap();

        let resumed = SessionStore::resume_session(&mb, dir.path(), &session_id, false)
            .await
            .unwrap();
        let agent = resumed.get_agent("agent-1").unwrap();
        assert_eq!(agent.display_name, "worker one");
        assert_eq!(agent.state, AgentState::Spawning);
    }

    #[tokio::test]
    async fn resume_with_lock_already_held_degrades_not_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        let session_id = store.session_id();

        // `store` is still alive and holding the advisory lock; a second
        // resume of the same session must still succeed (§5: a second
        // resume attempt is allowed, just unsupported for correctness).
        let second = SessionStore::resume_session(&mb, dir.path(), &session_id, false).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn working_requires_task_id_and_idle_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        store
            .register_agent("agent-1", "identity-1", "worker", None)
            .unwrap();

        store
            .update_agent_state(
                "agent-1",
                AgentState::Working,
                Some("task-1".to_string()),
                None,
            )
            .unwrap();
        assert_eq!(
            store.get_agent("agent-1").unwrap().current_task_id,
            Some("task-1".to_string())
        );

        store
            .update_agent_state("agent-1", AgentState::Idle, None, None)
            .unwrap();
        assert_eq!(store.get_agent("agent-1").unwrap().current_task_id, None);
    }

    #[tokio::test]
    async fn terminated_is_a_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        store
            .register_agent("agent-1", "identity-1", "worker", None)
            .unwrap();
        store
            .update_agent_state("agent-1", AgentState::Terminated, None, None)
            .unwrap();

        let err = store
            .update_agent_state("agent-1", AgentState::Idle, None, None)
            .unwrap_err();
        assert_eq!(err.kind(), "agent/illegal-transition");
    }

    #[tokio::test]
    async fn clear_expired_permissions_marks_not_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        store
            .register_agent("agent-1", "identity-1", "worker", None)
            .unwrap();
        store
            .queue_permission("req-1", "agent-1", "write", "file.txt", "needs write access")
            .unwrap();

        // Not expired yet at 0 hours of age with a positive cutoff.
        let cleared = store.clear_expired_permissions(24).unwrap();
        assert_eq!(cleared, 0);
        assert_eq!(
            store.get_pending_permission("req-1").unwrap().status,
            PermissionStatus::Pending
        );

        // A cutoff of "everything older than now" expires it, and it stays in the map.
        let cleared = store.clear_expired_permissions(-1).unwrap();
        assert_eq!(cleared, 1);
        assert_eq!(
            store.get_pending_permission("req-1").unwrap().status,
            PermissionStatus::Expired
        );
    }

    #[tokio::test]
    async fn list_agents_filters_by_state_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        store.register_agent("agent-1", "identity-1", "a1", None).unwrap();
        store.register_agent("agent-2", "identity-2", "a2", None).unwrap();
        store.register_agent("agent-3", "identity-3", "a3", None).unwrap();
        store
            .update_agent_state("agent-1", AgentState::Idle, None, None)
            .unwrap();
        store
            .update_agent_state(
                "agent-2",
                AgentState::Working,
                Some("task-1".to_string()),
                None,
            )
            .unwrap();

        let idle = store.list_agents(Some(AgentState::Idle));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].agent_id, "agent-1");

        let spawning = store.list_agents(Some(AgentState::Spawning));
        assert_eq!(spawning.len(), 1);
        assert_eq!(spawning[0].agent_id, "agent-3");

        assert_eq!(store.list_agents(None).len(), 3);
    }

    #[tokio::test]
    async fn remove_pending_permission_then_get_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        store.register_agent("agent-1", "identity-1", "worker", None).unwrap();
        store
            .queue_permission("req-1", "agent-1", "write", "file.txt", "ctx")
            .unwrap();
        assert!(store.get_pending_permission("req-1").is_some());

        store.remove_pending_permission("req-1").unwrap();
        assert!(store.get_pending_permission("req-1").is_none());
    }

    #[tokio::test]
    async fn list_and_delete_session_operate_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        let session_id = store.session_id();

        let ids = list_sessions(dir.path());
        assert!(ids.contains(&session_id));

        delete_session(dir.path(), &session_id).unwrap();
        assert!(!list_sessions(dir.path()).contains(&session_id));

        // Deleting again is not an error.
        delete_session(dir.path(), &session_id).unwrap();
    }

    #[tokio::test]
    async fn persisted_session_document_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let mb = mailbox();
        let store = SessionStore::create_session(&mb, dir.path(), "demo").await.unwrap();
        store.register_agent("agent-1", "identity-1", "worker", None).unwrap();
        store
            .queue_permission("req-1", "agent-1", "write", "file.txt", "ctx")
            .unwrap();

        let path = SessionStore::path_for(dir.path(), &store.session_id());
        let raw = fs::read_to_string(&path).unwrap();
        let reparsed: SessionState = serde_json::from_str(&raw).unwrap();

        let original = store.snapshot();
        assert_eq!(reparsed.session_id, original.session_id);
        assert_eq!(reparsed.agents.len(), original.agents.len());
        assert_eq!(
            reparsed.pending_permissions["req-1"].resource,
            original.pending_permissions["req-1"].resource
        );
    }
}
