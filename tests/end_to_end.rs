use std::sync::Arc;
use std::time::Duration;

use ccswarm_coordination::context::CoordinationContext;
use ccswarm_coordination::launcher::NoopLauncher;
use ccswarm_coordination::mailbox::{InMemoryMailbox, MailboxClient};
use ccswarm_coordination::protocol::CoordinationMessage;
use ccswarm_coordination::session::{AgentState, PermissionStatus, SessionStore};
use ccswarm_coordination::tools::{CoordinatorTools, Decision, MessageKind};

async fn setup(dir: &std::path::Path) -> (CoordinatorTools, Arc<SessionStore>, Arc<dyn MailboxClient>) {
    let mailbox: Arc<dyn MailboxClient> = Arc::new(InMemoryMailbox::new());
    let store = Arc::new(
        SessionStore::create_session(&mailbox, dir, "e2e")
            .await
            .unwrap(),
    );
    let ctx = CoordinationContext::new(
        mailbox.clone(),
        store.namespace(),
        store.coordinator_identity_id(),
        store.coordinator_secret(),
        store.coordination_room_id(),
        store.coordinator_identity_id(),
    );
    let tools = CoordinatorTools::new(store.clone(), ctx, mailbox.clone(), Arc::new(NoopLauncher));
    (tools, store, mailbox)
}

/// Scenario: a task is assigned, the worker acknowledges and reports a
/// result, and polling brings the agent back to idle.
#[tokio::test]
async fn task_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (tools, store, mailbox) = setup(dir.path()).await;

    let report = tools.spawn_agent(None, Some("worker-a".into()), false).await.unwrap();

    tools
        .message_agent(
            &report.agent_id,
            MessageKind::Task {
                task_id: "task-1".into(),
                description: "build the thing".into(),
                context: serde_json::Value::Null,
                deadline: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(store.get_agent(&report.agent_id).unwrap().state, AgentState::Working);

    let namespace = store.namespace();
    let coordinator_id = store.coordinator_identity_id();

    // The worker authenticates with its own identity secret, carried in the
    // invite the spawn produced.
    let invite = &report.invite;
    let ack_payload = CoordinationMessage::TaskAck {
        task_id: "task-1".into(),
        agent_id: report.agent_id.clone(),
    }
    .encode(false)
    .unwrap();
    mailbox
        .send_message(
            &namespace,
            &coordinator_id,
            &ack_payload.body,
            &invite.identity_secret,
            &ack_payload.content_type,
        )
        .await
        .unwrap();

    let result_payload = CoordinationMessage::Result {
        task_id: "task-1".into(),
        agent_id: report.agent_id.clone(),
        status: "success".into(),
        summary: "done".into(),
    }
    .encode(false)
    .unwrap();
    mailbox
        .send_message(
            &namespace,
            &coordinator_id,
            &result_payload.body,
            &invite.identity_secret,
            &result_payload.content_type,
        )
        .await
        .unwrap();

    let summary = tools.poll_messages(Duration::ZERO, false).await.unwrap();
    assert!(summary.contains("task_ack"));
    assert!(summary.contains("result"));
    assert_eq!(store.get_agent(&report.agent_id).unwrap().state, AgentState::Idle);
    assert_eq!(store.get_agent(&report.agent_id).unwrap().current_task_id, None);
}

/// Scenario: a worker requests permission, the coordinator escalates with no
/// humans present (queued), then an expiry sweep marks it expired without
/// removing it.
#[tokio::test]
async fn permission_escalation_with_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let (tools, store, mailbox) = setup(dir.path()).await;

    let report = tools.spawn_agent(None, None, false).await.unwrap();
    let namespace = store.namespace();
    let coordinator_id = store.coordinator_identity_id();

    let request = CoordinationMessage::PermissionRequest {
        request_id: "perm-1".into(),
        action: "delete".into(),
        resource: "prod-db".into(),
        context: "cleanup task".into(),
    }
    .encode(false)
    .unwrap();
    mailbox
        .send_message(
            &namespace,
            &coordinator_id,
            &request.body,
            &report.invite.identity_secret,
            &request.content_type,
        )
        .await
        .unwrap();

    tools.poll_messages(Duration::ZERO, false).await.unwrap();
    assert_eq!(
        store.get_agent(&report.agent_id).unwrap().state,
        AgentState::WaitingPermission
    );

    let escalation = tools.escalate_to_user("perm-1", "dangerous delete").await.unwrap();
    assert!(escalation.contains("queued"));

    let cleared = tools.clear_expired_permissions(-1).unwrap();
    assert_eq!(cleared, 1);
    let pending = tools
        .list_pending_permissions(None, Some(PermissionStatus::Expired));
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, "perm-1");
}

/// Scenario: a session is resumed after restart and room history is replayed
/// to recover agent state that was never explicitly persisted.
#[tokio::test]
async fn resume_reconciles_agent_state_from_room_history() {
    let dir = tempfile::tempdir().unwrap();
    let mailbox: Arc<dyn MailboxClient> = Arc::new(InMemoryMailbox::new());
    let store = SessionStore::create_session(&mailbox, dir.path(), "resume-demo")
        .await
        .unwrap();
    let session_id = store.session_id();
    let namespace = store.namespace();
    let room_id = store.coordination_room_id();
    let coordinator_secret = store.coordinator_secret();

    let worker_identity = mailbox
        .create_identity(&namespace, "worker", &store.snapshot().namespace_secret)
        .await
        .unwrap();
    mailbox
        .add_room_member(&namespace, &room_id, &worker_identity.identity_id, &worker_identity.secret)
        .await
        .unwrap();
    store
        .register_agent("agent-1", &worker_identity.identity_id, "worker", None)
        .unwrap();

    let progress = CoordinationMessage::Progress {
        task_id: "task-1".into(),
        agent_id: "agent-1".into(),
        progress: 0.5,
        message: "working".into(),
    }
    .encode(false)
    .unwrap();
    mailbox
        .send_room_message(&namespace, &room_id, &progress.body, &worker_identity.secret, &progress.content_type)
        .await
        .unwrap();

    drop(store);

    let resumed = SessionStore::resume_session(&mailbox, dir.path(), &session_id, true)
        .await
        .unwrap();
    let agent = resumed.get_agent("agent-1").unwrap();
    assert_eq!(agent.state, AgentState::Working);
    assert_eq!(agent.current_task_id, Some("task-1".to_string()));

    let _ = coordinator_secret;
}

/// Scenario: `CoordinatorTools::sync_agent_states` reconciles on demand,
/// without going through `resume_session`.
#[tokio::test]
async fn sync_agent_states_reconciles_on_demand() {
    let dir = tempfile::tempdir().unwrap();
    let (tools, store, mailbox) = setup(dir.path()).await;

    let report = tools.spawn_agent(None, Some("worker".into()), false).await.unwrap();
    let namespace = store.namespace();
    let room_id = store.coordination_room_id();

    let idle = CoordinationMessage::Idle {
        agent_id: report.agent_id.clone(),
    }
    .encode(false)
    .unwrap();
    mailbox
        .send_room_message(&namespace, &room_id, &idle.body, &report.invite.identity_secret, &idle.content_type)
        .await
        .unwrap();

    let updated = tools.sync_agent_states().await.unwrap();
    assert_eq!(updated, 1);
    assert_eq!(store.get_agent(&report.agent_id).unwrap().state, AgentState::Idle);
}

/// Scenario: two agents exist; a message targeted at one never shows up in
/// the other's state transitions.
#[tokio::test]
async fn two_agents_do_not_cross_talk() {
    let dir = tempfile::tempdir().unwrap();
    let (tools, store, _mailbox) = setup(dir.path()).await;

    let a = tools.spawn_agent(None, Some("a".into()), false).await.unwrap();
    let b = tools.spawn_agent(None, Some("b".into()), false).await.unwrap();

    tools
        .message_agent(
            &a.agent_id,
            MessageKind::Task {
                task_id: "task-a".into(),
                description: "only for a".into(),
                context: serde_json::Value::Null,
                deadline: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(store.get_agent(&a.agent_id).unwrap().state, AgentState::Working);
    assert_eq!(store.get_agent(&b.agent_id).unwrap().state, AgentState::Spawning);
}

/// Scenario: a malformed envelope mixed in with valid ones is skipped, not
/// fatal to the whole poll.
#[tokio::test]
async fn malformed_envelope_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (tools, store, mailbox) = setup(dir.path()).await;

    let report = tools.spawn_agent(None, None, false).await.unwrap();
    let namespace = store.namespace();
    let coordinator_id = store.coordinator_identity_id();

    mailbox
        .send_message(
            &namespace,
            &coordinator_id,
            b"{not valid json",
            &report.invite.identity_secret,
            "application/vnd.ccswarm.coordination+json",
        )
        .await
        .unwrap();

    let idle = CoordinationMessage::Idle {
        agent_id: report.agent_id.clone(),
    }
    .encode(false)
    .unwrap();
    mailbox
        .send_message(
            &namespace,
            &coordinator_id,
            &idle.body,
            &report.invite.identity_secret,
            &idle.content_type,
        )
        .await
        .unwrap();

    let summary = tools.poll_messages(Duration::ZERO, false).await.unwrap();
    assert!(summary.contains("1 new message"));
    assert!(summary.contains("idle"));
}
