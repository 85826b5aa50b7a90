//! The pluggable collaborator that turns a [`SpawnInvite`] into a running
//! worker process. Process-vs-remote spawn mechanics are not this crate's
//! concern — only the boundary is.

use async_trait::async_trait;
use serde::Serialize;

/// Everything a launcher needs to hand a freshly spawned worker so it can
/// join the coordination session on its own.
#[derive(Debug, Clone, Serialize)]
pub struct SpawnInvite {
    pub namespace: String,
    pub identity_id: String,
    pub identity_secret: String,
    pub coordinator_identity_id: String,
    pub room_id: String,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start a worker process for `invite`. `remote` selects between a local
    /// process supervisor and a remote workspace provisioner; the core does
    /// not care which, only that the returned label identifies the worker
    /// for operator-facing output.
    async fn launch(&self, invite: &SpawnInvite, remote: bool) -> anyhow::Result<String>;
}

/// A launcher that does nothing but report success, for tests and demos
/// that don't need an actual worker process.
pub struct NoopLauncher;

#[async_trait]
impl AgentLauncher for NoopLauncher {
    async fn launch(&self, invite: &SpawnInvite, remote: bool) -> anyhow::Result<String> {
        tracing::info!(
            identity_id = %invite.identity_id,
            remote,
            "noop launcher: skipping actual worker spawn"
        );
        Ok(format!("noop:{}", invite.identity_id))
    }
}
