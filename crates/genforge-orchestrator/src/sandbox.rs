use crate::artifacts::Artifact;
use async_trait::async_trait;
use genforge_core::GenforgeResult;
use uuid::Uuid;

/// Identifier handed out by the sandbox collaborator.
pub type SandboxId = String;

/// The sandboxed code-execution/preview service.
///
/// The orchestrator provisions a sandbox once per session, after every task is
/// terminal and at least one code artifact exists, and releases it exactly once
/// when the session is cancelled or evicted.
#[async_trait]
pub trait SandboxService: Send + Sync {
    /// Provision a sandbox for `session_id`.
    async fn create(&self, session_id: Uuid) -> GenforgeResult<SandboxId>;

    /// Copy artifacts into the sandbox filesystem.
    async fn write(&self, sandbox_id: &SandboxId, artifacts: &[Artifact]) -> GenforgeResult<()>;

    /// Start the application and return its preview URL.
    async fn run(&self, sandbox_id: &SandboxId) -> GenforgeResult<String>;

    /// Release everything held for `session_id`. `sandbox_id` is `None` when the
    /// session ended before a sandbox was provisioned.
    async fn cleanup(&self, session_id: Uuid, sandbox_id: Option<&SandboxId>) -> GenforgeResult<()>;
}
