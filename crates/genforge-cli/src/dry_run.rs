//! Offline executor used by `genforge run`.
//!
//! Produces a small, deterministic artifact per role so a whole session can be
//! exercised without a model backend.

use async_trait::async_trait;
use genforge_core::{AgentRole, GenforgeResult};
use genforge_orchestrator::{AgentExecutor, ExecutionOutput, RawArtifact, TaskContext};
use std::time::Duration;
use tracing::debug;

/// Answers every task with canned output after an optional delay.
#[derive(Debug, Clone, Default)]
pub struct DryRunExecutor {
    delay: Duration,
}

impl DryRunExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

fn requirement(ctx: &TaskContext) -> String {
    ctx.context
        .get("requirement")
        .and_then(|v| v.as_str())
        .unwrap_or("unspecified application")
        .to_string()
}

fn artifact_for(role: AgentRole, requirement: &str) -> RawArtifact {
    match role {
        AgentRole::Analysis => RawArtifact::new(
            "requirements.md",
            format!("# Requirements\n\n{requirement}\n\n## Scope\n\n- Core workflow\n- Persistence\n"),
        ),
        AgentRole::Design => RawArtifact::new(
            "architecture.md",
            "# Architecture\n\nA single HTTP service backed by a local store.\n",
        ),
        AgentRole::Planning => RawArtifact::new(
            "plan.md",
            "# Plan\n\n1. Scaffold service\n2. Implement handlers\n3. Add tests\n",
        ),
        AgentRole::Implementation => RawArtifact::new(
            "main.py",
            "import json\n\n# entry point\ndef main():\n    print(json.dumps({\"status\": \"ok\"}))\n\n\nif __name__ == \"__main__\":\n    main()\n",
        ),
        AgentRole::Verification => RawArtifact::new(
            "test_main.py",
            "import pytest\nfrom main import main\n\ndef test_main_runs():\n    main()\n",
        ),
        AgentRole::Operations => RawArtifact::new(
            "Dockerfile",
            "FROM python:3.12-slim\nCOPY . /app\nWORKDIR /app\nCMD [\"python\", \"main.py\"]\n",
        ),
    }
}

#[async_trait]
impl AgentExecutor for DryRunExecutor {
    async fn execute(&self, role: AgentRole, ctx: &TaskContext) -> GenforgeResult<ExecutionOutput> {
        if !self.delay.is_zero() {
            tokio::select! {
                () = ctx.cancel.cancelled() => {}
                () = tokio::time::sleep(self.delay) => {}
            }
        }
        let requirement = requirement(ctx);
        debug!(task_id = %ctx.task_id, role = %role, "Dry-run execution");
        let prefix = ctx.session_id.to_string();
        let mut upstream: Vec<&String> = ctx.context.keys().filter(|k| k.starts_with(&prefix)).collect();
        upstream.sort();
        Ok(ExecutionOutput::new(serde_json::json!({
            "role": role.as_str(),
            "task_type": ctx.task_type,
            "upstream": upstream,
        }))
        .with_artifact(artifact_for(role, &requirement)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(role: AgentRole) -> TaskContext {
        let session_id = Uuid::new_v4();
        let mut context = HashMap::new();
        context.insert("requirement".to_string(), serde_json::json!("A recipe sharing site"));
        context.insert(format!("{session_id}_design"), serde_json::json!({"role": "design"}));
        TaskContext {
            session_id,
            task_id: format!("{session_id}_{}", role.as_str()),
            role,
            task_type: "implementation".into(),
            description: "build it".into(),
            context,
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_every_role_yields_an_artifact() {
        let executor = DryRunExecutor::default();
        for role in AgentRole::ALL {
            let out = executor.execute(role, &ctx(role)).await.unwrap();
            assert_eq!(out.artifacts.len(), 1);
            assert_eq!(out.raw_output["role"], role.as_str());
        }
    }

    #[tokio::test]
    async fn test_requirement_and_upstream_are_used() {
        let executor = DryRunExecutor::default();
        let ctx = ctx(AgentRole::Analysis);
        let out = executor.execute(AgentRole::Analysis, &ctx).await.unwrap();
        assert!(out.artifacts[0].content.contains("A recipe sharing site"));
        assert_eq!(out.raw_output["upstream"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delay_is_cut_short_by_cancellation() {
        let executor = DryRunExecutor::with_delay(Duration::from_secs(30));
        let ctx = ctx(AgentRole::Design);
        ctx.cancel.cancel();
        let out = tokio::time::timeout(Duration::from_secs(1), executor.execute(AgentRole::Design, &ctx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.artifacts[0].name, "architecture.md");
    }
}
