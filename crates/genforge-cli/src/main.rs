mod dry_run;

use clap::{Args, Parser, Subcommand};
use dry_run::DryRunExecutor;
use genforge_core::AgentRole;
use genforge_orchestrator::{
    plan_tasks, AppType, ExecutorTable, GenerationRequest, OrchestratorConfig, OrchestratorService,
    SessionStatus, TaskGraph,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "genforge", about = "Genforge: dependency-aware multi-agent app generation")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "genforge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the execution order the scheduler would follow
    Plan(RequestArgs),
    /// Run a session end-to-end with the offline executor
    Run {
        #[command(flatten)]
        request: RequestArgs,
        /// Simulated per-task latency in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
}

#[derive(Args)]
struct RequestArgs {
    /// What the generated application should do
    requirement: String,
    /// Active roles, comma separated (default: analysis,design,implementation)
    #[arg(long, value_delimiter = ',')]
    roles: Vec<AgentRole>,
    /// Kind of application to generate
    #[arg(long, default_value = "web_app")]
    app_type: AppType,
    /// Preferred technology, repeatable
    #[arg(long = "tech")]
    tech_stack: Vec<String>,
    /// Free-form extra constraints
    #[arg(long)]
    extra: Option<String>,
}

impl RequestArgs {
    fn into_request(self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.requirement).with_app_type(self.app_type);
        if !self.roles.is_empty() {
            request = request.with_roles(self.roles);
        }
        for tech in self.tech_stack {
            request = request.with_tech(tech);
        }
        request.additional_requirements = self.extra;
        request
    }
}

#[derive(Deserialize, Default)]
struct GenforgeConfig {
    #[serde(default)]
    orchestrator: OrchestratorConfig,
}

async fn load_config(path: &Path) -> anyhow::Result<GenforgeConfig> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(GenforgeConfig::default());
    }
    let config_str = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {e}", path.display()))?;
    Ok(toml::from_str(&config_str)?)
}

/// Numbered execution order, one line per task.
fn render_plan(request: &GenerationRequest, max_retries: u32) -> anyhow::Result<Vec<String>> {
    let tasks = plan_tasks(Uuid::new_v4(), request, max_retries)?;
    let mut graph = TaskGraph::new();
    for task in tasks {
        graph.add(task)?;
    }
    let errors = graph.validate();
    if !errors.is_empty() {
        anyhow::bail!("invalid plan: {}", errors.join("; "));
    }

    let mut lines = Vec::with_capacity(graph.len());
    for (n, id) in graph.topological_order()?.iter().enumerate() {
        let Some(task) = graph.get(id) else { continue };
        let deps: Vec<&str> = task.dependencies.iter().map(String::as_str).collect();
        let deps = if deps.is_empty() {
            "none".to_string()
        } else {
            deps.join(", ")
        };
        lines.push(format!(
            "{}. {} [{}] {} ({:?}, deps: {deps})",
            n + 1,
            task.id,
            task.role,
            task.task_type,
            task.priority
        ));
    }
    Ok(lines)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Plan(args) => {
            let request = args.into_request();
            for line in render_plan(&request, config.orchestrator.max_retries)? {
                println!("{line}");
            }
        }
        Commands::Run { request, delay_ms } => {
            let request = request.into_request();
            let executor = Arc::new(DryRunExecutor::with_delay(Duration::from_millis(delay_ms)));
            let service = OrchestratorService::new(config.orchestrator, ExecutorTable::uniform(executor))?;
            service.start().await?;

            let session_id = service.create_session(&request).await?;
            info!(session_id = %session_id, "Session started");

            let report = tokio::select! {
                report = service.wait(session_id) => report?,
                _ = tokio::signal::ctrl_c() => {
                    warn!(session_id = %session_id, "Interrupted, cancelling session");
                    service.cancel(session_id).await;
                    service.get_status(session_id).await?
                }
            };

            println!("{}", serde_json::to_string_pretty(&report)?);
            for artifact in service.get_artifacts(session_id).await? {
                println!(
                    "{}{} ({}, {} bytes, quality {:.2})",
                    artifact.project_path,
                    artifact.name,
                    artifact.kind.as_str(),
                    artifact.size,
                    artifact.quality_score
                );
            }
            service.stop().await;

            if report.status != SessionStatus::Completed {
                anyhow::bail!("session {session_id} ended {}", report.status.as_str());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_arguments() {
        let cli = Cli::try_parse_from([
            "genforge",
            "run",
            "A bookmark manager with tags",
            "--roles",
            "analysis,implementation",
            "--app-type",
            "cli-tool",
            "--tech",
            "python",
            "--tech",
            "sqlite",
            "--delay-ms",
            "5",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("genforge.toml"));
        let Commands::Run { request, delay_ms } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(delay_ms, 5);
        let request = request.into_request();
        assert_eq!(request.active_roles, vec![AgentRole::Analysis, AgentRole::Implementation]);
        assert_eq!(request.app_type, AppType::CliTool);
        assert_eq!(request.tech_stack, vec!["python", "sqlite"]);
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        assert!(Cli::try_parse_from(["genforge", "plan", "A bookmark manager", "--roles", "qa"]).is_err());
    }

    #[test]
    fn test_render_plan_follows_dependencies() {
        let request = GenerationRequest::new("A bookmark manager with tags").with_roles(AgentRole::ALL);
        let lines = render_plan(&request, 3).unwrap();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with("1. ") && lines[0].contains("[analysis]"));
        assert!(lines[0].ends_with("deps: none)"));
        assert!(lines[3].contains("[implementation]"));
        assert!(lines[5].contains("[operations]"));
    }

    #[test]
    fn test_render_plan_rejects_invalid_request() {
        let request = GenerationRequest::new("tiny");
        assert!(render_plan(&request, 3).is_err());
    }

    #[tokio::test]
    async fn test_config_file_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(missing.orchestrator, OrchestratorConfig::default());

        let path = dir.path().join("genforge.toml");
        std::fs::write(
            &path,
            "[orchestrator]\nmax_retries = 1\ncleanup_grace_secs = 60\n\n[orchestrator.retry_backoff]\nstrategy = \"fixed\"\nbase_ms = 10\n",
        )
        .unwrap();
        let config = load_config(&path).await.unwrap();
        assert_eq!(config.orchestrator.max_retries, 1);
        assert_eq!(config.orchestrator.cleanup_grace_secs, 60);
        assert_eq!(config.orchestrator.retry_backoff.base_ms, 10);
        assert_eq!(config.orchestrator.notification_buffer, 256);
    }
}
