//! Generation requests and the standard role pipeline they expand into.

use crate::types::{AgentRole, AgentTask, TaskPriority};
use genforge_core::{GenforgeError, GenforgeResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

const REQUIREMENT_CHARS: std::ops::RangeInclusive<usize> = 10..=50_000;
const MAX_ADDITIONAL_CHARS: usize = 10_000;
const MAX_TECH_STACK: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppType {
    #[default]
    WebApp,
    MobileApp,
    ApiService,
    DesktopApp,
    CliTool,
}

impl AppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebApp => "web_app",
            Self::MobileApp => "mobile_app",
            Self::ApiService => "api_service",
            Self::DesktopApp => "desktop_app",
            Self::CliTool => "cli_tool",
        }
    }
}

impl std::str::FromStr for AppType {
    type Err = GenforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "web_app" => Ok(Self::WebApp),
            "mobile_app" => Ok(Self::MobileApp),
            "api_service" => Ok(Self::ApiService),
            "desktop_app" => Ok(Self::DesktopApp),
            "cli_tool" => Ok(Self::CliTool),
            other => Err(GenforgeError::InvalidRequest(format!("unknown app type: {other}"))),
        }
    }
}

/// A request to generate an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Natural-language description of the application.
    pub requirement: String,
    #[serde(default)]
    pub app_type: AppType,
    #[serde(default = "default_active_roles")]
    pub active_roles: Vec<AgentRole>,
    #[serde(default)]
    pub tech_stack: Vec<String>,
    #[serde(default)]
    pub additional_requirements: Option<String>,
}

fn default_active_roles() -> Vec<AgentRole> {
    vec![AgentRole::Analysis, AgentRole::Design, AgentRole::Implementation]
}

impl GenerationRequest {
    pub fn new(requirement: impl Into<String>) -> Self {
        Self {
            requirement: requirement.into(),
            app_type: AppType::default(),
            active_roles: default_active_roles(),
            tech_stack: Vec::new(),
            additional_requirements: None,
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = AgentRole>) -> Self {
        self.active_roles = roles.into_iter().collect();
        self
    }

    pub fn with_app_type(mut self, app_type: AppType) -> Self {
        self.app_type = app_type;
        self
    }

    pub fn with_tech(mut self, tech: impl Into<String>) -> Self {
        self.tech_stack.push(tech.into());
        self
    }

    /// Check field bounds. Blank tech-stack entries are ignored.
    pub fn validate(&self) -> GenforgeResult<()> {
        let chars = self.requirement.trim().chars().count();
        if !REQUIREMENT_CHARS.contains(&chars) {
            return Err(GenforgeError::InvalidRequest(format!(
                "requirement must be {}..={} characters, got {chars}",
                REQUIREMENT_CHARS.start(),
                REQUIREMENT_CHARS.end()
            )));
        }
        if self.active_roles.is_empty() || self.active_roles.len() > AgentRole::ALL.len() {
            return Err(GenforgeError::InvalidRequest(format!(
                "between 1 and {} active roles required, got {}",
                AgentRole::ALL.len(),
                self.active_roles.len()
            )));
        }
        let unique: HashSet<_> = self.active_roles.iter().collect();
        if unique.len() != self.active_roles.len() {
            return Err(GenforgeError::InvalidRequest("duplicate active role".into()));
        }
        let tech = self.tech_stack.iter().filter(|t| !t.trim().is_empty()).count();
        if tech > MAX_TECH_STACK {
            return Err(GenforgeError::InvalidRequest(format!(
                "at most {MAX_TECH_STACK} tech stack entries allowed, got {tech}"
            )));
        }
        if let Some(extra) = &self.additional_requirements {
            if extra.chars().count() > MAX_ADDITIONAL_CHARS {
                return Err(GenforgeError::InvalidRequest(format!(
                    "additional requirements exceed {MAX_ADDITIONAL_CHARS} characters"
                )));
            }
        }
        Ok(())
    }

    fn is_active(&self, role: AgentRole) -> bool {
        self.active_roles.contains(&role)
    }
}

struct Stage {
    role: AgentRole,
    suffix: &'static str,
    task_type: &'static str,
    description: &'static str,
    priority: TaskPriority,
    after: &'static [AgentRole],
}

static PIPELINE: [Stage; 6] = [
    Stage {
        role: AgentRole::Analysis,
        suffix: "analysis",
        task_type: "requirement_analysis",
        description: "Analyze requirements and write the product specification",
        priority: TaskPriority::High,
        after: &[],
    },
    Stage {
        role: AgentRole::Design,
        suffix: "design",
        task_type: "system_design",
        description: "Design the system architecture",
        priority: TaskPriority::High,
        after: &[AgentRole::Analysis],
    },
    Stage {
        role: AgentRole::Planning,
        suffix: "plan",
        task_type: "project_planning",
        description: "Break the design into an implementation plan",
        priority: TaskPriority::Normal,
        after: &[AgentRole::Design],
    },
    Stage {
        role: AgentRole::Implementation,
        suffix: "implementation",
        task_type: "implementation",
        description: "Implement the application code",
        priority: TaskPriority::Critical,
        after: &[AgentRole::Design, AgentRole::Planning],
    },
    Stage {
        role: AgentRole::Verification,
        suffix: "testing",
        task_type: "testing",
        description: "Write and run tests for the implementation",
        priority: TaskPriority::High,
        after: &[AgentRole::Implementation],
    },
    Stage {
        role: AgentRole::Operations,
        suffix: "deployment",
        task_type: "deployment_config",
        description: "Produce build and deployment configuration",
        priority: TaskPriority::Normal,
        after: &[AgentRole::Implementation, AgentRole::Verification],
    },
];

fn task_id(session_id: Uuid, role: AgentRole) -> String {
    let suffix = PIPELINE
        .iter()
        .find(|s| s.role == role)
        .map_or(role.as_str(), |s| s.suffix);
    format!("{session_id}_{suffix}")
}

/// Expand `request` into the standard pipeline restricted to its active roles.
///
/// Edges to inactive roles are dropped, so a request for `[design,
/// implementation]` yields two tasks with one edge between them.
pub fn plan_tasks(
    session_id: Uuid,
    request: &GenerationRequest,
    max_retries: u32,
) -> GenforgeResult<Vec<AgentTask>> {
    request.validate()?;

    let tasks = PIPELINE
        .iter()
        .filter(|stage| request.is_active(stage.role))
        .map(|stage| {
            let deps = stage
                .after
                .iter()
                .filter(|role| request.is_active(**role))
                .map(|role| task_id(session_id, *role));
            AgentTask::new(
                task_id(session_id, stage.role),
                stage.role,
                stage.task_type,
                stage.description,
            )
            .with_priority(stage.priority)
            .with_dependencies(deps)
            .with_max_retries(max_retries)
            .with_context("requirement", serde_json::json!(request.requirement))
            .with_context("app_type", serde_json::json!(request.app_type.as_str()))
            .with_context("tech_stack", serde_json::json!(request.tech_stack))
            .with_context(
                "additional_requirements",
                serde_json::json!(request.additional_requirements),
            )
        })
        .collect();
    Ok(tasks)
}
