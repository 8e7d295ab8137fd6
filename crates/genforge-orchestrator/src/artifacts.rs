//! Post-processing of agent outputs into project files.
//!
//! Raw artifacts are classified, checked against a size ceiling and a deny-list
//! of dangerous patterns, annotated with metadata, placed in the project tree,
//! and given a coarse quality score. The score is used for display ranking only.

use crate::config::ArtifactConfig;
use crate::types::{AgentRole, TaskId};
use chrono::{DateTime, Utc};
use genforge_core::{GenforgeError, GenforgeResult};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

/// A file as returned by the agent-execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawArtifact {
    pub name: String,
    pub content: String,
    /// Declared kind (`code`, `configuration`, `documentation`).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

impl RawArtifact {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            artifact_type: None,
            language: None,
            file_path: None,
        }
    }

    pub fn with_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Code,
    Configuration,
    Documentation,
    Other,
}

impl ArtifactKind {
    /// Parse a declared kind, accepting common short forms.
    pub fn from_declared(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "code" | "source" => Some(Self::Code),
            "configuration" | "config" => Some(Self::Configuration),
            "documentation" | "docs" | "doc" => Some(Self::Documentation),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Configuration => "configuration",
            Self::Documentation => "documentation",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMetrics {
    pub lines: usize,
    pub characters: usize,
    pub import_count: usize,
    pub function_count: usize,
    pub class_count: usize,
    pub has_async: bool,
    pub has_tests: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMetrics {
    /// `json`, `toml`, `yaml`, `environment`, or `unknown`.
    pub format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocMetrics {
    pub lines: usize,
    pub words: usize,
    pub headers: usize,
    pub code_blocks: usize,
}

/// Kind-specific content metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ArtifactMetadata {
    Code(CodeMetrics),
    Configuration(ConfigMetrics),
    Documentation(DocMetrics),
    Other,
}

/// A validated, classified project file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// `{session}_{name}_{sha256(content)[..8]}`.
    pub id: String,
    pub session_id: Uuid,
    pub task_id: TaskId,
    pub role: AgentRole,
    pub name: String,
    pub kind: ArtifactKind,
    pub language: Option<String>,
    pub content: String,
    pub file_path: String,
    /// Directory in the generated project, e.g. `/src/`.
    pub project_path: String,
    pub size: usize,
    pub metadata: ArtifactMetadata,
    pub quality_score: f64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn is_code(&self) -> bool {
        self.kind == ArtifactKind::Code
    }
}

/// Why an artifact was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub name: String,
    pub task_id: TaskId,
    pub reason: String,
}

/// Result of processing one batch of raw artifacts.
#[derive(Debug, Clone, Default)]
pub struct ProcessedArtifacts {
    pub accepted: Vec<Artifact>,
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactStatistics {
    pub total: usize,
    pub by_kind: BTreeMap<String, usize>,
    pub by_language: BTreeMap<String, usize>,
    pub total_bytes: usize,
    pub average_bytes: f64,
}

impl ArtifactStatistics {
    /// Fold `other` in, recomputing the average over the combined total.
    pub fn merge(&mut self, other: &Self) {
        self.total += other.total;
        self.total_bytes += other.total_bytes;
        for (kind, count) in &other.by_kind {
            *self.by_kind.entry(kind.clone()).or_default() += count;
        }
        for (lang, count) in &other.by_language {
            *self.by_language.entry(lang.clone()).or_default() += count;
        }
        self.average_bytes = if self.total == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.total as f64
        };
    }
}

/// Validates and classifies raw artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactProcessor {
    max_bytes: usize,
    deny: Vec<(String, Regex)>,
}

impl ArtifactProcessor {
    pub fn new(config: &ArtifactConfig) -> GenforgeResult<Self> {
        let deny = config
            .deny_patterns
            .iter()
            .map(|pattern| {
                RegexBuilder::new(&regex::escape(pattern))
                    .case_insensitive(true)
                    .build()
                    .map(|re| (pattern.clone(), re))
                    .map_err(|e| GenforgeError::Config(format!("deny pattern {pattern:?}: {e}")))
            })
            .collect::<GenforgeResult<Vec<_>>>()?;
        Ok(Self {
            max_bytes: config.max_bytes,
            deny,
        })
    }

    /// Process every raw artifact produced by `task_id`.
    pub fn process(
        &self,
        session_id: Uuid,
        task_id: &str,
        role: AgentRole,
        raw: &[RawArtifact],
    ) -> ProcessedArtifacts {
        let mut out = ProcessedArtifacts::default();
        for artifact in raw {
            match self.process_one(session_id, task_id, role, artifact) {
                Ok(processed) => out.accepted.push(processed),
                Err(reason) => {
                    warn!(
                        session_id = %session_id,
                        task_id = %task_id,
                        artifact = %artifact.name,
                        reason = %reason,
                        "Artifact rejected"
                    );
                    out.rejected.push(Rejection {
                        name: artifact.name.clone(),
                        task_id: task_id.to_string(),
                        reason,
                    });
                }
            }
        }
        info!(
            session_id = %session_id,
            task_id = %task_id,
            accepted = out.accepted.len(),
            rejected = out.rejected.len(),
            "Processed artifacts"
        );
        out
    }

    fn process_one(
        &self,
        session_id: Uuid,
        task_id: &str,
        role: AgentRole,
        raw: &RawArtifact,
    ) -> Result<Artifact, String> {
        if raw.name.trim().is_empty() {
            return Err("artifact has no name".into());
        }
        let size = raw.content.len();
        if size > self.max_bytes {
            return Err(format!("size {size} exceeds limit of {} bytes", self.max_bytes));
        }
        if let Some((pattern, _)) = self.deny.iter().find(|(_, re)| re.is_match(&raw.content)) {
            return Err(format!("content matches denied pattern {pattern:?}"));
        }

        let detected = detect(&raw.name);
        let kind = raw
            .artifact_type
            .as_deref()
            .and_then(ArtifactKind::from_declared)
            .or(detected.map(|(kind, _)| kind))
            .unwrap_or(ArtifactKind::Other);
        let language = raw
            .language
            .as_ref()
            .map(|l| l.trim().to_ascii_lowercase())
            .or_else(|| detected.and_then(|(_, lang)| lang).map(String::from));

        let mut name = raw.name.clone();
        if !name.contains('.') {
            if let Some(ext) = default_extension(kind, language.as_deref()) {
                name.push_str(ext);
            }
        }

        let metadata = analyze(kind, language.as_deref(), &name, &raw.content);
        let project_path = project_path(kind, language.as_deref(), &name).to_string();
        let quality_score = quality_score(kind, size, &raw.content, &metadata);

        let digest = hex::encode(Sha256::digest(raw.content.as_bytes()));
        let id = format!("{session_id}_{name}_{}", &digest[..8]);

        Ok(Artifact {
            id,
            session_id,
            task_id: task_id.to_string(),
            role,
            file_path: raw.file_path.clone().unwrap_or_else(|| name.clone()),
            name,
            kind,
            language,
            content: raw.content.clone(),
            project_path,
            size,
            metadata,
            quality_score,
            created_at: Utc::now(),
        })
    }
}

/// Kind and language implied by a file name.
fn detect(name: &str) -> Option<(ArtifactKind, Option<&'static str>)> {
    let lower = name.to_ascii_lowercase();
    let base = lower.rsplit('/').next().unwrap_or(&lower);
    match base {
        "dockerfile" | "requirements.txt" | "makefile" => {
            return Some((ArtifactKind::Configuration, None));
        }
        _ => {}
    }
    if base == ".env" || base.starts_with(".env.") {
        return Some((ArtifactKind::Configuration, None));
    }
    let ext = base.rsplit_once('.').map(|(_, ext)| ext)?;
    let found = match ext {
        "py" => (ArtifactKind::Code, Some("python")),
        "js" | "jsx" | "mjs" => (ArtifactKind::Code, Some("javascript")),
        "ts" | "tsx" => (ArtifactKind::Code, Some("typescript")),
        "html" | "htm" => (ArtifactKind::Code, Some("html")),
        "css" | "scss" => (ArtifactKind::Code, Some("css")),
        "rs" => (ArtifactKind::Code, Some("rust")),
        "go" => (ArtifactKind::Code, Some("go")),
        "java" => (ArtifactKind::Code, Some("java")),
        "sh" => (ArtifactKind::Code, Some("shell")),
        "json" | "yaml" | "yml" | "toml" | "ini" | "env" => (ArtifactKind::Configuration, None),
        "md" | "rst" | "txt" => (ArtifactKind::Documentation, None),
        _ => return None,
    };
    Some(found)
}

fn default_extension(kind: ArtifactKind, language: Option<&str>) -> Option<&'static str> {
    match kind {
        ArtifactKind::Code => match language? {
            "python" => Some(".py"),
            "javascript" => Some(".js"),
            "typescript" => Some(".ts"),
            "html" => Some(".html"),
            "css" => Some(".css"),
            "rust" => Some(".rs"),
            "go" => Some(".go"),
            _ => None,
        },
        ArtifactKind::Configuration => Some(".json"),
        ArtifactKind::Documentation => Some(".md"),
        ArtifactKind::Other => None,
    }
}

fn project_path(kind: ArtifactKind, language: Option<&str>, name: &str) -> &'static str {
    let name = name.to_ascii_lowercase();
    match kind {
        ArtifactKind::Documentation if name.contains("readme") => "/",
        ArtifactKind::Documentation => "/docs/",
        ArtifactKind::Configuration
            if matches!(
                name.as_str(),
                "package.json" | "requirements.txt" | "dockerfile" | "cargo.toml" | "pyproject.toml"
            ) =>
        {
            "/"
        }
        ArtifactKind::Configuration => "/config/",
        ArtifactKind::Code => match language {
            Some("javascript" | "typescript") if name.contains("test") || name.contains("spec") => {
                "/tests/"
            }
            Some("javascript" | "typescript") if name.ends_with(".jsx") || name.ends_with(".tsx") => {
                "/src/components/"
            }
            _ if name.contains("test") => "/tests/",
            _ => "/src/",
        },
        ArtifactKind::Other => "/src/",
    }
}

fn analyze(kind: ArtifactKind, language: Option<&str>, name: &str, content: &str) -> ArtifactMetadata {
    match kind {
        ArtifactKind::Code => ArtifactMetadata::Code(analyze_code(language, content)),
        ArtifactKind::Configuration => ArtifactMetadata::Configuration(analyze_config(name, content)),
        ArtifactKind::Documentation => ArtifactMetadata::Documentation(analyze_docs(content)),
        ArtifactKind::Other => ArtifactMetadata::Other,
    }
}

fn analyze_code(language: Option<&str>, content: &str) -> CodeMetrics {
    let mut metrics = CodeMetrics {
        lines: content.lines().count(),
        characters: content.chars().count(),
        ..CodeMetrics::default()
    };
    match language {
        Some("python") => {
            metrics.import_count = count_lines(content, |l| l.starts_with("import ") || l.starts_with("from "));
            metrics.function_count = content.matches("def ").count();
            metrics.class_count = content.matches("class ").count();
            metrics.has_async = content.contains("async def");
            metrics.has_tests = content.contains("pytest") || content.contains("unittest");
        }
        Some("javascript" | "typescript") => {
            metrics.import_count = count_lines(content, |l| l.contains("import ") || l.contains("require("));
            metrics.function_count = content.matches("function ").count() + content.matches("=>").count();
            metrics.class_count = content.matches("class ").count();
            metrics.has_async = content.contains("async ");
            metrics.has_tests = content.contains("describe(") || content.contains("it(");
            let lower = content.to_ascii_lowercase();
            metrics.framework = ["react", "vue", "angular"]
                .into_iter()
                .find(|fw| lower.contains(fw))
                .map(String::from);
        }
        Some("rust") => {
            metrics.import_count = count_lines(content, |l| l.starts_with("use "));
            metrics.function_count = content.matches("fn ").count();
            metrics.class_count = content.matches("struct ").count() + content.matches("enum ").count();
            metrics.has_async = content.contains("async fn");
            metrics.has_tests = content.contains("#[test]") || content.contains("#[tokio::test]");
        }
        _ => {}
    }
    metrics
}

fn count_lines(content: &str, pred: impl Fn(&str) -> bool) -> usize {
    content.lines().filter(|l| pred(l.trim())).count()
}

fn analyze_config(name: &str, content: &str) -> ConfigMetrics {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".json") {
        let key_count = serde_json::from_str::<serde_json::Value>(content)
            .ok()
            .map(|v| v.as_object().map_or(0, serde_json::Map::len));
        return ConfigMetrics {
            format: if key_count.is_some() { "json" } else { "unknown" }.into(),
            key_count,
        };
    }
    if lower.ends_with(".toml") {
        let key_count = content.parse::<toml::Table>().ok().map(|t| t.len());
        return ConfigMetrics {
            format: "toml".into(),
            key_count,
        };
    }
    if lower.ends_with(".yaml") || lower.ends_with(".yml") {
        return ConfigMetrics {
            format: "yaml".into(),
            key_count: None,
        };
    }
    if lower.ends_with(".env") || lower.rsplit('/').next().is_some_and(|b| b.starts_with(".env")) {
        let vars = content
            .lines()
            .map(str::trim)
            .filter(|l| l.contains('=') && !l.starts_with('#'))
            .count();
        return ConfigMetrics {
            format: "environment".into(),
            key_count: Some(vars),
        };
    }
    ConfigMetrics {
        format: "unknown".into(),
        key_count: None,
    }
}

fn analyze_docs(content: &str) -> DocMetrics {
    DocMetrics {
        lines: content.lines().count(),
        words: content.split_whitespace().count(),
        headers: content.lines().filter(|l| l.trim_start().starts_with('#')).count(),
        code_blocks: content.matches("```").count() / 2,
    }
}

fn quality_score(kind: ArtifactKind, size: usize, content: &str, metadata: &ArtifactMetadata) -> f64 {
    let mut score: f64 = 0.5;
    if (100..=10_000).contains(&size) {
        score += 0.1;
    } else if size > 50_000 {
        score -= 0.1;
    }
    match (kind, metadata) {
        (ArtifactKind::Code, ArtifactMetadata::Code(m)) => {
            if content.contains('#') || content.contains("//") {
                score += 0.1;
            }
            if m.function_count > 0 {
                score += 0.1;
            }
            if m.import_count > 0 {
                score += 0.1;
            }
        }
        (ArtifactKind::Documentation, ArtifactMetadata::Documentation(m)) => {
            if m.headers > 0 {
                score += 0.1;
            }
            if (50..=5000).contains(&m.words) {
                score += 0.1;
            }
        }
        _ => {}
    }
    score.clamp(0.0, 1.0)
}

/// Whether any artifact is source code, which gates the sandbox handoff.
pub fn has_code(artifacts: &[Artifact]) -> bool {
    artifacts.iter().any(Artifact::is_code)
}

/// Distribution by kind and language plus size totals.
pub fn statistics(artifacts: &[Artifact]) -> ArtifactStatistics {
    let mut stats = ArtifactStatistics {
        total: artifacts.len(),
        ..ArtifactStatistics::default()
    };
    for artifact in artifacts {
        *stats.by_kind.entry(artifact.kind.as_str().to_string()).or_default() += 1;
        if let Some(lang) = &artifact.language {
            *stats.by_language.entry(lang.clone()).or_default() += 1;
        }
        stats.total_bytes += artifact.size;
    }
    if stats.total > 0 {
        stats.average_bytes = stats.total_bytes as f64 / stats.total as f64;
    }
    stats
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn processor() -> ArtifactProcessor {
        ArtifactProcessor::new(&ArtifactConfig::default()).unwrap()
    }

    fn one(raw: RawArtifact) -> ProcessedArtifacts {
        processor().process(Uuid::nil(), "s_implementation", AgentRole::Implementation, &[raw])
    }

    #[test]
    fn test_python_code_classified_and_scored() {
        let src = "import os\nfrom typing import List\n\n# entry point\nasync def main():\n    pass\n\ndef helper():\n    return 1\n";
        let out = one(RawArtifact::new("app/main.py", src));
        assert!(out.rejected.is_empty());
        let a = &out.accepted[0];
        assert_eq!(a.kind, ArtifactKind::Code);
        assert_eq!(a.language.as_deref(), Some("python"));
        assert_eq!(a.project_path, "/src/");
        let ArtifactMetadata::Code(m) = &a.metadata else {
            panic!("expected code metadata");
        };
        assert_eq!(m.import_count, 2);
        assert_eq!(m.function_count, 2);
        assert!(m.has_async);
        // base + comment + functions + imports
        assert!((a.quality_score - 0.8).abs() < 1e-9);
        assert!(a.id.starts_with(&format!("{}_app/main.py_", Uuid::nil())));
        assert_eq!(a.id.len(), format!("{}_app/main.py_", Uuid::nil()).len() + 8);
    }

    #[test]
    fn test_id_is_content_addressed() {
        let a = one(RawArtifact::new("a.rs", "fn a() {}")).accepted.remove(0);
        let b = one(RawArtifact::new("a.rs", "fn a() {}")).accepted.remove(0);
        let c = one(RawArtifact::new("a.rs", "fn b() {}")).accepted.remove(0);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_denied_pattern_rejected_case_insensitive() {
        let out = one(RawArtifact::new("index.html", "<SCRIPT>alert(1)</script>"));
        assert!(out.accepted.is_empty());
        assert_eq!(out.rejected.len(), 1);
        assert!(out.rejected[0].reason.contains("<script>"));
    }

    #[test]
    fn test_size_ceiling() {
        let config = ArtifactConfig {
            max_bytes: 8,
            deny_patterns: Vec::new(),
        };
        let p = ArtifactProcessor::new(&config).unwrap();
        let out = p.process(
            Uuid::nil(),
            "t",
            AgentRole::Implementation,
            &[RawArtifact::new("small.txt", "tiny"), RawArtifact::new("big.txt", "far too large")],
        );
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(out.rejected[0].name, "big.txt");
    }

    #[test]
    fn test_default_extension_and_declared_type() {
        let out = one(RawArtifact::new("settings", "{\"a\": 1, \"b\": 2}").with_type("config"));
        let a = &out.accepted[0];
        assert_eq!(a.name, "settings.json");
        assert_eq!(a.project_path, "/config/");
        assert_eq!(
            a.metadata,
            ArtifactMetadata::Configuration(ConfigMetrics {
                format: "json".into(),
                key_count: Some(2),
            })
        );

        let out = one(RawArtifact::new("server", "const x = () => 1;").with_type("code").with_language("TypeScript"));
        assert_eq!(out.accepted[0].name, "server.ts");
        assert_eq!(out.accepted[0].language.as_deref(), Some("typescript"));
    }

    #[test]
    fn test_project_paths() {
        let path = |name: &str| one(RawArtifact::new(name, "x")).accepted[0].project_path.clone();
        assert_eq!(path("README.md"), "/");
        assert_eq!(path("guide.md"), "/docs/");
        assert_eq!(path("package.json"), "/");
        assert_eq!(path("App.tsx"), "/src/components/");
        assert_eq!(path("app.spec.ts"), "/tests/");
        assert_eq!(path("test_api.py"), "/tests/");
    }

    #[test]
    fn test_documentation_metrics() {
        let doc = "# Title\n\nSome words here.\n\n## Usage\n\n```sh\nrun\n```\n";
        let a = one(RawArtifact::new("README.md", doc)).accepted.remove(0);
        assert_eq!(
            a.metadata,
            ArtifactMetadata::Documentation(DocMetrics {
                lines: 9,
                words: 10,
                headers: 2,
                code_blocks: 1,
            })
        );
        // base + headers; under 100 bytes and under 50 words
        assert!((a.quality_score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_env_and_toml_config() {
        let a = one(RawArtifact::new(".env", "# c\nA=1\nB=2\n")).accepted.remove(0);
        assert_eq!(a.kind, ArtifactKind::Configuration);
        assert_eq!(
            a.metadata,
            ArtifactMetadata::Configuration(ConfigMetrics {
                format: "environment".into(),
                key_count: Some(2),
            })
        );
        let t = one(RawArtifact::new("app.toml", "name = \"x\"\n[server]\nport = 1\n")).accepted.remove(0);
        assert_eq!(
            t.metadata,
            ArtifactMetadata::Configuration(ConfigMetrics {
                format: "toml".into(),
                key_count: Some(2),
            })
        );
    }

    #[test]
    fn test_statistics_and_has_code() {
        let p = processor();
        let out = p.process(
            Uuid::nil(),
            "t",
            AgentRole::Implementation,
            &[RawArtifact::new("a.py", "print(1)"), RawArtifact::new("b.md", "# B")],
        );
        assert!(has_code(&out.accepted));
        let stats = statistics(&out.accepted);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_kind["code"], 1);
        assert_eq!(stats.by_kind["documentation"], 1);
        assert_eq!(stats.by_language["python"], 1);
        assert_eq!(stats.total_bytes, 11);
        assert!((stats.average_bytes - 5.5).abs() < 1e-9);

        assert!(!has_code(&out.accepted[1..]));
        assert_eq!(statistics(&[]).average_bytes, 0.0);
    }

    #[test]
    fn test_statistics_merge_recomputes_average() {
        let p = processor();
        let first = p.process(Uuid::nil(), "t", AgentRole::Implementation, &[RawArtifact::new("a.py", "print(1)")]);
        let second = p.process(Uuid::nil(), "u", AgentRole::Analysis, &[RawArtifact::new("b.md", "# B")]);

        let mut total = ArtifactStatistics::default();
        total.merge(&statistics(&first.accepted));
        total.merge(&statistics(&second.accepted));
        assert_eq!(total, statistics(&[first.accepted, second.accepted].concat()));
    }
}
