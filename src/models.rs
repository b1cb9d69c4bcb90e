use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The category of analysis worker a tool belongs to.
///
/// This is a closed set: adding a worker service means adding a variant here
/// and extending `tool_service`, never string-matching at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    StaticAnalysis,
    DynamicAnalysis,
    Performance,
    AiReview,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        Self::StaticAnalysis,
        Self::DynamicAnalysis,
        Self::Performance,
        Self::AiReview,
    ];

    /// Stable name, also the path segment workers listen on.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaticAnalysis => "static_analysis",
            Self::DynamicAnalysis => "dynamic_analysis",
            Self::Performance => "performance",
            Self::AiReview => "ai_review",
        }
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static_analysis" => Ok(Self::StaticAnalysis),
            "dynamic_analysis" => Ok(Self::DynamicAnalysis),
            "performance" => Ok(Self::Performance),
            "ai_review" => Ok(Self::AiReview),
            _ => Err(format!("Invalid service type: {}", s)),
        }
    }
}

/// Map a tool name to the worker service that owns it.
///
/// The boundary contract with workers is name-based; numeric tool ids from
/// any registry never cross this line. Unknown tools return `None` and are
/// skipped by the orchestrator with a warning.
pub fn tool_service(tool: &str) -> Option<ServiceType> {
    match tool {
        "bandit" | "safety" | "pylint" | "eslint" | "semgrep" | "vulture" => {
            Some(ServiceType::StaticAnalysis)
        }
        "zap_scan" | "connectivity" | "curl_probe" => Some(ServiceType::DynamicAnalysis),
        "locust" | "load_profile" => Some(ServiceType::Performance),
        "code_review" | "requirements_check" => Some(ServiceType::AiReview),
        _ => None,
    }
}

/// Lifecycle of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// A run never leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial_success" => Ok(Self::PartialSuccess),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid pipeline status: {}", s)),
        }
    }
}

/// Lifecycle of an analysis task (main task or subtask).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Counts toward the "any success at all" side of the rollup.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::PartialSuccess)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "partial_success" => Ok(Self::PartialSuccess),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Recompute a main task's status from its subtasks.
///
/// All completed yields completed; any mix of success and failure yields
/// partial_success; all failed yields failed. Any subtask still pending or
/// running keeps the main task running.
pub fn rollup_status(subtasks: &[TaskStatus]) -> TaskStatus {
    if subtasks.is_empty() {
        return TaskStatus::Completed;
    }
    if subtasks.iter().any(|s| !s.is_terminal()) {
        return TaskStatus::Running;
    }
    let fully_completed = subtasks
        .iter()
        .filter(|s| **s == TaskStatus::Completed)
        .count();
    let successes = subtasks.iter().filter(|s| s.is_success()).count();
    if fully_completed == subtasks.len() {
        TaskStatus::Completed
    } else if successes == 0 {
        TaskStatus::Failed
    } else {
        TaskStatus::PartialSuccess
    }
}

/// Per-stage progress counters on a pipeline run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageProgress {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub in_flight: u32,
}

impl StageProgress {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Every job accounted for and nothing still running.
    pub fn is_drained(&self) -> bool {
        self.in_flight == 0 && self.completed + self.failed >= self.total
    }
}

// ── Pipeline definition (external caller contract) ───────────────────

/// Options shared by both pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOptions {
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
}

fn default_parallel() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    2
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            max_concurrent_tasks: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationStage {
    pub models: Vec<String>,
    pub templates: Vec<String>,
    #[serde(default)]
    pub options: StageOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisStage {
    pub enabled: bool,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub options: StageOptions,
}

impl Default for AnalysisStage {
    fn default() -> Self {
        Self {
            enabled: false,
            tools: Vec::new(),
            options: StageOptions::default(),
        }
    }
}

/// One declarative orchestration request, as submitted by a CLI or form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub generation: GenerationStage,
    #[serde(default)]
    pub analysis: AnalysisStage,
}

impl PipelineConfig {
    /// Generation jobs this pipeline will fan out into.
    pub fn generation_total(&self) -> u32 {
        (self.generation.models.len() * self.generation.templates.len()) as u32
    }

    /// Analysis jobs, gated one-per-generation when the stage is enabled.
    pub fn analysis_total(&self) -> u32 {
        if self.analysis.enabled {
            self.generation_total()
        } else {
            0
        }
    }
}

/// One orchestration request with live progress. Owned by the scheduler;
/// mutated only by its progress-update path.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: u64,
    pub config: PipelineConfig,
    pub status: PipelineStatus,
    pub generation: StageProgress,
    pub analysis: StageProgress,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(id: u64, config: PipelineConfig) -> Self {
        let generation = StageProgress::new(config.generation_total());
        let analysis = StageProgress::new(config.analysis_total());
        Self {
            id,
            config,
            status: PipelineStatus::Pending,
            generation,
            analysis,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

// ── Persisted rows ────────────────────────────────────────────────────

/// A (model, app-number) identity with its version lineage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSlot {
    pub id: i64,
    pub model: String,
    pub app_number: u32,
    pub version: u32,
    pub parent_slot_id: Option<i64>,
    pub created_at: String,
}

/// A unit of analysis work. A main task (`service = None`, unless degraded
/// to a single service) owns zero or more subtasks, one per worker service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub target_model: String,
    pub target_app_number: u32,
    pub service: Option<ServiceType>,
    pub status: TaskStatus,
    pub progress: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub tools: Vec<String>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_roundtrip() {
        for s in &["static_analysis", "dynamic_analysis", "performance", "ai_review"] {
            let parsed: ServiceType = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<ServiceType>().is_err());
    }

    #[test]
    fn test_tool_service_mapping() {
        assert_eq!(tool_service("bandit"), Some(ServiceType::StaticAnalysis));
        assert_eq!(tool_service("zap_scan"), Some(ServiceType::DynamicAnalysis));
        assert_eq!(tool_service("locust"), Some(ServiceType::Performance));
        assert_eq!(tool_service("code_review"), Some(ServiceType::AiReview));
        assert_eq!(tool_service("no_such_tool"), None);
    }

    #[test]
    fn test_pipeline_status_roundtrip() {
        for s in &[
            "pending",
            "running",
            "completed",
            "partial_success",
            "failed",
            "cancelled",
        ] {
            let parsed: PipelineStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<PipelineStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!PipelineStatus::Pending.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
        assert!(PipelineStatus::Completed.is_terminal());
        assert!(PipelineStatus::PartialSuccess.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(PipelineStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_rollup_all_completed() {
        let statuses = [TaskStatus::Completed, TaskStatus::Completed];
        assert_eq!(rollup_status(&statuses), TaskStatus::Completed);
    }

    #[test]
    fn test_rollup_mixed() {
        let statuses = [TaskStatus::Completed, TaskStatus::Failed];
        assert_eq!(rollup_status(&statuses), TaskStatus::PartialSuccess);
    }

    #[test]
    fn test_rollup_partial_subtask_is_not_full_success() {
        let statuses = [TaskStatus::Completed, TaskStatus::PartialSuccess];
        assert_eq!(rollup_status(&statuses), TaskStatus::PartialSuccess);
    }

    #[test]
    fn test_rollup_all_failed() {
        let statuses = [TaskStatus::Failed, TaskStatus::Failed];
        assert_eq!(rollup_status(&statuses), TaskStatus::Failed);
    }

    #[test]
    fn test_rollup_still_running() {
        let statuses = [TaskStatus::Completed, TaskStatus::Running];
        assert_eq!(rollup_status(&statuses), TaskStatus::Running);
    }

    #[test]
    fn test_rollup_no_subtasks() {
        assert_eq!(rollup_status(&[]), TaskStatus::Completed);
    }

    #[test]
    fn test_stage_progress_drained() {
        let mut p = StageProgress::new(4);
        assert!(!p.is_drained());
        p.completed = 3;
        p.failed = 1;
        assert!(p.is_drained());
        p.in_flight = 1;
        assert!(!p.is_drained());
    }

    #[test]
    fn test_pipeline_config_totals() {
        let config = PipelineConfig {
            generation: GenerationStage {
                models: vec!["m1".into(), "m2".into()],
                templates: vec!["t1".into(), "t2".into(), "t3".into()],
                options: StageOptions::default(),
            },
            analysis: AnalysisStage {
                enabled: true,
                tools: vec!["bandit".into()],
                options: StageOptions::default(),
            },
        };
        assert_eq!(config.generation_total(), 6);
        assert_eq!(config.analysis_total(), 6);
    }

    #[test]
    fn test_analysis_total_zero_when_disabled() {
        let config = PipelineConfig {
            generation: GenerationStage {
                models: vec!["m1".into()],
                templates: vec!["t1".into()],
                options: StageOptions::default(),
            },
            analysis: AnalysisStage::default(),
        };
        assert_eq!(config.analysis_total(), 0);
    }

    #[test]
    fn test_pipeline_definition_deserializes_camel_case_options() {
        let raw = r#"{
            "generation": {
                "models": ["gpt_mini"],
                "templates": ["flask_todo"],
                "options": {"parallel": true, "maxConcurrentTasks": 3}
            },
            "analysis": {"enabled": true, "tools": ["bandit", "zap_scan"]}
        }"#;
        let config: PipelineConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.generation.options.max_concurrent_tasks, 3);
        // analysis options fall back to defaults
        assert_eq!(config.analysis.options.max_concurrent_tasks, 2);
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&PipelineStatus::PartialSuccess).unwrap(),
            "\"partial_success\""
        );
        assert_eq!(
            serde_json::to_string(&ServiceType::AiReview).unwrap(),
            "\"ai_review\""
        );
        assert_eq!(
            serde_json::from_str::<TaskStatus>("\"running\"").unwrap(),
            TaskStatus::Running
        );
    }
}
