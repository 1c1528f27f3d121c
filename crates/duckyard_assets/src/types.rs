//! Core types for analyses, execution plans and file assets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parameter values supplied to compile/run, keyed by parameter name.
pub type ParamValues = serde_json::Map<String, serde_json::Value>;

/// Schema holding analysis results.
pub const ANALYSIS_SCHEMA: &str = "analysis";

/// How an analysis result becomes a persisted artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Materialization {
    #[default]
    View,
    Table,
    Append,
    Parquet,
}

impl Materialization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Table => "table",
            Self::Append => "append",
            Self::Parquet => "parquet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "view" => Some(Self::View),
            "table" => Some(Self::Table),
            "append" => Some(Self::Append),
            "parquet" => Some(Self::Parquet),
            _ => None,
        }
    }

    /// Short name of the statement a recompute step runs.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::View => "create_view",
            Self::Table => "create_table",
            Self::Append => "insert_into",
            Self::Parquet => "copy_parquet",
        }
    }
}

impl std::fmt::Display for Materialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_param_type() -> String {
    "string".to_string()
}

/// A `$name` placeholder an analysis accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    pub name: String,
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: default_param_type(),
            required: false,
            default: None,
            description: None,
        }
    }
}

/// What a dependency points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefType {
    Analysis,
    Source,
    File,
}

impl RefType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Source => "source",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "analysis" => Some(Self::Analysis),
            "source" => Some(Self::Source),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

/// A typed reference from an analysis to something it reads
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyRef {
    #[serde(rename = "type")]
    pub ref_type: RefType,
    pub name: String,
}

impl DependencyRef {
    pub fn new(ref_type: RefType, name: impl Into<String>) -> Self {
        Self {
            ref_type,
            name: name.into(),
        }
    }

    pub fn analysis(name: impl Into<String>) -> Self {
        Self::new(RefType::Analysis, name)
    }

    pub fn source(name: impl Into<String>) -> Self {
        Self::new(RefType::Source, name)
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::new(RefType::File, name)
    }

    /// Parse `type:name`, e.g. `analysis:daily_sales`.
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, name) = s.split_once(':')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self::new(RefType::parse(kind)?, name))
    }

    /// `type:name`
    pub fn full(&self) -> String {
        format!("{}:{}", self.ref_type.as_str(), self.name)
    }
}

/// A named, parameterized SQL definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub id: String,
    pub name: String,
    pub sql: String,
    pub description: Option<String>,
    pub materialization: Materialization,
    pub parameters: Vec<ParameterDef>,
    pub tags: Vec<String>,
    pub depends_on: Vec<DependencyRef>,
    /// `analysis.<id>`, or the output file for parquet analyses
    pub result_table: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAnalysis {
    pub id: String,
    pub name: Option<String>,
    pub sql: String,
    pub description: Option<String>,
    pub materialization: Materialization,
    pub parameters: Vec<ParameterDef>,
    pub tags: Vec<String>,
    pub depends_on: Vec<DependencyRef>,
}

/// Partial update; `None` keeps the current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisUpdate {
    pub name: Option<String>,
    pub sql: Option<String>,
    pub description: Option<String>,
    pub materialization: Option<Materialization>,
    pub parameters: Option<Vec<ParameterDef>>,
    pub tags: Option<Vec<String>>,
    pub depends_on: Option<Vec<DependencyRef>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Skip,
    Recompute,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Recompute => "recompute",
        }
    }
}

/// One analysis in a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub analysis_id: String,
    pub action: StepAction,
    pub reason: String,
    pub operation: String,
    pub target_table: String,
}

/// Dependencies before dependents, target last
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub target_id: String,
    pub steps: Vec<ExecutionStep>,
    pub params: ParamValues,
}

impl ExecutionPlan {
    pub fn recompute_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.action == StepAction::Recompute)
            .count()
    }

    pub fn step(&self, analysis_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.analysis_id == analysis_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Outcome of one executed (or dependency-skipped) step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub run_id: String,
    pub analysis_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub rows_affected: Option<i64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub plan: ExecutionPlan,
    pub step_results: Vec<StepResult>,
}

impl ExecutionResult {
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|r| r.status == StepStatus::Failed)
    }

    pub fn result_for(&self, analysis_id: &str) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|r| r.analysis_id == analysis_id)
    }
}

/// Where an export landed and how many rows it wrote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub analysis_id: String,
    pub path: String,
    pub rows: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessStatus {
    pub analysis_id: String,
    pub is_stale: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub stale_reason: Option<String>,
}

/// One end of a lineage relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageNode {
    #[serde(rename = "type")]
    pub node_type: RefType,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub full: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lineage {
    pub analysis_id: String,
    pub upstream: Vec<LineageNode>,
    pub downstream: Vec<LineageNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageGraphNode {
    /// `analysis:<id>`, `source:<name>` or `file:<name>`
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: RefType,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub materialization: Option<Materialization>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_stale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Edge from an upstream node to the analysis reading it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageGraphEdge {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineageGraph {
    pub nodes: Vec<LineageGraphNode>,
    pub edges: Vec<LineageGraphEdge>,
}

/// A run-history row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub analysis_id: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub rows_affected: Option<i64>,
    pub error_message: Option<String>,
}

/// Format of an imported file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Parquet,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "parquet" => Some(Self::Parquet),
            _ => None,
        }
    }

    /// Guess from a path's extension.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::parse)
    }
}

/// How an import treats an existing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    #[default]
    Replace,
    Append,
    Merge,
}

impl ImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Append => "append",
            Self::Merge => "merge",
        }
    }
}

/// A CSV or Parquet file imported as a table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAsset {
    pub id: String,
    pub name: String,
    pub file_path: String,
    pub file_type: FileType,
    pub table_name: String,
    pub description: Option<String>,
    pub row_count: Option<i64>,
    pub column_count: Option<i64>,
    pub file_size_bytes: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One column of an imported table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub column_name: String,
    pub column_type: String,
    pub nullable: bool,
}


// ============================================================================
// Query jobs
// ============================================================================

/// Lifecycle of an ad-hoc query job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Input to [`crate::QueryService::submit_query`].
#[derive(Debug, Clone, Default)]
pub struct NewQuery {
    /// Generated when absent; otherwise must be a valid identifier.
    pub job_id: Option<String>,
    pub sql: String,
    /// Attached sources the SQL reads.
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryJob {
    pub job_id: String,
    pub sql: String,
    pub sources: Vec<String>,
    pub status: QueryStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `main.query_result_<job_id>` once a row-returning query succeeded.
    pub result_table: Option<String>,
    pub rows_affected: Option<i64>,
    pub error: Option<String>,
}
