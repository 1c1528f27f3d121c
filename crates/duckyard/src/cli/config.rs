//! Configuration for duckyard
//!
//! Read from `<home>/config.toml`; every field has a default, and a missing
//! file means all defaults. Command-line flags override the file.

use crate::cli::context::CliContext;
use anyhow::{Context, Result};
use duckyard_logging::{duckyard_home, logs_dir};
use duckyard_sources::{DEFAULT_FILE_LIMIT, DEFAULT_SCAN_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_PROJECT: &str = "default";
pub const DEFAULT_PREVIEW_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DuckyardConfig {
    /// Root of per-project directories
    pub data_dir: PathBuf,
    pub default_project: String,
    /// Rows shown by preview commands when `--limit` is absent
    pub cache_preview_limit: usize,
    pub folder_file_limit: usize,
    pub folder_scan_limit: usize,
}

impl Default for DuckyardConfig {
    fn default() -> Self {
        Self {
            data_dir: duckyard_home().join("data"),
            default_project: DEFAULT_PROJECT.to_string(),
            cache_preview_limit: DEFAULT_PREVIEW_LIMIT,
            folder_file_limit: DEFAULT_FILE_LIMIT,
            folder_scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }
}

/// `<home>/config.toml`
pub fn config_path() -> PathBuf {
    duckyard_home().join("config.toml")
}

impl DuckyardConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse config file {}. Fix or delete it to use defaults.",
                path.display()
            )
        })
    }

    /// `<data_dir>/projects/<project>`
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.data_dir.join("projects").join(project)
    }

    pub fn warehouse_path(&self, project: &str) -> PathBuf {
        self.project_dir(project).join("warehouse.duckdb")
    }

    /// Where parquet analyses write `<id>.parquet`.
    pub fn analysis_output_dir(&self, project: &str) -> PathBuf {
        self.project_dir(project).join("analysis")
    }
}

/// Show resolved configuration and paths
pub fn run(ctx: &CliContext) -> Result<()> {
    let config = ctx.config();
    let project = ctx.project();
    let warehouse = config.warehouse_path(project);

    if ctx.json() {
        let value = serde_json::json!({
            "home": duckyard_home().to_string_lossy(),
            "config_file": {
                "path": config_path().to_string_lossy(),
                "exists": config_path().exists(),
            },
            "logs": logs_dir().to_string_lossy(),
            "project": project,
            "warehouse": {
                "path": warehouse.to_string_lossy(),
                "exists": warehouse.exists(),
            },
            "analysis_output": config.analysis_output_dir(project).to_string_lossy(),
            "settings": config,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Home:         {}", duckyard_home().display());
    println!(
        "Config file:  {}{}",
        config_path().display(),
        if config_path().exists() { "" } else { " (not found, using defaults)" }
    );
    println!("Logs:         {}", logs_dir().display());
    println!("Data dir:     {}", config.data_dir.display());
    println!("Project:      {}", project);
    println!(
        "Warehouse:    {}{}",
        warehouse.display(),
        if warehouse.exists() { "" } else { " (not created yet)" }
    );
    println!("Analysis out: {}", config.analysis_output_dir(project).display());
    println!();
    println!("cache_preview_limit = {}", config.cache_preview_limit);
    println!("folder_file_limit   = {}", config.folder_file_limit);
    println!("folder_scan_limit   = {}", config.folder_scan_limit);
    Ok(())
}
