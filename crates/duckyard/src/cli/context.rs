//! Per-invocation context: resolved config, project and output mode.

use crate::cli::config::DuckyardConfig;
use crate::cli::error::HelpfulError;
use anyhow::{Context, Result};
use duckyard_assets::{AssetService, FileAssetService, QueryService};
use duckyard_sources::SourceService;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct CliContext {
    config: DuckyardConfig,
    project: String,
    json: bool,
}

impl CliContext {
    /// Apply `--data-dir` and `--project` over the loaded config.
    pub fn new(
        mut config: DuckyardConfig,
        data_dir: Option<PathBuf>,
        project: Option<String>,
        json: bool,
    ) -> Result<Self> {
        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }
        let project = project.unwrap_or_else(|| config.default_project.clone());
        validate_project_name(&project)?;
        debug!(project = %project, data_dir = %config.data_dir.display(), "resolved cli context");
        Ok(Self {
            config,
            project,
            json,
        })
    }

    pub fn config(&self) -> &DuckyardConfig {
        &self.config
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn json(&self) -> bool {
        self.json
    }

    /// Open the project's source service. The project directory is created
    /// on first use.
    pub fn sources(&self) -> Result<Arc<SourceService>> {
        let warehouse = self.config.warehouse_path(&self.project);
        let service = SourceService::new(self.project.clone(), &warehouse)
            .with_context(|| format!("Failed to open warehouse {}", warehouse.display()))?;
        Ok(Arc::new(service))
    }

    pub fn assets(&self) -> Result<AssetService> {
        Ok(AssetService::new(
            self.sources()?,
            self.config.analysis_output_dir(&self.project),
        ))
    }

    pub fn queries(&self) -> Result<QueryService> {
        Ok(QueryService::new(self.sources()?))
    }

    pub fn files(&self) -> Result<FileAssetService> {
        let sources = self.sources()?;
        Ok(FileAssetService::new(
            self.project.clone(),
            sources.warehouse().clone(),
        ))
    }
}

/// Project names become directory names.
fn validate_project_name(name: &str) -> Result<(), HelpfulError> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        return Ok(());
    }
    Err(HelpfulError::new(format!("Invalid project name: '{}'", name))
        .with_context("Project names are used as directory names under the data directory")
        .with_suggestion(
            "TRY: Use letters, digits, '_', '-' or '.', not starting with '.'",
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn flags_override_config() {
        let ctx = CliContext::new(
            DuckyardConfig::default(),
            Some(PathBuf::from("/data")),
            Some("sales".to_string()),
            true,
        )
        .unwrap();
        assert_eq!(ctx.project(), "sales");
        assert_eq!(ctx.config().data_dir, PathBuf::from("/data"));
        assert!(ctx.json());

        let ctx = CliContext::new(DuckyardConfig::default(), None, None, false).unwrap();
        assert_eq!(ctx.project(), "default");
    }

    #[test]
    fn project_names_are_path_safe() {
        for bad in ["", "../etc", ".hidden", "a/b", "a b"] {
            assert!(
                CliContext::new(DuckyardConfig::default(), None, Some(bad.to_string()), false)
                    .is_err(),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_project_name("team-a_2024.q1").is_ok());
    }

    #[test]
    fn services_share_the_project_warehouse() {
        let temp = TempDir::new().unwrap();
        let ctx = CliContext::new(
            DuckyardConfig::default(),
            Some(temp.path().to_path_buf()),
            Some("p1".to_string()),
            false,
        )
        .unwrap();
        let assets = ctx.assets().unwrap();
        assert!(assets
            .sources()
            .warehouse()
            .path()
            .ends_with("projects/p1/warehouse.duckdb"));
        assert!(assets.list_analyses(None).unwrap().is_empty());
        assert!(ctx.files().unwrap().list_files().unwrap().is_empty());
        assert!(ctx.queries().unwrap().list_queries(5).unwrap().is_empty());
    }
}
