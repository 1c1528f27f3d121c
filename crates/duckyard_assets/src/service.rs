//! AssetService: the public contract over one project's analyses.
//!
//! Each operation opens exactly one warehouse connection through the
//! project's [`SourceService`], so sources read by analyses can be
//! re-attached on that same connection.

use crate::error::{AssetError, Result};
use crate::executor::RunContext;
use crate::planner::Planner;
use crate::store::AnalysisStore;
use crate::types::{
    Analysis, AnalysisUpdate, ExecutionPlan, ExecutionResult, ExportResult, FreshnessStatus,
    Lineage, LineageGraph, NewAnalysis, ParamValues, RunRecord,
};
use duckyard_db::DbConnection;
use duckyard_sources::{SourceService, TablePreview};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Default number of run-history rows returned.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Clone)]
pub struct AssetService {
    sources: Arc<SourceService>,
    output_dir: PathBuf,
}

impl AssetService {
    /// Parquet results go to `output_dir`.
    pub fn new(sources: Arc<SourceService>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            sources,
            output_dir: output_dir.into(),
        }
    }

    /// Parquet results go to `analysis/` next to the warehouse file.
    pub fn for_project(sources: Arc<SourceService>) -> Self {
        let output_dir = sources.warehouse().dir().join("analysis");
        Self::new(sources, output_dir)
    }

    pub fn sources(&self) -> &SourceService {
        &self.sources
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn connect<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Planner<'_>) -> Result<T>,
    {
        self.sources
            .warehouse()
            .with_connection(|conn: &DbConnection| {
                let planner = Planner::new(AnalysisStore::open(conn, &self.output_dir)?);
                op(&planner)
            })
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    pub fn create_analysis(&self, new: NewAnalysis) -> Result<Analysis> {
        let created = self.connect(|planner| planner.store().insert(&new))?;
        info!(analysis = %created.id, materialization = %created.materialization, "created analysis");
        Ok(created)
    }

    pub fn get_analysis(&self, id: &str) -> Result<Option<Analysis>> {
        self.connect(|planner| planner.store().get(id))
    }

    pub fn list_analyses(&self, tag: Option<&str>) -> Result<Vec<Analysis>> {
        self.connect(|planner| planner.store().list(tag))
    }

    pub fn update_analysis(&self, id: &str, update: AnalysisUpdate) -> Result<Analysis> {
        self.connect(|planner| planner.store().update(id, &update))
    }

    /// Remove the definition and its result; run history stays.
    pub fn delete_analysis(&self, id: &str) -> Result<bool> {
        let deleted = self.connect(|planner| planner.store().delete(id))?;
        if deleted {
            info!(analysis = %id, "deleted analysis");
        }
        Ok(deleted)
    }

    // ========================================================================
    // Planning and execution
    // ========================================================================

    pub fn compile_analysis(&self, id: &str, params: &ParamValues, force: bool) -> Result<ExecutionPlan> {
        self.connect(|planner| planner.compile_analysis(id, params, force))
    }

    pub fn run_analysis(
        &self,
        id: &str,
        params: &ParamValues,
        force: bool,
        continue_on_failure: bool,
    ) -> Result<ExecutionResult> {
        self.connect(|planner| {
            RunContext::new(planner, self.sources.as_ref()).run_analysis(
                id,
                params,
                force,
                continue_on_failure,
            )
        })
    }

    pub fn get_freshness(&self, id: &str) -> Result<FreshnessStatus> {
        self.connect(|planner| planner.get_freshness(id))
    }

    pub fn get_lineage(&self, id: &str) -> Result<Lineage> {
        self.connect(|planner| planner.get_lineage(id))
    }

    pub fn get_lineage_graph(&self) -> Result<LineageGraph> {
        self.connect(|planner| planner.get_lineage_graph())
    }

    /// Newest first; `None` means [`DEFAULT_HISTORY_LIMIT`].
    pub fn get_run_history(&self, id: &str, limit: Option<usize>) -> Result<Vec<RunRecord>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        self.connect(|planner| planner.store().run_history(id, limit))
    }

    pub fn get_analysis_data(&self, id: &str, limit: usize, offset: usize) -> Result<TablePreview> {
        self.connect(|planner| {
            RunContext::new(planner, self.sources.as_ref()).analysis_data(id, limit, offset)
        })
    }

    /// Run `id` and write its result as CSV to `path`.
    ///
    /// `path` must be absolute and not a directory; a `.csv` extension is
    /// forced and missing parent directories are created.
    pub fn export_analysis_csv(&self, id: &str, path: &Path, force: bool) -> Result<ExportResult> {
        let path = export_path(path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.connect(|planner| {
            RunContext::new(planner, self.sources.as_ref()).export_csv(id, &path, force)
        })
    }
}

fn export_path(path: &Path) -> Result<PathBuf> {
    if !path.is_absolute() {
        return Err(AssetError::validation(format!(
            "Export path must be absolute: {}",
            path.display()
        )));
    }
    if path.is_dir() {
        return Err(AssetError::validation(format!(
            "Export path is a directory: {}",
            path.display()
        )));
    }
    let is_csv = path
        .extension()
        .map_or(false, |e| e.eq_ignore_ascii_case("csv"));
    Ok(if is_csv {
        path.to_path_buf()
    } else {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".csv");
        path.with_file_name(name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_path_rules() {
        assert!(matches!(
            export_path(Path::new("out.csv")),
            Err(AssetError::Validation(_))
        ));
        assert!(matches!(
            export_path(&std::env::temp_dir()),
            Err(AssetError::Validation(_))
        ));
        assert_eq!(
            export_path(Path::new("/exports/report")).unwrap(),
            PathBuf::from("/exports/report.csv")
        );
        assert_eq!(
            export_path(Path::new("/exports/report.json")).unwrap(),
            PathBuf::from("/exports/report.json.csv")
        );
        assert_eq!(
            export_path(Path::new("/exports/REPORT.CSV")).unwrap(),
            PathBuf::from("/exports/REPORT.CSV")
        );
    }
}
