//! Running plans: materialization, run history, result reads and export.

use crate::deps::{source_names, upstream_analysis_ids};
use crate::error::{AssetError, Result};
use crate::params::bind_parameters;
use crate::planner::Planner;
use crate::types::{
    Analysis, ExecutionResult, ExportResult, Materialization, ParamValues, StepAction,
    StepResult, StepStatus, ANALYSIS_SCHEMA,
};
use chrono::Utc;
use duckyard_db::{quote_ident, quote_literal, DbConnection};
use duckyard_sources::registry::Registry;
use duckyard_sources::{preview_table, SourceService, TablePreview};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Attaches external sources on a connection before analysis SQL reads them.
pub trait SourceAttacher {
    fn attach_sources(&self, conn: &DbConnection, names: &[&str]) -> duckyard_sources::Result<()>;
}

impl SourceAttacher for SourceService {
    fn attach_sources(&self, conn: &DbConnection, names: &[&str]) -> duckyard_sources::Result<()> {
        self.attach_sources_on(conn, names)
    }
}

/// For analyses that read no attached sources.
pub struct NoSources;

impl SourceAttacher for NoSources {
    fn attach_sources(&self, _conn: &DbConnection, names: &[&str]) -> duckyard_sources::Result<()> {
        match names.first() {
            Some(name) => Err(duckyard_sources::SourceError::SourceNotFound(name.to_string())),
            None => Ok(()),
        }
    }
}

/// Run state tied to one connection: which sources are attached on it.
pub struct RunContext<'p, 'a> {
    planner: &'p Planner<'a>,
    attacher: &'p dyn SourceAttacher,
    attached: HashSet<String>,
}

impl<'p, 'a> RunContext<'p, 'a> {
    pub fn new(planner: &'p Planner<'a>, attacher: &'p dyn SourceAttacher) -> Self {
        Self {
            planner,
            attacher,
            attached: HashSet::new(),
        }
    }

    /// Execute the recompute steps of `id`'s plan in order.
    ///
    /// Every executed step, and every step skipped because an upstream
    /// failed, gets a run-history row under one run id. Without
    /// `continue_on_failure` the first failure ends the run.
    pub fn run_analysis(
        &mut self,
        id: &str,
        params: &ParamValues,
        force: bool,
        continue_on_failure: bool,
    ) -> Result<ExecutionResult> {
        let (plan, closure) = self.planner.compile_with_closure(id, params, force)?;
        let run_id = uuid::Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            target = %id,
            recompute = plan.recompute_count(),
            "running analysis plan"
        );

        let planner = self.planner;
        let store = planner.store();
        let mut broken: HashSet<String> = HashSet::new();
        let mut step_results = Vec::new();
        for step in plan.steps.iter().filter(|s| s.action == StepAction::Recompute) {
            let analysis = closure
                .get(&step.analysis_id)
                .ok_or_else(|| AssetError::not_found(format!("analysis '{}'", step.analysis_id)))?;

            let started_at = Utc::now();
            let failed_upstream = upstream_analysis_ids(analysis)
                .into_iter()
                .find(|u| broken.contains(u));
            if let Some(upstream) = failed_upstream {
                let result = StepResult {
                    run_id: run_id.clone(),
                    analysis_id: analysis.id.clone(),
                    status: StepStatus::Skipped,
                    started_at,
                    finished_at: started_at,
                    duration_ms: 0,
                    rows_affected: None,
                    error: Some(format!("dependency failed: {}", upstream)),
                };
                store.record_run(&result)?;
                broken.insert(analysis.id.clone());
                step_results.push(result);
                continue;
            }

            let clock = Instant::now();
            let sources = transitive_sources(&closure, &analysis.id);
            let outcome = self
                .ensure_sources(&sources)
                .and_then(|()| self.materialize(analysis, params));
            let duration_ms = clock.elapsed().as_millis() as i64;
            let finished_at = Utc::now();
            let result = match outcome {
                Ok(rows) => StepResult {
                    run_id: run_id.clone(),
                    analysis_id: analysis.id.clone(),
                    status: StepStatus::Success,
                    started_at,
                    finished_at,
                    duration_ms,
                    rows_affected: Some(rows),
                    error: None,
                },
                Err(e) => {
                    warn!(run_id = %run_id, analysis = %analysis.id, error = %e, "analysis step failed");
                    StepResult {
                        run_id: run_id.clone(),
                        analysis_id: analysis.id.clone(),
                        status: StepStatus::Failed,
                        started_at,
                        finished_at,
                        duration_ms,
                        rows_affected: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            store.record_run(&result)?;
            let failed = result.status == StepStatus::Failed;
            step_results.push(result);
            if failed {
                broken.insert(analysis.id.clone());
                if !continue_on_failure {
                    break;
                }
            }
        }

        let success = step_results.iter().all(|r| r.status == StepStatus::Success);
        info!(run_id = %run_id, target = %id, success, "analysis plan finished");
        Ok(ExecutionResult {
            success,
            plan,
            step_results,
        })
    }

    /// Page through the current result of `id`.
    pub fn analysis_data(&mut self, id: &str, limit: usize, offset: usize) -> Result<TablePreview> {
        let analysis = self.planner.store().require(id)?;
        self.attach_for_read(&analysis)?;
        let relation = self.planner.store().result_relation(&analysis);
        preview_table(self.conn(), &relation, limit, offset)
            .map_err(|e| AssetError::Execution(format!("Cannot read result of '{}': {}", id, e)))
    }

    /// Run `id`, then write its result to `path` as CSV with a header.
    pub fn export_csv(&mut self, id: &str, path: &Path, force: bool) -> Result<ExportResult> {
        let result = self.run_analysis(id, &ParamValues::new(), force, false)?;
        if !result.success {
            let message = result
                .step_results
                .iter()
                .find(|r| r.status != StepStatus::Success)
                .and_then(|r| r.error.clone())
                .unwrap_or_else(|| "analysis run failed".to_string());
            return Err(AssetError::Execution(message));
        }

        let analysis = self.planner.store().require(id)?;
        self.attach_for_read(&analysis)?;
        let relation = self.planner.store().result_relation(&analysis);
        let path_str = path.display().to_string();
        self.conn()
            .execute_batch(&format!(
                "COPY (SELECT * FROM {}) TO {} (HEADER, DELIMITER ',')",
                relation,
                quote_literal(&path_str)
            ))
            .map_err(|e| AssetError::Execution(format!("Export of '{}' failed: {}", id, e)))?;
        let rows: i64 = self
            .conn()
            .query_scalar(&format!("SELECT COUNT(*) FROM {}", relation), &[])?;
        info!(analysis = %id, path = %path_str, rows, "exported analysis to CSV");
        Ok(ExportResult {
            analysis_id: id.to_string(),
            path: path_str,
            rows,
        })
    }

    fn conn(&self) -> &'a DbConnection {
        self.planner.store().conn()
    }

    /// Attach every source `analysis` reads, directly or through upstream
    /// analyses, and make sure a result exists.
    fn attach_for_read(&mut self, analysis: &Analysis) -> Result<()> {
        let closure = crate::deps::load_closure(self.planner.store(), &analysis.id)?;
        self.ensure_sources(&transitive_sources(&closure, &analysis.id))?;
        if !self.planner.store().result_exists(analysis)? {
            return Err(AssetError::Execution(format!(
                "Analysis '{}' has no result yet; run it first",
                analysis.id
            )));
        }
        Ok(())
    }

    /// Attach the registered sources among `names` not yet attached here.
    /// Names of cached tables need no attachment.
    fn ensure_sources(&mut self, names: &BTreeSet<String>) -> Result<()> {
        let registry = Registry::open(self.conn())?;
        let mut pending = Vec::new();
        for name in names {
            if self.attached.contains(name) || registry.get_source(name)?.is_none() {
                continue;
            }
            pending.push(name.as_str());
        }
        if pending.is_empty() {
            return Ok(());
        }
        self.attacher.attach_sources(self.conn(), &pending)?;
        self.attached.extend(pending.iter().map(|n| n.to_string()));
        Ok(())
    }

    /// Materialize `analysis` and report the rows it produced.
    fn materialize(&self, analysis: &Analysis, params: &ParamValues) -> Result<i64> {
        let conn = self.conn();
        let sql = bind_parameters(&analysis.sql, &analysis.parameters, params)?;
        let target = format!("{}.{}", ANALYSIS_SCHEMA, quote_ident(&analysis.id));
        let rows = match analysis.materialization {
            Materialization::View => {
                conn.execute_batch(&format!("CREATE OR REPLACE VIEW {} AS\n{}\n", target, sql))?;
                conn.query_scalar(&format!("SELECT COUNT(*) FROM {}", target), &[])?
            }
            Materialization::Table => {
                conn.execute_batch(&format!("CREATE OR REPLACE TABLE {} AS\n{}\n", target, sql))?;
                conn.query_scalar(&format!("SELECT COUNT(*) FROM {}", target), &[])?
            }
            Materialization::Append => {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {} AS SELECT * FROM (\n{}\n) LIMIT 0",
                    target, sql
                ))?;
                conn.execute(
                    &format!("INSERT INTO {} SELECT * FROM (\n{}\n)", target, sql),
                    &[],
                )? as i64
            }
            Materialization::Parquet => {
                let path = self.planner.store().parquet_path(&analysis.id);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let literal = quote_literal(&path.display().to_string());
                conn.execute_batch(&format!("COPY (\n{}\n) TO {} (FORMAT PARQUET)", sql, literal))?;
                conn.query_scalar(&format!("SELECT COUNT(*) FROM read_parquet({})", literal), &[])?
            }
        };
        Ok(rows)
    }
}

/// Sources read by `id` and every analysis upstream of it.
fn transitive_sources(closure: &HashMap<String, Analysis>, id: &str) -> BTreeSet<String> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut pending = vec![id.to_string()];
    while let Some(current) = pending.pop() {
        if !seen.insert(current.clone()) {
            continue;
        }
        if let Some(analysis) = closure.get(&current) {
            pending.extend(upstream_analysis_ids(analysis));
        }
    }
    source_names(closure, seen.iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AnalysisStore;
    use crate::types::{DependencyRef, NewAnalysis};

    fn add(store: &AnalysisStore<'_>, id: &str, sql: &str, materialization: Materialization) {
        store
            .insert(&NewAnalysis {
                id: id.to_string(),
                sql: sql.to_string(),
                materialization,
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn append_accumulates_rows_across_runs() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let temp = tempfile::TempDir::new().unwrap();
        let planner = Planner::new(AnalysisStore::open(&conn, temp.path()).unwrap());
        add(planner.store(), "events", "SELECT range AS n FROM range(3)", Materialization::Append);

        let mut ctx = RunContext::new(&planner, &NoSources);
        let first = ctx.run_analysis("events", &ParamValues::new(), false, false).unwrap();
        assert!(first.success);
        assert_eq!(first.step_results[0].rows_affected, Some(3));

        let second = ctx.run_analysis("events", &ParamValues::new(), true, false).unwrap();
        assert_eq!(second.step_results[0].rows_affected, Some(3));
        let total: i64 = conn.query_scalar("SELECT COUNT(*) FROM analysis.events", &[]).unwrap();
        assert_eq!(total, 6);
    }

    #[test]
    fn fresh_plan_executes_nothing() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let temp = tempfile::TempDir::new().unwrap();
        let planner = Planner::new(AnalysisStore::open(&conn, temp.path()).unwrap());
        add(planner.store(), "a", "SELECT 1 AS x", Materialization::Table);

        let mut ctx = RunContext::new(&planner, &NoSources);
        assert!(ctx.run_analysis("a", &ParamValues::new(), false, false).unwrap().success);
        let again = ctx.run_analysis("a", &ParamValues::new(), false, false).unwrap();
        assert!(again.success);
        assert!(again.step_results.is_empty());
        assert_eq!(planner.store().run_history("a", 10).unwrap().len(), 1);
    }

    #[test]
    fn unregistered_source_dependency_fails_at_compile() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let temp = tempfile::TempDir::new().unwrap();
        let planner = Planner::new(AnalysisStore::open(&conn, temp.path()).unwrap());
        planner
            .store()
            .insert(&NewAnalysis {
                id: "s".to_string(),
                sql: "SELECT 1".to_string(),
                depends_on: vec![DependencyRef::source("shop")],
                ..Default::default()
            })
            .unwrap();
        let mut ctx = RunContext::new(&planner, &NoSources);
        let err = ctx.run_analysis("s", &ParamValues::new(), false, false).unwrap_err();
        assert!(matches!(err, AssetError::Validation(_)));
        assert!(planner.store().run_history("s", 10).unwrap().is_empty());
    }
}
