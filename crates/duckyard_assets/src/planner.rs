//! Freshness and execution plans.
//!
//! An analysis is stale when it never succeeded, when its definition
//! changed after its last success, or when something it reads advanced
//! past that success. Compiling walks the dependency closure in
//! topological order and decides skip or recompute per analysis.

use crate::deps::{effective_dependencies, load_closure, topological_order, upstream_analysis_ids};
use crate::error::{AssetError, Result};
use crate::files::FileCatalog;
use crate::params::bind_parameters;
use crate::store::AnalysisStore;
use crate::types::{
    Analysis, ExecutionPlan, ExecutionStep, FreshnessStatus, ParamValues, RefType, StepAction,
};
use duckyard_db::millis_to_datetime;
use duckyard_sources::registry::Registry;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Planner over one open connection.
pub struct Planner<'a> {
    store: AnalysisStore<'a>,
}

impl<'a> Planner<'a> {
    pub fn new(store: AnalysisStore<'a>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &AnalysisStore<'a> {
        &self.store
    }

    /// Staleness of `id` without executing anything.
    pub fn get_freshness(&self, id: &str) -> Result<FreshnessStatus> {
        let analysis = self.store.require(id)?;
        self.freshness_of(&analysis)
    }

    pub(crate) fn freshness_of(&self, analysis: &Analysis) -> Result<FreshnessStatus> {
        let last_success = self.store.last_success_millis(&analysis.id)?;
        let stale_reason = match last_success {
            None => Some("never run successfully".to_string()),
            Some(last) => self.stale_reason_since(analysis, last)?,
        };
        Ok(FreshnessStatus {
            analysis_id: analysis.id.clone(),
            is_stale: stale_reason.is_some(),
            last_run_at: last_success.map(millis_to_datetime),
            stale_reason,
        })
    }

    fn stale_reason_since(&self, analysis: &Analysis, last: i64) -> Result<Option<String>> {
        if analysis.updated_at.timestamp_millis() > last {
            return Ok(Some("definition updated since last run".to_string()));
        }
        for dep in effective_dependencies(analysis) {
            let (changed, what) = match dep.ref_type {
                RefType::Analysis => (
                    self.store.last_success_millis(&dep.name)?,
                    "upstream analysis",
                ),
                RefType::Source => (self.source_changed_millis(&dep.name)?, "source"),
                RefType::File => (
                    FileCatalog::open(self.store.conn())?
                        .find_by_table_or_id(&dep.name)?
                        .map(|f| f.updated_at.timestamp_millis()),
                    "file",
                ),
            };
            if changed.map_or(false, |at| at > last) {
                return Ok(Some(format!("{} '{}' changed since last run", what, dep.name)));
            }
        }
        Ok(None)
    }

    /// Latest change (ms) to a source: its own row, or any cache of it.
    /// `name` may also be a cached table's local name.
    fn source_changed_millis(&self, name: &str) -> Result<Option<i64>> {
        let registry = Registry::open(self.store.conn())?;
        let mut latest = registry
            .get_source(name)?
            .map(|s| s.changed_at().timestamp_millis());
        let caches = registry
            .list_cached_tables(Some(name))?
            .into_iter()
            .chain(registry.get_cached_table(name)?);
        for cache in caches {
            let at = cache.cached_at.timestamp_millis();
            latest = Some(latest.map_or(at, |l| l.max(at)));
        }
        Ok(latest)
    }

    /// Ordered plan for `id`: dependencies first, `id` last.
    ///
    /// `force` recomputes the target regardless of freshness; upstream
    /// analyses are recomputed only when stale themselves. Any analysis
    /// downstream of a recomputed one in the plan is recomputed too.
    pub fn compile_analysis(
        &self,
        id: &str,
        params: &ParamValues,
        force: bool,
    ) -> Result<ExecutionPlan> {
        self.compile_with_closure(id, params, force).map(|(plan, _)| plan)
    }

    pub(crate) fn compile_with_closure(
        &self,
        id: &str,
        params: &ParamValues,
        force: bool,
    ) -> Result<(ExecutionPlan, HashMap<String, Analysis>)> {
        let closure = load_closure(&self.store, id)?;
        let order = topological_order(&closure, id)?;

        let mut recomputing: HashSet<String> = HashSet::new();
        let mut steps = Vec::with_capacity(order.len());
        for analysis_id in order {
            let analysis = closure
                .get(&analysis_id)
                .ok_or_else(|| AssetError::not_found(format!("analysis '{}'", analysis_id)))?;
            let freshness = self.freshness_of(analysis)?;
            let upstream_recompute = upstream_analysis_ids(analysis)
                .into_iter()
                .find(|u| recomputing.contains(u));

            let (action, reason) = if force && analysis_id == id {
                (StepAction::Recompute, "forced".to_string())
            } else if let Some(reason) = freshness.stale_reason {
                (StepAction::Recompute, reason)
            } else if let Some(upstream) = upstream_recompute {
                (
                    StepAction::Recompute,
                    format!("upstream analysis '{}' will be recomputed", upstream),
                )
            } else {
                (StepAction::Skip, "up to date".to_string())
            };

            if action == StepAction::Recompute {
                bind_parameters(&analysis.sql, &analysis.parameters, params)?;
                recomputing.insert(analysis_id.clone());
            }
            debug!(analysis = %analysis_id, action = action.as_str(), reason = %reason, "plan step");
            steps.push(ExecutionStep {
                operation: analysis.materialization.operation().to_string(),
                target_table: analysis.result_table.clone(),
                analysis_id,
                action,
                reason,
            });
        }

        let plan = ExecutionPlan {
            target_id: id.to_string(),
            steps,
            params: params.clone(),
        };
        Ok((plan, closure))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewAnalysis, ParameterDef, StepResult, StepStatus};
    use chrono::{Duration, Utc};
    use duckyard_db::DbConnection;
    use std::path::Path;

    fn add(store: &AnalysisStore<'_>, id: &str, sql: &str) {
        store
            .insert(&NewAnalysis {
                id: id.to_string(),
                sql: sql.to_string(),
                ..Default::default()
            })
            .unwrap();
    }

    fn succeed(store: &AnalysisStore<'_>, id: &str, offset_ms: i64) {
        let at = Utc::now() + Duration::milliseconds(offset_ms);
        store
            .record_run(&StepResult {
                run_id: "r".to_string(),
                analysis_id: id.to_string(),
                status: StepStatus::Success,
                started_at: at,
                finished_at: at,
                duration_ms: 0,
                rows_affected: Some(1),
                error: None,
            })
            .unwrap();
    }

    #[test]
    fn never_run_then_fresh_then_stale_via_upstream() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let planner = Planner::new(AnalysisStore::open(&conn, Path::new("/tmp")).unwrap());
        add(planner.store(), "a", "SELECT 1 AS x");
        add(planner.store(), "b", "SELECT * FROM analysis.a");

        let status = planner.get_freshness("b").unwrap();
        assert!(status.is_stale);
        assert_eq!(status.stale_reason.as_deref(), Some("never run successfully"));

        succeed(planner.store(), "a", 1_000);
        succeed(planner.store(), "b", 2_000);
        assert!(!planner.get_freshness("b").unwrap().is_stale);

        succeed(planner.store(), "a", 3_000);
        let status = planner.get_freshness("b").unwrap();
        assert!(status.is_stale);
        assert!(status.stale_reason.unwrap().contains("upstream analysis 'a'"));
    }

    #[test]
    fn force_only_recomputes_target_when_upstream_fresh() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let planner = Planner::new(AnalysisStore::open(&conn, Path::new("/tmp")).unwrap());
        add(planner.store(), "a", "SELECT 1 AS x");
        add(planner.store(), "b", "SELECT * FROM analysis.a");
        succeed(planner.store(), "a", 1_000);
        succeed(planner.store(), "b", 2_000);

        let plan = planner.compile_analysis("b", &ParamValues::new(), true).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].analysis_id, "a");
        assert_eq!(plan.steps[0].action, StepAction::Skip);
        assert_eq!(plan.steps[1].action, StepAction::Recompute);
        assert_eq!(plan.steps[1].reason, "forced");
        assert_eq!(plan.steps[1].operation, "create_view");
        assert_eq!(plan.steps[1].target_table, "analysis.b");
    }

    #[test]
    fn compile_rejects_unresolved_and_missing_params() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let planner = Planner::new(AnalysisStore::open(&conn, Path::new("/tmp")).unwrap());
        add(planner.store(), "b", "SELECT * FROM analysis.missing");
        let err = planner.compile_analysis("b", &ParamValues::new(), false).unwrap_err();
        assert!(matches!(err, AssetError::Validation(ref m) if m.contains("analysis:missing")));

        let mut region = ParameterDef::new("region");
        region.required = true;
        planner
            .store()
            .insert(&NewAnalysis {
                id: "p".to_string(),
                sql: "SELECT $region AS r".to_string(),
                parameters: vec![region],
                ..Default::default()
            })
            .unwrap();
        let err = planner.compile_analysis("p", &ParamValues::new(), false).unwrap_err();
        assert!(matches!(err, AssetError::Validation(_)));
        assert!(planner.compile_analysis("x", &ParamValues::new(), false).unwrap_err().is_not_found());
    }
}
