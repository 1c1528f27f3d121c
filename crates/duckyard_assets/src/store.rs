//! Analysis definitions and run history inside the project warehouse.
//!
//! Layout:
//! - `_assets.analyses`: one row per analysis; parameters, tags and
//!   dependencies are JSON text
//! - `_assets.run_history`: append-only, one row per executed or
//!   dependency-skipped step
//! - `analysis`: views and tables produced by runs

use crate::error::{AssetError, Result};
use crate::types::{
    Analysis, AnalysisUpdate, DependencyRef, Materialization, NewAnalysis, ParameterDef,
    RunRecord, StepResult, StepStatus, ANALYSIS_SCHEMA,
};
use duckyard_db::sql_guard::strip_trailing_semicolon;
use duckyard_db::{
    is_valid_identifier, millis_to_datetime, now_millis, quote_ident, quote_literal,
    validate_read_only, DbConnection, DbRow, DbValue,
};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS _assets;
CREATE SCHEMA IF NOT EXISTS analysis;

CREATE TABLE IF NOT EXISTS _assets.analyses (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    sql TEXT NOT NULL,
    description TEXT,
    materialization TEXT NOT NULL DEFAULT 'view',
    parameters TEXT NOT NULL DEFAULT '[]',
    tags TEXT NOT NULL DEFAULT '[]',
    depends_on TEXT NOT NULL DEFAULT '[]',
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS _assets.run_history (
    run_id TEXT NOT NULL,
    analysis_id TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at BIGINT NOT NULL,
    finished_at BIGINT NOT NULL,
    duration_ms BIGINT NOT NULL,
    rows_affected BIGINT,
    error_message TEXT
);
"#;

const ANALYSIS_SELECT: &str = r#"
    SELECT id, name, sql, description, materialization, parameters, tags, depends_on,
           created_at, updated_at
    FROM _assets.analyses
"#;

const RUN_SELECT: &str = r#"
    SELECT run_id, analysis_id, status, started_at, finished_at, duration_ms,
           rows_affected, error_message
    FROM _assets.run_history
"#;

/// Validate an analysis id: it becomes a table name in `analysis`.
pub fn validate_analysis_id(id: &str) -> Result<()> {
    if !is_valid_identifier(id) {
        return Err(AssetError::validation(format!(
            "Invalid analysis id '{}': must match ^[A-Za-z_][A-Za-z0-9_]*$",
            id
        )));
    }
    Ok(())
}

/// Validate analysis SQL and return it without a trailing semicolon.
pub fn normalize_sql(sql: &str) -> Result<String> {
    validate_read_only(sql).map_err(|e| AssetError::validation(format!("Invalid SQL: {}", e)))?;
    Ok(strip_trailing_semicolon(sql).to_string())
}

/// Store operations over one open connection.
pub struct AnalysisStore<'a> {
    conn: &'a DbConnection,
    output_dir: &'a Path,
}

impl<'a> AnalysisStore<'a> {
    /// Wrap `conn`, creating the asset schemas if missing. Parquet results
    /// are written under `output_dir`.
    pub fn open(conn: &'a DbConnection, output_dir: &'a Path) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, output_dir })
    }

    pub fn conn(&self) -> &'a DbConnection {
        self.conn
    }

    pub fn output_dir(&self) -> &'a Path {
        self.output_dir
    }

    /// Output file of a parquet analysis.
    pub fn parquet_path(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.parquet", id))
    }

    /// Where a run of `id` lands: `analysis.<id>` or the parquet file.
    pub fn result_target(&self, id: &str, materialization: Materialization) -> String {
        match materialization {
            Materialization::Parquet => self.parquet_path(id).display().to_string(),
            _ => format!("{}.{}", ANALYSIS_SCHEMA, id),
        }
    }

    /// Relation to select from when reading a result.
    pub fn result_relation(&self, analysis: &Analysis) -> String {
        match analysis.materialization {
            Materialization::Parquet => format!(
                "read_parquet({})",
                quote_literal(&self.parquet_path(&analysis.id).display().to_string())
            ),
            _ => format!("{}.{}", ANALYSIS_SCHEMA, quote_ident(&analysis.id)),
        }
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    pub fn insert(&self, new: &NewAnalysis) -> Result<Analysis> {
        validate_analysis_id(&new.id)?;
        let sql = normalize_sql(&new.sql)?;
        if self.get(&new.id)?.is_some() {
            return Err(AssetError::validation(format!(
                "Analysis '{}' already exists",
                new.id
            )));
        }
        let now = now_millis();
        let name = new
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| new.id.clone());
        self.conn.execute(
            r#"
            INSERT INTO _assets.analyses
                (id, name, sql, description, materialization, parameters, tags, depends_on,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            &[
                DbValue::from(new.id.as_str()),
                DbValue::from(name),
                DbValue::from(sql),
                DbValue::from(new.description.clone()),
                DbValue::from(new.materialization.as_str()),
                DbValue::from(serde_json::to_string(&new.parameters)?),
                DbValue::from(serde_json::to_string(&new.tags)?),
                DbValue::from(serde_json::to_string(&new.depends_on)?),
                DbValue::from(now),
                DbValue::from(now),
            ],
        )?;
        self.get(&new.id)?
            .ok_or_else(|| AssetError::not_found(format!("analysis '{}'", new.id)))
    }

    pub fn get(&self, id: &str) -> Result<Option<Analysis>> {
        let row = self.conn.query_optional(
            &format!("{} WHERE id = ?", ANALYSIS_SELECT),
            &[DbValue::from(id)],
        )?;
        row.map(|r| self.row_to_analysis(&r)).transpose()
    }

    /// Fetch `id` or fail with `NotFound`.
    pub fn require(&self, id: &str) -> Result<Analysis> {
        self.get(id)?
            .ok_or_else(|| AssetError::not_found(format!("analysis '{}'", id)))
    }

    /// All analyses ordered by id, optionally only those carrying `tag`.
    pub fn list(&self, tag: Option<&str>) -> Result<Vec<Analysis>> {
        let rows = self
            .conn
            .query_all(&format!("{} ORDER BY id", ANALYSIS_SELECT), &[])?;
        let mut analyses = Vec::with_capacity(rows.len());
        for row in &rows {
            let analysis = self.row_to_analysis(row)?;
            if tag.map_or(true, |t| analysis.tags.iter().any(|have| have == t)) {
                analyses.push(analysis);
            }
        }
        Ok(analyses)
    }

    /// Apply `update` to `id`, bumping `updated_at`. Switching
    /// materialization drops the previous result object.
    pub fn update(&self, id: &str, update: &AnalysisUpdate) -> Result<Analysis> {
        let current = self.require(id)?;
        let sql = match &update.sql {
            Some(sql) => normalize_sql(sql)?,
            None => current.sql.clone(),
        };
        let materialization = update.materialization.unwrap_or(current.materialization);
        if materialization != current.materialization {
            self.drop_result(&current)?;
        }

        self.conn.execute(
            r#"
            UPDATE _assets.analyses
            SET name = ?, sql = ?, description = ?, materialization = ?, parameters = ?,
                tags = ?, depends_on = ?, updated_at = ?
            WHERE id = ?
            "#,
            &[
                DbValue::from(update.name.clone().unwrap_or(current.name)),
                DbValue::from(sql),
                DbValue::from(update.description.clone().or(current.description)),
                DbValue::from(materialization.as_str()),
                DbValue::from(serde_json::to_string(
                    update.parameters.as_ref().unwrap_or(&current.parameters),
                )?),
                DbValue::from(serde_json::to_string(
                    update.tags.as_ref().unwrap_or(&current.tags),
                )?),
                DbValue::from(serde_json::to_string(
                    update.depends_on.as_ref().unwrap_or(&current.depends_on),
                )?),
                DbValue::from(now_millis()),
                DbValue::from(id),
            ],
        )?;
        self.require(id)
    }

    /// Delete the definition and its result object. Run history is kept.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let Some(current) = self.get(id)? else {
            return Ok(false);
        };
        self.drop_result(&current)?;
        self.conn.execute(
            "DELETE FROM _assets.analyses WHERE id = ?",
            &[DbValue::from(id)],
        )?;
        Ok(true)
    }

    /// Drop whatever a previous run left behind for `analysis`.
    fn drop_result(&self, analysis: &Analysis) -> Result<()> {
        match analysis.materialization {
            Materialization::Parquet => {
                let path = self.parquet_path(&analysis.id);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
            }
            _ => {
                let target = format!("{}.{}", ANALYSIS_SCHEMA, quote_ident(&analysis.id));
                let sql = match self.result_object_kind(&analysis.id)? {
                    Some(ObjectKind::View) => format!("DROP VIEW IF EXISTS {}", target),
                    Some(ObjectKind::Table) => format!("DROP TABLE IF EXISTS {}", target),
                    None => return Ok(()),
                };
                if let Err(e) = self.conn.execute_batch(&sql) {
                    warn!(analysis = %analysis.id, error = %e, "failed to drop analysis result");
                }
            }
        }
        debug!(analysis = %analysis.id, "dropped analysis result");
        Ok(())
    }

    /// Whether a run has left a result object or file behind.
    pub fn result_exists(&self, analysis: &Analysis) -> Result<bool> {
        match analysis.materialization {
            Materialization::Parquet => Ok(self.parquet_path(&analysis.id).exists()),
            _ => Ok(self.result_object_kind(&analysis.id)?.is_some()),
        }
    }

    fn result_object_kind(&self, id: &str) -> Result<Option<ObjectKind>> {
        let views: i64 = self.conn.query_scalar(
            r#"
            SELECT COUNT(*) FROM duckdb_views()
            WHERE database_name = current_database() AND schema_name = ? AND view_name = ?
            "#,
            &[DbValue::from(ANALYSIS_SCHEMA), DbValue::from(id)],
        )?;
        if views > 0 {
            return Ok(Some(ObjectKind::View));
        }
        let tables: i64 = self.conn.query_scalar(
            r#"
            SELECT COUNT(*) FROM duckdb_tables()
            WHERE database_name = current_database() AND schema_name = ? AND table_name = ?
            "#,
            &[DbValue::from(ANALYSIS_SCHEMA), DbValue::from(id)],
        )?;
        Ok((tables > 0).then_some(ObjectKind::Table))
    }

    // ========================================================================
    // Run history
    // ========================================================================

    pub fn record_run(&self, result: &StepResult) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO _assets.run_history
                (run_id, analysis_id, status, started_at, finished_at, duration_ms,
                 rows_affected, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            &[
                DbValue::from(result.run_id.as_str()),
                DbValue::from(result.analysis_id.as_str()),
                DbValue::from(result.status.as_str()),
                DbValue::from(result.started_at.timestamp_millis()),
                DbValue::from(result.finished_at.timestamp_millis()),
                DbValue::from(result.duration_ms),
                DbValue::from(result.rows_affected),
                DbValue::from(result.error.clone()),
            ],
        )?;
        Ok(())
    }

    /// Most recent runs of `id`, newest first.
    pub fn run_history(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        let rows = self.conn.query_all(
            &format!(
                "{} WHERE analysis_id = ? ORDER BY started_at DESC, finished_at DESC LIMIT {}",
                RUN_SELECT, limit
            ),
            &[DbValue::from(id)],
        )?;
        rows.iter().map(row_to_run).collect()
    }

    /// Finish time (ms) of the latest successful run of `id`.
    pub fn last_success_millis(&self, id: &str) -> Result<Option<i64>> {
        let value: Option<i64> = self.conn.query_scalar(
            "SELECT MAX(finished_at) FROM _assets.run_history WHERE analysis_id = ? AND status = 'success'",
            &[DbValue::from(id)],
        )?;
        Ok(value)
    }

    fn row_to_analysis(&self, row: &DbRow) -> Result<Analysis> {
        let id: String = row.get(0)?;
        let materialization_raw: String = row.get(4)?;
        let materialization = Materialization::parse(&materialization_raw).ok_or_else(|| {
            AssetError::validation(format!(
                "Unknown materialization '{}' for analysis '{}'",
                materialization_raw, id
            ))
        })?;
        let parameters: Vec<ParameterDef> = serde_json::from_str(&row.get::<String>(5)?)?;
        let tags: Vec<String> = serde_json::from_str(&row.get::<String>(6)?)?;
        let depends_on: Vec<DependencyRef> = serde_json::from_str(&row.get::<String>(7)?)?;
        Ok(Analysis {
            result_table: self.result_target(&id, materialization),
            name: row.get(1)?,
            sql: row.get(2)?,
            description: row.get(3)?,
            materialization,
            parameters,
            tags,
            depends_on,
            created_at: millis_to_datetime(row.get(8)?),
            updated_at: millis_to_datetime(row.get(9)?),
            id,
        })
    }
}

enum ObjectKind {
    View,
    Table,
}

fn row_to_run(row: &DbRow) -> Result<RunRecord> {
    let status_raw: String = row.get(2)?;
    let status = StepStatus::parse(&status_raw)
        .ok_or_else(|| AssetError::validation(format!("Unknown run status '{}'", status_raw)))?;
    Ok(RunRecord {
        run_id: row.get(0)?,
        analysis_id: row.get(1)?,
        status,
        started_at: millis_to_datetime(row.get(3)?),
        finished_at: millis_to_datetime(row.get(4)?),
        duration_ms: row.get(5)?,
        rows_affected: row.get(6)?,
        error_message: row.get(7)?,
    })
}
