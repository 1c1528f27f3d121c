//! Ad-hoc query jobs against the project warehouse.
//!
//! A job is submitted first and executed later. Row-returning SQL is
//! materialized as `main.query_result_<job_id>` so its result can be paged
//! after the connection that produced it is gone. DDL and DML run as-is and
//! leave no result table. Every job is a row in `_assets.query_history`.

use crate::error::{AssetError, Result};
use crate::types::{NewQuery, QueryJob, QueryStatus};
use duckyard_db::sql_guard::strip_trailing_semicolon;
use duckyard_db::{
    is_valid_identifier, millis_to_datetime, now_millis, quote_ident, DbConnection, DbRow,
    DbValue,
};
use duckyard_sources::{preview_table, SourceService, TablePreview};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result tables older than this are dropped by a default cleanup.
pub const DEFAULT_QUERY_RETENTION_HOURS: i64 = 168;

const MILLIS_PER_HOUR: i64 = 3_600_000;

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS _assets;

CREATE TABLE IF NOT EXISTS _assets.query_history (
    job_id TEXT PRIMARY KEY,
    sql TEXT NOT NULL,
    sources TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    submitted_at BIGINT NOT NULL,
    completed_at BIGINT,
    result_table TEXT,
    rows_affected BIGINT,
    error_message TEXT
);
"#;

const JOB_SELECT: &str = r#"
    SELECT job_id, sql, sources, status, submitted_at, completed_at, result_table,
           rows_affected, error_message
    FROM _assets.query_history
"#;

const DDL_KEYWORDS: &[&str] = &["CREATE", "ALTER", "DROP", "TRUNCATE", "ATTACH", "DETACH"];
const DML_KEYWORDS: &[&str] = &["INSERT", "UPDATE", "DELETE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatementKind {
    Ddl,
    Dml,
    Rows,
}

fn statement_kind(sql: &str) -> StatementKind {
    let keyword: String = sql
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    if DDL_KEYWORDS.contains(&keyword.as_str()) {
        StatementKind::Ddl
    } else if DML_KEYWORDS.contains(&keyword.as_str()) {
        StatementKind::Dml
    } else {
        StatementKind::Rows
    }
}

/// Table holding the rows of job `job_id`.
pub fn result_table_for(job_id: &str) -> String {
    format!("query_result_{}", job_id)
}

fn new_job_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("q_{}", &hex[..12])
}

/// Query history operations over one open connection.
pub struct QueryHistory<'a> {
    conn: &'a DbConnection,
}

impl<'a> QueryHistory<'a> {
    pub fn open(conn: &'a DbConnection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn get(&self, job_id: &str) -> Result<Option<QueryJob>> {
        let row = self.conn.query_optional(
            &format!("{} WHERE job_id = ?", JOB_SELECT),
            &[DbValue::from(job_id)],
        )?;
        row.as_ref().map(row_to_job).transpose()
    }

    /// Newest submissions first.
    pub fn list(&self, limit: usize) -> Result<Vec<QueryJob>> {
        let rows = self.conn.query_all(
            &format!(
                "{} ORDER BY submitted_at DESC, job_id LIMIT {}",
                JOB_SELECT, limit
            ),
            &[],
        )?;
        rows.iter().map(row_to_job).collect()
    }

    /// Insert or reset a job to `pending`.
    fn submit(&self, job_id: &str, sql: &str, sources: &[String]) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO _assets.query_history
                (job_id, sql, sources, status, submitted_at, completed_at, result_table,
                 rows_affected, error_message)
            VALUES (?, ?, ?, ?, ?, NULL, NULL, NULL, NULL)
            "#,
            &[
                DbValue::from(job_id),
                DbValue::from(sql),
                DbValue::from(serde_json::to_string(sources)?),
                DbValue::from(QueryStatus::Pending.as_str()),
                DbValue::from(now_millis()),
            ],
        )?;
        Ok(())
    }

    fn set_status(&self, job_id: &str, status: QueryStatus) -> Result<()> {
        self.conn.execute(
            "UPDATE _assets.query_history SET status = ? WHERE job_id = ?",
            &[DbValue::from(status.as_str()), DbValue::from(job_id)],
        )?;
        Ok(())
    }

    fn finish(
        &self,
        job_id: &str,
        result_table: Option<&str>,
        rows_affected: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let status = if error.is_some() {
            QueryStatus::Failed
        } else {
            QueryStatus::Success
        };
        self.conn.execute(
            r#"
            UPDATE _assets.query_history
            SET status = ?, completed_at = ?, result_table = ?, rows_affected = ?,
                error_message = ?
            WHERE job_id = ?
            "#,
            &[
                DbValue::from(status.as_str()),
                DbValue::from(now_millis()),
                DbValue::from(result_table),
                DbValue::from(rows_affected),
                DbValue::from(error),
                DbValue::from(job_id),
            ],
        )?;
        Ok(())
    }

    /// Completed jobs that finished before `cutoff`.
    fn completed_before(&self, cutoff: i64) -> Result<Vec<QueryJob>> {
        let rows = self.conn.query_all(
            &format!(
                "{} WHERE completed_at IS NOT NULL AND completed_at < ?",
                JOB_SELECT
            ),
            &[DbValue::from(cutoff)],
        )?;
        rows.iter().map(row_to_job).collect()
    }

    fn delete(&self, job_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM _assets.query_history WHERE job_id = ?",
            &[DbValue::from(job_id)],
        )?;
        Ok(())
    }
}

fn row_to_job(row: &DbRow) -> Result<QueryJob> {
    let sources_raw: String = row.get(2)?;
    let status_raw: String = row.get(3)?;
    let status = QueryStatus::parse(&status_raw)
        .ok_or_else(|| AssetError::validation(format!("Unknown query status '{}'", status_raw)))?;
    let completed_at: Option<i64> = row.get(5)?;
    Ok(QueryJob {
        job_id: row.get(0)?,
        sql: row.get(1)?,
        sources: serde_json::from_str(&sources_raw)?,
        status,
        submitted_at: millis_to_datetime(row.get(4)?),
        completed_at: completed_at.map(millis_to_datetime),
        result_table: row.get(6)?,
        rows_affected: row.get(7)?,
        error: row.get(8)?,
    })
}

/// Submit, execute and page through ad-hoc queries of one project.
#[derive(Debug, Clone)]
pub struct QueryService {
    sources: Arc<SourceService>,
}

impl QueryService {
    pub fn new(sources: Arc<SourceService>) -> Self {
        Self { sources }
    }

    fn connect<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&QueryHistory<'_>, &DbConnection) -> Result<T>,
    {
        self.sources
            .warehouse()
            .with_connection(|conn: &DbConnection| {
                let history = QueryHistory::open(conn)?;
                op(&history, conn)
            })
    }

    /// Record a `pending` job. Resubmitting an existing id resets it.
    pub fn submit_query(&self, new: NewQuery) -> Result<QueryJob> {
        let job_id = match new.job_id {
            Some(id) if is_valid_identifier(&id) => id.to_ascii_lowercase(),
            Some(id) => {
                return Err(AssetError::validation(format!(
                    "Invalid query id '{}': must match ^[A-Za-z_][A-Za-z0-9_]*$",
                    id
                )))
            }
            None => new_job_id(),
        };
        let sql = strip_trailing_semicolon(&new.sql);
        if sql.is_empty() {
            return Err(AssetError::validation("Query SQL is empty"));
        }

        self.connect(|history, _| {
            history.submit(&job_id, sql, &new.sources)?;
            debug!(job_id = %job_id, "query submitted");
            history
                .get(&job_id)?
                .ok_or_else(|| AssetError::not_found(format!("query '{}'", job_id)))
        })
    }

    /// Run a submitted job on one connection and record the outcome.
    ///
    /// A failure is recorded on the job (status, message, no result table)
    /// before it is returned as `AssetError::Execution`.
    pub fn execute_query(&self, job_id: &str) -> Result<QueryJob> {
        self.connect(|history, conn| {
            let job = history
                .get(job_id)?
                .ok_or_else(|| AssetError::not_found(format!("query '{}'", job_id)))?;
            history.set_status(job_id, QueryStatus::Running)?;
            info!(job_id, "query started");

            match self.run_on(conn, &job) {
                Ok((result_table, rows)) => {
                    history.finish(job_id, result_table.as_deref(), rows, None)?;
                    info!(job_id, rows = ?rows, "query finished");
                }
                Err(e) => {
                    let message = match e {
                        AssetError::Execution(message) => message,
                        other => other.to_string(),
                    };
                    history.finish(job_id, None, None, Some(&message))?;
                    warn!(job_id, error = %message, "query failed");
                    return Err(AssetError::Execution(message));
                }
            }
            history
                .get(job_id)?
                .ok_or_else(|| AssetError::not_found(format!("query '{}'", job_id)))
        })
    }

    /// Submit and execute in one call.
    pub fn run_query(&self, new: NewQuery) -> Result<QueryJob> {
        let job = self.submit_query(new)?;
        self.execute_query(&job.job_id)
    }

    fn run_on(&self, conn: &DbConnection, job: &QueryJob) -> Result<(Option<String>, Option<i64>)> {
        let names: Vec<&str> = job.sources.iter().map(String::as_str).collect();
        self.sources.attach_sources_on(conn, &names)?;

        let table = result_table_for(&job.job_id);
        let target = format!("main.{}", quote_ident(&table));
        // A rerun must not leave the previous result behind.
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", target))?;

        match statement_kind(&job.sql) {
            StatementKind::Ddl => {
                conn.execute_batch(&job.sql)
                    .map_err(|e| AssetError::Execution(e.to_string()))?;
                Ok((None, None))
            }
            StatementKind::Dml => {
                let changed = conn
                    .execute(&job.sql, &[])
                    .map_err(|e| AssetError::Execution(e.to_string()))?;
                Ok((None, i64::try_from(changed).ok()))
            }
            StatementKind::Rows => {
                conn.execute_batch(&format!("CREATE TABLE {} AS {}", target, job.sql))
                    .map_err(|e| AssetError::Execution(e.to_string()))?;
                let rows: i64 = conn.query_scalar(&format!("SELECT COUNT(*) FROM {}", target), &[])?;
                Ok((Some(table), Some(rows)))
            }
        }
    }

    pub fn get_query(&self, job_id: &str) -> Result<Option<QueryJob>> {
        self.connect(|history, _| history.get(job_id))
    }

    pub fn list_queries(&self, limit: usize) -> Result<Vec<QueryJob>> {
        self.connect(|history, _| history.list(limit))
    }

    /// Page through the result table of a successful row-returning job.
    pub fn get_query_data(&self, job_id: &str, limit: usize, offset: usize) -> Result<TablePreview> {
        self.connect(|history, conn| {
            let job = history
                .get(job_id)?
                .ok_or_else(|| AssetError::not_found(format!("query '{}'", job_id)))?;
            let table = job.result_table.ok_or_else(|| {
                AssetError::validation(format!(
                    "Query '{}' has no result table (status {})",
                    job_id,
                    job.status.as_str()
                ))
            })?;
            let relation = format!("main.{}", quote_ident(&table));
            Ok(preview_table(conn, &relation, limit, offset)?)
        })
    }

    /// Drop result tables and history of jobs completed more than
    /// `older_than_hours` ago. Returns how many jobs were removed.
    pub fn cleanup_queries(&self, older_than_hours: i64) -> Result<usize> {
        let cutoff = older_than_hours
            .checked_mul(MILLIS_PER_HOUR)
            .filter(|ms| *ms >= 0)
            .and_then(|ms| now_millis().checked_sub(ms))
            .ok_or_else(|| {
                AssetError::validation(format!(
                    "older_than_hours {} is out of range",
                    older_than_hours
                ))
            })?;

        self.connect(|history, conn| {
            let expired = history.completed_before(cutoff)?;
            for job in &expired {
                if let Some(table) = &job.result_table {
                    let sql = format!("DROP TABLE IF EXISTS main.{}", quote_ident(table));
                    if let Err(e) = conn.execute_batch(&sql) {
                        warn!(job_id = %job.job_id, error = %e, "failed to drop query result");
                        continue;
                    }
                }
                history.delete(&job.job_id)?;
            }
            info!(removed = expired.len(), older_than_hours, "query results cleaned up");
            Ok(expired.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_classified_by_leading_keyword() {
        assert_eq!(statement_kind("  create table t (a INT)"), StatementKind::Ddl);
        assert_eq!(statement_kind("DETACH shop"), StatementKind::Ddl);
        assert_eq!(statement_kind("insert into t values (1)"), StatementKind::Dml);
        assert_eq!(statement_kind("SELECT 1"), StatementKind::Rows);
        assert_eq!(statement_kind("WITH x AS (SELECT 1) SELECT * FROM x"), StatementKind::Rows);
        assert_eq!(statement_kind("CREATED_AT"), StatementKind::Rows);
    }

    #[test]
    fn generated_ids_name_valid_tables() {
        let id = new_job_id();
        assert!(id.starts_with("q_"));
        assert!(is_valid_identifier(&result_table_for(&id)));
    }

    #[test]
    fn history_rows_read_back() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let history = QueryHistory::open(&conn).unwrap();
        history
            .submit("q1", "SELECT 1", &["shop".to_string()])
            .unwrap();
        history.finish("q1", Some("query_result_q1"), Some(1), None).unwrap();

        let job = history.get("q1").unwrap().unwrap();
        assert_eq!(job.status, QueryStatus::Success);
        assert_eq!(job.sources, vec!["shop".to_string()]);
        assert_eq!(job.result_table.as_deref(), Some("query_result_q1"));
        assert!(job.completed_at.is_some());
        assert!(history.get("missing").unwrap().is_none());
    }
}
