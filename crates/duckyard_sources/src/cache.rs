//! Local materialized copies of source tables.
//!
//! Cache tables live in the `cache` schema of the warehouse; metadata rows in
//! `_sources.cached_tables`. Materialization and the metadata upsert are not
//! one transaction, so [`SourceService::reconcile_cache`] can find tables
//! left behind by a crash between the two.

use crate::error::{Result, SourceError};
use crate::registry::{validate_local_table, Registry};
use crate::service::SourceService;
use crate::types::{CacheReconciliation, CachedTable, TablePreview, TableSizeEstimate};
use crate::CACHE_SCHEMA;
use duckyard_db::{now_millis, quote_ident, quote_ident_path, validate_filter, BackendError, DbConnection};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Row count above which caching is recommended.
pub const CACHE_RECOMMEND_ROWS: i64 = 10_000;
/// Row count above which a filter is recommended as well.
pub const FILTER_RECOMMEND_ROWS: i64 = 100_000;

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Optional parts of a [`SourceService::cache_table`] request.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pub local_table: Option<String>,
    /// WHERE-clause fragment applied while copying
    pub filter_sql: Option<String>,
    pub expires_hours: Option<i64>,
}

/// `{source}_{table}` with dots replaced by underscores.
pub fn default_local_name(source_name: &str, source_table: &str) -> String {
    format!("{}_{}", source_name, source_table.replace('.', "_"))
}

fn cache_ref(local_table: &str) -> String {
    format!("{}.{}", CACHE_SCHEMA, quote_ident(local_table))
}

fn source_ref(source_name: &str, source_table: &str) -> String {
    format!("{}.{}", quote_ident(source_name), quote_ident_path(source_table))
}

impl SourceService {
    /// Copy `source_table` into `cache.<local_table>`, replacing any previous copy.
    ///
    /// Metadata is upserted only after the copy and its row count succeed.
    pub fn cache_table(
        &self,
        source_name: &str,
        source_table: &str,
        options: CacheOptions,
    ) -> Result<CachedTable> {
        let source_table = source_table.trim();
        if source_table.is_empty() {
            return Err(SourceError::validation("source_table must not be empty"));
        }
        let local_table = options
            .local_table
            .clone()
            .unwrap_or_else(|| default_local_name(source_name, source_table));
        validate_local_table(&local_table)?;
        let filter_sql = options
            .filter_sql
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty());
        if let Some(filter) = filter_sql {
            validate_filter(filter).map_err(|e| SourceError::validation(e.to_string()))?;
        }
        if let Some(hours) = options.expires_hours {
            expiry_millis(now_millis(), hours)?;
        }

        let result = self.with_attached(&[source_name], |registry| {
            let row_count = materialize(registry.conn(), source_name, source_table, &local_table, filter_sql)
                .map_err(|e| SourceError::cache(source_table, e))?;

            let cached_at = now_millis();
            let expires_at = options
                .expires_hours
                .map(|hours| expiry_millis(cached_at, hours))
                .transpose()?;
            registry.upsert_cached_table(
                source_name,
                source_table,
                &local_table,
                row_count,
                cached_at,
                expires_at,
                filter_sql,
            )?;
            registry
                .get_cached_table(&local_table)?
                .ok_or_else(|| SourceError::cache(source_table, "metadata row missing after upsert"))
        });

        match result {
            Ok(cached) => {
                info!(
                    source = source_name,
                    table = source_table,
                    local_table = %cached.local_table,
                    rows = cached.row_count,
                    "cached table"
                );
                Ok(cached)
            }
            Err(SourceError::Attach { message, .. }) => Err(SourceError::cache(source_table, message)),
            Err(e) => Err(e),
        }
    }

    /// Re-materialize with the stored source, filter and TTL.
    pub fn refresh_cache(&self, local_table: &str) -> Result<CachedTable> {
        let existing = self
            .get_cached_table(local_table)?
            .ok_or_else(|| SourceError::cache(local_table, "cached table not found"))?;
        let ttl_hours = existing.ttl_hours();
        self.cache_table(
            &existing.source_name,
            &existing.source_table,
            CacheOptions {
                local_table: Some(existing.local_table.clone()),
                filter_sql: existing.filter_sql.clone(),
                expires_hours: ttl_hours,
            },
        )
    }

    /// Drop a cached table and its metadata. False when no metadata exists.
    pub fn drop_cache(&self, local_table: &str) -> Result<bool> {
        self.connect(|registry| drop_cache_on(registry, local_table))
    }

    /// Drop every cache whose `expires_at` has passed; returns how many.
    pub fn cleanup_expired_caches(&self) -> Result<usize> {
        self.connect(|registry| {
            let expired = registry.list_expired_cached_tables(now_millis())?;
            let mut dropped = 0;
            for cached in &expired {
                match drop_cache_on(registry, &cached.local_table) {
                    Ok(true) => dropped += 1,
                    Ok(false) => {}
                    Err(e) => warn!(local_table = %cached.local_table, error = %e, "expired cache not dropped"),
                }
            }
            if dropped > 0 {
                info!(dropped, "cleaned up expired caches");
            }
            Ok(dropped)
        })
    }

    pub fn list_cached_tables(&self, source_name: Option<&str>) -> Result<Vec<CachedTable>> {
        self.connect(|registry| registry.list_cached_tables(source_name))
    }

    pub fn get_cached_table(&self, local_table: &str) -> Result<Option<CachedTable>> {
        self.connect(|registry| registry.get_cached_table(local_table))
    }

    /// First `limit` rows of a cached table plus its total row count.
    pub fn preview_cached_table(&self, local_table: &str, limit: usize) -> Result<TablePreview> {
        validate_local_table(local_table)?;
        self.connect(|registry| {
            if registry.get_cached_table(local_table)?.is_none() {
                return Err(SourceError::cache(local_table, "cached table not found"));
            }
            let table = cache_ref(local_table);
            Ok(preview_table(registry.conn(), &table, limit, 0)?)
        })
    }

    /// Row-count estimate with caching advice.
    ///
    /// A failed count still answers, leaning toward caching.
    pub fn estimate_table_size(&self, source_name: &str, table_name: &str) -> Result<TableSizeEstimate> {
        let reference = source_ref(source_name, table_name);
        let counted = self.with_sources(&[source_name], |conn| {
            Ok(conn.query_scalar::<i64>(&format!("SELECT COUNT(*) FROM {}", reference), &[]))
        });

        let count = match counted {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => Err(e.to_string()),
            Err(SourceError::Attach { message, .. }) => Err(message),
            Err(e) => return Err(e),
        };

        Ok(match count {
            Ok(rows) => TableSizeEstimate {
                source_name: source_name.to_string(),
                table_name: table_name.to_string(),
                estimated_rows: Some(rows),
                recommend_cache: rows > CACHE_RECOMMEND_ROWS,
                recommend_filter: rows > FILTER_RECOMMEND_ROWS,
                suggestion: cache_suggestion(rows),
                error: None,
            },
            Err(message) => {
                debug!(source = source_name, table = table_name, error = %message, "size estimate failed");
                TableSizeEstimate {
                    source_name: source_name.to_string(),
                    table_name: table_name.to_string(),
                    estimated_rows: None,
                    recommend_cache: true,
                    recommend_filter: false,
                    suggestion: "Unable to estimate size. Consider caching with a date filter."
                        .to_string(),
                    error: Some(message),
                }
            }
        })
    }

    /// Compare the cache schema against cache metadata without changing either.
    pub fn reconcile_cache(&self) -> Result<CacheReconciliation> {
        self.connect(reconcile)
    }

    /// Drop orphan cache tables and delete metadata rows whose table is gone.
    /// Returns what was repaired.
    pub fn reconcile_cache_and_repair(&self) -> Result<CacheReconciliation> {
        self.connect(|registry| {
            let report = reconcile(registry)?;
            for orphan in &report.orphan_tables {
                registry
                    .conn()
                    .execute_batch(&format!("DROP TABLE IF EXISTS {}", cache_ref(orphan)))?;
                info!(local_table = %orphan, "dropped orphan cache table");
            }
            for missing in &report.missing_tables {
                registry.delete_cached_table(missing)?;
                info!(local_table = %missing, "removed metadata for missing cache table");
            }
            Ok(report)
        })
    }
}

/// Drop-then-create the cache table; returns its row count.
fn materialize(
    conn: &DbConnection,
    source_name: &str,
    source_table: &str,
    local_table: &str,
    filter_sql: Option<&str>,
) -> std::result::Result<i64, BackendError> {
    let target = cache_ref(local_table);
    let mut select = format!("SELECT * FROM {}", source_ref(source_name, source_table));
    if let Some(filter) = filter_sql {
        select.push_str(&format!(" WHERE ({}\n)", filter));
    }
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", target))?;
    conn.execute_batch(&format!("CREATE TABLE {} AS {}", target, select))?;
    conn.query_scalar(&format!("SELECT COUNT(*) FROM {}", target), &[])
}

fn drop_cache_on(registry: &Registry<'_>, local_table: &str) -> Result<bool> {
    if registry.get_cached_table(local_table)?.is_none() {
        return Ok(false);
    }
    if let Err(e) = registry
        .conn()
        .execute_batch(&format!("DROP TABLE IF EXISTS {}", cache_ref(local_table)))
    {
        warn!(local_table, error = %e, "cache table drop failed, removing metadata anyway");
    }
    registry.delete_cached_table(local_table)?;
    info!(local_table, "dropped cache");
    Ok(true)
}

fn reconcile(registry: &Registry<'_>) -> Result<CacheReconciliation> {
    let physical: BTreeSet<String> = registry.list_cache_schema_tables()?.into_iter().collect();
    let tracked: BTreeSet<String> = registry
        .list_cached_tables(None)?
        .into_iter()
        .map(|c| c.local_table)
        .collect();
    Ok(CacheReconciliation {
        orphan_tables: physical.difference(&tracked).cloned().collect(),
        missing_tables: tracked.difference(&physical).cloned().collect(),
    })
}

/// Page of `table` as JSON values plus its total row count.
pub fn preview_table(
    conn: &DbConnection,
    table: &str,
    limit: usize,
    offset: usize,
) -> std::result::Result<TablePreview, BackendError> {
    let result = conn.query_with_columns(
        &format!("SELECT * FROM {} LIMIT {} OFFSET {}", table, limit, offset),
        &[],
    )?;
    let total_rows: i64 = conn.query_scalar(&format!("SELECT COUNT(*) FROM {}", table), &[])?;
    Ok(TablePreview {
        columns: result.columns,
        rows: result
            .rows
            .iter()
            .map(|row| row.values().iter().map(|v| v.to_json()).collect())
            .collect(),
        total_rows,
    })
}

fn cache_suggestion(rows: i64) -> String {
    if rows < 1_000 {
        "Small table: live queries should be fast enough.".to_string()
    } else if rows < CACHE_RECOMMEND_ROWS {
        "Moderate size: query it live, or cache it if you query it often.".to_string()
    } else if rows < FILTER_RECOMMEND_ROWS {
        format!("About {} rows: a local cache will speed up analysis.", group_thousands(rows))
    } else if rows < 1_000_000 {
        format!("About {} rows: cache it together with a date filter.", group_thousands(rows))
    } else {
        format!(
            "About {} rows, a large table: filter to the period you need before caching.",
            group_thousands(rows)
        )
    }
}

/// `cached_at + hours`, rejecting negative TTLs and expiries that overflow
/// or fall outside the representable timestamp range.
fn expiry_millis(cached_at: i64, hours: i64) -> Result<i64> {
    if hours < 0 {
        return Err(SourceError::validation("expires_hours must not be negative"));
    }
    hours
        .checked_mul(MILLIS_PER_HOUR)
        .and_then(|ttl| cached_at.checked_add(ttl))
        .filter(|at| chrono::DateTime::from_timestamp_millis(*at).is_some())
        .ok_or_else(|| SourceError::validation(format!("expires_hours {} is out of range", hours)))
}

fn group_thousands(n: i64) -> String {
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if n < 0 {
        format!("-{}", out)
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::AttachOptions;
    use crate::types::SourceType;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> SourceService {
        let path = temp.path().join("shop.duckdb");
        {
            let conn = DbConnection::open_duckdb(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE orders AS SELECT range AS id, range % 3 AS region FROM range(30);",
            )
            .unwrap();
        }
        let svc = SourceService::new("p1", temp.path().join("warehouse.duckdb")).unwrap();
        svc.attach_source(
            "shop",
            SourceType::Duckdb,
            json!({"path": path.display().to_string()}).as_object().cloned().unwrap(),
            AttachOptions::default(),
        )
        .unwrap();
        svc
    }

    #[test]
    fn default_name_and_suggestions() {
        assert_eq!(default_local_name("pg", "public.orders"), "pg_public_orders");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
        assert_eq!(group_thousands(999), "999");
        assert!(cache_suggestion(50_000).contains("50,000"));
    }

    #[test]
    fn cache_and_refresh_keep_filter() {
        let temp = TempDir::new().unwrap();
        let svc = setup(&temp);

        let cached = svc
            .cache_table(
                "shop",
                "orders",
                CacheOptions {
                    filter_sql: Some("region = 1".to_string()),
                    expires_hours: Some(24),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(cached.local_table, "shop_orders");
        assert_eq!(cached.row_count, 10);
        assert_eq!(cached.ttl_hours(), Some(24));

        let refreshed = svc.refresh_cache("shop_orders").unwrap();
        assert_eq!(refreshed.row_count, 10);
        assert_eq!(refreshed.filter_sql.as_deref(), Some("region = 1"));
        assert_eq!(refreshed.ttl_hours(), Some(24));
        assert_eq!(svc.get_source("shop").unwrap().unwrap().table_count, 1);
    }

    #[test]
    fn oversized_ttl_is_rejected_before_materializing() {
        let temp = TempDir::new().unwrap();
        let svc = setup(&temp);

        for hours in [i64::MAX / 1000, i64::MAX, 1_000_000_000_000, -1] {
            let err = svc
                .cache_table(
                    "shop",
                    "orders",
                    CacheOptions {
                        expires_hours: Some(hours),
                        ..Default::default()
                    },
                )
                .unwrap_err();
            assert!(matches!(err, SourceError::Validation(_)), "hours = {}", hours);
        }
        assert!(svc.list_cached_tables(None).unwrap().is_empty());
        assert!(svc.reconcile_cache().unwrap().is_clean());

        assert_eq!(expiry_millis(0, 2).unwrap(), 2 * MILLIS_PER_HOUR);
    }

    #[test]
    fn bad_filter_is_cache_error_without_metadata() {
        let temp = TempDir::new().unwrap();
        let svc = setup(&temp);
        let err = svc
            .cache_table(
                "shop",
                "orders",
                CacheOptions {
                    filter_sql: Some("no_such_column = 1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::Cache { ref table, .. } if table == "orders"));
        assert!(svc.get_cached_table("shop_orders").unwrap().is_none());
    }

    #[test]
    fn refresh_unknown_is_cache_error() {
        let temp = TempDir::new().unwrap();
        let svc = setup(&temp);
        assert!(matches!(
            svc.refresh_cache("nope").unwrap_err(),
            SourceError::Cache { .. }
        ));
        assert!(!svc.drop_cache("nope").unwrap());
    }

    #[test]
    fn preview_pages_rows() {
        let temp = TempDir::new().unwrap();
        let svc = setup(&temp);
        svc.cache_table("shop", "orders", CacheOptions::default()).unwrap();
        let preview = svc.preview_cached_table("shop_orders", 5).unwrap();
        assert_eq!(preview.columns, vec!["id".to_string(), "region".to_string()]);
        assert_eq!(preview.rows.len(), 5);
        assert_eq!(preview.total_rows, 30);
    }

    #[test]
    fn estimate_small_and_failing() {
        let temp = TempDir::new().unwrap();
        let svc = setup(&temp);
        let estimate = svc.estimate_table_size("shop", "orders").unwrap();
        assert_eq!(estimate.estimated_rows, Some(30));
        assert!(!estimate.recommend_cache);
        assert!(!estimate.recommend_filter);
        assert!(estimate.error.is_none());

        let failed = svc.estimate_table_size("shop", "missing_table").unwrap();
        assert!(failed.recommend_cache);
        assert!(!failed.recommend_filter);
        assert!(failed.error.is_some());

        assert!(svc.estimate_table_size("nope", "x").unwrap_err().is_not_found());
    }

    #[test]
    fn reconcile_finds_and_repairs_drift() {
        let temp = TempDir::new().unwrap();
        let svc = setup(&temp);
        svc.cache_table("shop", "orders", CacheOptions::default()).unwrap();
        assert!(svc.reconcile_cache().unwrap().is_clean());

        svc.warehouse()
            .with_connection(|conn| {
                conn.execute_batch("CREATE TABLE cache.stray AS SELECT 1 AS x; DROP TABLE cache.shop_orders;")
            })
            .unwrap();

        let report = svc.reconcile_cache().unwrap();
        assert_eq!(report.orphan_tables, vec!["stray".to_string()]);
        assert_eq!(report.missing_tables, vec!["shop_orders".to_string()]);

        svc.reconcile_cache_and_repair().unwrap();
        assert!(svc.reconcile_cache().unwrap().is_clean());
        assert!(svc.get_cached_table("shop_orders").unwrap().is_none());
    }
}
