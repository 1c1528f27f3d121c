//! Core types for source federation, caching and folder sources

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full or sanitized connection settings for one source.
pub type ConnectionConfig = serde_json::Map<String, serde_json::Value>;

/// Engine behind an attached source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Postgres,
    Sqlite,
    Mysql,
    /// A local DuckDB database file
    Duckdb,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
            Self::Mysql => "mysql",
            Self::Duckdb => "duckdb",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            "mysql" => Some(Self::Mysql),
            "duckdb" | "duckdb-file" | "duckdb_file" => Some(Self::Duckdb),
            _ => None,
        }
    }

    /// DuckDB extension to INSTALL/LOAD before attaching, if any.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Postgres => Some("postgres"),
            Self::Sqlite => Some("sqlite"),
            Self::Mysql => Some("mysql"),
            Self::Duckdb => None,
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry status of an attached source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Attached,
    Error,
    Detached,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attached => "attached",
            Self::Error => "error",
            Self::Detached => "detached",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "attached" => Some(Self::Attached),
            "error" => Some(Self::Error),
            "detached" => Some(Self::Detached),
            _ => None,
        }
    }
}

/// An externally reachable database registered under an alias
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedSource {
    pub id: String,
    pub name: String,
    pub source_type: SourceType,
    /// Sanitized: secret-bearing values are masked
    pub connection_config: ConnectionConfig,
    pub attached_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub status: SourceStatus,
    pub error_message: Option<String>,
    pub project_id: Option<String>,
    pub description: Option<String>,
    /// Number of cached tables taken from this source
    pub table_count: i64,
}

impl AttachedSource {
    /// Last time the source's registration changed.
    pub fn changed_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.attached_at)
    }
}

/// Whether a source table is read through the attachment or a local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableMode {
    Live,
    Cached,
}

impl TableMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Cached => "cached",
        }
    }
}

/// A table discovered inside an attached source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTable {
    pub source_name: String,
    pub schema: Option<String>,
    pub table_name: String,
    pub mode: TableMode,
    pub local_table: Option<String>,
}

impl SourceTable {
    /// `schema.table`, or the bare name when the schema is unknown.
    pub fn qualified_name(&self) -> String {
        match &self.schema {
            Some(schema) if !schema.is_empty() => format!("{}.{}", schema, self.table_name),
            _ => self.table_name.clone(),
        }
    }
}

/// Local materialized snapshot of one source table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTable {
    pub id: String,
    pub source_name: String,
    pub source_table: String,
    pub local_table: String,
    pub cached_at: DateTime<Utc>,
    pub row_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub filter_sql: Option<String>,
}

impl CachedTable {
    /// Schema-qualified, quoted reference usable in SQL.
    pub fn table_ref(&self) -> String {
        format!("{}.{}", crate::CACHE_SCHEMA, duckyard_db::quote_ident(&self.local_table))
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// TTL in whole hours, derived from `expires_at - cached_at`.
    pub fn ttl_hours(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - self.cached_at).num_hours().max(0))
    }
}

/// Row-count estimate and caching advice for a source table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSizeEstimate {
    pub source_name: String,
    pub table_name: String,
    pub estimated_rows: Option<i64>,
    pub recommend_cache: bool,
    pub recommend_filter: bool,
    pub suggestion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Column names plus a page of rows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TablePreview {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub total_rows: i64,
}

/// Comparison of the cache namespace against cache metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheReconciliation {
    /// Tables in the cache schema with no metadata row
    pub orphan_tables: Vec<String>,
    /// Metadata rows whose table is gone
    pub missing_tables: Vec<String>,
}

impl CacheReconciliation {
    pub fn is_clean(&self) -> bool {
        self.orphan_tables.is_empty() && self.missing_tables.is_empty()
    }
}

/// File kinds a folder source accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllowedTypes {
    Csv,
    Parquet,
    Both,
}

impl AllowedTypes {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
            Self::Both => "both",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "parquet" => Some(Self::Parquet),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    /// Lowercase extensions accepted by this setting.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Csv => &["csv"],
            Self::Parquet => &["parquet"],
            Self::Both => &["csv", "parquet"],
        }
    }
}

/// A registered local directory scanned for importable files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderSource {
    pub id: String,
    pub name: String,
    pub path: String,
    pub allowed_types: AllowedTypes,
    pub pattern: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_scanned_at: Option<DateTime<Utc>>,
}

/// One file seen in a folder listing; also the snapshot entry format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderFile {
    pub path: String,
    pub name: String,
    pub file_type: String,
    pub size_bytes: u64,
    /// Epoch milliseconds
    pub modified_at: i64,
}

/// Delta between the previous snapshot and a fresh listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderScanResult {
    pub folder_id: String,
    pub scanned_at: DateTime<Utc>,
    pub new_files: usize,
    pub changed_files: usize,
    pub deleted_files: usize,
    pub new_file_paths: Vec<String>,
    pub changed_file_paths: Vec<String>,
    pub deleted_file_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn source_type_parse() {
        for ty in [
            SourceType::Postgres,
            SourceType::Sqlite,
            SourceType::Mysql,
            SourceType::Duckdb,
        ] {
            assert_eq!(SourceType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(SourceType::parse("duckdb-file"), Some(SourceType::Duckdb));
        assert_eq!(SourceType::parse("PostgreSQL"), Some(SourceType::Postgres));
        assert_eq!(SourceType::parse("oracle"), None);
    }

    #[test]
    fn cached_table_ttl_and_expiry() {
        let cached_at = Utc::now();
        let table = CachedTable {
            id: "c1".to_string(),
            source_name: "pg".to_string(),
            source_table: "public.orders".to_string(),
            local_table: "pg_public_orders".to_string(),
            cached_at,
            row_count: 10,
            expires_at: Some(cached_at + Duration::hours(24)),
            filter_sql: None,
        };
        assert_eq!(table.ttl_hours(), Some(24));
        assert!(!table.is_expired(cached_at));
        assert!(table.is_expired(cached_at + Duration::hours(25)));
        assert_eq!(table.table_ref(), "cache.\"pg_public_orders\"");
    }

    #[test]
    fn qualified_name() {
        let mut table = SourceTable {
            source_name: "s".to_string(),
            schema: Some("main".to_string()),
            table_name: "orders".to_string(),
            mode: TableMode::Live,
            local_table: None,
        };
        assert_eq!(table.qualified_name(), "main.orders");
        table.schema = None;
        assert_eq!(table.qualified_name(), "orders");
    }

    #[test]
    fn allowed_types_extensions() {
        assert_eq!(AllowedTypes::parse("BOTH"), Some(AllowedTypes::Both));
        assert_eq!(AllowedTypes::Both.extensions(), &["csv", "parquet"]);
        assert_eq!(AllowedTypes::parse("json"), None);
    }
}
