//! Durable source metadata inside the project warehouse.
//!
//! Layout:
//! - `_sources.attached`: attached sources (sanitized configs only)
//! - `_sources.cached_tables`: cache metadata, one row per local table
//! - `_sources.folders`: folder sources and their last scan snapshot
//! - `cache`: the materialized cache tables themselves
//!
//! All timestamps are BIGINT milliseconds since the Unix epoch.

use crate::error::{Result, SourceError};
use crate::types::{
    AllowedTypes, AttachedSource, CachedTable, ConnectionConfig, FolderFile, FolderSource,
    SourceStatus, SourceType,
};
use crate::CACHE_SCHEMA;
use duckyard_db::{is_valid_identifier, millis_to_datetime, now_millis, DbConnection, DbRow};
use tracing::warn;

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS _sources;
CREATE SCHEMA IF NOT EXISTS cache;

CREATE TABLE IF NOT EXISTS _sources.attached (
    name TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    source_type TEXT NOT NULL,
    connection_config TEXT NOT NULL,
    attached_at BIGINT NOT NULL,
    updated_at BIGINT,
    status TEXT NOT NULL DEFAULT 'attached',
    error_message TEXT,
    project_id TEXT,
    description TEXT
);

CREATE TABLE IF NOT EXISTS _sources.cached_tables (
    local_table TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    source_name TEXT NOT NULL,
    source_table TEXT NOT NULL,
    cached_at BIGINT NOT NULL,
    row_count BIGINT NOT NULL DEFAULT 0,
    expires_at BIGINT,
    filter_sql TEXT
);

CREATE TABLE IF NOT EXISTS _sources.folders (
    name TEXT PRIMARY KEY,
    id TEXT NOT NULL,
    path TEXT NOT NULL,
    allowed_types TEXT NOT NULL DEFAULT 'both',
    pattern TEXT,
    project_id TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    last_scanned_at BIGINT,
    last_scan_snapshot TEXT
);
"#;

/// Names a source alias may never take: internal schemas and DuckDB's
/// built-in catalogs.
pub const RESERVED_NAMES: &[&str] = &[
    "_sources",
    "_assets",
    "_file_assets",
    CACHE_SCHEMA,
    "analysis",
    "main",
    "memory",
    "system",
    "temp",
    "information_schema",
    "pg_catalog",
];

const SOURCE_SELECT: &str = r#"
    SELECT a.id, a.name, a.source_type, a.connection_config, a.attached_at, a.updated_at,
           a.status, a.error_message, a.project_id, a.description,
           (SELECT COUNT(*) FROM _sources.cached_tables c WHERE c.source_name = a.name) AS table_count
    FROM _sources.attached a
"#;

const CACHE_SELECT: &str = r#"
    SELECT id, source_name, source_table, local_table, cached_at, row_count, expires_at, filter_sql
    FROM _sources.cached_tables
"#;

const FOLDER_SELECT: &str = r#"
    SELECT id, name, path, allowed_types, pattern, created_at, updated_at, last_scanned_at
    FROM _sources.folders
"#;

/// Validate a source or folder alias: identifier pattern, not reserved.
pub fn validate_source_name(name: &str) -> Result<()> {
    if !is_valid_identifier(name) {
        return Err(SourceError::validation(format!(
            "Invalid name '{}': must match ^[A-Za-z_][A-Za-z0-9_]*$",
            name
        )));
    }
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        return Err(SourceError::validation(format!(
            "Name '{}' is reserved for internal use",
            name
        )));
    }
    Ok(())
}

/// Validate a cache table name.
pub fn validate_local_table(name: &str) -> Result<()> {
    if !is_valid_identifier(name) {
        return Err(SourceError::validation(format!(
            "Invalid local table name '{}': must match ^[A-Za-z_][A-Za-z0-9_]*$",
            name
        )));
    }
    Ok(())
}

/// Registry operations over one open connection.
pub struct Registry<'a> {
    conn: &'a DbConnection,
}

impl<'a> Registry<'a> {
    /// Wrap `conn`, creating the metadata schemas if missing.
    pub fn open(conn: &'a DbConnection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &'a DbConnection {
        self.conn
    }

    // ========================================================================
    // Attached sources
    // ========================================================================

    /// Record a successful attach. Re-attaching a name overwrites type and
    /// config and clears any prior error; a missing description keeps the
    /// previous one.
    pub fn upsert_attached(
        &self,
        name: &str,
        source_type: SourceType,
        sanitized: &ConnectionConfig,
        project_id: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let now = now_millis();
        let config_json = serde_json::to_string(sanitized)?;
        self.conn.execute(
            r#"
            INSERT INTO _sources.attached
                (name, id, source_type, connection_config, attached_at, updated_at, status, error_message, project_id, description)
            VALUES (?, ?, ?, ?, ?, ?, 'attached', NULL, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                source_type = excluded.source_type,
                connection_config = excluded.connection_config,
                attached_at = excluded.attached_at,
                updated_at = excluded.updated_at,
                status = 'attached',
                error_message = NULL,
                project_id = excluded.project_id,
                description = COALESCE(excluded.description, _sources.attached.description)
            "#,
            &[
                name.into(),
                new_id().into(),
                source_type.as_str().into(),
                config_json.into(),
                now.into(),
                now.into(),
                project_id.into(),
                description.into(),
            ],
        )?;
        Ok(())
    }

    /// Record a failed attach. The row reflects the attempted type and
    /// config; a missing description keeps the previous one.
    pub fn upsert_attach_error(
        &self,
        name: &str,
        source_type: SourceType,
        sanitized: &ConnectionConfig,
        project_id: &str,
        description: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let now = now_millis();
        let config_json = serde_json::to_string(sanitized)?;
        self.conn.execute(
            r#"
            INSERT INTO _sources.attached
                (name, id, source_type, connection_config, attached_at, updated_at, status, error_message, project_id, description)
            VALUES (?, ?, ?, ?, ?, ?, 'error', ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                source_type = excluded.source_type,
                connection_config = excluded.connection_config,
                status = 'error',
                error_message = excluded.error_message,
                updated_at = excluded.updated_at,
                project_id = excluded.project_id,
                description = COALESCE(excluded.description, _sources.attached.description)
            "#,
            &[
                name.into(),
                new_id().into(),
                source_type.as_str().into(),
                config_json.into(),
                now.into(),
                now.into(),
                message.into(),
                project_id.into(),
                description.into(),
            ],
        )?;
        Ok(())
    }

    /// Non-detached source by name.
    pub fn get_source(&self, name: &str) -> Result<Option<AttachedSource>> {
        let sql = format!("{} WHERE a.name = ? AND a.status != 'detached'", SOURCE_SELECT);
        self.conn
            .query_optional(&sql, &[name.into()])?
            .map(|row| row_to_source(&row))
            .transpose()
    }

    /// Non-detached sources, most recently changed first.
    pub fn list_sources(&self) -> Result<Vec<AttachedSource>> {
        let sql = format!(
            "{} WHERE a.status != 'detached' ORDER BY COALESCE(a.updated_at, a.attached_at) DESC, a.name",
            SOURCE_SELECT
        );
        self.conn
            .query_all(&sql, &[])?
            .iter()
            .map(row_to_source)
            .collect()
    }

    pub fn mark_detached(&self, name: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE _sources.attached SET status = 'detached', updated_at = ? WHERE name = ? AND status != 'detached'",
            &[now_millis().into(), name.into()],
        )?;
        Ok(changed > 0)
    }

    pub fn update_description(&self, name: &str, description: Option<&str>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE _sources.attached SET description = ?, updated_at = ? WHERE name = ? AND status != 'detached'",
            &[description.into(), now_millis().into(), name.into()],
        )?;
        Ok(changed > 0)
    }

    // ========================================================================
    // Cached tables
    // ========================================================================

    /// Insert or replace the metadata row for `local_table`.
    pub fn upsert_cached_table(
        &self,
        source_name: &str,
        source_table: &str,
        local_table: &str,
        row_count: i64,
        cached_at: i64,
        expires_at: Option<i64>,
        filter_sql: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO _sources.cached_tables
                (local_table, id, source_name, source_table, cached_at, row_count, expires_at, filter_sql)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (local_table) DO UPDATE SET
                source_name = excluded.source_name,
                source_table = excluded.source_table,
                cached_at = excluded.cached_at,
                row_count = excluded.row_count,
                expires_at = excluded.expires_at,
                filter_sql = excluded.filter_sql
            "#,
            &[
                local_table.into(),
                new_id().into(),
                source_name.into(),
                source_table.into(),
                cached_at.into(),
                row_count.into(),
                expires_at.into(),
                filter_sql.into(),
            ],
        )?;
        Ok(())
    }

    pub fn get_cached_table(&self, local_table: &str) -> Result<Option<CachedTable>> {
        let sql = format!("{} WHERE local_table = ?", CACHE_SELECT);
        self.conn
            .query_optional(&sql, &[local_table.into()])?
            .map(|row| row_to_cached_table(&row))
            .transpose()
    }

    pub fn list_cached_tables(&self, source_name: Option<&str>) -> Result<Vec<CachedTable>> {
        let rows = match source_name {
            Some(source) => {
                let sql = format!("{} WHERE source_name = ? ORDER BY cached_at DESC, local_table", CACHE_SELECT);
                self.conn.query_all(&sql, &[source.into()])?
            }
            None => {
                let sql = format!("{} ORDER BY cached_at DESC, local_table", CACHE_SELECT);
                self.conn.query_all(&sql, &[])?
            }
        };
        rows.iter().map(row_to_cached_table).collect()
    }

    /// Rows with a non-null `expires_at` earlier than `now`.
    pub fn list_expired_cached_tables(&self, now: i64) -> Result<Vec<CachedTable>> {
        let sql = format!(
            "{} WHERE expires_at IS NOT NULL AND expires_at < ? ORDER BY expires_at",
            CACHE_SELECT
        );
        self.conn
            .query_all(&sql, &[now.into()])?
            .iter()
            .map(row_to_cached_table)
            .collect()
    }

    pub fn delete_cached_table(&self, local_table: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM _sources.cached_tables WHERE local_table = ?",
            &[local_table.into()],
        )?;
        Ok(deleted > 0)
    }

    /// Tables physically present in the cache schema.
    pub fn list_cache_schema_tables(&self) -> Result<Vec<String>> {
        let rows = self.conn.query_all(
            "SELECT table_name FROM duckdb_tables() WHERE database_name = current_database() AND schema_name = ? ORDER BY table_name",
            &[CACHE_SCHEMA.into()],
        )?;
        rows.iter()
            .map(|row| row.get::<String>(0).map_err(SourceError::from))
            .collect()
    }

    // ========================================================================
    // Folder sources
    // ========================================================================

    /// Insert or update a folder by name; returns its id.
    pub fn upsert_folder(
        &self,
        name: &str,
        path: &str,
        allowed_types: AllowedTypes,
        pattern: Option<&str>,
        project_id: &str,
    ) -> Result<String> {
        let owner: Option<Option<String>> = self
            .conn
            .query_optional("SELECT project_id FROM _sources.folders WHERE name = ?", &[name.into()])?
            .map(|row| row.get::<Option<String>>(0))
            .transpose()?;
        if let Some(Some(owner)) = owner.filter(|o| o.as_deref() != Some(project_id)) {
            return Err(SourceError::validation(format!(
                "Folder name '{}' is registered by project '{}'",
                name, owner
            )));
        }
        let now = now_millis();
        let folder_id = format!("folder_{}", &new_id().replace('-', "")[..12]);
        self.conn.execute(
            r#"
            INSERT INTO _sources.folders
                (name, id, path, allowed_types, pattern, project_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                path = excluded.path,
                allowed_types = excluded.allowed_types,
                pattern = excluded.pattern,
                project_id = excluded.project_id,
                updated_at = excluded.updated_at
            "#,
            &[
                name.into(),
                folder_id.into(),
                path.into(),
                allowed_types.as_str().into(),
                pattern.into(),
                project_id.into(),
                now.into(),
                now.into(),
            ],
        )?;
        let id: String = self
            .conn
            .query_scalar("SELECT id FROM _sources.folders WHERE name = ?", &[name.into()])?;
        Ok(id)
    }

    pub fn get_folder(&self, folder_id: &str, project_id: &str) -> Result<Option<FolderSource>> {
        let sql = format!("{} WHERE id = ? AND project_id = ?", FOLDER_SELECT);
        self.conn
            .query_optional(&sql, &[folder_id.into(), project_id.into()])?
            .map(|row| row_to_folder(&row))
            .transpose()
    }

    pub fn list_folders(&self, project_id: &str) -> Result<Vec<FolderSource>> {
        let sql = format!(
            "{} WHERE project_id = ? ORDER BY created_at DESC, name",
            FOLDER_SELECT
        );
        self.conn
            .query_all(&sql, &[project_id.into()])?
            .iter()
            .map(row_to_folder)
            .collect()
    }

    pub fn delete_folder(&self, folder_id: &str, project_id: &str) -> Result<bool> {
        let deleted = self.conn.execute(
            "DELETE FROM _sources.folders WHERE id = ? AND project_id = ?",
            &[folder_id.into(), project_id.into()],
        )?;
        Ok(deleted > 0)
    }

    /// Previous scan snapshot. Empty when the folder was never scanned or the
    /// stored snapshot cannot be read, so the next scan reports every file as new.
    pub fn load_snapshot(&self, folder_id: &str, project_id: &str) -> Result<Vec<FolderFile>> {
        let raw: Option<String> = self
            .conn
            .query_optional(
                "SELECT last_scan_snapshot FROM _sources.folders WHERE id = ? AND project_id = ?",
                &[folder_id.into(), project_id.into()],
            )?
            .map(|row| row.get::<Option<String>>(0))
            .transpose()?
            .flatten();
        let Some(json) = raw.filter(|j| !j.trim().is_empty()) else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&json) {
            Ok(files) => Ok(files),
            Err(e) => {
                warn!(folder = folder_id, error = %e, "unreadable scan snapshot, rescanning from empty");
                Ok(Vec::new())
            }
        }
    }

    pub fn save_snapshot(
        &self,
        folder_id: &str,
        project_id: &str,
        files: &[FolderFile],
        scanned_at: i64,
    ) -> Result<()> {
        let json = serde_json::to_string(files)?;
        self.conn.execute(
            "UPDATE _sources.folders SET last_scan_snapshot = ?, last_scanned_at = ? WHERE id = ? AND project_id = ?",
            &[json.into(), scanned_at.into(), folder_id.into(), project_id.into()],
        )?;
        Ok(())
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn parse_config(raw: &str) -> Result<ConnectionConfig> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Ok(ConnectionConfig::new()),
    }
}

fn row_to_source(row: &DbRow) -> Result<AttachedSource> {
    let source_type_raw: String = row.get(2)?;
    let source_type = SourceType::parse(&source_type_raw).ok_or_else(|| {
        SourceError::validation(format!("Unknown source type in registry: {}", source_type_raw))
    })?;
    let status_raw: String = row.get(6)?;
    let status = SourceStatus::parse(&status_raw).ok_or_else(|| {
        SourceError::validation(format!("Unknown source status in registry: {}", status_raw))
    })?;
    let config_raw: String = row.get(3)?;

    Ok(AttachedSource {
        id: row.get(0)?,
        name: row.get(1)?,
        source_type,
        connection_config: parse_config(&config_raw)?,
        attached_at: millis_to_datetime(row.get(4)?),
        updated_at: row.get::<Option<i64>>(5)?.map(millis_to_datetime),
        status,
        error_message: row.get(7)?,
        project_id: row.get(8)?,
        description: row.get(9)?,
        table_count: row.get(10)?,
    })
}

fn row_to_cached_table(row: &DbRow) -> Result<CachedTable> {
    Ok(CachedTable {
        id: row.get(0)?,
        source_name: row.get(1)?,
        source_table: row.get(2)?,
        local_table: row.get(3)?,
        cached_at: millis_to_datetime(row.get(4)?),
        row_count: row.get(5)?,
        expires_at: row.get::<Option<i64>>(6)?.map(millis_to_datetime),
        filter_sql: row.get(7)?,
    })
}

fn row_to_folder(row: &DbRow) -> Result<FolderSource> {
    let allowed_raw: String = row.get(3)?;
    let allowed_types = AllowedTypes::parse(&allowed_raw).unwrap_or(AllowedTypes::Both);
    Ok(FolderSource {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        allowed_types,
        pattern: row.get(4)?,
        created_at: millis_to_datetime(row.get(5)?),
        updated_at: millis_to_datetime(row.get(6)?),
        last_scanned_at: row.get::<Option<i64>>(7)?.map(millis_to_datetime),
    })
}
