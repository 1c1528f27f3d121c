//! File assets: CSV and Parquet files imported as tables in `main`.
//!
//! Metadata lives in `_file_assets.files`, one row per imported table.
//! Re-importing into a table that already has a row updates that row in
//! place, so the id of a file asset survives refreshes and appends.

use crate::error::{AssetError, Result};
use crate::types::{ColumnInfo, FileAsset, FileType, ImportMode};
use duckyard_db::{
    is_valid_identifier, millis_to_datetime, now_millis, quote_ident, quote_literal,
    sanitize_identifier, DbConnection, DbRow, DbValue, Warehouse,
};
use duckyard_sources::{preview_table, TablePreview};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS _file_assets;

CREATE TABLE IF NOT EXISTS _file_assets.files (
    id TEXT PRIMARY KEY,
    project_id TEXT,
    name TEXT NOT NULL,
    file_path TEXT NOT NULL,
    file_type TEXT NOT NULL,
    table_name TEXT NOT NULL,
    description TEXT,
    row_count BIGINT,
    column_count BIGINT,
    file_size_bytes BIGINT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL
);
"#;

const FILE_SELECT: &str = r#"
    SELECT id, name, file_path, file_type, table_name, description, row_count, column_count,
           file_size_bytes, created_at, updated_at
    FROM _file_assets.files
"#;

/// File metadata operations over one open connection.
pub struct FileCatalog<'a> {
    conn: &'a DbConnection,
}

impl<'a> FileCatalog<'a> {
    /// Wrap `conn`, creating the metadata schema if missing.
    pub fn open(conn: &'a DbConnection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn get(&self, id: &str) -> Result<Option<FileAsset>> {
        self.query_one_file(&format!("{} WHERE id = ?", FILE_SELECT), id)
    }

    pub fn get_by_table(&self, table_name: &str) -> Result<Option<FileAsset>> {
        self.query_one_file(&format!("{} WHERE table_name = ?", FILE_SELECT), table_name)
    }

    /// Look a dependency name up as a table name first, then as an id.
    pub fn find_by_table_or_id(&self, name: &str) -> Result<Option<FileAsset>> {
        match self.get_by_table(name)? {
            Some(file) => Ok(Some(file)),
            None => self.get(name),
        }
    }

    /// Newest first.
    pub fn list(&self) -> Result<Vec<FileAsset>> {
        let rows = self.conn.query_all(
            &format!("{} ORDER BY updated_at DESC, name", FILE_SELECT),
            &[],
        )?;
        rows.iter().map(row_to_file).collect()
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM _file_assets.files WHERE id = ?", &[DbValue::from(id)])?;
        Ok(deleted > 0)
    }

    fn upsert(&self, project_id: &str, file: &FileAsset) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO _file_assets.files
                (id, project_id, name, file_path, file_type, table_name, description,
                 row_count, column_count, file_size_bytes, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                file_path = excluded.file_path,
                file_type = excluded.file_type,
                table_name = excluded.table_name,
                description = excluded.description,
                row_count = excluded.row_count,
                column_count = excluded.column_count,
                file_size_bytes = excluded.file_size_bytes,
                updated_at = excluded.updated_at
            "#,
            &[
                DbValue::from(file.id.as_str()),
                DbValue::from(project_id),
                DbValue::from(file.name.as_str()),
                DbValue::from(file.file_path.as_str()),
                DbValue::from(file.file_type.as_str()),
                DbValue::from(file.table_name.as_str()),
                DbValue::from(file.description.clone()),
                DbValue::from(file.row_count),
                DbValue::from(file.column_count),
                DbValue::from(file.file_size_bytes),
                DbValue::from(file.created_at.timestamp_millis()),
                DbValue::from(file.updated_at.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    fn query_one_file(&self, sql: &str, key: &str) -> Result<Option<FileAsset>> {
        let row = self.conn.query_optional(sql, &[DbValue::from(key)])?;
        row.as_ref().map(row_to_file).transpose()
    }
}

fn row_to_file(row: &DbRow) -> Result<FileAsset> {
    let file_type_raw: String = row.get(3)?;
    let file_type = FileType::parse(&file_type_raw)
        .ok_or_else(|| AssetError::validation(format!("Unknown file type '{}'", file_type_raw)))?;
    Ok(FileAsset {
        id: row.get(0)?,
        name: row.get(1)?,
        file_path: row.get(2)?,
        file_type,
        table_name: row.get(4)?,
        description: row.get(5)?,
        row_count: row.get(6)?,
        column_count: row.get(7)?,
        file_size_bytes: row.get(8)?,
        created_at: millis_to_datetime(row.get(9)?),
        updated_at: millis_to_datetime(row.get(10)?),
    })
}

/// Options for [`FileAssetService::import_file`].
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Inferred from the extension when absent.
    pub file_type: Option<FileType>,
    /// Sanitized; defaults to the file stem.
    pub table_name: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub mode: ImportMode,
    /// Allow `replace` to overwrite an existing table.
    pub overwrite: bool,
    /// Key columns for `merge`.
    pub merge_keys: Vec<String>,
}

/// Import, inspect and remove file assets of one project.
#[derive(Debug, Clone)]
pub struct FileAssetService {
    project_id: String,
    warehouse: Warehouse,
}

impl FileAssetService {
    pub fn new(project_id: impl Into<String>, warehouse: Warehouse) -> Self {
        Self {
            project_id: project_id.into(),
            warehouse,
        }
    }

    fn connect<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&FileCatalog<'_>, &DbConnection) -> Result<T>,
    {
        self.warehouse.with_connection(|conn: &DbConnection| {
            let catalog = FileCatalog::open(conn)?;
            op(&catalog, conn)
        })
    }

    /// Load `path` into `main.<table>` according to `options.mode`.
    pub fn import_file(&self, path: &Path, options: ImportOptions) -> Result<FileAsset> {
        if !path.is_file() {
            return Err(AssetError::validation(format!(
                "File not found: {}",
                path.display()
            )));
        }
        let path = fs::canonicalize(path)?;
        let file_type = match options.file_type {
            Some(t) => t,
            None => FileType::from_path(&path).ok_or_else(|| {
                AssetError::validation(format!(
                    "Cannot infer file type of {}; expected .csv or .parquet",
                    path.display()
                ))
            })?,
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let table_name = sanitize_identifier(options.table_name.as_deref().unwrap_or(&stem));
        if options.mode == ImportMode::Merge {
            if options.merge_keys.is_empty() {
                return Err(AssetError::validation("Merge mode requires merge keys"));
            }
            if let Some(bad) = options.merge_keys.iter().find(|k| !is_valid_identifier(k)) {
                return Err(AssetError::validation(format!("Invalid merge key '{}'", bad)));
            }
        }
        let file_size = fs::metadata(&path)?.len() as i64;
        let reader = reader_expr(&path, file_type);
        let target = format!("main.{}", quote_ident(&table_name));

        self.connect(|catalog, conn| {
            let exists = table_exists(conn, &table_name)?;
            match options.mode {
                ImportMode::Replace => {
                    if exists && !options.overwrite {
                        return Err(AssetError::validation(format!(
                            "Table '{}' already exists; use overwrite to replace it",
                            table_name
                        )));
                    }
                    conn.execute_batch(&format!(
                        "CREATE OR REPLACE TABLE {} AS SELECT * FROM {}",
                        target, reader
                    ))?;
                }
                ImportMode::Append => {
                    require_table(exists, &table_name, "append")?;
                    require_same_columns(conn, &target, &reader)?;
                    conn.execute(
                        &format!("INSERT INTO {} BY NAME SELECT * FROM {}", target, reader),
                        &[],
                    )?;
                }
                ImportMode::Merge => {
                    require_table(exists, &table_name, "merge")?;
                    let columns = require_same_columns(conn, &target, &reader)?;
                    if let Some(missing) =
                        options.merge_keys.iter().find(|k| !columns.contains(k.as_str()))
                    {
                        return Err(AssetError::validation(format!(
                            "Merge key '{}' is not a column of '{}'",
                            missing, table_name
                        )));
                    }
                    let matches = options
                        .merge_keys
                        .iter()
                        .map(|k| {
                            format!(
                                "{t}.{k} = src.{k}",
                                t = quote_ident(&table_name),
                                k = quote_ident(k)
                            )
                        })
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    let delete_sql = format!(
                        "DELETE FROM {} WHERE EXISTS (SELECT 1 FROM {} AS src WHERE {})",
                        target, reader, matches
                    );
                    let insert_sql =
                        format!("INSERT INTO {} BY NAME SELECT * FROM {}", target, reader);
                    conn.transaction(|tx| {
                        tx.execute(&delete_sql, &[])?;
                        tx.execute(&insert_sql, &[])?;
                        Ok(())
                    })?;
                }
            }

            let row_count: i64 = conn.query_scalar(&format!("SELECT COUNT(*) FROM {}", target), &[])?;
            let column_count = describe(conn, &target)?.len() as i64;
            let now = millis_to_datetime(now_millis());
            let existing = catalog.get_by_table(&table_name)?;
            let file = FileAsset {
                id: existing
                    .as_ref()
                    .map(|f| f.id.clone())
                    .unwrap_or_else(new_file_id),
                name: options
                    .name
                    .clone()
                    .or_else(|| existing.as_ref().map(|f| f.name.clone()))
                    .unwrap_or_else(|| stem.clone()),
                file_path: path.display().to_string(),
                file_type,
                table_name: table_name.clone(),
                description: options
                    .description
                    .clone()
                    .or_else(|| existing.as_ref().and_then(|f| f.description.clone())),
                row_count: Some(row_count),
                column_count: Some(column_count),
                file_size_bytes: Some(file_size),
                created_at: existing.as_ref().map(|f| f.created_at).unwrap_or(now),
                updated_at: now,
            };
            catalog.upsert(&self.project_id, &file)?;
            info!(
                table = %table_name,
                mode = options.mode.as_str(),
                rows = row_count,
                "imported file asset"
            );
            Ok(file)
        })
    }

    pub fn get_file(&self, id: &str) -> Result<Option<FileAsset>> {
        self.connect(|catalog, _| catalog.get(id))
    }

    pub fn list_files(&self) -> Result<Vec<FileAsset>> {
        self.connect(|catalog, _| catalog.list())
    }

    /// Remove the metadata row, and the table too when `drop_table`.
    pub fn delete_file(&self, id: &str, drop_table: bool) -> Result<bool> {
        self.connect(|catalog, conn| {
            let Some(file) = catalog.get(id)? else {
                return Ok(false);
            };
            if drop_table {
                let sql = format!("DROP TABLE IF EXISTS main.{}", quote_ident(&file.table_name));
                if let Err(e) = conn.execute_batch(&sql) {
                    warn!(table = %file.table_name, error = %e, "failed to drop file asset table");
                }
            }
            catalog.delete(id)
        })
    }

    /// Re-import the original file over its table.
    pub fn refresh_file(&self, id: &str) -> Result<FileAsset> {
        let file = self
            .get_file(id)?
            .ok_or_else(|| AssetError::not_found(format!("file asset '{}'", id)))?;
        self.import_file(
            &PathBuf::from(&file.file_path),
            ImportOptions {
                file_type: Some(file.file_type),
                table_name: Some(file.table_name),
                name: Some(file.name),
                description: file.description,
                mode: ImportMode::Replace,
                overwrite: true,
                merge_keys: Vec::new(),
            },
        )
    }

    pub fn get_table_schema(&self, id: &str) -> Result<Vec<ColumnInfo>> {
        self.connect(|catalog, conn| {
            let file = catalog
                .get(id)?
                .ok_or_else(|| AssetError::not_found(format!("file asset '{}'", id)))?;
            describe(conn, &format!("main.{}", quote_ident(&file.table_name)))
        })
    }

    pub fn preview_file_data(&self, id: &str, limit: usize) -> Result<TablePreview> {
        self.connect(|catalog, conn| {
            let file = catalog
                .get(id)?
                .ok_or_else(|| AssetError::not_found(format!("file asset '{}'", id)))?;
            let table = format!("main.{}", quote_ident(&file.table_name));
            Ok(preview_table(conn, &table, limit, 0)?)
        })
    }
}

fn new_file_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("file_{}", &hex[..12])
}

fn reader_expr(path: &Path, file_type: FileType) -> String {
    let literal = quote_literal(&path.display().to_string());
    match file_type {
        FileType::Csv => format!("read_csv({}, auto_detect = true)", literal),
        FileType::Parquet => format!("read_parquet({})", literal),
    }
}

fn table_exists(conn: &DbConnection, table_name: &str) -> Result<bool> {
    let count: i64 = conn.query_scalar(
        r#"
        SELECT COUNT(*) FROM duckdb_tables()
        WHERE database_name = current_database() AND schema_name = 'main' AND table_name = ?
        "#,
        &[DbValue::from(table_name)],
    )?;
    Ok(count > 0)
}

fn require_table(exists: bool, table_name: &str, mode: &str) -> Result<()> {
    if exists {
        Ok(())
    } else {
        Err(AssetError::validation(format!(
            "Table '{}' does not exist; {} needs an existing table",
            table_name, mode
        )))
    }
}

/// Column names of the existing table, after checking the incoming file
/// has exactly the same set.
fn require_same_columns(conn: &DbConnection, target: &str, reader: &str) -> Result<BTreeSet<String>> {
    let existing: BTreeSet<String> = describe(conn, target)?
        .into_iter()
        .map(|c| c.column_name)
        .collect();
    let incoming: BTreeSet<String> = describe(conn, &format!("SELECT * FROM {}", reader))?
        .into_iter()
        .map(|c| c.column_name)
        .collect();
    if existing != incoming {
        let missing: Vec<_> = existing.difference(&incoming).cloned().collect();
        let extra: Vec<_> = incoming.difference(&existing).cloned().collect();
        return Err(AssetError::validation(format!(
            "Column mismatch: missing [{}], unexpected [{}]",
            missing.join(", "),
            extra.join(", ")
        )));
    }
    Ok(existing)
}

fn describe(conn: &DbConnection, relation: &str) -> Result<Vec<ColumnInfo>> {
    let rows = conn.query_all(&format!("DESCRIBE {}", relation), &[])?;
    rows.iter()
        .map(|row| {
            let null: Option<String> = row.get_by_name("null")?;
            Ok(ColumnInfo {
                column_name: row.get_by_name("column_name")?,
                column_type: row.get_by_name("column_type")?,
                nullable: null.map_or(true, |n| n.eq_ignore_ascii_case("YES")),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_expressions_quote_paths() {
        assert_eq!(
            reader_expr(Path::new("/data/o'brien.csv"), FileType::Csv),
            "read_csv('/data/o''brien.csv', auto_detect = true)"
        );
        assert_eq!(
            reader_expr(Path::new("/data/x.parquet"), FileType::Parquet),
            "read_parquet('/data/x.parquet')"
        );
    }

    #[test]
    fn file_ids_have_prefix_and_fixed_length() {
        let id = new_file_id();
        assert!(id.starts_with("file_"));
        assert_eq!(id.len(), 17);
    }

    #[test]
    fn catalog_lookup_by_table_or_id() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let catalog = FileCatalog::open(&conn).unwrap();
        let now = millis_to_datetime(now_millis());
        let file = FileAsset {
            id: "file_abc".to_string(),
            name: "sales".to_string(),
            file_path: "/data/sales.csv".to_string(),
            file_type: FileType::Csv,
            table_name: "sales_2024".to_string(),
            description: None,
            row_count: Some(3),
            column_count: Some(2),
            file_size_bytes: Some(10),
            created_at: now,
            updated_at: now,
        };
        catalog.upsert("p", &file).unwrap();
        assert_eq!(catalog.find_by_table_or_id("sales_2024").unwrap().unwrap().id, "file_abc");
        assert_eq!(
            catalog.find_by_table_or_id("file_abc").unwrap().unwrap().table_name,
            "sales_2024"
        );
        assert!(catalog.find_by_table_or_id("sales").unwrap().is_none());
        assert!(catalog.delete("file_abc").unwrap());
        assert!(catalog.list().unwrap().is_empty());
    }
}
