//! Table enumeration strategies for attached sources.
//!
//! Attached engines expose their catalogs differently, so discovery walks an
//! ordered list of [`TableLister`]s and keeps the first non-empty answer.

use duckyard_db::{quote_ident, BackendError, DbConnection};
use tracing::debug;

/// One table found by a lister.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedTable {
    pub schema: Option<String>,
    pub table: String,
}

impl ListedTable {
    fn new(schema: Option<String>, table: String) -> Self {
        Self {
            schema: schema.filter(|s| !s.is_empty()),
            table,
        }
    }
}

/// A way of enumerating the tables of one attached database.
pub trait TableLister: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn list(&self, conn: &DbConnection, database: &str) -> Result<Vec<ListedTable>, BackendError>;
}

/// `duckdb_tables()` filtered by database name.
#[derive(Debug, Default)]
pub struct CatalogLister;

impl TableLister for CatalogLister {
    fn name(&self) -> &'static str {
        "duckdb_tables"
    }

    fn list(&self, conn: &DbConnection, database: &str) -> Result<Vec<ListedTable>, BackendError> {
        let rows = conn.query_all(
            "SELECT schema_name, table_name FROM duckdb_tables() WHERE database_name = ? ORDER BY schema_name, table_name",
            &[database.into()],
        )?;
        rows.iter()
            .map(|row| -> Result<ListedTable, BackendError> {
                Ok(ListedTable::new(row.get(0)?, row.get(1)?))
            })
            .collect()
    }
}

/// `SHOW ALL TABLES`, keeping rows of the requested database.
#[derive(Debug, Default)]
pub struct ShowTablesLister;

impl TableLister for ShowTablesLister {
    fn name(&self) -> &'static str {
        "show_all_tables"
    }

    fn list(&self, conn: &DbConnection, database: &str) -> Result<Vec<ListedTable>, BackendError> {
        let result = conn.query_with_columns("SHOW ALL TABLES", &[])?;
        let mut tables = Vec::new();
        for row in &result.rows {
            let db: String = row.get_by_name("database")?;
            if db != database {
                continue;
            }
            tables.push(ListedTable::new(
                row.get_by_name("schema")?,
                row.get_by_name("name")?,
            ));
        }
        Ok(tables)
    }
}

/// `SHOW TABLES FROM "<database>"`; the schema is not reported.
#[derive(Debug, Default)]
pub struct ShowTablesFromLister;

impl TableLister for ShowTablesFromLister {
    fn name(&self) -> &'static str {
        "show_tables_from"
    }

    fn list(&self, conn: &DbConnection, database: &str) -> Result<Vec<ListedTable>, BackendError> {
        let rows = conn.query_all(&format!("SHOW TABLES FROM {}", quote_ident(database)), &[])?;
        rows.iter()
            .map(|row| -> Result<ListedTable, BackendError> { Ok(ListedTable::new(None, row.get(0)?)) })
            .collect()
    }
}

/// `information_schema.tables` filtered by catalog.
#[derive(Debug, Default)]
pub struct InformationSchemaLister;

impl TableLister for InformationSchemaLister {
    fn name(&self) -> &'static str {
        "information_schema"
    }

    fn list(&self, conn: &DbConnection, database: &str) -> Result<Vec<ListedTable>, BackendError> {
        let rows = conn.query_all(
            "SELECT table_schema, table_name FROM information_schema.tables WHERE table_catalog = ? ORDER BY table_schema, table_name",
            &[database.into()],
        )?;
        rows.iter()
            .map(|row| -> Result<ListedTable, BackendError> {
                Ok(ListedTable::new(row.get(0)?, row.get(1)?))
            })
            .collect()
    }
}

/// Catalog function first, then the SHOW commands, then information_schema.
pub fn default_listers() -> Vec<Box<dyn TableLister>> {
    vec![
        Box::new(CatalogLister),
        Box::new(ShowTablesLister),
        Box::new(ShowTablesFromLister),
        Box::new(InformationSchemaLister),
    ]
}

/// Try each lister in order; the first non-empty result wins. Errors are
/// logged and skipped, so total failure yields an empty list.
pub fn list_tables(listers: &[Box<dyn TableLister>], conn: &DbConnection, database: &str) -> Vec<ListedTable> {
    for lister in listers {
        match lister.list(conn, database) {
            Ok(tables) if !tables.is_empty() => {
                debug!(lister = lister.name(), database, count = tables.len(), "listed tables");
                return tables;
            }
            Ok(_) => debug!(lister = lister.name(), database, "lister returned no tables"),
            Err(e) => debug!(lister = lister.name(), database, error = %e, "lister failed"),
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Failing;

    impl TableLister for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn list(&self, _conn: &DbConnection, _database: &str) -> Result<Vec<ListedTable>, BackendError> {
            Err(BackendError::Query("no catalog".to_string()))
        }
    }

    struct Empty;

    impl TableLister for Empty {
        fn name(&self) -> &'static str {
            "empty"
        }

        fn list(&self, _conn: &DbConnection, _database: &str) -> Result<Vec<ListedTable>, BackendError> {
            Ok(Vec::new())
        }
    }

    fn attached_conn(temp: &TempDir) -> DbConnection {
        let source_path = temp.path().join("src.duckdb");
        {
            let src = DbConnection::open_duckdb(&source_path).unwrap();
            src.execute_batch("CREATE TABLE a (x INT); CREATE TABLE b (y INT);")
                .unwrap();
        }
        let conn = DbConnection::open_duckdb_memory().unwrap();
        conn.execute_batch(&format!(
            "ATTACH '{}' AS src (READ_ONLY)",
            source_path.display()
        ))
        .unwrap();
        conn
    }

    #[test]
    fn each_strategy_lists_attached_tables() {
        let temp = TempDir::new().unwrap();
        let conn = attached_conn(&temp);

        let catalog = CatalogLister.list(&conn, "src").unwrap();
        assert_eq!(
            catalog,
            vec![
                ListedTable::new(Some("main".to_string()), "a".to_string()),
                ListedTable::new(Some("main".to_string()), "b".to_string()),
            ]
        );

        let mut show_all = ShowTablesLister.list(&conn, "src").unwrap();
        show_all.sort_by(|l, r| l.table.cmp(&r.table));
        assert_eq!(show_all, catalog);

        let info = InformationSchemaLister.list(&conn, "src").unwrap();
        assert_eq!(info, catalog);
    }

    #[test]
    fn falls_through_failures_and_empty_results() {
        let temp = TempDir::new().unwrap();
        let conn = attached_conn(&temp);
        let listers: Vec<Box<dyn TableLister>> =
            vec![Box::new(Failing), Box::new(Empty), Box::new(CatalogLister)];
        assert_eq!(list_tables(&listers, &conn, "src").len(), 2);
    }

    #[test]
    fn all_failing_yields_empty() {
        let conn = DbConnection::open_duckdb_memory().unwrap();
        let listers: Vec<Box<dyn TableLister>> = vec![Box::new(Failing), Box::new(Empty)];
        assert!(list_tables(&listers, &conn, "nothing").is_empty());
    }
}
