//! SourceService: attach/detach, source metadata and table discovery.
//!
//! Every public operation opens exactly one warehouse connection. Attachments
//! live only as long as that connection, so operations that read a source
//! re-attach it first (see [`SourceService::with_sources`]).

use crate::attach::{build_attach_sql, build_detach_sql, normalize_config};
use crate::credentials::{
    mask_connection_string, sanitize_config, CredentialStore, InMemoryCredentialStore,
};
use crate::error::{Result, SourceError};
use crate::listing::{default_listers, list_tables, TableLister};
use crate::registry::{validate_source_name, Registry};
use crate::types::{AttachedSource, ConnectionConfig, SourceTable, SourceType, TableMode};
use duckyard_db::{DbConnection, Warehouse};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Options for [`SourceService::attach_source`].
#[derive(Debug, Clone)]
pub struct AttachOptions {
    pub read_only: bool,
    pub description: Option<String>,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            description: None,
        }
    }
}

/// Public contract over one project's sources, caches and folders.
pub struct SourceService {
    project_id: String,
    warehouse: Warehouse,
    credentials: Arc<dyn CredentialStore>,
    listers: Vec<Box<dyn TableLister>>,
}

impl std::fmt::Debug for SourceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceService")
            .field("project_id", &self.project_id)
            .field("warehouse", &self.warehouse.path())
            .finish()
    }
}

impl SourceService {
    /// Service with a fresh in-memory credential store.
    pub fn new(project_id: impl Into<String>, warehouse_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_credentials(
            project_id,
            warehouse_path,
            Arc::new(InMemoryCredentialStore::new()),
        )
    }

    /// Service sharing `credentials` with other services of the process.
    pub fn with_credentials(
        project_id: impl Into<String>,
        warehouse_path: impl AsRef<Path>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        Ok(Self {
            project_id: project_id.into(),
            warehouse: Warehouse::open(warehouse_path)?,
            credentials,
            listers: default_listers(),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    /// Run `op` on a fresh connection with the metadata schemas in place.
    pub(crate) fn connect<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Registry<'_>) -> Result<T>,
    {
        self.warehouse.with_connection(|conn: &DbConnection| {
            let registry = Registry::open(conn)?;
            op(&registry)
        })
    }

    /// Run `op` on a fresh connection with `names` re-attached.
    ///
    /// An unknown or detached name is `SourceNotFound`; a failed re-attach is
    /// `Attach`. The connection is closed on every exit path.
    pub fn with_sources<T, F>(&self, names: &[&str], op: F) -> Result<T>
    where
        F: FnOnce(&DbConnection) -> Result<T>,
    {
        self.with_attached(names, |registry| op(registry.conn()))
    }

    pub(crate) fn with_attached<T, F>(&self, names: &[&str], op: F) -> Result<T>
    where
        F: FnOnce(&Registry<'_>) -> Result<T>,
    {
        self.connect(|registry| {
            self.attach_all(registry, names)?;
            op(registry)
        })
    }

    /// Re-attach `names` on a connection to this service's warehouse that
    /// the caller opened itself.
    pub fn attach_sources_on(&self, conn: &DbConnection, names: &[&str]) -> Result<()> {
        let registry = Registry::open(conn)?;
        self.attach_all(&registry, names)
    }

    fn attach_all(&self, registry: &Registry<'_>, names: &[&str]) -> Result<()> {
        for name in names {
            let source = registry
                .get_source(name)?
                .ok_or_else(|| SourceError::SourceNotFound((*name).to_string()))?;
            self.reattach(registry.conn(), &source)?;
        }
        Ok(())
    }

    /// Attach `source` on `conn` using vault credentials when present.
    ///
    /// Without a vault entry (e.g. after a restart) the sanitized config is
    /// used, which fails for sources that need a password.
    pub(crate) fn reattach(&self, conn: &DbConnection, source: &AttachedSource) -> Result<()> {
        let config = match self.credentials.get(&self.project_id, &source.name) {
            Some(full) => full,
            None => {
                debug!(source = %source.name, "no vault entry, re-attaching with sanitized config");
                source.connection_config.clone()
            }
        };
        let sql = build_attach_sql(&source.name, source.source_type, &config, true)?;
        conn.execute_batch(&sql).map_err(|e| SourceError::Attach {
            name: source.name.clone(),
            message: mask_connection_string(&e.to_string()),
        })
    }

    // ========================================================================
    // Attach / detach
    // ========================================================================

    /// Attach an external database under `name`.
    ///
    /// The attach runs against a live connection first. On success the full
    /// config goes to the credential store and a sanitized row is upserted.
    /// On failure a status=error row is upserted and `Attach` is returned.
    pub fn attach_source(
        &self,
        name: &str,
        source_type: SourceType,
        config: ConnectionConfig,
        options: AttachOptions,
    ) -> Result<AttachedSource> {
        validate_source_name(name)?;
        let config = normalize_config(config);
        let attach_sql = build_attach_sql(name, source_type, &config, options.read_only)?;
        let sanitized = sanitize_config(&config);
        let description = options.description.as_deref();

        self.connect(|registry| match registry.conn().execute_batch(&attach_sql) {
            Ok(()) => {
                self.credentials.put(&self.project_id, name, config.clone());
                registry.upsert_attached(name, source_type, &sanitized, &self.project_id, description)?;
                info!(source = name, source_type = %source_type, config = ?sanitized, "attached source");
                registry
                    .get_source(name)?
                    .ok_or_else(|| SourceError::SourceNotFound(name.to_string()))
            }
            Err(e) => {
                // Engine errors may echo the conninfo string back.
                let message = mask_connection_string(&e.to_string());
                warn!(source = name, source_type = %source_type, error = %message, "attach failed");
                registry.upsert_attach_error(
                    name,
                    source_type,
                    &sanitized,
                    &self.project_id,
                    description,
                    &message,
                )?;
                Err(SourceError::Attach {
                    name: name.to_string(),
                    message,
                })
            }
        })
    }

    /// Forget credentials and soft-delete the registration.
    ///
    /// Returns false when no non-detached row exists.
    pub fn detach_source(&self, name: &str) -> Result<bool> {
        self.credentials.delete(&self.project_id, name);
        self.connect(|registry| {
            if registry.get_source(name)?.is_none() {
                return Ok(false);
            }
            if let Err(e) = registry.conn().execute_batch(&build_detach_sql(name)) {
                debug!(source = name, error = %e, "DETACH ignored");
            }
            let detached = registry.mark_detached(name)?;
            if detached {
                info!(source = name, "detached source");
            }
            Ok(detached)
        })
    }

    pub fn list_sources(&self) -> Result<Vec<AttachedSource>> {
        self.connect(|registry| registry.list_sources())
    }

    pub fn get_source(&self, name: &str) -> Result<Option<AttachedSource>> {
        self.connect(|registry| registry.get_source(name))
    }

    /// Update the description. `None` leaves the row untouched.
    pub fn update_source(&self, name: &str, description: Option<&str>) -> Result<Option<AttachedSource>> {
        self.connect(|registry| {
            if let Some(description) = description {
                registry.update_description(name, Some(description))?;
            }
            registry.get_source(name)
        })
    }

    // ========================================================================
    // Table discovery
    // ========================================================================

    /// Tables reachable through `source_name`, classified live or cached.
    ///
    /// A source that fails to re-attach yields an empty list.
    pub fn list_source_tables(&self, source_name: &str) -> Result<Vec<SourceTable>> {
        self.connect(|registry| {
            let source = registry
                .get_source(source_name)?
                .ok_or_else(|| SourceError::SourceNotFound(source_name.to_string()))?;

            let listed = match self.reattach(registry.conn(), &source) {
                Ok(()) => list_tables(&self.listers, registry.conn(), source_name),
                Err(e) => {
                    warn!(source = source_name, error = %e, "re-attach failed, no tables listed");
                    Vec::new()
                }
            };

            let cached: HashMap<String, String> = registry
                .list_cached_tables(Some(source_name))?
                .into_iter()
                .map(|c| (c.source_table, c.local_table))
                .collect();

            Ok(listed
                .into_iter()
                .map(|t| {
                    let mut table = SourceTable {
                        source_name: source_name.to_string(),
                        schema: t.schema,
                        table_name: t.table,
                        mode: TableMode::Live,
                        local_table: None,
                    };
                    let local = cached
                        .get(&table.qualified_name())
                        .or_else(|| cached.get(&table.table_name));
                    if let Some(local) = local {
                        table.mode = TableMode::Cached;
                        table.local_table = Some(local.clone());
                    }
                    table
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(value: serde_json::Value) -> ConnectionConfig {
        value.as_object().cloned().unwrap()
    }

    fn service(temp: &TempDir) -> SourceService {
        SourceService::new("p1", temp.path().join("warehouse.duckdb")).unwrap()
    }

    fn source_file(temp: &TempDir) -> String {
        let path = temp.path().join("shop.duckdb");
        let conn = DbConnection::open_duckdb(&path).unwrap();
        conn.execute_batch("CREATE TABLE orders (id INT); INSERT INTO orders VALUES (1), (2);")
            .unwrap();
        path.display().to_string()
    }

    #[test]
    fn invalid_name_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let err = svc
            .attach_source(
                "1bad-name",
                SourceType::Duckdb,
                config(json!({"path": "/nowhere.duckdb"})),
                AttachOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::Validation(_)));
        assert!(svc.list_sources().unwrap().is_empty());
    }

    #[test]
    fn reserved_name_rejected() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let err = svc
            .attach_source(
                "main",
                SourceType::Duckdb,
                config(json!({"path": "/x.duckdb"})),
                AttachOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::Validation(_)));
    }

    #[test]
    fn failed_attach_records_error_row() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let missing = temp.path().join("missing").join("nope.duckdb");
        let err = svc
            .attach_source(
                "ghost",
                SourceType::Duckdb,
                config(json!({"path": missing.display().to_string()})),
                AttachOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SourceError::Attach { ref name, .. } if name == "ghost"));

        let row = svc.get_source("ghost").unwrap().unwrap();
        assert_eq!(row.status, crate::types::SourceStatus::Error);
        assert!(row.error_message.is_some());
    }

    #[test]
    fn attach_detach_cycle() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let path = source_file(&temp);

        let attached = svc
            .attach_source(
                "shop",
                SourceType::Duckdb,
                config(json!({"path": path})),
                AttachOptions {
                    read_only: true,
                    description: Some("orders db".to_string()),
                },
            )
            .unwrap();
        assert_eq!(attached.status, crate::types::SourceStatus::Attached);
        assert_eq!(attached.description.as_deref(), Some("orders db"));
        assert_eq!(attached.table_count, 0);

        let updated = svc.update_source("shop", Some("renamed")).unwrap().unwrap();
        assert_eq!(updated.description.as_deref(), Some("renamed"));

        assert!(svc.detach_source("shop").unwrap());
        assert!(!svc.detach_source("shop").unwrap());
        assert!(svc.get_source("shop").unwrap().is_none());
        assert!(svc.update_source("shop", Some("x")).unwrap().is_none());
    }

    #[test]
    fn with_sources_reattaches_on_each_connection() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let path = source_file(&temp);
        svc.attach_source(
            "shop",
            SourceType::Duckdb,
            config(json!({"path": path})),
            AttachOptions::default(),
        )
        .unwrap();

        for _ in 0..2 {
            let count: i64 = svc
                .with_sources(&["shop"], |conn| {
                    Ok(conn.query_scalar("SELECT COUNT(*) FROM shop.orders", &[])?)
                })
                .unwrap();
            assert_eq!(count, 2);
        }

        let err = svc.with_sources(&["nope"], |_| Ok(())).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn unknown_source_tables_is_not_found() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        assert!(svc.list_source_tables("nope").unwrap_err().is_not_found());
    }
}
