//! ATTACH/DETACH statement builders.
//!
//! Attachments are connection-scoped in DuckDB, so these statements run on
//! every fresh connection that needs a source.

use crate::credentials::{config_str, normalize_local_path};
use crate::dsn::NetworkSettings;
use crate::error::{Result, SourceError};
use crate::types::{ConnectionConfig, SourceType};
use duckyard_db::{quote_ident, quote_literal};

/// Build the statement batch that attaches `name` for `source_type`.
///
/// File-based sources require a `path`; network sources resolve their
/// settings permissively.
pub fn build_attach_sql(
    name: &str,
    source_type: SourceType,
    config: &ConnectionConfig,
    read_only: bool,
) -> Result<String> {
    let alias = quote_ident(name);
    let mut options: Vec<String> = Vec::new();

    let target = match source_type {
        SourceType::Duckdb => local_path(config, source_type)?,
        SourceType::Sqlite => {
            options.push("TYPE SQLITE".to_string());
            local_path(config, source_type)?
        }
        SourceType::Postgres => {
            let settings = NetworkSettings::postgres(config);
            options.push("TYPE POSTGRES".to_string());
            options.push(format!("SCHEMA {}", quote_literal(&settings.schema)));
            settings.conninfo("dbname")
        }
        SourceType::Mysql => {
            options.push("TYPE MYSQL".to_string());
            NetworkSettings::mysql(config).conninfo("database")
        }
    };
    if read_only {
        options.push("READ_ONLY".to_string());
    }

    let mut sql = String::new();
    if let Some(extension) = source_type.extension() {
        sql.push_str(&format!("INSTALL {ext}; LOAD {ext}; ", ext = extension));
    }
    sql.push_str(&format!("ATTACH {} AS {}", quote_literal(&target), alias));
    if !options.is_empty() {
        sql.push_str(&format!(" ({})", options.join(", ")));
    }
    Ok(sql)
}

/// Best-effort detach; callers ignore failures.
pub fn build_detach_sql(name: &str) -> String {
    format!("DETACH DATABASE IF EXISTS {}", quote_ident(name))
}

/// Normalize a config before use: local paths lose wrapping quotes.
pub fn normalize_config(config: ConnectionConfig) -> ConnectionConfig {
    config
        .into_iter()
        .map(|(key, value)| {
            if key == "path" {
                if let serde_json::Value::String(path) = &value {
                    let cleaned = normalize_local_path(path);
                    return (key, serde_json::Value::String(cleaned));
                }
            }
            (key, value)
        })
        .collect()
}

fn local_path(config: &ConnectionConfig, source_type: SourceType) -> Result<String> {
    config_str(config, "path")
        .map(|p| normalize_local_path(&p))
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            SourceError::validation(format!(
                "'path' is required for {} sources",
                source_type.as_str()
            ))
        })
}
