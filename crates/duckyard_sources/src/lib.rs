//! Source federation for duckyard.
//!
//! External databases are attached to the project warehouse under an alias,
//! their tables can be copied into a local `cache` schema with optional
//! filters and TTLs, and local directories can be registered as folder
//! sources whose contents are scanned for changes.
//!
//! Attachments are scoped to a single DuckDB connection. [`SourceService`]
//! re-attaches sources on every connection that needs them, using full
//! credentials from a [`CredentialStore`] and falling back to the sanitized
//! config persisted in `_sources.attached`.

pub mod attach;
pub mod cache;
pub mod credentials;
pub mod dsn;
pub mod error;
pub mod folders;
pub mod listing;
pub mod patterns;
pub mod registry;
pub mod service;
pub mod types;

/// Schema holding materialized cache tables.
pub const CACHE_SCHEMA: &str = "cache";

pub use cache::{default_local_name, preview_table, CacheOptions};
pub use credentials::{
    mask_connection_string, sanitize_config, CredentialStore, InMemoryCredentialStore, SECRET_MASK,
};
pub use dsn::{parse_postgres_dsn, PostgresDsn};
pub use error::{Result, SourceError};
pub use folders::{diff_snapshots, DEFAULT_FILE_LIMIT, DEFAULT_SCAN_LIMIT};
pub use listing::{ListedTable, TableLister};
pub use registry::{validate_source_name, RESERVED_NAMES};
pub use service::{AttachOptions, SourceService};
pub use types::*;
