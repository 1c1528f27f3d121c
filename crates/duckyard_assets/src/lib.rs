//! Declarative analyses and file assets for duckyard.
//!
//! An analysis is named, parameterized SQL with a materialization (view,
//! table, append or parquet) and typed dependencies on other analyses,
//! attached sources and imported files. The planner decides from run
//! history which analyses in a dependency closure are stale, and the
//! executor recomputes exactly those, in dependency order.
//!
//! File assets are CSV or Parquet files loaded into warehouse tables, in
//! replace, append or merge mode.
//!
//! Query jobs run ad-hoc SQL and keep row results as warehouse tables
//! until they are cleaned up.

pub mod deps;
pub mod error;
pub mod executor;
pub mod files;
pub mod lineage;
pub mod params;
pub mod planner;
pub mod queries;
pub mod service;
pub mod store;
pub mod types;

pub use deps::detect_analysis_refs;
pub use error::{AssetError, Result};
pub use executor::{NoSources, RunContext, SourceAttacher};
pub use files::{FileAssetService, FileCatalog, ImportOptions};
pub use params::bind_parameters;
pub use planner::Planner;
pub use queries::{QueryService, DEFAULT_QUERY_RETENTION_HOURS};
pub use service::{AssetService, DEFAULT_HISTORY_LIMIT};
pub use store::AnalysisStore;
pub use types::*;
