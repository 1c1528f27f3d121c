//! Cache command - local copies of source tables

use crate::cli::context::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_opt_time, format_time, or_dash, print_json, print_preview, print_table};
use anyhow::Result;
use clap::Subcommand;
use duckyard_sources::CacheOptions;

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Copy SOURCE's TABLE into the cache schema
    Create {
        source: String,
        /// Table inside the source, optionally schema-qualified
        table: String,
        /// Local table name (default: <source>_<table>)
        #[arg(long = "as")]
        local_table: Option<String>,
        /// WHERE-clause fragment applied while copying
        #[arg(long)]
        filter: Option<String>,
        /// Expire the copy after this many hours
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
    /// Re-copy a cached table with its original filter and TTL
    Refresh { local_table: String },
    /// Drop a cached table and its metadata
    Drop { local_table: String },
    /// List cached tables
    List {
        #[arg(long)]
        source: Option<String>,
    },
    /// Show the first rows of a cached table
    Preview {
        local_table: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Drop every expired cached table
    Cleanup,
    /// Compare cache tables against cache metadata
    Reconcile {
        /// Drop orphan tables and stale metadata rows
        #[arg(long)]
        repair: bool,
    },
}

pub fn run(ctx: &CliContext, action: CacheAction) -> Result<()> {
    let sources = ctx.sources()?;
    match action {
        CacheAction::Create {
            source,
            table,
            local_table,
            filter,
            ttl_hours,
        } => {
            let cached = sources.cache_table(
                &source,
                &table,
                CacheOptions {
                    local_table,
                    filter_sql: filter,
                    expires_hours: ttl_hours,
                },
            )?;
            if ctx.json() {
                return print_json(&cached);
            }
            println!(
                "Cached {}.{} as {} ({} rows)",
                cached.source_name,
                cached.source_table,
                cached.table_ref(),
                cached.row_count
            );
            Ok(())
        }
        CacheAction::Refresh { local_table } => {
            let cached = sources.refresh_cache(&local_table)?;
            if ctx.json() {
                return print_json(&cached);
            }
            println!("Refreshed {} ({} rows)", cached.table_ref(), cached.row_count);
            Ok(())
        }
        CacheAction::Drop { local_table } => {
            if !sources.drop_cache(&local_table)? {
                return Err(HelpfulError::cache_not_found(&local_table).into());
            }
            if ctx.json() {
                return print_json(&serde_json::json!({ "dropped": local_table }));
            }
            println!("Dropped cache table {}", local_table);
            Ok(())
        }
        CacheAction::List { source } => {
            let cached = sources.list_cached_tables(source.as_deref())?;
            if ctx.json() {
                return print_json(&cached);
            }
            let rows = cached
                .iter()
                .map(|c| {
                    vec![
                        c.local_table.clone(),
                        format!("{}.{}", c.source_name, c.source_table),
                        c.row_count.to_string(),
                        format_time(&c.cached_at),
                        format_opt_time(c.expires_at.as_ref()),
                        or_dash(c.filter_sql.as_deref()),
                    ]
                })
                .collect();
            print_table(
                &["Local table", "Source table", "Rows", "Cached", "Expires", "Filter"],
                rows,
            );
            Ok(())
        }
        CacheAction::Preview { local_table, limit } => {
            let limit = limit.unwrap_or(ctx.config().cache_preview_limit);
            let preview = sources.preview_cached_table(&local_table, limit)?;
            if ctx.json() {
                return print_json(&preview);
            }
            print_preview(&preview);
            Ok(())
        }
        CacheAction::Cleanup => {
            let dropped = sources.cleanup_expired_caches()?;
            if ctx.json() {
                return print_json(&serde_json::json!({ "dropped": dropped }));
            }
            println!("Dropped {} expired cache table(s)", dropped);
            Ok(())
        }
        CacheAction::Reconcile { repair } => {
            let report = if repair {
                sources.reconcile_cache_and_repair()?
            } else {
                sources.reconcile_cache()?
            };
            if ctx.json() {
                return print_json(&report);
            }
            if report.is_clean() {
                println!("Cache is consistent");
                return Ok(());
            }
            let verb = if repair { "Dropped" } else { "Found" };
            for table in &report.orphan_tables {
                println!("{} orphan table: {}", verb, table);
            }
            for table in &report.missing_tables {
                println!("{} metadata without table: {}", verb, table);
            }
            if !repair {
                println!("Run with --repair to clean up");
            }
            Ok(())
        }
    }
}
