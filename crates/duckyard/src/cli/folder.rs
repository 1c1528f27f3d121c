//! Folder command - local directories of data files

use crate::cli::context::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_opt_time, format_size, format_time, or_dash, print_json, print_table};
use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use duckyard_db::millis_to_datetime;
use duckyard_sources::{AllowedTypes, FolderSource, SourceService};

#[derive(Subcommand, Debug, Clone)]
pub enum FolderAction {
    /// Register PATH as folder source NAME (re-adding a name updates it)
    Add {
        name: String,
        path: String,
        #[arg(long = "types", value_enum, ignore_case = true, default_value_t = FileTypesArg::Both)]
        allowed_types: FileTypesArg,
        /// Glob on file names, e.g. "sales_*"
        #[arg(long)]
        pattern: Option<String>,
    },
    /// List folder sources
    List,
    /// Remove a folder source; files on disk are untouched
    Remove { folder: String },
    /// List matching files, newest first
    Files {
        folder: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Report new, changed and deleted files since the previous scan
    Scan {
        folder: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

/// File kinds a folder source lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FileTypesArg {
    Csv,
    Parquet,
    Both,
}

impl From<FileTypesArg> for AllowedTypes {
    fn from(arg: FileTypesArg) -> Self {
        match arg {
            FileTypesArg::Csv => AllowedTypes::Csv,
            FileTypesArg::Parquet => AllowedTypes::Parquet,
            FileTypesArg::Both => AllowedTypes::Both,
        }
    }
}

pub fn run(ctx: &CliContext, action: FolderAction) -> Result<()> {
    let sources = ctx.sources()?;
    match action {
        FolderAction::Add {
            name,
            path,
            allowed_types,
            pattern,
        } => {
            let folder = sources.create_folder_source(
                &name,
                &path,
                allowed_types.into(),
                pattern.as_deref(),
            )?;
            if ctx.json() {
                return print_json(&folder);
            }
            println!("Registered folder {} ({}) as {}", folder.name, folder.path, folder.id);
            Ok(())
        }
        FolderAction::List => {
            let folders = sources.list_folder_sources()?;
            if ctx.json() {
                return print_json(&folders);
            }
            let rows = folders
                .iter()
                .map(|f| {
                    vec![
                        f.id.clone(),
                        f.name.clone(),
                        f.path.clone(),
                        f.allowed_types.as_str().to_string(),
                        or_dash(f.pattern.as_deref()),
                        format_opt_time(f.last_scanned_at.as_ref()),
                    ]
                })
                .collect();
            print_table(&["Id", "Name", "Path", "Types", "Pattern", "Last scan"], rows);
            Ok(())
        }
        FolderAction::Remove { folder } => {
            let folder = resolve_folder(&sources, &folder)?;
            sources.delete_folder_source(&folder.id)?;
            if ctx.json() {
                return print_json(&serde_json::json!({ "removed": folder.id }));
            }
            println!("Removed folder {} ({})", folder.name, folder.id);
            Ok(())
        }
        FolderAction::Files { folder, limit } => {
            let folder = resolve_folder(&sources, &folder)?;
            let limit = limit.unwrap_or(ctx.config().folder_file_limit);
            let files = sources.list_folder_files(&folder.id, Some(limit))?;
            if ctx.json() {
                return print_json(&files);
            }
            let rows = files
                .iter()
                .map(|f| {
                    vec![
                        f.name.clone(),
                        f.file_type.clone(),
                        format_size(f.size_bytes),
                        format_time(&millis_to_datetime(f.modified_at)),
                    ]
                })
                .collect();
            print_table(&["Name", "Type", "Size", "Modified"], rows);
            Ok(())
        }
        FolderAction::Scan { folder, limit } => {
            let folder = resolve_folder(&sources, &folder)?;
            let limit = limit.unwrap_or(ctx.config().folder_scan_limit);
            let scan = sources.scan_folder_source_with_limit(&folder.id, limit)?;
            if ctx.json() {
                return print_json(&scan);
            }
            println!(
                "{}: {} new, {} changed, {} deleted",
                folder.name, scan.new_files, scan.changed_files, scan.deleted_files
            );
            for path in &scan.new_file_paths {
                println!("  + {}", path);
            }
            for path in &scan.changed_file_paths {
                println!("  ~ {}", path);
            }
            for path in &scan.deleted_file_paths {
                println!("  - {}", path);
            }
            Ok(())
        }
    }
}

/// Look a folder up by id, then by name.
fn resolve_folder(sources: &SourceService, key: &str) -> Result<FolderSource> {
    if let Some(folder) = sources.get_folder_source(key)? {
        return Ok(folder);
    }
    sources
        .list_folder_sources()?
        .into_iter()
        .find(|f| f.name == key)
        .ok_or_else(|| HelpfulError::folder_not_found(key).into())
}
