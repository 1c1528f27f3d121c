//! File command - import CSV and Parquet files as warehouse tables

use crate::cli::context::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_size, format_time, or_dash, print_json, print_preview, print_table};
use anyhow::Result;
use clap::{Subcommand, ValueEnum};
use duckyard_assets::{FileAsset, FileType, ImportMode, ImportOptions};
use std::path::PathBuf;

#[derive(Subcommand, Debug, Clone)]
pub enum FileAction {
    /// Load a CSV or Parquet file into main.<table>
    Import {
        path: PathBuf,
        /// Default: from the extension
        #[arg(long = "type", value_enum, ignore_case = true)]
        file_type: Option<FileTypeArg>,
        /// Target table (default: the file name, sanitized)
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_enum, ignore_case = true, default_value_t = ImportModeArg::Replace)]
        mode: ImportModeArg,
        /// Let replace overwrite an existing table
        #[arg(long)]
        overwrite: bool,
        /// Key column for merge; repeat for composite keys
        #[arg(long = "merge-key")]
        merge_keys: Vec<String>,
    },
    /// List imported files
    List,
    /// Forget an imported file
    Remove {
        id: String,
        /// Leave the table in the warehouse
        #[arg(long)]
        keep_table: bool,
    },
    /// Re-import a file from its original path
    Refresh { id: String },
    /// Columns of an imported table
    Schema { id: String },
    /// First rows of an imported table
    Preview {
        id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FileTypeArg {
    Csv,
    Parquet,
}

impl From<FileTypeArg> for FileType {
    fn from(arg: FileTypeArg) -> Self {
        match arg {
            FileTypeArg::Csv => FileType::Csv,
            FileTypeArg::Parquet => FileType::Parquet,
        }
    }
}

/// What an import does when the target table already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ImportModeArg {
    /// Recreate the table (requires --overwrite)
    Replace,
    /// Insert rows; columns must match
    Append,
    /// Delete rows matching --merge-key, then insert
    Merge,
}

impl From<ImportModeArg> for ImportMode {
    fn from(arg: ImportModeArg) -> Self {
        match arg {
            ImportModeArg::Replace => ImportMode::Replace,
            ImportModeArg::Append => ImportMode::Append,
            ImportModeArg::Merge => ImportMode::Merge,
        }
    }
}

pub fn run(ctx: &CliContext, action: FileAction) -> Result<()> {
    let files = ctx.files()?;
    match action {
        FileAction::Import {
            path,
            file_type,
            table,
            name,
            description,
            mode,
            overwrite,
            merge_keys,
        } => {
            let file_type = file_type.map(FileType::from);
            let mode = ImportMode::from(mode);
            let file = files.import_file(
                &path,
                ImportOptions {
                    file_type,
                    table_name: table,
                    name,
                    description,
                    mode,
                    overwrite,
                    merge_keys,
                },
            )?;
            if ctx.json() {
                return print_json(&file);
            }
            println!(
                "Imported {} into main.{} ({} rows, {})",
                file.file_path,
                file.table_name,
                or_dash(file.row_count),
                mode.as_str()
            );
            Ok(())
        }
        FileAction::List => {
            let assets = files.list_files()?;
            if ctx.json() {
                return print_json(&assets);
            }
            let rows = assets.iter().map(file_row).collect();
            print_table(
                &["Id", "Table", "Type", "Rows", "Size", "Path", "Updated"],
                rows,
            );
            Ok(())
        }
        FileAction::Remove { id, keep_table } => {
            if !files.delete_file(&id, !keep_table)? {
                return Err(HelpfulError::file_not_found(&id).into());
            }
            if ctx.json() {
                return print_json(&serde_json::json!({ "removed": id }));
            }
            println!("Removed file {}", id);
            Ok(())
        }
        FileAction::Refresh { id } => {
            let file = files.refresh_file(&id)?;
            if ctx.json() {
                return print_json(&file);
            }
            println!("Refreshed main.{} ({} rows)", file.table_name, or_dash(file.row_count));
            Ok(())
        }
        FileAction::Schema { id } => {
            let columns = files.get_table_schema(&id)?;
            if ctx.json() {
                return print_json(&columns);
            }
            let rows = columns
                .iter()
                .map(|c| {
                    vec![
                        c.column_name.clone(),
                        c.column_type.clone(),
                        if c.nullable { "yes" } else { "no" }.to_string(),
                    ]
                })
                .collect();
            print_table(&["Column", "Type", "Nullable"], rows);
            Ok(())
        }
        FileAction::Preview { id, limit } => {
            let limit = limit.unwrap_or(ctx.config().cache_preview_limit);
            let preview = files.preview_file_data(&id, limit)?;
            if ctx.json() {
                return print_json(&preview);
            }
            print_preview(&preview);
            Ok(())
        }
    }
}

fn file_row(file: &FileAsset) -> Vec<String> {
    vec![
        file.id.clone(),
        file.table_name.clone(),
        file.file_type.as_str().to_string(),
        or_dash(file.row_count),
        file.file_size_bytes
            .map(|b| format_size(b.max(0) as u64))
            .unwrap_or_else(|| "-".to_string()),
        file.file_path.clone(),
        format_time(&file.updated_at),
    ]
}
