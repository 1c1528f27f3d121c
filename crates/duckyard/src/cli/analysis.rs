//! Analysis command - define, plan and run SQL analyses

use crate::cli::context::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{
    format_opt_time, format_time, or_dash, print_json, print_preview, print_table,
};
use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use duckyard_assets::{
    Analysis, AnalysisUpdate, AssetService, DependencyRef, ExecutionPlan, ExecutionResult,
    Materialization, NewAnalysis, ParamValues, ParameterDef, StepStatus,
};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug, Clone)]
pub enum AnalysisAction {
    /// Define a new analysis
    Create {
        id: String,
        #[command(flatten)]
        sql: SqlInput,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, short = 'm', value_enum, ignore_case = true, default_value_t = MaterializationArg::View)]
        materialization: MaterializationArg,
        /// NAME[:TYPE][=DEFAULT]; no default means required
        #[arg(long = "param")]
        params: Vec<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// TYPE:NAME with TYPE analysis, source or file
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// Change an analysis; omitted flags keep their value
    Update {
        id: String,
        #[command(flatten)]
        sql: OptionalSqlInput,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, short = 'm', value_enum, ignore_case = true)]
        materialization: Option<MaterializationArg>,
        /// Replaces all tags when given
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List analyses
    List {
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show an analysis definition
    Show { id: String },
    /// Delete an analysis and its result; run history is kept
    Delete { id: String },
    /// Show what a run would recompute, and why
    Compile {
        id: String,
        /// KEY=VALUE parameter for this run
        #[arg(long = "set")]
        params: Vec<String>,
        #[arg(long)]
        force: bool,
    },
    /// Recompute stale analyses up to and including ID
    Run {
        id: String,
        #[arg(long = "set")]
        params: Vec<String>,
        /// Recompute ID even when it is fresh
        #[arg(long)]
        force: bool,
        /// Keep going after a failed step
        #[arg(long)]
        continue_on_failure: bool,
    },
    /// Is the stored result up to date?
    Freshness { id: String },
    /// Direct upstream and downstream neighbours
    Lineage { id: String },
    /// Lineage of every analysis in the project
    Graph,
    /// Recent runs, newest first
    History {
        id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rows of the stored result
    Data {
        id: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Run, then write the result as CSV
    Export {
        id: String,
        /// Output file; `.csv` is appended when missing
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

/// `--sql` or `--sql-file`, exactly one
#[derive(clap::Args, Debug, Clone)]
#[group(required = true, multiple = false)]
pub struct SqlInput {
    #[arg(long)]
    pub sql: Option<String>,
    #[arg(long)]
    pub sql_file: Option<PathBuf>,
}

#[derive(clap::Args, Debug, Clone)]
#[group(required = false, multiple = false)]
pub struct OptionalSqlInput {
    #[arg(long)]
    sql: Option<String>,
    #[arg(long)]
    sql_file: Option<PathBuf>,
}

/// How a run stores an analysis result
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MaterializationArg {
    View,
    Table,
    Append,
    Parquet,
}

impl From<MaterializationArg> for Materialization {
    fn from(arg: MaterializationArg) -> Self {
        match arg {
            MaterializationArg::View => Materialization::View,
            MaterializationArg::Table => Materialization::Table,
            MaterializationArg::Append => Materialization::Append,
            MaterializationArg::Parquet => Materialization::Parquet,
        }
    }
}

pub fn run(ctx: &CliContext, action: AnalysisAction) -> Result<()> {
    let assets = ctx.assets()?;
    match action {
        AnalysisAction::Create {
            id,
            sql,
            name,
            description,
            materialization,
            params,
            tags,
            depends_on,
        } => {
            let sql = read_sql(sql.sql, sql.sql_file)?.ok_or_else(|| {
                HelpfulError::new("SQL is required")
                    .with_suggestion("TRY: --sql '...' or --sql-file query.sql")
            })?;
            let new = NewAnalysis {
                id,
                name,
                sql,
                description,
                materialization: materialization.into(),
                parameters: params
                    .iter()
                    .map(|p| parse_param_def(p))
                    .collect::<Result<_, _>>()?,
                tags,
                depends_on: depends_on
                    .iter()
                    .map(|d| parse_dependency(d))
                    .collect::<Result<_, _>>()?,
            };
            let created = assets.create_analysis(new)?;
            if ctx.json() {
                return print_json(&created);
            }
            println!(
                "Created analysis {} ({}) -> {}",
                created.id, created.materialization, created.result_table
            );
            Ok(())
        }
        AnalysisAction::Update {
            id,
            sql,
            name,
            description,
            materialization,
            tags,
        } => {
            let update = AnalysisUpdate {
                name,
                sql: read_sql(sql.sql, sql.sql_file)?,
                description,
                materialization: materialization.map(Materialization::from),
                tags: if tags.is_empty() { None } else { Some(tags) },
                ..AnalysisUpdate::default()
            };
            let updated = assets.update_analysis(&id, update)?;
            if ctx.json() {
                return print_json(&updated);
            }
            println!("Updated analysis {}", updated.id);
            Ok(())
        }
        AnalysisAction::List { tag } => {
            let analyses = assets.list_analyses(tag.as_deref())?;
            if ctx.json() {
                return print_json(&analyses);
            }
            let rows = analyses
                .iter()
                .map(|a| {
                    vec![
                        a.id.clone(),
                        a.name.clone(),
                        a.materialization.to_string(),
                        a.tags.join(", "),
                        format_time(&a.updated_at),
                    ]
                })
                .collect();
            print_table(&["Id", "Name", "Materialization", "Tags", "Updated"], rows);
            Ok(())
        }
        AnalysisAction::Show { id } => {
            let analysis = require(&assets, &id)?;
            if ctx.json() {
                return print_json(&analysis);
            }
            print_analysis(&analysis);
            Ok(())
        }
        AnalysisAction::Delete { id } => {
            if !assets.delete_analysis(&id)? {
                return Err(HelpfulError::analysis_not_found(&id).into());
            }
            if ctx.json() {
                return print_json(&serde_json::json!({ "deleted": id }));
            }
            println!("Deleted analysis {}", id);
            Ok(())
        }
        AnalysisAction::Compile { id, params, force } => {
            let params = parse_assignments(&params)?;
            let plan = assets.compile_analysis(&id, &params, force)?;
            if ctx.json() {
                return print_json(&plan);
            }
            print_plan(&plan);
            Ok(())
        }
        AnalysisAction::Run {
            id,
            params,
            force,
            continue_on_failure,
        } => {
            let params = parse_assignments(&params)?;
            let result = assets.run_analysis(&id, &params, force, continue_on_failure)?;
            if ctx.json() {
                return print_json(&result);
            }
            print_run(&result);
            match result.first_failure() {
                None => Ok(()),
                Some(failed) => Err(HelpfulError::new(format!(
                    "Analysis {} failed",
                    failed.analysis_id
                ))
                .with_context(failed.error.clone().unwrap_or_default())
                .with_suggestion(format!(
                    "TRY: Inspect it: duckyard analysis show {}",
                    failed.analysis_id
                ))
                .into()),
            }
        }
        AnalysisAction::Freshness { id } => {
            let freshness = assets.get_freshness(&id)?;
            if ctx.json() {
                return print_json(&freshness);
            }
            let state = if freshness.is_stale { "stale" } else { "fresh" };
            println!("{}: {}", freshness.analysis_id, state);
            println!("Last run: {}", format_opt_time(freshness.last_run_at.as_ref()));
            if let Some(reason) = &freshness.stale_reason {
                println!("Reason:   {}", reason);
            }
            Ok(())
        }
        AnalysisAction::Lineage { id } => {
            let lineage = assets.get_lineage(&id)?;
            if ctx.json() {
                return print_json(&lineage);
            }
            println!("Upstream of {}:", lineage.analysis_id);
            for node in &lineage.upstream {
                println!("  <- {}", node.full);
            }
            println!("Downstream of {}:", lineage.analysis_id);
            for node in &lineage.downstream {
                println!("  -> {}", node.full);
            }
            Ok(())
        }
        AnalysisAction::Graph => {
            let graph = assets.get_lineage_graph()?;
            if ctx.json() {
                return print_json(&graph);
            }
            let rows = graph
                .nodes
                .iter()
                .map(|n| {
                    vec![
                        n.id.clone(),
                        or_dash(n.materialization),
                        match n.is_stale {
                            Some(true) => "stale".to_string(),
                            Some(false) => "fresh".to_string(),
                            None => "-".to_string(),
                        },
                        format_opt_time(n.last_run_at.as_ref()),
                    ]
                })
                .collect();
            print_table(&["Node", "Materialization", "State", "Last run"], rows);
            for edge in &graph.edges {
                println!("{} -> {}", edge.source, edge.target);
            }
            Ok(())
        }
        AnalysisAction::History { id, limit } => {
            let history = assets.get_run_history(&id, limit)?;
            if ctx.json() {
                return print_json(&history);
            }
            let rows = history
                .iter()
                .map(|r| {
                    vec![
                        r.run_id.clone(),
                        r.status.as_str().to_string(),
                        format_time(&r.started_at),
                        format!("{} ms", r.duration_ms),
                        or_dash(r.rows_affected),
                        or_dash(r.error_message.as_deref()),
                    ]
                })
                .collect();
            print_table(&["Run", "Status", "Started", "Duration", "Rows", "Error"], rows);
            Ok(())
        }
        AnalysisAction::Data { id, limit, offset } => {
            let limit = limit.unwrap_or(ctx.config().cache_preview_limit);
            let preview = assets.get_analysis_data(&id, limit, offset)?;
            if ctx.json() {
                return print_json(&preview);
            }
            print_preview(&preview);
            Ok(())
        }
        AnalysisAction::Export { id, path, force } => {
            let path = absolute(&path)?;
            let export = assets.export_analysis_csv(&id, &path, force)?;
            if ctx.json() {
                return print_json(&export);
            }
            println!("Wrote {} rows to {}", export.rows, export.path);
            Ok(())
        }
    }
}

fn require(assets: &AssetService, id: &str) -> Result<Analysis> {
    assets
        .get_analysis(id)?
        .ok_or_else(|| HelpfulError::analysis_not_found(id).into())
}

pub(crate) fn read_sql(sql: Option<String>, sql_file: Option<PathBuf>) -> Result<Option<String>> {
    match (sql, sql_file) {
        (Some(sql), _) => Ok(Some(sql)),
        (None, Some(file)) => std::fs::read_to_string(&file)
            .map(Some)
            .with_context(|| format!("Failed to read SQL file {}", file.display())),
        (None, None) => Ok(None),
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to resolve the current directory")?;
    Ok(cwd.join(path))
}

fn parse_dependency(value: &str) -> Result<DependencyRef, HelpfulError> {
    DependencyRef::parse(value).ok_or_else(|| {
        HelpfulError::new(format!("Invalid dependency: '{}'", value))
            .with_suggestion("TRY: analysis:<id>, source:<name> or file:<table>")
    })
}

/// `NAME[:TYPE][=DEFAULT]`. Without a default the parameter is required.
fn parse_param_def(spec: &str) -> Result<ParameterDef, HelpfulError> {
    let (head, default) = match spec.split_once('=') {
        Some((head, default)) => (head, Some(parse_value(default))),
        None => (spec, None),
    };
    let (name, param_type) = match head.split_once(':') {
        Some((name, param_type)) => (name.trim(), Some(param_type.trim())),
        None => (head.trim(), None),
    };
    if name.is_empty() || param_type.map_or(false, str::is_empty) {
        return Err(HelpfulError::new(format!("Invalid parameter: '{}'", spec))
            .with_suggestion("TRY: --param min_amount:int=100 or --param region"));
    }
    let mut def = ParameterDef::new(name);
    if let Some(param_type) = param_type {
        def.param_type = param_type.to_lowercase();
    }
    def.required = default.is_none();
    def.default = default;
    Ok(def)
}

/// `KEY=VALUE` pairs; values are JSON when they parse as JSON, else strings.
fn parse_assignments(pairs: &[String]) -> Result<ParamValues, HelpfulError> {
    let mut params = ParamValues::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .filter(|(key, _)| !key.trim().is_empty())
            .ok_or_else(|| {
                HelpfulError::new(format!("Invalid parameter assignment: '{}'", pair))
                    .with_suggestion("TRY: --set region=north --set min_amount=100")
            })?;
        params.insert(key.trim().to_string(), parse_value(value));
    }
    Ok(params)
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_analysis(analysis: &Analysis) {
    println!("Id:              {}", analysis.id);
    println!("Name:            {}", analysis.name);
    println!("Materialization: {}", analysis.materialization);
    println!("Result:          {}", analysis.result_table);
    println!("Description:     {}", or_dash(analysis.description.as_deref()));
    if !analysis.tags.is_empty() {
        println!("Tags:            {}", analysis.tags.join(", "));
    }
    for dep in &analysis.depends_on {
        println!("Depends on:      {}", dep.full());
    }
    for param in &analysis.parameters {
        let default = param
            .default
            .as_ref()
            .map(|d| format!(" = {}", d))
            .unwrap_or_default();
        let required = if param.required { " (required)" } else { "" };
        println!(
            "Parameter:       ${}: {}{}{}",
            param.name, param.param_type, default, required
        );
    }
    println!("Updated:         {}", format_time(&analysis.updated_at));
    println!();
    println!("{}", analysis.sql.trim_end());
}

fn print_plan(plan: &ExecutionPlan) {
    let rows = plan
        .steps
        .iter()
        .map(|s| {
            vec![
                s.analysis_id.clone(),
                s.action.as_str().to_string(),
                s.operation.clone(),
                s.target_table.clone(),
                s.reason.clone(),
            ]
        })
        .collect();
    print_table(&["Analysis", "Action", "Operation", "Target", "Reason"], rows);
    println!(
        "{} of {} step(s) will be recomputed",
        plan.recompute_count(),
        plan.steps.len()
    );
}

fn print_run(result: &ExecutionResult) {
    if result.step_results.is_empty() {
        println!("{} is up to date; nothing to run", result.plan.target_id);
        return;
    }
    let rows = result
        .step_results
        .iter()
        .map(|r| {
            vec![
                r.analysis_id.clone(),
                r.status.as_str().to_string(),
                format!("{} ms", r.duration_ms),
                or_dash(r.rows_affected),
                or_dash(r.error.as_deref()),
            ]
        })
        .collect();
    print_table(&["Analysis", "Status", "Duration", "Rows", "Error"], rows);
    let succeeded = result
        .step_results
        .iter()
        .filter(|r| r.status == StepStatus::Success)
        .count();
    println!(
        "{}/{} step(s) succeeded",
        succeeded,
        result.step_results.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use duckyard_assets::RefType;
    use serde_json::json;

    #[test]
    fn param_defs() {
        let def = parse_param_def("min_amount:INT=100").unwrap();
        assert_eq!(def.name, "min_amount");
        assert_eq!(def.param_type, "int");
        assert!(!def.required);
        assert_eq!(def.default, Some(json!(100)));

        let def = parse_param_def("region").unwrap();
        assert_eq!(def.param_type, "string");
        assert!(def.required);
        assert_eq!(def.default, None);

        let def = parse_param_def("label=north east").unwrap();
        assert_eq!(def.default, Some(json!("north east")));

        assert!(parse_param_def(":int").is_err());
        assert!(parse_param_def("x:").is_err());
    }

    #[test]
    fn assignments_prefer_json_values() {
        let params = parse_assignments(&[
            "n=3".to_string(),
            "flag=true".to_string(),
            "region=north".to_string(),
            "empty=".to_string(),
        ])
        .unwrap();
        assert_eq!(params["n"], json!(3));
        assert_eq!(params["flag"], json!(true));
        assert_eq!(params["region"], json!("north"));
        assert_eq!(params["empty"], json!(""));

        assert!(parse_assignments(&["novalue".to_string()]).is_err());
        assert!(parse_assignments(&["=5".to_string()]).is_err());
    }

    #[test]
    fn dependencies_and_materializations() {
        let dep = parse_dependency("source:shop").unwrap();
        assert_eq!(dep.ref_type, RefType::Source);
        assert_eq!(dep.name, "shop");
        assert!(parse_dependency("shop").is_err());

        let parse = |v: &str| MaterializationArg::from_str(v, true).map(Materialization::from);
        assert_eq!(parse("PARQUET").unwrap(), Materialization::Parquet);
        assert!(parse("matview").is_err());
    }

    #[test]
    fn sql_comes_from_flag_or_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("q.sql");
        std::fs::write(&file, "SELECT 1").unwrap();
        assert_eq!(
            read_sql(None, Some(file)).unwrap().as_deref(),
            Some("SELECT 1")
        );
        assert_eq!(
            read_sql(Some("SELECT 2".to_string()), None).unwrap().as_deref(),
            Some("SELECT 2")
        );
        assert!(read_sql(None, None).unwrap().is_none());
        assert!(read_sql(None, Some(temp.path().join("missing.sql"))).is_err());
    }

    #[test]
    fn relative_export_paths_become_absolute() {
        assert_eq!(absolute(Path::new("/tmp/x.csv")).unwrap(), PathBuf::from("/tmp/x.csv"));
        assert!(absolute(Path::new("out/x.csv")).unwrap().is_absolute());
    }
}
