//! Query command - run ad-hoc SQL and page through kept results

use crate::cli::analysis::{read_sql, SqlInput};
use crate::cli::context::CliContext;
use crate::cli::error::HelpfulError;
use crate::cli::output::{format_opt_time, format_time, or_dash, print_json, print_preview, print_table};
use anyhow::Result;
use clap::Subcommand;
use duckyard_assets::{AssetError, NewQuery, QueryJob, DEFAULT_QUERY_RETENTION_HOURS};

#[derive(Subcommand, Debug, Clone)]
pub enum QueryAction {
    /// Run SQL now; row results are kept as a table
    Run {
        #[command(flatten)]
        sql: SqlInput,
        /// Job id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Attached source the SQL reads
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Record SQL without running it
    Submit {
        #[command(flatten)]
        sql: SqlInput,
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Run a submitted query
    Execute { id: String },
    /// Recent queries, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one query job
    Show { id: String },
    /// Rows of a query result
    Data {
        id: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Drop results of queries completed before the cutoff
    Cleanup {
        #[arg(long, default_value_t = DEFAULT_QUERY_RETENTION_HOURS)]
        older_than_hours: i64,
    },
}

pub fn run(ctx: &CliContext, action: QueryAction) -> Result<()> {
    let queries = ctx.queries()?;
    match action {
        QueryAction::Run { sql, id, sources } => {
            let new = new_query(sql, id, sources)?;
            let job = queries.submit_query(new)?;
            let job = queries.execute_query(&job.job_id).map_err(|e| failed(&job.job_id, e))?;
            report(ctx, &job)
        }
        QueryAction::Submit { sql, id, sources } => {
            let job = queries.submit_query(new_query(sql, id, sources)?)?;
            if ctx.json() {
                return print_json(&job);
            }
            println!("Submitted query {}", job.job_id);
            Ok(())
        }
        QueryAction::Execute { id } => {
            let job = queries.execute_query(&id).map_err(|e| failed(&id, e))?;
            report(ctx, &job)
        }
        QueryAction::List { limit } => {
            let jobs = queries.list_queries(limit)?;
            if ctx.json() {
                return print_json(&jobs);
            }
            let rows = jobs
                .iter()
                .map(|j| {
                    vec![
                        j.job_id.clone(),
                        j.status.as_str().to_string(),
                        format_time(&j.submitted_at),
                        or_dash(j.rows_affected),
                        or_dash(j.result_table.as_deref()),
                    ]
                })
                .collect();
            print_table(&["Id", "Status", "Submitted", "Rows", "Result"], rows);
            Ok(())
        }
        QueryAction::Show { id } => {
            let job = queries
                .get_query(&id)?
                .ok_or_else(|| HelpfulError::query_not_found(&id))?;
            if ctx.json() {
                return print_json(&job);
            }
            print_job(&job);
            Ok(())
        }
        QueryAction::Data { id, limit, offset } => {
            let limit = limit.unwrap_or(ctx.config().cache_preview_limit);
            let preview = queries.get_query_data(&id, limit, offset)?;
            if ctx.json() {
                return print_json(&preview);
            }
            print_preview(&preview);
            Ok(())
        }
        QueryAction::Cleanup { older_than_hours } => {
            let removed = queries.cleanup_queries(older_than_hours)?;
            if ctx.json() {
                return print_json(&serde_json::json!({ "removed": removed }));
            }
            println!("Removed {} query result(s)", removed);
            Ok(())
        }
    }
}

fn new_query(sql: SqlInput, job_id: Option<String>, sources: Vec<String>) -> Result<NewQuery> {
    let sql = read_sql(sql.sql, sql.sql_file)?.ok_or_else(|| {
        HelpfulError::new("SQL is required").with_suggestion("TRY: --sql '...' or --sql-file query.sql")
    })?;
    Ok(NewQuery {
        job_id,
        sql,
        sources,
    })
}

fn failed(job_id: &str, err: AssetError) -> anyhow::Error {
    match err {
        AssetError::Execution(message) => HelpfulError::new(format!("Query {} failed", job_id))
            .with_context(message)
            .with_suggestion(format!("TRY: Inspect it: duckyard query show {}", job_id))
            .into(),
        AssetError::NotFound(_) => HelpfulError::query_not_found(job_id).into(),
        other => other.into(),
    }
}

fn report(ctx: &CliContext, job: &QueryJob) -> Result<()> {
    if ctx.json() {
        return print_json(job);
    }
    match &job.result_table {
        Some(table) => println!(
            "Query {} kept {} row(s) in {}",
            job.job_id,
            or_dash(job.rows_affected),
            table
        ),
        None => println!("Query {} done ({} row(s) affected)", job.job_id, or_dash(job.rows_affected)),
    }
    Ok(())
}

fn print_job(job: &QueryJob) {
    println!("Id:        {}", job.job_id);
    println!("Status:    {}", job.status.as_str());
    println!("Submitted: {}", format_time(&job.submitted_at));
    println!("Completed: {}", format_opt_time(job.completed_at.as_ref()));
    println!("Result:    {}", or_dash(job.result_table.as_deref()));
    println!("Rows:      {}", or_dash(job.rows_affected));
    if !job.sources.is_empty() {
        println!("Sources:   {}", job.sources.join(", "));
    }
    if let Some(error) = &job.error {
        println!("Error:     {}", error);
    }
    println!();
    println!("{}", job.sql.trim_end());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::DuckyardConfig;
    use duckyard_assets::QueryStatus;
    use tempfile::TempDir;

    #[test]
    fn sql_is_required() {
        let missing = SqlInput {
            sql: None,
            sql_file: None,
        };
        assert!(new_query(missing, None, Vec::new()).is_err());

        let given = SqlInput {
            sql: Some("SELECT 1".to_string()),
            sql_file: None,
        };
        let new = new_query(given, Some("q1".to_string()), vec!["shop".to_string()]).unwrap();
        assert_eq!(new.sql, "SELECT 1");
        assert_eq!(new.sources, vec!["shop".to_string()]);
    }

    #[test]
    fn failures_point_at_the_job() {
        let err = failed("q7", AssetError::Execution("boom".to_string()));
        let text = err.to_string();
        assert!(text.contains("Query q7 failed"));
        assert!(text.contains("duckyard query show q7"));
    }

    #[test]
    fn run_keeps_a_queryable_result() {
        let temp = TempDir::new().unwrap();
        let ctx = CliContext::new(
            DuckyardConfig::default(),
            Some(temp.path().to_path_buf()),
            Some("p1".to_string()),
            true,
        )
        .unwrap();
        run(
            &ctx,
            QueryAction::Run {
                sql: SqlInput {
                    sql: Some("SELECT range AS n FROM range(5)".to_string()),
                    sql_file: None,
                },
                id: Some("five".to_string()),
                sources: Vec::new(),
            },
        )
        .unwrap();

        let job = ctx.queries().unwrap().get_query("five").unwrap().unwrap();
        assert_eq!(job.status, QueryStatus::Success);
        assert_eq!(job.rows_affected, Some(5));
    }
}
