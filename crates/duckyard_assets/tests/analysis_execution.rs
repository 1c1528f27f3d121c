use duckyard_assets::{
    AssetError, AssetService, DependencyRef, Materialization, NewAnalysis, ParamValues,
    ParameterDef, StepAction, StepStatus,
};
use duckyard_db::DbConnection;
use duckyard_sources::{AttachOptions, CacheOptions, SourceService, SourceType};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn setup() -> (TempDir, AssetService) {
    let temp = TempDir::new().unwrap();
    let shop = temp.path().join("shop.duckdb");
    {
        let conn = DbConnection::open_duckdb(&shop).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders AS SELECT range AS id, range % 4 AS status FROM range(40)",
        )
        .unwrap();
    }
    let sources = SourceService::new("proj", temp.path().join("warehouse.duckdb")).unwrap();
    sources
        .attach_source(
            "shop",
            SourceType::Duckdb,
            json!({"path": shop.display().to_string()})
                .as_object()
                .cloned()
                .unwrap(),
            AttachOptions::default(),
        )
        .unwrap();
    let assets = AssetService::for_project(Arc::new(sources));
    (temp, assets)
}

fn create(assets: &AssetService, id: &str, sql: &str, materialization: Materialization) {
    assets
        .create_analysis(NewAnalysis {
            id: id.to_string(),
            sql: sql.to_string(),
            materialization,
            ..Default::default()
        })
        .unwrap();
}

fn no_params() -> ParamValues {
    ParamValues::new()
}

fn create_order_chain(assets: &AssetService) {
    assets
        .create_analysis(NewAnalysis {
            id: "orders_summary".to_string(),
            sql: "SELECT status, COUNT(*) AS n FROM shop.orders GROUP BY status".to_string(),
            materialization: Materialization::Table,
            depends_on: vec![DependencyRef::source("shop")],
            ..Default::default()
        })
        .unwrap();
    create(
        assets,
        "total",
        "SELECT SUM(n) AS total FROM analysis.orders_summary",
        Materialization::View,
    );
}

#[test]
fn source_change_makes_the_chain_stale() {
    let (_temp, assets) = setup();
    create_order_chain(&assets);

    let first = assets.run_analysis("total", &no_params(), false, false).unwrap();
    assert!(first.success);
    assert_eq!(first.step_results.len(), 2);
    assert_eq!(first.step_results[0].analysis_id, "orders_summary");
    assert_eq!(first.step_results[0].rows_affected, Some(4));

    let plan = assets.compile_analysis("total", &no_params(), false).unwrap();
    assert!(plan.steps.iter().all(|s| s.action == StepAction::Skip));
    assert!(!assets.get_freshness("orders_summary").unwrap().is_stale);

    thread::sleep(Duration::from_millis(5));
    assets
        .sources()
        .cache_table("shop", "orders", CacheOptions::default())
        .unwrap();

    let freshness = assets.get_freshness("orders_summary").unwrap();
    assert!(freshness.is_stale);
    assert!(freshness.stale_reason.unwrap().contains("source 'shop'"));

    let plan = assets.compile_analysis("total", &no_params(), false).unwrap();
    assert_eq!(plan.recompute_count(), 2);
    assert!(plan.steps[1].reason.contains("orders_summary"));

    let second = assets.run_analysis("total", &no_params(), false, false).unwrap();
    assert!(second.success);
    let data = assets.get_analysis_data("total", 10, 0).unwrap();
    assert_eq!(data.columns, vec!["total".to_string()]);
    assert_eq!(data.rows[0][0], json!(40));
}

#[test]
fn force_recomputes_only_the_target() {
    let (_temp, assets) = setup();
    create_order_chain(&assets);
    assets.run_analysis("total", &no_params(), false, false).unwrap();

    let result = assets.run_analysis("total", &no_params(), true, false).unwrap();
    assert!(result.success);
    assert_eq!(result.plan.step("orders_summary").unwrap().action, StepAction::Skip);
    assert_eq!(result.step_results.len(), 1);
    assert_eq!(result.step_results[0].analysis_id, "total");
    assert_eq!(assets.get_run_history("orders_summary", None).unwrap().len(), 1);
    assert_eq!(assets.get_run_history("total", None).unwrap().len(), 2);
}

fn create_failing_graph(assets: &AssetService) {
    create(assets, "good", "SELECT 1 AS x", Materialization::View);
    create(assets, "bad", "SELECT * FROM table_that_does_not_exist", Materialization::View);
    create(assets, "child", "SELECT * FROM analysis.bad", Materialization::View);
    create(
        assets,
        "report",
        "SELECT * FROM analysis.good CROSS JOIN analysis.child",
        Materialization::Table,
    );
}

#[test]
fn failure_aborts_by_default() {
    let (_temp, assets) = setup();
    create_failing_graph(&assets);

    let result = assets.run_analysis("report", &no_params(), false, false).unwrap();
    assert!(!result.success);
    let statuses: Vec<_> = result
        .step_results
        .iter()
        .map(|r| (r.analysis_id.as_str(), r.status))
        .collect();
    assert_eq!(statuses, vec![("good", StepStatus::Success), ("bad", StepStatus::Failed)]);
    assert!(result.first_failure().unwrap().error.is_some());
    assert!(assets.get_run_history("child", None).unwrap().is_empty());
}

#[test]
fn continue_on_failure_skips_dependents_of_the_failure() {
    let (_temp, assets) = setup();
    create_failing_graph(&assets);

    let result = assets.run_analysis("report", &no_params(), false, true).unwrap();
    assert!(!result.success);
    assert_eq!(result.result_for("good").unwrap().status, StepStatus::Success);
    assert_eq!(result.result_for("bad").unwrap().status, StepStatus::Failed);
    let child = result.result_for("child").unwrap();
    assert_eq!(child.status, StepStatus::Skipped);
    assert_eq!(child.error.as_deref(), Some("dependency failed: bad"));
    let report = result.result_for("report").unwrap();
    assert_eq!(report.error.as_deref(), Some("dependency failed: child"));

    let run_ids: std::collections::HashSet<_> =
        result.step_results.iter().map(|r| r.run_id.clone()).collect();
    assert_eq!(run_ids.len(), 1);
    let history = assets.get_run_history("child", None).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, StepStatus::Skipped);
}

#[test]
fn parquet_results_can_be_read_and_exported() {
    let (temp, assets) = setup();
    create(&assets, "snapshot", "SELECT range AS id FROM range(4)", Materialization::Parquet);

    let result = assets.run_analysis("snapshot", &no_params(), false, false).unwrap();
    assert_eq!(result.step_results[0].rows_affected, Some(4));
    assert!(assets.output_dir().join("snapshot.parquet").exists());
    assert_eq!(assets.get_analysis_data("snapshot", 2, 0).unwrap().total_rows, 4);

    let export = assets
        .export_analysis_csv("snapshot", &temp.path().join("exports").join("snap"), false)
        .unwrap();
    assert!(export.path.ends_with("snap.csv"));
    assert_eq!(export.rows, 4);
    let written = fs::read_to_string(&export.path).unwrap();
    assert!(written.starts_with("id\n"));
}

#[test]
fn export_of_failing_analysis_is_an_execution_error() {
    let (temp, assets) = setup();
    create(&assets, "bad", "SELECT * FROM nope", Materialization::Table);
    let err = assets
        .export_analysis_csv("bad", &temp.path().join("bad.csv"), false)
        .unwrap_err();
    assert!(matches!(err, AssetError::Execution(_)));
    assert!(!temp.path().join("bad.csv").exists());
}

#[test]
fn parameters_bind_per_run() {
    let (_temp, assets) = setup();
    let mut min = ParameterDef::new("min");
    min.param_type = "int".to_string();
    min.required = true;
    assets
        .create_analysis(NewAnalysis {
            id: "above".to_string(),
            sql: "SELECT range AS v FROM range(5) WHERE range >= $min".to_string(),
            materialization: Materialization::Table,
            parameters: vec![min],
            ..Default::default()
        })
        .unwrap();

    let err = assets.run_analysis("above", &no_params(), false, false).unwrap_err();
    assert!(matches!(err, AssetError::Validation(_)));

    let params = json!({"min": 2}).as_object().cloned().unwrap();
    let result = assets.run_analysis("above", &params, false, false).unwrap();
    assert_eq!(result.step_results[0].rows_affected, Some(3));
    assert_eq!(result.plan.params["min"], json!(2));
}

#[test]
fn delete_drops_result_and_keeps_history() {
    let (_temp, assets) = setup();
    create(&assets, "good", "SELECT 1 AS x", Materialization::Table);
    assets.run_analysis("good", &no_params(), false, false).unwrap();

    assert!(assets.delete_analysis("good").unwrap());
    assert!(!assets.delete_analysis("good").unwrap());
    assert!(assets.get_analysis("good").unwrap().is_none());
    assert_eq!(assets.get_run_history("good", None).unwrap().len(), 1);

    let tables: i64 = assets
        .sources()
        .warehouse()
        .with_connection(|conn| {
            conn.query_scalar(
                "SELECT COUNT(*) FROM duckdb_tables() WHERE schema_name = 'analysis'",
                &[],
            )
        })
        .unwrap();
    assert_eq!(tables, 0);
}

#[test]
fn lineage_spans_sources_and_analyses() {
    let (_temp, assets) = setup();
    create_order_chain(&assets);

    let lineage = assets.get_lineage("orders_summary").unwrap();
    assert_eq!(lineage.upstream[0].full, "source:shop");
    assert_eq!(lineage.downstream[0].id, "total");

    let graph = assets.get_lineage_graph().unwrap();
    assert_eq!(graph.nodes.len(), 3);
    assert_eq!(graph.edges.len(), 2);
}
