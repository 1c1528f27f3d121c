use duckyard_assets::{
    AssetError, AssetService, DependencyRef, FileAssetService, FileType, ImportMode,
    ImportOptions, NewAnalysis, ParamValues,
};
use duckyard_sources::SourceService;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn setup() -> (TempDir, Arc<SourceService>, FileAssetService) {
    let temp = TempDir::new().unwrap();
    let sources =
        Arc::new(SourceService::new("proj", temp.path().join("warehouse.duckdb")).unwrap());
    let files = FileAssetService::new("proj", sources.warehouse().clone());
    (temp, sources, files)
}

fn write_csv(temp: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = temp.path().join(name);
    fs::write(&path, body).unwrap();
    path
}

fn amount_of(sources: &SourceService, id: i64) -> i64 {
    sources
        .warehouse()
        .with_connection(|conn| {
            conn.query_scalar(
                &format!("SELECT amount FROM main.sales WHERE id = {}", id),
                &[],
            )
        })
        .unwrap()
}

#[test]
fn replace_requires_overwrite_and_keeps_the_id() {
    let (temp, _sources, files) = setup();
    let csv = write_csv(&temp, "Sales 2024.csv", "id,amount\n1,10\n2,20\n3,30\n");

    let first = files.import_file(&csv, ImportOptions::default()).unwrap();
    assert!(first.id.starts_with("file_"));
    assert_eq!(first.table_name, "sales_2024");
    assert_eq!(first.file_type, FileType::Csv);
    assert_eq!(first.row_count, Some(3));
    assert_eq!(first.column_count, Some(2));

    let err = files.import_file(&csv, ImportOptions::default()).unwrap_err();
    assert!(matches!(err, AssetError::Validation(_)));

    let again = files
        .import_file(
            &csv,
            ImportOptions {
                overwrite: true,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(again.id, first.id);
    assert_eq!(files.list_files().unwrap().len(), 1);
}

#[test]
fn append_and_merge_modes() {
    let (temp, sources, files) = setup();
    let base = write_csv(&temp, "base.csv", "id,amount\n1,10\n2,20\n3,30\n");
    let more = write_csv(&temp, "more.csv", "amount,id\n40,4\n50,5\n");
    let wrong = write_csv(&temp, "wrong.csv", "id,price\n6,60\n");
    let updates = write_csv(&temp, "updates.csv", "id,amount\n1,100\n9,90\n");
    let into_sales = |mode: ImportMode, keys: &[&str]| ImportOptions {
        table_name: Some("sales".to_string()),
        mode,
        merge_keys: keys.iter().map(|k| k.to_string()).collect(),
        ..Default::default()
    };

    let err = files
        .import_file(&more, into_sales(ImportMode::Append, &[]))
        .unwrap_err();
    assert!(matches!(err, AssetError::Validation(_)));

    let created = files.import_file(&base, into_sales(ImportMode::Replace, &[])).unwrap();
    let appended = files.import_file(&more, into_sales(ImportMode::Append, &[])).unwrap();
    assert_eq!(appended.id, created.id);
    assert_eq!(appended.row_count, Some(5));
    assert_eq!(amount_of(&sources, 4), 40);

    let err = files
        .import_file(&wrong, into_sales(ImportMode::Append, &[]))
        .unwrap_err();
    assert!(matches!(err, AssetError::Validation(ref m) if m.contains("price")));

    let err = files
        .import_file(&updates, into_sales(ImportMode::Merge, &[]))
        .unwrap_err();
    assert!(matches!(err, AssetError::Validation(_)));

    let merged = files
        .import_file(&updates, into_sales(ImportMode::Merge, &["id"]))
        .unwrap();
    assert_eq!(merged.row_count, Some(6));
    assert_eq!(amount_of(&sources, 1), 100);
    assert_eq!(amount_of(&sources, 9), 90);
}

#[test]
fn schema_preview_and_delete() {
    let (temp, sources, files) = setup();
    let csv = write_csv(&temp, "items.csv", "sku,qty\nA,1\nB,2\n");
    let file = files.import_file(&csv, ImportOptions::default()).unwrap();

    let schema = files.get_table_schema(&file.id).unwrap();
    let names: Vec<_> = schema.iter().map(|c| c.column_name.as_str()).collect();
    assert_eq!(names, vec!["sku", "qty"]);

    let preview = files.preview_file_data(&file.id, 1).unwrap();
    assert_eq!(preview.rows.len(), 1);
    assert_eq!(preview.total_rows, 2);

    assert!(files.delete_file(&file.id, true).unwrap());
    assert!(!files.delete_file(&file.id, true).unwrap());
    assert!(files.get_file(&file.id).unwrap().is_none());
    let remaining: i64 = sources
        .warehouse()
        .with_connection(|conn| {
            conn.query_scalar(
                "SELECT COUNT(*) FROM duckdb_tables() WHERE table_name = 'items'",
                &[],
            )
        })
        .unwrap();
    assert_eq!(remaining, 0);
    assert!(files.get_table_schema(&file.id).unwrap_err().is_not_found());
}

#[test]
fn refreshing_a_file_makes_dependent_analyses_stale() {
    let (temp, sources, files) = setup();
    let csv = write_csv(&temp, "sales.csv", "id,amount\n1,10\n");
    let file = files.import_file(&csv, ImportOptions::default()).unwrap();

    let assets = AssetService::for_project(Arc::clone(&sources));
    assets
        .create_analysis(NewAnalysis {
            id: "sales_total".to_string(),
            sql: "SELECT SUM(amount) AS total FROM main.sales".to_string(),
            depends_on: vec![DependencyRef::file("sales")],
            ..Default::default()
        })
        .unwrap();
    assert!(assets
        .run_analysis("sales_total", &ParamValues::new(), false, false)
        .unwrap()
        .success);
    assert!(!assets.get_freshness("sales_total").unwrap().is_stale);

    thread::sleep(Duration::from_millis(5));
    fs::write(&csv, "id,amount\n1,10\n2,15\n").unwrap();
    let refreshed = files.refresh_file(&file.id).unwrap();
    assert_eq!(refreshed.id, file.id);
    assert_eq!(refreshed.row_count, Some(2));

    let freshness = assets.get_freshness("sales_total").unwrap();
    assert!(freshness.is_stale);
    assert!(freshness.stale_reason.unwrap().contains("file 'sales'"));
}
