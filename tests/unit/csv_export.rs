//! CSV export of completed records

use receipt_batch::output::csv::CsvExporter;
use receipt_batch::output::Exporter;
use receipt_batch::StructuredRecord;
use serde_json::json;
use tempfile::TempDir;

#[test]
fn test_export_writes_one_file_per_batch() {
    let dir = TempDir::new().unwrap();
    let exporter = CsvExporter::new(dir.path().join("output"));
    let records = vec![
        StructuredRecord {
            item_id: "receipt_001.jpg".to_string(),
            record: json!({"merchant": "ACME", "total": 1200}),
        },
        StructuredRecord {
            item_id: "receipt_002.jpg".to_string(),
            record: json!({"merchant": "Corner Shop, Ltd", "date": "2024-03-01"}),
        },
    ];

    let paths = exporter.export("batch-1", &records).unwrap();
    assert_eq!(paths, vec![exporter.path_for("batch-1")]);

    let mut reader = csv::Reader::from_path(&paths[0]).unwrap();
    let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(header, vec!["item_id", "date", "merchant", "total"]);

    let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][0], "receipt_001.jpg");
    assert_eq!(&rows[0][1], "");
    assert_eq!(&rows[0][3], "1200");
    assert_eq!(&rows[1][2], "Corner Shop, Ltd");
}

#[test]
fn test_reexport_replaces_file() {
    let dir = TempDir::new().unwrap();
    let exporter = CsvExporter::new(dir.path());
    let record = |total: u32| StructuredRecord {
        item_id: "a.jpg".to_string(),
        record: json!({ "total": total }),
    };

    exporter.export("batch-1", &[record(1)]).unwrap();
    exporter.export("batch-1", &[record(2)]).unwrap();

    let contents = std::fs::read_to_string(exporter.path_for("batch-1")).unwrap();
    assert_eq!(contents, "item_id,total\na.jpg,2\n");
}
