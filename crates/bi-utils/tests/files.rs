//! Reading unloaded chunks, query templates and QA over fixture files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use bi_utils::aws::db::{read_chunks, read_files};
use bi_utils::frame::CsvReadOptions;
use bi_utils::qa::{df_test, QaOptions};
use bi_utils::sql::{get_query, QueryParams};
use bi_utils::{Error, Value};

const PARTS: &[&str] = &["events_part_00.csv", "events_part_01.csv", "events_part_02.csv"];

fn data_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("data")
}

fn copy_parts(dest: &Path) {
    fs::create_dir_all(dest).unwrap();
    for part in PARTS {
        fs::copy(data_dir().join(part), dest.join(part)).unwrap();
    }
}

fn read_options() -> CsvReadOptions {
    CsvReadOptions::default().with_parse_bools(["is_organic"])
}

#[test]
fn test_read_files_skips_empty_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    copy_parts(tmp.path());

    let frame = read_files(tmp.path(), &read_options(), false).unwrap();
    assert_eq!(frame.columns(), &["date", "media_source", "installs", "is_organic"]);
    assert_eq!(frame.len(), 4);

    let organic: Vec<Value> = frame.column("is_organic").unwrap().cloned().collect();
    assert_eq!(
        organic,
        vec![Value::Bool(false), Value::Bool(true), Value::Bool(false), Value::Null]
    );
    assert_eq!(frame.numeric_column("installs").unwrap(), vec![10.0, 3.0, 7.0, 0.0]);
    assert!(tmp.path().join(PARTS[0]).exists());
}

#[test]
fn test_read_files_removes_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("unload");
    copy_parts(&dir);

    let frame = read_files(dir.as_path(), &read_options(), true).unwrap();
    assert_eq!(frame.len(), 4);
    assert!(!dir.exists());
}

#[test]
fn test_read_chunks_yields_non_empty_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    copy_parts(tmp.path());

    let chunks = read_chunks(tmp.path(), &read_options(), false)
        .unwrap()
        .collect::<bi_utils::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|chunk| chunk.len() == 2));
}

#[test]
fn test_read_gzipped_chunk() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("events_part_00.csv.gz");
    let mut encoder = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
    encoder
        .write_all(&fs::read(data_dir().join(PARTS[0])).unwrap())
        .unwrap();
    encoder.finish().unwrap();

    let frame = read_files(path.as_path(), &read_options(), false).unwrap();
    assert_eq!(frame.len(), 2);
}

#[test]
fn test_unsupported_chunk_format() {
    let err = read_files(data_dir().join("events.sql"), &read_options(), false).unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));
}

#[test]
fn test_query_template_fixture() {
    let params = QueryParams::new()
        .arg("analytics")
        .named("columns", "date, installs")
        .named("date", "2024-01-01");
    let query = get_query(data_dir().join("events.sql"), &params).unwrap();
    assert_eq!(
        query,
        "SELECT date, installs\nFROM analytics.events\nWHERE date = '2024-01-01'\n"
    );
}

#[test]
fn test_qa_over_unloaded_files() {
    let tmp = tempfile::tempdir().unwrap();
    copy_parts(tmp.path());
    let frame = read_files(tmp.path(), &read_options(), false).unwrap();

    let options = QaOptions::default()
        .nullable("media_source")
        .nullable("is_organic")
        .unique_index(["date", "media_source"])
        .threshold("installs", 0.0, 10.0)
        .verify("installs >= 0");
    assert_eq!(df_test(&frame, &options).unwrap(), 0);

    let strict = QaOptions::default()
        .nullable("media_source")
        .nullable("is_organic")
        .threshold("installs", 0.0, 5.0)
        .strict();
    assert!(matches!(
        df_test(&frame, &strict).unwrap_err(),
        Error::QaFailed { .. }
    ));
}
