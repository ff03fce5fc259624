//! File naming and CSV header helpers.

use std::fs::File;
use std::path::Path;

use chrono::{Local, NaiveDate};

use crate::error::Result;

/// Build a file name for data produced at a specific date.
///
/// ```
/// use chrono::NaiveDate;
/// use bi_utils::files::data_filename;
///
/// let date = NaiveDate::from_ymd_opt(2020, 10, 1).unwrap();
/// assert_eq!(data_filename("cohorts", date, Some("csv")), "2020-10-01_cohorts.csv");
/// assert_eq!(data_filename("model", date, None), "2020-10-01_model");
/// ```
#[must_use]
pub fn data_filename(data_name: &str, date: NaiveDate, ext: Option<&str>) -> String {
    match ext {
        Some(ext) if !ext.is_empty() => format!("{date}_{data_name}.{ext}"),
        _ => format!("{date}_{data_name}"),
    }
}

/// [`data_filename`] for today's local date.
#[must_use]
pub fn data_filename_today(data_name: &str, ext: Option<&str>) -> String {
    data_filename(data_name, Local::now().date_naive(), ext)
}

/// Read the column names from the header of a CSV file.
///
/// An empty file has no columns.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or the header is malformed.
pub fn csv_columns(csv_path: impl AsRef<Path>, separator: u8) -> Result<Vec<String>> {
    let file = File::open(csv_path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(separator)
        .from_reader(file);
    let columns = reader.headers()?.iter().map(str::to_string).collect();
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_filename() {
        let date = NaiveDate::from_ymd_opt(2077, 10, 1).unwrap();
        assert_eq!(data_filename("data", date, Some("csv")), "2077-10-01_data.csv");
        assert_eq!(data_filename("cohorts", date, Some("pkl")), "2077-10-01_cohorts.pkl");
        assert_eq!(data_filename("model", date, None), "2077-10-01_model");
        assert_eq!(data_filename("model", date, Some("")), "2077-10-01_model");
    }

    #[test]
    fn test_data_filename_today() {
        let name = data_filename_today("ltv", Some("csv"));
        assert!(name.ends_with("_ltv.csv"));
        assert_eq!(name.len(), "YYYY-MM-DD_ltv.csv".len());
    }

    #[test]
    fn test_csv_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("encoded.csv");
        std::fs::write(&path, "media_source,campaign_id,C,cols\nfb,1,2,x\n").unwrap();

        assert_eq!(
            csv_columns(&path, b',').unwrap(),
            vec!["media_source", "campaign_id", "C", "cols"]
        );
        // Wrong separator keeps the whole header in one column
        assert_eq!(
            csv_columns(&path, b';').unwrap(),
            vec!["media_source,campaign_id,C,cols"]
        );
    }

    #[test]
    fn test_csv_columns_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "").unwrap();

        assert!(csv_columns(&path, b',').unwrap().is_empty());
    }

    #[test]
    fn test_csv_columns_missing_file() {
        assert!(csv_columns("/nonexistent/file.csv", b',').is_err());
    }
}
