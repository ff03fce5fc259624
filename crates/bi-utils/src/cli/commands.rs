//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands and the parsers
//! for their `KEY=VALUE` style arguments.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Subcommand, ValueEnum};

use crate::aws::FileFormat;
use crate::qa::QaOptions;
use crate::sql::{QueryParams, SqlValue};

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// SQL template commands.
#[derive(Debug, Subcommand)]
pub enum QueryCommand {
    /// Render a query template and print it
    Render {
        /// Path to the template
        path: PathBuf,

        /// Positional parameter, may be repeated
        #[arg(short, long = "arg", value_name = "VALUE")]
        args: Vec<String>,

        /// Named parameter, may be repeated
        #[arg(short, long = "param", value_name = "NAME=VALUE", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },
}

impl QueryCommand {
    /// Collect the template parameters.
    #[must_use]
    pub fn query_params(&self) -> QueryParams {
        let Self::Render { args, params, .. } = self;
        let params = params
            .iter()
            .fold(QueryParams::new(), |acc, (name, value)| acc.named(name, value));
        args.iter().fold(params, |acc, value| acc.arg(value))
    }
}

/// Local file commands.
#[derive(Debug, Subcommand)]
pub enum FilesCommand {
    /// Print the header of a CSV file
    Columns {
        /// CSV file
        csv: PathBuf,

        /// Field delimiter
        #[arg(short, long, default_value = ",", value_parser = parse_separator)]
        separator: u8,
    },

    /// Print a dated data file name
    Name {
        /// Data name
        data: String,

        /// Date prefix, today when omitted
        #[arg(short, long, value_name = "YYYY-MM-DD")]
        date: Option<NaiveDate>,

        /// File extension
        #[arg(short, long)]
        ext: Option<String>,
    },
}

/// Process and size helpers.
#[derive(Debug, Subcommand)]
pub enum SystemCommand {
    /// Show memory used by this process
    Ram,

    /// Render a byte count in human-readable units
    Size {
        /// Number of bytes
        bytes: u64,
    },
}

/// Data-quality checks over a CSV file.
#[derive(Debug, Args)]
pub struct QaCommand {
    /// CSV file to check
    pub csv: PathBuf,

    /// Field delimiter
    #[arg(short, long, default_value = ",", value_parser = parse_separator)]
    pub separator: u8,

    /// Column allowed to hold missing values
    #[arg(long, value_name = "COL")]
    pub nullable: Vec<String>,

    /// Column of the unique row index
    #[arg(long, value_name = "COL")]
    pub unique: Vec<String>,

    /// Allowed range of a numeric column
    #[arg(long, value_name = "COL=MIN:MAX", value_parser = parse_threshold)]
    pub threshold: Vec<(String, f64, f64)>,

    /// Largest allowed ratio of a column's maximum to its quantile
    #[arg(long, value_name = "COL=Q:K", value_parser = parse_threshold)]
    pub max_quantile: Vec<(String, f64, f64)>,

    /// SQL condition every row must satisfy
    #[arg(long, value_name = "EXPR")]
    pub query: Vec<String>,

    /// Exit with an error when any check fails
    #[arg(long)]
    pub strict: bool,
}

impl QaCommand {
    /// Build the check options.
    #[must_use]
    pub fn qa_options(&self) -> QaOptions {
        let mut options = QaOptions::default();
        for column in &self.nullable {
            options = options.nullable(column);
        }
        if !self.unique.is_empty() {
            options = options.unique_index(self.unique.iter().cloned());
        }
        for (column, min, max) in &self.threshold {
            options = options.threshold(column, *min, *max);
        }
        for (column, quantile, multiplier) in &self.max_quantile {
            options = options.max_quantile(column, *quantile, *multiplier);
        }
        for query in &self.query {
            options = options.verify(query);
        }
        if self.strict {
            options = options.strict();
        }
        options
    }
}

/// S3 transfer commands.
#[derive(Debug, Subcommand)]
pub enum S3Command {
    /// Upload a file
    Upload {
        /// Local file
        file: PathBuf,

        /// Bucket, defaults to `warehouse.bucket`
        #[arg(short, long)]
        bucket: Option<String>,

        /// Key prefix, defaults to `warehouse.bucket_dir`
        #[arg(short, long)]
        dir: Option<String>,
    },

    /// Download an object
    Download {
        /// Object key
        key: String,

        /// Destination file or directory
        dest: PathBuf,

        /// Bucket, defaults to `warehouse.bucket`
        #[arg(short, long)]
        bucket: Option<String>,
    },
}

/// Warehouse commands.
#[derive(Debug, Subcommand)]
pub enum DbCommand {
    /// Load a CSV or parquet file into a table through S3
    Upload {
        /// Local file
        file: PathBuf,

        /// Target schema
        #[arg(long)]
        schema: String,

        /// Target table
        #[arg(long)]
        table: String,

        /// Field delimiter of a CSV file
        #[arg(short, long, default_value = ",", value_parser = parse_separator)]
        separator: u8,
    },

    /// Unload a query through S3 and download the files
    Download {
        /// SQL query
        query: String,

        /// Local directory, defaults to `warehouse.temp_dir`
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Unload file format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: FormatArg,
    },

    /// Unload a query to S3 and print the prefix
    Unload {
        /// SQL query
        query: String,

        /// Unload file format
        #[arg(short, long, value_enum, default_value = "csv")]
        format: FormatArg,
    },

    /// Delete rows matching equality conditions
    Delete {
        /// Table schema
        #[arg(long)]
        schema: String,

        /// Table name
        #[arg(long)]
        table: String,

        /// Equality condition, may be repeated
        #[arg(short = 'w', long = "where", value_name = "COL=VALUE", required = true, value_parser = parse_key_value)]
        conditions: Vec<(String, String)>,
    },

    /// Print the columns of a table
    Columns {
        /// Table schema
        #[arg(long)]
        schema: String,

        /// Table name
        #[arg(long)]
        table: String,
    },

    /// Export a file in the background queue and wait for it
    Export {
        /// Local file
        file: PathBuf,

        /// Target schema, loads the file into a table when set with `--table`
        #[arg(long)]
        schema: Option<String>,

        /// Target table
        #[arg(long)]
        table: Option<String>,

        /// Bucket, defaults to `warehouse.bucket`
        #[arg(short, long)]
        bucket: Option<String>,

        /// Key prefix, defaults to `warehouse.bucket_dir`
        #[arg(short, long)]
        dir: Option<String>,

        /// Remove the local file once exported
        #[arg(long)]
        delete: bool,
    },
}

impl DbCommand {
    /// Conditions of a `delete` command as SQL values.
    #[must_use]
    pub fn conditions(&self) -> Vec<(String, SqlValue)> {
        match self {
            Self::Delete { conditions, .. } => conditions
                .iter()
                .map(|(column, value)| (column.clone(), sql_value(value)))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Unload file format argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    /// Gzipped CSV with a header
    Csv,
    /// Parquet
    Parquet,
}

impl From<FormatArg> for FileFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => Self::Csv,
            FormatArg::Parquet => Self::Parquet,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_threshold(s: &str) -> Result<(String, f64, f64), String> {
    let (column, range) = parse_key_value(s)?;
    let (low, high) = range
        .split_once(':')
        .ok_or_else(|| format!("expected COL=A:B, got '{s}'"))?;
    let low = low.parse::<f64>().map_err(|e| format!("{low}: {e}"))?;
    let high = high.parse::<f64>().map_err(|e| format!("{high}: {e}"))?;
    Ok((column, low, high))
}

fn parse_separator(s: &str) -> Result<u8, String> {
    match s.as_bytes() {
        [byte] if byte.is_ascii() => Ok(*byte),
        _ => Err(format!("separator must be a single ASCII character, got '{s}'")),
    }
}

/// Integers and floats become numeric literals, everything else text.
fn sql_value(raw: &str) -> SqlValue {
    if let Ok(int) = raw.parse::<i64>() {
        SqlValue::Int(int)
    } else if let Ok(float) = raw.parse::<f64>() {
        SqlValue::Float(float)
    } else {
        SqlValue::Text(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("date=2024-01-01").unwrap(),
            ("date".to_string(), "2024-01-01".to_string())
        );
        assert_eq!(
            parse_key_value("expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("date").is_err());
        assert!(parse_key_value("=1").is_err());
    }

    #[test]
    fn test_parse_threshold() {
        assert_eq!(
            parse_threshold("installs=0:100.5").unwrap(),
            ("installs".to_string(), 0.0, 100.5)
        );
        assert!(parse_threshold("installs=0").is_err());
        assert!(parse_threshold("installs=a:1").is_err());
    }

    #[test]
    fn test_parse_separator() {
        assert_eq!(parse_separator(";").unwrap(), b';');
        assert_eq!(parse_separator("\t").unwrap(), b'\t');
        assert!(parse_separator(";;").is_err());
        assert!(parse_separator("").is_err());
    }

    #[test]
    fn test_sql_value() {
        assert_eq!(sql_value("42"), SqlValue::Int(42));
        assert_eq!(sql_value("1.5"), SqlValue::Float(1.5));
        assert_eq!(sql_value("fb"), SqlValue::Text("fb".to_string()));
    }

    #[test]
    fn test_qa_options() {
        let cmd = QaCommand {
            csv: PathBuf::from("data.csv"),
            separator: b',',
            nullable: vec!["comment".to_string()],
            unique: vec!["date".to_string(), "media_source".to_string()],
            threshold: vec![("installs".to_string(), 0.0, 10.0)],
            max_quantile: vec![],
            query: vec!["installs >= 0".to_string()],
            strict: true,
        };
        let options = cmd.qa_options();
        assert!(options.strict);
        assert_eq!(options.nullable_cols, vec!["comment"]);
        assert_eq!(
            options.unique_index,
            Some(vec!["date".to_string(), "media_source".to_string()])
        );
        assert_eq!(options.thresholds.len(), 1);
        assert_eq!(options.verify_queries, vec!["installs >= 0"]);
    }
}
