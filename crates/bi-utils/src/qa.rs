//! Data quality checks.
//!
//! Every check logs a warning for each failed assertion and returns the
//! number of failures, so a pipeline can decide whether to stop. [`df_test`]
//! runs them all.

use std::collections::HashSet;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::warn;

use crate::error::{Error, Result};
use crate::frame::{Frame, Value};
use crate::metrics::quantile;

/// Allowed `[min, max]` range of a numeric column.
#[derive(Debug, Clone, PartialEq)]
pub struct Threshold {
    /// Column name.
    pub column: String,
    /// Smallest allowed value.
    pub min: f64,
    /// Largest allowed value.
    pub max: f64,
}

/// Limit on how far the maximum of a positive column may exceed a quantile.
#[derive(Debug, Clone, PartialEq)]
pub struct MaxQuantile {
    /// Column name.
    pub column: String,
    /// Quantile in `[0, 1]`.
    pub quantile: f64,
    /// Largest allowed ratio of the maximum to the quantile.
    pub max_multiplier: f64,
}

/// Checks run by [`df_test`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QaOptions {
    /// Fail with [`Error::QaFailed`] instead of returning the fail count.
    pub strict: bool,
    /// Columns allowed to hold missing values.
    pub nullable_cols: Vec<String>,
    /// Columns that together identify a row.
    pub unique_index: Option<Vec<String>>,
    /// Numeric ranges.
    pub thresholds: Vec<Threshold>,
    /// Quantile outlier limits.
    pub max_quantiles: Vec<MaxQuantile>,
    /// SQL expressions every row must satisfy.
    pub verify_queries: Vec<String>,
}

impl QaOptions {
    /// Fail hard on any failed check.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Allow nulls in a column.
    #[must_use]
    pub fn nullable(mut self, column: impl Into<String>) -> Self {
        self.nullable_cols.push(column.into());
        self
    }

    /// Require the given columns to identify rows uniquely.
    #[must_use]
    pub fn unique_index<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.unique_index = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Require a column to stay within `[min, max]`.
    #[must_use]
    pub fn threshold(mut self, column: impl Into<String>, min: f64, max: f64) -> Self {
        self.thresholds.push(Threshold {
            column: column.into(),
            min,
            max,
        });
        self
    }

    /// Require `max(column) / quantile(column, q) <= max_multiplier`.
    #[must_use]
    pub fn max_quantile(mut self, column: impl Into<String>, quantile: f64, max_multiplier: f64) -> Self {
        self.max_quantiles.push(MaxQuantile {
            column: column.into(),
            quantile,
            max_multiplier,
        });
        self
    }

    /// Require every row to satisfy an SQL expression.
    #[must_use]
    pub fn verify(mut self, query: impl Into<String>) -> Self {
        self.verify_queries.push(query.into());
        self
    }
}

/// Run every configured check and return the number of failures.
///
/// Missing values in any column not listed as nullable count as a single
/// failure.
///
/// # Errors
///
/// Returns [`Error::EmptyFrame`] for a frame without rows or columns,
/// [`Error::QaFailed`] in strict mode when a check fails, and an error when a
/// referenced column is missing or a query is not valid SQL.
pub fn df_test(frame: &Frame, options: &QaOptions) -> Result<usize> {
    if frame.is_empty() {
        return Err(Error::EmptyFrame);
    }

    let nulls: Vec<(String, usize)> = frame
        .null_counts()
        .into_iter()
        .filter(|(column, count)| *count > 0 && !options.nullable_cols.contains(column))
        .collect();
    let mut failcount = passert(nulls.is_empty(), || {
        let counts: Vec<String> = nulls.iter().map(|(c, n)| format!("{c}: {n}")).collect();
        format!("Found NA in columns: {}", counts.join(", "))
    });

    failcount += thresholds_test(frame, &options.thresholds)?;
    failcount += quantile_test(frame, &options.max_quantiles)?;
    failcount += query_test(frame, &options.verify_queries)?;
    if let Some(unique_index) = &options.unique_index {
        failcount += unique_index_test(frame, unique_index)?;
    }

    if options.strict && failcount > 0 {
        return Err(Error::QaFailed { failcount });
    }
    Ok(failcount)
}

/// Check that numeric columns stay within their ranges.
///
/// A column without values fails both bounds.
///
/// # Errors
///
/// Returns an error if a column is missing or not numeric.
pub fn thresholds_test(frame: &Frame, thresholds: &[Threshold]) -> Result<usize> {
    let mut failcount = 0;
    for Threshold { column, min, max } in thresholds {
        let values = frame.numeric_column(column)?;
        let lowest = values.iter().copied().reduce(f64::min);
        let highest = values.iter().copied().reduce(f64::max);
        failcount += passert(lowest.is_some_and(|v| v >= *min), || {
            format!("Found {column} value below {min}")
        });
        failcount += passert(highest.is_some_and(|v| v <= *max), || {
            format!("Found {column} value above {max}")
        });
    }
    Ok(failcount)
}

/// Check that no value exceeds its column quantile by more than the
/// allowed multiplier.
///
/// Columns whose quantile is not positive are skipped with a warning.
///
/// # Errors
///
/// Returns an error if a column is missing or not numeric.
pub fn quantile_test(frame: &Frame, max_quantiles: &[MaxQuantile]) -> Result<usize> {
    let mut failcount = 0;
    for MaxQuantile {
        column,
        quantile: q,
        max_multiplier,
    } in max_quantiles
    {
        let values = frame.numeric_column(column)?;
        let threshold = quantile(&values, *q);
        if threshold.is_some_and(|thr| thr <= 0.0) {
            warn!("Skipping {column} max_quantiles because threshold <= 0");
            continue;
        }
        let highest = values.iter().copied().reduce(f64::max);
        let passed = match (highest, threshold) {
            (Some(highest), Some(thr)) => highest / thr <= *max_multiplier,
            _ => false,
        };
        failcount += passert(passed, || {
            format!("Found {column} value above {}", threshold.unwrap_or(f64::NAN))
        });
    }
    Ok(failcount)
}

/// Check that every row satisfies each SQL expression.
///
/// The frame is loaded into an in-memory `SQLite` table so the expressions
/// can reference its columns by name, e.g. `ltv_365 >= ltv_180`. A row
/// where the expression evaluates to NULL is not compliant.
///
/// # Errors
///
/// Returns an error if an expression is not valid SQL for the table.
pub fn query_test(frame: &Frame, verify_queries: &[String]) -> Result<usize> {
    if verify_queries.is_empty() {
        return Ok(0);
    }
    let conn = load_into_sqlite(frame)?;
    let total = frame.len();
    let mut failcount = 0;
    for query in verify_queries {
        let compliant: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM df WHERE ({query})"),
            [],
            |row| row.get(0),
        )?;
        let incompliant = total.saturating_sub(usize::try_from(compliant).unwrap_or(0));
        failcount += passert(incompliant == 0, || {
            format!("Found {incompliant} rows incompliant with {query}")
        });
    }
    Ok(failcount)
}

fn load_into_sqlite(frame: &Frame) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    let columns: Vec<String> = frame.columns().iter().map(|c| quote_ident(c)).collect();
    conn.execute(&format!("CREATE TABLE df ({})", columns.join(", ")), [])?;

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO df VALUES ({})",
            placeholders.join(", ")
        ))?;
        for row in frame.rows() {
            stmt.execute(params_from_iter(row.iter().map(to_sql_value)))?;
        }
    }
    tx.commit()?;
    Ok(conn)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        v if v.is_null() => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(x) => SqlValue::Real(*x),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Check that no row repeats an earlier row on the given columns.
///
/// Missing values compare equal to each other.
///
/// # Errors
///
/// Returns an error if a column is missing.
pub fn unique_index_test<S: AsRef<str>>(frame: &Frame, unique_index: &[S]) -> Result<usize> {
    let indices = unique_index
        .iter()
        .map(|c| frame.column_index(c.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    let mut seen = HashSet::new();
    let has_duplicates = frame
        .rows()
        .iter()
        .map(|row| indices.iter().map(|&i| row[i].group_key()).collect::<Vec<_>>())
        .any(|key| !seen.insert(key));
    Ok(passert(!has_duplicates, || "Found duplicates".to_string()))
}

/// Log `message` as a warning unless the check passed; return the failure count.
pub fn passert(passed: bool, message: impl FnOnce() -> String) -> usize {
    if passed {
        0
    } else {
        warn!("{}", message());
        1
    }
}
