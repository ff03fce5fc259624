//! SQL text helpers: query templates and `SET`/`WHERE` clause builders.
//!
//! Column names are inserted verbatim; values are rendered as SQL literals
//! with single quotes doubled.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{Error, Result};
use crate::frame::Value;

/// Positional and named parameters for [`get_query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    positional: Vec<String>,
    named: HashMap<String, String>,
}

impl QueryParams {
    /// Create an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional parameter.
    #[must_use]
    pub fn arg(mut self, value: impl Display) -> Self {
        self.positional.push(value.to_string());
        self
    }

    /// Set a named parameter.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.named.insert(name.into(), value.to_string());
        self
    }
}

/// Read a query template from a file and fill in its parameters.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a placeholder has no value.
pub fn get_query(sql_path: impl AsRef<Path>, params: &QueryParams) -> Result<String> {
    let template = std::fs::read_to_string(sql_path)?;
    render_query(&template, params)
}

/// Fill in a query template.
///
/// `{}` takes the next positional parameter, `{0}` a positional parameter by
/// index and `{name}` a named parameter. `{{` and `}}` are literal braces.
/// Parameters the template does not use are ignored.
///
/// # Errors
///
/// Returns [`Error::MissingQueryParam`] for a placeholder without a value and
/// [`Error::InvalidArgument`] for unbalanced braces.
pub fn render_query(template: &str, params: &QueryParams) -> Result<String> {
    let mut query = String::with_capacity(template.len());
    let mut next_positional = 0;
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                query.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                query.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => {
                            return Err(Error::invalid_argument(
                                "single '{' encountered in query template",
                            ))
                        }
                    }
                }
                // Format specs are not supported and are dropped
                let name = field.split(':').next().unwrap_or_default().trim();
                let value = if name.is_empty() {
                    let value = params.positional.get(next_positional);
                    next_positional += 1;
                    value
                } else if let Ok(index) = name.parse::<usize>() {
                    params.positional.get(index)
                } else {
                    params.named.get(name)
                };
                let value = value.ok_or_else(|| {
                    Error::MissingQueryParam(if name.is_empty() {
                        format!("positional #{next_positional}")
                    } else {
                        name.to_string()
                    })
                })?;
                query.push_str(value);
            }
            '}' => {
                return Err(Error::invalid_argument(
                    "single '}' encountered in query template",
                ))
            }
            c => query.push(c),
        }
    }
    Ok(query)
}

/// A value rendered into a SQL clause.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// `NULL`.
    Null,
    /// `TRUE` or `FALSE`.
    Bool(bool),
    /// Bare integer.
    Int(i64),
    /// Bare float.
    Float(f64),
    /// Quoted text.
    Text(String),
    /// Quoted ISO date.
    Date(NaiveDate),
    /// Quoted ISO timestamp.
    Timestamp(NaiveDateTime),
    /// A list, rendered as an `IN` condition.
    List(Vec<SqlValue>),
}

impl SqlValue {
    fn literal(&self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(x) => x.to_string(),
            Self::Text(s) => quote(s),
            Self::Date(d) => quote(&d.to_string()),
            Self::Timestamp(ts) => quote(&ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Self::List(values) => {
                let items: Vec<String> = values.iter().map(Self::literal).collect();
                format!("({})", items.join(", "))
            }
        }
    }
}

impl Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.literal())
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl From<&Value> for SqlValue {
    fn from(value: &Value) -> Self {
        if value.is_null() {
            return Self::Null;
        }
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Int(i) => Self::Int(*i),
            Value::Float(x) => Self::Float(*x),
            Value::Text(s) => Self::Text(s.clone()),
            Value::Date(d) => Self::Date(*d),
            Value::Timestamp(ts) => Self::Timestamp(*ts),
        }
    }
}

impl<T: Into<SqlValue>> From<Vec<T>> for SqlValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Build a `SET` clause from column/value pairs.
///
/// ```
/// use bi_utils::sql::{build_set, SqlValue};
///
/// let set = build_set(&[("version", 4_i64.into()), ("predict_dt", SqlValue::Null)]).unwrap();
/// assert_eq!(set, "SET version = 4, predict_dt = NULL");
/// ```
///
/// # Errors
///
/// Returns an error when no pairs are given or a value is a list.
pub fn build_set(equal_conditions: &[(&str, SqlValue)]) -> Result<String> {
    if equal_conditions.is_empty() {
        return Err(Error::invalid_argument(
            "Pass at least 1 equal condition as keyword argument",
        ));
    }
    let assignments = equal_conditions
        .iter()
        .map(|(column, value)| match value {
            SqlValue::List(_) => Err(Error::invalid_argument(format!(
                "cannot SET {column} to a list"
            ))),
            value => Ok(format!("{column} = {value}")),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("SET {}", assignments.join(", ")))
}

/// Build a `WHERE` clause from column/value pairs.
///
/// Scalars become equality conditions, nulls `IS NULL` and lists `IN (...)`.
/// An empty slice yields `WHERE 1 = 1` and an empty list matches nothing.
#[must_use]
pub fn build_where(conditions: &[(&str, SqlValue)]) -> String {
    if conditions.is_empty() {
        return "WHERE 1 = 1".to_string();
    }
    let parts: Vec<String> = conditions
        .iter()
        .map(|(column, value)| match value {
            SqlValue::Null => format!("{column} IS NULL"),
            SqlValue::List(values) if values.is_empty() => "1 = 0".to_string(),
            SqlValue::List(_) => format!("{column} IN {value}"),
            value => format!("{column} = {value}"),
        })
        .collect();
    format!("WHERE {}", parts.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 10, 1).unwrap()
    }

    #[test]
    fn test_render_query_positional_and_named() {
        let template = "SELECT {}\nFROM {table}\nWHERE predict_dt = {predict_dt}";
        let params = QueryParams::new()
            .arg("*")
            .named("table", "sub_ltv")
            .named("predict_dt", date());
        assert_eq!(
            render_query(template, &params).unwrap(),
            "SELECT *\nFROM sub_ltv\nWHERE predict_dt = 2020-10-01"
        );
    }

    #[test]
    fn test_render_query_ignores_unused_params() {
        let params = QueryParams::new()
            .arg("ltv")
            .named("table", "source.ads_ltv")
            .named("version", 2);
        assert_eq!(
            render_query("SELECT {} FROM {table}", &params).unwrap(),
            "SELECT ltv FROM source.ads_ltv"
        );
    }

    #[test]
    fn test_render_query_indexed_and_escaped() {
        let params = QueryParams::new().arg("a").arg("b");
        assert_eq!(
            render_query("{1}{0} {{literal}}", &params).unwrap(),
            "ba {literal}"
        );
    }

    #[test]
    fn test_render_query_missing_param() {
        let err = render_query("SELECT {col}", &QueryParams::new()).unwrap_err();
        assert!(matches!(err, Error::MissingQueryParam(name) if name == "col"));
        assert!(render_query("SELECT {}", &QueryParams::new()).is_err());
    }

    #[test]
    fn test_render_query_unbalanced() {
        assert!(render_query("SELECT {", &QueryParams::new()).is_err());
        assert!(render_query("SELECT }", &QueryParams::new()).is_err());
    }

    #[test]
    fn test_get_query_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.sql");
        std::fs::write(&path, "SELECT {}\nFROM {table}").unwrap();

        let params = QueryParams::new().arg("*").named("table", "sub_ltv");
        assert_eq!(get_query(&path, &params).unwrap(), "SELECT *\nFROM sub_ltv");
    }

    #[test]
    fn test_build_set() {
        assert_eq!(
            build_set(&[("predict_dt", "2020-10-01".into())]).unwrap(),
            "SET predict_dt = '2020-10-01'"
        );
        assert_eq!(
            build_set(&[("predict_dt", date().into())]).unwrap(),
            "SET predict_dt = '2020-10-01'"
        );
        assert_eq!(
            build_set(&[("version", 4_i64.into()), ("predict_dt", SqlValue::Null)]).unwrap(),
            "SET version = 4, predict_dt = NULL"
        );
    }

    #[test]
    fn test_build_set_wo_conditions() {
        let err = build_set(&[]).unwrap_err();
        assert!(err.to_string().contains(" at least 1 equal condition "));
    }

    #[test]
    fn test_build_set_rejects_list() {
        assert!(build_set(&[("os_name", vec!["ios"].into())]).is_err());
    }

    #[test]
    fn test_build_where() {
        assert_eq!(
            build_where(&[("predict_dt", "2020-10-01".into())]),
            "WHERE predict_dt = '2020-10-01'"
        );
        assert_eq!(
            build_where(&[("predict_dt", date().into())]),
            "WHERE predict_dt = '2020-10-01'"
        );
        assert_eq!(
            build_where(&[("version", 4_i64.into()), ("predict_dt", SqlValue::Null)]),
            "WHERE version = 4 AND predict_dt IS NULL"
        );
        assert_eq!(build_where(&[]), "WHERE 1 = 1");
        assert_eq!(
            build_where(&[("os_name", vec!["ios", "web"].into())]),
            "WHERE os_name IN ('ios', 'web')"
        );
    }

    #[test]
    fn test_build_where_mixed_list_and_empty_list() {
        assert_eq!(
            build_where(&[("version", vec![1_i64, 2].into())]),
            "WHERE version IN (1, 2)"
        );
        assert_eq!(
            build_where(&[("version", Vec::<i64>::new().into())]),
            "WHERE 1 = 0"
        );
    }

    #[test]
    fn test_quotes_are_escaped() {
        assert_eq!(
            build_where(&[("name", "O'Brien".into())]),
            "WHERE name = 'O''Brien'"
        );
    }

    #[test]
    fn test_frame_values_as_literals() {
        let ts = date().and_hms_opt(12, 30, 0).unwrap();
        assert_eq!(SqlValue::from(&Value::Bool(true)).to_string(), "TRUE");
        assert_eq!(SqlValue::from(&Value::Float(f64::NAN)), SqlValue::Null);
        assert_eq!(SqlValue::from(&Value::Text("it's".into())).to_string(), "'it''s'");
        assert_eq!(
            SqlValue::from(&Value::Timestamp(ts)).to_string(),
            "'2020-10-01 12:30:00'"
        );
    }
}
