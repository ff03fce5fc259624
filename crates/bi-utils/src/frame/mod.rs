//! In-memory tables.
//!
//! A [`Frame`] is a small row-major table with named columns and typed
//! [`Value`] cells. It is what the warehouse helpers read and write, what the
//! QA checks inspect and what the transformers are fit on.

pub mod io;
mod value;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use io::{
    read_csv, read_json, read_parquet, write_csv, write_json, write_parquet, CsvReadOptions,
};
pub use value::{DType, Value};

/// A table of named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Frame {
    /// Create an empty frame with the given columns.
    ///
    /// # Errors
    ///
    /// Returns an error if a column name repeats.
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Result<Self> {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut seen = HashSet::new();
        if let Some(dup) = columns.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(Error::invalid_argument(format!("duplicate column: {dup}")));
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Build a frame from column vectors.
    ///
    /// # Errors
    ///
    /// Returns an error if column names repeat or the columns differ in length.
    pub fn from_columns<S: Into<String>>(columns: Vec<(S, Vec<Value>)>) -> Result<Self> {
        let (names, values): (Vec<String>, Vec<Vec<Value>>) =
            columns.into_iter().map(|(n, v)| (n.into(), v)).unzip();
        let mut frame = Self::new(names)?;
        let lengths: Vec<usize> = values.iter().map(Vec::len).collect();
        if lengths.windows(2).any(|w| w[0] != w[1]) {
            return Err(Error::InconsistentLength(lengths));
        }
        let n_rows = lengths.first().copied().unwrap_or(0);
        let mut iters: Vec<_> = values.into_iter().map(Vec::into_iter).collect();
        frame.rows = (0..n_rows)
            .map(|_| iters.iter_mut().filter_map(Iterator::next).collect())
            .collect();
        Ok(frame)
    }

    /// Append a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row width differs from the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::InconsistentLength(vec![
                self.columns.len(),
                row.len(),
            ]));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// A frame is empty when it has no rows or no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty() || self.columns.is_empty()
    }

    /// Number of columns.
    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Column names in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Position of a column.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingColumn`] if there is no such column.
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::MissingColumn(name.to_string()))
    }

    /// Iterate over the values of one column.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingColumn`] if there is no such column.
    pub fn column(&self, name: &str) -> Result<impl Iterator<Item = &Value> + '_> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(move |row| &row[idx]))
    }

    /// Non-null values of a numeric column.
    ///
    /// # Errors
    ///
    /// Returns an error if the column is missing or holds non-numeric values.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<f64>> {
        self.column(name)?
            .filter(|v| !v.is_null())
            .map(|v| {
                v.as_f64().ok_or_else(|| Error::Cast {
                    value: v.to_string(),
                    dtype: DType::Float.to_string(),
                })
            })
            .collect()
    }

    /// Keep only the given columns, in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error if a column is missing or repeated.
    pub fn select<S: AsRef<str>>(&self, columns: &[S]) -> Result<Self> {
        let indices = columns
            .iter()
            .map(|c| self.column_index(c.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let mut frame = Self::new(columns.iter().map(|c| c.as_ref().to_string()))?;
        frame.rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(frame)
    }

    /// Stack frames with identical columns on top of each other.
    ///
    /// # Errors
    ///
    /// Returns an error if the frames have different columns.
    pub fn concat(frames: impl IntoIterator<Item = Frame>) -> Result<Self> {
        let mut frames = frames.into_iter();
        let Some(mut result) = frames.next() else {
            return Ok(Self::default());
        };
        for frame in frames {
            if frame.columns != result.columns {
                return Err(Error::invalid_argument(format!(
                    "cannot concat frames with columns {:?} and {:?}",
                    result.columns, frame.columns
                )));
            }
            result.rows.extend(frame.rows);
        }
        Ok(result)
    }

    /// Cast columns to the given types.
    ///
    /// # Errors
    ///
    /// Returns an error if a column is missing or a value cannot be cast.
    pub fn astype(mut self, dtypes: &HashMap<String, DType>) -> Result<Self> {
        for (name, dtype) in dtypes {
            let idx = self.column_index(name)?;
            for row in &mut self.rows {
                row[idx] = row[idx].cast(*dtype)?;
            }
        }
        Ok(self)
    }

    /// Number of missing values per column, in column order.
    #[must_use]
    pub fn null_counts(&self) -> Vec<(String, usize)> {
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let count = self.rows.iter().filter(|row| row[idx].is_null()).count();
                (name.clone(), count)
            })
            .collect()
    }

    /// Remove a column and return its values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingColumn`] if there is no such column.
    pub fn pop_column(&mut self, name: &str) -> Result<Vec<Value>> {
        let idx = self.column_index(name)?;
        self.columns.remove(idx);
        Ok(self.rows.iter_mut().map(|row| row.remove(idx)).collect())
    }
}
