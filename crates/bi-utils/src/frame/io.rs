//! CSV, parquet and JSON encoding of frames.
//!
//! CSV and parquet are the formats exchanged with Redshift. Files ending in
//! `.gz` (what `UNLOAD ... GZIP` produces) are decompressed transparently.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::compute::cast;
use arrow::datatypes::{
    ArrowPrimitiveType, ArrowTemporalType, DataType, Date32Type, Date64Type, Decimal128Type, Field,
    Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, Schema, TimeUnit,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use chrono::NaiveTime;
use flate2::read::MultiGzDecoder;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use super::{DType, Frame, Value};
use crate::error::{Error, Result};

/// Options for [`read_csv`].
#[derive(Debug, Clone)]
pub struct CsvReadOptions {
    /// Field delimiter.
    pub separator: u8,
    /// Columns parsed into timestamps.
    pub parse_dates: Vec<String>,
    /// Columns holding `t`/`f` flags; anything else becomes null.
    pub parse_bools: Vec<String>,
    /// Explicit column types; other columns are inferred.
    pub dtype: HashMap<String, DType>,
}

impl Default for CsvReadOptions {
    fn default() -> Self {
        Self {
            separator: b',',
            parse_dates: Vec::new(),
            parse_bools: Vec::new(),
            dtype: HashMap::new(),
        }
    }
}

impl CsvReadOptions {
    /// Use a different field delimiter.
    #[must_use]
    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = separator;
        self
    }

    /// Parse the given columns as timestamps.
    #[must_use]
    pub fn with_parse_dates<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.parse_dates = cols.into_iter().map(Into::into).collect();
        self
    }

    /// Parse the given columns as `t`/`f` flags.
    #[must_use]
    pub fn with_parse_bools<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.parse_bools = cols.into_iter().map(Into::into).collect();
        self
    }

    /// Cast a column to an explicit type.
    #[must_use]
    pub fn with_dtype(mut self, col: impl Into<String>, dtype: DType) -> Self {
        self.dtype.insert(col.into(), dtype);
        self
    }
}

/// Read a CSV (optionally gzipped) file into a frame.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is malformed, or a value
/// does not fit its requested type.
pub fn read_csv(path: impl AsRef<Path>, options: &CsvReadOptions) -> Result<Frame> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);
    if is_gzip(path) {
        read_csv_from(MultiGzDecoder::new(file), options)
    } else {
        read_csv_from(file, options)
    }
}

/// Read CSV from any reader into a frame.
///
/// # Errors
///
/// Returns an error if the input is malformed or a value does not fit its
/// requested type.
pub fn read_csv_from<R: Read>(reader: R, options: &CsvReadOptions) -> Result<Frame> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.separator)
        .from_reader(reader);
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();

    let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record?;
        for (column, field) in raw.iter_mut().zip(record.iter()) {
            column.push(field.to_string());
        }
    }

    let columns = headers
        .into_iter()
        .zip(raw)
        .map(|(name, fields)| {
            let values = convert_column(&name, fields, options)?;
            Ok((name, values))
        })
        .collect::<Result<Vec<_>>>()?;
    Frame::from_columns(columns)
}

fn convert_column(name: &str, fields: Vec<String>, options: &CsvReadOptions) -> Result<Vec<Value>> {
    if options.parse_bools.iter().any(|c| c == name) {
        return Ok(fields
            .iter()
            .map(|f| match f.as_str() {
                "t" => Value::Bool(true),
                "f" => Value::Bool(false),
                _ => Value::Null,
            })
            .collect());
    }
    let explicit = if options.parse_dates.iter().any(|c| c == name) {
        Some(DType::Timestamp)
    } else {
        options.dtype.get(name).copied()
    };
    let dtype = explicit.unwrap_or_else(|| infer_dtype(&fields));
    fields
        .into_iter()
        .map(|f| {
            if f.is_empty() {
                Ok(Value::Null)
            } else if dtype == DType::Text {
                Ok(Value::Text(f))
            } else {
                Value::Text(f).cast(dtype)
            }
        })
        .collect()
}

fn infer_dtype(fields: &[String]) -> DType {
    let mut present = fields.iter().filter(|f| !f.is_empty()).peekable();
    if present.peek().is_none() {
        return DType::Text;
    }
    let present: Vec<&String> = present.collect();
    if present.iter().all(|f| f.parse::<i64>().is_ok()) {
        DType::Int
    } else if present.iter().all(|f| f.parse::<f64>().is_ok()) {
        DType::Float
    } else {
        DType::Text
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
}

/// Write a frame as CSV with a header row. Nulls become empty fields.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_csv(frame: &Frame, path: impl AsRef<Path>, separator: u8) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(separator)
        .from_path(path)?;
    writer.write_record(frame.columns())?;
    for row in frame.rows() {
        writer.write_record(row.iter().map(|v| if v.is_null() { String::new() } else { v.to_string() }))?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a parquet file into a frame.
///
/// Integer columns become [`Value::Int`], decimals and floats
/// [`Value::Float`], dates and timestamps keep their type. Other arrow types
/// are read as text.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or decoded.
pub fn read_parquet(path: impl AsRef<Path>) -> Result<Frame> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
    let mut frame = Frame::new(builder.schema().fields().iter().map(|f| f.name().clone()))?;
    for batch in builder.build()? {
        let batch = batch?;
        let mut columns = batch
            .columns()
            .iter()
            .map(|array| column_values(array.as_ref()).map(Vec::into_iter))
            .collect::<Result<Vec<_>>>()?;
        for _ in 0..batch.num_rows() {
            frame.push_row(columns.iter_mut().filter_map(Iterator::next).collect())?;
        }
    }
    Ok(frame)
}

/// Write a frame as a snappy-compressed parquet file.
///
/// Each column takes the type of its values. Integers mixed with floats are
/// written as floats, other mixes as text. Timestamps are stored in
/// microseconds.
///
/// # Errors
///
/// Returns [`Error::EmptyFrame`] for a frame without columns, or an error if
/// the file cannot be written.
pub fn write_parquet(frame: &Frame, path: impl AsRef<Path>) -> Result<()> {
    if frame.num_columns() == 0 {
        return Err(Error::EmptyFrame);
    }
    let arrays: Vec<ArrayRef> = (0..frame.num_columns())
        .map(|idx| column_array(frame, idx))
        .collect();
    let fields: Vec<Field> = frame
        .columns()
        .iter()
        .zip(&arrays)
        .map(|(name, array)| Field::new(name, array.data_type().clone(), true))
        .collect();
    let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?;

    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(File::create(path)?, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn column_dtype(frame: &Frame, idx: usize) -> Option<DType> {
    frame
        .rows()
        .iter()
        .map(|row| &row[idx])
        .filter(|value| !value.is_null())
        .filter_map(Value::dtype)
        .reduce(|acc, dtype| match (acc, dtype) {
            (a, b) if a == b => a,
            (DType::Int, DType::Float) | (DType::Float, DType::Int) => DType::Float,
            (DType::Date, DType::Timestamp) | (DType::Timestamp, DType::Date) => DType::Timestamp,
            _ => DType::Text,
        })
}

fn column_array(frame: &Frame, idx: usize) -> ArrayRef {
    let values = frame.rows().iter().map(|row| &row[idx]);
    match column_dtype(frame, idx) {
        Some(DType::Bool) => Arc::new(
            values
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        Some(DType::Int) => Arc::new(
            values
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        Some(DType::Float) => Arc::new(values.map(Value::as_f64).collect::<Float64Array>()),
        Some(DType::Date) => Arc::new(
            values
                .map(|v| match v {
                    Value::Date(d) => Some(Date32Type::from_naive_date(*d)),
                    _ => None,
                })
                .collect::<Date32Array>(),
        ),
        Some(DType::Timestamp) => Arc::new(
            values
                .map(|v| match v {
                    Value::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
                    Value::Date(d) => Some(d.and_time(NaiveTime::MIN).and_utc().timestamp_micros()),
                    _ => None,
                })
                .collect::<TimestampMicrosecondArray>(),
        ),
        Some(DType::Text) | None => Arc::new(
            values
                .map(|v| (!v.is_null()).then(|| v.to_string()))
                .collect::<StringArray>(),
        ),
    }
}

#[allow(clippy::cast_precision_loss)]
fn column_values(array: &dyn Array) -> Result<Vec<Value>> {
    let values = match array.data_type() {
        DataType::Null => vec![Value::Null; array.len()],
        DataType::Boolean => array
            .as_boolean()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::Bool))
            .collect(),
        DataType::Int8 => ints::<Int8Type>(array),
        DataType::Int16 => ints::<Int16Type>(array),
        DataType::Int32 => ints::<Int32Type>(array),
        DataType::Int64 => ints::<Int64Type>(array),
        DataType::UInt8 => ints::<UInt8Type>(array),
        DataType::UInt16 => ints::<UInt16Type>(array),
        DataType::UInt32 => ints::<UInt32Type>(array),
        DataType::UInt64 => column_values(cast(array, &DataType::Float64)?.as_ref())?,
        DataType::Float32 => array
            .as_primitive::<Float32Type>()
            .iter()
            .map(|v| v.map_or(Value::Null, |x| Value::Float(f64::from(x))))
            .collect(),
        DataType::Float64 => array
            .as_primitive::<Float64Type>()
            .iter()
            .map(|v| v.map_or(Value::Null, Value::Float))
            .collect(),
        DataType::Decimal128(_, scale) => {
            let divisor = 10_f64.powi(i32::from(*scale));
            array
                .as_primitive::<Decimal128Type>()
                .iter()
                .map(|v| v.map_or(Value::Null, |d| Value::Float(d as f64 / divisor)))
                .collect()
        }
        DataType::Date32 => dates::<Date32Type>(array),
        DataType::Date64 => dates::<Date64Type>(array),
        DataType::Timestamp(TimeUnit::Second, _) => timestamps::<TimestampSecondType>(array),
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            timestamps::<TimestampMillisecondType>(array)
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            timestamps::<TimestampMicrosecondType>(array)
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            timestamps::<TimestampNanosecondType>(array)
        }
        DataType::Utf8 => texts(array.as_string::<i32>().iter()),
        DataType::LargeUtf8 => texts(array.as_string::<i64>().iter()),
        _ => {
            let text = cast(array, &DataType::Utf8)?;
            texts(text.as_string::<i32>().iter())
        }
    };
    Ok(values)
}

fn ints<T: ArrowPrimitiveType>(array: &dyn Array) -> Vec<Value>
where
    T::Native: Into<i64>,
{
    array
        .as_primitive::<T>()
        .iter()
        .map(|v| v.map_or(Value::Null, |i| Value::Int(i.into())))
        .collect()
}

fn dates<T: ArrowTemporalType>(array: &dyn Array) -> Vec<Value>
where
    i64: From<T::Native>,
{
    let array = array.as_primitive::<T>();
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                Value::Null
            } else {
                array.value_as_date(i).map_or(Value::Null, Value::Date)
            }
        })
        .collect()
}

fn timestamps<T: ArrowTemporalType>(array: &dyn Array) -> Vec<Value>
where
    i64: From<T::Native>,
{
    let array = array.as_primitive::<T>();
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                Value::Null
            } else {
                array.value_as_datetime(i).map_or(Value::Null, Value::Timestamp)
            }
        })
        .collect()
}

fn texts<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Vec<Value> {
    values
        .map(|v| v.map_or(Value::Null, |s| Value::Text(s.to_string())))
        .collect()
}

/// Write a frame as JSON.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_json(frame: &Frame, path: impl AsRef<Path>) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, frame)?;
    Ok(())
}

/// Read a frame written by [`write_json`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or decoded.
pub fn read_json(path: impl AsRef<Path>) -> Result<Frame> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
