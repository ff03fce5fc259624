//! Supervised feature transformers.
//!
//! Each transformer is configured, fit on a [`Frame`] of features plus a
//! numeric target, and then applied to new frames. Using one before `fit`
//! fails with [`Error::NotFitted`].

mod hierarchical_encoder;
mod quantile_clipper;
mod target_encoder;

pub use hierarchical_encoder::HierarchicalEncoder;
pub use quantile_clipper::QuantileClipper;
pub use target_encoder::TargetEncoder;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// Default shrinkage strength of the encoders.
pub const DEFAULT_C: f64 = 30.0;

/// Columns to encode: the configured ones, or every column except `exclude`.
fn resolve_cols(cols: Option<&[String]>, frame: &Frame, exclude: Option<&str>) -> Vec<String> {
    match cols {
        Some(cols) => cols.to_vec(),
        None => frame
            .columns()
            .iter()
            .filter(|c| Some(c.as_str()) != exclude)
            .cloned()
            .collect(),
    }
}

/// Check that the target matches the frame and holds only finite numbers.
fn check_target(frame: &Frame, y: &[f64]) -> Result<()> {
    if frame.len() != y.len() {
        return Err(Error::InconsistentLength(vec![frame.len(), y.len()]));
    }
    if y.is_empty() {
        return Err(Error::invalid_argument(
            "found array with 0 sample(s) while a minimum of 1 is required",
        ));
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(Error::invalid_argument("target contains NaN or infinity"));
    }
    Ok(())
}

/// Per-row weights from a frame column, or all ones.
fn sample_weights(frame: &Frame, weight_col: Option<&str>) -> Result<Vec<f64>> {
    let Some(col) = weight_col else {
        return Ok(vec![1.0; frame.len()]);
    };
    frame
        .column(col)?
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                Error::invalid_argument(format!("sample weight {v:?} in {col} is not a number"))
            })
        })
        .collect()
}

/// Column positions of `cols` in `frame`.
fn column_indices(frame: &Frame, cols: &[String]) -> Result<Vec<usize>> {
    cols.iter().map(|c| frame.column_index(c)).collect()
}

fn weighted_ratio(y: &[f64], weights: &[f64]) -> Result<f64> {
    crate::metrics::average(y, Some(weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Value;

    fn sample() -> Frame {
        Frame::from_columns(vec![
            ("media_source", vec!["fb".into(), "google".into()]),
            ("weight", vec![1_i64.into(), 3_i64.into()]),
        ])
        .unwrap()
    }

    #[test]
    fn test_resolve_cols() {
        assert_eq!(resolve_cols(None, &sample(), Some("weight")), vec!["media_source"]);
        assert_eq!(resolve_cols(None, &sample(), None), vec!["media_source", "weight"]);
        let cols = vec!["weight".to_string()];
        assert_eq!(resolve_cols(Some(cols.as_slice()), &sample(), None), cols);
    }

    #[test]
    fn test_check_target() {
        assert!(check_target(&sample(), &[1.0, 0.0]).is_ok());
        assert!(matches!(
            check_target(&sample(), &[1.0]),
            Err(Error::InconsistentLength(_))
        ));
        assert!(check_target(&sample(), &[1.0, f64::NAN]).is_err());
    }

    #[test]
    fn test_sample_weights() {
        assert_eq!(sample_weights(&sample(), None).unwrap(), vec![1.0, 1.0]);
        assert_eq!(sample_weights(&sample(), Some("weight")).unwrap(), vec![1.0, 3.0]);
        assert!(sample_weights(&sample(), Some("media_source")).is_err());

        let mut frame = sample();
        frame.push_row(vec!["fb".into(), Value::Null]).unwrap();
        assert!(sample_weights(&frame, Some("weight")).is_err());
    }

    #[test]
    fn test_weighted_ratio() {
        assert!((weighted_ratio(&[1.0, 0.0], &[1.0, 3.0]).unwrap() - 0.25).abs() < 1e-12);
    }
}
