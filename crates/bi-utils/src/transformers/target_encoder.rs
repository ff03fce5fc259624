//! Target encoding of categorical columns.

use std::collections::HashMap;

use tracing::info;

use super::{check_target, column_indices, resolve_cols, sample_weights, weighted_ratio, DEFAULT_C};
use crate::error::{Error, Result};
use crate::frame::{Frame, Value};

/// Replaces each category with the mean target of its rows, shrunk toward
/// the global mean.
///
/// A category with weight `n` and weighted target sum `s` is encoded as
/// `(s + ratio * C) / (n + C)`, where `ratio` is the global weighted mean.
/// Categories unseen during fit (and missing values) get `ratio`.
#[derive(Debug, Clone)]
pub struct TargetEncoder {
    cols: Option<Vec<String>>,
    sample_weight_col: Option<String>,
    c: f64,
    verbose: bool,
    fitted: Option<Fitted>,
}

#[derive(Debug, Clone)]
struct Fitted {
    cols: Vec<String>,
    total_ratio: f64,
    groups: HashMap<String, HashMap<String, f64>>,
}

impl Default for TargetEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetEncoder {
    /// Create an encoder with `C = 30` over every non-weight column.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cols: None,
            sample_weight_col: None,
            c: DEFAULT_C,
            verbose: false,
            fitted: None,
        }
    }

    /// Encode only these columns.
    #[must_use]
    pub fn with_cols<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.cols = Some(cols.into_iter().map(Into::into).collect());
        self
    }

    /// Weight rows by this column.
    #[must_use]
    pub fn with_sample_weight_col(mut self, col: impl Into<String>) -> Self {
        self.sample_weight_col = Some(col.into());
        self
    }

    /// Set the shrinkage strength; must be greater than 1.
    #[must_use]
    pub fn with_c(mut self, c: f64) -> Self {
        self.c = c;
        self
    }

    /// Log progress at INFO.
    #[must_use]
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Global weighted mean of the target seen during fit.
    #[must_use]
    pub fn total_ratio(&self) -> Option<f64> {
        self.fitted.as_ref().map(|f| f.total_ratio)
    }

    /// Learn per-category ratios.
    ///
    /// # Errors
    ///
    /// Returns an error if `C <= 1`, a column is missing, the target does not
    /// match the frame, or a weight is not numeric.
    pub fn fit(&mut self, x: &Frame, y: &[f64]) -> Result<&mut Self> {
        if self.c <= 1.0 {
            return Err(Error::invalid_argument(format!("C={} must be > 1", self.c)));
        }
        check_target(x, y)?;
        let cols = resolve_cols(self.cols.as_deref(), x, self.sample_weight_col.as_deref());
        let indices = column_indices(x, &cols)?;
        let weights = sample_weights(x, self.sample_weight_col.as_deref())?;
        if self.verbose {
            info!("Fitting...");
        }

        let total_ratio = weighted_ratio(y, &weights)?;
        let mut groups = HashMap::with_capacity(cols.len());
        for (col, &idx) in cols.iter().zip(&indices) {
            // (numerator, denominator) per category
            let mut sums: HashMap<String, (f64, f64)> = HashMap::new();
            for ((row, target), weight) in x.rows().iter().zip(y).zip(&weights) {
                if row[idx].is_null() {
                    continue;
                }
                let entry = sums.entry(row[idx].group_key()).or_default();
                entry.0 += target * weight;
                entry.1 += weight;
            }
            let ratios = sums
                .into_iter()
                .map(|(key, (num, den))| (key, (num + total_ratio * self.c) / (den + self.c)))
                .collect();
            groups.insert(col.clone(), ratios);
        }

        self.fitted = Some(Fitted {
            cols,
            total_ratio,
            groups,
        });
        Ok(self)
    }

    /// Encode the fitted columns of `x`, one float column each.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFitted`] before [`fit`](Self::fit), or an error if
    /// a fitted column is missing from `x`.
    pub fn transform(&self, x: &Frame) -> Result<Frame> {
        let fitted = self.fitted.as_ref().ok_or(Error::NotFitted("TargetEncoder"))?;
        let indices = column_indices(x, &fitted.cols)?;
        if self.verbose {
            info!("Transforming...");
        }

        let mut columns = Vec::with_capacity(fitted.cols.len());
        for (col, &idx) in fitted.cols.iter().zip(&indices) {
            if self.verbose {
                info!("Mapping {col}...");
            }
            let ratios = &fitted.groups[col];
            let values = x
                .rows()
                .iter()
                .map(|row| {
                    let ratio = if row[idx].is_null() {
                        None
                    } else {
                        ratios.get(&row[idx].group_key()).copied()
                    };
                    Value::Float(ratio.unwrap_or(fitted.total_ratio))
                })
                .collect();
            columns.push((col.clone(), values));
        }
        if self.verbose {
            info!("Completed.");
        }
        Frame::from_columns(columns)
    }

    /// [`fit`](Self::fit) then [`transform`](Self::transform) the same frame.
    ///
    /// # Errors
    ///
    /// Returns any error from fitting or transforming.
    pub fn fit_transform(&mut self, x: &Frame, y: &[f64]) -> Result<Frame> {
        self.fit(x, y)?;
        self.transform(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    fn data() -> (Frame, Vec<f64>) {
        let frame = Frame::from_columns(vec![
            ("media_source", vec!["fb".into(), "fb".into(), "google".into(), "google".into()]),
            ("campaign_id", vec![1_i64.into(), 2_i64.into(), 1_i64.into(), 1_i64.into()]),
        ])
        .unwrap();
        (frame, vec![1.0, 1.0, 0.0, 1.0])
    }

    #[test]
    fn test_encoder_ratios() {
        let (x, y) = data();
        let mut encoder = TargetEncoder::new().with_c(2.0);
        let result = encoder.fit_transform(&x, &y).unwrap();
        assert_eq!(result.columns(), &["media_source", "campaign_id"]);

        let total = 0.75;
        assert_close(encoder.total_ratio().unwrap(), total);
        let fb = (2.0 + total * 2.0) / (2.0 + 2.0);
        let google = (1.0 + total * 2.0) / (2.0 + 2.0);
        let sources = result.numeric_column("media_source").unwrap();
        assert_close(sources[0], fb);
        assert_close(sources[2], google);

        let campaign_1 = (2.0 + total * 2.0) / (3.0 + 2.0);
        let campaign_2 = (1.0 + total * 2.0) / (1.0 + 2.0);
        let campaigns = result.numeric_column("campaign_id").unwrap();
        assert_close(campaigns[0], campaign_1);
        assert_close(campaigns[1], campaign_2);
    }

    #[test]
    fn test_encoder_subset_and_unseen() {
        let (x, y) = data();
        let mut encoder = TargetEncoder::new().with_cols(["media_source"]).with_c(10.0);
        encoder.fit(&x, &y).unwrap();

        let new = Frame::from_columns(vec![(
            "media_source",
            vec!["tiktok".into(), Value::Null],
        )])
        .unwrap();
        let result = encoder.transform(&new).unwrap();
        assert_eq!(result.columns(), &["media_source"]);
        assert_eq!(result.numeric_column("media_source").unwrap(), vec![0.75, 0.75]);
    }

    #[test]
    fn test_encoder_sample_weight() {
        let (mut x, y) = data();
        let weights = vec![1_i64.into(), 1_i64.into(), 3_i64.into(), 1_i64.into()];
        x = Frame::from_columns(vec![
            ("media_source", x.column("media_source").unwrap().cloned().collect()),
            ("w", weights),
        ])
        .unwrap();
        let mut encoder = TargetEncoder::new().with_sample_weight_col("w").with_c(2.0);
        let result = encoder.fit_transform(&x, &y).unwrap();
        // the weight column is not encoded
        assert_eq!(result.columns(), &["media_source"]);
        assert_close(encoder.total_ratio().unwrap(), 3.0 / 6.0);
    }

    #[test]
    fn test_encoder_invalid_c() {
        let (x, y) = data();
        let err = TargetEncoder::new().with_c(1.0).fit(&x, &y).unwrap_err();
        assert!(err.to_string().contains("must be > 1"));
    }

    #[test]
    fn test_encoder_not_fitted() {
        let (x, _) = data();
        assert!(matches!(
            TargetEncoder::new().transform(&x),
            Err(Error::NotFitted(_))
        ));
    }
}
