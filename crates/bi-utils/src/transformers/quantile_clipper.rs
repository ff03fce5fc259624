//! Per-group clipping of a target by its quantiles.

use std::collections::HashMap;

use tracing::warn;

use super::{check_target, column_indices};
use crate::error::{Error, Result};
use crate::frame::{Frame, Value};
use crate::metrics::quantile;

const DEFAULT_Q: f64 = 0.001;

/// Clips the target of each group (rows sharing the values of `cols`) to
/// the group's `[q, 1 - q]` quantile range.
#[derive(Debug, Clone)]
pub struct QuantileClipper {
    cols: Option<Vec<String>>,
    q: f64,
    fitted: Option<Fitted>,
}

#[derive(Debug, Clone)]
struct Fitted {
    cols: Vec<String>,
    bounds: HashMap<Vec<String>, (f64, f64)>,
}

impl Default for QuantileClipper {
    fn default() -> Self {
        Self::new()
    }
}

impl QuantileClipper {
    /// Create a clipper with `q = 0.001` grouping by every column.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cols: None,
            q: DEFAULT_Q,
            fitted: None,
        }
    }

    /// Group by these columns.
    #[must_use]
    pub fn with_cols<S: Into<String>>(mut self, cols: impl IntoIterator<Item = S>) -> Self {
        self.cols = Some(cols.into_iter().map(Into::into).collect());
        self
    }

    /// Set the lower quantile; must be in `(0, 0.5]`.
    #[must_use]
    pub fn with_q(mut self, q: f64) -> Self {
        self.q = q;
        self
    }

    /// Number of groups seen during fit.
    #[must_use]
    pub fn n_groups(&self) -> Option<usize> {
        self.fitted.as_ref().map(|f| f.bounds.len())
    }

    fn group_key(row: &[Value], indices: &[usize]) -> Option<Vec<String>> {
        indices
            .iter()
            .map(|&i| (!row[i].is_null()).then(|| row[i].group_key()))
            .collect()
    }

    /// Learn the quantile bounds of every group.
    ///
    /// # Errors
    ///
    /// Returns an error if `q` is outside `(0, 0.5]`, a column is missing, or
    /// the target does not match the frame.
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(&mut self, x: &Frame, y: &[f64]) -> Result<&mut Self> {
        if !(self.q > 0.0 && self.q <= 0.5) {
            return Err(Error::invalid_argument(format!(
                "q={} must be in (0, 0.5] interval",
                self.q
            )));
        }
        check_target(x, y)?;
        if (x.len() as f64) < 1.0 / self.q {
            warn!(
                "q={} is too small for given data. Quantiles are equivalent to min/max",
                self.q
            );
        }
        let cols = self.cols.clone().unwrap_or_else(|| x.columns().to_vec());
        let indices = column_indices(x, &cols)?;

        let mut groups: HashMap<Vec<String>, Vec<f64>> = HashMap::new();
        for (row, &target) in x.rows().iter().zip(y) {
            // Rows with a missing group value belong to no group
            if let Some(key) = Self::group_key(row, &indices) {
                groups.entry(key).or_default().push(target);
            }
        }
        let bounds = groups
            .into_iter()
            .filter_map(|(key, targets)| {
                let lower = quantile(&targets, self.q)?;
                let upper = quantile(&targets, 1.0 - self.q)?;
                Some((key, (lower, upper)))
            })
            .collect();

        self.fitted = Some(Fitted { cols, bounds });
        Ok(self)
    }

    /// Clip each target to the bounds of its group.
    ///
    /// Rows of groups not seen during fit are bounded by the min and max of
    /// `y` itself, so they pass through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFitted`] before [`fit`](Self::fit), or an error if
    /// a column is missing or the target does not match the frame.
    pub fn transform(&self, x: &Frame, y: &[f64]) -> Result<Vec<f64>> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or(Error::NotFitted("QuantileClipper"))?;
        check_target(x, y)?;
        let indices = column_indices(x, &fitted.cols)?;
        let y_min = y.iter().copied().fold(f64::INFINITY, f64::min);
        let y_max = y.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Ok(x.rows()
            .iter()
            .zip(y)
            .map(|(row, &target)| {
                let (lower, upper) = Self::group_key(row, &indices)
                    .and_then(|key| fitted.bounds.get(&key).copied())
                    .unwrap_or((y_min, y_max));
                target.clamp(lower, upper)
            })
            .collect())
    }

    /// [`fit`](Self::fit) then [`transform`](Self::transform) the same data.
    ///
    /// # Errors
    ///
    /// Returns any error from fitting or transforming.
    pub fn fit_transform(&mut self, x: &Frame, y: &[f64]) -> Result<Vec<f64>> {
        self.fit(x, y)?;
        self.transform(x, y)
    }
}
