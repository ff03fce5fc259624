//! Target encoding over a hierarchy of categorical columns.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use super::{check_target, column_indices, resolve_cols, sample_weights, weighted_ratio, DEFAULT_C};
use crate::error::{Error, Result};
use crate::frame::{Frame, Value};

const KEY_SEPARATOR: &str = "__";

/// Target encoding where each level of a hierarchy (e.g. country, city,
/// street) is shrunk toward its parent instead of the global mean.
///
/// The order of `cols` matters: the first column is the root. A category
/// seen only at a coarser level falls back to that level's ratio, and one
/// never seen falls back to the global ratio.
#[derive(Debug, Clone)]
pub struct HierarchicalEncoder {
    cols: Option<Vec<String>>,
    sample_weight_col: Option<String>,
    c: f64,
    disambiguate: bool,
    verbose: bool,
    fitted: Option<Fitted>,
}

#[derive(Debug, Clone)]
struct Fitted {
    cols: Vec<String>,
    total_ratio: f64,
    std_mean_ratio: f64,
    levels: Vec<HashMap<String, f64>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct LevelGroup {
    numerator: f64,
    denominator: f64,
}

impl Default for HierarchicalEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HierarchicalEncoder {
    /// Create an encoder with `C = 30` and disambiguation on.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cols: None,
            sample_weight_col: None,
            c: DEFAULT_C,
            disambiguate: true,
            verbose: false,
            fitted: None,
        }
    }

    /// Hierarchy columns, root first.
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

    /// Set the shrinkage strength; must be positive.
    #[must_use]
    pub fn with_c(mut self, c: f64) -> Self {
        self.c = c;
        self
    }

    /// Qualify each category by its parents so that e.g. Paris, US and
    /// Paris, France stay apart.
    ///
    /// With disambiguation off, a category found under several parents is
    /// one group shrunk toward the parent of the first row it appears in.
    /// Fitting logs a warning naming how many categories were merged.
    #[must_use]
    pub fn with_disambiguate(mut self, disambiguate: bool) -> Self {
        self.disambiguate = disambiguate;
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

    /// Relative standard deviation of a group of `C` observations at the
    /// global ratio, rounded to 3 decimals.
    #[must_use]
    pub fn std_mean_ratio(&self) -> Option<f64> {
        self.fitted.as_ref().map(|f| f.std_mean_ratio)
    }

    /// Category keys of one row, root first. Missing categories have no key.
    fn row_keys(&self, row: &[Value], indices: &[usize]) -> Vec<Option<String>> {
        let mut keys: Vec<Option<String>> = Vec::with_capacity(indices.len());
        for &idx in indices {
            let value = &row[idx];
            let key = if value.is_null() {
                None
            } else if self.disambiguate {
                match keys.last() {
                    Some(Some(parent)) => {
                        Some(format!("{}{KEY_SEPARATOR}{parent}", value.group_key()))
                    }
                    Some(None) => None,
                    None => Some(value.group_key()),
                }
            } else {
                Some(value.group_key())
            };
            keys.push(key);
        }
        keys
    }

    /// Learn per-level ratios.
    ///
    /// # Errors
    ///
    /// Returns an error if `C <= 0`, a column is missing, the target does not
    /// match the frame, or a weight is not numeric.
    pub fn fit(&mut self, x: &Frame, y: &[f64]) -> Result<&mut Self> {
        if self.c <= 0.0 {
            return Err(Error::invalid_argument(format!("C={} must be > 0", self.c)));
        }
        check_target(x, y)?;
        let cols = resolve_cols(self.cols.as_deref(), x, self.sample_weight_col.as_deref());
        let indices = column_indices(x, &cols)?;
        let weights = sample_weights(x, self.sample_weight_col.as_deref())?;
        if self.verbose {
            info!("Fitting...");
        }

        let total_ratio = weighted_ratio(y, &weights)?;
        let min_sample_std = (total_ratio * (1.0 - total_ratio) / self.c).sqrt();
        let std_mean_ratio = (min_sample_std / total_ratio * 1000.0).round() / 1000.0;
        if self.verbose {
            info!("STD/AVG for min sample: {std_mean_ratio}");
        }

        let row_keys: Vec<Vec<Option<String>>> = x
            .rows()
            .iter()
            .map(|row| self.row_keys(row, &indices))
            .collect();

        let mut levels: Vec<HashMap<String, f64>> = Vec::with_capacity(cols.len());
        let mut parent_groups: HashMap<String, LevelGroup> = HashMap::new();
        for lvl in 0..cols.len() {
            let mut groups: HashMap<String, LevelGroup> = HashMap::new();
            // A child shared by several parents keeps the first parent seen
            let mut parents: HashMap<String, Option<String>> = HashMap::new();
            let mut shared: HashSet<String> = HashSet::new();
            for ((keys, target), weight) in row_keys.iter().zip(y).zip(&weights) {
                let Some(key) = &keys[lvl] else { continue };
                let group = groups.entry(key.clone()).or_default();
                group.numerator += target * weight;
                group.denominator += weight;
                let parent = lvl.checked_sub(1).and_then(|p| keys[p].clone());
                match parents.entry(key.clone()) {
                    Entry::Vacant(entry) => {
                        entry.insert(parent);
                    }
                    Entry::Occupied(entry) => {
                        if *entry.get() != parent {
                            shared.insert(key.clone());
                        }
                    }
                }
            }
            if !shared.is_empty() {
                warn!(
                    "{} {} values have several parents, each is shrunk toward its first parent",
                    shared.len(),
                    cols[lvl]
                );
            }

            let parent_ratios = levels.last();
            let ratios = groups
                .iter()
                .map(|(key, group)| {
                    let parent = parents.get(key).and_then(Option::as_ref);
                    let parent_ratio = match (parent_ratios, parent) {
                        (Some(ratios), Some(parent)) => ratios.get(parent).copied(),
                        _ => None,
                    }
                    .unwrap_or(total_ratio);
                    let parent_denominator = parent
                        .and_then(|p| parent_groups.get(p))
                        .map(|g| g.denominator);
                    // Same observations as the parent: take the parent ratio
                    let ratio = if parent_denominator == Some(group.denominator) {
                        parent_ratio
                    } else {
                        (group.numerator + parent_ratio * self.c) / (group.denominator + self.c)
                    };
                    (key.clone(), ratio)
                })
                .collect();
            levels.push(ratios);
            parent_groups = groups;
        }

        self.fitted = Some(Fitted {
            cols,
            total_ratio,
            std_mean_ratio,
            levels,
        });
        Ok(self)
    }

    /// Encode each row with the ratio of its deepest known level.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFitted`] before [`fit`](Self::fit), or an error if
    /// a fitted column is missing from `x`.
    pub fn transform(&self, x: &Frame) -> Result<Vec<f64>> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or(Error::NotFitted("HierarchicalEncoder"))?;
        let indices = column_indices(x, &fitted.cols)?;
        if self.verbose {
            info!("Transforming...");
        }

        let row_keys: Vec<Vec<Option<String>>> = x
            .rows()
            .iter()
            .map(|row| self.row_keys(row, &indices))
            .collect();
        let expected_len = row_keys.len();
        let mut result: Vec<Option<f64>> = vec![None; expected_len];
        for lvl in (0..fitted.cols.len()).rev() {
            if self.verbose {
                info!("Mapping {}...", fitted.cols[lvl]);
            }
            let ratios = &fitted.levels[lvl];
            for (slot, keys) in result.iter_mut().zip(&row_keys) {
                if slot.is_none() {
                    *slot = keys[lvl].as_ref().and_then(|k| ratios.get(k)).copied();
                }
            }
            let n_na = result.iter().filter(|r| r.is_none()).count();
            if self.verbose {
                info!("Mapping completed, missing values to fill: {n_na}/{expected_len}");
            }
            if n_na == 0 {
                break;
            }
        }

        let n_na = result.iter().filter(|r| r.is_none()).count();
        if n_na > 0 && self.verbose {
            info!("Imputing {n_na} unknown values with global average...");
        }
        if self.verbose {
            info!("Completed.");
        }
        Ok(result
            .into_iter()
            .map(|r| r.unwrap_or(fitted.total_ratio))
            .collect())
    }

    /// [`fit`](Self::fit) then [`transform`](Self::transform) the same frame.
    ///
    /// # Errors
    ///
    /// Returns any error from fitting or transforming.
    pub fn fit_transform(&mut self, x: &Frame, y: &[f64]) -> Result<Vec<f64>> {
        self.fit(x, y)?;
        self.transform(x)
    }
}
