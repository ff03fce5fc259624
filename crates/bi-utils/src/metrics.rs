//! Regression metrics.

use crate::error::{Error, Result};

/// Mean absolute percentage error.
///
/// Each error is `|pred - true| / max(|true|, epsilon)`; the result is their
/// mean, weighted by `sample_weight` when given. Pass `f64::EPSILON` for the
/// usual guard against division by zero.
///
/// # Errors
///
/// Returns an error if the inputs are empty, differ in length, hold
/// non-finite values, or the weights sum to zero.
pub fn mean_absolute_percentage_error(
    y_true: &[f64],
    y_pred: &[f64],
    sample_weight: Option<&[f64]>,
    epsilon: f64,
) -> Result<f64> {
    check_arrays(y_true, y_pred, sample_weight)?;
    let errors: Vec<f64> = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (p - t).abs() / t.abs().max(epsilon))
        .collect();
    average(&errors, sample_weight)
}

/// Mean percentage bias: `avg(pred - true) / avg(true)`.
///
/// Positive values mean the predictions overshoot on average.
///
/// # Errors
///
/// Returns an error if the inputs are empty, differ in length, hold
/// non-finite values, or the weights sum to zero.
pub fn mean_percentage_bias(
    y_true: &[f64],
    y_pred: &[f64],
    sample_weight: Option<&[f64]>,
) -> Result<f64> {
    check_arrays(y_true, y_pred, sample_weight)?;
    let deltas: Vec<f64> = y_true.iter().zip(y_pred).map(|(t, p)| p - t).collect();
    let delta = average(&deltas, sample_weight)?;
    let avg = average(y_true, sample_weight)?;
    Ok(delta / avg)
}

/// Quantile of the values with linear interpolation between closest ranks.
///
/// Returns `None` for empty input. `q` is clamped to `[0, 1]`.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - pos.floor();
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * frac)
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn average(values: &[f64], weights: Option<&[f64]>) -> Result<f64> {
    match weights {
        None => Ok(values.iter().sum::<f64>() / values.len() as f64),
        Some(weights) => {
            let total: f64 = weights.iter().sum();
            if total == 0.0 {
                return Err(Error::invalid_argument(
                    "weights sum to zero, can't be normalized",
                ));
            }
            let weighted: f64 = values.iter().zip(weights).map(|(v, w)| v * w).sum();
            Ok(weighted / total)
        }
    }
}

fn check_arrays(y_true: &[f64], y_pred: &[f64], sample_weight: Option<&[f64]>) -> Result<()> {
    let mut lengths = vec![y_true.len(), y_pred.len()];
    if let Some(weights) = sample_weight {
        lengths.push(weights.len());
    }
    if lengths.windows(2).any(|w| w[0] != w[1]) {
        return Err(Error::InconsistentLength(lengths));
    }
    if y_true.is_empty() {
        return Err(Error::invalid_argument(
            "found array with 0 sample(s) while a minimum of 1 is required",
        ));
    }
    let all_finite = y_true
        .iter()
        .chain(y_pred)
        .chain(sample_weight.unwrap_or_default())
        .all(|x| x.is_finite());
    if !all_finite {
        return Err(Error::invalid_argument("input contains NaN or infinity"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_mape() {
        let mape = mean_absolute_percentage_error(&[1.0, 2.0, 4.0], &[1.5, 2.0, 3.0], None, f64::EPSILON)
            .unwrap();
        assert_close(mape, (0.5 + 0.0 + 0.25) / 3.0);
    }

    #[test]
    fn test_mape_weighted() {
        let mape = mean_absolute_percentage_error(
            &[1.0, 2.0],
            &[2.0, 2.0],
            Some(&[3.0, 1.0]),
            f64::EPSILON,
        )
        .unwrap();
        assert_close(mape, 0.75);
    }

    #[test]
    fn test_mape_zero_true_uses_epsilon() {
        let mape = mean_absolute_percentage_error(&[0.0], &[1.0], None, 0.5).unwrap();
        assert_close(mape, 2.0);
    }

    #[test]
    fn test_mean_percentage_bias() {
        let bias = mean_percentage_bias(&[1.0, 3.0], &[2.0, 4.0], None).unwrap();
        assert_close(bias, 0.5);

        let bias = mean_percentage_bias(&[2.0, 2.0], &[1.0, 3.0], Some(&[1.0, 1.0])).unwrap();
        assert_close(bias, 0.0);
    }

    #[test]
    fn test_inconsistent_lengths() {
        let err = mean_percentage_bias(&[1.0, 2.0], &[1.0], None).unwrap_err();
        assert!(matches!(err, Error::InconsistentLength(ref l) if l == &vec![2, 1]));

        let err = mean_absolute_percentage_error(&[1.0], &[1.0], Some(&[1.0, 2.0]), 0.1).unwrap_err();
        assert!(matches!(err, Error::InconsistentLength(_)));
    }

    #[test]
    fn test_empty_and_non_finite() {
        assert!(mean_percentage_bias(&[], &[], None).is_err());
        assert!(mean_percentage_bias(&[f64::NAN], &[1.0], None).is_err());
        assert!(mean_absolute_percentage_error(&[1.0], &[f64::INFINITY], None, 0.1).is_err());
    }

    #[test]
    fn test_quantile_linear() {
        let values = [0.5, 1.01, 0.75, 8.99, 70.0];
        assert_close(quantile(&values, 0.75).unwrap(), 8.99);
        assert_close(quantile(&values, 0.0).unwrap(), 0.5);
        assert_close(quantile(&values, 1.0).unwrap(), 70.0);
        assert_close(quantile(&[1.0, 2.0], 0.5).unwrap(), 1.5);
        assert_close(quantile(&[1.0, 2.0, 3.0, 4.0], 0.1).unwrap(), 1.3);
        assert!(quantile(&[], 0.5).is_none());
    }

    #[test]
    fn test_zero_weights() {
        assert!(mean_percentage_bias(&[1.0], &[1.0], Some(&[0.0])).is_err());
    }
}
