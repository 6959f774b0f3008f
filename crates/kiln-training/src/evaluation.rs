use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Standard regression metrics reported by the reference trainers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub rmse: f64,
    pub mae: f64,
    pub r2: f64,
}

impl RegressionMetrics {
    /// Evaluate predictions against ground truth.
    ///
    /// `r2` follows the usual convention for a constant target: 1.0 for a
    /// perfect fit, 0.0 otherwise. Returns `None` for empty or mismatched
    /// inputs.
    #[must_use]
    pub fn evaluate(y_true: &[f64], y_pred: &[f64]) -> Option<Self> {
        if y_true.is_empty() || y_true.len() != y_pred.len() {
            return None;
        }
        let n = y_true.len() as f64;
        let mean = y_true.iter().sum::<f64>() / n;

        let mut sq_err = 0.0;
        let mut abs_err = 0.0;
        let mut ss_tot = 0.0;
        for (t, p) in y_true.iter().zip(y_pred) {
            let e = t - p;
            sq_err += e * e;
            abs_err += e.abs();
            ss_tot += (t - mean) * (t - mean);
        }

        let r2 = if ss_tot == 0.0 {
            if sq_err == 0.0 { 1.0 } else { 0.0 }
        } else {
            1.0 - sq_err / ss_tot
        };

        Some(Self { rmse: (sq_err / n).sqrt(), mae: abs_err / n, r2 })
    }

    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("rmse".to_string(), self.rmse),
            ("mae".to_string(), self.mae),
            ("r2".to_string(), self.r2),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_prediction() {
        let m = RegressionMetrics::evaluate(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(m.rmse, 0.0);
        assert_eq!(m.mae, 0.0);
        assert_eq!(m.r2, 1.0);
    }

    #[test]
    fn test_mean_prediction_has_zero_r2() {
        let m = RegressionMetrics::evaluate(&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0]).unwrap();
        assert!((m.r2).abs() < 1e-12);
        assert!((m.mae - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.rmse - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_lengths() {
        assert!(RegressionMetrics::evaluate(&[1.0], &[]).is_none());
        assert!(RegressionMetrics::evaluate(&[], &[]).is_none());
    }
}
