//! Goodness-of-fit scores for predictions against a reference
//! (GRACE/GLDAS storage anomalies, or held-out months).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    pub n: usize,
    pub rmse: f64,
    pub mae: f64,
    /// Mean of `predicted − observed`.
    pub bias: f64,
    /// Pearson correlation.
    pub r: f64,
    /// Nash–Sutcliffe efficiency.
    pub nse: f64,
}

impl Scores {
    /// Score paired values, skipping pairs where either side is non-finite.
    /// All-NaN scores when no pair is usable.
    pub fn compute(predicted: &[f64], observed: &[f64]) -> Self {
        let (p, o): (Vec<f64>, Vec<f64>) = predicted
            .iter()
            .zip(observed)
            .filter(|(p, o)| p.is_finite() && o.is_finite())
            .map(|(&p, &o)| (p, o))
            .unzip();
        let n = p.len();
        if n == 0 {
            return Self { n, rmse: f64::NAN, mae: f64::NAN, bias: f64::NAN, r: f64::NAN, nse: f64::NAN };
        }
        let nf = n as f64;
        let mse = p.iter().zip(&o).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / nf;
        let mae = p.iter().zip(&o).map(|(a, b)| (a - b).abs()).sum::<f64>() / nf;
        let bias = p.iter().zip(&o).map(|(a, b)| a - b).sum::<f64>() / nf;
        Self {
            n,
            rmse: mse.sqrt(),
            mae,
            bias,
            r: pearson_r(&p, &o),
            nse: nash_sutcliffe(&p, &o),
        }
    }

    pub fn compute_f32(predicted: &[f32], observed: &[f32]) -> Self {
        let p: Vec<f64> = predicted.iter().map(|&v| v as f64).collect();
        let o: Vec<f64> = observed.iter().map(|&v| v as f64).collect();
        Self::compute(&p, &o)
    }

    pub fn mse(&self) -> f64 {
        self.rmse * self.rmse
    }
}

pub fn pearson_r(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let num: f64 = x.iter().zip(y.iter()).map(|(&a, &b)| (a - mx) * (b - my)).sum();
    let vx = x.iter().map(|&a| (a - mx).powi(2)).sum::<f64>().sqrt();
    let vy = y.iter().map(|&b| (b - my).powi(2)).sum::<f64>().sqrt();
    if vx < 1e-12 || vy < 1e-12 {
        return 0.0;
    }
    (num / (vx * vy)).clamp(-1.0, 1.0)
}

/// NSE = 1 − Σ(p − o)² / Σ(o − ō)². NaN when the observations are constant.
pub fn nash_sutcliffe(predicted: &[f64], observed: &[f64]) -> f64 {
    let n = observed.len() as f64;
    let mo = observed.iter().sum::<f64>() / n;
    let ss_res: f64 = predicted.iter().zip(observed).map(|(p, o)| (p - o).powi(2)).sum();
    let ss_tot: f64 = observed.iter().map(|o| (o - mo).powi(2)).sum();
    if ss_tot < 1e-12 {
        return f64::NAN;
    }
    1.0 - ss_res / ss_tot
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn perfect_prediction() {
        let o = [1.0, 2.0, 3.0, 4.0];
        let s = Scores::compute(&o, &o);
        assert_eq!(s.n, 4);
        assert_abs_diff_eq!(s.rmse, 0.0);
        assert_abs_diff_eq!(s.r, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.nse, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn constant_offset_shows_as_bias() {
        let o = [1.0, 2.0, 3.0];
        let p = [2.0, 3.0, 4.0];
        let s = Scores::compute(&p, &o);
        assert_abs_diff_eq!(s.bias, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.rmse, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.r, 1.0, epsilon = 1e-12);
        // Σ(o − ō)² = 2, Σ(p − o)² = 3.
        assert_abs_diff_eq!(s.nse, -0.5, epsilon = 1e-12);
    }

    #[test]
    fn nan_pairs_are_skipped() {
        let s = Scores::compute(&[1.0, f64::NAN, 3.0], &[1.0, 2.0, f64::NAN]);
        assert_eq!(s.n, 1);
        let empty = Scores::compute(&[f64::NAN], &[1.0]);
        assert_eq!(empty.n, 0);
        assert!(empty.rmse.is_nan());
    }

    #[test]
    fn pearson_perfect_negative() {
        assert_abs_diff_eq!(pearson_r(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]), -1.0, epsilon = 1e-12);
    }
}
