//! Prediction cubes and the hybrid ensemble that blends them.
//!
//! Every member (the baseline linear model here, ConvLSTM or tree models
//! trained externally) delivers a [`PredictionCube`] on the stack grid.
//! Members are blended per cell with inverse-error weights.

use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::calendar::YearMonth;
use crate::error::{AquiferError, Result};
use crate::grid::GridSpec;
use crate::raster::{null_as_nan_vec, Raster};

/// Monthly predictions, `T × H × W` row-major with row 0 south. NaN is nodata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionCube {
    pub scenario: String,
    pub grid: GridSpec,
    pub times: Vec<YearMonth>,
    #[serde(deserialize_with = "null_as_nan_vec")]
    pub data: Vec<f32>,
}

impl PredictionCube {
    pub fn new(scenario: impl Into<String>, grid: GridSpec, times: Vec<YearMonth>) -> Self {
        let data = vec![f32::NAN; grid.len() * times.len()];
        Self { scenario: scenario.into(), grid, times, data }
    }

    pub fn check(&self) -> Result<()> {
        let expected = self.grid.len() * self.times.len();
        if self.data.len() != expected {
            return Err(AquiferError::ShapeMismatch { expected, actual: self.data.len() });
        }
        if self.times.windows(2).any(|w| w[1] != w[0].succ()) {
            return Err(AquiferError::TimeAxisMismatch(format!(
                "prediction times for '{}' are not consecutive months",
                self.scenario
            )));
        }
        Ok(())
    }

    pub fn frame(&self, t: usize) -> Raster {
        let n = self.grid.len();
        Raster { grid: self.grid, data: self.data[t * n..(t + 1) * n].to_vec() }
    }

    /// Per-cell mean over the valid months of `year`.
    pub fn annual_mean(&self, year: i32) -> Result<Raster> {
        let frames: Vec<usize> = (0..self.times.len()).filter(|&t| self.times[t].year == year).collect();
        if frames.is_empty() {
            return Err(AquiferError::InvalidDate(format!(
                "no predictions for {year} in '{}'",
                self.scenario
            )));
        }
        let n = self.grid.len();
        let mut out = Raster::nodata(self.grid);
        for i in 0..n {
            let (sum, count) = frames
                .iter()
                .map(|&t| self.data[t * n + i])
                .filter(|v| !v.is_nan())
                .fold((0.0f64, 0usize), |(s, c), v| (s + v as f64, c + 1));
            if count > 0 {
                out.data[i] = (sum / count as f64) as f32;
            }
        }
        Ok(out)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AquiferError::io(parent, e))?;
        }
        let text = serde_json::to_string(self)?;
        fs::write(path, text).map_err(|e| AquiferError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AquiferError::io(path, e))?;
        let cube: Self = serde_json::from_str(&text)?;
        cube.check()?;
        Ok(cube)
    }
}

/// Weights proportional to `1 / mse`, summing to one.
///
/// A member with zero error takes all the weight (shared equally if several
/// do). Non-finite errors get zero weight. Equal weights when nothing usable
/// remains.
pub fn inverse_error_weights(mse: &[f64]) -> Vec<f64> {
    if mse.is_empty() {
        return Vec::new();
    }
    let perfect: Vec<bool> = mse.iter().map(|&e| e.is_finite() && e <= 0.0).collect();
    let n_perfect = perfect.iter().filter(|&&p| p).count();
    if n_perfect > 0 {
        return perfect.iter().map(|&p| if p { 1.0 / n_perfect as f64 } else { 0.0 }).collect();
    }
    let raw: Vec<f64> = mse.iter().map(|&e| if e.is_finite() { 1.0 / e } else { 0.0 }).collect();
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        warn!("no member has a finite error; using equal weights");
        return vec![1.0 / mse.len() as f64; mse.len()];
    }
    raw.iter().map(|w| w / total).collect()
}

/// Per-cell weighted mean over members that have a value there.
pub fn blend(members: &[PredictionCube], weights: &[f64], scenario: &str) -> Result<PredictionCube> {
    let first = members
        .first()
        .ok_or_else(|| AquiferError::Model("blend needs at least one member".into()))?;
    if weights.len() != members.len() {
        return Err(AquiferError::ShapeMismatch { expected: members.len(), actual: weights.len() });
    }
    for m in &members[1..] {
        first.grid.ensure_same(&m.grid, &format!("ensemble member '{}'", m.scenario))?;
        if m.times != first.times {
            return Err(AquiferError::TimeAxisMismatch(format!(
                "member '{}' covers {} months from {:?}, expected {} from {:?}",
                m.scenario,
                m.times.len(),
                m.times.first(),
                first.times.len(),
                first.times.first()
            )));
        }
    }

    let mut out = PredictionCube::new(scenario, first.grid, first.times.clone());
    for (i, v) in out.data.iter_mut().enumerate() {
        let (sum, wsum) = members
            .iter()
            .zip(weights)
            .filter(|&(m, &w)| w > 0.0 && !m.data[i].is_nan())
            .fold((0.0f64, 0.0f64), |(s, ws), (m, &w)| (s + w * m.data[i] as f64, ws + w));
        if wsum > 0.0 {
            *v = (sum / wsum) as f32;
        }
    }
    info!("blended {} members with weights {:?}", members.len(), weights);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::tests::grid;
    use approx::assert_abs_diff_eq;

    fn cube(name: &str, fill: f32) -> PredictionCube {
        let start: YearMonth = "2050-11".parse().unwrap();
        let times = (0..4).map(|k| start.add_months(k)).collect();
        let mut c = PredictionCube::new(name, grid(), times);
        c.data.iter_mut().for_each(|v| *v = fill);
        c
    }

    #[test]
    fn blend_of_identical_members_is_identity() {
        let a = cube("a", 3.5);
        let out = blend(&[a.clone(), a.clone()], &[0.3, 0.7], "ens").unwrap();
        for v in &out.data {
            assert_abs_diff_eq!(*v, 3.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn blend_skips_nodata_members() {
        let a = cube("a", 1.0);
        let mut b = cube("b", 3.0);
        b.data[0] = f32::NAN;
        let out = blend(&[a, b], &[0.5, 0.5], "ens").unwrap();
        assert_abs_diff_eq!(out.data[0], 1.0);
        assert_abs_diff_eq!(out.data[1], 2.0);
    }

    #[test]
    fn blend_rejects_mismatched_times() {
        let a = cube("a", 1.0);
        let mut b = cube("b", 1.0);
        b.times[0] = "2049-01".parse().unwrap();
        assert!(matches!(
            blend(&[a, b], &[0.5, 0.5], "ens"),
            Err(AquiferError::TimeAxisMismatch(_))
        ));
    }

    #[test]
    fn inverse_error_weights_normalise() {
        let w = inverse_error_weights(&[1.0, 3.0]);
        assert_abs_diff_eq!(w[0], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(w[1], 0.25, epsilon = 1e-12);
        assert_eq!(inverse_error_weights(&[0.0, 2.0]), vec![1.0, 0.0]);
        assert_eq!(inverse_error_weights(&[f64::NAN, 2.0]), vec![0.0, 1.0]);
    }

    #[test]
    fn annual_mean_spans_calendar_year() {
        let mut c = cube("a", 0.0);
        // 2050-11, 2050-12 | 2051-01, 2051-02
        let n = c.grid.len();
        c.data[..n].iter_mut().for_each(|v| *v = 2.0);
        c.data[n..2 * n].iter_mut().for_each(|v| *v = 4.0);
        assert_abs_diff_eq!(c.annual_mean(2050).unwrap().data[0], 3.0);
        assert_abs_diff_eq!(c.annual_mean(2051).unwrap().data[0], 0.0);
        assert!(c.annual_mean(2049).is_err());
    }

    #[test]
    fn json_round_trip_keeps_nodata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.json");
        let mut c = cube("ssp245", 1.25);
        c.data[5] = f32::NAN;
        c.save(&path).unwrap();
        let back = PredictionCube::load(&path).unwrap();
        assert!(back.data[5].is_nan());
        assert_eq!(back.data[0], 1.25);
        assert_eq!(back.times, c.times);
    }
}
