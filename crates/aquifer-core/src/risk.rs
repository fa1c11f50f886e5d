//! Traffic-light vulnerability classes from a continuous indicator raster.

use serde::{Deserialize, Serialize};

use crate::error::{AquiferError, Result};
use crate::raster::Raster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskClass {
    Low = 1,
    Moderate = 2,
    High = 3,
}

impl RiskClass {
    pub const ALL: [RiskClass; 3] = [RiskClass::Low, RiskClass::Moderate, RiskClass::High];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: f32) -> Option<Self> {
        match code.round() as i64 {
            1 => Some(RiskClass::Low),
            2 => Some(RiskClass::Moderate),
            3 => Some(RiskClass::High),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RiskClass::Low => "low",
            RiskClass::Moderate => "moderate",
            RiskClass::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Thresholds {
    /// Cut-offs in indicator units.
    Fixed { moderate: f32, high: f32 },
    /// Cut-offs as quantiles of the valid cells, in `[0, 1]`, counted from
    /// the good end of the scale.
    Quantile { moderate: f64, high: f64 },
}

/// Cut-offs ordered along the worsening direction: `moderate <= high` on a
/// higher-is-worse scale, `high <= moderate` on a lower-is-worse one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cutoffs {
    pub moderate: f32,
    pub high: f32,
}

#[derive(Debug, Clone)]
pub struct RiskMap {
    /// Class codes 1..=3, NaN nodata.
    pub classes: Raster,
    pub cutoffs: Cutoffs,
    pub higher_is_worse: bool,
    /// Cells per class, low to high.
    pub counts: [usize; 3],
}

/// Linear-interpolated quantile of sorted values.
fn quantile(sorted: &[f32], q: f64) -> f32 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = (pos - lo as f64) as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

fn resolve(raster: &Raster, thresholds: Thresholds, higher_is_worse: bool) -> Result<Cutoffs> {
    let bad = |msg: String| Err(AquiferError::InvalidThresholds(msg));
    match thresholds {
        Thresholds::Fixed { moderate, high } => {
            if moderate.is_nan() || high.is_nan() {
                return bad("thresholds must be numbers".into());
            }
            let ordered = if higher_is_worse { moderate <= high } else { high <= moderate };
            if !ordered {
                return bad(format!(
                    "moderate {moderate} and high {high} are out of order for a {} scale",
                    if higher_is_worse { "higher-is-worse" } else { "lower-is-worse" }
                ));
            }
            Ok(Cutoffs { moderate, high })
        }
        Thresholds::Quantile { moderate, high } => {
            if !(0.0..=1.0).contains(&moderate) || !(0.0..=1.0).contains(&high) || moderate > high {
                return bad(format!("quantiles need 0 <= moderate <= high <= 1, got {moderate}, {high}"));
            }
            let mut values: Vec<f32> = raster.data.iter().copied().filter(|v| !v.is_nan()).collect();
            if values.is_empty() {
                return bad("no valid cells to take quantiles from".into());
            }
            values.sort_by(f32::total_cmp);
            let at = |q: f64| quantile(&values, if higher_is_worse { q } else { 1.0 - q });
            Ok(Cutoffs { moderate: at(moderate), high: at(high) })
        }
    }
}

pub fn classify(raster: &Raster, thresholds: Thresholds, higher_is_worse: bool) -> Result<RiskMap> {
    let cutoffs = resolve(raster, thresholds, higher_is_worse)?;
    let worse_or_equal = |v: f32, cut: f32| if higher_is_worse { v >= cut } else { v <= cut };

    let mut counts = [0usize; 3];
    let classes = raster.map(|v| {
        if v.is_nan() {
            return f32::NAN;
        }
        let class = if worse_or_equal(v, cutoffs.high) {
            RiskClass::High
        } else if worse_or_equal(v, cutoffs.moderate) {
            RiskClass::Moderate
        } else {
            RiskClass::Low
        };
        class.code() as f32
    });
    for v in &classes.data {
        if let Some(c) = RiskClass::from_code(*v) {
            counts[c.code() as usize - 1] += 1;
        }
    }
    Ok(RiskMap { classes, cutoffs, higher_is_worse, counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::tests::grid;
    use approx::assert_abs_diff_eq;

    /// 0, 1, … 11 across the 4×3 grid.
    fn ramp() -> Raster {
        Raster::from_data(grid(), (0..12).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn fixed_thresholds_higher_is_worse() {
        let m = classify(&ramp(), Thresholds::Fixed { moderate: 4.0, high: 8.0 }, true).unwrap();
        assert_eq!(m.counts, [4, 4, 4]);
        assert_eq!(m.classes.data[3], 1.0);
        assert_eq!(m.classes.data[4], 2.0);
        assert_eq!(m.classes.data[11], 3.0);
    }

    #[test]
    fn fixed_thresholds_lower_is_worse() {
        let m = classify(&ramp(), Thresholds::Fixed { moderate: 6.0, high: 2.0 }, false).unwrap();
        assert_eq!(m.counts, [5, 4, 3]);
        assert_eq!(m.classes.data[0], 3.0);
    }

    #[test]
    fn lower_is_worse_rejects_rising_cutoffs() {
        let err = classify(&ramp(), Thresholds::Fixed { moderate: 2.0, high: 6.0 }, false);
        assert!(matches!(err, Err(AquiferError::InvalidThresholds(_))));
        let err = classify(&ramp(), Thresholds::Quantile { moderate: 0.8, high: 0.5 }, false);
        assert!(matches!(err, Err(AquiferError::InvalidThresholds(_))));
        // The same values are fine once the scale direction agrees.
        assert!(classify(&ramp(), Thresholds::Fixed { moderate: 2.0, high: 6.0 }, true).is_ok());
    }

    #[test]
    fn quantile_thresholds_split_counts() {
        let m = classify(&ramp(), Thresholds::Quantile { moderate: 0.5, high: 0.75 }, true).unwrap();
        assert_abs_diff_eq!(m.cutoffs.moderate, 5.5);
        assert_abs_diff_eq!(m.cutoffs.high, 8.25);
        assert_eq!(m.counts, [6, 3, 3]);
        assert!(m.cutoffs.moderate <= m.cutoffs.high);
    }

    #[test]
    fn quantiles_flip_for_lower_is_worse() {
        let m = classify(&ramp(), Thresholds::Quantile { moderate: 0.5, high: 0.75 }, false).unwrap();
        assert_abs_diff_eq!(m.cutoffs.moderate, 5.5);
        assert_abs_diff_eq!(m.cutoffs.high, 2.75);
        assert!(m.cutoffs.high <= m.cutoffs.moderate);
        assert_eq!(m.counts, [6, 3, 3]);
    }

    #[test]
    fn nodata_stays_nodata() {
        let mut r = ramp();
        r.data[5] = f32::NAN;
        let m = classify(&r, Thresholds::Fixed { moderate: 1.0, high: 2.0 }, true).unwrap();
        assert!(m.classes.data[5].is_nan());
        assert_eq!(m.counts.iter().sum::<usize>(), 11);
    }

    #[test]
    fn bad_quantiles_are_rejected() {
        assert!(classify(&ramp(), Thresholds::Quantile { moderate: 0.9, high: 0.5 }, true).is_err());
        assert!(classify(&Raster::nodata(grid()), Thresholds::Quantile { moderate: 0.5, high: 0.8 }, true).is_err());
    }
}
