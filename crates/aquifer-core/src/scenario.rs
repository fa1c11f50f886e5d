//! CMIP6 scenario projection by the delta-change method.
//!
//! Observed baseline climate is perturbed by the monthly change a GCM
//! simulates between its historical run and a future SSP run, then placed
//! on a future time axis.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::align::AlignedStack;
use crate::calendar::YearMonth;
use crate::catalog::ChangeMethod;
use crate::error::{AquiferError, Result};
use crate::geotiff::read_geotiff;
use crate::grid::GridSpec;
use crate::raster::Raster;
use crate::regrid::{regrid, Resampling};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scenario {
    Historical,
    Ssp126,
    Ssp245,
    Ssp370,
    Ssp585,
}

impl Scenario {
    /// Short lowercase label used in file and directory names.
    pub fn tag(self) -> &'static str {
        match self {
            Scenario::Historical => "historical",
            Scenario::Ssp126 => "ssp126",
            Scenario::Ssp245 => "ssp245",
            Scenario::Ssp370 => "ssp370",
            Scenario::Ssp585 => "ssp585",
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Scenario {
    type Err = AquiferError;

    /// Accepts `ssp245`, `SSP2-4.5`, `ssp2_45` and `historical`.
    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "historical" | "hist" => Ok(Scenario::Historical),
            "ssp126" => Ok(Scenario::Ssp126),
            "ssp245" => Ok(Scenario::Ssp245),
            "ssp370" => Ok(Scenario::Ssp370),
            "ssp585" => Ok(Scenario::Ssp585),
            _ => Err(AquiferError::Catalog(format!("unknown scenario '{s}'"))),
        }
    }
}

impl TryFrom<String> for Scenario {
    type Error = AquiferError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Scenario> for String {
    fn from(s: Scenario) -> String {
        s.tag().to_string()
    }
}

/// GCM monthly climatologies for one variable, on the stack grid.
pub struct ClimateDelta {
    pub variable: String,
    pub method: ChangeMethod,
    historical: Vec<Raster>,
    future: Vec<Raster>,
}

const MAX_RATIO: f32 = 5.0;
const RATIO_EPS: f32 = 1e-6;

impl ClimateDelta {
    pub fn new(
        variable: impl Into<String>,
        method: ChangeMethod,
        historical: Vec<Raster>,
        future: Vec<Raster>,
    ) -> Result<Self> {
        let variable = variable.into();
        for (what, set) in [("historical", &historical), ("future", &future)] {
            if set.len() != 12 {
                return Err(AquiferError::Catalog(format!(
                    "{variable}: {what} climatology has {} months, expected 12",
                    set.len()
                )));
            }
            for r in set.iter() {
                historical[0].grid.ensure_same(&r.grid, &variable)?;
            }
        }
        Ok(Self { variable, method, historical, future })
    }

    /// Read `<dir>/<variable>_<MM>.tif` for both periods and regrid to `grid`.
    pub fn load(
        hist_dir: &Path,
        future_dir: &Path,
        variable: &str,
        method: ChangeMethod,
        grid: &GridSpec,
    ) -> Result<Self> {
        let read = |dir: &Path| -> Result<Vec<Raster>> {
            (1..=12)
                .map(|m| {
                    let raw = read_geotiff(&dir.join(format!("{variable}_{m:02}.tif")))?;
                    Ok(regrid(&raw, grid, Resampling::Bilinear))
                })
                .collect()
        };
        Self::new(variable, method, read(hist_dir)?, read(future_dir)?)
    }

    /// Change signal for one calendar month; NaN where either period is nodata.
    pub fn signal(&self, month_index: usize) -> Raster {
        let hist = &self.historical[month_index];
        let fut = &self.future[month_index];
        let mut out = Raster::nodata(hist.grid);
        for (o, (&h, &f)) in out.data.iter_mut().zip(hist.data.iter().zip(&fut.data)) {
            if h.is_nan() || f.is_nan() {
                continue;
            }
            *o = match self.method {
                ChangeMethod::Additive => f - h,
                ChangeMethod::Multiplicative if h.abs() < RATIO_EPS => 1.0,
                ChangeMethod::Multiplicative => (f / h).clamp(0.0, MAX_RATIO),
            };
        }
        out
    }

    fn apply(&self, frame: &mut Raster, signal: &Raster) {
        for (v, &d) in frame.data.iter_mut().zip(&signal.data) {
            if d.is_nan() {
                *v = f32::NAN;
                continue;
            }
            match self.method {
                ChangeMethod::Additive => *v += d,
                ChangeMethod::Multiplicative => *v *= d,
            }
        }
    }
}

/// Perturb `stack` with `deltas` and move it to start at `target_start`.
///
/// The target layer becomes all nodata: the scenario stack is an input for
/// prediction, not an observation.
pub fn project(
    mut stack: AlignedStack,
    deltas: &[ClimateDelta],
    target_start: YearMonth,
) -> Result<AlignedStack> {
    let start = *stack
        .times
        .first()
        .ok_or_else(|| AquiferError::TimeAxisMismatch("stack has no time steps".into()))?;
    if start.month != target_start.month {
        return Err(AquiferError::InvalidDate(format!(
            "projection start {target_start} must fall in the same calendar month as the baseline start {start}"
        )));
    }

    for delta in deltas {
        if delta.variable == stack.target {
            return Err(AquiferError::Catalog(format!(
                "target '{}' cannot take a climate delta",
                delta.variable
            )));
        }
        let grid = stack.grid;
        let layer = stack
            .dynamic
            .iter_mut()
            .find(|l| l.name == delta.variable)
            .ok_or_else(|| AquiferError::UnknownVariable(delta.variable.clone()))?;
        if delta.method != layer.change {
            warn!(
                "{}: delta applied as {:?}, catalog says {:?}",
                delta.variable, delta.method, layer.change
            );
        }
        grid.ensure_same(&delta.historical[0].grid, &delta.variable)?;
        let signals: Vec<Raster> = (0..12).map(|m| delta.signal(m)).collect();
        for (t, frame) in layer.frames.iter_mut().enumerate() {
            delta.apply(frame, &signals[stack.times[t].month_index()]);
        }
        info!("applied {:?} delta to {}", delta.method, delta.variable);
    }

    let target = stack.target.clone();
    if let Some(layer) = stack.dynamic.iter_mut().find(|l| l.name == target) {
        layer.frames.iter_mut().for_each(|f| f.data.iter_mut().for_each(|v| *v = f32::NAN));
    }

    let shift = start.months_until(target_start);
    stack.times = stack.times.iter().map(|t| t.add_months(shift)).collect();
    stack.check()?;
    Ok(stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::tests::{grid, synthetic_stack};
    use approx::assert_abs_diff_eq;

    fn monthly(values: impl Fn(usize) -> f32) -> Vec<Raster> {
        (0..12).map(|m| Raster::new(grid(), values(m))).collect()
    }

    #[test]
    fn scenario_labels_parse() {
        assert_eq!("SSP2-4.5".parse::<Scenario>().unwrap(), Scenario::Ssp245);
        assert_eq!("ssp585".parse::<Scenario>().unwrap(), Scenario::Ssp585);
        assert_eq!("Historical".parse::<Scenario>().unwrap(), Scenario::Historical);
        assert!("rcp45".parse::<Scenario>().is_err());
        assert_eq!(Scenario::Ssp126.tag(), "ssp126");
    }

    #[test]
    fn multiplicative_ratio_is_clamped() {
        let d = ClimateDelta::new(
            "precip",
            ChangeMethod::Multiplicative,
            monthly(|m| if m == 0 { 1.0 } else if m == 1 { 0.0 } else { 2.0 }),
            monthly(|m| if m == 0 { 10.0 } else { 3.0 }),
        )
        .unwrap();
        assert_abs_diff_eq!(d.signal(0).data[0], 5.0);
        assert_abs_diff_eq!(d.signal(1).data[0], 1.0);
        assert_abs_diff_eq!(d.signal(2).data[0], 1.5);
    }

    #[test]
    fn project_applies_monthly_delta_and_shifts_time() {
        let stack = synthetic_stack(14);
        let precip_before: Vec<f32> =
            stack.dynamic_layer("precip").unwrap().frames.iter().map(|f| f.data[0]).collect();
        let delta = ClimateDelta::new(
            "precip",
            ChangeMethod::Multiplicative,
            monthly(|_| 2.0),
            monthly(|m| if m == 0 { 4.0 } else { 2.0 }),
        )
        .unwrap();
        let out = project(stack, &[delta], "2050-01".parse().unwrap()).unwrap();

        assert_eq!(out.times[0].to_string(), "2050-01");
        assert_eq!(out.times[13].to_string(), "2051-02");
        let precip = out.dynamic_layer("precip").unwrap();
        // January frames double, the rest are unchanged.
        assert_abs_diff_eq!(precip.frames[0].data[0], precip_before[0] * 2.0);
        assert_abs_diff_eq!(precip.frames[1].data[0], precip_before[1]);
        assert_abs_diff_eq!(precip.frames[12].data[0], precip_before[12] * 2.0);
        assert!(out.target_layer().unwrap().frames[0].data.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn project_rejects_month_misalignment() {
        let stack = synthetic_stack(3);
        assert!(matches!(
            project(stack, &[], "2050-03".parse().unwrap()),
            Err(AquiferError::InvalidDate(_))
        ));
    }

    #[test]
    fn delta_on_target_is_rejected() {
        let d = ClimateDelta::new("tws", ChangeMethod::Additive, monthly(|_| 0.0), monthly(|_| 1.0)).unwrap();
        assert!(project(synthetic_stack(3), &[d], "2050-01".parse().unwrap()).is_err());
    }

    #[test]
    fn load_reads_monthly_files() {
        let dir = tempfile::tempdir().unwrap();
        let (hist, fut) = (dir.path().join("historical"), dir.path().join("ssp245"));
        for m in 1..=12 {
            crate::geotiff::write_geotiff(&hist.join(format!("temp_{m:02}.tif")), &Raster::new(grid(), 20.0))
                .unwrap();
            crate::geotiff::write_geotiff(&fut.join(format!("temp_{m:02}.tif")), &Raster::new(grid(), 22.5))
                .unwrap();
        }
        let d = ClimateDelta::load(&hist, &fut, "temp", ChangeMethod::Additive, &grid()).unwrap();
        assert_abs_diff_eq!(d.signal(6).data[3], 2.5);
    }
}
