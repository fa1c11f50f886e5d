//! Tabular features: static and dynamic layers combined per (cell, month).
//!
//! A [`FeatureBuilder`] is fitted on the historical stack (climatology,
//! class codes, column order) and then applied to any stack on the same
//! grid, so scenario runs see exactly the training columns and anomalies
//! are measured against the historical climate.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::align::AlignedStack;
use crate::calendar::YearMonth;
use crate::catalog::VariableKind;
use crate::error::{AquiferError, Result};
use crate::raster::Raster;
use crate::terrain::slope_deg;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSpec {
    /// `(variable, months)`: trailing mean over `months` steps ending at `t`.
    pub rolling: Vec<(String, usize)>,
    /// Variables whose departure from the monthly climatology is a feature.
    pub anomalies: Vec<String>,
    /// Months between the feature time and the target time.
    pub horizon: usize,
    /// Add `slope_deg` from the elevation layer, if there is one.
    pub include_slope: bool,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self { rolling: Vec::new(), anomalies: Vec::new(), horizon: 0, include_slope: true }
    }
}

impl FeatureSpec {
    /// `features.csv` → `features.spec.json`, written beside the table.
    pub fn sidecar_path(table: &Path) -> PathBuf {
        table.with_extension("spec.json")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?).map_err(|e| AquiferError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AquiferError::io(path, e))?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub row: usize,
    pub col: usize,
    pub time: YearMonth,
    /// Target at `time + horizon`; NaN when unknown (scenario runs).
    pub target: f32,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    pub columns: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

enum Column {
    Dynamic(usize),
    Rolling(usize, usize),
    Anomaly(usize),
    Static(usize),
    Slope,
    OneHot(usize, i64),
}

pub struct FeatureBuilder {
    spec: FeatureSpec,
    columns: Vec<String>,
    plan: Vec<ColumnPlan>,
    climatology: BTreeMap<String, Vec<Raster>>,
}

/// Column resolved by variable name, re-indexed against each stack it is applied to.
enum ColumnPlan {
    Dynamic(String),
    Rolling(String, usize),
    Anomaly(String),
    Static(String),
    Slope,
    OneHot(String, i64),
}

impl FeatureBuilder {
    pub fn fit(stack: &AlignedStack, spec: &FeatureSpec) -> Result<Self> {
        let bad = |msg: String| Err(AquiferError::InvalidFeature(msg));
        let mut columns = Vec::new();
        let mut plan = Vec::new();

        for layer in stack.dynamic.iter().filter(|l| l.name != stack.target) {
            columns.push(layer.name.clone());
            plan.push(ColumnPlan::Dynamic(layer.name.clone()));
        }
        for (name, months) in &spec.rolling {
            if *name == stack.target {
                return bad(format!("target '{name}' cannot be a rolling predictor"));
            }
            if *months == 0 {
                return bad(format!("rolling window for '{name}' must be at least 1 month"));
            }
            stack.dynamic_layer(name)?;
            columns.push(format!("{name}_{months}m"));
            plan.push(ColumnPlan::Rolling(name.clone(), *months));
        }
        let mut climatology = BTreeMap::new();
        for name in &spec.anomalies {
            if *name == stack.target {
                return bad(format!("target '{name}' cannot be an anomaly predictor"));
            }
            climatology.insert(name.clone(), stack.climatology(name)?);
            columns.push(format!("{name}_anom"));
            plan.push(ColumnPlan::Anomaly(name.clone()));
        }
        for layer in stack.statics.iter().filter(|l| l.kind == VariableKind::Continuous) {
            columns.push(layer.name.clone());
            plan.push(ColumnPlan::Static(layer.name.clone()));
        }
        if spec.include_slope && stack.elevation().is_some() {
            columns.push("slope_deg".into());
            plan.push(ColumnPlan::Slope);
        }
        for layer in stack.statics.iter().filter(|l| l.kind == VariableKind::Categorical) {
            for code in stack.categories(&layer.name)? {
                columns.push(format!("{}={code}", layer.name));
                plan.push(ColumnPlan::OneHot(layer.name.clone(), code));
            }
        }

        Ok(Self { spec: spec.clone(), columns, plan, climatology })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn spec(&self) -> &FeatureSpec {
        &self.spec
    }

    fn resolve(&self, stack: &AlignedStack) -> Result<Vec<Column>> {
        let dyn_idx = |name: &str| {
            stack
                .dynamic
                .iter()
                .position(|l| l.name == name)
                .ok_or_else(|| AquiferError::UnknownVariable(name.to_string()))
        };
        let static_idx = |name: &str| {
            stack
                .statics
                .iter()
                .position(|l| l.name == name)
                .ok_or_else(|| AquiferError::UnknownVariable(name.to_string()))
        };
        self.plan
            .iter()
            .map(|p| {
                Ok(match p {
                    ColumnPlan::Dynamic(n) => Column::Dynamic(dyn_idx(n)?),
                    ColumnPlan::Rolling(n, m) => Column::Rolling(dyn_idx(n)?, *m),
                    ColumnPlan::Anomaly(n) => Column::Anomaly(dyn_idx(n)?),
                    ColumnPlan::Static(n) => Column::Static(static_idx(n)?),
                    ColumnPlan::Slope => Column::Slope,
                    ColumnPlan::OneHot(n, c) => Column::OneHot(static_idx(n)?, *c),
                })
            })
            .collect()
    }

    /// Feature rows for every cell and month where all features are valid.
    ///
    /// With `require_target`, rows also need a valid target at
    /// `time + horizon` inside the stack; without it the target is NaN when
    /// unavailable and rows run up to the last month.
    pub fn build(&self, stack: &AlignedStack, require_target: bool) -> Result<FeatureTable> {
        let columns = self.resolve(stack)?;
        let slope = match stack.elevation() {
            Some(dem) if self.plan.iter().any(|p| matches!(p, ColumnPlan::Slope)) => {
                Some(slope_deg(&dem.raster))
            }
            _ => None,
        };
        let target = stack.target_layer()?;
        let first = self.spec.rolling.iter().map(|(_, m)| m - 1).max().unwrap_or(0);
        let n_times = stack.times.len();
        let static_mask = stack.static_mask();

        let mut rows = Vec::new();
        for t in first..n_times {
            let tt = t + self.spec.horizon;
            if require_target && tt >= n_times {
                break;
            }
            for r in 0..stack.grid.height {
                for c in 0..stack.grid.width {
                    let i = stack.grid.index(r, c);
                    if !static_mask[i] {
                        continue;
                    }
                    let target_v = if tt < n_times { target.frames[tt].data[i] } else { f32::NAN };
                    if require_target && target_v.is_nan() {
                        continue;
                    }
                    let values: Option<Vec<f32>> = columns
                        .iter()
                        .map(|col| self.value(stack, col, slope.as_ref(), t, i))
                        .collect();
                    if let Some(values) = values {
                        rows.push(FeatureRow { row: r, col: c, time: stack.times[t], target: target_v, values });
                    }
                }
            }
        }

        info!("{} feature rows x {} columns", rows.len(), self.columns.len());
        Ok(FeatureTable { columns: self.columns.clone(), rows })
    }

    fn value(
        &self,
        stack: &AlignedStack,
        col: &Column,
        slope: Option<&Raster>,
        t: usize,
        i: usize,
    ) -> Option<f32> {
        let v = match *col {
            Column::Dynamic(k) => stack.dynamic[k].frames[t].data[i],
            Column::Rolling(k, m) => {
                let frames = &stack.dynamic[k].frames[t + 1 - m..=t];
                frames.iter().map(|f| f.data[i]).sum::<f32>() / m as f32
            }
            Column::Anomaly(k) => {
                let layer = &stack.dynamic[k];
                let clim = &self.climatology[&layer.name][stack.times[t].month_index()];
                layer.frames[t].data[i] - clim.data[i]
            }
            Column::Static(k) => stack.statics[k].raster.data[i],
            Column::Slope => slope?.data[i],
            Column::OneHot(k, code) => {
                let v = stack.statics[k].raster.data[i];
                if v.round() as i64 == code { 1.0 } else { 0.0 }
            }
        };
        (!v.is_nan()).then_some(v)
    }
}

// ── CSV ───────────────────────────────────────────────────────────────────────

const FIXED: [&str; 4] = ["row", "col", "time", "target"];

impl FeatureTable {
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| AquiferError::UnknownVariable(name.to_string()))
    }

    /// `row,col,time,target,<columns…>`
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AquiferError::io(parent, e))?;
        }
        let mut w = csv::Writer::from_path(path)?;
        let header: Vec<&str> = FIXED.iter().copied().chain(self.columns.iter().map(String::as_str)).collect();
        w.write_record(&header)?;
        for row in &self.rows {
            let mut rec = vec![
                row.row.to_string(),
                row.col.to_string(),
                row.time.to_string(),
                row.target.to_string(),
            ];
            rec.extend(row.values.iter().map(f32::to_string));
            w.write_record(&rec)?;
        }
        w.flush().map_err(|e| AquiferError::io(path, e))?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if headers.len() < FIXED.len() || headers[..FIXED.len()] != FIXED {
            return Err(AquiferError::InvalidFeature(format!(
                "{} must start with columns {}",
                path.display(),
                FIXED.join(",")
            )));
        }
        let columns = headers[FIXED.len()..].to_vec();

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let field = |k: usize| record.get(k).unwrap_or("");
            let parse_err = |what: &str| {
                AquiferError::InvalidFeature(format!("{} row {line}: bad {what}", path.display()))
            };
            let values = (FIXED.len()..headers.len())
                .map(|k| field(k).trim().parse::<f32>().map_err(|_| parse_err(&headers[k])))
                .collect::<Result<Vec<f32>>>()?;
            rows.push(FeatureRow {
                row: field(0).parse().map_err(|_| parse_err("row"))?,
                col: field(1).parse().map_err(|_| parse_err("col"))?,
                time: field(2).parse()?,
                target: field(3).trim().parse().map_err(|_| parse_err("target"))?,
                values,
            });
        }
        Ok(Self { columns, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::align::tests::synthetic_stack;

    fn spec() -> FeatureSpec {
        FeatureSpec {
            rolling: vec![("precip".into(), 3)],
            anomalies: vec!["precip".into()],
            horizon: 1,
            include_slope: true,
        }
    }

    #[test]
    fn columns_are_ordered_and_exclude_target() {
        let stack = synthetic_stack(6);
        let b = FeatureBuilder::fit(&stack, &spec()).unwrap();
        assert_eq!(
            b.columns(),
            &["precip", "precip_3m", "precip_anom", "soil", "lulc=10", "lulc=20"]
        );
    }

    #[test]
    fn rows_need_full_window_and_target() {
        let stack = synthetic_stack(6);
        let table = FeatureBuilder::fit(&stack, &spec()).unwrap().build(&stack, true).unwrap();
        // t ∈ {2, 3, 4} (window of 3, target at t + 1 ≤ 5), 12 cells each.
        assert_eq!(table.rows.len(), 3 * 12);
        let first = &table.rows[0];
        assert_eq!(first.time, stack.times[2]);
        assert_eq!(first.target, 3.0);
        // precip = 10 + t; 3-month mean at t = 2 is 11.
        assert_eq!(first.values[0], 12.0);
        assert_eq!(first.values[1], 11.0);
    }

    #[test]
    fn anomaly_uses_fitted_climatology() {
        let stack = synthetic_stack(24);
        let b = FeatureBuilder::fit(&stack, &spec()).unwrap();
        let table = b.build(&stack, true).unwrap();
        let idx = table.column_index("precip_anom").unwrap();
        // March climatology = mean(12, 24) = 18 over t = 2 and t = 14.
        let march = table.rows.iter().find(|r| r.time == stack.times[2]).unwrap();
        assert!((march.values[idx] - (12.0 - 18.0)).abs() < 1e-5);
    }

    #[test]
    fn scenario_rows_run_past_target() {
        let stack = synthetic_stack(4);
        let b = FeatureBuilder::fit(&stack, &spec()).unwrap();
        let table = b.build(&stack, false).unwrap();
        let last = table.rows.last().unwrap();
        assert_eq!(last.time, stack.times[3]);
        assert!(last.target.is_nan());
    }

    #[test]
    fn target_cannot_be_rolled() {
        let stack = synthetic_stack(4);
        let mut s = spec();
        s.rolling.push(("tws".into(), 2));
        assert!(matches!(FeatureBuilder::fit(&stack, &s), Err(AquiferError::InvalidFeature(_))));
    }

    #[test]
    fn csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("features.csv");
        let stack = synthetic_stack(5);
        let table = FeatureBuilder::fit(&stack, &spec()).unwrap().build(&stack, true).unwrap();
        table.write_csv(&path).unwrap();
        let back = FeatureTable::read_csv(&path).unwrap();
        assert_eq!(back.columns, table.columns);
        assert_eq!(back.rows, table.rows);
    }
}
