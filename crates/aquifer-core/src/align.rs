//! Aligned spatiotemporal stack: every source regridded onto the catalog
//! grid, every dynamic variable on one contiguous monthly time axis.
//!
//! Pipeline:
//!   read → unit conversion → regrid → gap fill (dynamic only).
//!
//! Invariants held by every `AlignedStack`:
//!   - every frame and static layer lives on `grid`;
//!   - every dynamic layer has exactly `times.len()` frames;
//!   - `times` is contiguous and strictly monthly.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use log::{debug, info, warn};
#[cfg(feature = "threading")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calendar::YearMonth;
use crate::catalog::{Catalog, ChangeMethod, VariableDef, VariableKind};
use crate::error::{AquiferError, Result};
use crate::geotiff::{read_geotiff, read_geotiff_with_nodata, write_geotiff};
use crate::grid::GridSpec;
use crate::raster::Raster;
use crate::regrid::regrid;

pub struct DynamicLayer {
    pub name: String,
    pub change: ChangeMethod,
    /// One frame per entry of `AlignedStack::times`.
    pub frames: Vec<Raster>,
}

pub struct StaticLayer {
    pub name: String,
    pub kind: VariableKind,
    pub elevation: bool,
    pub raster: Raster,
}

/// Mean and standard deviation of a variable over valid cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormStats {
    pub mean: f32,
    pub std: f32,
}

impl NormStats {
    const STD_FLOOR: f32 = 1e-6;

    /// Statistics over the valid values in `values`; (0, 1) when none are valid.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f32>) -> Self {
        let (mut sum, mut sum_sq, mut n) = (0.0f64, 0.0f64, 0usize);
        for &v in values {
            if !v.is_nan() {
                sum += v as f64;
                sum_sq += (v as f64) * (v as f64);
                n += 1;
            }
        }
        if n == 0 {
            return Self { mean: 0.0, std: 1.0 };
        }
        let mean = sum / n as f64;
        let var = (sum_sq / n as f64 - mean * mean).max(0.0);
        Self { mean: mean as f32, std: (var.sqrt() as f32).max(Self::STD_FLOOR) }
    }

    #[inline]
    pub fn normalize(&self, v: f32) -> f32 {
        (v - self.mean) / self.std
    }
}

pub struct AlignedStack {
    pub grid: GridSpec,
    pub times: Vec<YearMonth>,
    pub dynamic: Vec<DynamicLayer>,
    pub statics: Vec<StaticLayer>,
    pub target: String,
}

// ── Manifest ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StackManifest {
    grid: GridSpec,
    times: Vec<YearMonth>,
    target: String,
    dynamic: Vec<DynamicEntry>,
    statics: Vec<StaticEntry>,
}

#[derive(Serialize, Deserialize)]
struct DynamicEntry {
    name: String,
    change: ChangeMethod,
}

#[derive(Serialize, Deserialize)]
struct StaticEntry {
    name: String,
    kind: VariableKind,
    elevation: bool,
}

const MANIFEST: &str = "manifest.json";

fn frame_file(name: &str, t: YearMonth) -> String {
    format!("{name}_{t}.tif")
}

// ── Building ──────────────────────────────────────────────────────────────────

fn load_layer(catalog: &Catalog, var: &VariableDef, path: &Path) -> Result<Raster> {
    let mut raw = read_geotiff_with_nodata(path, var.nodata)?;
    raw.rescale(var.scale, var.offset);
    Ok(regrid(&raw, &catalog.grid, var.resampling()))
}

/// Frame for month `t`, or None when the file is absent (a gap).
fn load_month(catalog: &Catalog, var: &VariableDef, t: YearMonth) -> Result<Option<Raster>> {
    let path = catalog.resolve(var, Some(t));
    if !path.exists() {
        debug!("{}: no file for {t} ({})", var.name, path.display());
        return Ok(None);
    }
    load_layer(catalog, var, &path).map(Some)
}

/// Fill runs of missing frames.
///
/// Interior runs of at most `max_gap` months are linearly interpolated per
/// cell between the bracketing frames (nodata unless both ends are valid).
/// Leading and trailing runs of at most `max_gap` copy the nearest frame.
/// Anything longer is a `TimeGap`.
pub fn fill_gaps(
    variable: &str,
    frames: Vec<Option<Raster>>,
    times: &[YearMonth],
    max_gap: usize,
) -> Result<Vec<Raster>> {
    let n = frames.len();
    let gap = |i: usize, j: usize| AquiferError::TimeGap {
        variable: variable.to_string(),
        from: times[i],
        to: times[j - 1],
    };

    if n == 0 {
        return Ok(Vec::new());
    }
    if frames.iter().all(Option::is_none) {
        return Err(gap(0, n));
    }

    let mut filled: Vec<Option<Raster>> = frames;
    let mut i = 0;
    while i < n {
        if filled[i].is_some() {
            i += 1;
            continue;
        }
        let mut j = i;
        while j < n && filled[j].is_none() {
            j += 1;
        }
        let len = j - i;
        if len > max_gap {
            return Err(gap(i, j));
        }

        if i == 0 || j == n {
            let src = if i == 0 { j } else { i - 1 };
            let copy = filled[src].clone();
            for slot in &mut filled[i..j] {
                *slot = copy.clone();
            }
        } else {
            let (before, after) = match (&filled[i - 1], &filled[j]) {
                (Some(b), Some(a)) => (b.clone(), a.clone()),
                _ => return Err(gap(i, j)),
            };
            let span = (j - (i - 1)) as f32;
            for k in i..j {
                let w = (k - (i - 1)) as f32 / span;
                let data = before
                    .data
                    .iter()
                    .zip(&after.data)
                    .map(|(&b, &a)| b + (a - b) * w)
                    .collect();
                filled[k] = Some(Raster { grid: before.grid, data });
            }
        }
        warn!("{variable}: filled {len} missing month(s) {}..={}", times[i], times[j - 1]);
        i = j;
    }

    Ok(filled.into_iter().flatten().collect())
}

impl AlignedStack {
    /// Read, convert, regrid and gap-fill every catalog variable.
    pub fn build(catalog: &Catalog) -> Result<Self> {
        let times = catalog.months();

        let mut statics = Vec::new();
        for var in catalog.statics() {
            let path = catalog.resolve(var, None);
            let raster = load_layer(catalog, var, &path)?;
            info!(
                "static {}: {:.1}% valid after regrid",
                var.name,
                raster.valid_fraction() * 100.0
            );
            statics.push(StaticLayer {
                name: var.name.clone(),
                kind: var.kind,
                elevation: var.elevation,
                raster,
            });
        }

        let mut dynamic = Vec::new();
        for var in catalog.dynamic() {
            #[cfg(feature = "threading")]
            let loaded: Vec<Result<Option<Raster>>> =
                times.par_iter().map(|&t| load_month(catalog, var, t)).collect();
            #[cfg(not(feature = "threading"))]
            let loaded: Vec<Result<Option<Raster>>> =
                times.iter().map(|&t| load_month(catalog, var, t)).collect();

            let frames = loaded.into_iter().collect::<Result<Vec<_>>>()?;
            let present = frames.iter().filter(|f| f.is_some()).count();
            let frames = fill_gaps(&var.name, frames, &times, catalog.max_gap_months)?;
            info!("dynamic {}: {present}/{} months on disk", var.name, times.len());
            dynamic.push(DynamicLayer { name: var.name.clone(), change: var.change, frames });
        }

        Ok(Self {
            grid: catalog.grid,
            times,
            dynamic,
            statics,
            target: catalog.target.clone(),
        })
    }

    // ── Lookup ────────────────────────────────────────────────────────────

    pub fn dynamic_layer(&self, name: &str) -> Result<&DynamicLayer> {
        self.dynamic
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| AquiferError::UnknownVariable(name.to_string()))
    }

    pub fn static_layer(&self, name: &str) -> Result<&StaticLayer> {
        self.statics
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| AquiferError::UnknownVariable(name.to_string()))
    }

    pub fn target_layer(&self) -> Result<&DynamicLayer> {
        self.dynamic_layer(&self.target)
    }

    pub fn time_index(&self, t: YearMonth) -> Option<usize> {
        let i = self.times.first()?.months_until(t);
        (i >= 0 && (i as usize) < self.times.len()).then_some(i as usize)
    }

    pub fn elevation(&self) -> Option<&StaticLayer> {
        self.statics.iter().find(|l| l.elevation)
    }

    // ── Masks and statistics ──────────────────────────────────────────────

    /// Cells valid in every static layer.
    pub fn static_mask(&self) -> Vec<bool> {
        (0..self.grid.len())
            .map(|i| self.statics.iter().all(|l| !l.raster.data[i].is_nan()))
            .collect()
    }

    /// Cells valid in every static layer and every dynamic layer at step `t`.
    pub fn valid_mask(&self, t: usize) -> Vec<bool> {
        let mut mask = self.static_mask();
        for layer in &self.dynamic {
            for (m, v) in mask.iter_mut().zip(&layer.frames[t].data) {
                *m &= !v.is_nan();
            }
        }
        mask
    }

    /// Twelve per-calendar-month mean rasters (January first) of `name`.
    /// Months absent from the stack are all-nodata.
    pub fn climatology(&self, name: &str) -> Result<Vec<Raster>> {
        let layer = self.dynamic_layer(name)?;
        let n = self.grid.len();
        let mut sums = vec![vec![0.0f64; n]; 12];
        let mut counts = vec![vec![0u32; n]; 12];
        for (frame, t) in layer.frames.iter().zip(&self.times) {
            let m = t.month_index();
            for (i, &v) in frame.data.iter().enumerate() {
                if !v.is_nan() {
                    sums[m][i] += v as f64;
                    counts[m][i] += 1;
                }
            }
        }
        Ok(sums
            .into_iter()
            .zip(counts)
            .map(|(s, c)| Raster {
                grid: self.grid,
                data: s
                    .iter()
                    .zip(&c)
                    .map(|(&s, &c)| if c == 0 { f32::NAN } else { (s / c as f64) as f32 })
                    .collect(),
            })
            .collect())
    }

    /// Normalisation statistics for every continuous layer. Dynamic layers
    /// only use frames up to and including `until` (all frames when None).
    pub fn norm_stats(&self, until: Option<YearMonth>) -> BTreeMap<String, NormStats> {
        let mut out = BTreeMap::new();
        for layer in &self.dynamic {
            let frames = layer
                .frames
                .iter()
                .zip(&self.times)
                .filter(|(_, t)| until.map_or(true, |u| **t <= u))
                .flat_map(|(f, _)| f.data.iter());
            out.insert(layer.name.clone(), NormStats::from_values(frames));
        }
        for layer in self.statics.iter().filter(|l| l.kind == VariableKind::Continuous) {
            out.insert(layer.name.clone(), NormStats::from_values(&layer.raster.data));
        }
        out
    }

    /// Sorted class codes present in a categorical static layer.
    pub fn categories(&self, name: &str) -> Result<Vec<i64>> {
        let layer = self.static_layer(name)?;
        let set: BTreeSet<i64> = layer
            .raster
            .data
            .iter()
            .filter(|v| !v.is_nan())
            .map(|&v| v.round() as i64)
            .collect();
        Ok(set.into_iter().collect())
    }

    /// Check the structural invariants; used after loading or projecting.
    pub fn check(&self) -> Result<()> {
        for w in self.times.windows(2) {
            if w[0].succ() != w[1] {
                return Err(AquiferError::TimeAxisMismatch(format!(
                    "time axis jumps from {} to {}",
                    w[0], w[1]
                )));
            }
        }
        for layer in &self.dynamic {
            if layer.frames.len() != self.times.len() {
                return Err(AquiferError::TimeAxisMismatch(format!(
                    "{} has {} frames for {} time steps",
                    layer.name,
                    layer.frames.len(),
                    self.times.len()
                )));
            }
            for f in &layer.frames {
                self.grid.ensure_same(&f.grid, &layer.name)?;
            }
        }
        for layer in &self.statics {
            self.grid.ensure_same(&layer.raster.grid, &layer.name)?;
        }
        self.target_layer()?;
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────────────

    /// Write every layer as GeoTIFF plus `manifest.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| AquiferError::io(dir, e))?;
        for layer in &self.statics {
            write_geotiff(&dir.join(format!("{}.tif", layer.name)), &layer.raster)?;
        }
        for layer in &self.dynamic {
            for (frame, &t) in layer.frames.iter().zip(&self.times) {
                write_geotiff(&dir.join(frame_file(&layer.name, t)), frame)?;
            }
        }
        let manifest = StackManifest {
            grid: self.grid,
            times: self.times.clone(),
            target: self.target.clone(),
            dynamic: self
                .dynamic
                .iter()
                .map(|l| DynamicEntry { name: l.name.clone(), change: l.change })
                .collect(),
            statics: self
                .statics
                .iter()
                .map(|l| StaticEntry { name: l.name.clone(), kind: l.kind, elevation: l.elevation })
                .collect(),
        };
        let path = dir.join(MANIFEST);
        fs::write(&path, serde_json::to_string_pretty(&manifest)?)
            .map_err(|e| AquiferError::io(&path, e))?;
        info!("saved aligned stack to {}", dir.display());
        Ok(())
    }

    /// Read a stack written by [`AlignedStack::save`].
    pub fn load(dir: &Path) -> Result<Self> {
        let grid = Self::load_grid(dir)?;
        let path = dir.join(MANIFEST);
        let text = fs::read_to_string(&path).map_err(|e| AquiferError::io(&path, e))?;
        let manifest: StackManifest = serde_json::from_str(&text)?;

        let statics = manifest
            .statics
            .into_iter()
            .map(|e| {
                let raster = read_geotiff(&dir.join(format!("{}.tif", e.name)))?;
                Ok(StaticLayer { name: e.name, kind: e.kind, elevation: e.elevation, raster })
            })
            .collect::<Result<Vec<_>>>()?;

        let dynamic = manifest
            .dynamic
            .into_iter()
            .map(|e| {
                let frames = manifest
                    .times
                    .iter()
                    .map(|&t| read_geotiff(&dir.join(frame_file(&e.name, t))))
                    .collect::<Result<Vec<_>>>()?;
                Ok(DynamicLayer { name: e.name, change: e.change, frames })
            })
            .collect::<Result<Vec<_>>>()?;

        let stack = Self { grid, times: manifest.times, dynamic, statics, target: manifest.target };
        stack.check()?;
        Ok(stack)
    }

    /// Only the grid from a saved stack's manifest.
    pub fn load_grid(dir: &Path) -> Result<GridSpec> {
        #[derive(Deserialize)]
        struct GridOnly {
            grid: GridSpec,
        }
        let path = dir.join(MANIFEST);
        let text = fs::read_to_string(&path).map_err(|e| AquiferError::io(&path, e))?;
        let g: GridOnly = serde_json::from_str(&text)?;
        g.grid.validate()?;
        Ok(g.grid)
    }
}
