//! Attribution tables back onto the grid, one raster per feature.

use std::path::Path;

use log::info;

use crate::attribution::AttributionTable;
use crate::calendar::YearMonth;
use crate::error::{AquiferError, Result};
use crate::geotiff::write_geotiff;
use crate::grid::GridSpec;
use crate::raster::Raster;

pub struct AttributionRasters {
    pub features: Vec<String>,
    /// Mean |phi| per cell, one raster per feature.
    pub mean_abs: Vec<Raster>,
    /// Signed mean phi per cell.
    pub mean: Vec<Raster>,
    /// Rows aggregated into each cell.
    pub counts: Vec<u32>,
}

impl AttributionRasters {
    /// Aggregate the rows at `time` (all rows when `None`).
    pub fn from_table(table: &AttributionTable, grid: &GridSpec, time: Option<YearMonth>) -> Result<Self> {
        let nf = table.features.len();
        let n = grid.len();
        let mut abs_sum = vec![vec![0.0f64; n]; nf];
        let mut sum = vec![vec![0.0f64; n]; nf];
        let mut counts = vec![0u32; n];

        for r in table.rows.iter().filter(|r| time.map_or(true, |t| r.time == t)) {
            if r.row >= grid.height || r.col >= grid.width {
                return Err(AquiferError::OutOfGrid {
                    row: r.row,
                    col: r.col,
                    width: grid.width,
                    height: grid.height,
                });
            }
            if r.values.len() != nf {
                return Err(AquiferError::ShapeMismatch { expected: nf, actual: r.values.len() });
            }
            let i = grid.index(r.row, r.col);
            counts[i] += 1;
            for (j, &v) in r.values.iter().enumerate() {
                abs_sum[j][i] += v.abs();
                sum[j][i] += v;
            }
        }

        let to_raster = |acc: &[f64]| {
            let mut out = Raster::nodata(*grid);
            for ((o, &s), &c) in out.data.iter_mut().zip(acc).zip(&counts) {
                if c > 0 {
                    *o = (s / c as f64) as f32;
                }
            }
            out
        };
        let mean_abs = abs_sum.iter().map(|a| to_raster(a)).collect();
        let mean = sum.iter().map(|a| to_raster(a)).collect();
        info!(
            "rasterised {} features over {} cells",
            nf,
            counts.iter().filter(|&&c| c > 0).count()
        );
        Ok(Self { features: table.features.clone(), mean_abs, mean, counts })
    }

    /// Index of the feature with the largest mean |phi| per cell; NaN where
    /// no rows fell.
    pub fn dominant_driver(&self) -> Option<Raster> {
        let first = self.mean_abs.first()?;
        let mut out = Raster::nodata(first.grid);
        for (i, o) in out.data.iter_mut().enumerate() {
            if self.counts[i] == 0 {
                continue;
            }
            let best = self
                .mean_abs
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.data[i].is_nan())
                .max_by(|a, b| a.1.data[i].total_cmp(&b.1.data[i]).then(b.0.cmp(&a.0)));
            if let Some((k, _)) = best {
                *o = k as f32;
            }
        }
        Some(out)
    }

    /// `<feature>_mean_abs.tif` and `<feature>_mean.tif` per feature.
    pub fn write(&self, dir: &Path) -> Result<()> {
        for (k, name) in self.features.iter().enumerate() {
            let stem = file_stem(name);
            write_geotiff(&dir.join(format!("{stem}_mean_abs.tif")), &self.mean_abs[k])?;
            write_geotiff(&dir.join(format!("{stem}_mean.tif")), &self.mean[k])?;
        }
        Ok(())
    }
}

/// Feature names like `lulc=10` made safe for file names.
pub fn file_stem(feature: &str) -> String {
    feature
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
