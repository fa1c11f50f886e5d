use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{AquiferError, Result};
use crate::grid::GridSpec;

/// A single-band raster on a [`GridSpec`], f32 values, row-major, row 0 = south.
/// NaN marks nodata. Coordinate math uses f64; values use f32.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Raster {
    pub grid: GridSpec,
    /// Row-major cell values; serialized with nodata as `null`.
    #[serde(deserialize_with = "null_as_nan_vec")]
    pub data: Vec<f32>,
}

/// JSON has no NaN: serde_json writes it as `null`, so read `null` back as NaN.
pub(crate) fn null_as_nan_vec<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Vec<f32>, D::Error> {
    let v: Vec<Option<f32>> = Vec::deserialize(d)?;
    Ok(v.into_iter().map(|x| x.unwrap_or(f32::NAN)).collect())
}

impl Raster {
    /// Create a raster filled with the given value.
    pub fn new(grid: GridSpec, fill: f32) -> Self {
        Self { data: vec![fill; grid.len()], grid }
    }

    /// Create an all-nodata raster.
    pub fn nodata(grid: GridSpec) -> Self {
        Self::new(grid, f32::NAN)
    }

    pub fn from_data(grid: GridSpec, data: Vec<f32>) -> Result<Self> {
        if data.len() != grid.len() {
            return Err(AquiferError::ShapeMismatch { expected: grid.len(), actual: data.len() });
        }
        Ok(Self { grid, data })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.grid.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.grid.height
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.grid.width + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f32) {
        self.data[row * self.grid.width + col] = val;
    }

    #[inline]
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        !self.get(row, col).is_nan()
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    /// Fraction of cells holding data, 0 for an empty raster.
    pub fn valid_fraction(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.valid_count() as f64 / self.data.len() as f64
    }

    /// Apply `f` to every valid cell; nodata stays nodata.
    pub fn map(&self, f: impl Fn(f32) -> f32) -> Raster {
        Raster {
            grid: self.grid,
            data: self.data.iter().map(|&v| if v.is_nan() { v } else { f(v) }).collect(),
        }
    }

    /// Linear rescale of valid cells: `v * scale + offset`.
    pub fn rescale(&mut self, scale: f32, offset: f32) {
        if scale == 1.0 && offset == 0.0 {
            return;
        }
        for v in self.data.iter_mut().filter(|v| !v.is_nan()) {
            *v = *v * scale + offset;
        }
    }

    /// Minimum over valid cells, `None` when nothing is valid.
    pub fn min(&self) -> Option<f32> {
        self.data.iter().copied().filter(|v| !v.is_nan()).reduce(f32::min)
    }

    pub fn max(&self) -> Option<f32> {
        self.data.iter().copied().filter(|v| !v.is_nan()).reduce(f32::max)
    }

    pub fn mean(&self) -> Option<f32> {
        let (sum, n) = self
            .data
            .iter()
            .filter(|v| !v.is_nan())
            .fold((0.0f64, 0usize), |(s, n), &v| (s + v as f64, n + 1));
        (n > 0).then(|| (sum / n as f64) as f32)
    }

    /// Value of the cell containing `(lon, lat)`.
    /// Returns None outside the raster bounds or on nodata.
    pub fn sample_nearest(&self, lon: f64, lat: f64) -> Option<f32> {
        let (row, col) = self.grid.locate(lon, lat)?;
        let v = self.get(row, col);
        (!v.is_nan()).then_some(v)
    }

    /// Sample the raster at (lon, lat) using bilinear interpolation between
    /// the four surrounding cell centres.
    ///
    /// Nodata neighbours are dropped and the remaining weights renormalised.
    /// Between the outermost cell centres and the bbox edge the edge value
    /// is held constant. Returns None outside the bounds or when every
    /// contributing cell is nodata.
    pub fn sample_bilinear(&self, lon: f64, lat: f64) -> Option<f32> {
        let b = &self.grid.bbox;
        if !b.contains(lon, lat) {
            return None;
        }
        let (dx, dy) = self.grid.cell_size();
        let w = self.grid.width;
        let h = self.grid.height;

        let fx = ((lon - b.min_lon) / dx - 0.5).clamp(0.0, (w - 1) as f64);
        let fy = ((lat - b.min_lat) / dy - 0.5).clamp(0.0, (h - 1) as f64);

        let x0 = fx.floor() as usize;
        let y0 = fy.floor() as usize;
        let x1 = (x0 + 1).min(w - 1);
        let y1 = (y0 + 1).min(h - 1);

        let tx = fx - x0 as f64;
        let ty = fy - y0 as f64;

        let taps = [
            (self.get(y0, x0), (1.0 - tx) * (1.0 - ty)),
            (self.get(y0, x1), tx * (1.0 - ty)),
            (self.get(y1, x0), (1.0 - tx) * ty),
            (self.get(y1, x1), tx * ty),
        ];

        let mut acc = 0.0f64;
        let mut weight = 0.0f64;
        for (v, wt) in taps {
            if !v.is_nan() {
                acc += v as f64 * wt;
                weight += wt;
            }
        }

        if weight > 1e-12 {
            Some((acc / weight) as f32)
        } else {
            self.sample_nearest(lon, lat)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::BBox;

    fn grid(w: usize, h: usize) -> GridSpec {
        GridSpec::new(w, h, BBox::new(0.0, w as f64, 0.0, h as f64)).unwrap()
    }

    #[test]
    fn bilinear_exact_at_cell_centres() {
        let mut r = Raster::new(grid(4, 4), 0.0);
        r.set(0, 0, 10.0);
        r.set(0, 3, 20.0);
        r.set(3, 0, 30.0);
        r.set(3, 3, 40.0);

        assert!((r.sample_bilinear(0.5, 0.5).unwrap() - 10.0).abs() < 1e-5);
        assert!((r.sample_bilinear(3.5, 0.5).unwrap() - 20.0).abs() < 1e-5);
        assert!((r.sample_bilinear(0.5, 3.5).unwrap() - 30.0).abs() < 1e-5);
        assert!((r.sample_bilinear(3.5, 3.5).unwrap() - 40.0).abs() < 1e-5);
        // Held constant beyond the outermost centre.
        assert!((r.sample_bilinear(0.0, 0.0).unwrap() - 10.0).abs() < 1e-5);
    }

    #[test]
    fn bilinear_midpoint_averages_neighbours() {
        let mut r = Raster::new(grid(2, 1), 0.0);
        r.set(0, 0, 0.0);
        r.set(0, 1, 10.0);
        assert!((r.sample_bilinear(1.0, 0.5).unwrap() - 5.0).abs() < 1e-5);
    }

    #[test]
    fn bilinear_skips_nodata_neighbours() {
        let mut r = Raster::new(grid(2, 1), 0.0);
        r.set(0, 0, f32::NAN);
        r.set(0, 1, 8.0);
        assert_eq!(r.sample_bilinear(1.0, 0.5), Some(8.0));
        let empty = Raster::nodata(grid(2, 2));
        assert!(empty.sample_bilinear(1.0, 1.0).is_none());
    }

    #[test]
    fn sample_out_of_bounds_returns_none() {
        let r = Raster::new(grid(4, 4), 1.0);
        assert!(r.sample_bilinear(-1.0, 0.0).is_none());
        assert!(r.sample_nearest(0.0, 5.0).is_none());
    }

    #[test]
    fn stats_ignore_nodata() {
        let r = Raster::from_data(grid(2, 2), vec![1.0, f32::NAN, 3.0, 5.0]).unwrap();
        assert_eq!(r.min(), Some(1.0));
        assert_eq!(r.max(), Some(5.0));
        assert_eq!(r.mean(), Some(3.0));
        assert!((r.valid_fraction() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn from_data_rejects_wrong_length() {
        assert!(matches!(
            Raster::from_data(grid(2, 2), vec![0.0; 3]),
            Err(AquiferError::ShapeMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn json_round_trip_keeps_nodata() {
        let r = Raster::from_data(grid(2, 1), vec![f32::NAN, 2.5]).unwrap();
        let json = serde_json::to_string(&r).unwrap();
        let back: Raster = serde_json::from_str(&json).unwrap();
        assert!(back.data[0].is_nan());
        assert_eq!(back.data[1], 2.5);
    }
}
