//! Harmonise spatial resolution: resample any raster onto a target grid.
//!
//! Target cells outside the source bounds are nodata. The output always has
//! exactly `target.len()` cells, whatever the method.

#[cfg(feature = "threading")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::grid::GridSpec;
use crate::raster::Raster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    /// Source cell containing the target cell centre.
    Nearest,
    /// Bilinear between the four source cell centres around the target centre.
    Bilinear,
    /// Mean of the valid source cells whose centres fall in the target cell.
    /// Falls back to bilinear when the target is finer than the source.
    Average,
    /// Majority class among the source cells in the target cell (ties go to
    /// the smallest code). Falls back to nearest. For categorical layers.
    Mode,
}

impl Resampling {
    /// Methods that never invent new values, safe for class codes.
    pub fn preserves_classes(self) -> bool {
        matches!(self, Resampling::Nearest | Resampling::Mode)
    }
}

/// Resample `src` onto `target`.
pub fn regrid(src: &Raster, target: &GridSpec, method: Resampling) -> Raster {
    if src.grid.same_as(target, 1e-9) {
        return Raster { grid: *target, data: src.data.clone() };
    }

    #[cfg(feature = "threading")]
    let rows: Vec<Vec<f32>> = (0..target.height)
        .into_par_iter()
        .map(|r| regrid_row(src, target, method, r))
        .collect();
    #[cfg(not(feature = "threading"))]
    let rows: Vec<Vec<f32>> = (0..target.height)
        .map(|r| regrid_row(src, target, method, r))
        .collect();

    Raster { grid: *target, data: rows.concat() }
}

fn regrid_row(src: &Raster, target: &GridSpec, method: Resampling, row: usize) -> Vec<f32> {
    (0..target.width)
        .map(|col| {
            let (lon, lat) = target.cell_center(row, col);
            let v = match method {
                Resampling::Nearest => src.sample_nearest(lon, lat),
                Resampling::Bilinear => src.sample_bilinear(lon, lat),
                Resampling::Average => cell_mean(src, target, row, col)
                    .or_else(|| src.sample_bilinear(lon, lat)),
                Resampling::Mode => cell_mode(src, target, row, col)
                    .or_else(|| src.sample_nearest(lon, lat)),
            };
            v.unwrap_or(f32::NAN)
        })
        .collect()
}

/// Half-open index range of source cells whose centres lie in `[lo, hi)`.
fn centre_range(lo: f64, hi: f64, origin: f64, step: f64, n: usize) -> (usize, usize) {
    let first = ((lo - origin) / step - 0.5).ceil().max(0.0);
    let last = ((hi - origin) / step - 0.5).ceil().max(0.0);
    ((first as usize).min(n), (last as usize).min(n))
}

/// Source cells covered by target cell `(row, col)`, or None if the target is
/// finer than the source there (no source centre inside).
fn covered_cells(src: &Raster, target: &GridSpec, row: usize, col: usize) -> Option<Vec<f32>> {
    let cell = target.cell_bbox(row, col);
    let sg = &src.grid;
    let (sdx, sdy) = sg.cell_size();
    let (c0, c1) = centre_range(cell.min_lon, cell.max_lon, sg.bbox.min_lon, sdx, sg.width);
    let (r0, r1) = centre_range(cell.min_lat, cell.max_lat, sg.bbox.min_lat, sdy, sg.height);
    if c0 >= c1 || r0 >= r1 {
        return None;
    }
    let mut out = Vec::with_capacity((c1 - c0) * (r1 - r0));
    for r in r0..r1 {
        for c in c0..c1 {
            out.push(src.get(r, c));
        }
    }
    Some(out)
}

fn cell_mean(src: &Raster, target: &GridSpec, row: usize, col: usize) -> Option<f32> {
    let cells = covered_cells(src, target, row, col)?;
    let (sum, n) = cells
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0f64, 0usize), |(s, n), &v| (s + v as f64, n + 1));
    if n == 0 {
        // Covered but entirely nodata: stays nodata rather than falling back.
        return Some(f32::NAN);
    }
    Some((sum / n as f64) as f32)
}

fn cell_mode(src: &Raster, target: &GridSpec, row: usize, col: usize) -> Option<f32> {
    let cells = covered_cells(src, target, row, col)?;
    let mut classes: Vec<i64> = cells
        .iter()
        .filter(|v| !v.is_nan())
        .map(|&v| v.round() as i64)
        .collect();
    if classes.is_empty() {
        return Some(f32::NAN);
    }
    classes.sort_unstable();

    // Longest run in the sorted codes; strict `>` keeps the smallest on ties.
    let mut best = (classes[0], 0usize);
    let mut run = (classes[0], 0usize);
    for &c in &classes {
        if c == run.0 {
            run.1 += 1;
        } else {
            run = (c, 1);
        }
        if run.1 > best.1 {
            best = run;
        }
    }
    Some(best.0 as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::BBox;

    fn grid(w: usize, h: usize) -> GridSpec {
        GridSpec::new(w, h, BBox::new(0.0, 4.0, 0.0, 4.0)).unwrap()
    }

    fn checkerboard(n: usize) -> Raster {
        let mut r = Raster::new(grid(n, n), 0.0);
        for row in 0..n {
            for col in 0..n {
                r.set(row, col, ((row + col) % 2) as f32);
            }
        }
        r
    }

    #[test]
    fn output_always_matches_target_shape() {
        let src = checkerboard(8);
        let target = GridSpec::new(3, 5, BBox::new(-1.0, 5.0, 0.5, 3.5)).unwrap();
        for m in [Resampling::Nearest, Resampling::Bilinear, Resampling::Average, Resampling::Mode] {
            let out = regrid(&src, &target, m);
            assert_eq!(out.data.len(), 15, "{m:?}");
            assert_eq!(out.grid, target);
        }
    }

    #[test]
    fn average_of_constant_field_is_constant() {
        let src = Raster::new(grid(8, 8), 7.5);
        let out = regrid(&src, &grid(2, 2), Resampling::Average);
        assert!(out.data.iter().all(|&v| (v - 7.5).abs() < 1e-6));
    }

    #[test]
    fn average_downsamples_checkerboard_to_half() {
        let out = regrid(&checkerboard(8), &grid(4, 4), Resampling::Average);
        assert!(out.data.iter().all(|&v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn average_upsampling_falls_back_to_bilinear() {
        let src_grid = GridSpec::new(2, 1, BBox::new(0.0, 2.0, 0.0, 1.0)).unwrap();
        let src = Raster::from_data(src_grid, vec![0.0, 10.0]).unwrap();
        let target = GridSpec::new(4, 1, BBox::new(0.0, 2.0, 0.0, 1.0)).unwrap();
        let out = regrid(&src, &target, Resampling::Average);
        assert!(out.data.iter().all(|v| !v.is_nan()));
        assert!(out.get(0, 1) < out.get(0, 2));
    }

    #[test]
    fn mode_picks_majority_and_smallest_on_tie() {
        let g = GridSpec::new(2, 2, BBox::new(0.0, 2.0, 0.0, 2.0)).unwrap();
        let majority = Raster::from_data(g, vec![3.0, 3.0, 5.0, f32::NAN]).unwrap();
        let one = GridSpec::new(1, 1, g.bbox).unwrap();
        assert_eq!(regrid(&majority, &one, Resampling::Mode).data, vec![3.0]);

        let tie = Raster::from_data(g, vec![5.0, 2.0, 5.0, 2.0]).unwrap();
        assert_eq!(regrid(&tie, &one, Resampling::Mode).data, vec![2.0]);
    }

    #[test]
    fn cells_outside_source_are_nodata() {
        let src = Raster::new(grid(4, 4), 1.0);
        let target = GridSpec::new(2, 1, BBox::new(2.0, 6.0, 0.0, 1.0)).unwrap();
        let out = regrid(&src, &target, Resampling::Bilinear);
        assert_eq!(out.get(0, 0), 1.0);
        assert!(out.get(0, 1).is_nan());
    }

    #[test]
    fn identical_grid_is_a_copy() {
        let src = checkerboard(4);
        let out = regrid(&src, &src.grid, Resampling::Bilinear);
        assert_eq!(out.data, src.data);
    }
}
