//! Terrain derivatives from the DEM layer.
//!
//! Slope uses Horn's (1981) 3×3 weighted finite-difference gradient:
//!   dz/dx = ((NE + 2·E + SE) − (NW + 2·W + SW)) / (8 · dx)
//!   dz/dy = ((NW + 2·N + NE) − (SW + 2·S + SE)) / (8 · dy)
//!   slope = atan(√(dz_dx² + dz_dy²)) × 180/π

use crate::raster::Raster;

const METRES_PER_DEG: f64 = 111_320.0;

/// Cell size `(dx, dy)` in metres; dx shrinks with cos(mid-latitude).
/// Either falls back to 90 m when degenerate.
fn cell_size_m(r: &Raster) -> (f64, f64) {
    let b = &r.grid.bbox;
    let mid_lat = (b.min_lat + b.max_lat) / 2.0;
    let dx = b.width_deg() / r.width() as f64 * METRES_PER_DEG * mid_lat.to_radians().cos();
    let dy = b.height_deg() / r.height() as f64 * METRES_PER_DEG;
    let or_default = |d: f64| if d < 1e-3 { 90.0 } else { d };
    (or_default(dx), or_default(dy))
}

/// Horn gradient at interior cell `(r, c)`, None if any neighbour is nodata.
///
/// ```text
///   NW(+1,-1)  N(+1, 0)  NE(+1,+1)
///   W ( 0,-1)  *         E ( 0,+1)
///   SW(-1,-1)  S(-1, 0)  SE(-1,+1)
/// ```
/// Rows are stored S→N, so north is `r + 1`.
fn horn_gradient(dem: &Raster, r: usize, c: usize, (dx, dy): (f64, f64)) -> Option<(f64, f64)> {
    let z = |dr: isize, dc: isize| {
        let v = dem.get((r as isize + dr) as usize, (c as isize + dc) as usize);
        (!v.is_nan()).then_some(v as f64)
    };
    let nw = z(1, -1)?;
    let n = z(1, 0)?;
    let ne = z(1, 1)?;
    let w = z(0, -1)?;
    let e = z(0, 1)?;
    let sw = z(-1, -1)?;
    let s = z(-1, 0)?;
    let se = z(-1, 1)?;

    let dz_dx = ((ne + 2.0 * e + se) - (nw + 2.0 * w + sw)) / (8.0 * dx);
    let dz_dy = ((nw + 2.0 * n + ne) - (sw + 2.0 * s + se)) / (8.0 * dy);
    Some((dz_dx, dz_dy))
}

/// Slope in degrees at every interior cell; border cells and cells next to
/// nodata are nodata.
pub fn slope_deg(dem: &Raster) -> Raster {
    let mut out = Raster::nodata(dem.grid);
    if dem.width() < 3 || dem.height() < 3 {
        return out;
    }
    let cell = cell_size_m(dem);
    for r in 1..dem.height() - 1 {
        for c in 1..dem.width() - 1 {
            if let Some((dz_dx, dz_dy)) = horn_gradient(dem, r, c, cell) {
                let slope = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan().to_degrees();
                out.set(r, c, slope as f32);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::BBox;
    use crate::grid::GridSpec;

    /// Planar ramp at `target_deg` degrees rising eastward, ≈90 m cells at the equator.
    fn ramp(n: usize, target_deg: f64) -> Raster {
        let pixel_deg = 90.0 / 111_320.0;
        let extent = n as f64 * pixel_deg;
        let grid = GridSpec::new(n, n, BBox::new(0.0, extent, 0.0, extent)).unwrap();
        let mut r = Raster::new(grid, 0.0);
        let rise = 90.0 * target_deg.to_radians().tan();
        for row in 0..n {
            for col in 0..n {
                r.set(row, col, (col as f64 * rise) as f32);
            }
        }
        r
    }

    #[test]
    fn ramp_slope_matches_construction() {
        let s = slope_deg(&ramp(16, 10.0));
        let v = s.get(8, 8);
        assert!((v - 10.0).abs() < 0.1, "slope {v}");
        assert!(s.get(0, 8).is_nan());
        assert!(s.get(8, 15).is_nan());
    }

    #[test]
    fn nodata_neighbour_propagates() {
        let mut dem = ramp(8, 5.0);
        dem.set(4, 4, f32::NAN);
        let s = slope_deg(&dem);
        assert!(s.get(3, 3).is_nan());
        assert!(!s.get(1, 1).is_nan());
    }

    /// Square-degree cells centred on 60°N: dx ≈ 45 m, dy ≈ 90 m.
    fn high_latitude(n: usize, rise_east: f64, rise_north: f64) -> Raster {
        let pixel_deg = 90.0 / METRES_PER_DEG;
        let half = n as f64 * pixel_deg / 2.0;
        let grid = GridSpec::new(n, n, BBox::new(10.0, 10.0 + 2.0 * half, 60.0 - half, 60.0 + half)).unwrap();
        let mut r = Raster::new(grid, 0.0);
        for row in 0..n {
            for col in 0..n {
                r.set(row, col, (col as f64 * rise_east + row as f64 * rise_north) as f32);
            }
        }
        r
    }

    #[test]
    fn east_west_spacing_narrows_with_latitude() {
        let (dx, dy) = cell_size_m(&high_latitude(16, 0.0, 0.0));
        assert!((dx - 45.0).abs() < 0.1, "dx {dx}");
        assert!((dy - 90.0).abs() < 1e-6, "dy {dy}");

        let tan10 = 10f64.to_radians().tan();
        let east = slope_deg(&high_latitude(16, 45.0 * tan10, 0.0)).get(8, 8);
        assert!((east - 10.0).abs() < 0.1, "east slope {east}");
        let north = slope_deg(&high_latitude(16, 0.0, 90.0 * tan10)).get(8, 8);
        assert!((north - 10.0).abs() < 0.1, "north slope {north}");
    }

    #[test]
    fn flat_dem_has_zero_slope() {
        let grid = GridSpec::new(5, 5, BBox::new(0.0, 0.05, 0.0, 0.05)).unwrap();
        let s = slope_deg(&Raster::new(grid, 120.0));
        assert_eq!(s.get(2, 2), 0.0);
    }
}
