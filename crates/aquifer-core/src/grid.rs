//! Cell-registered (pixel-is-area) analysis grid.
//!
//! Row 0 is the southernmost row (S→N storage, matching the raster layout);
//! columns run west to east. Cell `(r, c)` spans
//! `[min_lon + c·dx, min_lon + (c+1)·dx] × [min_lat + r·dy, min_lat + (r+1)·dy]`.

use serde::{Deserialize, Serialize};

use crate::coords::BBox;
use crate::error::{AquiferError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub bbox: BBox,
}

impl GridSpec {
    pub fn new(width: usize, height: usize, bbox: BBox) -> Result<Self> {
        let grid = Self { width, height, bbox };
        grid.validate()?;
        Ok(grid)
    }

    /// Check dimensions and extent. Grids deserialized from JSON skip
    /// `new`, so loaders call this explicitly.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(AquiferError::InvalidGrid(format!(
                "dimensions must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        let b = &self.bbox;
        if !(b.width_deg() > 0.0 && b.height_deg() > 0.0) {
            return Err(AquiferError::InvalidGrid(format!(
                "degenerate bbox lon [{}, {}] lat [{}, {}]",
                b.min_lon, b.max_lon, b.min_lat, b.max_lat
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        row * self.width + col
    }

    /// Cell size `(dx, dy)` in degrees.
    pub fn cell_size(&self) -> (f64, f64) {
        (
            self.bbox.width_deg() / self.width as f64,
            self.bbox.height_deg() / self.height as f64,
        )
    }

    /// Centre of cell `(row, col)` as `(lon, lat)`.
    pub fn cell_center(&self, row: usize, col: usize) -> (f64, f64) {
        let (dx, dy) = self.cell_size();
        (
            self.bbox.min_lon + (col as f64 + 0.5) * dx,
            self.bbox.min_lat + (row as f64 + 0.5) * dy,
        )
    }

    /// Bounds of cell `(row, col)`.
    pub fn cell_bbox(&self, row: usize, col: usize) -> BBox {
        let (dx, dy) = self.cell_size();
        let min_lon = self.bbox.min_lon + col as f64 * dx;
        let min_lat = self.bbox.min_lat + row as f64 * dy;
        BBox::new(min_lon, min_lon + dx, min_lat, min_lat + dy)
    }

    /// The cell containing `(lon, lat)`. East and north edges are half-open
    /// except on the last column/row, which include the outer boundary.
    pub fn locate(&self, lon: f64, lat: f64) -> Option<(usize, usize)> {
        if !self.bbox.contains(lon, lat) {
            return None;
        }
        let (dx, dy) = self.cell_size();
        let col = (((lon - self.bbox.min_lon) / dx).floor() as usize).min(self.width - 1);
        let row = (((lat - self.bbox.min_lat) / dy).floor() as usize).min(self.height - 1);
        Some((row, col))
    }

    /// Same dimensions and bounds within `tol` cell widths.
    pub fn same_as(&self, other: &GridSpec, tol: f64) -> bool {
        if self.width != other.width || self.height != other.height {
            return false;
        }
        let (dx, dy) = self.cell_size();
        let a = &self.bbox;
        let b = &other.bbox;
        (a.min_lon - b.min_lon).abs() <= tol * dx
            && (a.max_lon - b.max_lon).abs() <= tol * dx
            && (a.min_lat - b.min_lat).abs() <= tol * dy
            && (a.max_lat - b.max_lat).abs() <= tol * dy
    }

    /// Error unless `other` matches this grid to 1e-6 cells.
    pub fn ensure_same(&self, other: &GridSpec, what: &str) -> Result<()> {
        if self.same_as(other, 1e-6) {
            Ok(())
        } else {
            Err(AquiferError::GridMismatch(format!(
                "{what}: {}x{} {:?} vs {}x{} {:?}",
                self.width, self.height, self.bbox, other.width, other.height, other.bbox
            )))
        }
    }
}
