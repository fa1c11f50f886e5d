//! Groundwater vulnerability pipeline core.
//!
//! Pipeline:
//!   catalog → align (regrid + gap fill) → sequence tensors / feature table →
//!   model + external members → ensemble → scenario projection →
//!   attribution → risk classes → maps.

pub mod align;
pub mod attribution;
pub mod calendar;
pub mod catalog;
pub mod coords;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod geotiff;
pub mod grid;
pub mod metrics;
pub mod model;
pub mod raster;
pub mod rasterize;
pub mod regrid;
pub mod render;
pub mod risk;
pub mod scenario;
pub mod sequence;
mod terrain;

pub use align::AlignedStack;
pub use calendar::YearMonth;
pub use catalog::Catalog;
pub use ensemble::PredictionCube;
pub use error::{AquiferError, Result};
pub use grid::GridSpec;
pub use raster::Raster;
pub use terrain::slope_deg;
