//! PNG rendering of rasters and class maps, plus legend sidecars.

use std::fs;
use std::path::Path;

use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{AquiferError, Result};
use crate::raster::Raster;
use crate::risk::RiskClass;

pub const TRAFFIC_LIGHT_PNG: &str = "traffic_light_map.png";

pub fn risk_map_name(scenario: &str, year: i32) -> String {
    format!("risk_map_{scenario}_{year}.tif")
}

const NODATA: Rgba<u8> = Rgba([0, 0, 0, 0]);

// ── Colour helpers ────────────────────────────────────────────────────────────

pub fn traffic_light(class: RiskClass) -> [u8; 3] {
    match class {
        RiskClass::Low => [46, 160, 67],       // green
        RiskClass::Moderate => [245, 166, 35], // amber
        RiskClass::High => [208, 52, 44],      // red
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ramp {
    /// White to deep blue.
    Sequential,
    /// Blue through white to red, centred on the middle of the range.
    Diverging,
}

impl Ramp {
    /// Colour at `t` in `[0, 1]`.
    pub fn color(self, t: f32) -> [u8; 3] {
        let t = t.clamp(0.0, 1.0);
        match self {
            Ramp::Sequential => {
                let lo = (255.0 * (1.0 - t)) as u8;
                let b = (255.0 - 75.0 * t) as u8; // 255 → 180
                [lo, lo, b]
            }
            Ramp::Diverging => {
                if t < 0.5 {
                    let s = t / 0.5;
                    [lerp(33, 255, s), lerp(102, 255, s), lerp(172, 255, s)]
                } else {
                    let s = (t - 0.5) / 0.5;
                    [lerp(255, 178, s), lerp(255, 24, s), lerp(255, 43, s)]
                }
            }
        }
    }
}

fn lerp(a: u8, b: u8, t: f32) -> u8 {
    (a as f32 + (b as f32 - a as f32) * t).round() as u8
}

/// Distinct colours for class codes, cycling past the end of the table.
pub fn categorical_palette(codes: &[i64]) -> Vec<(i64, [u8; 3])> {
    const TABLE: [[u8; 3]; 8] = [
        [210, 180, 140], // tan
        [70, 130, 180],  // steel blue
        [34, 139, 34],   // forest green
        [255, 140, 0],   // orange
        [150, 50, 200],  // purple
        [220, 50, 50],   // red
        [128, 128, 128], // grey
        [240, 230, 140], // khaki
    ];
    codes.iter().enumerate().map(|(k, &c)| (c, TABLE[k % TABLE.len()])).collect()
}

// ── Rendering ─────────────────────────────────────────────────────────────────

/// North-up image; row 0 of the raster is the southern edge.
fn paint(raster: &Raster, color: impl Fn(f32) -> Option<[u8; 3]>) -> RgbaImage {
    let (w, h) = (raster.width(), raster.height());
    let mut img = RgbaImage::from_pixel(w as u32, h as u32, NODATA);
    for r in 0..h {
        for c in 0..w {
            let v = raster.get(r, c);
            if v.is_nan() {
                continue;
            }
            if let Some([rv, gv, bv]) = color(v) {
                img.put_pixel(c as u32, (h - 1 - r) as u32, Rgba([rv, gv, bv, 255]));
            }
        }
    }
    img
}

/// Class codes 1..=3 in traffic-light colours.
pub fn render_classes(classes: &Raster) -> RgbaImage {
    paint(classes, |v| RiskClass::from_code(v).map(traffic_light))
}

/// Continuous values stretched over `range`, or the raster's own min..max.
pub fn render_continuous(raster: &Raster, ramp: Ramp, range: Option<(f32, f32)>) -> RgbaImage {
    let (lo, hi) = range
        .or_else(|| Some((raster.min()?, raster.max()?)))
        .unwrap_or((0.0, 1.0));
    let span = if (hi - lo).abs() < f32::EPSILON { 1.0 } else { hi - lo };
    paint(raster, |v| Some(ramp.color((v - lo) / span)))
}

/// Codes missing from `palette` are left transparent.
pub fn render_categorical(raster: &Raster, palette: &[(i64, [u8; 3])]) -> RgbaImage {
    paint(raster, |v| {
        let code = v.round() as i64;
        palette.iter().find(|(c, _)| *c == code).map(|(_, rgb)| *rgb)
    })
}

pub fn save_png(img: &RgbaImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AquiferError::io(parent, e))?;
    }
    img.save(path)?;
    Ok(())
}

// ── Legends ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegendEntry {
    pub code: i64,
    pub label: String,
    pub color: [u8; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Legend {
    pub title: String,
    pub entries: Vec<LegendEntry>,
    /// Free-form context such as thresholds and scenario.
    #[serde(default)]
    pub notes: serde_json::Map<String, serde_json::Value>,
}

impl Legend {
    pub fn risk(title: impl Into<String>) -> Self {
        let entries = RiskClass::ALL
            .iter()
            .map(|&c| LegendEntry { code: c.code() as i64, label: c.label().into(), color: traffic_light(c) })
            .collect();
        Self { title: title.into(), entries, notes: serde_json::Map::new() }
    }

    pub fn categorical(title: impl Into<String>, palette: &[(i64, [u8; 3])], labels: &[String]) -> Self {
        let entries = palette
            .iter()
            .enumerate()
            .map(|(k, &(code, color))| LegendEntry {
                code,
                label: labels.get(k).cloned().unwrap_or_else(|| code.to_string()),
                color,
            })
            .collect();
        Self { title: title.into(), entries, notes: serde_json::Map::new() }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AquiferError::io(parent, e))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).map_err(|e| AquiferError::io(path, e))
    }
}
