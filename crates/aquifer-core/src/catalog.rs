//! Data-source catalog: which rasters feed the pipeline and how each one is
//! brought onto the analysis grid.
//!
//! Read from `data/catalog.json`. Paths are relative to the catalog file.
//! Dynamic variables use a `{yyyy}`/`{mm}` path template, one file per month.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calendar::YearMonth;
use crate::error::{AquiferError, Result};
use crate::grid::GridSpec;
use crate::regrid::Resampling;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Monthly time series (ERA5, Sentinel-2 NDVI, soil moisture, GRACE).
    Dynamic,
    /// Time-invariant layer (DEM, land use, soil, aquifer type).
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    #[default]
    Continuous,
    /// Integer class codes; one-hot encoded downstream.
    Categorical,
}

/// How a climate-model change signal is applied to this variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMethod {
    /// `x + (future − historical)`, e.g. temperature.
    #[default]
    Additive,
    /// `x × future / historical`, e.g. precipitation, evaporation.
    Multiplicative,
}

fn one() -> f32 {
    1.0
}

fn default_max_gap() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDef {
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub kind: VariableKind,
    /// Defaults to bilinear (continuous) or mode (categorical).
    #[serde(default)]
    pub resampling: Option<Resampling>,
    pub path: String,
    /// Source nodata sentinel, in addition to NaN and any GDAL nodata tag.
    #[serde(default)]
    pub nodata: Option<f32>,
    /// Unit conversion applied after reading: `v * scale + offset`.
    #[serde(default = "one")]
    pub scale: f32,
    #[serde(default)]
    pub offset: f32,
    #[serde(default)]
    pub change: ChangeMethod,
    /// Marks the DEM; terrain slope is derived from it.
    #[serde(default)]
    pub elevation: bool,
}

impl VariableDef {
    pub fn resampling(&self) -> Resampling {
        self.resampling.unwrap_or(match self.kind {
            VariableKind::Continuous => Resampling::Bilinear,
            VariableKind::Categorical => Resampling::Mode,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub grid: GridSpec,
    pub start: YearMonth,
    pub end: YearMonth,
    /// Longest run of missing months that gap filling may bridge.
    #[serde(default = "default_max_gap")]
    pub max_gap_months: usize,
    /// Dynamic variable the models predict (GRACE TWS anomaly).
    pub target: String,
    pub variables: Vec<VariableDef>,
    /// Directory relative paths resolve against; set by `load`.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AquiferError::io(path, e))?;
        let mut catalog: Catalog = serde_json::from_str(&text)?;
        catalog.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(AquiferError::Catalog(msg));
        self.grid.validate()?;

        if self.end < self.start {
            return bad(format!("end {} precedes start {}", self.end, self.start));
        }

        let mut seen = HashSet::new();
        for v in &self.variables {
            if !seen.insert(v.name.as_str()) {
                return bad(format!("duplicate variable '{}'", v.name));
            }
            if v.role == Role::Dynamic && !v.path.contains("{yyyy}") {
                return bad(format!("dynamic variable '{}' path lacks {{yyyy}}", v.name));
            }
            if v.kind == VariableKind::Categorical && v.role != Role::Static {
                return bad(format!("categorical variable '{}' must be static", v.name));
            }
            if v.kind == VariableKind::Categorical && !v.resampling().preserves_classes() {
                return bad(format!(
                    "categorical variable '{}' must use nearest or mode resampling",
                    v.name
                ));
            }
            if v.elevation && (v.role != Role::Static || v.kind != VariableKind::Continuous) {
                return bad(format!("elevation layer '{}' must be static and continuous", v.name));
            }
        }

        if self.variables.iter().filter(|v| v.elevation).count() > 1 {
            return bad("at most one elevation layer is allowed".into());
        }

        match self.variable(&self.target) {
            Some(v) if v.role == Role::Dynamic && v.kind == VariableKind::Continuous => Ok(()),
            Some(_) => bad(format!("target '{}' must be a continuous dynamic variable", self.target)),
            None => bad(format!("target '{}' is not a declared variable", self.target)),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDef> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn dynamic(&self) -> impl Iterator<Item = &VariableDef> {
        self.variables.iter().filter(|v| v.role == Role::Dynamic)
    }

    pub fn statics(&self) -> impl Iterator<Item = &VariableDef> {
        self.variables.iter().filter(|v| v.role == Role::Static)
    }

    pub fn months(&self) -> Vec<YearMonth> {
        YearMonth::range_inclusive(self.start, self.end)
    }

    /// File for a static layer, or for one month of a dynamic variable.
    pub fn resolve(&self, var: &VariableDef, time: Option<YearMonth>) -> PathBuf {
        let rel = match time {
            Some(t) => t.fill_template(&var.path),
            None => var.path.clone(),
        };
        self.base_dir.join(rel)
    }
}
