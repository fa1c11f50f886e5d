//! Sliding-window sequence tensors for spatiotemporal models (ConvLSTM).
//!
//! A sample starting at time index `t0` holds `lookback` input steps
//! `t0 .. t0 + lookback` and targets the frame at
//! `t0 + lookback − 1 + horizon`. Each sample covers a square `patch × patch`
//! window of the grid. Tensor layout on disk (little-endian):
//!
//!   inputs.f32   N × L × C × P × P
//!   targets.f32  N × P × P            (raw target units, NaN = nodata)
//!   masks.u8     N × P × P            (1 = cell valid at every step)
//!   index.json   shapes, channels, normalisation, per-sample metadata

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::align::{AlignedStack, NormStats};
use crate::calendar::YearMonth;
use crate::catalog::VariableKind;
use crate::error::{AquiferError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceSpec {
    /// Input steps per sample.
    pub lookback: usize,
    /// Months between the last input step and the target.
    pub horizon: usize,
    /// Time step between consecutive sample starts.
    pub stride: usize,
    /// Patch edge length in cells.
    pub patch: usize,
    pub patch_stride: usize,
    /// Minimum fraction of valid cells for a patch to be kept.
    pub min_valid: f64,
    /// Samples whose target time is after this month are validation samples.
    /// Normalisation statistics only use data up to this month.
    pub train_until: Option<YearMonth>,
}

impl Default for SequenceSpec {
    fn default() -> Self {
        Self {
            lookback: 6,
            horizon: 1,
            stride: 1,
            patch: 32,
            patch_stride: 32,
            min_valid: 0.8,
            train_until: None,
        }
    }
}

impl SequenceSpec {
    pub fn validate(&self, stack: &AlignedStack) -> Result<()> {
        let bad = |msg: String| Err(AquiferError::InvalidSequence(msg));
        if self.lookback == 0 || self.stride == 0 || self.patch == 0 || self.patch_stride == 0 {
            return bad("lookback, stride, patch and patch_stride must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.min_valid) {
            return bad(format!("min_valid {} outside [0, 1]", self.min_valid));
        }
        if self.patch > stack.grid.width || self.patch > stack.grid.height {
            return bad(format!(
                "patch {} exceeds grid {}x{}",
                self.patch, stack.grid.width, stack.grid.height
            ));
        }
        let needed = self.lookback + self.horizon;
        if stack.times.len() < needed {
            return bad(format!(
                "stack has {} time steps, lookback + horizon needs {needed}",
                stack.times.len()
            ));
        }
        Ok(())
    }

    /// Target time index for a sample starting at `t0`.
    #[inline]
    pub fn target_index(&self, t0: usize) -> usize {
        t0 + self.lookback - 1 + self.horizon
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Validation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleIndex {
    pub input_start: YearMonth,
    pub target_time: YearMonth,
    pub row0: usize,
    pub col0: usize,
    pub split: Split,
}

/// Where a channel's values come from.
enum ChannelSource<'a> {
    Dynamic(&'a [crate::raster::Raster], NormStats),
    Static(&'a [f32], NormStats),
    OneHot(&'a [f32], i64),
}

impl ChannelSource<'_> {
    fn value(&self, t: usize, i: usize) -> f32 {
        match self {
            ChannelSource::Dynamic(frames, n) => n.normalize(frames[t].data[i]),
            ChannelSource::Static(data, n) => n.normalize(data[i]),
            ChannelSource::OneHot(data, code) => {
                if data[i].round() as i64 == *code { 1.0 } else { 0.0 }
            }
        }
    }
}

pub struct SequenceSet {
    pub spec: SequenceSpec,
    pub target: String,
    pub channels: Vec<String>,
    pub norm: BTreeMap<String, NormStats>,
    pub samples: Vec<SampleIndex>,
    pub inputs: Vec<f32>,
    pub targets: Vec<f32>,
    pub masks: Vec<u8>,
}

#[derive(Serialize)]
struct IndexFile<'a> {
    shape: Shape,
    target: &'a str,
    spec: &'a SequenceSpec,
    channels: &'a [String],
    norm: &'a BTreeMap<String, NormStats>,
    samples: &'a [SampleIndex],
}

#[derive(Serialize)]
struct Shape {
    samples: usize,
    lookback: usize,
    channels: usize,
    patch: usize,
}

/// Cut the aligned stack into sequence samples.
pub fn build_sequences(stack: &AlignedStack, spec: &SequenceSpec) -> Result<SequenceSet> {
    spec.validate(stack)?;
    let norm = stack.norm_stats(spec.train_until);

    // ── Channel table ────────────────────────────────────────────────────
    let mut channels = Vec::new();
    let mut sources = Vec::new();
    for layer in &stack.dynamic {
        channels.push(layer.name.clone());
        sources.push(ChannelSource::Dynamic(&layer.frames, norm[&layer.name]));
    }
    for layer in stack.statics.iter().filter(|l| l.kind == VariableKind::Continuous) {
        channels.push(layer.name.clone());
        sources.push(ChannelSource::Static(&layer.raster.data, norm[&layer.name]));
    }
    for layer in stack.statics.iter().filter(|l| l.kind == VariableKind::Categorical) {
        for code in stack.categories(&layer.name)? {
            channels.push(format!("{}={code}", layer.name));
            sources.push(ChannelSource::OneHot(&layer.raster.data, code));
        }
    }

    let target = stack.target_layer()?;
    let masks_t: Vec<Vec<bool>> = (0..stack.times.len()).map(|t| stack.valid_mask(t)).collect();
    let grid = &stack.grid;
    let p = spec.patch;

    let mut set = SequenceSet {
        spec: spec.clone(),
        target: stack.target.clone(),
        channels,
        norm,
        samples: Vec::new(),
        inputs: Vec::new(),
        targets: Vec::new(),
        masks: Vec::new(),
    };
    let mut skipped = 0usize;

    let mut t0 = 0;
    while spec.target_index(t0) < stack.times.len() {
        let tt = spec.target_index(t0);
        let target_frame = &target.frames[tt].data;
        let cell_ok: Vec<bool> = (0..grid.len())
            .map(|i| {
                !target_frame[i].is_nan() && (t0..t0 + spec.lookback).all(|t| masks_t[t][i])
            })
            .collect();

        for row0 in (0..=grid.height - p).step_by(spec.patch_stride) {
            for col0 in (0..=grid.width - p).step_by(spec.patch_stride) {
                let cells: Vec<usize> = (row0..row0 + p)
                    .flat_map(|r| (col0..col0 + p).map(move |c| grid.index(r, c)))
                    .collect();
                let valid = cells.iter().filter(|&&i| cell_ok[i]).count();
                if (valid as f64) < spec.min_valid * (p * p) as f64 {
                    skipped += 1;
                    continue;
                }

                for t in t0..t0 + spec.lookback {
                    for src in &sources {
                        for &i in &cells {
                            set.inputs.push(if cell_ok[i] { src.value(t, i) } else { 0.0 });
                        }
                    }
                }
                for &i in &cells {
                    set.targets.push(if cell_ok[i] { target_frame[i] } else { f32::NAN });
                    set.masks.push(u8::from(cell_ok[i]));
                }

                let target_time = stack.times[tt];
                let split = match spec.train_until {
                    Some(u) if target_time > u => Split::Validation,
                    _ => Split::Train,
                };
                set.samples.push(SampleIndex {
                    input_start: stack.times[t0],
                    target_time,
                    row0,
                    col0,
                    split,
                });
            }
        }
        t0 += spec.stride;
    }

    if skipped > 0 {
        warn!("{skipped} patch(es) below min_valid {:.2} dropped", spec.min_valid);
    }
    info!(
        "{} samples, {} channels, {}x{} patches",
        set.samples.len(),
        set.channels.len(),
        p,
        p
    );
    Ok(set)
}

impl SequenceSet {
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Values per sample in `inputs`.
    pub fn sample_len(&self) -> usize {
        self.spec.lookback * self.channels.len() * self.spec.patch * self.spec.patch
    }

    /// Input value for sample `n`, step `l`, channel `ch`, cell `(pr, pc)` of the patch.
    pub fn input(&self, n: usize, l: usize, ch: usize, pr: usize, pc: usize) -> f32 {
        let p = self.spec.patch;
        let c = self.channels.len();
        self.inputs[(((n * self.spec.lookback + l) * c + ch) * p + pr) * p + pc]
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|e| AquiferError::io(dir, e))?;
        write_f32(&dir.join("inputs.f32"), &self.inputs)?;
        write_f32(&dir.join("targets.f32"), &self.targets)?;
        let masks = dir.join("masks.u8");
        fs::write(&masks, &self.masks).map_err(|e| AquiferError::io(&masks, e))?;

        let index = IndexFile {
            shape: Shape {
                samples: self.n_samples(),
                lookback: self.spec.lookback,
                channels: self.channels.len(),
                patch: self.spec.patch,
            },
            target: &self.target,
            spec: &self.spec,
            channels: &self.channels,
            norm: &self.norm,
            samples: &self.samples,
        };
        let path = dir.join("index.json");
        fs::write(&path, serde_json::to_string_pretty(&index)?)
            .map_err(|e| AquiferError::io(&path, e))?;
        Ok(())
    }
}

fn write_f32(path: &Path, values: &[f32]) -> Result<()> {
    let file = fs::File::create(path).map_err(|e| AquiferError::io(path, e))?;
    let mut w = BufWriter::new(file);
    for v in values {
        w.write_all(&v.to_le_bytes()).map_err(|e| AquiferError::io(path, e))?;
    }
    w.flush().map_err(|e| AquiferError::io(path, e))
}
