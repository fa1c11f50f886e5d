/// Preprocessing stage: aligns every catalogued source onto the common grid
/// and time axis, then writes
///   - the aligned stack (GeoTIFF per layer + manifest.json),
///   - ConvLSTM sequence tensors (inputs.f32, targets.f32, masks.u8, index.json),
///   - the tabular feature set for the tree/linear members (features.csv).
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use aquifer_core::features::{FeatureBuilder, FeatureSpec};
use aquifer_core::sequence::{build_sequences, SequenceSpec};
use aquifer_core::{AlignedStack, Catalog, YearMonth};

#[derive(Parser, Debug)]
#[command(
    name = "sequence_builder",
    about = "Align raw sources and build ConvLSTM sequences plus the tabular feature set"
)]
struct Args {
    /// Data catalogue describing every source layer
    #[arg(long, default_value = "data/catalog.json")]
    catalog: PathBuf,

    /// Output directory for the aligned stack
    #[arg(long, default_value = "data/processed")]
    processed: PathBuf,

    /// Output directory for the sequence tensors
    #[arg(long, default_value = "data/processed/sequences")]
    sequences: PathBuf,

    /// Output path for the feature table
    #[arg(long, default_value = "data/processed/features.csv")]
    features: PathBuf,

    /// Input months per sample
    #[arg(long, default_value = "6")]
    lookback: usize,

    /// Months between the last input and the target
    #[arg(long, default_value = "1")]
    horizon: usize,

    /// Months between consecutive sample start times
    #[arg(long, default_value = "1")]
    stride: usize,

    /// Patch edge length in cells
    #[arg(long, default_value = "32")]
    patch: usize,

    /// Offset between patch origins in cells
    #[arg(long, default_value = "32")]
    patch_stride: usize,

    /// Minimum fraction of valid cells to keep a patch
    #[arg(long, default_value = "0.8")]
    min_valid: f64,

    /// Last month of the training period (YYYY-MM); later targets are validation
    #[arg(long)]
    train_until: Option<YearMonth>,

    /// Trailing-mean feature, VAR:MONTHS (repeatable)
    #[arg(long, value_parser = parse_rolling)]
    rolling: Vec<(String, usize)>,

    /// Climatology-anomaly feature for VAR (repeatable)
    #[arg(long)]
    anomaly: Vec<String>,

    /// Skip the terrain slope feature
    #[arg(long)]
    no_slope: bool,
}

fn parse_rolling(s: &str) -> Result<(String, usize)> {
    let Some((name, months)) = s.split_once(':') else {
        bail!("expected VAR:MONTHS, got '{s}'");
    };
    let months: usize = months.trim().parse().with_context(|| format!("bad month count in '{s}'"))?;
    if name.trim().is_empty() || months == 0 {
        bail!("expected VAR:MONTHS with MONTHS >= 1, got '{s}'");
    }
    Ok((name.trim().to_string(), months))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let catalog = Catalog::load(&args.catalog)
        .with_context(|| format!("loading catalogue {}", args.catalog.display()))?;
    info!(
        "catalogue: {} variables, {} to {}, grid {}x{}",
        catalog.variables.len(),
        catalog.start,
        catalog.end,
        catalog.grid.width,
        catalog.grid.height
    );

    let stack = AlignedStack::build(&catalog).context("aligning sources")?;
    stack
        .save(&args.processed)
        .with_context(|| format!("writing aligned stack to {}", args.processed.display()))?;

    let seq_spec = SequenceSpec {
        lookback: args.lookback,
        horizon: args.horizon,
        stride: args.stride,
        patch: args.patch,
        patch_stride: args.patch_stride,
        min_valid: args.min_valid,
        train_until: args.train_until,
    };
    let sequences = build_sequences(&stack, &seq_spec).context("building sequences")?;
    sequences
        .write(&args.sequences)
        .with_context(|| format!("writing sequences to {}", args.sequences.display()))?;
    info!(
        "{} sequence samples x {} channels -> {}",
        sequences.n_samples(),
        sequences.channels.len(),
        args.sequences.display()
    );

    let feature_spec = FeatureSpec {
        rolling: args.rolling,
        anomalies: args.anomaly,
        horizon: args.horizon,
        include_slope: !args.no_slope,
    };
    let builder = FeatureBuilder::fit(&stack, &feature_spec).context("planning feature columns")?;
    let table = builder.build(&stack, true).context("building feature table")?;
    table
        .write_csv(&args.features)
        .with_context(|| format!("writing {}", args.features.display()))?;
    let sidecar = FeatureSpec::sidecar_path(&args.features);
    feature_spec
        .save(&sidecar)
        .with_context(|| format!("writing {}", sidecar.display()))?;
    info!("{} feature rows -> {}", table.rows.len(), args.features.display());

    Ok(())
}
