/// Exact SHAP values for the baseline member over a feature table, written
/// as shap_values.csv plus a global importance ranking.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use serde::Serialize;

use aquifer_core::attribution::linear_attributions;
use aquifer_core::features::FeatureTable;
use aquifer_core::model::LinearModel;

#[derive(Parser, Debug)]
#[command(name = "compute_attributions", about = "Per-prediction feature attributions for the baseline member")]
struct Args {
    #[arg(long, default_value = "results/model.json")]
    model: PathBuf,

    #[arg(long, default_value = "data/processed/features.csv")]
    features: PathBuf,

    /// Output attribution table
    #[arg(short, long, default_value = "results/shap_values.csv")]
    output: PathBuf,
}

#[derive(Serialize)]
struct Importance<'a> {
    feature: &'a str,
    mean_abs_shap: f64,
}

fn importance_path(table: &Path) -> PathBuf {
    table.with_file_name("shap_importance.json")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let model = LinearModel::load(&args.model).with_context(|| format!("loading {}", args.model.display()))?;
    let table = FeatureTable::read_csv(&args.features)
        .with_context(|| format!("reading {}", args.features.display()))?;

    let attributions = linear_attributions(&model, &table).context("attributing predictions")?;
    let bad = attributions.check_additivity(1e-6);
    if !bad.is_empty() {
        warn!("first non-additive row: {}", bad[0]);
    }
    attributions
        .write_csv(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    let ranking = attributions.global_importance();
    let out: Vec<Importance> = ranking
        .iter()
        .map(|(f, v)| Importance { feature: f, mean_abs_shap: *v })
        .collect();
    let path = importance_path(&args.output);
    fs::write(&path, serde_json::to_string_pretty(&out)?).with_context(|| format!("writing {}", path.display()))?;

    for (f, v) in ranking.iter().take(5) {
        info!("{f:<24} {v:.4}");
    }
    info!("{} rows -> {}", attributions.rows.len(), args.output.display());
    Ok(())
}
