/// Trains the baseline ensemble member: a ridge regression on the feature
/// table with physics sign constraints. Writes the model JSON and a training
/// report (train / validation scores, pinned features).
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, warn};

use aquifer_core::features::{FeatureSpec, FeatureTable};
use aquifer_core::model::{LinearModel, Sign, TrainConfig};
use aquifer_core::YearMonth;

#[derive(Parser, Debug)]
#[command(name = "train_model", about = "Fit the physics-constrained baseline member")]
struct Args {
    /// Feature table written by sequence_builder
    #[arg(long, default_value = "data/processed/features.csv")]
    features: PathBuf,

    /// Output model JSON
    #[arg(short, long, default_value = "results/model.json")]
    output: PathBuf,

    /// Last training month (YYYY-MM); later rows are held out for validation
    #[arg(long)]
    train_until: Option<YearMonth>,

    /// Ridge penalty on standardised coefficients
    #[arg(long, default_value = "1.0")]
    ridge: f64,

    /// Sign constraint, FEATURE:+ or FEATURE:- (repeatable)
    #[arg(long, value_parser = parse_constraint)]
    constraint: Vec<(String, Sign)>,

    /// Random subsample of training rows
    #[arg(long)]
    max_rows: Option<usize>,

    /// Seed for the subsample
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn parse_constraint(s: &str) -> Result<(String, Sign)> {
    let Some((name, sign)) = s.rsplit_once(':') else {
        bail!("expected FEATURE:+ or FEATURE:-, got '{s}'");
    };
    if name.trim().is_empty() {
        bail!("missing feature name in '{s}'");
    }
    let sign: Sign = sign.parse()?;
    Ok((name.trim().to_string(), sign))
}

fn report_path(model: &Path) -> PathBuf {
    model.with_file_name("train_report.json")
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let table = FeatureTable::read_csv(&args.features)
        .with_context(|| format!("reading {}", args.features.display()))?;
    let sidecar = FeatureSpec::sidecar_path(&args.features);
    let feature_spec = if sidecar.exists() {
        FeatureSpec::load(&sidecar).with_context(|| format!("reading {}", sidecar.display()))?
    } else {
        warn!("{} not found; assuming default feature settings", sidecar.display());
        FeatureSpec::default()
    };
    info!("{} rows x {} features", table.rows.len(), table.columns.len());

    let mut constraints = BTreeMap::new();
    for (name, sign) in args.constraint {
        if constraints.insert(name.clone(), sign).is_some() {
            bail!("feature '{name}' constrained twice");
        }
    }
    let config = TrainConfig {
        ridge: args.ridge,
        constraints,
        train_until: args.train_until,
        max_rows: args.max_rows,
        seed: args.seed,
    };

    let (model, report) = LinearModel::fit(&table, &feature_spec, &config).context("fitting model")?;
    model
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    let report_file = report_path(&args.output);
    fs::write(&report_file, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("writing {}", report_file.display()))?;

    if let Some(v) = &report.validation {
        info!("validation: n {}, rmse {:.4}, r {:.3}, nse {:.3}", v.n, v.rmse, v.r, v.nse);
    }
    for name in &report.pinned {
        info!("constraint held {name} at zero");
    }
    info!("model -> {}", args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_parses() {
        let (name, sign) = parse_constraint("precip_3m:+").unwrap();
        assert_eq!(name, "precip_3m");
        assert_eq!(sign, Sign::Positive);
        // One-hot names contain '=', and the sign follows the last colon.
        assert_eq!(parse_constraint("lulc=10:-").unwrap().1, Sign::Negative);
    }

    #[test]
    fn constraint_rejects_bad_input() {
        assert!(parse_constraint("precip_3m").is_err());
        assert!(parse_constraint(":+").is_err());
        assert!(parse_constraint("precip_3m:up").is_err());
    }

    #[test]
    fn report_sits_beside_model() {
        assert_eq!(report_path(Path::new("results/model.json")), PathBuf::from("results/train_report.json"));
    }
}
