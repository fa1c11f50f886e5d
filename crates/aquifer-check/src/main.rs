/// Offline validation harness: scores a prediction cube against the
/// reference storage target (GRACE/GLDAS TWS) over the months they share,
/// overall and month by month.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use serde::Serialize;

use aquifer_core::metrics::Scores;
use aquifer_core::{AlignedStack, PredictionCube, YearMonth};

#[derive(Parser, Debug)]
#[command(name = "aquifer-check", about = "Score predictions against the reference storage target")]
struct Args {
    /// Prediction cube to score
    #[arg(long, default_value = "results/predictions_ssp245.json")]
    predictions: PathBuf,

    /// Aligned stack holding the reference target
    #[arg(long, default_value = "data/processed")]
    reference: PathBuf,

    #[arg(short, long, default_value = "results/validation.json")]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct MonthScore {
    time: YearMonth,
    scores: Scores,
}

#[derive(Debug, Serialize)]
struct Report {
    scenario: String,
    target: String,
    overall: Scores,
    monthly: Vec<MonthScore>,
}

fn score(cube: &PredictionCube, reference: &AlignedStack) -> Result<Report> {
    reference.grid.ensure_same(&cube.grid, "prediction cube")?;
    let target = reference.target_layer()?;
    let (mut all_p, mut all_o) = (Vec::new(), Vec::new());
    let mut monthly = Vec::new();
    for (t, &time) in cube.times.iter().enumerate() {
        let Some(k) = reference.time_index(time) else {
            continue;
        };
        let predicted = cube.frame(t).data;
        let observed = &target.frames[k].data;
        monthly.push(MonthScore { time, scores: Scores::compute_f32(&predicted, observed) });
        all_p.extend(predicted);
        all_o.extend_from_slice(observed);
    }
    if monthly.is_empty() {
        bail!("'{}' shares no months with the reference", cube.scenario);
    }
    Ok(Report {
        scenario: cube.scenario.clone(),
        target: reference.target.clone(),
        overall: Scores::compute_f32(&all_p, &all_o),
        monthly,
    })
}

fn run(args: &Args) -> Result<Report> {
    let cube = PredictionCube::load(&args.predictions)
        .with_context(|| format!("loading {}", args.predictions.display()))?;
    let reference = AlignedStack::load(&args.reference)
        .with_context(|| format!("loading {}", args.reference.display()))?;
    let report = score(&cube, &reference)?;
    write_report(&report, &args.output)?;
    Ok(report)
}

fn write_report(report: &Report, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?).with_context(|| format!("writing {}", path.display()))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let report = run(&args)?;
    let o = &report.overall;
    info!(
        "{} vs {}: {} months, n {}, rmse {:.4}, mae {:.4}, bias {:+.4}, r {:.3}, nse {:.3}",
        report.scenario,
        report.target,
        report.monthly.len(),
        o.n,
        o.rmse,
        o.mae,
        o.bias,
        o.r,
        o.nse
    );
    if o.nse.is_nan() || o.nse < 0.0 {
        warn!("predictions do no better than the reference mean");
    }
    info!("report -> {}", args.output.display());
    Ok(())
}
