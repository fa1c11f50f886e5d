/// Builds a future scenario stack by delta change: the observed baseline
/// stack is perturbed with GCM monthly change signals (SSP minus historical)
/// and moved onto a future time axis.
///
/// GCM climatologies are expected as
///   <gcm-dir>/historical/<var>_<MM>.tif
///   <gcm-dir>/<scenario>/<var>_<MM>.tif
/// Variables without files are carried unchanged.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use aquifer_core::scenario::{project, ClimateDelta, Scenario};
use aquifer_core::{AlignedStack, YearMonth};

#[derive(Parser, Debug)]
#[command(name = "project_scenario", about = "Project the baseline stack under a CMIP6 SSP scenario")]
struct Args {
    /// Aligned baseline stack
    #[arg(long, default_value = "data/processed")]
    processed: PathBuf,

    /// Scenario label (ssp126, ssp245, SSP3-7.0, ...)
    #[arg(long, default_value = "ssp245")]
    scenario: Scenario,

    /// Root of the GCM monthly climatologies
    #[arg(long, default_value = "data/raw/cmip6")]
    gcm_dir: PathBuf,

    /// First month of the projected period
    #[arg(long, default_value = "2050-01")]
    start: YearMonth,

    /// Output directory for the projected stack
    #[arg(short, long, default_value = "data/scenarios/ssp245")]
    output: PathBuf,
}

fn has_climatology(dir: &Path, variable: &str) -> bool {
    (1..=12).all(|m| dir.join(format!("{variable}_{m:02}.tif")).exists())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stack = AlignedStack::load(&args.processed)
        .with_context(|| format!("loading baseline stack {}", args.processed.display()))?;
    let hist_dir = args.gcm_dir.join(Scenario::Historical.tag());
    let future_dir = args.gcm_dir.join(args.scenario.tag());

    let mut deltas = Vec::new();
    for layer in stack.dynamic.iter().filter(|l| l.name != stack.target) {
        if !has_climatology(&hist_dir, &layer.name) || !has_climatology(&future_dir, &layer.name) {
            info!("{}: no GCM climatology, carried unchanged", layer.name);
            continue;
        }
        let delta = ClimateDelta::load(&hist_dir, &future_dir, &layer.name, layer.change, &stack.grid)
            .with_context(|| format!("loading GCM climatology for {}", layer.name))?;
        deltas.push(delta);
    }

    let projected = project(stack, &deltas, args.start).context("projecting stack")?;
    projected
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!(
        "{}: {} months from {} with {} changed variables -> {}",
        args.scenario,
        projected.times.len(),
        args.start,
        deltas.len(),
        args.output.display()
    );
    Ok(())
}
