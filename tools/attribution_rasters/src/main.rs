/// Maps attribution tables back onto the grid: per-feature mean |SHAP| and
/// signed mean GeoTIFFs, plus a dominant-driver map with its legend.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use aquifer_core::attribution::AttributionTable;
use aquifer_core::geotiff::write_geotiff;
use aquifer_core::rasterize::AttributionRasters;
use aquifer_core::render::{categorical_palette, render_categorical, save_png, Legend};
use aquifer_core::{AlignedStack, YearMonth};

#[derive(Parser, Debug)]
#[command(name = "attribution_rasters", about = "Rasterise SHAP values onto the model grid")]
struct Args {
    /// Attribution table (shap_values.csv layout)
    #[arg(long, default_value = "results/shap_values.csv")]
    attributions: PathBuf,

    /// Aligned stack providing the grid
    #[arg(long, default_value = "data/processed")]
    processed: PathBuf,

    #[arg(short, long, default_value = "results/shap_rasters")]
    output: PathBuf,

    /// Restrict to one month (YYYY-MM); all months when omitted
    #[arg(long)]
    time: Option<YearMonth>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let table = AttributionTable::read_csv(&args.attributions)
        .with_context(|| format!("reading {}", args.attributions.display()))?;
    let grid = AlignedStack::load_grid(&args.processed)
        .with_context(|| format!("reading grid from {}", args.processed.display()))?;

    let rasters = AttributionRasters::from_table(&table, &grid, args.time).context("rasterising attributions")?;
    rasters
        .write(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;

    if let Some(dominant) = rasters.dominant_driver() {
        let codes: Vec<i64> = (0..rasters.features.len() as i64).collect();
        let palette = categorical_palette(&codes);
        write_geotiff(&args.output.join("dominant_driver.tif"), &dominant)?;
        save_png(&render_categorical(&dominant, &palette), &args.output.join("dominant_driver.png"))?;
        let mut legend = Legend::categorical("dominant driver (largest mean |SHAP|)", &palette, &rasters.features);
        if let Some(t) = args.time {
            legend.notes.insert("time".into(), t.to_string().into());
        }
        legend.write(&args.output.join("dominant_driver_legend.json"))?;
    }
    info!("{} features -> {}", rasters.features.len(), args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_flag_parses_month() {
        let args = Args::parse_from(["attribution_rasters", "--time", "2021-07"]);
        assert_eq!(args.time.map(|t| t.to_string()), Some("2021-07".to_string()));
        assert!(Args::try_parse_from(["attribution_rasters", "--time", "2021-13"]).is_err());
    }
}
