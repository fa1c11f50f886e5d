/// Vulnerability maps for one projection year: annual mean of the
/// prediction cube, classified into traffic-light risk classes.
///
/// Outputs in --output:
///   risk_map_<scenario>_<year>.tif   class codes 1..=3
///   traffic_light_map.png            north-up rendering
///   risk_legend.json                 classes, colours, cut-offs, counts
///   storage_<scenario>_<year>.png    the indicator itself
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use aquifer_core::geotiff::write_geotiff;
use aquifer_core::render::{
    render_classes, render_continuous, risk_map_name, save_png, Legend, Ramp, TRAFFIC_LIGHT_PNG,
};
use aquifer_core::risk::{classify, RiskClass, Thresholds};
use aquifer_core::PredictionCube;

#[derive(Parser, Debug)]
#[command(name = "generate_maps", about = "Classify a projection year into traffic-light risk maps")]
struct Args {
    /// Prediction cube from predict
    #[arg(long, default_value = "results/predictions_ssp245.json")]
    predictions: PathBuf,

    #[arg(long, default_value = "2050")]
    year: i32,

    #[arg(short, long, default_value = "results")]
    output: PathBuf,

    /// Moderate cut-off (quantile, or value with --fixed)
    #[arg(long, default_value = "0.5", allow_negative_numbers = true)]
    moderate: f64,

    /// High cut-off (quantile, or value with --fixed)
    #[arg(long, default_value = "0.8", allow_negative_numbers = true)]
    high: f64,

    /// Treat --moderate/--high as indicator values instead of quantiles
    #[arg(long)]
    fixed: bool,

    /// Low indicator values are the vulnerable end (e.g. storage anomalies)
    #[arg(long)]
    lower_is_worse: bool,
}

impl Args {
    fn thresholds(&self) -> Thresholds {
        if self.fixed {
            Thresholds::Fixed { moderate: self.moderate as f32, high: self.high as f32 }
        } else {
            Thresholds::Quantile { moderate: self.moderate, high: self.high }
        }
    }
}

/// File-safe scenario tag: the part before any `/member` suffix.
fn scenario_tag(scenario: &str) -> &str {
    scenario.split('/').next().unwrap_or(scenario)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cube = PredictionCube::load(&args.predictions)
        .with_context(|| format!("loading {}", args.predictions.display()))?;
    let indicator = cube.annual_mean(args.year)?;
    let thresholds = args.thresholds();
    let risk = classify(&indicator, thresholds, !args.lower_is_worse)?;
    let tag = scenario_tag(&cube.scenario);

    let tif = args.output.join(risk_map_name(tag, args.year));
    write_geotiff(&tif, &risk.classes).with_context(|| format!("writing {}", tif.display()))?;
    save_png(&render_classes(&risk.classes), &args.output.join(TRAFFIC_LIGHT_PNG))?;
    save_png(
        &render_continuous(&indicator, Ramp::Diverging, None),
        &args.output.join(format!("storage_{tag}_{}.png", args.year)),
    )?;

    let mut legend = Legend::risk(format!("groundwater vulnerability {tag} {}", args.year));
    legend.notes.insert("thresholds".into(), serde_json::to_value(thresholds)?);
    legend.notes.insert("cutoffs".into(), serde_json::to_value(risk.cutoffs)?);
    legend.notes.insert("higher_is_worse".into(), risk.higher_is_worse.into());
    legend.notes.insert("counts".into(), serde_json::to_value(risk.counts)?);
    legend.write(&args.output.join("risk_legend.json"))?;

    for (class, count) in RiskClass::ALL.iter().zip(risk.counts) {
        info!("{:<9} {count} cells", class.label());
    }
    info!(
        "cut-offs moderate {:.4}, high {:.4} -> {}",
        risk.cutoffs.moderate,
        risk.cutoffs.high,
        tif.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantiles_by_default() {
        let args = Args::parse_from(["generate_maps"]);
        assert_eq!(args.thresholds(), Thresholds::Quantile { moderate: 0.5, high: 0.8 });
        assert!(!args.lower_is_worse);
    }

    #[test]
    fn fixed_flag_switches_to_values() {
        let args = Args::parse_from(["generate_maps", "--fixed", "--moderate", "-20", "--high", "-50", "--lower-is-worse"]);
        assert_eq!(args.thresholds(), Thresholds::Fixed { moderate: -20.0, high: -50.0 });
        assert!(args.lower_is_worse);
    }

    #[test]
    fn scenario_tag_drops_member_suffix() {
        assert_eq!(scenario_tag("ssp245/baseline"), "ssp245");
        assert_eq!(scenario_tag("ssp585"), "ssp585");
    }
}
