/// Hybrid ensemble prediction for one stack (historical or scenario).
///
/// The baseline member is evaluated here; further members (ConvLSTM, tree
/// models) arrive as prediction cubes from their own training pipelines.
/// Members are blended with inverse-error weights scored against the
/// reference target wherever their months overlap it; equal weights
/// otherwise.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use aquifer_core::ensemble::{blend, inverse_error_weights};
use aquifer_core::features::{FeatureBuilder, FeatureTable};
use aquifer_core::metrics::Scores;
use aquifer_core::model::LinearModel;
use aquifer_core::{AlignedStack, PredictionCube};

#[derive(Parser, Debug)]
#[command(name = "predict", about = "Run the hybrid ensemble over an aligned stack")]
struct Args {
    /// Baseline model JSON from train_model
    #[arg(long, default_value = "results/model.json")]
    model: PathBuf,

    /// Aligned stack to predict over
    #[arg(long, default_value = "data/scenarios/ssp245")]
    stack: PathBuf,

    /// Output prediction cube (default: results/predictions_<scenario>.json)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Additional member prediction cube (repeatable)
    #[arg(long)]
    member: Vec<PathBuf>,

    /// Historical stack: feature climatology and member scoring
    #[arg(long, default_value = "data/processed")]
    reference: PathBuf,

    /// Scenario label stored in the cube (default: stack directory name)
    #[arg(long)]
    scenario: Option<String>,
}

impl Args {
    /// `--scenario`, else the stack directory name.
    fn label(&self) -> String {
        self.scenario.clone().unwrap_or_else(|| {
            self.stack
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "scenario".into())
        })
    }

    fn output_path(&self, label: &str) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from("results").join(format!("predictions_{}.json", label.replace('/', "_"))))
    }
}

fn baseline_cube(model: &LinearModel, table: &FeatureTable, stack: &AlignedStack, label: &str) -> PredictionCube {
    let horizon = model.feature_spec.horizon as i64;
    let times = stack.times.iter().map(|t| t.add_months(horizon)).collect();
    let mut cube = PredictionCube::new(format!("{label}/baseline"), stack.grid, times);
    let n = stack.grid.len();
    for row in &table.rows {
        if let Some(t) = stack.time_index(row.time) {
            cube.data[t * n + stack.grid.index(row.row, row.col)] = model.predict(&row.values) as f32;
        }
    }
    cube
}

/// Mean squared error against the reference target over shared months;
/// NaN when nothing overlaps.
fn member_mse(cube: &PredictionCube, reference: &AlignedStack) -> Result<f64> {
    let target = reference.target_layer()?;
    let (mut predicted, mut observed) = (Vec::new(), Vec::new());
    for (t, time) in cube.times.iter().enumerate() {
        if let Some(k) = reference.time_index(*time) {
            predicted.extend(cube.frame(t).data);
            observed.extend_from_slice(&target.frames[k].data);
        }
    }
    let scores = Scores::compute_f32(&predicted, &observed);
    Ok(if scores.n == 0 { f64::NAN } else { scores.mse() })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let model = LinearModel::load(&args.model).with_context(|| format!("loading {}", args.model.display()))?;
    let reference = AlignedStack::load(&args.reference)
        .with_context(|| format!("loading reference stack {}", args.reference.display()))?;
    let builder = FeatureBuilder::fit(&reference, &model.feature_spec).context("rebuilding feature plan")?;
    model.check_columns(builder.columns())?;

    let stack = AlignedStack::load(&args.stack).with_context(|| format!("loading {}", args.stack.display()))?;
    reference.grid.ensure_same(&stack.grid, "prediction stack")?;
    let label = args.label();
    let output = args.output_path(&label);

    let table = builder.build(&stack, false).context("building features")?;
    let mut members = vec![baseline_cube(&model, &table, &stack, &label)];
    for path in &args.member {
        let cube = PredictionCube::load(path).with_context(|| format!("loading member {}", path.display()))?;
        members.push(cube);
    }

    let cube = if members.len() == 1 {
        let mut only = members.remove(0);
        only.scenario = label;
        only
    } else {
        let errors = members
            .iter()
            .map(|m| member_mse(m, &reference))
            .collect::<Result<Vec<f64>>>()?;
        for (m, e) in members.iter().zip(&errors) {
            info!("{}: mse {:.4}", m.scenario, e);
        }
        blend(&members, &inverse_error_weights(&errors), &label)?
    };

    cube.save(&output)
        .with_context(|| format!("writing {}", output.display()))?;
    info!(
        "{}: {} months x {} cells -> {}",
        cube.scenario,
        cube.times.len(),
        cube.grid.len(),
        output.display()
    );
    Ok(())
}
