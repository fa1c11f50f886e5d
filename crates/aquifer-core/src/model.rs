//! Baseline ensemble member: ridge regression on z-scored features with
//! physics sign constraints.
//!
//! Sign constraints encode monotone physical relations (more rainfall
//! cannot lower storage, deeper water tables cannot raise it). Fitting uses
//! an active set: every constrained coefficient that comes out with the
//! wrong sign is pinned to zero and the rest refit, until none violate.
//!
//! Being additive, the member also has exact Shapley attributions
//! (see `attribution::linear_attributions`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::calendar::YearMonth;
use crate::error::{AquiferError, Result};
use crate::features::{FeatureRow, FeatureSpec, FeatureTable};
use crate::metrics::Scores;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sign {
    Positive,
    Negative,
}

impl Sign {
    fn violated_by(self, coef: f64) -> bool {
        match self {
            Sign::Positive => coef < 0.0,
            Sign::Negative => coef > 0.0,
        }
    }
}

impl FromStr for Sign {
    type Err = AquiferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "+" | "pos" | "positive" => Ok(Sign::Positive),
            "-" | "neg" | "negative" => Ok(Sign::Negative),
            other => Err(AquiferError::Model(format!("unknown sign '{other}', use + or -"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Ridge penalty on standardised coefficients.
    pub ridge: f64,
    pub constraints: BTreeMap<String, Sign>,
    /// Rows up to and including this month train; later rows validate.
    pub train_until: Option<YearMonth>,
    /// Random subsample of the training rows.
    pub max_rows: Option<usize>,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            ridge: 1.0,
            constraints: BTreeMap::new(),
            train_until: None,
            max_rows: None,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    pub features: Vec<String>,
    /// How the feature columns were built, so scenario runs can rebuild them.
    pub feature_spec: FeatureSpec,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
    /// Coefficients on z-scored features.
    pub coefficients: Vec<f64>,
    /// Mean training target; the prediction at the feature means.
    pub intercept: f64,
    pub ridge: f64,
    pub constraints: BTreeMap<String, Sign>,
    /// `coefficients / stds`, rebuilt after fit and load.
    #[serde(skip)]
    weights: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainReport {
    pub n_train: usize,
    pub n_validation: usize,
    pub train: Scores,
    pub validation: Option<Scores>,
    /// Constrained features pinned to zero.
    pub pinned: Vec<String>,
    /// Features dropped for having no variance in the training rows.
    pub constant: Vec<String>,
    /// Rows skipped for a missing feature value.
    pub incomplete: usize,
}

const CONSTANT_STD: f64 = 1e-12;

impl LinearModel {
    /// Fit on `table` and score on the held-out rows.
    pub fn fit(
        table: &FeatureTable,
        feature_spec: &FeatureSpec,
        config: &TrainConfig,
    ) -> Result<(Self, TrainReport)> {
        for name in config.constraints.keys() {
            table.column_index(name)?;
        }

        let (mut train, validation, incomplete) = split_rows(table, feature_spec.horizon, config.train_until);
        if incomplete > 0 {
            warn!("skipping {incomplete} rows with missing feature values");
        }

        if let Some(max) = config.max_rows {
            if train.len() > max {
                let mut rng = StdRng::seed_from_u64(config.seed);
                let mut picked = rand::seq::index::sample(&mut rng, train.len(), max).into_vec();
                picked.sort_unstable();
                train = picked.into_iter().map(|i| train[i]).collect();
                info!("subsampled {max} training rows");
            }
        }
        if train.is_empty() {
            return Err(AquiferError::Model("no training rows with a valid target".into()));
        }

        let p = table.columns.len();
        let n = train.len() as f64;

        // ── Standardisation ──────────────────────────────────────────────
        let mut means = vec![0.0f64; p];
        for row in &train {
            for (m, &v) in means.iter_mut().zip(&row.values) {
                *m += v as f64;
            }
        }
        means.iter_mut().for_each(|m| *m /= n);
        let mut stds = vec![0.0f64; p];
        for row in &train {
            for j in 0..p {
                stds[j] += (row.values[j] as f64 - means[j]).powi(2);
            }
        }
        stds.iter_mut().for_each(|s| *s = (*s / n).sqrt());

        let y_mean = train.iter().map(|r| r.target as f64).sum::<f64>() / n;
        let z = DMatrix::from_fn(train.len(), p, |i, j| {
            if stds[j] < CONSTANT_STD {
                0.0
            } else {
                (train[i].values[j] as f64 - means[j]) / stds[j]
            }
        });
        let y = DVector::from_fn(train.len(), |i, _| train[i].target as f64 - y_mean);
        let gram = z.transpose() * &z / n;
        let zty = z.transpose() * &y / n;

        // ── Active-set ridge fit ─────────────────────────────────────────
        let constant: Vec<String> = (0..p)
            .filter(|&j| stds[j] < CONSTANT_STD)
            .map(|j| table.columns[j].clone())
            .collect();
        let mut active: Vec<usize> = (0..p).filter(|&j| stds[j] >= CONSTANT_STD).collect();
        let mut pinned = Vec::new();
        let mut coefficients = vec![0.0f64; p];

        loop {
            coefficients.iter_mut().for_each(|c| *c = 0.0);
            if !active.is_empty() {
                let beta = solve_ridge(&gram, &zty, &active, config.ridge)?;
                for (&j, &b) in active.iter().zip(beta.iter()) {
                    coefficients[j] = b;
                }
            }
            let violators: Vec<usize> = active
                .iter()
                .copied()
                .filter(|&j| {
                    config
                        .constraints
                        .get(&table.columns[j])
                        .is_some_and(|s| s.violated_by(coefficients[j]))
                })
                .collect();
            if violators.is_empty() {
                break;
            }
            for &j in &violators {
                warn!("pinning {} to zero (sign constraint)", table.columns[j]);
                pinned.push(table.columns[j].clone());
            }
            active.retain(|j| !violators.contains(j));
        }

        let model = LinearModel {
            features: table.columns.clone(),
            feature_spec: feature_spec.clone(),
            means,
            stds,
            coefficients,
            intercept: y_mean,
            ridge: config.ridge,
            constraints: config.constraints.clone(),
            weights: Vec::new(),
        }
        .with_weights();

        let score = |rows: &[&FeatureRow]| {
            let p: Vec<f64> = rows.iter().map(|r| model.predict(&r.values)).collect();
            let o: Vec<f64> = rows.iter().map(|r| r.target as f64).collect();
            Scores::compute(&p, &o)
        };
        let report = TrainReport {
            n_train: train.len(),
            n_validation: validation.len(),
            train: score(&train),
            validation: (!validation.is_empty()).then(|| score(&validation)),
            pinned,
            constant,
            incomplete,
        };
        info!(
            "trained on {} rows: rmse {:.4}, r {:.3}",
            report.n_train, report.train.rmse, report.train.r
        );
        Ok((model, report))
    }

    fn with_weights(mut self) -> Self {
        self.weights = self
            .coefficients
            .iter()
            .zip(&self.stds)
            .map(|(&b, &s)| if s < CONSTANT_STD { 0.0 } else { b / s })
            .collect();
        self
    }

    /// Weight per raw feature unit.
    pub fn raw_weights(&self) -> &[f64] {
        &self.weights
    }

    /// Prediction at the training feature means.
    pub fn expected_value(&self) -> f64 {
        self.intercept
    }

    pub fn predict(&self, values: &[f32]) -> f64 {
        debug_assert_eq!(values.len(), self.weights.len(), "feature vector length");
        self.weights
            .iter()
            .zip(values.iter().zip(&self.means))
            .fold(self.intercept, |acc, (w, (&x, m))| acc + w * (x as f64 - m))
    }

    /// Error unless `columns` are exactly the model's features, in order.
    pub fn check_columns(&self, columns: &[String]) -> Result<()> {
        if columns != self.features.as_slice() {
            return Err(AquiferError::Model(format!(
                "feature columns {:?} do not match model features {:?}",
                columns, self.features
            )));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AquiferError::io(parent, e))?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?).map_err(|e| AquiferError::io(path, e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| AquiferError::io(path, e))?;
        let model: LinearModel = serde_json::from_str(&text)?;
        if model.coefficients.len() != model.features.len() || model.stds.len() != model.features.len() {
            return Err(AquiferError::Model(format!("{}: coefficient count does not match features", path.display())));
        }
        Ok(model.with_weights())
    }
}

/// Rows with a target split into (train, validation) by target month
/// `time + horizon` against `train_until`. Rows with a NaN feature are
/// dropped and counted.
fn split_rows(
    table: &FeatureTable,
    horizon: usize,
    train_until: Option<YearMonth>,
) -> (Vec<&FeatureRow>, Vec<&FeatureRow>, usize) {
    let (mut train, mut validation, mut incomplete) = (Vec::new(), Vec::new(), 0);
    for row in table.rows.iter().filter(|r| !r.target.is_nan()) {
        if row.values.iter().any(|v| v.is_nan()) {
            incomplete += 1;
        } else if train_until.map_or(true, |u| row.time.add_months(horizon as i64) <= u) {
            train.push(row);
        } else {
            validation.push(row);
        }
    }
    (train, validation, incomplete)
}

/// Solve `(G_AA + λI) β = b_A` by Cholesky decomposition.
fn solve_ridge(
    gram: &DMatrix<f64>,
    rhs: &DVector<f64>,
    active: &[usize],
    ridge: f64,
) -> Result<DVector<f64>> {
    let k = active.len();
    let g = DMatrix::from_fn(k, k, |a, b| {
        gram[(active[a], active[b])] + if a == b { ridge } else { 0.0 }
    });
    let b = DVector::from_fn(k, |a, _| rhs[active[a]]);
    let chol = g.cholesky().ok_or_else(|| {
        AquiferError::Model("normal equations are singular; increase the ridge penalty".into())
    })?;
    Ok(chol.solve(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// y = 2·a − 3·b + 5 on a small grid of (a, b) values across two years.
    fn table() -> FeatureTable {
        let mut rows = Vec::new();
        let start: YearMonth = "2019-01".parse().unwrap();
        for t in 0..24 {
            for k in 0..5 {
                let a = (t % 7) as f32 + k as f32 * 0.5;
                let b = ((t * 3 + k) % 5) as f32;
                rows.push(FeatureRow {
                    row: k,
                    col: 0,
                    time: start.add_months(t as i64),
                    target: 2.0 * a - 3.0 * b + 5.0,
                    values: vec![a, b, 1.0],
                });
            }
        }
        FeatureTable { columns: vec!["a".into(), "b".into(), "const".into()], rows }
    }

    fn config(ridge: f64) -> TrainConfig {
        TrainConfig { ridge, ..TrainConfig::default() }
    }

    #[test]
    fn recovers_linear_relation_with_tiny_ridge() {
        let (m, report) = LinearModel::fit(&table(), &FeatureSpec::default(), &config(1e-9)).unwrap();
        let w = m.raw_weights();
        assert_abs_diff_eq!(w[0], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(w[1], -3.0, epsilon = 1e-4);
        assert_eq!(w[2], 0.0);
        assert_eq!(report.constant, vec!["const".to_string()]);
        assert!(report.train.rmse < 1e-3);
        assert_abs_diff_eq!(m.predict(&[1.0, 1.0, 1.0]), 4.0, epsilon = 1e-3);
    }

    #[test]
    fn sign_constraint_pins_violating_feature() {
        let mut cfg = config(1e-6);
        cfg.constraints.insert("b".into(), Sign::Positive);
        let (m, report) = LinearModel::fit(&table(), &FeatureSpec::default(), &cfg).unwrap();
        assert_eq!(report.pinned, vec!["b".to_string()]);
        assert_eq!(m.coefficients[1], 0.0);
        assert!(m.coefficients[0] > 0.0);
    }

    #[test]
    fn validation_rows_follow_train_until() {
        let mut cfg = config(1e-6);
        cfg.train_until = Some("2019-12".parse().unwrap());
        let (_, report) = LinearModel::fit(&table(), &FeatureSpec::default(), &cfg).unwrap();
        assert_eq!(report.n_train, 60);
        assert_eq!(report.n_validation, 60);
        assert!(report.validation.unwrap().rmse < 1e-2);
    }

    #[test]
    fn train_rows_never_see_targets_after_cutoff() {
        let table = table();
        let cutoff: YearMonth = "2019-12".parse().unwrap();
        let (train, validation, _) = split_rows(&table, 1, Some(cutoff));
        assert!(train.iter().all(|r| r.time.add_months(1) <= cutoff));
        assert!(validation.iter().all(|r| r.time.add_months(1) > cutoff));
        assert_eq!(train.len(), 55);

        let mut cfg = config(1e-6);
        cfg.train_until = Some(cutoff);
        let spec = FeatureSpec { horizon: 1, ..FeatureSpec::default() };
        let (_, report) = LinearModel::fit(&table, &spec, &cfg).unwrap();
        assert_eq!(report.n_train, 55);
        assert_eq!(report.n_validation, 65);
    }

    #[test]
    fn rows_with_missing_features_are_skipped() {
        let mut table = table();
        table.rows[0].values[0] = f32::NAN;
        table.rows[7].values[1] = f32::NAN;
        let (m, report) = LinearModel::fit(&table, &FeatureSpec::default(), &config(1e-9)).unwrap();
        assert_eq!(report.incomplete, 2);
        assert_eq!(report.n_train, 118);
        assert!(m.coefficients.iter().all(|c| c.is_finite()));
        assert_abs_diff_eq!(m.raw_weights()[0], 2.0, epsilon = 1e-4);
    }

    #[test]
    fn subsampling_is_seeded() {
        let mut cfg = config(1.0);
        cfg.max_rows = Some(30);
        let (a, ra) = LinearModel::fit(&table(), &FeatureSpec::default(), &cfg).unwrap();
        let (b, _) = LinearModel::fit(&table(), &FeatureSpec::default(), &cfg).unwrap();
        assert_eq!(ra.n_train, 30);
        assert_eq!(a.coefficients, b.coefficients);
    }

    #[test]
    fn ridge_shrinks_coefficients() {
        let (small, _) = LinearModel::fit(&table(), &FeatureSpec::default(), &config(1e-6)).unwrap();
        let (big, _) = LinearModel::fit(&table(), &FeatureSpec::default(), &config(10.0)).unwrap();
        assert!(big.coefficients[0].abs() < small.coefficients[0].abs());
    }

    #[test]
    fn unknown_constraint_feature_is_an_error() {
        let mut cfg = config(1.0);
        cfg.constraints.insert("nope".into(), Sign::Negative);
        assert!(LinearModel::fit(&table(), &FeatureSpec::default(), &cfg).is_err());
    }

    #[test]
    fn sign_parses_short_forms() {
        assert_eq!("+".parse::<Sign>().unwrap(), Sign::Positive);
        assert_eq!("Negative".parse::<Sign>().unwrap(), Sign::Negative);
        assert!("up".parse::<Sign>().is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let (m, _) = LinearModel::fit(&table(), &FeatureSpec::default(), &config(1.0)).unwrap();
        m.save(&path).unwrap();
        let back = LinearModel::load(&path).unwrap();
        assert_eq!(back.coefficients, m.coefficients);
        assert_eq!(back.raw_weights(), m.raw_weights());
        assert_eq!(back.predict(&[1.0, 2.0, 1.0]), m.predict(&[1.0, 2.0, 1.0]));
        back.check_columns(&m.features).unwrap();
    }
}
