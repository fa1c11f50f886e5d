//! Per-prediction feature attributions (SHAP values).
//!
//! For the additive baseline member Shapley values are exact:
//! `phi_j = w_j (x_j − mean_j)` against the training-mean background.
//! Members explained by external SHAP tooling hand over the same CSV layout.

use std::path::Path;

use log::{info, warn};

use crate::calendar::YearMonth;
use crate::error::{AquiferError, Result};
use crate::features::FeatureTable;
use crate::model::LinearModel;

#[derive(Debug, Clone, PartialEq)]
pub struct AttributionRow {
    pub row: usize,
    pub col: usize,
    pub time: YearMonth,
    pub base_value: f64,
    pub prediction: f64,
    /// One value per feature, in table column order.
    pub values: Vec<f64>,
}

impl AttributionRow {
    pub fn residual(&self) -> f64 {
        self.prediction - self.base_value - self.values.iter().sum::<f64>()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AttributionTable {
    pub features: Vec<String>,
    pub rows: Vec<AttributionRow>,
}

pub fn linear_attributions(model: &LinearModel, table: &FeatureTable) -> Result<AttributionTable> {
    model.check_columns(&table.columns)?;
    let weights = model.raw_weights();
    let base = model.expected_value();
    let rows = table
        .rows
        .iter()
        .map(|r| {
            let values: Vec<f64> = r
                .values
                .iter()
                .zip(weights.iter().zip(&model.means))
                .map(|(&x, (w, m))| w * (x as f64 - m))
                .collect();
            AttributionRow {
                row: r.row,
                col: r.col,
                time: r.time,
                base_value: base,
                prediction: base + values.iter().sum::<f64>(),
                values,
            }
        })
        .collect::<Vec<_>>();
    info!("attributed {} predictions over {} features", rows.len(), weights.len());
    Ok(AttributionTable { features: table.columns.clone(), rows })
}

const FIXED: [&str; 5] = ["row", "col", "time", "base_value", "prediction"];

impl AttributionTable {
    /// Indices of rows whose attributions do not sum to the prediction.
    pub fn check_additivity(&self, tol: f64) -> Vec<usize> {
        let bad: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| !(r.residual().abs() <= tol))
            .map(|(i, _)| i)
            .collect();
        if !bad.is_empty() {
            warn!("{} of {} rows break additivity beyond {tol}", bad.len(), self.rows.len());
        }
        bad
    }

    /// Mean |phi| per feature, largest first.
    pub fn global_importance(&self) -> Vec<(String, f64)> {
        let n = self.rows.len().max(1) as f64;
        let mut sums = vec![0.0f64; self.features.len()];
        for r in &self.rows {
            for (s, v) in sums.iter_mut().zip(&r.values) {
                *s += v.abs();
            }
        }
        let mut out: Vec<(String, f64)> =
            self.features.iter().cloned().zip(sums.into_iter().map(|s| s / n)).collect();
        out.sort_by(|a, b| b.1.total_cmp(&a.1));
        out
    }

    /// `row,col,time,base_value,prediction,<features…>`
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AquiferError::io(parent, e))?;
        }
        let mut w = csv::Writer::from_path(path)?;
        let header: Vec<&str> = FIXED.iter().copied().chain(self.features.iter().map(String::as_str)).collect();
        w.write_record(&header)?;
        for r in &self.rows {
            let mut rec = vec![
                r.row.to_string(),
                r.col.to_string(),
                r.time.to_string(),
                r.base_value.to_string(),
                r.prediction.to_string(),
            ];
            rec.extend(r.values.iter().map(f64::to_string));
            w.write_record(&rec)?;
        }
        w.flush().map_err(|e| AquiferError::io(path, e))?;
        Ok(())
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        if headers.len() < FIXED.len() || headers[..FIXED.len()] != FIXED {
            return Err(AquiferError::InvalidFeature(format!(
                "{} must start with columns {}",
                path.display(),
                FIXED.join(",")
            )));
        }
        let features = headers[FIXED.len()..].to_vec();

        let mut rows = Vec::new();
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let field = |k: usize| record.get(k).unwrap_or("").trim();
            let bad = |what: &str| {
                AquiferError::InvalidFeature(format!("{} row {line}: bad {what}", path.display()))
            };
            let number = |k: usize| field(k).parse::<f64>().map_err(|_| bad(&headers[k]));
            rows.push(AttributionRow {
                row: field(0).parse().map_err(|_| bad("row"))?,
                col: field(1).parse().map_err(|_| bad("col"))?,
                time: field(2).parse()?,
                base_value: number(3)?,
                prediction: number(4)?,
                values: (FIXED.len()..headers.len()).map(number).collect::<Result<_>>()?,
            });
        }
        Ok(Self { features, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureRow, FeatureSpec};
    use crate::model::TrainConfig;
    use approx::assert_abs_diff_eq;

    fn fitted() -> (LinearModel, FeatureTable) {
        let start: YearMonth = "2020-01".parse().unwrap();
        let rows = (0..40usize)
            .map(|i| {
                let a = (i % 9) as f32;
                let b = ((i * 7) % 11) as f32 * 0.3;
                FeatureRow {
                    row: i % 3,
                    col: i % 4,
                    time: start.add_months((i / 12) as i64),
                    target: 1.5 * a + 0.5 * b - 2.0 + ((i % 5) as f32) * 0.1,
                    values: vec![a, b],
                }
            })
            .collect();
        let table = FeatureTable { columns: vec!["a".into(), "b".into()], rows };
        let (m, _) = LinearModel::fit(&table, &FeatureSpec::default(), &TrainConfig::default()).unwrap();
        (m, table)
    }

    #[test]
    fn linear_attributions_are_additive() {
        let (m, table) = fitted();
        let att = linear_attributions(&m, &table).unwrap();
        assert!(att.check_additivity(1e-9).is_empty());
        for (r, f) in att.rows.iter().zip(&table.rows) {
            assert_abs_diff_eq!(r.prediction, m.predict(&f.values), epsilon = 1e-9);
        }
    }

    #[test]
    fn attributions_at_the_mean_are_zero() {
        let (m, _) = fitted();
        let at_mean: Vec<f32> = m.means.iter().map(|&v| v as f32).collect();
        let table = FeatureTable {
            columns: m.features.clone(),
            rows: vec![FeatureRow {
                row: 0,
                col: 0,
                time: "2020-01".parse().unwrap(),
                target: f32::NAN,
                values: at_mean,
            }],
        };
        let att = linear_attributions(&m, &table).unwrap();
        for v in &att.rows[0].values {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-5);
        }
    }

    #[test]
    fn global_importance_is_sorted() {
        let (m, table) = fitted();
        let imp = linear_attributions(&m, &table).unwrap().global_importance();
        assert_eq!(imp[0].0, "a");
        assert!(imp[0].1 >= imp[1].1);
    }

    #[test]
    fn csv_round_trip_and_external_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shap_values.csv");
        let (m, table) = fitted();
        let att = linear_attributions(&m, &table).unwrap();
        att.write_csv(&path).unwrap();
        let back = AttributionTable::read_csv(&path).unwrap();
        assert_eq!(back.features, att.features);
        assert_eq!(back.rows.len(), att.rows.len());
        assert_abs_diff_eq!(back.rows[7].values[1], att.rows[7].values[1], epsilon = 1e-12);

        let ext = dir.path().join("external.csv");
        std::fs::write(&ext, "row,col,time,base_value,prediction,ndvi\n1,2,2021-03,0.5,0.25,-0.25\n").unwrap();
        let t = AttributionTable::read_csv(&ext).unwrap();
        assert!(t.check_additivity(1e-12).is_empty());

        let broken = dir.path().join("broken.csv");
        std::fs::write(&broken, "row,col,when,ndvi\n").unwrap();
        assert!(AttributionTable::read_csv(&broken).is_err());
    }
}
