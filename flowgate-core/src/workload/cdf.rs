//! Empirical CDFs loaded from CSV.
//!
//! Each file is a two-column `key,cum` table sorted ascending by cumulative
//! probability, describing a step function. Sampling walks the steps and
//! returns the first key whose cumulative probability covers a uniform draw.

use anyhow::Context;
use rand::Rng;
use std::path::Path;

/// A sorted `(key, cumulative_probability)` step function.
#[derive(Debug, Clone, Default)]
pub struct Cdf {
    points: Vec<(f64, f64)>,
}

impl Cdf {
    pub fn from_points(mut points: Vec<(f64, f64)>) -> Self {
        points.sort_by(|a, b| a.1.total_cmp(&b.1));
        Self { points }
    }

    /// Load a CDF from a two-column CSV file. Malformed rows are skipped
    /// silently; only a missing or unreadable file is an error.
    pub fn from_csv_path(path: &Path, has_header: bool) -> anyhow::Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(has_header)
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("failed to open CDF file {}", path.display()))?;

        let mut points = Vec::new();
        for record in reader.records() {
            let Ok(record) = record else { continue };
            let (Some(key), Some(cum)) = (record.get(0), record.get(1)) else {
                continue;
            };
            let (Ok(key), Ok(cum)) = (key.trim().parse::<f64>(), cum.trim().parse::<f64>())
            else {
                continue;
            };
            points.push((key, cum));
        }
        Ok(Self::from_points(points))
    }

    /// Draw a key: the first whose cumulative probability reaches a uniform
    /// `u ∈ [0, 1)`. `None` only when the table is empty.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> Option<f64> {
        let u: f64 = rng.random();
        self.sample_at(u)
    }

    fn sample_at(&self, u: f64) -> Option<f64> {
        self.points
            .iter()
            .find(|(_, cum)| *cum >= u)
            .or_else(|| self.points.last())
            .map(|(key, _)| *key)
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }
}

/// The four distributions driving real-world sequence synthesis.
#[derive(Debug, Clone, Default)]
pub struct CdfSet {
    /// Sequence (chain) length.
    pub chain_len: Cdf,
    /// Mean inter-arrival time in milliseconds.
    pub inter_arrival: Cdf,
    /// Coefficient of variation of the inter-arrival times.
    pub cv: Cdf,
    /// Execution time (= rate tag) in milliseconds.
    pub exec_time: Cdf,
}

impl CdfSet {
    /// Load the set from its conventional file names under `dir`. Only the
    /// chain-length file carries a header row.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            chain_len: Cdf::from_csv_path(&dir.join("chainlenCDF.csv"), true)?,
            inter_arrival: Cdf::from_csv_path(&dir.join("invokesCDF.csv"), false)?,
            cv: Cdf::from_csv_path(&dir.join("CVs.csv"), false)?,
            exec_time: Cdf::from_csv_path(&dir.join("execTimeCDF.csv"), false)?,
        })
    }
}
