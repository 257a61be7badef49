//! Closed-loop benchmark workload synthesis.
//!
//! Two stream shapes drive the engine: the ALU mode draws one class tag
//! uniformly per incoming call, while the real-world mode expands each call
//! into a whole invocation sequence shaped by four empirical CDFs (chain
//! length, inter-arrival, coefficient of variation, execution time) with
//! optional zipf / power-law execution tails.

pub mod cdf;

pub use cdf::{Cdf, CdfSet};

use crate::classes::ClassTable;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Zipf};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Zipf/power-law tail shape shared by both heavy-tail regimes.
const TAIL_EXPONENT: f64 = 1.05;
/// Largest execution-time tag either tail can produce, in milliseconds.
const TAIL_MAX_MS: u32 = 30_000;

/// Which distribution produces execution-time tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadRegime {
    /// Uniform draw over the ALU class table.
    AluUniform,
    /// Execution times from the empirical exec-time CDF.
    RealWorldCdf,
    /// zipf(s = 1.05, n = 30000) execution tail.
    RealWorldZipf,
    /// power-law(α = 1.05) over 1..=30000 ms.
    RealWorldPowerLaw,
}

impl WorkloadRegime {
    pub fn is_real_world(self) -> bool {
        !matches!(self, Self::AluUniform)
    }
}

/// One element of a synthesized invocation sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceItem {
    /// Execution-time tag for this invocation.
    pub rate: u32,
    /// Milliseconds to sleep after this invocation completes; always 0 for
    /// the final element.
    pub iat_ms: f64,
}

/// A fully planned real-world sequence.
#[derive(Debug, Clone, Default)]
pub struct SequencePlan {
    pub items: Vec<SequenceItem>,
}

impl SequencePlan {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Stream synthesizer. Holds its own RNG so benchmark runs can be seeded.
#[derive(Debug)]
pub struct WorkloadGenerator {
    regime: WorkloadRegime,
    classes: Arc<ClassTable>,
    cdfs: CdfSet,
    rng: Mutex<StdRng>,
}

impl WorkloadGenerator {
    pub fn new(
        regime: WorkloadRegime,
        classes: Arc<ClassTable>,
        cdfs: CdfSet,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            regime,
            classes,
            cdfs,
            rng: Mutex::new(rng),
        }
    }

    pub fn regime(&self) -> WorkloadRegime {
        self.regime
    }

    /// One uniform draw from the ALU class table.
    pub fn alu_rate(&self) -> u32 {
        let classes = self.classes.classes();
        if classes.is_empty() {
            return 1;
        }
        let mut rng = self.lock_rng();
        classes[rng.random_range(0..classes.len())].rate
    }

    /// Expand one incoming real-world call into a whole sequence: length from
    /// the chain-length CDF, pacing from the inter-arrival and CV CDFs,
    /// execution tags from the regime's tail distribution.
    pub fn plan_sequence(&self) -> SequencePlan {
        let mut rng = self.lock_rng();

        let len = (self.cdfs.chain_len.sample(&mut *rng).unwrap_or(1.0) as usize).max(1);
        let avg_iat_ms = self.cdfs.inter_arrival.sample(&mut *rng).unwrap_or(0.0);
        let cv = self.cdfs.cv.sample(&mut *rng).unwrap_or(0.0);

        let items = (0..len)
            .map(|i| SequenceItem {
                rate: self.exec_tag(&mut *rng),
                iat_ms: if i == len - 1 {
                    0.0
                } else {
                    positive_normal(&mut *rng, avg_iat_ms, avg_iat_ms * cv)
                },
            })
            .collect();
        SequencePlan { items }
    }

    fn exec_tag<R: Rng>(&self, rng: &mut R) -> u32 {
        match self.regime {
            WorkloadRegime::AluUniform => {
                let classes = self.classes.classes();
                if classes.is_empty() {
                    1
                } else {
                    classes[rng.random_range(0..classes.len())].rate
                }
            }
            WorkloadRegime::RealWorldCdf => self
                .cdfs
                .exec_time
                .sample(rng)
                .map(|ms| ms.max(1.0) as u32)
                .unwrap_or(1),
            WorkloadRegime::RealWorldZipf => sample_zipf(rng),
            WorkloadRegime::RealWorldPowerLaw => sample_power_law(rng),
        }
    }

    fn lock_rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sample_zipf<R: Rng>(rng: &mut R) -> u32 {
    match Zipf::new(TAIL_MAX_MS as f64, TAIL_EXPONENT) {
        Ok(zipf) => (zipf.sample(rng) as u32).clamp(1, TAIL_MAX_MS),
        Err(_) => 1,
    }
}

/// Inverse-CDF draw from a bounded power law with density `x^-α`.
fn sample_power_law<R: Rng>(rng: &mut R) -> u32 {
    let alpha = TAIL_EXPONENT;
    let (min, max) = (1.0_f64, TAIL_MAX_MS as f64);
    let u: f64 = rng.random();
    let exp = 1.0 - alpha;
    let x = (min.powf(exp) + u * (max.powf(exp) - min.powf(exp))).powf(1.0 / exp);
    (x as u32).clamp(1, TAIL_MAX_MS)
}

/// Normal draw truncated to strictly positive, resampling as the original
/// benchmark does. Degenerate parameters collapse to the mean.
fn positive_normal<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    if mean <= 0.0 {
        return 0.0;
    }
    let Ok(normal) = Normal::new(mean, std_dev.max(0.0)) else {
        return mean;
    };
    for _ in 0..64 {
        let draw = normal.sample(rng);
        if draw > 0.0 {
            return draw;
        }
    }
    mean
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real_world_generator(regime: WorkloadRegime) -> WorkloadGenerator {
        let cdfs = CdfSet {
            chain_len: Cdf::from_points(vec![(3.0, 1.0)]),
            inter_arrival: Cdf::from_points(vec![(100.0, 1.0)]),
            cv: Cdf::from_points(vec![(0.1, 1.0)]),
            exec_time: Cdf::from_points(vec![(5.0, 0.5), (500.0, 1.0)]),
        };
        WorkloadGenerator::new(
            regime,
            Arc::new(ClassTable::real_world_default()),
            cdfs,
            Some(42),
        )
    }

    #[test]
    fn test_alu_rate_draws_from_table() {
        let generator = WorkloadGenerator::new(
            WorkloadRegime::AluUniform,
            Arc::new(ClassTable::alu_default()),
            CdfSet::default(),
            Some(1),
        );
        let table = ClassTable::alu_default();
        for _ in 0..200 {
            let rate = generator.alu_rate();
            assert!(table.classes().iter().any(|c| c.rate == rate));
        }
    }

    #[test]
    fn test_sequence_shape() {
        let generator = real_world_generator(WorkloadRegime::RealWorldCdf);
        let plan = generator.plan_sequence();
        assert_eq!(plan.len(), 3);

        // All but the last element pace the sequence; the last never waits.
        for item in &plan.items[..2] {
            assert!(item.iat_ms > 0.0);
            // Drawn from Normal(100, 10): far tails would indicate a unit bug.
            assert!(item.iat_ms > 40.0 && item.iat_ms < 160.0);
        }
        assert_eq!(plan.items[2].iat_ms, 0.0);

        for item in &plan.items {
            assert!(item.rate == 5 || item.rate == 500);
        }
    }

    #[test]
    fn test_zipf_tail_bounds() {
        let generator = real_world_generator(WorkloadRegime::RealWorldZipf);
        for _ in 0..500 {
            let plan = generator.plan_sequence();
            for item in &plan.items {
                assert!((1..=TAIL_MAX_MS).contains(&item.rate));
            }
        }
    }

    #[test]
    fn test_power_law_favors_short_jobs() {
        let generator = real_world_generator(WorkloadRegime::RealWorldPowerLaw);
        let mut short = 0u32;
        let mut total = 0u32;
        for _ in 0..500 {
            for item in generator.plan_sequence().items {
                total += 1;
                if item.rate <= 100 {
                    short += 1;
                }
            }
        }
        // α ≈ 1 still concentrates mass near the minimum.
        assert!(short as f64 / total as f64 > 0.3);
    }

    #[test]
    fn test_positive_normal_degenerate_inputs() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(positive_normal(&mut rng, 0.0, 10.0), 0.0);
        assert_eq!(positive_normal(&mut rng, 50.0, f64::NAN), 50.0);
        let drawn = positive_normal(&mut rng, 100.0, 0.0);
        assert!((drawn - 100.0).abs() < 1e-9);
    }
}
