//! Engine configuration.
//!
//! Loaded once at startup from environment variables, optionally seeded from
//! a TOML file (`$FLOWGATE_CONFIG_PATH`). Everything derived from λ — the
//! fixed waiting time in particular — is computed here and never refreshed;
//! changing the expected arrival rate means restarting the process.

use crate::balance::PolicyKind;
use crate::queue::{AdmissionParams, Discipline};
use crate::workload::WorkloadRegime;
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Expected request arrivals per second. Tunes the fixed waiting time
    /// (`1000/λ` ms) and the size-interval delay budgets.
    pub lambda: f64,

    /// Hard cap on queued units. 0 selects the per-regime default:
    /// 10 000 for ALU, 40 000 for the real-world regimes.
    pub max_queue_size: usize,

    /// Active admission discipline.
    pub discipline: Discipline,

    /// Policy used for units released from the queue.
    pub default_policy: PolicyKind,

    /// Which distribution shapes the benchmark workload.
    pub regime: WorkloadRegime,

    /// Additive delay-budget constant; unset picks the regime default.
    pub varx: Option<f64>,

    /// Multiplicative release-delay constant; unset picks the regime
    /// default.
    pub vary: Option<f64>,

    /// Deadline for the fixed-wait round-robin policy, in milliseconds.
    pub fixed_wait_ms: u64,

    /// Ceiling on one replica acquisition, covering late-binding spins.
    pub acquire_timeout_ms: u64,

    /// Directory holding the four CDF files for real-world synthesis.
    pub cdf_dir: PathBuf,

    /// Frontend wall-clock ceiling for ALU requests, seconds.
    pub alu_wait_ceiling_secs: u64,

    /// Frontend wall-clock ceiling per real-world sub-request, seconds.
    pub real_world_wait_ceiling_secs: u64,

    /// Seed for the workload RNG; unset draws from the OS.
    pub workload_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lambda: 50.0,
            max_queue_size: 0,
            discipline: Discipline::SizeInterval,
            default_policy: PolicyKind::BoundedWaitChoice2,
            regime: WorkloadRegime::AluUniform,
            varx: None,
            vary: None,
            fixed_wait_ms: 20,
            acquire_timeout_ms: 10_000,
            cdf_dir: PathBuf::from("/app/CDFs"),
            alu_wait_ceiling_secs: 120,
            real_world_wait_ceiling_secs: 320,
            workload_seed: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration overrides. Evaluation order:
    /// 1) `$FLOWGATE_CONFIG_PATH` (TOML file),
    /// 2) individual `FLOWGATE_*` environment variables on top,
    /// 3) defaults for everything else.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match env::var("FLOWGATE_CONFIG_PATH") {
            Ok(path) => Self::load_from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Some(lambda) = parse_env("FLOWGATE_LAMBDA")? {
            config.lambda = lambda;
        }
        if let Some(size) = parse_env("FLOWGATE_MAX_QUEUE_SIZE")? {
            config.max_queue_size = size;
        }
        if let Ok(raw) = env::var("FLOWGATE_DISCIPLINE") {
            config.discipline = parse_discipline(&raw)?;
        }
        if let Ok(raw) = env::var("FLOWGATE_POLICY") {
            config.default_policy = raw
                .parse()
                .map_err(|e: String| anyhow!("FLOWGATE_POLICY: {e}"))?;
        }
        if let Ok(raw) = env::var("FLOWGATE_REGIME") {
            config.regime = parse_regime(&raw)?;
        }
        if let Some(varx) = parse_env("FLOWGATE_VARX")? {
            config.varx = Some(varx);
        }
        if let Some(vary) = parse_env("FLOWGATE_VARY")? {
            config.vary = Some(vary);
        }
        if let Some(ms) = parse_env("FLOWGATE_ACQUIRE_TIMEOUT_MS")? {
            config.acquire_timeout_ms = ms;
        }
        if let Ok(dir) = env::var("FLOWGATE_CDF_DIR") {
            config.cdf_dir = PathBuf::from(dir);
        }
        if let Some(seed) = parse_env("FLOWGATE_WORKLOAD_SEED")? {
            config.workload_seed = Some(seed);
        }

        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|err| anyhow!("invalid engine config {}: {}", path.display(), err))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.lambda <= 0.0 {
            return Err(anyhow!("lambda must be positive, got {}", self.lambda));
        }
        Ok(())
    }

    /// `1000/λ` ms: the simple-preempt release delay and the bounded-wait
    /// policy ceiling. Computed from the startup λ and never refreshed.
    pub fn max_waiting_time(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.lambda)
    }

    /// Additive delay-budget constant, by regime unless overridden.
    pub fn varx(&self) -> f64 {
        self.varx.unwrap_or(match self.regime {
            WorkloadRegime::AluUniform => 3400.0 + 1000.0 / self.lambda,
            WorkloadRegime::RealWorldZipf | WorkloadRegime::RealWorldPowerLaw => 750.0,
            WorkloadRegime::RealWorldCdf => 1500.0,
        })
    }

    /// Multiplicative release-delay constant, by regime unless overridden.
    pub fn vary(&self) -> f64 {
        self.vary.unwrap_or(match self.regime {
            WorkloadRegime::AluUniform => 0.5,
            WorkloadRegime::RealWorldZipf => 40.0,
            WorkloadRegime::RealWorldCdf | WorkloadRegime::RealWorldPowerLaw => 200.0,
        })
    }

    pub fn max_queue_size(&self) -> usize {
        if self.max_queue_size != 0 {
            self.max_queue_size
        } else if self.regime.is_real_world() {
            40_000
        } else {
            10_000
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn fixed_wait(&self) -> Duration {
        Duration::from_millis(self.fixed_wait_ms)
    }

    /// Wall-clock ceiling the frontend applies while waiting on completion.
    pub fn wait_ceiling(&self, real_world: bool) -> Duration {
        if real_world {
            Duration::from_secs(self.real_world_wait_ceiling_secs)
        } else {
            Duration::from_secs(self.alu_wait_ceiling_secs)
        }
    }

    pub fn admission_params(&self) -> AdmissionParams {
        AdmissionParams {
            discipline: self.discipline,
            capacity: self.max_queue_size(),
            lambda: self.lambda,
            varx: self.varx(),
            vary: self.vary(),
            max_waiting_time: self.max_waiting_time(),
            alu_budget: !self.regime.is_real_world(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("{name}={raw:?}: {e}")),
        Err(_) => Ok(None),
    }
}

fn parse_discipline(raw: &str) -> anyhow::Result<Discipline> {
    match raw {
        "fifo" => Ok(Discipline::Fifo),
        "simple-preempt" => Ok(Discipline::SimplePreempt),
        "size-interval" => Ok(Discipline::SizeInterval),
        other => Err(anyhow!("unknown admission discipline {other:?}")),
    }
}

fn parse_regime(raw: &str) -> anyhow::Result<WorkloadRegime> {
    match raw {
        "alu-uniform" => Ok(WorkloadRegime::AluUniform),
        "real-world-cdf" => Ok(WorkloadRegime::RealWorldCdf),
        "real-world-zipf" => Ok(WorkloadRegime::RealWorldZipf),
        "real-world-power-law" => Ok(WorkloadRegime::RealWorldPowerLaw),
        other => Err(anyhow!("unknown workload regime {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_waiting_time(), Duration::from_millis(20));
        assert_eq!(config.max_queue_size(), 10_000);
        assert_eq!(config.vary(), 0.5);
        // ALU varx folds in the fixed wait.
        assert_eq!(config.varx(), 3420.0);
    }

    #[test]
    fn test_regime_defaults() {
        let config = EngineConfig {
            regime: WorkloadRegime::RealWorldZipf,
            ..Default::default()
        };
        assert_eq!(config.max_queue_size(), 40_000);
        assert_eq!(config.varx(), 750.0);
        assert_eq!(config.vary(), 40.0);
    }

    #[test]
    fn test_explicit_overrides_win() {
        let config = EngineConfig {
            max_queue_size: 123,
            varx: Some(5.0),
            vary: Some(7.0),
            ..Default::default()
        };
        assert_eq!(config.max_queue_size(), 123);
        assert_eq!(config.varx(), 5.0);
        assert_eq!(config.vary(), 7.0);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.lambda, config.lambda);
        assert_eq!(parsed.discipline, config.discipline);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: EngineConfig =
            toml::from_str("lambda = 100.0\ndiscipline = \"simple-preempt\"\n").unwrap();
        assert_eq!(parsed.lambda, 100.0);
        assert_eq!(parsed.discipline, Discipline::SimplePreempt);
        assert_eq!(parsed.max_waiting_time(), Duration::from_millis(10));
        assert_eq!(parsed.default_policy, PolicyKind::BoundedWaitChoice2);
    }

    #[test]
    fn test_lambda_must_be_positive() {
        let config = EngineConfig {
            lambda: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
