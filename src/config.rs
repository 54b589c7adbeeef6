// src/config.rs

use crate::error::{Result, TunerError};
use crate::ranking::{QualityRanking, RankingPolicy, RuntimeRanking};
use crate::tournament::EvaluationSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuningMode {
    Runtime,
    Quality,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    pub max_tournament_size: usize,
    pub winner_fraction: f64,
    pub enable_racing: bool,
    pub cpu_timeout_ms: u64,
    pub parallel_evaluations: usize,
    pub tuning_mode: TuningMode,
    /// PAR-k factor applied to cancelled runs in runtime mode.
    pub penalization_factor: f64,
    pub maximize_quality: bool,
    pub watchdog_interval_ms: u64,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            max_tournament_size: 8,
            winner_fraction: 0.125,
            enable_racing: true,
            cpu_timeout_ms: 10_000,
            parallel_evaluations: num_cpus::get(),
            tuning_mode: TuningMode::Runtime,
            penalization_factor: 10.0,
            maximize_quality: false,
            watchdog_interval_ms: 1_000,
        }
    }
}

impl TunerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: TunerConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| TunerError::Configuration(format!("Failed to serialize: {e}")))?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tournament_size == 0 {
            return Err(TunerError::Configuration(
                "max_tournament_size must be at least 1".to_string(),
            ));
        }
        if !(self.winner_fraction > 0.0 && self.winner_fraction <= 1.0) {
            return Err(TunerError::Configuration(format!(
                "winner_fraction must be in (0, 1], got {}",
                self.winner_fraction
            )));
        }
        if self.cpu_timeout_ms == 0 {
            return Err(TunerError::Configuration(
                "cpu_timeout_ms must be positive".to_string(),
            ));
        }
        if self.parallel_evaluations == 0 {
            return Err(TunerError::Configuration(
                "parallel_evaluations must be at least 1".to_string(),
            ));
        }
        if self.penalization_factor < 1.0 {
            return Err(TunerError::Configuration(format!(
                "penalization_factor must be at least 1, got {}",
                self.penalization_factor
            )));
        }
        if self.watchdog_interval_ms == 0 {
            return Err(TunerError::Configuration(
                "watchdog_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cpu_timeout(&self) -> Duration {
        Duration::from_millis(self.cpu_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn evaluation_settings(&self) -> EvaluationSettings {
        EvaluationSettings {
            winner_fraction: self.winner_fraction,
            // Quality is only known after a run ends, so there is nothing to race on.
            enable_racing: self.enable_racing && self.tuning_mode == TuningMode::Runtime,
            cpu_timeout: self.cpu_timeout(),
            max_tournament_size: self.max_tournament_size,
        }
    }

    pub fn ranking_policy(&self) -> Arc<dyn RankingPolicy> {
        match self.tuning_mode {
            TuningMode::Runtime => Arc::new(RuntimeRanking::new(
                self.cpu_timeout(),
                self.penalization_factor,
            )),
            TuningMode::Quality => Arc::new(QualityRanking::new(self.maximize_quality)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_tournament_size = 4\ntuning_mode = \"quality\"").unwrap();

        let config = TunerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_tournament_size, 4);
        assert_eq!(config.tuning_mode, TuningMode::Quality);
        assert_eq!(config.cpu_timeout_ms, TunerConfig::default().cpu_timeout_ms);
        assert!(!config.evaluation_settings().enable_racing);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuner.toml");
        let config = TunerConfig {
            winner_fraction: 0.5,
            parallel_evaluations: 3,
            ..TunerConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(TunerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad = TunerConfig {
            winner_fraction: 0.0,
            ..TunerConfig::default()
        };
        assert!(matches!(bad.validate(), Err(TunerError::Configuration(_))));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "max_tournament_size = 0").unwrap();
        assert!(matches!(
            TunerConfig::load(file.path()),
            Err(TunerError::Configuration(_))
        ));
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "enable_racing = \"maybe\"").unwrap();
        assert!(matches!(
            TunerConfig::load(file.path()),
            Err(TunerError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_settings_follow_config() {
        let config = TunerConfig {
            max_tournament_size: 5,
            cpu_timeout_ms: 250,
            ..TunerConfig::default()
        };
        let settings = config.evaluation_settings();
        assert_eq!(settings.max_tournament_size, 5);
        assert_eq!(settings.cpu_timeout, Duration::from_millis(250));
        assert!(settings.enable_racing);
        assert_eq!(settings.desired_winners(5), 1);
    }
}
