//! Harness configuration.
//!
//! A YAML file supplies the base (every field optional), CLI flags override
//! individual fields, and `validate` rejects combinations the run loop
//! cannot honour before anything is spawned.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, Result};
use crate::sink::{MetricMode, SinkMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    Tpch,
    Tpcds,
    /// Initialization statements come from `init_statements`.
    Custom,
}

impl Workload {
    pub fn as_str(self) -> &'static str {
        match self {
            Workload::Tpch => "tpch",
            Workload::Tpcds => "tpcds",
            Workload::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Silence allowed while the cold-start statements run.
    pub init_secs: u64,
    /// Silence allowed while a single query runs.
    pub stall_secs: u64,
    /// Wait after the quit command before the engine is killed.
    pub shutdown_grace_secs: u64,
    /// Upper bound on one inbox wait.
    pub poll_tick_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init_secs: 300,
            stall_secs: 30,
            shutdown_grace_secs: 5,
            poll_tick_ms: 250,
        }
    }
}

impl Timeouts {
    pub fn init(&self) -> Duration {
        Duration::from_secs(self.init_secs)
    }

    pub fn stall(&self) -> Duration {
        Duration::from_secs(self.stall_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub queries: PathBuf,
    pub output: PathBuf,
    pub engine: PathBuf,
    /// Database target handed to the engine; `:memory:` for a throwaway one.
    pub database: String,
    pub workload: Workload,
    pub scale_factor: f64,
    pub init_statements: Vec<String>,
    /// Reuse a pre-populated database and skip the cold-start statements.
    pub skip_load: bool,
    pub limit: Option<usize>,
    pub shuffle: bool,
    pub seed: u64,
    pub mode: MetricMode,
    pub sink_mode: SinkMode,
    pub timeouts: Timeouts,
    pub quit_command: String,
    pub progress_every: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            queries: PathBuf::from("queries.sql"),
            output: PathBuf::from("qerror_results.csv"),
            engine: PathBuf::from("./build/release/duckdb"),
            database: ":memory:".to_string(),
            workload: Workload::Tpcds,
            scale_factor: 1.0,
            init_statements: Vec::new(),
            skip_load: false,
            limit: None,
            shuffle: false,
            seed: 0,
            mode: MetricMode::Dual,
            sink_mode: SinkMode::Fresh,
            timeouts: Timeouts::default(),
            quit_command: ".quit".to_string(),
            progress_every: 50,
        }
    }
}

impl HarnessConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.timeouts.stall_secs == 0 {
            problems.push("timeouts.stall_secs must be > 0".to_string());
        }
        if self.timeouts.init_secs == 0 {
            problems.push("timeouts.init_secs must be > 0".to_string());
        }
        if self.timeouts.poll_tick_ms == 0 {
            problems.push("timeouts.poll_tick_ms must be > 0".to_string());
        }
        if !(self.scale_factor > 0.0) {
            problems.push(format!("scale_factor must be > 0 (got {})", self.scale_factor));
        }
        if !self.skip_load && self.workload == Workload::Custom && self.init_statements.is_empty()
        {
            problems.push("workload 'custom' requires init_statements unless skip_load".to_string());
        }
        if self.progress_every == 0 {
            problems.push("progress_every must be > 0".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Config(problems.join("; ")))
        }
    }

    /// Statements written on cold start, before the init sentinel.
    pub fn cold_start_statements(&self) -> Vec<String> {
        if !self.init_statements.is_empty() {
            return self.init_statements.clone();
        }
        match self.workload {
            Workload::Tpch => vec![format!("CALL dbgen(sf={});", self.scale_factor)],
            Workload::Tpcds => vec![format!("CALL dsdgen(sf={});", self.scale_factor)],
            Workload::Custom => Vec::new(),
        }
    }

    /// `results.csv` -> `results_failed.txt`, next to the output file.
    pub fn failure_details_path(&self) -> PathBuf {
        let stem = self
            .output
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("results");
        self.output.with_file_name(format!("{}_failed.txt", stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HarnessConfig::default()
            .validate()
            .expect("defaults must be valid");
    }

    #[test]
    fn validate_reports_every_problem() {
        let cfg = HarnessConfig {
            workload: Workload::Custom,
            scale_factor: 0.0,
            timeouts: Timeouts {
                stall_secs: 0,
                ..Timeouts::default()
            },
            ..HarnessConfig::default()
        };
        let msg = cfg.validate().expect_err("invalid").to_string();
        assert!(msg.contains("stall_secs"), "{}", msg);
        assert!(msg.contains("scale_factor"), "{}", msg);
        assert!(msg.contains("init_statements"), "{}", msg);
    }

    #[test]
    fn workload_presets_pick_generator() {
        let mut cfg = HarnessConfig {
            workload: Workload::Tpch,
            scale_factor: 10.0,
            ..HarnessConfig::default()
        };
        assert_eq!(cfg.cold_start_statements(), vec!["CALL dbgen(sf=10);"]);
        cfg.workload = Workload::Tpcds;
        cfg.scale_factor = 0.1;
        assert_eq!(cfg.cold_start_statements(), vec!["CALL dsdgen(sf=0.1);"]);
        cfg.init_statements = vec!["ATTACH 'x.db';".to_string()];
        assert_eq!(cfg.cold_start_statements(), vec!["ATTACH 'x.db';"]);
    }

    #[test]
    fn failure_details_sit_next_to_output() {
        let cfg = HarnessConfig {
            output: PathBuf::from("/data/runs/tpcds_results.csv"),
            ..HarnessConfig::default()
        };
        assert_eq!(
            cfg.failure_details_path(),
            PathBuf::from("/data/runs/tpcds_results_failed.txt")
        );
    }

    #[test]
    fn yaml_overrides_only_named_fields() {
        let path = std::env::temp_dir().join(format!(
            "cardlab_config_test_{}_{}.yaml",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::write(
            &path,
            "engine: /opt/duckdb-rl\nmode: single\ntimeouts:\n  stall_secs: 5\n",
        )
        .expect("write config");
        let cfg = HarnessConfig::load(&path).expect("load");
        assert_eq!(cfg.engine, PathBuf::from("/opt/duckdb-rl"));
        assert_eq!(cfg.mode, MetricMode::Single);
        assert_eq!(cfg.timeouts.stall_secs, 5);
        assert_eq!(cfg.timeouts.init_secs, 300);
        assert_eq!(cfg.database, ":memory:");
        let _ = fs::remove_file(path);
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let path = std::env::temp_dir().join(format!(
            "cardlab_config_unknown_{}_{}.yaml",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::write(&path, "stall_timeout: 5\n").expect("write config");
        let err = HarnessConfig::load(&path).expect_err("unknown key");
        assert!(matches!(err, HarnessError::Config(_)));
        let _ = fs::remove_file(path);
    }
}
