//! Random hyperparameter search over harness runs.
//!
//! Each trial runs the harness as a fresh subprocess with a sampled
//! configuration in its environment, then reads only the `RL : median=…`
//! summary line from its output. Every trial, successful or not, appends
//! one row to the trial log before the next starts, so the log row count is
//! the number of trials attempted and a resumed search can rebuild its state
//! from the log alone.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use crate::stats::{parse_summary, QErrorSummary};

pub const TRIAL_LOG_FILE: &str = "tuning_results.csv";
pub const BEST_CONFIG_FILE: &str = "best_config.json";

/// Exit code of an interrupted harness run; its partial summary is not a
/// result.
const INTERRUPTED_EXIT: i32 = 130;

const TRIAL_LOG_COLUMNS: [&str; 6] = ["trial_index", "exit_code", "median", "p90", "p95", "configuration"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    Uniform { low: f64, high: f64 },
    LogUniform { low: f64, high: f64 },
    /// Inclusive on both ends.
    IntUniform { low: i64, high: i64 },
    Categorical { choices: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dimension {
    /// Environment variable the engine reads.
    pub env: String,
    pub distribution: Distribution,
    #[serde(default)]
    pub clamp: Option<[f64; 2]>,
    /// Decimal places for float values; defaults to 6.
    #[serde(default)]
    pub precision: Option<usize>,
}

impl Dimension {
    fn float(env: &str, distribution: Distribution, clamp: [f64; 2], precision: usize) -> Self {
        Self {
            env: env.to_string(),
            distribution,
            clamp: Some(clamp),
            precision: Some(precision),
        }
    }

    fn plain(env: &str, distribution: Distribution) -> Self {
        Self {
            env: env.to_string(),
            distribution,
            clamp: None,
            precision: None,
        }
    }

    fn clamped(&self, v: f64) -> f64 {
        match self.clamp {
            Some([lo, hi]) => v.clamp(lo, hi),
            None => v,
        }
    }

    pub fn sample<R: Rng>(&self, rng: &mut R) -> String {
        let precision = self.precision.unwrap_or(6);
        match &self.distribution {
            Distribution::Uniform { low, high } => {
                let v = self.clamped(rng.gen_range(*low..=*high));
                format!("{:.*}", precision, v)
            }
            Distribution::LogUniform { low, high } => {
                let v = rng.gen_range(low.ln()..=high.ln()).exp();
                format!("{:.*}", precision, self.clamped(v))
            }
            Distribution::IntUniform { low, high } => {
                let v = rng.gen_range(*low..=*high);
                (self.clamped(v as f64) as i64).to_string()
            }
            Distribution::Categorical { choices } => {
                choices.choose(rng).cloned().unwrap_or_default()
            }
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        match &self.distribution {
            Distribution::Uniform { low, high } if !(low <= high) => {
                out.push(format!("{}: low must be <= high", self.env))
            }
            Distribution::LogUniform { low, high } if !(*low > 0.0 && low <= high) => {
                out.push(format!("{}: log-uniform bounds must satisfy 0 < low <= high", self.env))
            }
            Distribution::IntUniform { low, high } if low > high => {
                out.push(format!("{}: low must be <= high", self.env))
            }
            Distribution::Categorical { choices } if choices.is_empty() => {
                out.push(format!("{}: categorical needs at least one choice", self.env))
            }
            _ => {}
        }
        if let Some([lo, hi]) = self.clamp {
            if !(lo <= hi) {
                out.push(format!("{}: clamp must be [low, high]", self.env));
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchSpace {
    pub dimensions: Vec<Dimension>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        use Distribution::*;
        Self {
            dimensions: vec![
                Dimension::plain(
                    "RL_MAX_DEPTH",
                    Categorical {
                        choices: ["4", "5", "6", "7"].map(String::from).to_vec(),
                    },
                ),
                Dimension::float("RL_ETA", LogUniform { low: 0.03, high: 0.2 }, [0.01, 0.3], 6),
                Dimension::plain("RL_TREES_PER_UPDATE", IntUniform { low: 5, high: 25 }),
                Dimension::float("RL_SUBSAMPLE", Uniform { low: 0.6, high: 1.0 }, [0.4, 1.0], 3),
                Dimension::float(
                    "RL_COLSAMPLE_BYTREE",
                    Uniform { low: 0.6, high: 1.0 },
                    [0.4, 1.0],
                    3,
                ),
                Dimension::plain("RL_MIN_CHILD_WEIGHT", IntUniform { low: 1, high: 8 }),
                Dimension::plain(
                    "RL_OBJECTIVE",
                    Categorical {
                        choices: ["reg:absoluteerror", "reg:squarederror"]
                            .map(String::from)
                            .to_vec(),
                    },
                ),
                Dimension::float("RL_LAMBDA", LogUniform { low: 0.2, high: 3.0 }, [0.0, 10.0], 6),
                Dimension::float("RL_ALPHA", LogUniform { low: 1e-4, high: 0.2 }, [0.0, 2.0], 6),
                Dimension::float("RL_GAMMA", LogUniform { low: 1e-5, high: 0.1 }, [0.0, 2.0], 6),
            ],
        }
    }
}

impl SearchSpace {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let space: SearchSpace = serde_yaml::from_str(&raw)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))?;
        space.validate()?;
        Ok(space)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = self.dimensions.iter().flat_map(|d| d.problems()).collect();
        if self.dimensions.is_empty() {
            problems.push("search space has no dimensions".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for d in &self.dimensions {
            if !seen.insert(d.env.as_str()) {
                problems.push(format!("{}: defined more than once", d.env));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::Config(problems.join("; ")))
        }
    }

    /// One value per dimension, drawn independently.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> BTreeMap<String, String> {
        self.dimensions
            .iter()
            .map(|d| (d.env.clone(), d.sample(rng)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRecord {
    pub trial_index: u64,
    /// `None` when the harness was killed by a signal.
    pub exit_code: Option<i32>,
    /// `None` when no summary line was found.
    pub summary: Option<QErrorSummary>,
    pub configuration: BTreeMap<String, String>,
}

impl TrialRecord {
    fn fields(&self) -> Result<Vec<String>> {
        let (median, p90, p95) = match &self.summary {
            Some(s) => (
                format!("{:.6}", s.median),
                format!("{:.6}", s.p90),
                format!("{:.6}", s.p95),
            ),
            None => (String::new(), String::new(), String::new()),
        };
        Ok(vec![
            self.trial_index.to_string(),
            self.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            median,
            p90,
            p95,
            serde_json::to_string(&self.configuration)?,
        ])
    }

    fn from_row(row: &csv::StringRecord) -> Option<Self> {
        let num = |i: usize| row.get(i).and_then(|v| v.trim().parse::<f64>().ok());
        let summary = match (num(2), num(3), num(4)) {
            (Some(median), Some(p90), Some(p95)) => Some(QErrorSummary { median, p90, p95 }),
            _ => None,
        };
        Some(Self {
            trial_index: row.get(0)?.trim().parse().ok()?,
            exit_code: row.get(1).and_then(|v| v.trim().parse().ok()),
            summary,
            configuration: serde_json::from_str(row.get(5)?).ok()?,
        })
    }

    pub fn describe(&self, promoted: bool) -> String {
        match &self.summary {
            Some(s) => format!(
                "[{}] {}  RL median={:.2} p90={:.2} p95={:.2}  config={}",
                self.trial_index,
                if promoted { "BEST" } else { "ok" },
                s.median,
                s.p90,
                s.p95,
                serde_json::to_string(&self.configuration).unwrap_or_default()
            ),
            None => format!(
                "[{}] FAILED to parse summary (exit={})",
                self.trial_index,
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        }
    }
}

/// What a resumed trial log already holds.
#[derive(Debug, Default)]
pub struct TrialHistory {
    pub records: Vec<TrialRecord>,
    /// Unreadable rows still count as attempted trials.
    pub rows: u64,
    pub max_index: Option<u64>,
}

impl TrialHistory {
    /// Never reuses an index already present in the log.
    pub fn next_index(&self) -> u64 {
        let after_max = self.max_index.map(|i| i + 1).unwrap_or(0);
        self.rows.max(after_max)
    }
}

/// Append-only trial log, one flushed row per trial.
pub struct TrialLog {
    writer: csv::Writer<File>,
}

impl TrialLog {
    /// Opens the log. With `resume`, the existing header is checked and the
    /// rows are kept; otherwise the file is truncated.
    pub fn open(path: &Path, resume: bool) -> Result<(Self, TrialHistory)> {
        let has_rows = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if resume && has_rows {
            let history = read_history(path)?;
            let mut file = OpenOptions::new().read(true).append(true).open(path)?;
            if !ends_with_newline(&mut file)? {
                file.write_all(b"\n")?;
            }
            let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
            return Ok((Self { writer }, history));
        }
        let file = File::create(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(TRIAL_LOG_COLUMNS)?;
        writer.flush()?;
        Ok((Self { writer }, TrialHistory::default()))
    }

    pub fn append(&mut self, record: &TrialRecord) -> Result<()> {
        self.writer.write_record(record.fields()?)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

fn read_history(path: &Path) -> Result<TrialHistory> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    if headers.iter().ne(TRIAL_LOG_COLUMNS.iter().copied()) {
        return Err(HarnessError::SinkSchema {
            path: path.to_path_buf(),
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }
    let mut history = TrialHistory::default();
    for (row, record) in reader.records().enumerate() {
        history.rows += 1;
        let record = record.ok();
        let index = record
            .as_ref()
            .and_then(|r| r.get(0))
            .and_then(|v| v.trim().parse::<u64>().ok());
        if let Some(index) = index {
            history.max_index = Some(history.max_index.map_or(index, |m| m.max(index)));
        }
        match record.as_ref().and_then(TrialRecord::from_row) {
            Some(r) => history.records.push(r),
            None => warn!(row = row + 1, path = %path.display(), "skipping unreadable trial row"),
        }
    }
    Ok(history)
}

fn ends_with_newline(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TuneConfig {
    pub trials: u64,
    /// 0 picks a time-based seed.
    pub seed: u64,
    pub outdir: PathBuf,
    pub resume: bool,
    /// Harness program followed by its arguments. `--output <csv> --clean`
    /// is appended per trial.
    pub harness: Vec<String>,
}

impl Default for TuneConfig {
    fn default() -> Self {
        Self {
            trials: 30,
            seed: 0,
            outdir: PathBuf::from("tuning_runs"),
            resume: false,
            harness: Vec::new(),
        }
    }
}

impl TuneConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| HarnessError::Config(format!("{}: {}", path.display(), e)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TuneReport {
    pub seed: u64,
    pub trials_run: u64,
    pub trials_total: u64,
    pub failed: u64,
    pub best: Option<TrialRecord>,
    pub best_config_path: Option<PathBuf>,
    pub interrupted: bool,
}

impl TuneReport {
    /// `export KEY=value` lines for the winning configuration.
    pub fn exports(&self) -> Vec<String> {
        self.best
            .as_ref()
            .map(|b| {
                b.configuration
                    .iter()
                    .map(|(k, v)| format!("export {}={}", k, v))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct Orchestrator {
    config: TuneConfig,
    space: SearchSpace,
    seed: u64,
    rng: StdRng,
    log: TrialLog,
    best: Option<TrialRecord>,
    next_index: u64,
}

impl Orchestrator {
    pub fn new(config: TuneConfig, space: SearchSpace) -> Result<Self> {
        space.validate()?;
        if config.harness.is_empty() {
            return Err(HarnessError::Config("harness command is empty".to_string()));
        }
        ensure_dir(&config.outdir)?;
        let (log, history) = TrialLog::open(&config.outdir.join(TRIAL_LOG_FILE), config.resume)?;
        let next_index = history.next_index();

        let seed = if config.seed == 0 {
            Utc::now().timestamp_micros().unsigned_abs()
        } else {
            config.seed
        };
        let mut rng = StdRng::seed_from_u64(seed);
        // Replay the draws of earlier trials so a seeded resume continues
        // the same sequence.
        for _ in 0..next_index {
            let _ = space.sample(&mut rng);
        }

        let mut best: Option<TrialRecord> = None;
        for record in &history.records {
            if let Some(summary) = &record.summary {
                let better = match best.as_ref().and_then(|b| b.summary.as_ref()) {
                    Some(incumbent) => summary.is_better_than(incumbent),
                    None => true,
                };
                if better {
                    best = Some(record.clone());
                }
            }
        }
        if config.resume {
            info!(
                existing = history.rows,
                next_index,
                best = ?best.as_ref().map(|b| b.trial_index),
                "resuming search"
            );
        }
        info!(seed, trials = config.trials, outdir = %config.outdir.display(), "search configured");
        Ok(Self {
            config,
            space,
            seed,
            rng,
            log,
            best,
            next_index,
        })
    }

    pub fn best(&self) -> Option<&TrialRecord> {
        self.best.as_ref()
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn best_config_path(&self) -> PathBuf {
        self.config.outdir.join(BEST_CONFIG_FILE)
    }

    /// Sample, execute, parse, record, maybe promote. Returns the record and
    /// whether it became the new best.
    pub fn run_trial(&mut self) -> Result<(TrialRecord, bool)> {
        let index = self.next_index;
        let configuration = self.space.sample(&mut self.rng);
        let trial_csv = self.config.outdir.join(format!("trial_{:04}.csv", index));

        let (program, args) = self
            .config
            .harness
            .split_first()
            .ok_or_else(|| HarnessError::Config("harness command is empty".to_string()))?;
        info!(trial = index, "starting trial");
        let spawned = Command::new(program)
            .args(args)
            .arg("--output")
            .arg(&trial_csv)
            .arg("--clean")
            .envs(&configuration)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let (record, failure_text) = match spawned {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let summary = if output.status.code() == Some(INTERRUPTED_EXIT) {
                    None
                } else {
                    parse_summary(&stdout).or_else(|| parse_summary(&stderr))
                };
                let text = format!(
                    "exit: {}\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
                    output.status, stdout, stderr
                );
                let record = TrialRecord {
                    trial_index: index,
                    exit_code: output.status.code(),
                    summary,
                    configuration,
                };
                (record, text)
            }
            Err(source) => {
                let err = HarnessError::Spawn {
                    program: PathBuf::from(program),
                    source,
                };
                warn!(trial = index, error = %err, "trial harness did not start");
                let record = TrialRecord {
                    trial_index: index,
                    exit_code: None,
                    summary: None,
                    configuration,
                };
                (record, format!("error: {}\n", err))
            }
        };

        if record.summary.is_none() {
            let log_path = self.config.outdir.join(format!("trial_{:04}.log", index));
            let text = format!(
                "command: {}\nconfiguration: {}\n{}",
                self.config.harness.join(" "),
                serde_json::to_string(&record.configuration)?,
                failure_text
            );
            atomic_write_bytes(&log_path, text.as_bytes())?;
            warn!(
                trial = index,
                exit_code = ?record.exit_code,
                log = %log_path.display(),
                "trial produced no summary"
            );
        }

        self.log.append(&record)?;
        self.next_index += 1;

        let promoted = match (&record.summary, self.best.as_ref().and_then(|b| b.summary.as_ref())) {
            (Some(new), Some(incumbent)) => new.is_better_than(incumbent),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if promoted {
            atomic_write_json_pretty(&self.best_config_path(), &record.configuration)?;
            info!(trial = index, "new best configuration");
            self.best = Some(record.clone());
        }
        Ok((record, promoted))
    }

    /// Runs the configured number of trials, one at a time, stopping early
    /// when `interrupt` is raised.
    pub fn run<F>(&mut self, interrupt: &AtomicBool, mut on_trial: F) -> Result<TuneReport>
    where
        F: FnMut(&TrialRecord, bool),
    {
        let mut trials_run = 0;
        let mut failed = 0;
        let mut interrupted = false;
        while trials_run < self.config.trials {
            if interrupt.load(Ordering::SeqCst) {
                interrupted = true;
                break;
            }
            let (record, promoted) = self.run_trial()?;
            if record.summary.is_none() {
                failed += 1;
            }
            trials_run += 1;
            on_trial(&record, promoted);
        }
        Ok(TuneReport {
            seed: self.seed,
            trials_run,
            trials_total: self.next_index,
            failed,
            best_config_path: self.best.as_ref().map(|_| self.best_config_path()),
            best: self.best.clone(),
            interrupted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::scratch_dir;

    #[test]
    fn default_space_samples_within_bounds() {
        let space = SearchSpace::default();
        space.validate().expect("valid");
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let c = space.sample(&mut rng);
            assert_eq!(c.len(), 10);
            assert!(["4", "5", "6", "7"].contains(&c["RL_MAX_DEPTH"].as_str()));
            let eta: f64 = c["RL_ETA"].parse().expect("eta");
            assert!((0.03..=0.2).contains(&eta), "eta {}", eta);
            assert_eq!(c["RL_ETA"].split('.').nth(1).map(str::len), Some(6));
            let trees: i64 = c["RL_TREES_PER_UPDATE"].parse().expect("trees");
            assert!((5..=25).contains(&trees));
            assert_eq!(c["RL_SUBSAMPLE"].split('.').nth(1).map(str::len), Some(3));
            let gamma: f64 = c["RL_GAMMA"].parse().expect("gamma");
            assert!((0.0..=0.1).contains(&gamma));
            assert!(c["RL_OBJECTIVE"].starts_with("reg:"));
        }
    }

    #[test]
    fn same_seed_same_configurations() {
        let space = SearchSpace::default();
        let a = space.sample(&mut StdRng::seed_from_u64(9));
        let b = space.sample(&mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }

    #[test]
    fn yaml_space_is_validated() {
        let dir = scratch_dir("search_space");
        let path = dir.join("space.yaml");
        fs::write(
            &path,
            "dimensions:\n  - env: RL_ETA\n    distribution: {kind: log_uniform, low: 0.0, high: 0.2}\n  - env: RL_ETA\n    distribution: {kind: categorical, choices: []}\n",
        )
        .expect("write");
        let msg = SearchSpace::load(&path).expect_err("invalid").to_string();
        assert!(msg.contains("0 < low"), "{}", msg);
        assert!(msg.contains("at least one choice"), "{}", msg);
        assert!(msg.contains("more than once"), "{}", msg);

        fs::write(
            &path,
            "dimensions:\n  - env: RL_MAX_DEPTH\n    distribution: {kind: int_uniform, low: 3, high: 3}\n",
        )
        .expect("write");
        let space = SearchSpace::load(&path).expect("valid");
        assert_eq!(
            space.sample(&mut StdRng::seed_from_u64(1))["RL_MAX_DEPTH"],
            "3"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    fn fake_harness(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string(), "fake-harness".to_string()]
    }

    fn depth_space() -> SearchSpace {
        SearchSpace {
            dimensions: vec![Dimension::plain(
                "RL_MAX_DEPTH",
                Distribution::IntUniform { low: 1, high: 9 },
            )],
        }
    }

    #[cfg(unix)]
    #[test]
    fn trials_are_logged_and_best_is_promoted() {
        let dir = scratch_dir("search_trials");
        // Lower depth scores better; the output path arrives as $2.
        let script = r#"echo "noise"; echo "RL   : median=$RL_MAX_DEPTH.00  p90=5.00  p95=9.00"; test "$1" = "--output" && test "$3" = "--clean""#;
        let config = TuneConfig {
            trials: 6,
            seed: 11,
            outdir: dir.clone(),
            resume: false,
            harness: fake_harness(script),
        };
        let mut orch = Orchestrator::new(config.clone(), depth_space()).expect("orchestrator");
        let mut seen = Vec::new();
        let report = orch
            .run(&AtomicBool::new(false), |r, promoted| seen.push((r.clone(), promoted)))
            .expect("run");
        assert_eq!(report.trials_run, 6);
        assert_eq!(report.failed, 0);
        assert!(seen.iter().all(|(r, _)| r.exit_code == Some(0)));

        let best_depth = seen
            .iter()
            .map(|(r, _)| r.configuration["RL_MAX_DEPTH"].parse::<u64>().expect("depth"))
            .min()
            .expect("min");
        let best = report.best.expect("best");
        assert_eq!(best.configuration["RL_MAX_DEPTH"], best_depth.to_string());
        // First occurrence of the minimum wins ties.
        let first_min = seen
            .iter()
            .find(|(r, _)| r.configuration["RL_MAX_DEPTH"] == best_depth.to_string())
            .expect("first");
        assert_eq!(best.trial_index, first_min.0.trial_index);
        assert!(first_min.1);

        let written: BTreeMap<String, String> = serde_json::from_slice(
            &fs::read(dir.join(BEST_CONFIG_FILE)).expect("best config"),
        )
        .expect("json");
        assert_eq!(written, best.configuration);

        let log = fs::read_to_string(dir.join(TRIAL_LOG_FILE)).expect("log");
        assert_eq!(log.lines().count(), 7);
        assert!(log.starts_with("trial_index,exit_code,median,p90,p95,configuration\n"));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn failed_trial_is_recorded_with_its_output() {
        let dir = scratch_dir("search_failure");
        let config = TuneConfig {
            trials: 2,
            seed: 5,
            outdir: dir.clone(),
            resume: false,
            harness: fake_harness("echo 'engine exploded' >&2; exit 4"),
        };
        let mut orch = Orchestrator::new(config, depth_space()).expect("orchestrator");
        let report = orch.run(&AtomicBool::new(false), |_, _| {}).expect("run");
        assert_eq!(report.trials_run, 2);
        assert_eq!(report.failed, 2);
        assert!(report.best.is_none());
        assert!(!dir.join(BEST_CONFIG_FILE).exists());
        let log = fs::read_to_string(dir.join("trial_0001.log")).expect("trial log");
        assert!(log.contains("engine exploded"));
        let rows = fs::read_to_string(dir.join(TRIAL_LOG_FILE)).expect("log");
        assert!(rows.lines().nth(1).expect("row").starts_with("0,4,,,,"));
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn summary_on_stderr_is_accepted() {
        let dir = scratch_dir("search_stderr");
        let config = TuneConfig {
            trials: 1,
            seed: 3,
            outdir: dir.clone(),
            resume: false,
            harness: fake_harness("echo 'RL : median=1.5 p90=2.5 p95=3.5' >&2"),
        };
        let mut orch = Orchestrator::new(config, depth_space()).expect("orchestrator");
        let (record, promoted) = orch.run_trial().expect("trial");
        assert!(promoted);
        assert_eq!(
            record.summary,
            Some(QErrorSummary {
                median: 1.5,
                p90: 2.5,
                p95: 3.5
            })
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resume_rebuilds_best_and_next_index() {
        let dir = scratch_dir("search_resume");
        fs::write(
            dir.join(TRIAL_LOG_FILE),
            "trial_index,exit_code,median,p90,p95,configuration\n\
             0,0,2.000000,5.000000,9.000000,\"{\"\"RL_ETA\"\":\"\"0.1\"\"}\"\n\
             1,1,,,,\"{\"\"RL_ETA\"\":\"\"0.2\"\"}\"\n\
             2,0,2.000000,4.000000,9.000000,\"{\"\"RL_ETA\"\":\"\"0.3\"\"}\"\n\
             3,0,2.000000,4.000000,9.000000,\"{\"\"RL_ETA\"\":\"\"0.4\"\"}\"\n",
        )
        .expect("seed log");
        let config = TuneConfig {
            trials: 0,
            seed: 1,
            outdir: dir.clone(),
            resume: true,
            harness: vec!["true".to_string()],
        };
        let orch = Orchestrator::new(config, SearchSpace::default()).expect("orchestrator");
        assert_eq!(orch.next_index(), 4);
        let best = orch.best().expect("best");
        assert_eq!(best.trial_index, 2);
        assert_eq!(best.configuration["RL_ETA"], "0.3");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn harness_that_cannot_start_is_a_recorded_failure() {
        let dir = scratch_dir("search_no_harness");
        let config = TuneConfig {
            trials: 3,
            seed: 2,
            outdir: dir.clone(),
            resume: false,
            harness: vec!["/nonexistent/cardlab-harness".to_string()],
        };
        let mut orch = Orchestrator::new(config, depth_space()).expect("orchestrator");
        let report = orch.run(&AtomicBool::new(false), |_, _| {}).expect("budget completes");
        assert_eq!(report.trials_run, 3);
        assert_eq!(report.failed, 3);
        assert!(report.best.is_none());

        let rows = fs::read_to_string(dir.join(TRIAL_LOG_FILE)).expect("log");
        assert_eq!(rows.lines().count(), 4);
        assert!(rows.lines().nth(3).expect("row").starts_with("2,,,,,"));
        let log = fs::read_to_string(dir.join("trial_0000.log")).expect("trial log");
        assert!(log.contains("failed to spawn /nonexistent/cardlab-harness"), "{}", log);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn resume_rejects_foreign_trial_log() {
        let dir = scratch_dir("search_foreign_log");
        fs::write(dir.join(TRIAL_LOG_FILE), "query_id,operator
1,SEQ_SCAN
").expect("seed log");
        let config = TuneConfig {
            trials: 0,
            seed: 1,
            outdir: dir.clone(),
            resume: true,
            harness: vec!["true".to_string()],
        };
        match Orchestrator::new(config, SearchSpace::default()) {
            Err(HarnessError::SinkSchema { found, .. }) => assert_eq!(found, "query_id,operator"),
            Err(other) => panic!("expected schema error, got {}", other),
            Ok(_) => panic!("foreign log must be rejected"),
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_rows_never_give_up_their_index() {
        let dir = scratch_dir("search_unreadable_rows");
        // Row 1 has a broken configuration, row 2 no index, and the crash
        // left trial 5 half written.
        fs::write(
            dir.join(TRIAL_LOG_FILE),
            "trial_index,exit_code,median,p90,p95,configuration\n\
             0,0,2.000000,5.000000,9.000000,\"{\"\"RL_ETA\"\":\"\"0.1\"\"}\"\n\
             1,0,1.000000,1.000000,1.000000,not-json\n\
             x,y\n\
             5,0,2.0",
        )
        .expect("seed log");
        let config = TuneConfig {
            trials: 1,
            seed: 1,
            outdir: dir.clone(),
            resume: true,
            harness: vec!["true".to_string()],
        };
        let mut orch = Orchestrator::new(config, depth_space()).expect("orchestrator");
        assert_eq!(orch.next_index(), 6);
        assert_eq!(orch.best().map(|b| b.trial_index), Some(0));

        let (record, _) = orch.run_trial().expect("trial");
        assert_eq!(record.trial_index, 6);
        let log = fs::read_to_string(dir.join(TRIAL_LOG_FILE)).expect("log");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[4], "5,0,2.0");
        assert!(lines[5].starts_with("6,0,,,,"), "{}", lines[5]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn fresh_search_truncates_old_log() {
        let dir = scratch_dir("search_fresh");
        fs::write(dir.join(TRIAL_LOG_FILE), "old,rows\n1,2\n").expect("seed log");
        let config = TuneConfig {
            trials: 0,
            seed: 1,
            outdir: dir.clone(),
            resume: false,
            harness: vec!["true".to_string()],
        };
        let orch = Orchestrator::new(config, SearchSpace::default()).expect("orchestrator");
        assert_eq!(orch.next_index(), 0);
        assert!(orch.best().is_none());
        let log = fs::read_to_string(dir.join(TRIAL_LOG_FILE)).expect("log");
        assert_eq!(log, "trial_index,exit_code,median,p90,p95,configuration\n");
        let _ = fs::remove_dir_all(dir);
    }
}
