//! Checkpointing sink: append-only CSV of per-operator metrics.
//!
//! Every record is flushed and synced before the harness looks at the next
//! inbox line, so a crash loses at most the query in flight. The query ids
//! already present when the sink opens in resume mode form the resume set;
//! those queries are never sent to the engine again.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::fsutil::ensure_parent;
use crate::protocol::{MetricEvent, Prediction};

/// Which training-line form the engine emits, and so which columns the
/// sink carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricMode {
    Single,
    Dual,
}

const SINGLE_COLUMNS: [&str; 7] = [
    "query_id",
    "operator",
    "actual",
    "predicted",
    "q_error",
    "model_size",
    "timestamp",
];

const DUAL_COLUMNS: [&str; 9] = [
    "query_id",
    "operator",
    "actual",
    "rl_predicted",
    "duck_predicted",
    "rl_q_error",
    "duck_q_error",
    "model_size",
    "timestamp",
];

impl MetricMode {
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            MetricMode::Single => &SINGLE_COLUMNS,
            MetricMode::Dual => &DUAL_COLUMNS,
        }
    }

    pub fn accepts(self, prediction: &Prediction) -> bool {
        matches!(
            (self, prediction),
            (MetricMode::Single, Prediction::Single { .. })
                | (MetricMode::Dual, Prediction::Dual { .. })
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricMode::Single => "single",
            MetricMode::Dual => "dual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    /// Truncate and write a header.
    Fresh,
    /// Keep existing rows, skip their query ids, append.
    Resume,
    /// Delete the file first, then behave like `Fresh`.
    Clean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub query_id: u64,
    pub metric: MetricEvent,
    pub model_size: u64,
    pub timestamp: String,
}

impl RunRecord {
    pub fn now(query_id: u64, metric: MetricEvent, model_size: u64) -> Self {
        Self {
            query_id,
            metric,
            model_size,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    fn fields(&self) -> Vec<String> {
        let mut out = vec![
            self.query_id.to_string(),
            self.metric.operator.clone(),
            self.metric.actual.to_string(),
        ];
        match &self.metric.prediction {
            Prediction::Single { predicted, q_error } => {
                out.push(predicted.to_string());
                out.push(q_error.to_string());
            }
            Prediction::Dual {
                learned,
                baseline,
                learned_q_error,
                baseline_q_error,
            } => {
                out.push(learned.to_string());
                out.push(baseline.to_string());
                out.push(learned_q_error.to_string());
                out.push(baseline_q_error.to_string());
            }
        }
        out.push(self.model_size.to_string());
        out.push(self.timestamp.clone());
        out
    }
}

pub struct CheckpointSink {
    path: PathBuf,
    mode: MetricMode,
    writer: csv::Writer<File>,
    resume_set: BTreeSet<u64>,
    rows_written: u64,
}

impl CheckpointSink {
    pub fn open(path: &Path, mode: MetricMode, sink_mode: SinkMode) -> Result<Self> {
        ensure_parent(path)?;
        match sink_mode {
            SinkMode::Clean => {
                if path.exists() {
                    fs::remove_file(path)?;
                    info!(path = %path.display(), "deleted existing checkpoint file");
                }
                Self::create_fresh(path, mode)
            }
            SinkMode::Fresh => Self::create_fresh(path, mode),
            SinkMode::Resume => {
                let has_rows = fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
                if has_rows {
                    Self::open_resume(path, mode)
                } else {
                    Self::create_fresh(path, mode)
                }
            }
        }
    }

    fn create_fresh(path: &Path, mode: MetricMode) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(mode.columns())?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            writer,
            resume_set: BTreeSet::new(),
            rows_written: 0,
        })
    }

    fn open_resume(path: &Path, mode: MetricMode) -> Result<Self> {
        let resume_set = read_query_ids(path, mode)?;

        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        // A crash can leave a partial last line; start appends on a fresh one.
        if !ends_with_newline(&mut file)? {
            file.write_all(b"\n")?;
        }
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        info!(
            path = %path.display(),
            queries = resume_set.len(),
            "resuming checkpoint file"
        );
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            writer,
            resume_set,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> MetricMode {
        self.mode
    }

    pub fn already_recorded(&self, query_id: u64) -> bool {
        self.resume_set.contains(&query_id)
    }

    pub fn resume_set(&self) -> &BTreeSet<u64> {
        &self.resume_set
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Writes one row and pushes it to stable storage before returning.
    pub fn append(&mut self, record: &RunRecord) -> Result<()> {
        if !self.mode.accepts(&record.metric.prediction) {
            return Err(HarnessError::Config(format!(
                "{} sink cannot store a {:?} prediction",
                self.mode.as_str(),
                record.metric.prediction
            )));
        }
        self.writer.write_record(record.fields())?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.rows_written += 1;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }
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

fn read_query_ids(path: &Path, mode: MetricMode) -> Result<BTreeSet<u64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let expected = mode.columns();
    if headers.iter().ne(expected.iter().copied()) {
        return Err(HarnessError::SinkSchema {
            path: path.to_path_buf(),
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }
    let mut ids = BTreeSet::new();
    for (row, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(row = row + 1, error = %e, "skipping unreadable checkpoint row");
                continue;
            }
        };
        match record.get(0).and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(id) => {
                ids.insert(id);
            }
            None => warn!(row = row + 1, "checkpoint row without a query id"),
        }
    }
    Ok(ids)
}
