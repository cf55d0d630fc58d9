//! The correlation loop.
//!
//! One consumer drains the inbox and owns every piece of run state: the
//! in-flight query, the current model size, the quarantine marker and the
//! counters. Engine output carries no query tag, so attribution rests on
//! the engine executing its input in order: every line between feeding a
//! query and observing that query's completion sentinel belongs to it.
//!
//! When a query stalls or errors the loop moves on without waiting for its
//! sentinel. That sentinel becomes the quarantine marker: metric and error
//! lines seen before it (or before the active query's own sentinel) are
//! discarded, since they may belong to the abandoned query. Model updates
//! are run-level and always apply.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{HarnessConfig, Timeouts};
use crate::corpus::{load_corpus, QueryUnit};
use crate::engine::{EngineIo, EngineLaunch, EngineProcess};
use crate::error::{HarnessError, Result};
use crate::fsutil::atomic_write_bytes;
use crate::inbox::{inbox, Channel, Inbox, InboxLine, Poll};
use crate::liveness::Watchdog;
use crate::protocol::{Event, LineGrammar, MetricEvent, Sentinels, UpdateEvent};
use crate::sink::{CheckpointSink, MetricMode, RunRecord};
use crate::stats::{QErrorCollector, QErrorSummary};

const FAILURE_PREVIEW: usize = 10;
const FAILURE_MESSAGE_WIDTH: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum QueryOutcome {
    Completed,
    /// The engine printed an error line while the query was in flight.
    Failed { message: String },
    /// No inbox activity within the stall window; the query was abandoned.
    Stalled,
}

/// A fed query: its 1-based feed position and corpus id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Feed {
    pub position: u64,
    pub query_id: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopTimings {
    pub init: Duration,
    pub stall: Duration,
    pub tick: Duration,
}

impl From<&Timeouts> for LoopTimings {
    fn from(t: &Timeouts) -> Self {
        Self {
            init: t.init(),
            stall: t.stall(),
            tick: t.poll_tick(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub planned: u64,
    pub skipped_resume: u64,
    pub fed: u64,
    pub completed: u64,
    pub failed: u64,
    pub stalled: u64,
    pub metrics_recorded: u64,
    /// Metric lines whose form does not match the sink's metric mode.
    pub mismatched_metrics: u64,
    pub updates: u64,
    /// Metric and error lines dropped while quarantined.
    pub discarded_lines: u64,
    pub unmatched_lines: u64,
    pub model_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryFailure {
    pub query_id: u64,
    pub position: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_tag: String,
    pub output: PathBuf,
    pub mode: MetricMode,
    pub stats: RunStats,
    pub failures: Vec<QueryFailure>,
    pub stalled_ids: Vec<u64>,
    pub learned: Option<QErrorSummary>,
    pub baseline: Option<QErrorSummary>,
    pub interrupted: bool,
    pub failure_details: Option<PathBuf>,
}

impl RunReport {
    /// Human-readable run summary. Contains the `RL : median=…` line the
    /// search orchestrator parses.
    pub fn render_text(&self) -> String {
        let s = &self.stats;
        let mut out = Vec::new();
        out.push("=".repeat(80));
        if self.interrupted {
            out.push("Benchmark interrupted; partial results kept".to_string());
        } else {
            out.push("Benchmark complete".to_string());
        }
        out.push(format!("Queries selected: {}", s.planned));
        out.push(format!("Skipped (already recorded): {}", s.skipped_resume));
        out.push(format!("Completed: {}", s.completed));
        out.push(format!("Failed: {}", s.failed));
        out.push(format!("Stalled: {}", s.stalled));
        out.push(format!("Metrics recorded: {}", s.metrics_recorded));
        if s.discarded_lines > 0 {
            out.push(format!("Late lines discarded: {}", s.discarded_lines));
        }
        out.push(format!("Model size: {}", s.model_size));
        out.push(format!("Results written to: {}", self.output.display()));

        if let Some(learned) = &self.learned {
            out.push(String::new());
            out.push("Q-error summary (per-operator metrics)".to_string());
            out.push("-".repeat(80));
            out.push(learned.format_line("RL"));
            if let Some(baseline) = &self.baseline {
                out.push(baseline.format_line("Duck"));
            }
        }

        if !self.failures.is_empty() {
            out.push(String::new());
            out.push("Failed queries:".to_string());
            for f in self.failures.iter().take(FAILURE_PREVIEW) {
                let message: String = f.message.chars().take(FAILURE_MESSAGE_WIDTH).collect();
                out.push(format!("  Query {}: {}", f.query_id, message));
            }
            if self.failures.len() > FAILURE_PREVIEW {
                out.push(format!(
                    "  ... and {} more",
                    self.failures.len() - FAILURE_PREVIEW
                ));
            }
        }
        if let Some(path) = &self.failure_details {
            out.push(format!("Failed query details saved to: {}", path.display()));
        }
        out.join("\n")
    }
}

pub struct Correlator<'a> {
    grammar: &'a LineGrammar,
    sentinels: &'a Sentinels,
    timings: LoopTimings,
    progress_every: u64,
    interrupt: &'a AtomicBool,
    quarantine: Option<Feed>,
    primary_closed: bool,
    secondary_closed: bool,
    stats: RunStats,
    failures: Vec<QueryFailure>,
    stalled_ids: Vec<u64>,
    qerrors: QErrorCollector,
}

impl<'a> Correlator<'a> {
    pub fn new(
        grammar: &'a LineGrammar,
        sentinels: &'a Sentinels,
        timings: LoopTimings,
        progress_every: u64,
        interrupt: &'a AtomicBool,
    ) -> Self {
        Self {
            grammar,
            sentinels,
            timings,
            progress_every: progress_every.max(1),
            interrupt,
            quarantine: None,
            primary_closed: false,
            secondary_closed: false,
            stats: RunStats::default(),
            failures: Vec::new(),
            stalled_ids: Vec::new(),
            qerrors: QErrorCollector::default(),
        }
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn failures(&self) -> &[QueryFailure] {
        &self.failures
    }

    pub fn quarantined(&self) -> Option<Feed> {
        self.quarantine
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Sends the cold-start statements and waits for the init sentinel.
    /// `Ok(false)` when interrupted first.
    pub fn initialize<E: EngineIo>(
        &mut self,
        engine: &mut E,
        inbox: &mut Inbox,
        statements: &[String],
    ) -> Result<bool> {
        for statement in statements {
            engine.send(statement)?;
        }
        let sentinel = self.sentinels.init();
        engine.send(&format!("SELECT '{}';", sentinel))?;
        info!(statements = statements.len(), "waiting for engine initialization");

        let started = Instant::now();
        let mut watchdog = Watchdog::new(self.timings.init);
        loop {
            if self.interrupted() {
                return Ok(false);
            }
            match inbox.poll(watchdog.next_wait(self.timings.tick)) {
                Poll::Line(line) => {
                    watchdog.touch();
                    if line.text.contains(&sentinel) {
                        info!(
                            elapsed_secs = started.elapsed().as_secs_f64(),
                            "engine initialized"
                        );
                        return Ok(true);
                    }
                    match self.grammar.classify(&line.text) {
                        Some(Event::Update(update)) => self.apply_update(&update),
                        Some(Event::QueryError { message }) => {
                            warn!(%message, "engine reported an error during initialization")
                        }
                        _ => {}
                    }
                }
                Poll::Closed(channel) => {
                    if self.mark_closed(channel) {
                        let status = self.wait_exit(engine)?;
                        return Err(HarnessError::Initialization(format!(
                            "engine closed its output during initialization ({})",
                            status
                        )));
                    }
                }
                Poll::Disconnected => {
                    let status = self.wait_exit(engine)?;
                    return Err(HarnessError::Initialization(format!(
                        "engine output ended during initialization ({})",
                        status
                    )));
                }
                Poll::ReadError { channel, message } => {
                    return Err(HarnessError::Stream {
                        channel: channel.to_string(),
                        message,
                    })
                }
                Poll::Idle => {
                    if let Some(status) = engine.exit_status()? {
                        return Err(HarnessError::Initialization(format!(
                            "engine exited during initialization ({})",
                            status
                        )));
                    }
                    if watchdog.is_stalled() {
                        return Err(HarnessError::Initialization(format!(
                            "no engine output for {}s while waiting for the init sentinel",
                            watchdog.window().as_secs_f64()
                        )));
                    }
                }
            }
        }
    }

    /// Feeds every query not already in the sink's resume set, in order.
    /// Returns `true` when interrupted before the plan was exhausted.
    pub fn drive<E: EngineIo>(
        &mut self,
        engine: &mut E,
        inbox: &mut Inbox,
        sink: &mut CheckpointSink,
        plan: &[QueryUnit],
    ) -> Result<bool> {
        let total = plan.len();
        let mut position = 0u64;
        for (idx, unit) in plan.iter().enumerate() {
            if sink.already_recorded(unit.id) {
                self.stats.skipped_resume += 1;
                debug!(query_id = unit.id, "already recorded; skipping");
                continue;
            }
            if self.interrupted() {
                return Ok(true);
            }
            position += 1;
            info!(query_id = unit.id, n = idx + 1, total, "running query");
            if self.run_query(engine, inbox, sink, unit, position)?.is_none() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Feeds one query and consumes the inbox until its outcome is known.
    /// `Ok(None)` when interrupted while waiting.
    pub fn run_query<E: EngineIo>(
        &mut self,
        engine: &mut E,
        inbox: &mut Inbox,
        sink: &mut CheckpointSink,
        unit: &QueryUnit,
        position: u64,
    ) -> Result<Option<QueryOutcome>> {
        let feed = Feed {
            position,
            query_id: unit.id,
        };
        let text = statement_text(&unit.text);
        if !text.is_empty() {
            engine.send(&text)?;
        }
        engine.send(&format!(
            "SELECT '{}';",
            self.sentinels.completion(position, unit.id)
        ))?;
        self.stats.fed += 1;

        let started = Instant::now();
        let mut watchdog = Watchdog::new(self.timings.stall);
        loop {
            if self.interrupted() {
                return Ok(None);
            }
            match inbox.poll(watchdog.next_wait(self.timings.tick)) {
                Poll::Line(line) => {
                    watchdog.touch();
                    if let Some(outcome) = self.apply_line(&line, feed, sink)? {
                        return Ok(Some(self.settle(feed, outcome, started)));
                    }
                }
                Poll::Closed(channel) => {
                    if self.mark_closed(channel) {
                        let status = self.wait_exit(engine)?;
                        return Err(HarnessError::ProcessExit { status });
                    }
                }
                Poll::Disconnected => {
                    let status = self.wait_exit(engine)?;
                    return Err(HarnessError::ProcessExit { status });
                }
                Poll::ReadError { channel, message } => {
                    return Err(HarnessError::Stream {
                        channel: channel.to_string(),
                        message,
                    })
                }
                Poll::Idle => {
                    if let Some(status) = engine.exit_status()? {
                        return Err(HarnessError::ProcessExit { status });
                    }
                    if watchdog.is_stalled() {
                        self.quarantine = Some(feed);
                        return Ok(Some(self.settle(feed, QueryOutcome::Stalled, started)));
                    }
                }
            }
        }
    }

    fn apply_line(
        &mut self,
        line: &InboxLine,
        feed: Feed,
        sink: &mut CheckpointSink,
    ) -> Result<Option<QueryOutcome>> {
        let Some(event) = self.grammar.classify(&line.text) else {
            self.stats.unmatched_lines += 1;
            return Ok(None);
        };
        match event {
            Event::QueryComplete { position, query_id } => {
                let seen = Feed { position, query_id };
                if seen == feed {
                    if self.quarantine.take().is_some() {
                        debug!(query_id, "quarantine lifted by active sentinel");
                    }
                    return Ok(Some(QueryOutcome::Completed));
                }
                if self.quarantine == Some(seen) {
                    self.quarantine = None;
                    debug!(query_id, position, "late sentinel observed; quarantine lifted");
                } else {
                    debug!(query_id, position, channel = %line.channel, "ignoring stale sentinel");
                }
                Ok(None)
            }
            Event::Update(update) => {
                self.apply_update(&update);
                Ok(None)
            }
            Event::Metric(_) | Event::QueryError { .. } if self.quarantine.is_some() => {
                self.stats.discarded_lines += 1;
                debug!(
                    arrival = line.arrival_order,
                    channel = %line.channel,
                    "discarding line from abandoned query"
                );
                Ok(None)
            }
            Event::Metric(metric) => {
                self.record_metric(feed, metric, sink)?;
                Ok(None)
            }
            Event::QueryError { message } => {
                self.quarantine = Some(feed);
                Ok(Some(QueryOutcome::Failed { message }))
            }
        }
    }

    fn record_metric(
        &mut self,
        feed: Feed,
        metric: MetricEvent,
        sink: &mut CheckpointSink,
    ) -> Result<()> {
        if !sink.mode().accepts(&metric.prediction) {
            self.stats.mismatched_metrics += 1;
            if self.stats.mismatched_metrics == 1 {
                warn!(
                    mode = sink.mode().as_str(),
                    operator = %metric.operator,
                    "training line form does not match metric mode; dropping such lines"
                );
            }
            return Ok(());
        }
        self.qerrors.observe(&metric);
        let record = RunRecord::now(feed.query_id, metric, self.stats.model_size);
        sink.append(&record)?;
        self.stats.metrics_recorded += 1;
        if self.stats.metrics_recorded % self.progress_every == 0 {
            info!(
                metrics = self.stats.metrics_recorded,
                model_size = self.stats.model_size,
                "progress"
            );
        }
        Ok(())
    }

    fn apply_update(&mut self, update: &UpdateEvent) {
        self.stats.model_size = update.model_size;
        self.stats.updates += 1;
        info!(
            sequence = update.sequence,
            samples = update.sample_count,
            model_size = update.model_size,
            avg_q_error = update.rolling_error,
            "model updated"
        );
    }

    fn settle(&mut self, feed: Feed, outcome: QueryOutcome, started: Instant) -> QueryOutcome {
        let elapsed_secs = started.elapsed().as_secs_f64();
        match &outcome {
            QueryOutcome::Completed => {
                self.stats.completed += 1;
                debug!(query_id = feed.query_id, elapsed_secs, "query completed");
            }
            QueryOutcome::Failed { message } => {
                self.stats.failed += 1;
                warn!(query_id = feed.query_id, %message, "query failed");
                self.failures.push(QueryFailure {
                    query_id: feed.query_id,
                    position: feed.position,
                    message: message.clone(),
                });
            }
            QueryOutcome::Stalled => {
                self.stats.stalled += 1;
                self.stalled_ids.push(feed.query_id);
                warn!(
                    query_id = feed.query_id,
                    silent_secs = self.timings.stall.as_secs_f64(),
                    "no engine activity; abandoning query"
                );
            }
        }
        outcome
    }

    /// Records end of stream; `true` once both streams are closed.
    fn mark_closed(&mut self, channel: Channel) -> bool {
        match channel {
            Channel::Primary => self.primary_closed = true,
            Channel::Secondary => self.secondary_closed = true,
        }
        debug!(channel = %channel, "engine stream closed");
        self.primary_closed && self.secondary_closed
    }

    fn wait_exit<E: EngineIo>(&self, engine: &mut E) -> Result<String> {
        let deadline = Instant::now() + self.timings.tick * 8;
        loop {
            if let Some(status) = engine.exit_status()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                return Ok("output streams closed".to_string());
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn into_report(
        self,
        output: PathBuf,
        mode: MetricMode,
        interrupted: bool,
    ) -> RunReport {
        RunReport {
            run_tag: self.sentinels.run_tag().to_string(),
            output,
            mode,
            learned: self.qerrors.learned(),
            baseline: self.qerrors.baseline(),
            stats: self.stats,
            failures: self.failures,
            stalled_ids: self.stalled_ids,
            interrupted,
            failure_details: None,
        }
    }
}

/// Query text as sent to the engine: trimmed, always `;`-terminated, empty
/// for an empty unit.
fn statement_text(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.ends_with(';') {
        trimmed.to_string()
    } else {
        format!("{};", trimmed)
    }
}

/// `--limit` first, then `--shuffle`.
pub fn select_queries(
    mut units: Vec<QueryUnit>,
    limit: Option<usize>,
    shuffle: bool,
    seed: u64,
) -> Vec<QueryUnit> {
    if let Some(limit) = limit {
        units.truncate(limit);
    }
    if shuffle {
        let mut rng = StdRng::seed_from_u64(seed);
        units.shuffle(&mut rng);
        let preview: Vec<u64> = units.iter().take(10).map(|u| u.id).collect();
        info!(seed, first = ?preview, "query order shuffled");
    }
    units
}

pub fn write_failure_details(path: &std::path::Path, failures: &[QueryFailure]) -> Result<()> {
    let mut text = String::from("Failed Queries Summary\n");
    text.push_str(&"=".repeat(80));
    text.push_str("\n\n");
    for f in failures {
        text.push_str(&format!(
            "Query {} (position {})\nError: {}\n\n",
            f.query_id, f.position, f.message
        ));
    }
    atomic_write_bytes(path, text.as_bytes())
}

/// Runs the whole benchmark: parse, open the sink, spawn, initialize,
/// correlate, and always shut the engine down and close the sink.
pub fn run_harness(config: &HarnessConfig, interrupt: &AtomicBool) -> Result<RunReport> {
    config.validate()?;
    let units = load_corpus(&config.queries)?;
    let parsed = units.len();
    let plan = select_queries(units, config.limit, config.shuffle, config.seed);
    info!(
        path = %config.queries.display(),
        parsed,
        selected = plan.len(),
        "corpus loaded"
    );

    let mut sink = CheckpointSink::open(&config.output, config.mode, config.sink_mode)?;
    let sentinels = Sentinels::random();
    let grammar = LineGrammar::new(&sentinels)
        .map_err(|e| HarnessError::Config(format!("line grammar: {}", e)))?;
    let mut correlator = Correlator::new(
        &grammar,
        &sentinels,
        LoopTimings::from(&config.timeouts),
        config.progress_every,
        interrupt,
    );
    correlator.stats.planned = plan.len() as u64;

    let pending = plan
        .iter()
        .filter(|u| !sink.already_recorded(u.id))
        .count();
    let interrupted = if pending == 0 {
        info!("every selected query is already recorded; engine not started");
        correlator.stats.skipped_resume = plan.len() as u64;
        sink.close()?;
        false
    } else {
        let (producer, mut inbox) = inbox();
        let launch = EngineLaunch {
            program: config.engine.clone(),
            args: vec![config.database.clone()],
            quit_command: config.quit_command.clone(),
            grace: config.timeouts.shutdown_grace(),
        };
        let mut engine = EngineProcess::spawn(launch, producer)?;
        info!(run_tag = sentinels.run_tag(), pending, "engine session open");

        let outcome = drive_session(&mut correlator, &mut engine, &mut inbox, &mut sink, &plan, config);
        let shutdown = engine.shutdown();
        let closed = sink.close();
        let interrupted = match outcome {
            Ok(interrupted) => interrupted,
            Err(err) => {
                save_failures_before_abort(config, correlator.failures());
                return Err(err);
            }
        };
        shutdown?;
        closed?;
        interrupted
    };

    let mut report = correlator.into_report(config.output.clone(), config.mode, interrupted);
    if !report.failures.is_empty() {
        let path = config.failure_details_path();
        write_failure_details(&path, &report.failures)?;
        report.failure_details = Some(path);
    }
    info!(
        completed = report.stats.completed,
        failed = report.stats.failed,
        stalled = report.stats.stalled,
        metrics = report.stats.metrics_recorded,
        interrupted,
        "run finished"
    );
    Ok(report)
}

/// A fatal error still leaves the per-query failures seen so far on disk.
fn save_failures_before_abort(config: &HarnessConfig, failures: &[QueryFailure]) {
    if failures.is_empty() {
        return;
    }
    let path = config.failure_details_path();
    match write_failure_details(&path, failures) {
        Ok(()) => warn!(
            failures = failures.len(),
            path = %path.display(),
            "run aborted; failed query details saved"
        ),
        Err(e) => warn!(error = %e, path = %path.display(), "could not save failed query details"),
    }
}

fn drive_session<E: EngineIo>(
    correlator: &mut Correlator<'_>,
    engine: &mut E,
    inbox: &mut Inbox,
    sink: &mut CheckpointSink,
    plan: &[QueryUnit],
    config: &HarnessConfig,
) -> Result<bool> {
    if !config.skip_load {
        let statements = config.cold_start_statements();
        if !correlator.initialize(engine, inbox, &statements)? {
            return Ok(true);
        }
    }
    correlator.drive(engine, inbox, sink, plan)
}
