//! Q-error summaries: the percentile triple printed at the end of a run and
//! parsed back by the search orchestrator.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::protocol::MetricEvent;

/// Percentile with linear interpolation between closest ranks, `p` in
/// `[0, 100]`. `sorted` must be ascending.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QErrorSummary {
    pub median: f64,
    pub p90: f64,
    pub p95: f64,
}

impl QErrorSummary {
    /// Non-finite samples are ignored; `None` when nothing remains.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            median: percentile(&sorted, 50.0)?,
            p90: percentile(&sorted, 90.0)?,
            p95: percentile(&sorted, 95.0)?,
        })
    }

    /// Lexicographic on `(median, p90, p95)`, lower first.
    pub fn rank_cmp(&self, other: &Self) -> Option<Ordering> {
        (self.median, self.p90, self.p95).partial_cmp(&(other.median, other.p90, other.p95))
    }

    /// Strictly better; ties keep the incumbent.
    pub fn is_better_than(&self, other: &Self) -> bool {
        self.rank_cmp(other) == Some(Ordering::Less)
    }

    /// `RL   : median=1.23  p90=4.56  p95=7.89`
    pub fn format_line(&self, label: &str) -> String {
        format!(
            "{:<5}: median={:.2}  p90={:.2}  p95={:.2}",
            label, self.median, self.p90, self.p95
        )
    }
}

fn summary_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        RegexBuilder::new(r"^RL\s*:\s*median=([\d.]+)\s+p90=([\d.]+)\s+p95=([\d.]+)\s*$")
            .case_insensitive(true)
            .build()
            .ok()
    })
    .as_ref()
}

/// Last learned-model summary line in `output`, if any.
pub fn parse_summary(output: &str) -> Option<QErrorSummary> {
    let re = summary_re()?;
    output.lines().rev().find_map(|line| {
        let caps = re.captures(line.trim())?;
        Some(QErrorSummary {
            median: caps.get(1)?.as_str().parse().ok()?,
            p90: caps.get(2)?.as_str().parse().ok()?,
            p95: caps.get(3)?.as_str().parse().ok()?,
        })
    })
}

/// Q-errors observed during one run.
#[derive(Debug, Default, Clone)]
pub struct QErrorCollector {
    learned: Vec<f64>,
    baseline: Vec<f64>,
}

impl QErrorCollector {
    pub fn observe(&mut self, metric: &MetricEvent) {
        self.learned.push(metric.learned_q_error());
        if let Some(b) = metric.baseline_q_error() {
            self.baseline.push(b);
        }
    }

    pub fn samples(&self) -> usize {
        self.learned.len()
    }

    pub fn learned(&self) -> Option<QErrorSummary> {
        QErrorSummary::from_values(&self.learned)
    }

    pub fn baseline(&self) -> Option<QErrorSummary> {
        QErrorSummary::from_values(&self.baseline)
    }
}
