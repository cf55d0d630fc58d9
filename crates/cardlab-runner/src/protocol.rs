//! Engine output grammar.
//!
//! The engine has no structured output channel; everything the harness
//! learns comes from free-form log lines. The patterns below are the wire
//! contract with the engine build and live in one ordered table: the first
//! rule that matches a line decides its event, and a line no rule matches
//! produces nothing.

use regex::{Captures, Regex};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum Prediction {
    /// One model estimate per operator.
    Single { predicted: u64, q_error: f64 },
    /// Learned estimate next to the engine's built-in estimate.
    Dual {
        learned: u64,
        baseline: u64,
        learned_q_error: f64,
        baseline_q_error: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEvent {
    pub operator: String,
    pub actual: u64,
    pub prediction: Prediction,
}

impl MetricEvent {
    pub fn learned_q_error(&self) -> f64 {
        match self.prediction {
            Prediction::Single { q_error, .. } => q_error,
            Prediction::Dual {
                learned_q_error, ..
            } => learned_q_error,
        }
    }

    pub fn baseline_q_error(&self) -> Option<f64> {
        match self.prediction {
            Prediction::Single { .. } => None,
            Prediction::Dual {
                baseline_q_error, ..
            } => Some(baseline_q_error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateEvent {
    pub sequence: u64,
    pub sample_count: u64,
    pub model_size: u64,
    pub rolling_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    QueryComplete { position: u64, query_id: u64 },
    QueryError { message: String },
    Metric(MetricEvent),
    Update(UpdateEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Sentinel,
    Error,
    DualMetric,
    SingleMetric,
    Update,
}

const OPERATOR: &str = r"\[RL TRAINING\] ([A-Z_]+(?:\s+[A-Z_]+)?)\s*:\s*Actual=(\d+),\s*";
const DUAL_TAIL: &str =
    r"RLPred=(\d+),\s*DuckPred=(\d+),\s*RLQerr=([\d.]+),\s*DuckQerr=([\d.]+)";
const SINGLE_TAIL: &str = r"Pred=(\d+),\s*Q-err=([\d.]+)";
const UPDATE: &str = r"\[RL BOOSTING\] Incremental update #(\d+): trained on (\d+) samples, total trees=(\d+), avg Q-error=([\d.]+)";
const ERROR: &str = r"Error:|ERROR:";

/// Sentinel strings for one run. The run tag keeps sentinels from an earlier
/// run against the same engine session from ever matching.
#[derive(Debug, Clone)]
pub struct Sentinels {
    run_tag: String,
}

impl Sentinels {
    pub fn new(run_tag: impl Into<String>) -> Self {
        Self {
            run_tag: run_tag.into(),
        }
    }

    /// Random 8-hex-digit tag.
    pub fn random() -> Self {
        Self::new(format!("{:08x}", rand::random::<u32>()))
    }

    pub fn run_tag(&self) -> &str {
        &self.run_tag
    }

    pub fn completion(&self, position: u64, query_id: u64) -> String {
        format!(
            "QUERY_COMPLETE_{}_{}_{}_EOQ",
            self.run_tag, position, query_id
        )
    }

    pub fn init(&self) -> String {
        format!("CARDLAB_INIT_COMPLETE_{}", self.run_tag)
    }
}

/// The ordered rule table.
pub struct LineGrammar {
    rules: Vec<(RuleKind, Regex)>,
}

impl LineGrammar {
    pub fn new(sentinels: &Sentinels) -> Result<Self, regex::Error> {
        let sentinel = format!(
            r"QUERY_COMPLETE_{}_(\d+)_(\d+)_EOQ",
            regex::escape(sentinels.run_tag())
        );
        let rules = vec![
            (RuleKind::Sentinel, Regex::new(&sentinel)?),
            (RuleKind::Error, Regex::new(ERROR)?),
            (
                RuleKind::DualMetric,
                Regex::new(&format!("{OPERATOR}{DUAL_TAIL}"))?,
            ),
            (
                RuleKind::SingleMetric,
                Regex::new(&format!("{OPERATOR}{SINGLE_TAIL}"))?,
            ),
            (RuleKind::Update, Regex::new(UPDATE)?),
        ];
        Ok(Self { rules })
    }

    /// Maps one output line to at most one event. Never panics; a rule whose
    /// captures fail to convert (e.g. an out-of-range count) is treated as not
    /// matching and the next rule is tried.
    pub fn classify(&self, line: &str) -> Option<Event> {
        self.rules.iter().find_map(|(kind, regex)| {
            let caps = regex.captures(line)?;
            build_event(*kind, line, &caps)
        })
    }
}

fn int(caps: &Captures<'_>, idx: usize) -> Option<u64> {
    caps.get(idx)?.as_str().parse().ok()
}

fn float(caps: &Captures<'_>, idx: usize) -> Option<f64> {
    caps.get(idx)?.as_str().parse().ok()
}

fn build_event(kind: RuleKind, line: &str, caps: &Captures<'_>) -> Option<Event> {
    match kind {
        RuleKind::Sentinel => Some(Event::QueryComplete {
            position: int(caps, 1)?,
            query_id: int(caps, 2)?,
        }),
        RuleKind::Error => Some(Event::QueryError {
            message: line.trim().to_string(),
        }),
        RuleKind::DualMetric => Some(Event::Metric(MetricEvent {
            operator: caps.get(1)?.as_str().trim().to_string(),
            actual: int(caps, 2)?,
            prediction: Prediction::Dual {
                learned: int(caps, 3)?,
                baseline: int(caps, 4)?,
                learned_q_error: float(caps, 5)?,
                baseline_q_error: float(caps, 6)?,
            },
        })),
        RuleKind::SingleMetric => Some(Event::Metric(MetricEvent {
            operator: caps.get(1)?.as_str().trim().to_string(),
            actual: int(caps, 2)?,
            prediction: Prediction::Single {
                predicted: int(caps, 3)?,
                q_error: float(caps, 4)?,
            },
        })),
        RuleKind::Update => Some(Event::Update(UpdateEvent {
            sequence: int(caps, 1)?,
            sample_count: int(caps, 2)?,
            model_size: int(caps, 3)?,
            rolling_error: float(caps, 4)?,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar() -> LineGrammar {
        LineGrammar::new(&Sentinels::new("0badf00d")).expect("grammar compiles")
    }

    #[test]
    fn classifies_dual_training_line() {
        let line = "[RL TRAINING] HASH_JOIN: Actual=1200, RLPred=1100, DuckPred=40, RLQerr=1.09, DuckQerr=30.00";
        match grammar().classify(line) {
            Some(Event::Metric(m)) => {
                assert_eq!(m.operator, "HASH_JOIN");
                assert_eq!(m.actual, 1200);
                assert_eq!(
                    m.prediction,
                    Prediction::Dual {
                        learned: 1100,
                        baseline: 40,
                        learned_q_error: 1.09,
                        baseline_q_error: 30.0
                    }
                );
                assert_eq!(m.baseline_q_error(), Some(30.0));
            }
            other => panic!("expected metric, got {:?}", other),
        }
    }

    #[test]
    fn classifies_single_training_line_with_two_word_operator() {
        let line = "[RL TRAINING] SEQ SCAN : Actual=10, Pred=12, Q-err=1.200";
        match grammar().classify(line) {
            Some(Event::Metric(m)) => {
                assert_eq!(m.operator, "SEQ SCAN");
                assert_eq!(
                    m.prediction,
                    Prediction::Single {
                        predicted: 12,
                        q_error: 1.2
                    }
                );
                assert_eq!(m.learned_q_error(), 1.2);
                assert_eq!(m.baseline_q_error(), None);
            }
            other => panic!("expected metric, got {:?}", other),
        }
    }

    #[test]
    fn classifies_update_line() {
        let line = "[RL BOOSTING] Incremental update #7: trained on 256 samples, total trees=70, avg Q-error=3.141500";
        assert_eq!(
            grammar().classify(line),
            Some(Event::Update(UpdateEvent {
                sequence: 7,
                sample_count: 256,
                model_size: 70,
                rolling_error: 3.1415
            }))
        );
    }

    #[test]
    fn sentinel_carries_position_and_query_id() {
        let sentinels = Sentinels::new("0badf00d");
        let line = format!("│ {} │", sentinels.completion(3, 42));
        assert_eq!(
            grammar().classify(&line),
            Some(Event::QueryComplete {
                position: 3,
                query_id: 42
            })
        );
    }

    #[test]
    fn sentinel_from_another_run_is_not_a_completion() {
        let other = Sentinels::new("deadbeef");
        assert_eq!(grammar().classify(&other.completion(1, 1)), None);
    }

    #[test]
    fn sentinel_wins_over_error_rule() {
        let line = format!(
            "ERROR: {}",
            Sentinels::new("0badf00d").completion(1, 9)
        );
        assert!(matches!(
            grammar().classify(&line),
            Some(Event::QueryComplete { query_id: 9, .. })
        ));
    }

    #[test]
    fn error_lines_become_query_errors() {
        assert_eq!(
            grammar().classify("  Binder Error: Referenced column \"x\" not found  "),
            Some(Event::QueryError {
                message: "Binder Error: Referenced column \"x\" not found".to_string()
            })
        );
        assert!(matches!(
            grammar().classify("ERROR: out of memory"),
            Some(Event::QueryError { .. })
        ));
    }

    #[test]
    fn boosting_diagnostics_are_not_errors() {
        assert_eq!(
            grammar().classify("[RL BOOSTING ERROR] Prediction failed: bad handle"),
            None
        );
    }

    #[test]
    fn unmatched_and_hostile_input_yields_nothing() {
        let g = grammar();
        for line in [
            "",
            "┌─────────┐",
            "[RL TRAINING] Starting collection of actual cardinalities...",
            "[RL TRAINING] FILTER: Actual=99999999999999999999999, Pred=1, Q-err=1.0",
            "[RL TRAINING] FILTER: Actual=1, Pred=1, Q-err=1.2.3",
            "\u{0}\u{fffd}\u{1F600}",
        ] {
            assert_eq!(g.classify(line), None, "line: {:?}", line);
        }
    }

    #[test]
    fn random_sentinels_use_eight_hex_digits() {
        let s = Sentinels::random();
        assert_eq!(s.run_tag().len(), 8);
        assert!(s.run_tag().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(s.init().ends_with(s.run_tag()));
    }
}
