pub mod config;
pub mod corpus;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod fsutil;
pub mod harness;
pub mod inbox;
pub mod liveness;
pub mod protocol;
pub mod search;
pub mod sink;
pub mod stats;

pub use config::{HarnessConfig, Timeouts, Workload};
pub use corpus::{load_corpus, parse_corpus, summarize_corpus, CorpusSummary, QueryUnit};
pub use error::{HarnessError, Result};
pub use harness::{run_harness, QueryOutcome, RunReport, RunStats};
pub use search::{Orchestrator, SearchSpace, TrialRecord, TuneConfig, TuneReport};
pub use sink::{MetricMode, SinkMode};
pub use stats::QErrorSummary;
