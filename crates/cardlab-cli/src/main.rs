use anyhow::{Context, Result};
use cardlab_runner::{
    load_corpus, run_harness, summarize_corpus, HarnessConfig, HarnessError, MetricMode,
    Orchestrator, SearchSpace, SinkMode, TuneConfig, Workload,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(
    name = "cardlab",
    version = "0.3.0",
    about = "Learned cardinality estimation benchmark harness"
)]
struct Cli {
    /// Debug-level logging for cardlab crates.
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Only errors on stderr.
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum WorkloadArg {
    #[value(name = "tpch")]
    Tpch,
    #[value(name = "tpcds")]
    Tpcds,
    #[value(name = "custom")]
    Custom,
}

impl From<WorkloadArg> for Workload {
    fn from(value: WorkloadArg) -> Self {
        match value {
            WorkloadArg::Tpch => Workload::Tpch,
            WorkloadArg::Tpcds => Workload::Tpcds,
            WorkloadArg::Custom => Workload::Custom,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "single")]
    Single,
    #[value(name = "dual")]
    Dual,
}

impl From<ModeArg> for MetricMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Single => MetricMode::Single,
            ModeArg::Dual => MetricMode::Dual,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the query corpus through the engine and record per-operator metrics.
    Run {
        /// YAML file with base settings; flags override it.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        queries: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        engine: Option<PathBuf>,
        #[arg(long = "db")]
        database: Option<String>,
        #[arg(long, value_enum)]
        workload: Option<WorkloadArg>,
        #[arg(long = "sf")]
        scale_factor: Option<f64>,
        #[arg(long)]
        skip_load: bool,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        shuffle: bool,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, conflicts_with = "clean")]
        resume: bool,
        #[arg(long)]
        clean: bool,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long)]
        stall_timeout_secs: Option<u64>,
        #[arg(long)]
        init_timeout_secs: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Random search over engine hyperparameters, one harness run per trial.
    Tune {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        trials: Option<u64>,
        /// 0 picks a time-based seed.
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        outdir: Option<PathBuf>,
        #[arg(long)]
        resume: bool,
        #[arg(long)]
        search_space: Option<PathBuf>,
        /// Harness program; defaults to `cardlab run`.
        #[arg(long)]
        harness: Option<String>,
        #[arg(long)]
        json: bool,
        /// Arguments passed to every harness run, after `--`.
        #[arg(last = true)]
        harness_args: Vec<String>,
    },
    /// Parse a query corpus and report what the harness would run.
    Corpus {
        #[arg(long)]
        queries: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn json_mode(&self) -> bool {
        match self {
            Commands::Run { json, .. }
            | Commands::Tune { json, .. }
            | Commands::Corpus { json, .. } => *json,
        }
    }
}

struct Outcome {
    payload: Option<Value>,
    exit_code: i32,
}

impl Outcome {
    fn done(payload: Option<Value>) -> Self {
        Self {
            payload,
            exit_code: 0,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    let json_mode = cli.command.json_mode();

    let interrupt = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&interrupt)) {
            warn!(signal, error = %err, "failed to register signal handler");
        }
    }

    let code = match run_command(cli.command, &interrupt) {
        Ok(outcome) => {
            if let Some(payload) = outcome.payload {
                emit_json(&payload);
            }
            outcome.exit_code
        }
        Err(err) => {
            let harness_err = err.downcast_ref::<HarnessError>();
            let code = harness_err.map(HarnessError::exit_code).unwrap_or(1);
            if json_mode {
                let error_code = harness_err.map(HarnessError::code).unwrap_or("command_failed");
                emit_json(&json_error(
                    error_code,
                    format!("{:#}", err),
                    json!({ "exit_code": code }),
                ));
            } else {
                eprintln!("error: {:#}", err);
            }
            code
        }
    };
    std::process::exit(code);
}

fn run_command(command: Commands, interrupt: &AtomicBool) -> Result<Outcome> {
    match command {
        Commands::Run {
            config,
            queries,
            output,
            engine,
            database,
            workload,
            scale_factor,
            skip_load,
            limit,
            shuffle,
            seed,
            resume,
            clean,
            mode,
            stall_timeout_secs,
            init_timeout_secs,
            json,
        } => {
            let mut cfg = match &config {
                Some(path) => HarnessConfig::load(path)?,
                None => HarnessConfig::default(),
            };
            if let Some(v) = queries {
                cfg.queries = v;
            }
            if let Some(v) = output {
                cfg.output = v;
            }
            if let Some(v) = engine {
                cfg.engine = v;
            }
            if let Some(v) = database {
                cfg.database = v;
            }
            if let Some(v) = workload {
                cfg.workload = v.into();
            }
            if let Some(v) = scale_factor {
                cfg.scale_factor = v;
            }
            if let Some(v) = limit {
                cfg.limit = Some(v);
            }
            if let Some(v) = seed {
                cfg.seed = v;
            }
            if let Some(v) = mode {
                cfg.mode = v.into();
            }
            if let Some(v) = stall_timeout_secs {
                cfg.timeouts.stall_secs = v;
            }
            if let Some(v) = init_timeout_secs {
                cfg.timeouts.init_secs = v;
            }
            cfg.skip_load |= skip_load;
            cfg.shuffle |= shuffle;
            if clean {
                cfg.sink_mode = SinkMode::Clean;
            } else if resume {
                cfg.sink_mode = SinkMode::Resume;
            }
            debug!(?cfg, "effective harness configuration");

            let report = run_harness(&cfg, interrupt)?;
            let exit_code = if report.interrupted {
                EXIT_INTERRUPTED
            } else {
                0
            };
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": !report.interrupted,
                        "command": "run",
                        "report": report
                    })),
                    exit_code,
                });
            }
            println!("{}", report.render_text());
            Ok(Outcome {
                payload: None,
                exit_code,
            })
        }
        Commands::Tune {
            config,
            trials,
            seed,
            outdir,
            resume,
            search_space,
            harness,
            json,
            harness_args,
        } => {
            let mut cfg = match &config {
                Some(path) => TuneConfig::load(path)?,
                None => TuneConfig::default(),
            };
            if let Some(v) = trials {
                cfg.trials = v;
            }
            if let Some(v) = seed {
                cfg.seed = v;
            }
            if let Some(v) = outdir {
                cfg.outdir = v;
            }
            cfg.resume |= resume;
            if let Some(program) = harness {
                cfg.harness = vec![program];
                cfg.harness.extend(harness_args);
            } else if cfg.harness.is_empty() {
                let exe = std::env::current_exe().context("locating the cardlab binary")?;
                cfg.harness = vec![exe.display().to_string(), "run".to_string()];
                cfg.harness.extend(harness_args);
            } else {
                cfg.harness.extend(harness_args);
            }
            let space = match &search_space {
                Some(path) => SearchSpace::load(path)?,
                None => SearchSpace::default(),
            };

            let mut orchestrator = Orchestrator::new(cfg, space)?;
            let report = orchestrator.run(interrupt, |record, promoted| {
                if !json {
                    println!("{}", record.describe(promoted));
                }
            })?;
            let exit_code = if report.interrupted {
                EXIT_INTERRUPTED
            } else {
                0
            };
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": !report.interrupted,
                        "command": "tune",
                        "report": report
                    })),
                    exit_code,
                });
            }
            println!();
            println!(
                "Trials run: {} (total {}, failed {}, seed {})",
                report.trials_run, report.trials_total, report.failed, report.seed
            );
            match (&report.best, &report.best_config_path) {
                (Some(best), Some(path)) => {
                    if let Some(summary) = &best.summary {
                        println!(
                            "Best trial {}: {}",
                            best.trial_index,
                            summary.format_line("RL")
                        );
                    }
                    println!("Best configuration saved to: {}", path.display());
                    println!("Export these to reproduce it:");
                    for line in report.exports() {
                        println!("  {}", line);
                    }
                }
                _ => println!("No successful trials."),
            }
            Ok(Outcome {
                payload: None,
                exit_code,
            })
        }
        Commands::Corpus { queries, json } => {
            let units = load_corpus(&queries)?;
            let summary = summarize_corpus(&units);
            if json {
                return Ok(Outcome::done(Some(json!({
                    "ok": true,
                    "command": "corpus",
                    "path": queries.display().to_string(),
                    "summary": summary
                }))));
            }
            println!("corpus: {}", queries.display());
            println!("units: {}", summary.units);
            if let (Some(first), Some(last)) = (summary.first_id, summary.last_id) {
                println!("ids: {} .. {}", first, last);
            }
            if !summary.empty_ids.is_empty() {
                println!("empty units: {:?}", summary.empty_ids);
            }
            if !summary.duplicate_ids.is_empty() {
                println!("duplicate ids: {:?}", summary.duplicate_ids);
            }
            Ok(Outcome::done(None))
        }
    }
}

/// Filter priority: `CARDLAB_LOG` > `RUST_LOG` > `-v`/`-q` > `info`.
/// Logs go to stderr; stdout carries the run summary.
fn init_tracing(verbose: bool, quiet: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(verbose, quiet))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_env_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if let Ok(directives) = std::env::var("CARDLAB_LOG") {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let directive = if verbose {
        "info,cardlab_runner=debug,cardlab=debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}
