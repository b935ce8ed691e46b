//! plan-race - deterministic double-checked plan cache race reproduction
//!
//! Exit codes: 0 pass, 1 detected race, 2 unexpected error, 3 harness
//! timeout, 4 other harness failure, 64 invalid configuration.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use plan_race_core::{
    BoundParameter, Error, HarnessConfig, ReproContext, SlotMode, write_artifact,
};
use plan_race_harness::{RaceHarness, RaceVerdict, RepeatSummary, RunReport};
use tracing_subscriber::EnvFilter;

const REPORT_FILENAME: &str = "plan-race-report.json";

#[derive(Parser)]
#[command(name = "plan-race")]
#[command(
    version,
    about = "Reproduce the double-checked plan cache race deterministically"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reproduction (default)
    Reproduce(ReproduceArgs),

    /// Show the resolved configuration
    Config,
}

#[derive(Args, Debug, Default, Clone)]
struct ReproduceArgs {
    /// Offset for worker A
    #[arg(long)]
    param_a: Option<u64>,

    /// Offset for worker B
    #[arg(long)]
    param_b: Option<u64>,

    /// Comma separated offsets, one workload each
    #[arg(long, value_delimiter = ',', conflicts_with_all = ["param_a", "param_b"])]
    params: Option<Vec<u64>>,

    /// Cache implementation under test
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Upper bound for any single barrier wait
    #[arg(long)]
    barrier_timeout_ms: Option<u64>,

    /// Upper bound for collecting all outcomes
    #[arg(long)]
    run_timeout_ms: Option<u64>,

    /// Do not hold the build lock until the next workload blocks on it
    #[arg(long)]
    no_handshake: bool,

    /// Run this many times and report verdict counts
    #[arg(long)]
    repeat: Option<usize>,

    /// Print a JSON report instead of the human summary
    #[arg(long)]
    json: bool,

    /// Also write the JSON report into this directory
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ModeArg {
    Defective,
    Corrected,
}

impl From<ModeArg> for SlotMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Defective => Self::Defective,
            ModeArg::Corrected => Self::Corrected,
        }
    }
}

/// Layer command-line flags over an environment-derived config.
fn apply_overrides(config: &mut HarnessConfig, args: &ReproduceArgs) -> Result<(), Error> {
    if let Some(mode) = args.mode {
        config.mode = mode.into();
        config.set_cli_source("mode");
    }
    if let Some(params) = &args.params {
        config.params = params.iter().copied().map(BoundParameter).collect();
        config.set_cli_source("params");
    }
    for (index, value) in [(0, args.param_a), (1, args.param_b)] {
        let Some(value) = value else { continue };
        if config.params.len() <= index {
            config.params.resize(index + 1, BoundParameter(0));
        }
        config.params[index] = BoundParameter(value);
        config.set_cli_source("params");
    }
    if let Some(ms) = args.barrier_timeout_ms {
        config.barrier_timeout = Duration::from_millis(ms);
        config.set_cli_source("barrier_timeout");
    }
    if let Some(ms) = args.run_timeout_ms {
        config.run_timeout = Duration::from_millis(ms);
        config.set_cli_source("run_timeout");
    }
    if args.no_handshake {
        config.contention_handshake = false;
        config.set_cli_source("contention_handshake");
    }
    config.validate()
}

fn load_config(args: &ReproduceArgs) -> Result<HarnessConfig, Error> {
    let mut config = HarnessConfig::from_env()?;
    apply_overrides(&mut config, args)?;
    Ok(config)
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        None => run_reproduce(&ReproduceArgs::default(), cli.verbose),
        Some(Commands::Reproduce(args)) => run_reproduce(&args, cli.verbose),
        Some(Commands::Config) => run_config(),
    };
    std::process::exit(code);
}

fn run_config() -> i32 {
    match HarnessConfig::from_env() {
        Ok(config) => {
            println!("plan-race configuration:");
            for line in config.summary_lines() {
                println!("  {line}");
            }
            0
        }
        Err(err) => {
            eprintln!("Error: {err}");
            err.exit_code()
        }
    }
}

fn run_reproduce(args: &ReproduceArgs, verbose: bool) -> i32 {
    let config = match load_config(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return err.exit_code();
        }
    };

    let harness = RaceHarness::new(config);
    if let Some(runs) = args.repeat {
        return run_repeated(&harness, runs, args);
    }

    match harness.run() {
        Ok(mut report) => {
            let env_filter = std::env::var("RUST_LOG").ok();
            record_log_filter(&mut report.context, env_filter.as_deref(), verbose);
            let verdict = RaceVerdict::from_run(Ok(&report));
            let json = serde_json::json!({
                "verdict": &verdict,
                "report": &report,
                "repro_command": report.context.repro_command(),
            });
            emit(&json, args, || print_report(&report, &verdict));
            verdict.exit_code()
        }
        Err(err) => {
            let err = Error::from(err);
            let verdict = RaceVerdict::from_error(&err);
            let json = serde_json::json!({ "verdict": &verdict });
            emit(&json, args, || eprintln!("Error: {err}"));
            verdict.exit_code()
        }
    }
}

fn run_repeated(harness: &RaceHarness, runs: usize, args: &ReproduceArgs) -> i32 {
    let params = harness.config().params.clone();
    match harness.reproduce_repeated(&params, runs) {
        Ok(summary) => {
            let json = serde_json::json!({ "repeat": &summary });
            emit(&json, args, || print_summary(&summary));
            repeat_exit_code(&summary)
        }
        Err(err) => {
            let err = Error::from(err);
            eprintln!("Error: {err}");
            err.exit_code()
        }
    }
}

/// Carry the log filter into the repro line so a replay logs the same way.
fn record_log_filter(context: &mut ReproContext, env_filter: Option<&str>, verbose: bool) {
    match env_filter.filter(|f| !f.trim().is_empty()) {
        Some(filter) => context.add_extra("RUST_LOG", filter),
        None if verbose => context.add_extra("RUST_LOG", "debug"),
        None => {}
    }
}

const fn repeat_exit_code(summary: &RepeatSummary) -> i32 {
    if summary.unexpected > 0 {
        2
    } else if summary.races > 0 {
        1
    } else {
        0
    }
}

/// Print JSON or the human form, then write the artifact if asked.
fn emit(json: &serde_json::Value, args: &ReproduceArgs, human: impl FnOnce()) {
    if args.json {
        match serde_json::to_string_pretty(json) {
            Ok(text) => println!("{text}"),
            Err(err) => eprintln!("Error: failed to render JSON report: {err}"),
        }
    } else {
        human();
    }
    if let Some(dir) = &args.report_dir {
        write_report(dir, json);
    }
}

fn write_report(dir: &Path, json: &serde_json::Value) {
    if let Err(err) = write_artifact(dir, REPORT_FILENAME, json) {
        eprintln!("Error: failed to write report: {err}");
    }
}

fn print_report(report: &RunReport, verdict: &RaceVerdict) {
    println!(
        "mode={} key={} release_order={}",
        report.context.mode,
        report.context.key,
        report
            .context
            .release_order
            .iter()
            .map(|w| w.label())
            .collect::<Vec<_>>()
            .join(",")
    );
    for outcome in &report.outcomes {
        let observed = outcome
            .observed
            .map_or_else(|| "-".to_string(), |o| o.to_string());
        let path = outcome.path.map_or("-", |p| p.as_str());
        let mut line = format!(
            "  {} supplied={} observed={observed} path={path}",
            outcome.worker, outcome.supplied
        );
        if outcome.won_build {
            line.push_str(" won-build");
        }
        if outcome.contended {
            line.push_str(" contended");
        }
        if let Some(failure) = &outcome.failure {
            line.push_str(&format!(" failure=\"{}\"", failure.message()));
        }
        println!("{line}");
    }
    match verdict {
        RaceVerdict::Pass => println!("PASS"),
        RaceVerdict::Fail(failure) => {
            println!("FAIL [{}] {}", failure.error_type, failure.detail);
        }
    }
    println!("repro: {}", report.context.repro_command());
}

fn print_summary(summary: &RepeatSummary) {
    println!(
        "runs={} passes={} races={} unexpected={} deterministic={}",
        summary.runs,
        summary.passes,
        summary.races,
        summary.unexpected,
        summary.is_deterministic()
    );
    if let Some(report) = &summary.first_race {
        println!("first race: {report}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid command line")
    }

    fn reproduce_args(args: &[&str]) -> ReproduceArgs {
        match parse(args).command {
            Some(Commands::Reproduce(args)) => args,
            other => panic!("expected reproduce, got {other:?}"),
        }
    }

    #[test]
    fn log_filter_lands_in_repro_command() {
        let config = HarnessConfig::default();

        let mut ctx = ReproContext::from_config(&config, Vec::new());
        record_log_filter(&mut ctx, None, true);
        assert!(ctx.repro_command().contains("RUST_LOG=debug"));

        let mut ctx = ReproContext::from_config(&config, Vec::new());
        record_log_filter(&mut ctx, Some("plan_race_cache=trace"), true);
        assert_eq!(
            ctx.extra,
            vec![("RUST_LOG".to_string(), "plan_race_cache=trace".to_string())]
        );

        let mut ctx = ReproContext::from_config(&config, Vec::new());
        record_log_filter(&mut ctx, Some("  "), false);
        assert!(ctx.extra.is_empty());
    }

    #[test]
    fn bare_invocation_defaults_to_reproduce() {
        let cli = parse(&["plan-race"]);
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
    }

    #[test]
    fn reproduce_flags_parse() {
        let args = reproduce_args(&[
            "plan-race",
            "reproduce",
            "--param-a",
            "40",
            "--mode",
            "corrected",
            "--barrier-timeout-ms",
            "250",
            "--json",
        ]);
        assert_eq!(args.param_a, Some(40));
        assert_eq!(args.mode, Some(ModeArg::Corrected));
        assert_eq!(args.barrier_timeout_ms, Some(250));
        assert!(args.json);
    }

    #[test]
    fn params_list_conflicts_with_single_params() {
        assert!(
            Cli::try_parse_from(["plan-race", "reproduce", "--params", "1,2", "--param-a", "3"])
                .is_err()
        );
        let args = reproduce_args(&["plan-race", "reproduce", "--params", "5,40,10"]);
        assert_eq!(args.params, Some(vec![5, 40, 10]));
    }

    #[test]
    fn verbose_is_global() {
        let cli = parse(&["plan-race", "reproduce", "-v"]);
        assert!(cli.verbose);
    }

    #[test]
    fn overrides_replace_env_values() {
        let mut config = HarnessConfig::default();
        let args = ReproduceArgs {
            param_b: Some(60),
            mode: Some(ModeArg::Corrected),
            run_timeout_ms: Some(500),
            no_handshake: true,
            ..ReproduceArgs::default()
        };
        apply_overrides(&mut config, &args).unwrap();

        assert_eq!(config.mode, SlotMode::Corrected);
        assert_eq!(config.params, vec![BoundParameter(20), BoundParameter(60)]);
        assert_eq!(config.run_timeout, Duration::from_millis(500));
        assert!(!config.contention_handshake);
        assert_eq!(
            config.source("mode"),
            plan_race_core::ConfigSource::CliArg
        );
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = HarnessConfig::default();
        let args = ReproduceArgs {
            barrier_timeout_ms: Some(0),
            ..ReproduceArgs::default()
        };
        let err = apply_overrides(&mut config, &args).unwrap_err();
        assert_eq!(err.exit_code(), 64);
    }

    #[test]
    fn repeat_exit_codes() {
        let mut summary = RepeatSummary {
            runs: 3,
            passes: 3,
            ..RepeatSummary::default()
        };
        assert_eq!(repeat_exit_code(&summary), 0);
        summary.passes = 1;
        summary.races = 2;
        assert_eq!(repeat_exit_code(&summary), 1);
        summary.unexpected = 1;
        assert_eq!(repeat_exit_code(&summary), 2);
    }

    #[test]
    fn report_is_written_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({ "verdict": RaceVerdict::Pass });
        write_report(dir.path(), &json);
        let written = std::fs::read_to_string(dir.path().join(REPORT_FILENAME)).unwrap();
        assert!(written.contains("\"pass\""));
    }
}
