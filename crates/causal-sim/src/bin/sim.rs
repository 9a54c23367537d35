#![forbid(unsafe_code)]

use std::env;
use std::process::ExitCode;

use anyhow::Result;
use causal_sim::campaign::{CampaignConfig, replay_seed, run_campaign};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Deterministic simulation of causal event store replicas",
    long_about = None
)]
struct Cli {
    /// Replicas per simulation.
    #[arg(long, default_value_t = 3)]
    replicas: usize,

    /// Rounds per simulation.
    #[arg(long, default_value_t = 24)]
    rounds: u64,

    /// Print reports as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every seed in `[start, end)` and report failures.
    Campaign {
        #[arg(long, default_value_t = 0)]
        start: u64,
        #[arg(long, default_value_t = 100)]
        end: u64,
    },
    /// Re-run one seed and print its trace and oracle verdict.
    Replay { seed: u64 },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CAUSAL_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "causal_sim=debug,causal_core=debug,info"
        } else {
            "causal_sim=info,warn"
        })
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = CampaignConfig {
        replica_count: cli.replicas,
        rounds: cli.rounds,
        ..CampaignConfig::default()
    };

    match cli.command {
        Command::Campaign { start, end } => {
            config.seed_range = start..end;
            let report = run_campaign(&config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "campaign complete: seeds={} passed={} interesting={}",
                    report.seeds_run, report.seeds_passed, report.interesting_states_reached
                );
                for failure in &report.failures {
                    println!("seed {} failed:", failure.seed);
                    for violation in &failure.violations {
                        println!("  {violation}");
                    }
                }
            }
            Ok(if report.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Replay { seed } => {
            config.seed_range = seed..seed.saturating_add(1);
            let trace = replay_seed(seed, &config)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&trace.result.trace)?);
            } else {
                for entry in &trace.result.trace {
                    println!("{:>4} {:?}", entry.round, entry.kind);
                }
                println!(
                    "replay complete: seed={seed} events={} passed={}",
                    trace.result.authored_keys().len(),
                    trace.oracle.passed
                );
                for violation in &trace.oracle.violations {
                    println!("  {violation}");
                }
            }
            Ok(if trace.oracle.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
