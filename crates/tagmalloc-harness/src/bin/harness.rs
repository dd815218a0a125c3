//! CLI entrypoint for the tagmalloc workload harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use tagmalloc_harness::{StormConfig, StormReport, StormType, run_storm};

/// Workload tooling for the tagmalloc allocator.
#[derive(Debug, Parser)]
#[command(name = "tagmalloc-harness")]
#[command(about = "Allocator workload storms and reports")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single storm and print its report.
    Run {
        /// Storm pattern (sawtooth, random_churn, size_class_thrash,
        /// mapped_heavy).
        #[arg(long, default_value = "random_churn")]
        storm: String,
        /// Operations to execute.
        #[arg(long, default_value_t = 100_000)]
        ops: usize,
        /// Live-slot table size.
        #[arg(long, default_value_t = 512)]
        slots: usize,
        /// Generator seed (decimal or 0x-prefixed).
        #[arg(long, default_value = "0xDEADBEEF")]
        seed: String,
        /// Emit JSON instead of markdown.
        #[arg(long)]
        json: bool,
        /// Also write the JSON report to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Run every storm pattern and print a combined markdown report.
    All {
        /// Operations per storm.
        #[arg(long, default_value_t = 50_000)]
        ops: usize,
        /// Generator seed.
        #[arg(long, default_value = "0xDEADBEEF")]
        seed: String,
        /// Also write the combined JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn parse_seed(s: &str) -> u64 {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16).unwrap_or(0xDEAD_BEEF)
    } else {
        s.parse().unwrap_or(0xDEAD_BEEF)
    }
}

fn write_report(path: &PathBuf, json: &str) {
    if let Err(err) = std::fs::write(path, json) {
        eprintln!("failed to write report to {}: {err}", path.display());
        std::process::exit(1);
    }
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            storm,
            ops,
            slots,
            seed,
            json,
            report,
        } => {
            let Some(storm) = StormType::from_str_loose(&storm) else {
                eprintln!("unknown storm pattern: {storm}");
                std::process::exit(2);
            };
            let result = run_storm(StormConfig {
                storm,
                seed: parse_seed(&seed),
                ops,
                slots,
            });
            if let Some(path) = report {
                write_report(&path, &result.to_json());
            }
            if json {
                println!("{}", result.to_json());
            } else {
                println!("{}", result.to_markdown());
            }
        }
        Command::All { ops, seed, report } => {
            let seed = parse_seed(&seed);
            let mut reports: Vec<StormReport> = Vec::new();
            for storm in StormType::all() {
                reports.push(run_storm(StormConfig {
                    storm,
                    seed,
                    ops,
                    slots: 512,
                }));
            }
            if let Some(path) = report {
                let json = serde_json::to_string_pretty(&reports)
                    .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
                write_report(&path, &json);
            }
            println!("# tagmalloc storm report\n");
            for r in &reports {
                println!("{}", r.to_markdown());
            }
        }
    }
}
