//! Telemetry Animator Simulator CLI
//!
//! Run deterministic simulation scenarios against the animators.

use clap::Parser;
use telemetry_sim::scenarios::ScenarioId;
use telemetry_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Telemetry animator deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "telemetry-sim")]
#[command(about = "Run deterministic simulation scenarios for the telemetry animators", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,
    
    /// Scenario to run (playback, scrub, reverse_chunks, live_stream, look_ahead, joined, scrub_storm, all, standard)
    #[arg(short = 'S', long, default_value = "standard")]
    scenario: String,
    
    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,
    
    /// Recording length in seconds
    #[arg(short, long, default_value = "10")]
    duration: f64,
    
    /// Chunk size in seconds for buffered scenarios
    #[arg(long, default_value = "1.0")]
    chunk_size: f64,
    
    /// Maximum source latency in scheduler yields
    #[arg(long, default_value = "8")]
    latency: u32,
    
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
    
    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
    
    /// Export sampled states of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn parse_scenarios(name: &str) -> Result<Vec<ScenarioId>, String> {
    match name {
        "all" => Ok(ScenarioId::all()),
        "standard" => Ok(ScenarioId::standard()),
        other => other.parse().map(|scenario| vec![scenario]),
    }
}

fn print_json(results: &[ScenarioResult], failed: usize) {
    let summary = serde_json::json!({
        "total": results.len(),
        "passed": results.len() - failed,
        "failed": failed,
        "results": results.iter().map(|r| {
            serde_json::json!({
                "scenario": r.scenario.name(),
                "seed": r.seed,
                "passed": r.passed,
                "ticks": r.total_ticks,
                "checks": r.checks,
                "time_secs": r.final_time_secs,
                "failure_reason": r.failure_reason,
                "metrics": r.metrics,
            })
        }).collect::<Vec<_>>(),
    });
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Failed to serialize summary: {e}"),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    
    // Initialize logging; RUST_LOG overrides --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
    
    if !args.json {
        info!("Telemetry Animator Simulator v0.1.0");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
    
    let scenarios = parse_scenarios(&args.scenario).unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        eprintln!("Available scenarios: {}, all, standard", ScenarioId::all().iter().map(ScenarioId::name).collect::<Vec<_>>().join(", "));
        std::process::exit(1);
    });
    
    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };
    
    let runner_for = |seed: u64| {
        ScenarioRunner::new(seed)
            .with_duration(args.duration)
            .with_chunk_size(args.chunk_size)
            .with_max_latency(args.latency)
    };
    
    // Handle --export mode
    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario");
            std::process::exit(1);
        }
        let scenario = scenarios[0];
        let (result, export) = runner_for(base_seed).run_with_export(scenario).await;
        match export.write_to_file(export_path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), export_path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
        if result.passed {
            info!("✓ {} (seed={}) PASSED - exported to {}", scenario.name(), base_seed, export_path);
        } else {
            error!(
                "✗ {} FAILED: {}",
                scenario.name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
            std::process::exit(1);
        }
        return;
    }
    
    let mut all_results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;
    
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = runner_for(seed);
        
        for scenario in &scenarios {
            let result = runner.run(*scenario).await;
            
            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED [{} checks, {} fetches, {} cancelled]",
                        scenario.name(),
                        seed,
                        result.checks,
                        result.metrics.chunk_fetches,
                        result.metrics.chunk_cancellations
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            
            if !result.passed {
                failed_count += 1;
            }
            all_results.push(result);
        }
    }
    
    let total = all_results.len();
    if args.json {
        print_json(&all_results, failed_count);
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }
    
    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
