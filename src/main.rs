//! Load-gate CLI: drive traffic at an HTTP service and gate on SLO thresholds.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "loadgate")]
#[command(about = "Load generation and SLO gate for HTTP services", long_about = None)]
struct Cli {
    /// Log level
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a load test from a profile file
    Run {
        /// Path to profile YAML file
        #[arg(short, long)]
        profile: PathBuf,

        /// Override the target base URL
        #[arg(short, long)]
        base_url: Option<String>,

        /// Output format: table (default), json, csv
        #[arg(short, long, default_value = "table")]
        output: String,
    },

    /// Run a quick smoke test against a single target
    Quick {
        /// Base URL
        #[arg(short, long, default_value = "http://localhost:8080")]
        url: String,

        /// Peak virtual users
        #[arg(short, long, default_value = "5")]
        target: u32,

        /// Test duration in seconds
        #[arg(short, long, default_value = "30")]
        duration: u64,
    },

    /// List available profiles
    List {
        /// Profiles directory
        #[arg(short, long, default_value = "profiles")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level: Level = cli.log_level.parse().unwrap_or(Level::WARN);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            profile,
            base_url,
            output,
        } => {
            println!("Loading profile: {}", profile.display());

            let mut profile = match loadgate::LoadProfile::from_file(&profile) {
                Ok(p) => p,
                Err(e) => exit_config_error(e),
            };
            if let Some(url) = base_url {
                profile.base_url = url;
            }
            if let Err(e) = profile.validate() {
                exit_config_error(e);
            }

            println!("✓ Profile loaded successfully");
            println!("  Name: {}", profile.name);
            if !profile.description.is_empty() {
                println!("  Description: {}", profile.description);
            }
            println!("  Base URL: {}", profile.base_url);
            println!();

            let runner = loadgate::LoadRunner::new(profile);
            run_and_report(&runner, &output).await
        }

        Commands::Quick {
            url,
            target,
            duration,
        } => {
            println!("Running quick smoke test:");
            println!("  URL: {}", url);
            println!("  Peak VUs: {}", target);
            println!("  Duration: {}s", duration);
            println!();

            let profile = quick_profile(url, target, duration);
            let runner = loadgate::LoadRunner::new(profile);
            run_and_report(&runner, "table").await
        }

        Commands::List { dir } => {
            println!("Available profiles in {}:", dir.display());
            println!();

            match std::fs::read_dir(&dir) {
                Ok(entries) => {
                    let mut profiles = Vec::new();
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.extension().and_then(|s| s.to_str()) == Some("yaml") {
                            if let Ok(profile) = loadgate::LoadProfile::from_file(&path) {
                                profiles.push((
                                    path.file_name().unwrap().to_string_lossy().to_string(),
                                    profile.name,
                                    profile.description,
                                ));
                            }
                        }
                    }

                    profiles.sort_by(|a, b| a.0.cmp(&b.0));

                    if profiles.is_empty() {
                        println!("No profile files found");
                    } else {
                        for (filename, name, desc) in profiles {
                            println!("  {} - {}", filename, name);
                            if !desc.is_empty() {
                                println!("    {}", desc);
                            }
                            println!();
                        }
                    }
                }
                Err(e) => {
                    eprintln!("Error reading directory: {}", e);
                    eprintln!("Make sure the directory exists and is readable");
                }
            }

            Ok(())
        }
    }
}

async fn run_and_report(runner: &loadgate::LoadRunner, output: &str) -> anyhow::Result<()> {
    match runner.run().await {
        Ok(report) => {
            match output {
                "json" => println!("{}", loadgate::ResultsReport::format_json(&report)?),
                "csv" => {
                    println!("{}", loadgate::ResultsReport::csv_header());
                    println!("{}", loadgate::ResultsReport::format_csv(&report));
                }
                _ => println!("{}", loadgate::ResultsReport::format_table(&report)),
            }

            if report.verdict.overall {
                Ok(())
            } else {
                eprintln!("One or more thresholds failed");
                std::process::exit(1);
            }
        }
        Err(e @ loadgate::EngineError::SetupFailed(_)) => {
            eprintln!("Run aborted before load generation: {}", e);
            std::process::exit(2);
        }
        Err(e) => exit_config_error(e),
    }
}

fn exit_config_error(e: loadgate::EngineError) -> ! {
    eprintln!("Error: {}", e);
    std::process::exit(2);
}

fn quick_profile(url: String, target: u32, duration: u64) -> loadgate::LoadProfile {
    let ramp = (duration / 4).max(1);
    let hold = duration.saturating_sub(2 * ramp).max(1);

    loadgate::LoadProfile {
        name: "quick".to_string(),
        description: "Quick smoke test".to_string(),
        base_url: url,
        start_target: 0,
        stages: vec![
            loadgate::StageConfig {
                duration_secs: ramp,
                target,
            },
            loadgate::StageConfig {
                duration_secs: hold,
                target,
            },
            loadgate::StageConfig {
                duration_secs: ramp,
                target: 0,
            },
        ],
        think_time_ms: 405,
        create_pr_probability: 0.1,
        grace_secs: 30,
        request_timeout_secs: 30,
        seed: None,
        log_requests: false,
        team_name: "load-test-team".to_string(),
        author_id: "lt-u1".to_string(),
        members: (1..=3)
            .map(|i| loadgate::TeamMember {
                user_id: format!("lt-u{}", i),
                username: format!("LoadTestUser{}", i),
                is_active: true,
            })
            .collect(),
        thresholds: vec![
            loadgate::ThresholdConfig {
                metric: "http_req_duration".to_string(),
                rules: vec!["p(99)<300".to_string()],
            },
            loadgate::ThresholdConfig {
                metric: "errors".to_string(),
                rules: vec!["rate<0.001".to_string()],
            },
        ],
    }
}
