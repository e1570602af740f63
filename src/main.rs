use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use tokio::runtime::Runtime;
use tracing_subscriber::{fmt, EnvFilter};

use volley::cli::{load_dotenv, validate::run_validate, Cli, Commands};
use volley::engine::control::AbortReason;
use volley::engine::plan::{PlanOverrides, RunPlan};
use volley::Engine;

const ERROR_EXIT: i32 = 1;

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ERROR_EXIT
        }
    };
    std::process::exit(code);
}

/// `BASE_URL` may come from a `.env` loaded after argument parsing.
fn overrides(base_url: Option<String>, seed: Option<u64>) -> PlanOverrides {
    PlanOverrides {
        base_url: base_url.or_else(|| std::env::var("BASE_URL").ok()),
        seed,
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Run {
            scenario,
            base_url,
            seed,
            json,
            export_json,
        } => {
            load_dotenv(&scenario);
            let plan = RunPlan::load(&scenario, &overrides(base_url, seed))?;

            let rt = Runtime::new().context("starting tokio runtime")?;
            let report = rt.block_on(async move {
                let engine = Engine::with_hyper(plan)?;
                let control = engine.control();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        control.abort(AbortReason::OperatorStop);
                    }
                });
                Ok::<_, anyhow::Error>(engine.run().await)
            })?;

            if json {
                println!("{}", report.to_json()?);
            } else {
                report.print_summary();
            }
            if let Some(path) = export_json {
                std::fs::write(&path, report.to_json()?)
                    .with_context(|| format!("writing {}", path.display()))?;
                tracing::info!(path = %path.display(), "report written");
            }
            Ok(report.exit_code())
        }
        Commands::Validate { scenario } => {
            load_dotenv(&scenario);
            run_validate(&scenario, &overrides(None, None))?;
            Ok(0)
        }
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(volley::cli::config::Config);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)
                    .with_context(|| format!("writing {}", out_path.display()))?;
                println!("JSON Schema written to {}", out_path.display());
            } else {
                println!("{}", schema_json);
            }
            Ok(0)
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "volley", &mut std::io::stdout());
            Ok(0)
        }
    }
}
