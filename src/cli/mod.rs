pub mod config;
pub mod validate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "volley")]
#[command(about = "Scenario-driven HTTP load generation engine", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scenario document
    Run {
        /// Path to the scenario document (YAML or JSON)
        scenario: PathBuf,

        /// Base URL of the system under test, overrides `baseUrl`
        #[arg(long, env = "BASE_URL")]
        base_url: Option<String>,

        /// Seed for every VU's random number generator
        #[arg(long)]
        seed: Option<u64>,

        /// Print the final report as JSON instead of the text summary
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export the final report to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,
    },
    /// Validate a scenario document without running it
    Validate {
        /// Path to the scenario document
        scenario: PathBuf,
    },
    /// Print the JSON Schema of the scenario document
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Load `KEY=value` lines from the first `.env` found next to the scenario
/// document or in the working directory. Variables already set are kept.
pub fn load_dotenv(scenario: &std::path::Path) {
    let script_dir = scenario.parent().unwrap_or(std::path::Path::new("."));
    let env_paths = [script_dir.join(".env"), PathBuf::from(".env")];
    let Some(path) = env_paths.iter().find(|p| p.exists()) else {
        return;
    };
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "could not read .env");
            return;
        }
    };
    for (key, value) in parse_dotenv(&contents) {
        if std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
    tracing::debug!(path = %path.display(), "loaded .env");
}

fn parse_dotenv(contents: &str) -> impl Iterator<Item = (&str, &str)> {
    contents.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=')?;
        Some((key.trim(), value.trim().trim_matches('"').trim_matches('\'')))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "volley",
            "run",
            "load.yaml",
            "--base-url",
            "http://api:9000",
            "--seed",
            "7",
            "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                scenario,
                base_url,
                seed,
                json,
                export_json,
            } => {
                assert_eq!(scenario, PathBuf::from("load.yaml"));
                assert_eq!(base_url.as_deref(), Some("http://api:9000"));
                assert_eq!(seed, Some(7));
                assert!(json);
                assert!(export_json.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_dotenv() {
        let parsed: Vec<_> = parse_dotenv(
            "# comment\nBASE_URL=\"http://staging:8080\"\n\nexport TOKEN='abc'\nbroken line\n",
        )
        .collect();
        assert_eq!(
            parsed,
            vec![("BASE_URL", "http://staging:8080"), ("TOKEN", "abc")]
        );
    }
}
