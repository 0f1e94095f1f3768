#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]

//! CLI for the heap comparison harness

use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use leak_profile::{HarnessConfig, Orchestrator, Phases, ProfilerKind, Rustup, SummaryReporter};

/// Compare peak heap usage of a server built with two toolchains
#[derive(Debug, Parser)]
#[command(name = "leak-profile", version)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Harness configuration file
    #[arg(short, long, value_name = "FILE", default_value = "leak-profile.toml")]
    config: PathBuf,

    /// Profiler to run the server under
    #[arg(short, long, value_enum)]
    profiler: Option<ProfilerKind>,

    /// Observation window in seconds
    #[arg(short, long, value_name = "SECS")]
    window: Option<u64>,

    /// Build and run debug binaries
    #[arg(long)]
    debug_build: bool,

    /// Keep the test project's build artifacts
    #[arg(long)]
    skip_clean: bool,

    /// Reuse existing builds
    #[arg(long)]
    skip_build: bool,

    /// Reuse existing profiler reports
    #[arg(long)]
    skip_profile: bool,

    /// Only read existing reports
    #[arg(long, conflicts_with_all = ["skip_clean", "skip_build", "skip_profile"])]
    summary_only: bool,

    /// Print the comparison as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn phases(&self) -> Phases {
        if self.summary_only {
            Phases::summary_only()
        } else {
            Phases {
                clean: !self.skip_clean,
                build: !self.skip_build,
                profile: !self.skip_profile,
                summarize: true,
            }
        }
    }

    fn load_config(&self) -> Result<HarnessConfig> {
        let mut config = HarnessConfig::load(&self.config)
            .with_context(|| format!("Failed to load {}", self.config.display()))?;

        if let Some(kind) = self.profiler {
            config = config.with_profiler(kind);
        }
        if let Some(secs) = self.window {
            config = config
                .with_observation_window(Duration::from_secs(secs))
                .context("Invalid --window")?;
        }
        if self.debug_build {
            config = config.with_release(false);
        }
        Ok(config)
    }
}

fn main() {
    init_tracing();

    if let Err(e) = run(&Cli::parse()) {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = cli.load_config()?;
    let profiler = leak_profile::profiler::for_kind(
        config.profiler(),
        config.output_dir(),
        config.process_prefix(),
    );

    let orchestrator = Orchestrator::new(config, Rustup);
    let config = orchestrator.config();
    info!(
        "Comparing {} against {} with {} ({}s window)",
        config.candidate(),
        config.baseline(),
        config.profiler(),
        config.observation_window().as_secs()
    );

    let mut reporter = SummaryReporter::new(io::stdout().lock());

    let comparison = orchestrator
        .run(profiler.as_ref(), cli.phases(), &mut reporter)
        .context("Comparison run failed")?;

    if cli.json {
        if let Some(comparison) = comparison {
            let json = serde_json::to_string_pretty(&comparison)
                .context("Failed to serialize comparison")?;
            println!("{json}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_phases_run_everything() {
        let cli = Cli::try_parse_from(["leak-profile"]).unwrap();
        assert_eq!(cli.phases(), Phases::all());
        assert_eq!(cli.config, PathBuf::from("leak-profile.toml"));
    }

    #[test]
    fn test_skip_flags() {
        let cli = Cli::try_parse_from(["leak-profile", "--skip-clean", "--skip-build"]).unwrap();
        let phases = cli.phases();
        assert!(!phases.clean && !phases.build && phases.profile && phases.summarize);
    }

    #[test]
    fn test_summary_only_conflicts_with_skips() {
        assert!(Cli::try_parse_from(["leak-profile", "--summary-only", "--skip-build"]).is_err());
        let cli = Cli::try_parse_from(["leak-profile", "--summary-only"]).unwrap();
        assert_eq!(cli.phases(), Phases::summary_only());
    }

    #[test]
    fn test_profiler_flag() {
        let cli = Cli::try_parse_from(["leak-profile", "-p", "heaptrack", "-w", "10"]).unwrap();
        assert_eq!(cli.profiler, Some(ProfilerKind::Heaptrack));
        assert_eq!(cli.window, Some(10));
    }

    #[test]
    fn test_overrides_apply_to_loaded_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("leak-profile.toml");
        std::fs::write(
            &path,
            "project_dir = \"/src/rls\"\n\
             test_project_dir = \"/src/rls/test-proj\"\n\
             baseline = \"leaktest-prev\"\n\
             candidate = \"leaktest\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "leak-profile".to_string(),
            "--config".to_string(),
            path.display().to_string(),
            "--profiler".to_string(),
            "heaptrack".to_string(),
            "--window".to_string(),
            "3".to_string(),
            "--debug-build".to_string(),
        ])
        .unwrap();

        let config = cli.load_config().unwrap();
        assert_eq!(config.profiler(), ProfilerKind::Heaptrack);
        assert_eq!(config.observation_window(), Duration::from_secs(3));
        assert!(!config.release());
    }
}
