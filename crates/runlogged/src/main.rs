mod cli;
mod config;
mod exit_code;
mod notifiers;
mod paths;
mod signals;

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use kiroku::{CommandSpec, LogRotationPolicy, RunConfig, RunError, RunSupervisor, SuccessPolicy};
use owo_colors::OwoColorize;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use config::Settings;
use paths::AppPaths;

#[tokio::main]
async fn main() {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(e) => {
			// --help and --version also end up here
			let code = if e.use_stderr() { exit_code::CLI_ERROR } else { exit_code::SUCCESS };
			let _ = e.print();
			std::process::exit(code);
		}
	};

	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_env("RUNLOGGED_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
		.with_writer(std::io::stderr)
		.init();

	let code = match run(cli).await {
		Ok(code) => code,
		Err(e) => {
			eprintln!("{} {:#}", "internal error:".red().bold(), e);
			exit_code::INTERNAL
		}
	};
	std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
	let working_dir = match &cli.working_dir {
		Some(dir) if !dir.is_dir() => {
			print_error(format!("cannot use {} as the working directory: not a directory", dir.display()));
			return Ok(exit_code::CLI_ERROR);
		}
		Some(dir) => std::path::absolute(dir)?,
		None => std::env::current_dir().context("cannot determine the current directory")?,
	};

	let settings_path = cli.config.clone().unwrap_or_else(|| AppPaths::new("runlogged").config_file());
	let settings = match config::load_settings(&settings_path) {
		Ok(settings) => settings,
		Err(e) => {
			print_error(format!("{:#}", e));
			return Ok(exit_code::CLI_ERROR);
		}
	};
	tracing::debug!(path = %settings_path.display(), "settings loaded");

	let config = run_config(&cli, &settings, working_dir);
	let notifiers = notifiers::from_settings(&settings, cli.ping_url.as_deref(), &config.command.name())?;
	let supervisor = RunSupervisor::new(config, notifiers);
	let signals = signals::forward(supervisor.control(), settings.pause.duration)
		.context("failed to install signal handlers")?;

	let result = supervisor.run().await;
	signals.abort();

	match result {
		Ok(report) => Ok(exit_code::for_outcome(&report.outcome, cli.indicate_success)),
		Err(RunError::OpenLog(e)) => {
			print_error(e);
			Ok(exit_code::LOG_OPEN_FAILED)
		}
		Err(RunError::Start(e)) => {
			print_error(e);
			Ok(exit_code::START_FAILED)
		}
	}
}

/// Flags win over the settings file.
fn run_config(cli: &Cli, settings: &Settings, working_dir: PathBuf) -> RunConfig {
	let log_enabled = !cli.no_log && (settings.log.enabled || cli.log.is_some());
	let log = log_enabled.then(|| {
		let pattern = cli.log.clone().unwrap_or_else(|| settings.log.pattern.clone());
		let pattern = if Path::new(&pattern).is_absolute() {
			pattern
		} else {
			working_dir.join(&pattern).to_string_lossy().into_owned()
		};
		LogRotationPolicy {
			pattern,
			days_to_keep: cli.days_to_keep.unwrap_or(settings.log.days_to_keep),
			max_total_size_kb: cli.max_total_size_kb.unwrap_or(settings.log.max_total_size_kb),
		}
	});

	let success = match (&cli.success_codes, &cli.failure_codes) {
		(Some(codes), _) => SuccessPolicy::SuccessCodes(codes.clone()),
		(None, Some(codes)) => SuccessPolicy::FailureCodes(codes.clone()),
		(None, None) => SuccessPolicy::ZeroOnly,
	};

	let mut command = CommandSpec::new(cli.command.iter().cloned());
	command.working_dir = Some(working_dir);

	RunConfig { command, log, success, max_duration: cli.max_duration_secs.map(Duration::from_secs) }
}

fn print_error(message: impl Display) {
	eprintln!("{} {}", "error:".red().bold(), message);
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cli(args: &[&str]) -> Cli {
		Cli::try_parse_from(std::iter::once("runlogged").chain(args.iter().copied())).unwrap()
	}

	#[test]
	fn relative_log_pattern_follows_working_dir() {
		let config = run_config(&cli(&["--log", "logs/{name}.log", "job"]), &Settings::default(), "/srv/app".into());
		assert_eq!(config.log.unwrap().pattern, "/srv/app/logs/{name}.log");
		assert_eq!(config.command.working_dir, Some(PathBuf::from("/srv/app")));

		let config = run_config(&cli(&["job"]), &Settings::default(), "/srv/app".into());
		assert_eq!(config.log.unwrap().pattern, "/srv/app/{name}--{daily}.log");
	}

	#[test]
	fn flags_override_settings() {
		let settings: Settings = toml::from_str(
			"[log]\nenabled = false\npattern = \"/var/log/{name}.log\"\ndays_to_keep = 5\nmax_total_size_kb = 10",
		)
		.unwrap();

		assert!(run_config(&cli(&["job"]), &settings, "/".into()).log.is_none());

		let config = run_config(&cli(&["--log", "/tmp/x.log", "--days-to-keep", "9", "job"]), &settings, "/".into());
		let log = config.log.unwrap();
		assert_eq!(log.pattern, "/tmp/x.log");
		assert_eq!(log.days_to_keep, 9);
		assert_eq!(log.max_total_size_kb, 10);

		assert!(run_config(&cli(&["--no-log", "job"]), &Settings::default(), "/".into()).log.is_none());
	}

	#[test]
	fn success_policy_and_time_limit() {
		let config = run_config(&cli(&["--failure-codes", "1-9", "--max-duration-sec", "60", "job"]), &Settings::default(), "/".into());
		assert!(config.success.is_success(0));
		assert!(!config.success.is_success(3));
		assert_eq!(config.max_duration, Some(Duration::from_secs(60)));
		assert_eq!(run_config(&cli(&["job"]), &Settings::default(), "/".into()).success, SuccessPolicy::ZeroOnly);
	}
}
