use std::path::PathBuf;

use clap::Parser;
use kiroku::ExitCodeRanges;

const OPTSET_LOG: &str = "Log options";
const OPTSET_OUTCOME: &str = "Outcome options";
const OPTSET_NOTIFY: &str = "Notification options";

/// Runs a command and logs all of its output to a dated log file.
///
/// Send SIGUSR1 to pause the command and SIGUSR2 to resume it; Ctrl+C or
/// SIGTERM abort it.
#[derive(Debug, Clone, Parser)]
#[command(name = "runlogged", version, about, long_about)]
pub struct Cli {
	/// Command to run, with its arguments. A single argument is passed to
	/// `sh -c` as is, so pipes and redirects work.
	#[arg(trailing_var_arg = true, num_args = 1.., required = true, value_name = "COMMAND")]
	pub command: Vec<String>,

	/// Working directory for the command
	#[arg(long = "cd", value_name = "DIR")]
	pub working_dir: Option<PathBuf>,

	/// Settings file to read instead of ~/.config/runlogged/config.toml
	#[arg(long, value_name = "PATH")]
	pub config: Option<PathBuf>,

	/// Log file name pattern
	///
	/// May contain {name} (the command's name) and one of {daily}, {monthly}
	/// or {yearly} ({} is short for {daily}). Relative paths are resolved
	/// against --cd. Defaults to "{name}--{daily}.log".
	#[arg(long, value_name = "PATTERN", help_heading = OPTSET_LOG)]
	pub log: Option<String>,

	/// Do not write a log file; only mirror the output
	#[arg(long, conflicts_with = "log", help_heading = OPTSET_LOG)]
	pub no_log: bool,

	/// Delete dated logs older than this many days (0 keeps all)
	#[arg(long, value_name = "DAYS", help_heading = OPTSET_LOG)]
	pub days_to_keep: Option<u32>,

	/// Keep all logs of this pattern under this many thousand bytes (0 is unlimited)
	#[arg(long, value_name = "KB", help_heading = OPTSET_LOG)]
	pub max_total_size_kb: Option<u64>,

	/// Exit codes that count as success, e.g. "0,3,5-7" or "0,-1"; all others are failures
	#[arg(long, value_name = "CODES", conflicts_with = "failure_codes", help_heading = OPTSET_OUTCOME)]
	pub success_codes: Option<ExitCodeRanges>,

	/// Exit codes that count as failure; all others are successes
	#[arg(long, value_name = "CODES", help_heading = OPTSET_OUTCOME)]
	pub failure_codes: Option<ExitCodeRanges>,

	/// Exit with 0 on success and 1 on failure instead of the command's own code
	#[arg(long, help_heading = OPTSET_OUTCOME)]
	pub indicate_success: bool,

	/// Abort the command if it runs longer than this
	#[arg(long = "max-duration-sec", value_name = "SECONDS", help_heading = OPTSET_OUTCOME)]
	pub max_duration_secs: Option<u64>,

	/// URL to GET when the command ends; {{{ok}}} and {{{msg}}} are substituted
	#[arg(long, value_name = "URL", help_heading = OPTSET_NOTIFY)]
	pub ping_url: Option<String>,
}
