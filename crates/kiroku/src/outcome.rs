use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRange {
	pub from: i32,
	pub to: i32,
}

impl CodeRange {
	pub fn contains(&self, code: i32) -> bool {
		(self.from..=self.to).contains(&code)
	}
}

/// A list like `0,3,5-7,-1` or `-10--5`; ranges are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCodeRanges(pub Vec<CodeRange>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot parse exit code list segment {segment:?}")]
pub struct RangeParseError {
	pub segment: String,
}

impl ExitCodeRanges {
	pub fn contains(&self, code: i32) -> bool {
		self.0.iter().any(|r| r.contains(code))
	}
}

impl FromStr for ExitCodeRanges {
	type Err = RangeParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.split(',')
			.map(|part| parse_segment(part).ok_or_else(|| RangeParseError { segment: part.to_string() }))
			.collect::<Result<Vec<_>, _>>()
			.map(ExitCodeRanges)
	}
}

fn parse_segment(part: &str) -> Option<CodeRange> {
	let part = part.trim();
	let (from, rest) = split_number(part)?;
	let rest = rest.trim_start();
	if rest.is_empty() {
		return Some(CodeRange { from, to: from });
	}
	let (to, tail) = split_number(rest.strip_prefix('-')?.trim_start())?;
	if !tail.trim().is_empty() {
		return None;
	}
	Some(CodeRange { from: from.min(to), to: from.max(to) })
}

/// Leading optionally-negative integer and whatever follows it.
fn split_number(s: &str) -> Option<(i32, &str)> {
	let digits_start = usize::from(s.starts_with('-'));
	let len = s[digits_start..].bytes().take_while(u8::is_ascii_digit).count();
	if len == 0 {
		return None;
	}
	let end = digits_start + len;
	Some((s[..end].parse().ok()?, &s[end..]))
}

/// Which exit codes count as success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuccessPolicy {
	/// Only zero is success.
	#[default]
	ZeroOnly,
	/// Listed codes are success, everything else is failure.
	SuccessCodes(ExitCodeRanges),
	/// Listed codes are failure, everything else is success.
	FailureCodes(ExitCodeRanges),
}

impl SuccessPolicy {
	pub fn is_success(&self, exit_code: i32) -> bool {
		match self {
			SuccessPolicy::ZeroOnly => exit_code == 0,
			SuccessPolicy::SuccessCodes(ranges) => ranges.contains(exit_code),
			SuccessPolicy::FailureCodes(ranges) => !ranges.contains(exit_code),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
	/// Ctrl+C, SIGTERM or an explicit abort request.
	Interrupted,
	TimeLimit { seconds: u64 },
	Requested(String),
}

impl fmt::Display for AbortReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AbortReason::Interrupted => write!(f, "interrupted"),
			AbortReason::TimeLimit { seconds } => write!(f, "time limit of {} seconds reached", seconds),
			AbortReason::Requested(who) => write!(f, "aborted by {}", who),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
	Success { exit_code: i32 },
	Failure { exit_code: i32 },
	Aborted { reason: AbortReason },
}

impl Outcome {
	pub fn is_success(&self) -> bool {
		matches!(self, Outcome::Success { .. })
	}

	pub fn exit_code(&self) -> Option<i32> {
		match self {
			Outcome::Success { exit_code } | Outcome::Failure { exit_code } => Some(*exit_code),
			Outcome::Aborted { .. } => None,
		}
	}

	/// One-line summary used by notifications, e.g.
	/// `failed; exit code 2; ran for 12.3 seconds`.
	pub fn summary(&self, ran_for: Duration) -> String {
		let secs = format_seconds(ran_for);
		match self {
			Outcome::Success { exit_code } => format!("succeeded; exit code {}; ran for {} seconds", exit_code, secs),
			Outcome::Failure { exit_code } => format!("failed; exit code {}; ran for {} seconds", exit_code, secs),
			Outcome::Aborted { reason } => format!("aborted ({}); ran for {} seconds", reason, secs),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedInterval {
	pub from: DateTime<Local>,
	/// `None` while still paused, or if the run ended during the pause.
	pub to: Option<DateTime<Local>>,
}

/// Everything a notifier needs to know about one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
	pub command_line: String,
	pub command_name: String,
	pub working_dir: PathBuf,
	pub started_at: DateTime<Local>,
	pub ended_at: Option<DateTime<Local>>,
	pub exit_code: Option<i32>,
	pub aborted: bool,
	pub abort_reason: Option<AbortReason>,
	pub paused: Vec<PausedInterval>,
	pub log_path: Option<PathBuf>,
	pub log_start_offset: u64,
	/// Problems that did not stop the run (rotation, notifications, ...).
	pub warnings: Vec<String>,
}

impl RunRecord {
	pub fn new(command_line: String, command_name: String, working_dir: PathBuf) -> Self {
		Self {
			command_line,
			command_name,
			working_dir,
			started_at: Local::now(),
			ended_at: None,
			exit_code: None,
			aborted: false,
			abort_reason: None,
			paused: Vec::new(),
			log_path: None,
			log_start_offset: 0,
			warnings: Vec::new(),
		}
	}

	pub fn duration(&self) -> Duration {
		let end = self.ended_at.unwrap_or_else(Local::now);
		(end - self.started_at).to_std().unwrap_or_default()
	}

	pub fn is_paused(&self) -> bool {
		self.paused.last().is_some_and(|p| p.to.is_none())
	}
}

/// `1234.56s` → `1,234.6`
pub fn format_seconds(d: Duration) -> String {
	let tenths = (d.as_secs_f64() * 10.0).round() as u64;
	let whole = (tenths / 10).to_string();
	let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
	for (i, ch) in whole.chars().enumerate() {
		if i > 0 && (whole.len() - i) % 3 == 0 {
			grouped.push(',');
		}
		grouped.push(ch);
	}
	format!("{}.{}", grouped, tenths % 10)
}
