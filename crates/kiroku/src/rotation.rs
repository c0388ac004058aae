use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Days, Local, Months, NaiveDate};
use serde::{Deserialize, Serialize};

pub const TRIM_MARKER: &str = "****** (older logs trimmed here)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
	Daily,
	Monthly,
	Yearly,
}

impl Period {
	fn format(self) -> &'static str {
		match self {
			Period::Daily => "%Y-%m-%d",
			Period::Monthly => "%Y-%m",
			Period::Yearly => "%Y",
		}
	}

	/// Length of the formatted date, e.g. `2026-03` is 7.
	fn width(self) -> usize {
		match self {
			Period::Daily => 10,
			Period::Monthly => 7,
			Period::Yearly => 4,
		}
	}

	fn parse(self, s: &str) -> Option<NaiveDate> {
		let full = match self {
			Period::Daily => s.to_string(),
			Period::Monthly => format!("{}-01", s),
			Period::Yearly => format!("{}-01-01", s),
		};
		NaiveDate::parse_from_str(&full, "%Y-%m-%d").ok()
	}

	/// Start of the period after the one `date` falls in.
	fn next_start(self, date: NaiveDate) -> Option<NaiveDate> {
		match self {
			Period::Daily => date.checked_add_days(Days::new(1)),
			Period::Monthly => date.checked_add_months(Months::new(1)),
			Period::Yearly => date.checked_add_months(Months::new(12)),
		}
	}
}

/// How log files are named and how much of them is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRotationPolicy {
	/// File path, optionally containing `{name}` and one of `{daily}`,
	/// `{monthly}`, `{yearly}` (`{}` is short for `{daily}`).
	pub pattern: String,
	/// Dated logs older than this are deleted; 0 keeps everything.
	pub days_to_keep: u32,
	/// Cap for all logs of this pattern together, in thousands of bytes;
	/// 0 means unlimited.
	pub max_total_size_kb: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationReport {
	/// `None` when logging to a file is impossible.
	pub path: Option<PathBuf>,
	pub infos: Vec<String>,
	pub warnings: Vec<String>,
}

impl RotationReport {
	fn warn(&mut self, message: String) {
		tracing::warn!("{}", message);
		self.warnings.push(message);
	}
}

struct Template {
	/// Everything before the date placeholder, `{name}` already substituted.
	prefix: String,
	suffix: String,
	period: Option<Period>,
}

struct RetainedLogFile {
	path: PathBuf,
	superseded_at: DateTime<Local>,
	size: u64,
}

impl LogRotationPolicy {
	pub fn new(pattern: impl Into<String>) -> Self {
		Self { pattern: pattern.into(), days_to_keep: 0, max_total_size_kb: 0 }
	}

	/// Resolve this run's log path and enforce the age and size limits on
	/// earlier logs. Runs before the log is opened, so the current run's own
	/// output is never trimmed. Nothing here is fatal.
	pub fn prepare(&self, now: DateTime<Local>, name: &str) -> RotationReport {
		self.prepare_with(now, name, &|path| fs::remove_file(path))
	}

	fn prepare_with(&self, now: DateTime<Local>, name: &str, remove: &dyn Fn(&Path) -> io::Result<()>) -> RotationReport {
		let mut report = RotationReport::default();
		let template = self.template(name);

		let current = match template.period {
			Some(period) => format!("{}{}{}", template.prefix, now.format(period.format()), template.suffix),
			None => template.prefix.clone(),
		};
		let current = PathBuf::from(current);

		if template.period.is_some() && template.suffix.contains(std::path::MAIN_SEPARATOR) {
			report.warn(format!(
				"could not start logging: the date placeholder must be in the file name, not a directory ({})",
				self.pattern
			));
			return report;
		}

		let dir = match current.parent() {
			Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
			_ => PathBuf::from("."),
		};
		if let Err(e) = fs::create_dir_all(&dir) {
			report.warn(format!("could not start logging; path: {}: {}", dir.display(), e));
			return report;
		}

		if let Some(period) = template.period {
			let retained = self.delete_by_age(&template, period, &dir, &current, now, remove, &mut report);
			self.delete_by_size(retained, &current, remove, &mut report);
		}
		if let Err(e) = self.trim_current(&current, &mut report) {
			report.warn(format!("error while trimming logs: {}", e));
		}

		report.path = Some(current);
		report
	}

	fn limit_bytes(&self) -> u64 {
		self.max_total_size_kb.saturating_mul(1000)
	}

	fn template(&self, name: &str) -> Template {
		let pattern = replace_ignore_case(&self.pattern, "{name}", name);
		let lower = pattern.to_ascii_lowercase();
		let placeholders = [
			("{daily}", Period::Daily),
			("{monthly}", Period::Monthly),
			("{yearly}", Period::Yearly),
			("{}", Period::Daily),
		];
		for (placeholder, period) in placeholders {
			if let Some(at) = lower.find(placeholder) {
				return Template {
					prefix: pattern[..at].to_string(),
					suffix: pattern[at + placeholder.len()..].to_string(),
					period: Some(period),
				};
			}
		}
		Template { prefix: pattern, suffix: String::new(), period: None }
	}

	fn delete_by_age(
		&self,
		template: &Template,
		period: Period,
		dir: &Path,
		current: &Path,
		now: DateTime<Local>,
		remove: &dyn Fn(&Path) -> io::Result<()>,
		report: &mut RotationReport,
	) -> Vec<RetainedLogFile> {
		let file_prefix = match template.prefix.rfind(std::path::MAIN_SEPARATOR) {
			Some(sep) => &template.prefix[sep + 1..],
			None => template.prefix.as_str(),
		};

		let entries = match fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(e) => {
				report.warn(format!("could not list log directory {}: {}", dir.display(), e));
				return Vec::new();
			}
		};

		let mut candidates: Vec<(PathBuf, u64, DateTime<Local>)> = Vec::new();
		for entry in entries.flatten() {
			let path = entry.path();
			if path.file_name() == current.file_name() {
				continue;
			}
			let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
				continue;
			};
			let Some(superseded_at) = dated_name(file_name, file_prefix, &template.suffix, period) else {
				continue;
			};
			let Ok(meta) = entry.metadata() else {
				continue;
			};
			if meta.is_file() {
				candidates.push((path, meta.len(), superseded_at));
			}
		}
		candidates.sort_by(|a, b| a.0.cmp(&b.0));

		let mut retained = Vec::new();
		for (path, size, superseded_at) in candidates {
			let age_days = (now - superseded_at).num_seconds() as f64 / 86_400.0;
			if self.days_to_keep > 0 && age_days > f64::from(self.days_to_keep) {
				match remove(&path) {
					Ok(()) => report.infos.push(format!("deleted log file due to age limit: {}", path.display())),
					Err(e) => {
						report.warn(format!("could not delete old log file {}: {}", path.display(), e));
						// still on disk, so it still counts towards the size limit
						retained.push(RetainedLogFile { path, superseded_at, size });
					}
				}
			} else {
				retained.push(RetainedLogFile { path, superseded_at, size });
			}
		}
		retained
	}

	fn delete_by_size(
		&self,
		mut retained: Vec<RetainedLogFile>,
		current: &Path,
		remove: &dyn Fn(&Path) -> io::Result<()>,
		report: &mut RotationReport,
	) {
		if self.max_total_size_kb == 0 {
			return;
		}
		let mut total = fs::metadata(current).map(|m| m.len()).unwrap_or(0);
		total += retained.iter().map(|f| f.size).sum::<u64>();

		retained.sort_by_key(|f| f.superseded_at);
		for file in retained {
			if total <= self.limit_bytes() {
				break;
			}
			match remove(&file.path) {
				Ok(()) => {
					total -= file.size;
					report.infos.push(format!("deleted log file due to size limit: {}", file.path.display()));
				}
				Err(e) => report.warn(format!("could not delete log file {}: {}", file.path.display(), e)),
			}
		}
	}

	/// Cut the oldest lines off the current file when it alone is over the
	/// limit, leaving it at roughly half the limit.
	fn trim_current(&self, current: &Path, report: &mut RotationReport) -> io::Result<()> {
		if self.max_total_size_kb == 0 {
			return Ok(());
		}
		let size = match fs::metadata(current) {
			Ok(meta) => meta.len(),
			Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e),
		};
		if size <= self.limit_bytes() {
			return Ok(());
		}

		let content = fs::read(current)?;
		let to_skip = size.saturating_sub(self.limit_bytes() / 2);
		let mut skipped = 0u64;
		let mut cut = 0usize;
		for line in content.split_inclusive(|&b| b == b'\n') {
			if skipped >= to_skip {
				break;
			}
			skipped += line.len() as u64;
			cut += line.len();
		}

		let mut tmp_name = current.as_os_str().to_owned();
		tmp_name.push(".~tmp");
		let tmp = PathBuf::from(tmp_name);
		{
			let mut out = io::BufWriter::new(fs::File::create(&tmp)?);
			writeln!(out, "{}", TRIM_MARKER)?;
			writeln!(out)?;
			out.write_all(&content[cut..])?;
			out.flush()?;
		}
		fs::rename(&tmp, current)?;

		tracing::info!(path = %current.display(), skipped, "trimmed log file");
		report.infos.push(format!("trimmed lines from log file due to size limit: {}", current.display()));
		Ok(())
	}
}

/// Superseded-at time of a sibling log named `<prefix><date><suffix>`.
fn dated_name(file_name: &str, prefix: &str, suffix: &str, period: Period) -> Option<DateTime<Local>> {
	let lower = file_name.to_ascii_lowercase();
	if file_name.len() != prefix.len() + period.width() + suffix.len()
		|| !lower.starts_with(&prefix.to_ascii_lowercase())
		|| !lower.ends_with(&suffix.to_ascii_lowercase())
	{
		return None;
	}
	let date = file_name.get(prefix.len()..prefix.len() + period.width())?;
	let next = period.next_start(period.parse(date)?)?;
	next.and_hms_opt(0, 0, 0)?.and_local_timezone(Local).earliest()
}

fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
	let lower = haystack.to_ascii_lowercase();
	let mut out = String::with_capacity(haystack.len());
	let mut last = 0;
	for (at, _) in lower.match_indices(needle) {
		out.push_str(&haystack[last..at]);
		out.push_str(replacement);
		last = at + needle.len();
	}
	out.push_str(&haystack[last..]);
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;
	use pretty_assertions::assert_eq;

	fn now() -> DateTime<Local> {
		Local.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
	}

	fn days_ago(days: u64) -> String {
		(now().date_naive() - Days::new(days)).format("%Y-%m-%d").to_string()
	}

	fn policy(dir: &Path, days_to_keep: u32, max_total_size_kb: u64) -> LogRotationPolicy {
		LogRotationPolicy {
			pattern: dir.join("{name}-{daily}.log").to_string_lossy().into_owned(),
			days_to_keep,
			max_total_size_kb,
		}
	}

	fn write(dir: &Path, name: &str, bytes: usize) -> PathBuf {
		let path = dir.join(name);
		fs::write(&path, "x".repeat(bytes)).unwrap();
		path
	}

	#[test]
	fn substitutes_name_and_dates() {
		let cases = [
			("logs/{name}-{daily}.log", "logs/backup-2026-03-15.log"),
			("logs/{NAME}-{Monthly}.log", "logs/backup-2026-03.log"),
			("{name}.{yearly}.log", "backup.2026.log"),
			("{name}-{}.log", "backup-2026-03-15.log"),
			("plain.log", "plain.log"),
		];
		for (pattern, expected) in cases {
			let t = LogRotationPolicy::new(pattern).template("backup");
			let resolved = match t.period {
				Some(p) => format!("{}{}{}", t.prefix, now().format(p.format()), t.suffix),
				None => t.prefix,
			};
			assert_eq!(resolved, expected, "{}", pattern);
		}
	}

	#[test]
	fn age_limit_deletes_only_old_files() {
		let dir = tempfile::tempdir().unwrap();
		let recent = write(dir.path(), &format!("job-{}.log", days_ago(10)), 10);
		let old = write(dir.path(), &format!("job-{}.log", days_ago(40)), 10);
		let ancient = write(dir.path(), &format!("job-{}.log", days_ago(400)), 10);
		let unrelated = write(dir.path(), "other-2020-01-01.log", 10);

		let report = policy(dir.path(), 30, 0).prepare(now(), "job");

		assert_eq!(report.path, Some(dir.path().join("job-2026-03-15.log")));
		assert!(recent.exists());
		assert!(!old.exists());
		assert!(!ancient.exists());
		assert!(unrelated.exists());
		assert_eq!(report.infos.len(), 2);
		assert!(report.warnings.is_empty());
	}

	#[test]
	fn zero_days_keeps_everything() {
		let dir = tempfile::tempdir().unwrap();
		let files: Vec<_> =
			[10, 40, 400].iter().map(|d| write(dir.path(), &format!("job-{}.log", days_ago(*d)), 10)).collect();

		let report = policy(dir.path(), 0, 0).prepare(now(), "job");

		assert!(files.iter().all(|f| f.exists()));
		assert!(report.infos.is_empty());
	}

	#[test]
	fn monthly_files_are_superseded_at_next_month() {
		let dir = tempfile::tempdir().unwrap();
		// superseded 2026-03-01 and 2026-02-01: 14.5 and 42.5 days before now
		let last_month = write(dir.path(), "job-2026-02.log", 10);
		let older = write(dir.path(), "job-2026-01.log", 10);
		let pattern = dir.path().join("{name}-{monthly}.log").to_string_lossy().into_owned();
		let policy = LogRotationPolicy { pattern, days_to_keep: 30, max_total_size_kb: 0 };

		let report = policy.prepare(now(), "job");

		assert_eq!(report.path, Some(dir.path().join("job-2026-03.log")));
		assert!(last_month.exists());
		assert!(!older.exists());

		let report = LogRotationPolicy { days_to_keep: 14, ..policy }.prepare(now(), "job");
		assert!(!last_month.exists());
		assert_eq!(report.infos.len(), 1);
	}

	#[test]
	fn size_limit_deletes_oldest_first() {
		let dir = tempfile::tempdir().unwrap();
		let current = write(dir.path(), "job-2026-03-15.log", 600);
		let one = write(dir.path(), &format!("job-{}.log", days_ago(1)), 200);
		let two = write(dir.path(), &format!("job-{}.log", days_ago(2)), 200);
		let three = write(dir.path(), &format!("job-{}.log", days_ago(3)), 200);

		let report = policy(dir.path(), 0, 1).prepare(now(), "job");

		assert!(current.exists());
		assert!(one.exists());
		assert!(two.exists());
		assert!(!three.exists());
		assert_eq!(report.infos, vec![format!("deleted log file due to size limit: {}", three.display())]);
		assert_eq!(fs::metadata(&current).unwrap().len(), 600);
	}

	#[test]
	fn size_limit_compares_exact_bytes() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "job-2026-03-15.log", 900);
		let one = write(dir.path(), &format!("job-{}.log", days_ago(1)), 500);

		policy(dir.path(), 0, 1).prepare(now(), "job");

		// 1400 bytes is over a 1 kB limit even though it rounds down to 1
		assert!(!one.exists());
	}

	#[test]
	fn undeletable_old_file_still_counts_towards_size() {
		let dir = tempfile::tempdir().unwrap();
		write(dir.path(), "job-2026-03-15.log", 400);
		let stuck = write(dir.path(), &format!("job-{}.log", days_ago(400)), 500);
		let recent = write(dir.path(), &format!("job-{}.log", days_ago(1)), 500);
		let refuse_stuck = |path: &Path| {
			if path == stuck {
				Err(io::Error::from(io::ErrorKind::PermissionDenied))
			} else {
				fs::remove_file(path)
			}
		};

		let report = policy(dir.path(), 30, 1).prepare_with(now(), "job", &refuse_stuck);

		assert!(stuck.exists());
		assert!(!recent.exists());
		assert_eq!(report.infos, vec![format!("deleted log file due to size limit: {}", recent.display())]);
		// once by age, once more by size
		assert_eq!(report.warnings.len(), 2);
		assert!(report.warnings[0].starts_with("could not delete old log file"));
	}

	#[test]
	fn oversized_current_file_is_trimmed_not_deleted() {
		let dir = tempfile::tempdir().unwrap();
		let current = dir.path().join("job-2026-03-15.log");
		let line = format!("{}\n", "y".repeat(99));
		let lines: Vec<String> = (0..50).map(|i| format!("{:02}{}", i, &line[2..])).collect();
		fs::write(&current, lines.concat()).unwrap();
		let older = write(dir.path(), &format!("job-{}.log", days_ago(1)), 100);

		let report = policy(dir.path(), 0, 1).prepare(now(), "job");

		assert!(!older.exists());
		let trimmed = fs::read_to_string(&current).unwrap();
		let expected = format!("{}\n\n{}", TRIM_MARKER, lines[45..].concat());
		assert_eq!(trimmed, expected);
		assert!(!dir.path().join("job-2026-03-15.log.~tmp").exists());
		assert!(report.infos.iter().any(|i| i.starts_with("trimmed lines")));
	}

	#[test]
	fn unwritable_directory_disables_logging() {
		let dir = tempfile::tempdir().unwrap();
		let blocker = write(dir.path(), "not-a-dir", 1);
		let pattern = blocker.join("sub").join("{daily}.log").to_string_lossy().into_owned();

		let report = LogRotationPolicy::new(pattern).prepare(now(), "job");

		assert_eq!(report.path, None);
		assert_eq!(report.warnings.len(), 1);
	}

	#[test]
	fn date_placeholder_in_directory_is_rejected() {
		let dir = tempfile::tempdir().unwrap();
		let pattern = dir.path().join("{daily}").join("out.log").to_string_lossy().into_owned();

		let report = LogRotationPolicy::new(pattern).prepare(now(), "job");

		assert_eq!(report.path, None);
		assert!(report.warnings[0].contains("date placeholder"));
	}

	#[test]
	fn missing_directory_is_created() {
		let dir = tempfile::tempdir().unwrap();
		let pattern = dir.path().join("a").join("b").join("{name}.log").to_string_lossy().into_owned();

		let report = LogRotationPolicy::new(pattern).prepare(now(), "job");

		assert_eq!(report.path, Some(dir.path().join("a").join("b").join("job.log")));
		assert!(dir.path().join("a").join("b").is_dir());
	}
}
