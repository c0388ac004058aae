use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::notify::{notify_all, Notifier};
use crate::outcome::{format_seconds, AbortReason, Outcome, PausedInterval, RunRecord, SuccessPolicy};
use crate::process::{ChildSupervisor, CommandSpec, ExitInfo, OutputHandler, PauseFor, PausedUntil, ProcessError, ProcessEvent, Stream};
use crate::rotation::LogRotationPolicy;
use crate::sink::{LogSink, Mirror, SinkError, StdoutMirror};

const RULE: &str = "************************************************************************";
const TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum RunError {
	#[error(transparent)]
	OpenLog(SinkError),
	#[error(transparent)]
	Start(ProcessError),
}

#[derive(Debug, Clone)]
pub struct RunConfig {
	pub command: CommandSpec,
	/// `None` disables the log file; output is still mirrored.
	pub log: Option<LogRotationPolicy>,
	pub success: SuccessPolicy,
	pub max_duration: Option<Duration>,
}

impl RunConfig {
	pub fn new(command: CommandSpec) -> Self {
		Self { command, log: None, success: SuccessPolicy::default(), max_duration: None }
	}
}

#[derive(Debug, Clone)]
pub struct RunReport {
	pub record: RunRecord,
	pub outcome: Outcome,
}

impl RunReport {
	pub fn log_path(&self) -> Option<&PathBuf> {
		self.record.log_path.as_ref()
	}
}

#[derive(Debug)]
enum Request {
	Abort(AbortReason),
	Pause(PauseFor),
	Resume,
}

/// Steers a run from outside: signal handlers, the watchdog, tests.
/// Requests sent after the run has finished are ignored.
#[derive(Clone)]
pub struct RunControl {
	tx: mpsc::UnboundedSender<Request>,
}

impl RunControl {
	pub fn abort(&self, reason: AbortReason) {
		let _ = self.tx.send(Request::Abort(reason));
	}

	pub fn pause(&self, how: PauseFor) {
		let _ = self.tx.send(Request::Pause(how));
	}

	pub fn resume(&self) {
		let _ = self.tx.send(Request::Resume);
	}
}

/// One supervised invocation: rotate logs, run the command, write the
/// banner and footer, tell the notifiers.
pub struct RunSupervisor {
	config: RunConfig,
	notifiers: Vec<Box<dyn Notifier>>,
	mirror: Box<dyn Mirror>,
	control: RunControl,
	requests: mpsc::UnboundedReceiver<Request>,
}

struct LogOutput {
	sink: Arc<LogSink>,
}

impl OutputHandler for LogOutput {
	fn on_text(&mut self, stream: Stream, text: &str) {
		match stream {
			Stream::Stdout => self.sink.write(text),
			Stream::Stderr => self.sink.write(&format!("STDERR: {}", text)),
		}
	}
}

impl RunSupervisor {
	pub fn new(config: RunConfig, notifiers: Vec<Box<dyn Notifier>>) -> Self {
		let (tx, requests) = mpsc::unbounded_channel();
		Self { config, notifiers, mirror: Box::new(StdoutMirror), control: RunControl { tx }, requests }
	}

	pub fn with_mirror(mut self, mirror: Box<dyn Mirror>) -> Self {
		self.mirror = mirror;
		self
	}

	pub fn control(&self) -> RunControl {
		self.control.clone()
	}

	pub async fn run(mut self) -> Result<RunReport, RunError> {
		let command_line = self.config.command.command_line().map_err(RunError::Start)?;
		let working_dir = match &self.config.command.working_dir {
			Some(dir) => dir.clone(),
			None => std::env::current_dir().unwrap_or_default(),
		};
		let mut record = RunRecord::new(command_line, self.config.command.name(), working_dir);

		let rotation = self.config.log.as_ref().map(|policy| policy.prepare(record.started_at, &record.command_name));
		let mirror = std::mem::replace(&mut self.mirror, Box::new(StdoutMirror));
		let sink = match rotation.as_ref().and_then(|r| r.path.as_deref()) {
			Some(path) => LogSink::open(path, mirror).map_err(RunError::OpenLog)?,
			None => LogSink::disabled(mirror),
		};
		let sink = Arc::new(sink);
		sink.begin_run();
		record.log_path = sink.path();
		record.log_start_offset = sink.start_offset();

		sink.write_line(RULE);
		line(&sink, &format!("runlogged v{} invoked at {}", env!("CARGO_PKG_VERSION"), record.started_at.format(TIMESTAMP)));
		line(&sink, &format!("Command: |{}|", record.command_line));
		line(&sink, &format!("CurDir: |{}|", record.working_dir.display()));
		match &record.log_path {
			Some(path) => line(&sink, &format!("LogTo: |{}|", path.display())),
			None => line(&sink, "LogTo: <none>"),
		}
		if let Some(rotation) = rotation {
			for info in &rotation.infos {
				line(&sink, info);
			}
			for warning in rotation.warnings {
				line(&sink, &format!("WARNING: {}", warning));
				record.warnings.push(warning);
			}
		}

		let child = ChildSupervisor::new(self.config.command.clone());
		let mut events = child.subscribe();
		if let Err(e) = child.start(LogOutput { sink: Arc::clone(&sink) }) {
			line(&sink, &format!("could not start the command: {}", e));
			close(&sink, &mut record);
			return Err(RunError::Start(e));
		}
		let started = Instant::now();

		let watchdog = self.config.max_duration.map(|limit| {
			let control = self.control.clone();
			tokio::spawn(async move {
				tokio::time::sleep(limit).await;
				control.abort(AbortReason::TimeLimit { seconds: limit.as_secs() });
			})
		});

		let mut abort_reason = None;
		let exit = loop {
			tokio::select! {
				// requests first, so an abort that races the exit is not lost
				biased;
				Some(request) = self.requests.recv() => match request {
					Request::Abort(reason) => {
						if abort_reason.is_none() {
							line(&sink, &abort_message(&reason));
							tracing::info!(%reason, "aborting run");
							abort_reason = Some(reason);
						}
						child.abort();
					}
					Request::Pause(how) => {
						if let Err(e) = child.pause(how) {
							warn(&sink, &mut record, format!("could not pause the command: {}", e));
						}
					}
					Request::Resume => {
						if let Err(e) = child.resume() {
							warn(&sink, &mut record, format!("could not resume the command: {}", e));
						}
					}
				},
				event = events.recv() => match event {
					Ok(event) => on_event(&sink, &mut record, event),
					Err(broadcast::error::RecvError::Lagged(missed)) => {
						tracing::debug!(missed, "process events lagged");
					}
					Err(broadcast::error::RecvError::Closed) => {}
				},
				info = child.wait() => break info,
			}
		};
		if let Some(watchdog) = watchdog {
			watchdog.abort();
		}
		drain_events(&sink, &mut record, &mut events);
		if abort_reason.is_none() {
			abort_reason = pending_abort(&mut self.requests);
			if let Some(reason) = &abort_reason {
				line(&sink, &abort_message(reason));
			}
		}

		let exit = exit.unwrap_or(ExitInfo { exit_code: -1, aborted: false });
		let ended_at = Local::now();
		record.ended_at = Some(ended_at);
		let ran_for = format_seconds(started.elapsed());

		let outcome = resolve(exit, abort_reason, &self.config.success);
		match &outcome {
			Outcome::Aborted { reason } => {
				record.aborted = true;
				record.abort_reason = Some(reason.clone());
				line(&sink, &format!("aborted at {} (ran for {} seconds)", ended_at.format(TIMESTAMP), ran_for));
			}
			Outcome::Success { exit_code } | Outcome::Failure { exit_code } => {
				record.exit_code = Some(*exit_code);
				let verdict = if outcome.is_success() { "success" } else { "failure" };
				line(&sink, &format!("completed at {} (ran for {} seconds)", ended_at.format(TIMESTAMP), ran_for));
				line(&sink, &format!("exit code: {} ({})", exit_code, verdict));
			}
		}

		if !self.notifiers.is_empty() {
			let excerpt = if outcome.is_success() {
				None
			} else {
				Some(match sink.excerpt() {
					Ok(Some(text)) => text,
					Ok(None) => "<log not available as file logging was disabled>".to_string(),
					Err(e) => format!("<failed to read the log: {}>", e),
				})
			};
			for warning in notify_all(&self.notifiers, &record, &outcome, excerpt.as_deref()).await {
				line(&sink, &format!("WARNING: {}", warning));
				record.warnings.push(warning);
			}
		}

		close(&sink, &mut record);
		Ok(RunReport { record, outcome })
	}
}

/// Once `Abort` was requested the run counts as aborted, even when the child
/// managed to exit on its own first.
fn resolve(exit: ExitInfo, abort_reason: Option<AbortReason>, success: &SuccessPolicy) -> Outcome {
	match abort_reason {
		Some(reason) => Outcome::Aborted { reason },
		None if exit.aborted => Outcome::Aborted { reason: AbortReason::Interrupted },
		None if success.is_success(exit.exit_code) => Outcome::Success { exit_code: exit.exit_code },
		None => Outcome::Failure { exit_code: exit.exit_code },
	}
}

/// First abort still queued when the child was already gone.
fn pending_abort(requests: &mut mpsc::UnboundedReceiver<Request>) -> Option<AbortReason> {
	while let Ok(request) = requests.try_recv() {
		if let Request::Abort(reason) = request {
			return Some(reason);
		}
	}
	None
}

fn drain_events(sink: &LogSink, record: &mut RunRecord, events: &mut broadcast::Receiver<ProcessEvent>) {
	loop {
		match events.try_recv() {
			Ok(event) => on_event(sink, record, event),
			Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
			Err(_) => break,
		}
	}
}

fn on_event(sink: &LogSink, record: &mut RunRecord, event: ProcessEvent) {
	match event {
		ProcessEvent::Paused { until } => on_paused(sink, record, until),
		ProcessEvent::Resumed => on_resumed(sink, record),
		ProcessEvent::Started { .. } | ProcessEvent::Exited(_) => {}
	}
}

fn line(sink: &LogSink, text: &str) {
	sink.write_line(&format!("****** {}", text.replace('\n', "\n****** ")));
}

fn warn(sink: &LogSink, record: &mut RunRecord, message: String) {
	tracing::warn!("{}", message);
	line(sink, &format!("WARNING: {}", message));
	record.warnings.push(message);
}

fn close(sink: &LogSink, record: &mut RunRecord) {
	if let Err(e) = sink.close() {
		tracing::warn!("closing the log failed: {}", e);
		record.warnings.push(format!("closing the log failed: {}", e));
	}
}

fn abort_message(reason: &AbortReason) -> String {
	match reason {
		AbortReason::TimeLimit { seconds } => format!("time limit of {} seconds reached; aborting.", seconds),
		AbortReason::Interrupted => "interrupted; aborting.".to_string(),
		AbortReason::Requested(who) => format!("abort requested by {}; aborting.", who),
	}
}

fn on_paused(sink: &LogSink, record: &mut RunRecord, until: PausedUntil) {
	let what = match until {
		PausedUntil::Indefinitely => "indefinitely".to_string(),
		PausedUntil::At(due) => {
			let left = due.saturating_duration_since(Instant::now());
			let left = Duration::from_secs(left.as_secs_f64().round() as u64);
			format!("for {} (until {})", humantime::format_duration(left), wall_clock(left).format(TIMESTAMP))
		}
	};
	tracing::info!(last_line = %sink.last_line(), "run paused {}", what);
	if record.is_paused() {
		line(sink, &format!("pause extended; paused {}", what));
	} else {
		record.paused.push(PausedInterval { from: Local::now(), to: None });
		line(sink, &format!("paused {}", what));
	}
}

fn on_resumed(sink: &LogSink, record: &mut RunRecord) {
	if let Some(interval) = record.paused.last_mut().filter(|p| p.to.is_none()) {
		interval.to = Some(Local::now());
	}
	line(sink, &format!("resumed at {}", Local::now().format(TIMESTAMP)));
}

fn wall_clock(from_now: Duration) -> DateTime<Local> {
	chrono::Duration::from_std(from_now)
		.ok()
		.and_then(|d| Local::now().checked_add_signed(d))
		.unwrap_or_else(Local::now)
}
