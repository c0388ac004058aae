use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::decoder::Utf8StreamDecoder;
use crate::suspend::{signal_group, GroupStop, Suspender};

/// How long to keep reading after the child is reaped, for descendants that
/// still hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const READ_BUF_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
	#[error("the process is already running")]
	AlreadyRunning,
	#[error("no command to run")]
	EmptyCommand,
	#[error("cannot quote the command line for the shell")]
	Quote,
	#[error("failed to start `{command}`: {source}")]
	Spawn { command: String, source: io::Error },
	#[error("failed to signal the process group: {0}")]
	Signal(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
	Stdout,
	Stderr,
}

/// Receives the child's output on the drain task, in production order per
/// stream. Each chunk arrives as raw bytes first, then as decoded text.
pub trait OutputHandler: Send + 'static {
	fn on_bytes(&mut self, _stream: Stream, _bytes: &[u8]) {}
	fn on_text(&mut self, stream: Stream, text: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
	pub args: Vec<String>,
	pub working_dir: Option<PathBuf>,
	#[serde(default)]
	pub env: HashMap<String, String>,
	#[serde(default = "default_true")]
	pub use_shell: bool,
}

fn default_true() -> bool {
	true
}

impl CommandSpec {
	pub fn new<I, S>(args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Self {
			args: args.into_iter().map(Into::into).collect(),
			working_dir: None,
			env: HashMap::new(),
			use_shell: true,
		}
	}

	/// The command line as it is handed to the shell.
	///
	/// A single argument is passed through verbatim so that pipes and
	/// redirects in it keep working; several arguments are quoted and joined.
	pub fn command_line(&self) -> Result<String, ProcessError> {
		match self.args.as_slice() {
			[] => Err(ProcessError::EmptyCommand),
			[single] => Ok(single.clone()),
			many => shlex::try_join(many.iter().map(String::as_str)).map_err(|_| ProcessError::Quote),
		}
	}

	/// Short human-readable name, e.g. for notification subjects.
	pub fn name(&self) -> String {
		let first = self.args.first().map(String::as_str).unwrap_or("");
		let word = first.split_whitespace().next().unwrap_or(first);
		let base = word.rsplit('/').next().unwrap_or(word);
		if base.is_empty() { "command".to_string() } else { base.to_string() }
	}

	fn to_command(&self) -> Result<Command, ProcessError> {
		let mut cmd = if self.use_shell {
			let mut cmd = Command::new("sh");
			cmd.arg("-c").arg(self.command_line()?);
			cmd
		} else {
			let (program, rest) = self.args.split_first().ok_or(ProcessError::EmptyCommand)?;
			let mut cmd = Command::new(program);
			cmd.args(rest);
			cmd
		};

		if let Some(dir) = &self.working_dir {
			cmd.current_dir(dir);
		}
		cmd.envs(&self.env)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.process_group(0)
			.kill_on_drop(true);
		Ok(cmd)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseFor {
	Duration(Duration),
	Indefinitely,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausedUntil {
	At(Instant),
	Indefinitely,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
	/// Only meaningful when `aborted` is false.
	pub exit_code: i32,
	pub aborted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
	NotStarted,
	Running,
	Paused,
	Exited,
	Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
	Started { pid: u32 },
	Paused { until: PausedUntil },
	Resumed,
	Exited(ExitInfo),
}

/// Owns one child process at a time: spawn, drain, pause, resume, abort.
pub struct ChildSupervisor {
	command: CommandSpec,
	shared: Arc<Shared>,
}

struct Shared {
	state: Mutex<State>,
	suspender: Box<dyn Suspender>,
	events: broadcast::Sender<ProcessEvent>,
	exit: watch::Sender<Option<ExitInfo>>,
}

struct State {
	phase: Phase,
	aborted: bool,
	pause: Option<PauseState>,
	pause_generation: u64,
	suspensions: u64,
}

#[derive(Clone, Copy)]
enum Phase {
	NotStarted,
	Running { pid: u32 },
	Finished(ExitInfo),
}

struct PauseState {
	until: PausedUntil,
	timer: Option<JoinHandle<()>>,
}

impl ChildSupervisor {
	pub fn new(command: CommandSpec) -> Self {
		Self::with_suspender(command, Box::new(GroupStop))
	}

	pub fn with_suspender(command: CommandSpec, suspender: Box<dyn Suspender>) -> Self {
		let (events, _) = broadcast::channel(64);
		let (exit, _) = watch::channel(None);
		Self {
			command,
			shared: Arc::new(Shared {
				state: Mutex::new(State {
					phase: Phase::NotStarted,
					aborted: false,
					pause: None,
					pause_generation: 0,
					suspensions: 0,
				}),
				suspender,
				events,
				exit,
			}),
		}
	}

	pub fn command(&self) -> &CommandSpec {
		&self.command
	}

	pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
		self.shared.events.subscribe()
	}

	/// Spawn the child and start draining its output into `handler`.
	///
	/// Must be called from within a tokio runtime. Returns the child's pid,
	/// which is also its process group id.
	pub fn start<H: OutputHandler>(&self, handler: H) -> Result<u32, ProcessError> {
		let mut state = self.shared.state();
		if let Phase::Running { .. } = state.phase {
			return Err(ProcessError::AlreadyRunning);
		}

		let mut cmd = self.command.to_command()?;
		let spawn_err = |source| ProcessError::Spawn {
			command: self.command.command_line().unwrap_or_default(),
			source,
		};
		let child = cmd.spawn().map_err(spawn_err)?;
		let pid = child
			.id()
			.ok_or_else(|| spawn_err(io::Error::other("child exited before its pid was read")))?;

		state.phase = Phase::Running { pid };
		state.aborted = false;
		self.shared.exit.send_replace(None);
		drop(state);

		tracing::info!(pid, command = ?self.command.args, "child started");
		let _ = self.shared.events.send(ProcessEvent::Started { pid });
		tokio::spawn(drain(Arc::clone(&self.shared), child, handler));
		Ok(pid)
	}

	/// Kill the child and all of its descendants.
	///
	/// The run is reported as aborted even if the child was already on its
	/// way out when this was called. No-op when nothing is running.
	pub fn abort(&self) {
		let mut state = self.shared.state();
		let Phase::Running { pid } = state.phase else {
			return;
		};
		state.aborted = true;
		if let Some(pause) = state.pause.take() {
			if let Some(timer) = pause.timer {
				timer.abort();
			}
		}
		drop(state);

		tracing::info!(pid, "aborting child process group");
		if let Err(e) = signal_group(pid, Signal::SIGKILL) {
			tracing::debug!(pid, "kill failed (child probably gone): {}", e);
		}
	}

	/// Suspend the child. Calling this while already paused re-arms the
	/// auto-resume timer from now without suspending a second time.
	pub fn pause(&self, how: PauseFor) -> Result<(), ProcessError> {
		let mut state = self.shared.state();
		let Phase::Running { pid } = state.phase else {
			return Ok(());
		};

		match state.pause.take() {
			Some(previous) => {
				if let Some(timer) = previous.timer {
					timer.abort();
				}
			}
			None => {
				self.shared.suspender.suspend(pid).map_err(ProcessError::Signal)?;
				state.suspensions += 1;
			}
		}

		state.pause_generation += 1;
		let generation = state.pause_generation;
		let (until, timer) = match how {
			PauseFor::Indefinitely => (PausedUntil::Indefinitely, None),
			PauseFor::Duration(duration) => {
				let due = Instant::now() + duration;
				let shared = Arc::clone(&self.shared);
				let timer = tokio::spawn(async move {
					tokio::time::sleep_until(due).await;
					if let Err(e) = shared.resume(Some(generation)) {
						tracing::warn!("automatic resume failed: {}", e);
					}
				});
				(PausedUntil::At(due), Some(timer))
			}
		};
		state.pause = Some(PauseState { until, timer });
		// sent under the lock so it is always queued before `Exited`
		let _ = self.shared.events.send(ProcessEvent::Paused { until });
		drop(state);

		tracing::info!(pid, ?until, "child paused");
		Ok(())
	}

	pub fn resume(&self) -> Result<(), ProcessError> {
		self.shared.resume(None)
	}

	pub fn paused_until(&self) -> Option<PausedUntil> {
		self.shared.state().pause.as_ref().map(|p| p.until)
	}

	pub fn state(&self) -> ChildState {
		let state = self.shared.state();
		match state.phase {
			Phase::NotStarted => ChildState::NotStarted,
			Phase::Running { .. } if state.pause.is_some() => ChildState::Paused,
			Phase::Running { .. } => ChildState::Running,
			Phase::Finished(info) if info.aborted => ChildState::Aborted,
			Phase::Finished(_) => ChildState::Exited,
		}
	}

	/// How many times the child has actually been stopped since creation.
	pub fn suspensions(&self) -> u64 {
		self.shared.state().suspensions
	}

	/// Outcome of the most recent run, once it has fully finished.
	pub fn last_exit(&self) -> Option<ExitInfo> {
		match self.shared.state().phase {
			Phase::Finished(info) => Some(info),
			_ => None,
		}
	}

	/// Resolves once the child has been reaped and its output fully drained.
	/// Returns `None` if the child was never started.
	pub async fn wait(&self) -> Option<ExitInfo> {
		let not_started = matches!(self.shared.state().phase, Phase::NotStarted);
		if not_started {
			return None;
		}
		let mut rx = self.shared.exit.subscribe();
		// bound to a local so the borrow of `rx` ends before it is dropped
		let info = match rx.wait_for(Option::is_some).await {
			Ok(info) => *info,
			Err(_) => None,
		};
		info
	}
}

impl Shared {
	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// `generation` is set when called by an auto-resume timer; a timer that
	/// was superseded by a later pause must not resume the child.
	fn resume(&self, generation: Option<u64>) -> Result<(), ProcessError> {
		let mut state = self.state();
		let Phase::Running { pid } = state.phase else {
			return Ok(());
		};
		if generation.is_some_and(|g| g != state.pause_generation) {
			return Ok(());
		}
		if state.pause.is_none() {
			return Ok(());
		}
		// still paused if the group could not be continued
		self.suspender.resume(pid).map_err(ProcessError::Signal)?;
		if let Some(pause) = state.pause.take() {
			if generation.is_none() {
				if let Some(timer) = pause.timer {
					timer.abort();
				}
			}
		}
		let _ = self.events.send(ProcessEvent::Resumed);
		drop(state);

		tracing::info!(pid, "child resumed");
		Ok(())
	}

	fn finish(&self, exit_code: i32) -> ExitInfo {
		let mut state = self.state();
		if let Some(pause) = state.pause.take() {
			if let Some(timer) = pause.timer {
				timer.abort();
			}
		}
		let info = ExitInfo { exit_code, aborted: state.aborted };
		state.phase = Phase::Finished(info);
		drop(state);

		tracing::info!(exit_code, aborted = info.aborted, "child finished");
		self.exit.send_replace(Some(info));
		let _ = self.events.send(ProcessEvent::Exited(info));
		info
	}
}

async fn drain<H: OutputHandler>(shared: Arc<Shared>, mut child: Child, mut handler: H) {
	let mut stdout = child.stdout.take();
	let mut stderr = child.stderr.take();
	let mut out_buf = vec![0u8; READ_BUF_SIZE];
	let mut err_buf = vec![0u8; READ_BUF_SIZE];
	let mut out_dec = Utf8StreamDecoder::new();
	let mut err_dec = Utf8StreamDecoder::new();
	let mut status: Option<io::Result<ExitStatus>> = None;
	let mut deadline: Option<Instant> = None;

	loop {
		if status.is_some() && stdout.is_none() && stderr.is_none() {
			break;
		}
		tokio::select! {
			read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => match read {
				Ok(n) if n > 0 => deliver(Stream::Stdout, &out_buf[..n], &mut out_dec, &mut handler),
				Ok(_) => stdout = None,
				Err(e) => {
					tracing::warn!("reading stdout failed: {}", e);
					stdout = None;
				}
			},
			read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => match read {
				Ok(n) if n > 0 => deliver(Stream::Stderr, &err_buf[..n], &mut err_dec, &mut handler),
				Ok(_) => stderr = None,
				Err(e) => {
					tracing::warn!("reading stderr failed: {}", e);
					stderr = None;
				}
			},
			exited = child.wait(), if status.is_none() => {
				status = Some(exited);
				deadline = Some(Instant::now() + DRAIN_GRACE);
			},
			_ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
				tracing::debug!("output pipes still open after exit; stopping the drain");
				break;
			},
		}
	}

	for (stream, dec) in [(Stream::Stdout, &mut out_dec), (Stream::Stderr, &mut err_dec)] {
		let tail = dec.finish();
		if !tail.is_empty() {
			handler.on_text(stream, &tail);
		}
	}

	let exit_code = match status {
		Some(Ok(status)) => exit_code_of(status),
		Some(Err(e)) => {
			tracing::warn!("waiting for the child failed: {}", e);
			-1
		}
		None => -1,
	};
	shared.finish(exit_code);
}

async fn read_some<R: AsyncRead + Unpin>(reader: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
	match reader {
		Some(reader) => reader.read(buf).await,
		None => std::future::pending().await,
	}
}

fn deliver<H: OutputHandler>(stream: Stream, bytes: &[u8], decoder: &mut Utf8StreamDecoder, handler: &mut H) {
	handler.on_bytes(stream, bytes);
	let text = decoder.append_bytes(bytes);
	if !text.is_empty() {
		handler.on_text(stream, &text);
	}
}

/// Killed-by-signal is reported the way shells do: 128 + signal number.
fn exit_code_of(status: ExitStatus) -> i32 {
	status
		.code()
		.or_else(|| status.signal().map(|sig| 128 + sig))
		.unwrap_or(-1)
}
