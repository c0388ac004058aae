use std::io;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// Freezes and thaws a running child.
///
/// The child is spawned as the leader of its own process group, so `pid`
/// doubles as the group id and every descendant is reached.
pub trait Suspender: Send + Sync + 'static {
	fn suspend(&self, pid: u32) -> io::Result<()>;
	fn resume(&self, pid: u32) -> io::Result<()>;
}

/// SIGSTOP / SIGCONT to the child's process group.
///
/// A child that handles SIGCONT itself (or that installs a SIGTSTP-style
/// handler of its own) may observe the pause; there is no way to freeze a
/// process group without it being able to notice afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct GroupStop;

impl Suspender for GroupStop {
	fn suspend(&self, pid: u32) -> io::Result<()> {
		signal_group(pid, Signal::SIGSTOP)
	}

	fn resume(&self, pid: u32) -> io::Result<()> {
		signal_group(pid, Signal::SIGCONT)
	}
}

pub(crate) fn signal_group(pid: u32, signal: Signal) -> io::Result<()> {
	let pgid = i32::try_from(pid).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
	if pgid <= 1 {
		return Err(io::Error::from(io::ErrorKind::InvalidInput));
	}
	tracing::debug!(pgid, ?signal, "signalling process group");
	killpg(Pid::from_raw(pgid), signal).map_err(io::Error::from)
}
