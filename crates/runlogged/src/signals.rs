use std::io;
use std::time::Duration;

use kiroku::{AbortReason, PauseFor, RunControl};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::debug;

/// Forward process signals to the run. SIGINT, SIGTERM and SIGHUP abort it. SIGUSR1
/// pauses it (for `pause_for`, or until SIGUSR2), SIGUSR2 resumes it.
pub fn forward(control: RunControl, pause_for: Option<Duration>) -> io::Result<JoinHandle<()>> {
	let mut interrupt = signal(SignalKind::interrupt())?;
	let mut terminate = signal(SignalKind::terminate())?;
	let mut hangup = signal(SignalKind::hangup())?;
	let mut user1 = signal(SignalKind::user_defined1())?;
	let mut user2 = signal(SignalKind::user_defined2())?;

	Ok(tokio::spawn(async move {
		loop {
			select! {
				_ = interrupt.recv() => {
					debug!("received SIGINT");
					control.abort(AbortReason::Interrupted);
				}
				_ = terminate.recv() => {
					debug!("received SIGTERM");
					control.abort(AbortReason::Requested("SIGTERM".into()));
				}
				_ = hangup.recv() => {
					debug!("received SIGHUP");
					control.abort(AbortReason::Requested("SIGHUP".into()));
				}
				_ = user1.recv() => {
					debug!("received SIGUSR1");
					control.pause(pause_for.map_or(PauseFor::Indefinitely, PauseFor::Duration));
				}
				_ = user2.recv() => {
					debug!("received SIGUSR2");
					control.resume();
				}
			}
		}
	}))
}
