use async_trait::async_trait;

use crate::outcome::{Outcome, RunRecord};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
	#[error("{notifier}: request failed: {message}")]
	Transport { notifier: &'static str, message: String },
	#[error("{notifier}: rejected with status {status}: {body}")]
	Rejected { notifier: &'static str, status: u16, body: String },
	#[error("{notifier}: {message}")]
	Config { notifier: &'static str, message: String },
}

/// Receives the finished run.
///
/// `status` is called for every run; `failure` additionally for failed or
/// aborted runs, with the part of the log this run wrote.
#[async_trait]
pub trait Notifier: Send + Sync {
	fn name(&self) -> &'static str;

	async fn status(&self, record: &RunRecord, outcome: &Outcome) -> Result<(), NotifyError>;

	async fn failure(&self, _record: &RunRecord, _outcome: &Outcome, _excerpt: &str) -> Result<(), NotifyError> {
		Ok(())
	}
}

/// Calls every notifier in turn and collects the errors as warning lines.
/// One notifier failing never stops the others.
pub async fn notify_all(
	notifiers: &[Box<dyn Notifier>],
	record: &RunRecord,
	outcome: &Outcome,
	excerpt: Option<&str>,
) -> Vec<String> {
	let mut warnings = Vec::new();
	for notifier in notifiers {
		if let Err(e) = notifier.status(record, outcome).await {
			tracing::warn!(notifier = notifier.name(), "status notification failed: {}", e);
			warnings.push(format!("could not send status notification: {}", e));
		}
		if outcome.is_success() {
			continue;
		}
		if let Err(e) = notifier.failure(record, outcome, excerpt.unwrap_or("")).await {
			tracing::warn!(notifier = notifier.name(), "failure notification failed: {}", e);
			warnings.push(format!("could not send failure notification: {}", e));
		}
	}
	warnings
}
