use async_trait::async_trait;
use kiroku::{Notifier, NotifyError, Outcome, RunRecord};
use serde_json::json;

use crate::config::TelegramSettings;

const NAME: &str = "telegram";
/// Telegram rejects longer messages.
const MAX_MESSAGE_CHARS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bot {
	Info,
	Warn,
}

/// Posts run results to a Telegram chat through one of two bots: failures
/// and warnings go to the warn bot, successes (when wanted) to the info bot.
pub struct TelegramNotifier {
	client: reqwest::Client,
	settings: TelegramSettings,
	sender: String,
}

impl TelegramNotifier {
	pub fn new(client: reqwest::Client, settings: TelegramSettings, command_name: &str) -> Self {
		let machine = settings.machine_name.clone().unwrap_or_else(host_name);
		let sender = format!("<b>{}</b> - <b>{}</b>", html_escape(&machine), html_escape(command_name));
		Self { client, settings, sender }
	}

	async fn send(&self, bot: Bot, html: &str) -> Result<(), NotifyError> {
		let token = match bot {
			Bot::Info => self.settings.info_bot_token.as_deref(),
			Bot::Warn => self.settings.warn_bot_token.as_deref(),
		};
		let (Some(token), Some(recipient)) = (token, self.settings.recipient.as_deref()) else {
			return Err(NotifyError::Config {
				notifier: NAME,
				message: format!("skipping send because the {:?} bot token or the recipient is not set", bot),
			});
		};

		let text = self.message(html);
		tracing::debug!(?bot, "sending telegram message");
		let url = format!("{}/bot{}/sendMessage", self.settings.api_url.trim_end_matches('/'), token);
		let resp = self
			.client
			.post(&url)
			.json(&json!({ "chat_id": recipient, "parse_mode": "HTML", "text": text }))
			.send()
			.await
			// the error's URL would contain the bot token
			.map_err(|e| NotifyError::Transport { notifier: NAME, message: e.without_url().to_string() })?;

		let status = resp.status();
		if status.as_u16() != 200 {
			let body = resp.text().await.unwrap_or_default();
			return Err(NotifyError::Rejected { notifier: NAME, status: status.as_u16(), body });
		}
		Ok(())
	}

	fn message(&self, html: &str) -> String {
		format!("{}:\n{}", self.sender, html)
	}

	/// Summary plus as much of the end of the log as still fits.
	fn failure_html(&self, record: &RunRecord, outcome: &Outcome, excerpt: &str) -> String {
		let summary = html_escape(&outcome.summary(record.duration()));
		let overhead = self.message("").chars().count() + summary.chars().count() + "\n<pre></pre>".len();
		let room = MAX_MESSAGE_CHARS.saturating_sub(overhead);
		let tail = escaped_tail(excerpt.trim_end(), room);
		if tail.is_empty() {
			summary
		} else {
			format!("{}\n<pre>{}</pre>", summary, tail)
		}
	}
}

#[async_trait]
impl Notifier for TelegramNotifier {
	fn name(&self) -> &'static str {
		NAME
	}

	async fn status(&self, record: &RunRecord, outcome: &Outcome) -> Result<(), NotifyError> {
		if !record.warnings.is_empty() && self.settings.warn_bot_token.is_some() {
			let warnings: Vec<String> = record.warnings.iter().map(|w| html_escape(w)).collect();
			self.send(Bot::Warn, &warnings.join("\n")).await?;
		}
		if outcome.is_success() && self.settings.notify_on_success {
			self.send(Bot::Info, &html_escape(&outcome.summary(record.duration()))).await?;
		}
		Ok(())
	}

	async fn failure(&self, record: &RunRecord, outcome: &Outcome, excerpt: &str) -> Result<(), NotifyError> {
		if self.settings.warn_bot_token.is_none() {
			return Ok(());
		}
		self.send(Bot::Warn, &self.failure_html(record, outcome, excerpt)).await
	}
}

/// Longest suffix of `text` whose escaped form fits in `max_chars`, cut at a
/// line start where possible.
fn escaped_tail(text: &str, max_chars: usize) -> String {
	let mut used = 0;
	let mut start = text.len();
	for (i, ch) in text.char_indices().rev() {
		let cost = match ch {
			'&' => 5,
			'<' | '>' => 4,
			_ => 1,
		};
		if used + cost > max_chars {
			break;
		}
		used += cost;
		start = i;
	}
	let mut tail = &text[start..];
	if start > 0 {
		if let Some(newline) = tail.find('\n') {
			tail = &tail[newline + 1..];
		}
	}
	html_escape(tail)
}

fn html_escape(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for ch in s.chars() {
		match ch {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			_ => out.push(ch),
		}
	}
	out
}

fn host_name() -> String {
	nix::unistd::gethostname()
		.ok()
		.and_then(|h| h.into_string().ok())
		.unwrap_or_else(|| "localhost".into())
}
