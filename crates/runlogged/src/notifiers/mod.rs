mod ping;
mod telegram;

pub use ping::PingUrlNotifier;
pub use telegram::TelegramNotifier;

use kiroku::Notifier;

use crate::config::Settings;

/// Every notifier the settings and flags ask for, sharing one HTTP client.
pub fn from_settings(
	settings: &Settings,
	ping_url: Option<&str>,
	command_name: &str,
) -> anyhow::Result<Vec<Box<dyn Notifier>>> {
	let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();
	let ping_url = ping_url.or(settings.ping.url.as_deref());
	if ping_url.is_none() && settings.telegram.is_none() {
		return Ok(notifiers);
	}

	let client = reqwest::Client::builder()
		.timeout(std::time::Duration::from_secs(30))
		.user_agent(concat!("runlogged/", env!("CARGO_PKG_VERSION")))
		.build()?;

	if let Some(url) = ping_url {
		notifiers.push(Box::new(PingUrlNotifier::new(client.clone(), url)));
	}
	if let Some(telegram) = &settings.telegram {
		notifiers.push(Box::new(TelegramNotifier::new(client, telegram.clone(), command_name)));
	}
	Ok(notifiers)
}
