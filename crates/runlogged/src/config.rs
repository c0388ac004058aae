use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

// ── Settings file (~/.config/runlogged/config.toml) ─────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
	#[serde(default)]
	pub log: LogSettings,
	pub telegram: Option<TelegramSettings>,
	#[serde(default)]
	pub ping: PingSettings,
	#[serde(default)]
	pub pause: PauseSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
	#[serde(default = "default_true")]
	pub enabled: bool,
	/// Used when `--log` is not given. Relative paths are resolved against
	/// the command's working directory.
	#[serde(default = "default_pattern")]
	pub pattern: String,
	#[serde(default)]
	pub days_to_keep: u32,
	#[serde(default)]
	pub max_total_size_kb: u64,
}

impl Default for LogSettings {
	fn default() -> Self {
		Self { enabled: true, pattern: default_pattern(), days_to_keep: 0, max_total_size_kb: 0 }
	}
}

fn default_true() -> bool { true }
fn default_pattern() -> String { "{name}--{daily}.log".into() }

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSettings {
	pub info_bot_token: Option<String>,
	pub warn_bot_token: Option<String>,
	pub recipient: Option<String>,
	#[serde(default)]
	pub notify_on_success: bool,
	/// Shown in front of every message; defaults to the host name.
	pub machine_name: Option<String>,
	#[serde(default = "default_telegram_api")]
	pub api_url: String,
}

fn default_telegram_api() -> String { "https://api.telegram.org".into() }

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PingSettings {
	/// `{{{ok}}}` becomes `1` or `0`, `{{{msg}}}` a URL-encoded summary.
	pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PauseSettings {
	/// How long SIGUSR1 pauses the command for, e.g. `"30m"`. Unset means
	/// until SIGUSR2.
	#[serde(default, with = "humantime_opt")]
	pub duration: Option<Duration>,
}

mod humantime_opt {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		match Option::<String>::deserialize(d)? {
			Some(s) => humantime::parse_duration(&s).map(Some).map_err(serde::de::Error::custom),
			None => Ok(None),
		}
	}
}

/// A missing file means defaults; a file that exists but cannot be read or
/// parsed is an error.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
	if !path.exists() {
		return Ok(Settings::default());
	}
	let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
	toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}
