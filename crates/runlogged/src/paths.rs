use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppPaths {
	pub app_name: String,
}

impl AppPaths {
	pub fn new(app_name: impl Into<String>) -> Self {
		Self { app_name: app_name.into() }
	}

	pub fn config_dir(&self) -> PathBuf {
		config_dir_from(&self.app_name, std::env::var("XDG_CONFIG_HOME").ok(), home_dir())
	}

	pub fn config_file(&self) -> PathBuf {
		self.config_dir().join("config.toml")
	}
}

fn config_dir_from(app_name: &str, xdg: Option<String>, home: Option<PathBuf>) -> PathBuf {
	match (xdg.filter(|d| !d.is_empty()), home) {
		(Some(dir), _) => PathBuf::from(dir).join(app_name),
		(None, Some(home)) => home.join(".config").join(app_name),
		(None, None) => PathBuf::from("/tmp").join(app_name).join("config"),
	}
}

fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}
