//! Configuration for margin services.
//!
//! Configuration is a single TOML file. Every key is optional; a missing file yields the
//! defaults. Unknown keys are rejected so typos surface instead of being silently ignored.
//!
//! # Configuration Files
//!
//! 1. The path passed on the command line, if any
//! 2. `$XDG_CONFIG_HOME/margin/config.toml` (or `~/.config/margin/config.toml`)
//!
//! # Schema
//!
//! ```toml
//! [streamer]
//! url = "wss://annotations.example/ws"
//! access_token = "..."
//! reconnect_base_ms = 1000
//! max_reconnect_attempts = 10
//! highlight_ms = 2000
//! apply_immediately = false
//!
//! [sync]
//! anchor_timeout_ms = 500
//! anchoring_debounce_ms = 10
//!
//! [discovery]
//! apps_origin = "https://apps.example"
//! poll_interval_ms = 250
//! timeout_ms = 20000
//!
//! [stream]
//! group = "__world__"
//! uris = ["https://example.com/article"]
//! ```

pub mod error;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use error::{ConfigError, Result};
use serde::Deserialize;

/// Push connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamerSection {
	/// Push endpoint URL.
	pub url: Option<String>,
	/// Credential attached to the connection URL.
	pub access_token: Option<String>,
	/// Backoff unit in milliseconds.
	pub reconnect_base_ms: u64,
	/// Retries after an unexpected close before giving up.
	pub max_reconnect_attempts: u32,
	/// How long live changes stay highlighted in apply-immediately mode.
	pub highlight_ms: u64,
	/// Apply incoming changes straight away instead of buffering them.
	pub apply_immediately: bool,
}

impl Default for StreamerSection {
	fn default() -> Self {
		Self {
			url: None,
			access_token: None,
			reconnect_base_ms: 1000,
			max_reconnect_attempts: 10,
			highlight_ms: 2000,
			apply_immediately: false,
		}
	}
}

impl StreamerSection {
	pub fn reconnect_base(&self) -> Duration {
		Duration::from_millis(self.reconnect_base_ms)
	}

	pub fn highlight_duration(&self) -> Duration {
		Duration::from_millis(self.highlight_ms)
	}
}

/// Annotation collection timing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
	/// Time after which an unanchored annotation is considered an orphan.
	pub anchor_timeout_ms: u64,
	/// Window over which guest anchoring reports are coalesced.
	pub anchoring_debounce_ms: u64,
}

impl Default for SyncSection {
	fn default() -> Self {
		Self {
			anchor_timeout_ms: 500,
			anchoring_debounce_ms: 10,
		}
	}
}

impl SyncSection {
	pub fn anchor_timeout(&self) -> Duration {
		Duration::from_millis(self.anchor_timeout_ms)
	}

	pub fn anchoring_debounce(&self) -> Duration {
		Duration::from_millis(self.anchoring_debounce_ms)
	}
}

/// Discovery handshake settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoverySection {
	/// Origin trusted to request sidebar and notebook links.
	pub apps_origin: String,
	pub poll_interval_ms: u64,
	pub timeout_ms: u64,
}

impl Default for DiscoverySection {
	fn default() -> Self {
		Self {
			apps_origin: "https://apps.margin.invalid".to_string(),
			poll_interval_ms: 250,
			timeout_ms: 20_000,
		}
	}
}

impl DiscoverySection {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}
}

/// Stream view selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSection {
	/// Only show changes in this group.
	pub group: Option<String>,
	/// Only show changes on these documents.
	pub uris: Vec<String>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	pub streamer: StreamerSection,
	pub sync: SyncSection,
	pub discovery: DiscoverySection,
	pub stream: StreamSection,
}

impl Config {
	/// Parse a TOML string into a [`Config`].
	pub fn parse(input: &str) -> Result<Self> {
		let config: Config = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Load configuration from a file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
			path: path.to_path_buf(),
			error: e,
		})?;
		Self::parse(&content)
	}

	/// Load configuration from a file, falling back to defaults if it does not exist.
	pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
		match Self::load(path) {
			Err(ConfigError::Io { error, .. }) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
			other => other,
		}
	}

	fn validate(&self) -> Result<()> {
		if self.streamer.reconnect_base_ms == 0 {
			return Err(ConfigError::InvalidValue {
				key: "streamer.reconnect_base_ms",
				reason: "must be positive",
			});
		}
		if self.discovery.poll_interval_ms == 0 {
			return Err(ConfigError::InvalidValue {
				key: "discovery.poll_interval_ms",
				reason: "must be positive",
			});
		}
		Ok(())
	}
}

/// Default configuration file location.
pub fn default_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join("margin").join("config.toml"))
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn empty_input_yields_defaults() {
		let config = Config::parse("").unwrap();
		assert_eq!(config, Config::default());
		assert_eq!(config.sync.anchor_timeout(), Duration::from_millis(500));
		assert_eq!(config.sync.anchoring_debounce(), Duration::from_millis(10));
		assert_eq!(config.streamer.max_reconnect_attempts, 10);
	}

	#[test]
	fn partial_sections_keep_other_defaults() {
		let config = Config::parse(
			r#"
			[streamer]
			url = "ws://localhost:5001/ws"
			apply_immediately = true

			[stream]
			uris = ["http://x/1"]
			"#,
		)
		.unwrap();
		assert_eq!(config.streamer.url.as_deref(), Some("ws://localhost:5001/ws"));
		assert!(config.streamer.apply_immediately);
		assert_eq!(config.streamer.reconnect_base(), Duration::from_secs(1));
		assert_eq!(config.stream.uris, vec!["http://x/1".to_string()]);
	}

	#[test]
	fn unknown_keys_are_rejected() {
		let err = Config::parse("[streamer]\nurll = \"x\"\n").unwrap_err();
		assert!(matches!(err, ConfigError::Toml(_)));
	}

	#[test]
	fn zero_backoff_is_rejected() {
		let err = Config::parse("[streamer]\nreconnect_base_ms = 0\n").unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { key: "streamer.reconnect_base_ms", .. }));
	}

	#[test]
	fn missing_file_falls_back_to_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("absent.toml");
		assert_eq!(Config::load_or_default(&path).unwrap(), Config::default());
		assert!(matches!(Config::load(&path), Err(ConfigError::Io { .. })));
	}

	#[test]
	fn loads_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.toml");
		std::fs::write(&path, "[sync]\nanchor_timeout_ms = 50\n").unwrap();
		assert_eq!(Config::load(&path).unwrap().sync.anchor_timeout_ms, 50);
	}
}
