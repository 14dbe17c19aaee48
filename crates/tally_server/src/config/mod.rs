#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.tally/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tally").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
	pub store: StoreSettings,
	pub notify: NotifySettings,
	pub live: LiveSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Admin/operational HTTP bind address (host:port).
	pub admin_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

/// Twitch settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	/// EventSub websocket URL (optional override).
	pub eventsub_ws_url: Option<String>,
	/// Helix API base URL (optional override).
	pub helix_base_url: Option<String>,
	/// Per-session decoded-message channel capacity.
	pub session_channel_capacity: Option<usize>,
}

/// Tenant store settings.
#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
	/// Database URL (sqlite:). Absent means the in-memory store.
	pub database_url: Option<String>,
}

/// Outbound notification settings.
#[derive(Debug, Clone, Default)]
pub struct NotifySettings {
	/// Webhook endpoint for session-start notifications. Absent means
	/// notifications are logged only.
	pub webhook_url: Option<String>,
}

/// Connection-manager settings.
#[derive(Debug, Clone, Default)]
pub struct LiveSettings {
	/// Slack on top of the negotiated keepalive before the watchdog fires.
	pub keepalive_grace: Option<Duration>,
	/// Pause between teardown and resubscribe in a recycle.
	pub restart_delay: Option<Duration>,
	/// Attempt ceiling for rate-limited subscription creates.
	pub provision_max_attempts: Option<u32>,
	/// First retry delay for rate-limited creates; doubles per attempt.
	pub provision_backoff_base: Option<Duration>,

	/// Tenants to subscribe at boot.
	pub autostart_tenants: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	notify: FileNotifySettings,

	#[serde(default)]
	live: FileLiveSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	admin_bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	eventsub_ws_url: Option<String>,
	helix_base_url: Option<String>,
	session_channel_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNotifySettings {
	webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLiveSettings {
	keepalive_grace_secs: Option<u64>,
	restart_delay_ms: Option<u64>,
	provision_max_attempts: Option<u32>,
	provision_backoff_base_ms: Option<u64>,

	#[serde(default)]
	autostart_tenants: Vec<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			server: ServerSettings {
				admin_bind: file.server.admin_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			twitch: TwitchSettings {
				eventsub_ws_url: file.twitch.eventsub_ws_url.filter(|s| !s.trim().is_empty()),
				helix_base_url: file.twitch.helix_base_url.filter(|s| !s.trim().is_empty()),
				session_channel_capacity: file.twitch.session_channel_capacity,
			},
			store: StoreSettings {
				database_url: file.store.database_url.filter(|s| !s.trim().is_empty()),
			},
			notify: NotifySettings {
				webhook_url: file.notify.webhook_url.filter(|s| !s.trim().is_empty()),
			},
			live: LiveSettings {
				keepalive_grace: file.live.keepalive_grace_secs.map(Duration::from_secs),
				restart_delay: file.live.restart_delay_ms.map(Duration::from_millis),
				provision_max_attempts: file.live.provision_max_attempts,
				provision_backoff_base: file.live.provision_backoff_base_ms.map(Duration::from_millis),
				autostart_tenants: file
					.live
					.autostart_tenants
					.into_iter()
					.filter(|s| !s.trim().is_empty())
					.collect(),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("TALLY_ADMIN_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.admin_bind = Some(v);
			info!("server config: admin_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TALLY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TALLY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.store.database_url = Some(v);
			info!("server config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TALLY_WEBHOOK_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.notify.webhook_url = Some(v);
			info!("server config: webhook_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TALLY_EVENTSUB_WS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.eventsub_ws_url = Some(v);
			info!("server config: eventsub_ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("TALLY_HELIX_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.twitch.helix_base_url = Some(v);
			info!("server config: helix_base_url overridden by env");
		}
	}
}
