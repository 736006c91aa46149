#![forbid(unsafe_code)]

pub mod tokens;

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relaybot_core::{ChannelSettings, ConnectorConfig, MonitorConfig};
use relaybot_domain::{ChannelLogin, ConsumerId};
use relaybot_platform::twitch::{DEFAULT_EVENTSUB_WS_URL, DEFAULT_HELIX_BASE_URL, DEFAULT_IRC_WS_URL};
use relaybot_platform::{SecretString, Tokens};
use serde::Deserialize;
use tracing::{info, warn};

/// Default config directory: `~/.relaybot`.
pub fn default_config_dir() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relaybot"))
}

/// Default config path: `~/.relaybot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	Ok(default_config_dir()?.join("config.toml"))
}

/// Load the server config from TOML, then apply `RELAYBOT_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let default_tokens_path = path
		.parent()
		.map(|dir| dir.join("tokens.toml"))
		.unwrap_or_else(|| PathBuf::from("tokens.toml"));
	let mut cfg = ServerConfig::from_file(file_cfg, default_tokens_path)?;

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
	pub connector: ConnectorConfig,
	pub monitor: MonitorConfig,
	pub consumers: Vec<ConsumerSettings>,
	/// Where refreshed OAuth tokens are persisted.
	pub tokens_path: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness/status HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	/// Needed for token refresh and the interactive code exchange.
	pub client_secret: Option<SecretString>,
	/// Account the bot chats as.
	pub bot_login: Option<String>,

	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,

	/// Run the browser authorization flow when validate and refresh both fail.
	pub allow_interactive_auth: bool,
	pub redirect_bind: Option<SocketAddr>,
	pub redirect_uri: Option<String>,
	/// Empty means the platform defaults.
	pub scopes: Vec<String>,

	pub helix_base_url: String,
	pub eventsub_ws_url: String,
	pub irc_ws_url: String,

	pub max_message_chars: Option<usize>,
	pub chunk_chars: Option<usize>,
	pub continuation_delay: Option<Duration>,
	pub min_send_interval: Option<Duration>,
}

impl Default for TwitchSettings {
	fn default() -> Self {
		Self {
			client_id: None,
			client_secret: None,
			bot_login: None,
			access_token: None,
			refresh_token: None,
			allow_interactive_auth: false,
			redirect_bind: None,
			redirect_uri: None,
			scopes: Vec::new(),
			helix_base_url: DEFAULT_HELIX_BASE_URL.to_string(),
			eventsub_ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			irc_ws_url: DEFAULT_IRC_WS_URL.to_string(),
			max_message_chars: None,
			chunk_chars: None,
			continuation_delay: None,
			min_send_interval: None,
		}
	}
}

impl TwitchSettings {
	pub fn tokens(&self) -> Tokens {
		Tokens::new(self.access_token.clone(), self.refresh_token.clone())
	}
}

/// One `[[consumers]]` entry: a community served by the built-in log sink.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
	pub id: ConsumerId,
	pub channel: ChannelLogin,
	pub settings: ChannelSettings,
	/// Announcement template sent on a fresh stream start.
	/// `{channel}`, `{title}` and `{category}` are substituted.
	pub announce_on_start: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	supervisor: FileSupervisorSettings,

	#[serde(default)]
	monitor: FileMonitorSettings,

	#[serde(default)]
	consumers: Vec<FileConsumerSettings>,

	tokens_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	bot_login: Option<String>,
	access_token: Option<String>,
	refresh_token: Option<String>,
	allow_interactive_auth: Option<bool>,
	redirect_bind: Option<String>,
	redirect_uri: Option<String>,
	#[serde(default)]
	scopes: Vec<String>,

	helix_base_url: Option<String>,
	eventsub_ws_url: Option<String>,
	irc_ws_url: Option<String>,

	max_message_chars: Option<usize>,
	chunk_chars: Option<usize>,
	continuation_delay_ms: Option<u64>,
	min_send_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSupervisorSettings {
	warm_up_secs: Option<u64>,
	poll_interval_secs: Option<u64>,
	backoff_step_secs: Option<u64>,
	backoff_cap_secs: Option<u64>,
	live_tick_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileMonitorSettings {
	interval_secs: Option<u64>,
	batch_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileConsumerSettings {
	id: String,
	channel: String,
	#[serde(default)]
	command_prefixes: Vec<String>,
	force_reconnect_after_secs: Option<u64>,
	one_shot_window_secs: Option<u64>,
	inactivity_window_secs: Option<u64>,
	reward_base: Option<u64>,
	reward_bonus: Option<u64>,
	follow_cooldown_secs: Option<u64>,
	announce_on_start: Option<String>,
}

fn non_blank(s: Option<String>) -> Option<String> {
	s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secs_or(v: Option<u64>, default: Duration) -> Duration {
	v.filter(|v| *v > 0).map(Duration::from_secs).unwrap_or(default)
}

impl FileConsumerSettings {
	fn normalize(self) -> anyhow::Result<ConsumerSettings> {
		let id = ConsumerId::new(self.id.trim()).context("consumer id")?;
		let channel = ChannelLogin::new(self.channel.as_str()).with_context(|| format!("consumer {id}: channel"))?;

		let defaults = ChannelSettings::default();
		let prefixes: Vec<String> = self
			.command_prefixes
			.into_iter()
			.filter(|p| !p.trim().is_empty())
			.collect();
		let settings = ChannelSettings {
			force_reconnect_after: secs_or(self.force_reconnect_after_secs, defaults.force_reconnect_after),
			one_shot_window: secs_or(self.one_shot_window_secs, defaults.one_shot_window),
			inactivity_window: secs_or(self.inactivity_window_secs, defaults.inactivity_window),
			reward_base: self.reward_base.unwrap_or(defaults.reward_base),
			reward_bonus: self.reward_bonus.unwrap_or(defaults.reward_bonus),
			follow_cooldown: secs_or(self.follow_cooldown_secs, defaults.follow_cooldown),
			command_prefixes: if prefixes.is_empty() {
				defaults.command_prefixes
			} else {
				prefixes
			},
		};

		Ok(ConsumerSettings {
			id,
			channel,
			settings,
			announce_on_start: non_blank(self.announce_on_start),
		})
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig, default_tokens_path: PathBuf) -> anyhow::Result<Self> {
		let t = file.twitch;
		let redirect_bind = match non_blank(t.redirect_bind) {
			Some(bind) => Some(
				bind.parse::<SocketAddr>()
					.with_context(|| format!("twitch.redirect_bind {bind:?} (expected host:port)"))?,
			),
			None => None,
		};
		let twitch = TwitchSettings {
			client_id: non_blank(t.client_id),
			client_secret: non_blank(t.client_secret).map(SecretString::new),
			bot_login: non_blank(t.bot_login).map(|l| l.to_ascii_lowercase()),
			access_token: non_blank(t.access_token).map(SecretString::new),
			refresh_token: non_blank(t.refresh_token).map(SecretString::new),
			allow_interactive_auth: t.allow_interactive_auth.unwrap_or(false),
			redirect_bind,
			redirect_uri: non_blank(t.redirect_uri),
			scopes: t.scopes.into_iter().filter(|s| !s.trim().is_empty()).collect(),
			helix_base_url: non_blank(t.helix_base_url).unwrap_or_else(|| DEFAULT_HELIX_BASE_URL.to_string()),
			eventsub_ws_url: non_blank(t.eventsub_ws_url).unwrap_or_else(|| DEFAULT_EVENTSUB_WS_URL.to_string()),
			irc_ws_url: non_blank(t.irc_ws_url).unwrap_or_else(|| DEFAULT_IRC_WS_URL.to_string()),
			max_message_chars: t.max_message_chars.filter(|v| *v > 0),
			chunk_chars: t.chunk_chars.filter(|v| *v > 0),
			continuation_delay: t.continuation_delay_ms.map(Duration::from_millis),
			min_send_interval: t.min_send_interval_ms.map(Duration::from_millis),
		};

		let mut connector = ConnectorConfig::default();
		let s = file.supervisor;
		connector.supervisor.warm_up = secs_or(s.warm_up_secs, connector.supervisor.warm_up);
		connector.supervisor.poll_interval = secs_or(s.poll_interval_secs, connector.supervisor.poll_interval);
		connector.supervisor.backoff_step = secs_or(s.backoff_step_secs, connector.supervisor.backoff_step);
		connector.supervisor.backoff_cap = secs_or(s.backoff_cap_secs, connector.supervisor.backoff_cap);
		connector.live_tick_interval = secs_or(s.live_tick_interval_secs, connector.live_tick_interval);

		let mut monitor = MonitorConfig::default();
		monitor.interval = secs_or(file.monitor.interval_secs, monitor.interval);
		if let Some(batch) = file.monitor.batch_size.filter(|b| *b > 0) {
			monitor.batch_size = batch;
		}

		let consumers = file
			.consumers
			.into_iter()
			.map(FileConsumerSettings::normalize)
			.collect::<anyhow::Result<Vec<_>>>()?;

		Ok(Self {
			server: ServerSettings {
				metrics_bind: non_blank(file.server.metrics_bind),
				health_bind: non_blank(file.server.health_bind),
			},
			twitch,
			connector,
			monitor,
			consumers,
			tokens_path: non_blank(file.tokens_path)
				.map(PathBuf::from)
				.unwrap_or(default_tokens_path),
		})
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
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

fn apply_env_overrides<F>(cfg: &mut ServerConfig, env: F)
where
	F: Fn(&str) -> Option<String>,
{
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("RELAYBOT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = var("RELAYBOT_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TOKENS_PATH") {
		cfg.tokens_path = PathBuf::from(v);
		info!("server config: tokens_path overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_BOT_LOGIN") {
		cfg.twitch.bot_login = Some(v.to_ascii_lowercase());
		info!("twitch config: bot_login overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_ACCESS_TOKEN") {
		cfg.twitch.access_token = Some(SecretString::new(v));
		info!("twitch config: access_token overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_REFRESH_TOKEN") {
		cfg.twitch.refresh_token = Some(SecretString::new(v));
		info!("twitch config: refresh_token overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_ALLOW_INTERACTIVE_AUTH")
		&& let Some(allow) = parse_env_bool(&v)
	{
		cfg.twitch.allow_interactive_auth = allow;
		info!(allow, "twitch config: allow_interactive_auth overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = v;
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_EVENTSUB_WS_URL") {
		cfg.twitch.eventsub_ws_url = v;
		info!("twitch config: eventsub_ws_url overridden by env");
	}

	if let Some(v) = var("RELAYBOT_TWITCH_IRC_WS_URL") {
		cfg.twitch.irc_ws_url = v;
		info!("twitch config: irc_ws_url overridden by env");
	}

	if let Some(v) = var("RELAYBOT_MONITOR_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
		&& secs > 0
	{
		cfg.monitor.interval = Duration::from_secs(secs);
		info!(secs, "monitor config: interval overridden by env");
	}

	if cfg.twitch.client_id.is_none() {
		warn!("twitch config: no client_id configured");
	}
	if cfg.twitch.client_secret.is_none() {
		warn!("twitch config: no client_secret; tokens cannot be refreshed");
	}

	if cfg.connector.supervisor.backoff_step > cfg.connector.supervisor.backoff_cap {
		warn!(
			step_secs = cfg.connector.supervisor.backoff_step.as_secs(),
			cap_secs = cfg.connector.supervisor.backoff_cap.as_secs(),
			"supervisor config: backoff_step > backoff_cap; clamping"
		);
		cfg.connector.supervisor.backoff_step = cfg.connector.supervisor.backoff_cap;
	}
}
