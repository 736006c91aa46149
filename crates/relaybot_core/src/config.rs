#![forbid(unsafe_code)]

use std::time::Duration;

/// Static per-channel settings supplied by a consumer at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
	/// Chat down for longer than this triggers a cold restart.
	pub force_reconnect_after: Duration,
	/// Stream transitions older than this do not fire one-shot hooks.
	pub one_shot_window: Duration,
	/// Chatters silent for longer than this drop out of reward ticks.
	pub inactivity_window: Duration,
	pub reward_base: u64,
	pub reward_bonus: u64,
	pub follow_cooldown: Duration,
	/// Chat text starting with any of these goes to `handle_command`.
	pub command_prefixes: Vec<String>,
}

impl Default for ChannelSettings {
	fn default() -> Self {
		Self {
			force_reconnect_after: Duration::from_secs(180),
			one_shot_window: Duration::from_secs(10 * 60),
			inactivity_window: Duration::from_secs(15 * 60),
			reward_base: 1,
			reward_bonus: 1,
			follow_cooldown: Duration::from_secs(60 * 60),
			command_prefixes: vec!["!".to_string()],
		}
	}
}

/// Health loop timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
	pub warm_up: Duration,
	pub poll_interval: Duration,
	pub backoff_step: Duration,
	pub backoff_cap: Duration,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			warm_up: Duration::from_secs(60),
			poll_interval: Duration::from_secs(9),
			backoff_step: Duration::from_secs(60),
			backoff_cap: Duration::from_secs(600),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
	pub supervisor: SupervisorConfig,
	/// Reward tick cadence while the stream is online.
	pub live_tick_interval: Duration,
	pub event_channel_capacity: usize,
}

impl Default for ConnectorConfig {
	fn default() -> Self {
		Self {
			supervisor: SupervisorConfig::default(),
			live_tick_interval: Duration::from_secs(5 * 60),
			event_channel_capacity: 1_024,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
	pub interval: Duration,
	/// Logins per batched streams lookup.
	pub batch_size: usize,
}

impl Default for MonitorConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(120),
			batch_size: 100,
		}
	}
}
