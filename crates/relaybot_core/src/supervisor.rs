#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;

/// Link health as last observed by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHealth {
	pub chat_connected: bool,
	pub event_sub_connected: bool,
	pub last_chat_change: Instant,
	/// 0..=cap; grows only on reconnect attempts, resets when the session comes up.
	pub event_sub_backoff: Duration,
	pub last_event_sub_attempt: Option<Instant>,
}

impl ConnectionHealth {
	pub fn new(now: Instant) -> Self {
		Self {
			chat_connected: false,
			event_sub_connected: false,
			last_chat_change: now,
			event_sub_backoff: Duration::ZERO,
			last_event_sub_attempt: None,
		}
	}

	pub fn reset(&mut self, now: Instant, chat_connected: bool, event_sub_connected: bool) {
		*self = Self::new(now);
		self.chat_connected = chat_connected;
		self.event_sub_connected = event_sub_connected;
	}

	/// `Connected`/`Reconnected` from the session.
	pub fn event_session_up(&mut self) {
		self.event_sub_connected = true;
		self.event_sub_backoff = Duration::ZERO;
	}

	pub fn event_session_down(&mut self) {
		self.event_sub_connected = false;
	}
}

/// Thresholds for one connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorPolicy {
	pub force_reconnect_after: Duration,
	pub backoff_step: Duration,
	pub backoff_cap: Duration,
}

impl SupervisorPolicy {
	pub fn new(cfg: &SupervisorConfig, force_reconnect_after: Duration) -> Self {
		Self {
			force_reconnect_after,
			backoff_step: cfg.backoff_step,
			backoff_cap: cfg.backoff_cap,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
	Idle,
	/// Chat has been down past the threshold: restart both transports.
	ColdRestart,
	/// Chat is fine but the event session is down and not rate-limited.
	ReconnectEventSession { backoff: Duration },
}

/// One supervisor tick over the observed connectivity.
pub fn evaluate(
	health: &mut ConnectionHealth,
	chat_connected: bool,
	event_connected: bool,
	policy: &SupervisorPolicy,
	now: Instant,
) -> TickAction {
	if health.chat_connected != chat_connected {
		health.chat_connected = chat_connected;
		health.last_chat_change = now;
	}
	if event_connected && !health.event_sub_connected {
		health.event_session_up();
	} else if !event_connected {
		health.event_session_down();
	}

	if !chat_connected {
		if now.saturating_duration_since(health.last_chat_change) > policy.force_reconnect_after {
			return TickAction::ColdRestart;
		}
		return TickAction::Idle;
	}

	if event_connected {
		return TickAction::Idle;
	}

	let rate_limited = health
		.last_event_sub_attempt
		.is_some_and(|last| now.saturating_duration_since(last) < health.event_sub_backoff);
	if rate_limited {
		return TickAction::Idle;
	}

	health.last_event_sub_attempt = Some(now);
	health.event_sub_backoff = (health.event_sub_backoff + policy.backoff_step).min(policy.backoff_cap);
	TickAction::ReconnectEventSession {
		backoff: health.event_sub_backoff,
	}
}

/// What the health loop drives.
#[async_trait::async_trait]
pub trait Supervised: Send + Sync {
	fn label(&self) -> String;
	fn chat_connected(&self) -> bool;
	fn event_session_connected(&self) -> bool;
	fn health(&self) -> &parking_lot::Mutex<ConnectionHealth>;
	async fn cold_restart(&self);
	async fn reconnect_event_session(&self);
}

/// Health loop: warm-up, then one `evaluate` per poll interval until cancelled.
pub async fn run_supervisor<S>(target: &S, cfg: &SupervisorConfig, policy: SupervisorPolicy, cancel: CancellationToken)
where
	S: Supervised + ?Sized,
{
	let label = target.label();
	tokio::select! {
		_ = cancel.cancelled() => return,
		_ = sleep(cfg.warm_up) => {}
	}
	debug!(channel = %label, "supervisor warm-up complete");

	loop {
		let action = {
			let chat = target.chat_connected();
			let event = target.event_session_connected();
			let mut health = target.health().lock();
			evaluate(&mut health, chat, event, &policy, Instant::now())
		};

		match action {
			TickAction::Idle => {}
			TickAction::ColdRestart => {
				metrics::counter!("relaybot_cold_restarts_total").increment(1);
				warn!(channel = %label, threshold = ?policy.force_reconnect_after, "chat down past threshold; cold restart");
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = target.cold_restart() => {}
				}
				let chat = target.chat_connected();
				let event = target.event_session_connected();
				target.health().lock().reset(Instant::now(), chat, event);

				// One extra interval so a failing restart cannot loop tightly.
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = sleep(cfg.poll_interval) => {}
				}
			}
			TickAction::ReconnectEventSession { backoff } => {
				metrics::counter!("relaybot_event_session_reconnects_total").increment(1);
				info!(channel = %label, next_backoff = ?backoff, "event session down; reconnecting");
				tokio::select! {
					_ = cancel.cancelled() => return,
					_ = target.reconnect_event_session() => {}
				}
			}
		}

		tokio::select! {
			_ = cancel.cancelled() => return,
			_ = sleep(cfg.poll_interval) => {}
		}
	}
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
