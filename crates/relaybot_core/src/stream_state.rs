#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use relaybot_domain::ChannelLogin;

/// Cached online/offline state of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
	pub is_online: bool,
	pub title: String,
	pub category: String,
	pub last_change: Option<SystemTime>,
	pub started_at: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStarted {
	pub started_at: SystemTime,
	pub title: String,
	pub category: String,
}

impl StreamStarted {
	pub fn needs_enrichment(&self) -> bool {
		self.title.is_empty() || self.category.is_empty()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEnded {
	pub occurred_at: SystemTime,
	pub started_at: Option<SystemTime>,
	pub title: String,
	pub category: String,
}

impl StreamEnded {
	pub fn duration(&self) -> Duration {
		self.started_at
			.and_then(|start| self.occurred_at.duration_since(start).ok())
			.unwrap_or_default()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdated {
	pub title: String,
	pub category: String,
	/// Title or category differ from what was cached.
	pub changed: bool,
}

/// Offline/Online machine. Transitions strictly alternate; repeats are no-ops.
#[derive(Debug, Default)]
pub struct StreamStateMachine {
	state: Mutex<StreamState>,
}

impl StreamStateMachine {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn snapshot(&self) -> StreamState {
		self.state.lock().clone()
	}

	pub fn is_online(&self) -> bool {
		self.state.lock().is_online
	}

	/// `None` when already online. Missing metadata falls back to the cached values.
	pub fn go_online(
		&self,
		started_at: SystemTime,
		title: Option<String>,
		category: Option<String>,
	) -> Option<StreamStarted> {
		let mut state = self.state.lock();
		if state.is_online {
			return None;
		}
		state.is_online = true;
		state.started_at = Some(started_at);
		state.last_change = Some(started_at);
		if let Some(title) = title.filter(|t| !t.is_empty()) {
			state.title = title;
		}
		if let Some(category) = category.filter(|c| !c.is_empty()) {
			state.category = category;
		}

		Some(StreamStarted {
			started_at,
			title: state.title.clone(),
			category: state.category.clone(),
		})
	}

	/// `None` when already offline.
	pub fn go_offline(&self, occurred_at: SystemTime) -> Option<StreamEnded> {
		let mut state = self.state.lock();
		if !state.is_online {
			return None;
		}
		state.is_online = false;
		state.last_change = Some(occurred_at);

		Some(StreamEnded {
			occurred_at,
			started_at: state.started_at.take(),
			title: state.title.clone(),
			category: state.category.clone(),
		})
	}

	/// Stores the metadata; returns `Some` only while online.
	pub fn update(&self, title: &str, category: &str) -> Option<StreamUpdated> {
		let mut state = self.state.lock();
		let changed = state.title != title || state.category != category;
		state.title = title.to_string();
		state.category = category.to_string();

		state.is_online.then(|| StreamUpdated {
			title: state.title.clone(),
			category: state.category.clone(),
			changed,
		})
	}

	/// Fill only the empty fields (best-effort enrichment after going online).
	pub fn fill_missing(&self, title: &str, category: &str) -> StreamState {
		let mut state = self.state.lock();
		if state.title.is_empty() {
			state.title = title.to_string();
		}
		if state.category.is_empty() {
			state.category = category.to_string();
		}
		state.clone()
	}
}

/// A transition is fresh when it happened at most `window` ago. Timestamps
/// ahead of `now` (clock skew) count as fresh.
pub fn within_one_shot(occurred_at: SystemTime, now: SystemTime, window: Duration) -> bool {
	match now.duration_since(occurred_at) {
		Ok(elapsed) => elapsed <= window,
		Err(_) => true,
	}
}

fn rfc3339(t: SystemTime) -> String {
	DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `[login, title, category, started_at_rfc3339]`
pub fn start_payload(login: &ChannelLogin, started: &StreamStarted) -> Vec<String> {
	vec![
		login.to_string(),
		started.title.clone(),
		started.category.clone(),
		rfc3339(started.started_at),
	]
}

/// `[login, title, category, duration_seconds]`
pub fn end_payload(login: &ChannelLogin, ended: &StreamEnded) -> Vec<String> {
	vec![
		login.to_string(),
		ended.title.clone(),
		ended.category.clone(),
		ended.duration().as_secs().to_string(),
	]
}

/// `[login, title, category]`
pub fn update_payload(login: &ChannelLogin, updated: &StreamUpdated) -> Vec<String> {
	vec![login.to_string(), updated.title.clone(), updated.category.clone()]
}
