#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown hook kind: {0}")]
	UnknownHook(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Channel login (lowercase, without the leading `#`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelLogin(String);

impl ChannelLogin {
	/// Normalize and validate a login.
	pub fn new(login: impl Into<String>) -> Result<Self, ParseIdError> {
		let login = login.into();
		let login = login.trim().trim_start_matches('#').to_ascii_lowercase();
		if login.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if login.chars().any(char::is_whitespace) {
			return Err(ParseIdError::InvalidFormat(format!("login contains whitespace: {login:?}")));
		}
		Ok(Self(login))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Case-insensitive comparison against a raw platform login.
	pub fn matches(&self, raw: &str) -> bool {
		self.0.eq_ignore_ascii_case(raw.trim().trim_start_matches('#'))
	}
}

impl fmt::Display for ChannelLogin {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ChannelLogin {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelLogin::new(s)
	}
}

impl TryFrom<String> for ChannelLogin {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		ChannelLogin::new(value)
	}
}

impl From<ChannelLogin> for String {
	fn from(value: ChannelLogin) -> Self {
		value.0
	}
}

/// A channel as known to the platform: login plus the stable broadcaster id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelIdentity {
	pub login: ChannelLogin,
	pub broadcaster_id: String,
}

impl ChannelIdentity {
	pub fn new(login: ChannelLogin, broadcaster_id: impl Into<String>) -> Self {
		Self {
			login,
			broadcaster_id: broadcaster_id.into(),
		}
	}
}

impl fmt::Display for ChannelIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}({})", self.login, self.broadcaster_id)
	}
}

/// Identifier of a hosted community that consumes channel events.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
	/// Create a non-empty `ConsumerId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ConsumerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for ConsumerId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ConsumerId::new(s.to_string())
	}
}

/// Platform user reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
	pub id: String,
	pub login: String,
	pub display: Option<String>,
}

impl UserRef {
	pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			login: login.into(),
			display: None,
		}
	}

	pub fn with_display(mut self, display: impl Into<String>) -> Self {
		self.display = Some(display.into());
		self
	}

	/// Display name when known, login otherwise.
	pub fn name(&self) -> &str {
		self.display.as_deref().filter(|d| !d.trim().is_empty()).unwrap_or(&self.login)
	}
}

/// Lifecycle and channel hooks a consumer can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
	StreamStart,
	StreamStartOneShot,
	StreamEnd,
	StreamEndOneShot,
	StreamUpdate,
	Follow,
	Raid,
	UserIntro,
}

impl HookKind {
	pub const ALL: [HookKind; 8] = [
		HookKind::StreamStart,
		HookKind::StreamStartOneShot,
		HookKind::StreamEnd,
		HookKind::StreamEndOneShot,
		HookKind::StreamUpdate,
		HookKind::Follow,
		HookKind::Raid,
		HookKind::UserIntro,
	];

	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			HookKind::StreamStart => "on_stream_start",
			HookKind::StreamStartOneShot => "on_stream_start_one_shot",
			HookKind::StreamEnd => "on_stream_end",
			HookKind::StreamEndOneShot => "on_stream_end_one_shot",
			HookKind::StreamUpdate => "on_stream_update",
			HookKind::Follow => "on_follow",
			HookKind::Raid => "on_raid",
			HookKind::UserIntro => "on_user_intro",
		}
	}
}

impl fmt::Display for HookKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for HookKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let normalized = s.to_ascii_lowercase().replace('-', "_");
		let normalized = normalized.strip_prefix("on_").unwrap_or(&normalized);
		HookKind::ALL
			.into_iter()
			.find(|k| k.as_str().trim_start_matches("on_") == normalized)
			.ok_or_else(|| ParseIdError::UnknownHook(s.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn channel_login_normalizes() {
		let login = ChannelLogin::new("  #SomeStreamer ").unwrap();
		assert_eq!(login.as_str(), "somestreamer");
		assert!(login.matches("SOMESTREAMER"));
		assert!(login.matches("#somestreamer"));
		assert!(!login.matches("other"));
	}

	#[test]
	fn hook_kind_parse_and_display() {
		assert_eq!("on_follow".parse::<HookKind>().unwrap(), HookKind::Follow);
		assert_eq!("stream-start-one-shot".parse::<HookKind>().unwrap(), HookKind::StreamStartOneShot);
		assert_eq!(HookKind::UserIntro.to_string(), "on_user_intro");
		assert!(matches!("nope".parse::<HookKind>(), Err(ParseIdError::UnknownHook(_))));
	}

	#[test]
	fn user_ref_name_prefers_display() {
		let u = UserRef::new("1", "viewer");
		assert_eq!(u.name(), "viewer");
		assert_eq!(u.with_display("Viewer").name(), "Viewer");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(ChannelLogin::new("").is_err());
		assert!(ChannelLogin::new("#").is_err());
		assert!(ChannelLogin::new("two words").is_err());
		assert!(ConsumerId::new("   ").is_err());
		assert!("".parse::<HookKind>().is_err());
	}
}
