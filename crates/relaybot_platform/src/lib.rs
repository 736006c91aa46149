#![forbid(unsafe_code)]

pub mod twitch;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use relaybot_domain::{ChannelIdentity, ChannelLogin, UserRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure taxonomy shared by every outbound platform call.
///
/// "Not found" is never an error: lookups return `Option` or an empty `Vec`.
#[derive(Debug, Error)]
pub enum PlatformError {
	/// Token rejected or missing; a credential refresh may fix it.
	#[error("auth failure: {0}")]
	Auth(String),

	/// Network, socket or protocol failure.
	#[error("transport failure: {0}")]
	Transport(String),

	/// Platform throttled the call.
	#[error("rate limited (retry_after={retry_after:?})")]
	RateLimited { retry_after: Option<Duration> },

	/// Unrecoverable for the calling operation (e.g. interactive auth failed).
	#[error("fatal: {0}")]
	Fatal(String),

	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl PlatformError {
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Auth(_))
	}

	pub fn is_fatal(&self) -> bool {
		matches!(self, Self::Fatal(_))
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// User OAuth tokens for the bot account.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tokens {
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
}

impl Tokens {
	pub fn new(access_token: Option<SecretString>, refresh_token: Option<SecretString>) -> Self {
		Self {
			access_token: access_token.filter(|t| !t.is_empty()),
			refresh_token: refresh_token.filter(|t| !t.is_empty()),
		}
	}
}

/// Result of `CredentialBroker::ensure_valid`.
#[derive(Debug, Clone)]
pub struct ValidatedTokens {
	pub tokens: Tokens,
	/// Tokens differ from the previously cached ones; the caller should persist them.
	pub changed: bool,
	/// Token owner, as reported by validation.
	pub user_id: Option<String>,
	pub login: Option<String>,
}

/// Keeps the bot's credentials usable.
#[async_trait::async_trait]
pub trait CredentialBroker: Send + Sync + 'static {
	/// Validate, then refresh, then (when allowed) run the interactive flow.
	async fn ensure_valid(&self, allow_interactive: bool) -> Result<ValidatedTokens, PlatformError>;

	/// Cached tokens without any network access.
	fn current(&self) -> Tokens;
}

/// Persists tokens when a broker reports a change.
pub trait TokenStore: Send + Sync + 'static {
	fn save(&self, tokens: &Tokens) -> anyhow::Result<()>;
}

/// Where an outgoing chat line goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
	/// The connector's own channel.
	Channel,
	/// Private whisper to a user id.
	Whisper { user_id: String },
}

/// Inbound chat line from a channel.
#[derive(Debug, Clone)]
pub struct ChatMessage {
	/// Channel the message originated in.
	pub channel: ChannelLogin,
	pub author: UserRef,
	pub text: String,
	pub message_id: Option<String>,
	pub received_at: SystemTime,
}

/// Chat transport → connector events.
#[derive(Debug, Clone)]
pub enum ChatEvent {
	Connected,
	Disconnected { reason: String },
	/// Server notice or other log-worthy line.
	Notice(String),
	Message(ChatMessage),
}

/// Normalized notification delivered by the event session.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
	Follow {
		channel: ChannelLogin,
		user: UserRef,
		followed_at: SystemTime,
	},
	Raid {
		channel: ChannelLogin,
		from: UserRef,
		viewers: u64,
	},
	Subscribe {
		channel: ChannelLogin,
		user: UserRef,
		tier: String,
		is_gift: bool,
	},
	Ban {
		channel: ChannelLogin,
		user: UserRef,
		moderator: UserRef,
		reason: Option<String>,
		permanent: bool,
	},
	Unban {
		channel: ChannelLogin,
		user: UserRef,
		moderator: UserRef,
	},
	ChannelUpdate {
		channel: ChannelLogin,
		title: String,
		category: String,
	},
	StreamOnline {
		channel: ChannelLogin,
		started_at: SystemTime,
	},
	StreamOffline {
		channel: ChannelLogin,
		occurred_at: SystemTime,
	},
}

impl PlatformEvent {
	pub fn channel(&self) -> &ChannelLogin {
		match self {
			Self::Follow { channel, .. }
			| Self::Raid { channel, .. }
			| Self::Subscribe { channel, .. }
			| Self::Ban { channel, .. }
			| Self::Unban { channel, .. }
			| Self::ChannelUpdate { channel, .. }
			| Self::StreamOnline { channel, .. }
			| Self::StreamOffline { channel, .. } => channel,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Self::Follow { .. } => "follow",
			Self::Raid { .. } => "raid",
			Self::Subscribe { .. } => "subscribe",
			Self::Ban { .. } => "ban",
			Self::Unban { .. } => "unban",
			Self::ChannelUpdate { .. } => "channel_update",
			Self::StreamOnline { .. } => "stream_online",
			Self::StreamOffline { .. } => "stream_offline",
		}
	}
}

/// Event session → connector events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
	Connected { session_id: String },
	Reconnected { session_id: String },
	Disconnected { reason: String },
	ErrorOccurred(String),
	Notification(PlatformEvent),
}

/// Primary chat connection of a channel.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync + 'static {
	async fn connect(&self) -> Result<(), PlatformError>;

	/// Send text; long text is truncated and split into sequential chunks.
	async fn send(&self, target: ChatTarget, text: &str) -> Result<(), PlatformError>;

	async fn disconnect(&self);

	fn is_connected(&self) -> bool;
}

/// Push-notification session of a channel.
#[async_trait::async_trait]
pub trait EventSession: Send + Sync + 'static {
	/// Fresh connect; subscribes the full topic table.
	async fn connect(&self) -> Result<(), PlatformError>;

	/// Tear down and connect fresh.
	async fn reconnect(&self) -> Result<(), PlatformError>;

	async fn disconnect(&self);

	fn is_connected(&self) -> bool;
}

/// User lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformUser {
	pub id: String,
	pub login: String,
	pub display_name: Option<String>,
}

/// Live stream snapshot as reported by the REST API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
	pub user_id: String,
	pub user_login: String,
	pub title: String,
	pub category: String,
	pub started_at: SystemTime,
	pub viewer_count: u64,
}

/// One event-session subscription: topic name, version and condition map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTopic {
	pub name: String,
	pub version: String,
	pub condition: std::collections::BTreeMap<String, String>,
}

/// Outbound REST surface used by the core.
#[async_trait::async_trait]
pub trait PlatformApi: Send + Sync + 'static {
	async fn users_by_login(&self, logins: &[String]) -> Result<Vec<PlatformUser>, PlatformError>;

	/// Live streams for the given logins; offline channels are absent.
	async fn streams_by_login(&self, logins: &[String]) -> Result<Vec<StreamInfo>, PlatformError>;

	async fn stream_by_login(&self, login: &str) -> Result<Option<StreamInfo>, PlatformError> {
		let streams = self.streams_by_login(&[login.to_string()]).await?;
		Ok(streams.into_iter().find(|s| s.user_login.eq_ignore_ascii_case(login)))
	}

	async fn chatters(&self, broadcaster_id: &str) -> Result<Vec<PlatformUser>, PlatformError>;

	async fn create_subscription(&self, topic: &SubscriptionTopic, session_id: &str) -> Result<(), PlatformError>;

	async fn send_announcement(&self, broadcaster_id: &str, text: &str) -> Result<(), PlatformError>;

	async fn send_whisper(&self, to_user_id: &str, text: &str) -> Result<(), PlatformError>;

	/// Bot account user id, when known.
	fn bot_user_id(&self) -> Option<String>;
}

pub type ChatEventTx = mpsc::Sender<ChatEvent>;
pub type ChatEventRx = mpsc::Receiver<ChatEvent>;
pub type SessionEventTx = mpsc::Sender<SessionEvent>;
pub type SessionEventRx = mpsc::Receiver<SessionEvent>;

/// Transports built for one channel.
pub struct ChannelTransports {
	pub chat: Arc<dyn ChatTransport>,
	pub session: Arc<dyn EventSession>,
}

/// Builds the per-channel transports of a connector.
pub trait TransportFactory: Send + Sync + 'static {
	fn build(&self, identity: &ChannelIdentity, chat_tx: ChatEventTx, session_tx: SessionEventTx) -> ChannelTransports;
}
