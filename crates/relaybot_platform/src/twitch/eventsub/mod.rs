#![forbid(unsafe_code)]


use std::collections::BTreeMap;
use std::time::SystemTime;

use anyhow::Context;
use relaybot_domain::{ChannelLogin, UserRef};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::{PlatformEvent, SubscriptionTopic};

/// EventSub metadata (present on all WebSocket messages).
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadata {
	#[allow(dead_code)]
	pub(crate) message_id: String,
	pub(crate) message_timestamp: String,
}

/// A lightweight peek struct to cheaply inspect message_type/subscription_type.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeek {
	pub(crate) metadata: EventSubMetadataPeekInner,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubMetadataPeekInner {
	pub(crate) message_type: String,
	#[serde(default)]
	pub(crate) subscription_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSessionMessage {
	pub(crate) payload: EventSubSessionPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSessionPayload {
	pub(crate) session: EventSubSession,
}

/// Session object carried by `session_welcome` and `session_reconnect`.
#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSession {
	pub(crate) id: String,

	#[serde(default)]
	pub(crate) keepalive_timeout_seconds: Option<u64>,

	#[serde(default)]
	pub(crate) reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotification<TEvent> {
	pub(crate) metadata: EventSubMetadata,
	pub(crate) payload: EventSubNotificationPayload<TEvent>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubNotificationPayload<TEvent> {
	pub(crate) event: TEvent,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevocation {
	pub(crate) payload: EventSubRevocationPayload,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevocationPayload {
	pub(crate) subscription: EventSubRevokedSubscription,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubRevokedSubscription {
	pub(crate) id: String,
	pub(crate) status: String,
	#[serde(rename = "type")]
	pub(crate) r#type: String,
}

#[derive(Debug, Deserialize)]
struct BroadcasterFields {
	broadcaster_user_login: String,
}

#[derive(Debug, Deserialize)]
struct ChannelFollowEvent {
	broadcaster_user_login: String,
	user_id: String,
	user_login: String,
	user_name: String,
	followed_at: String,
}

#[derive(Debug, Deserialize)]
struct ChannelRaidEvent {
	from_broadcaster_user_id: String,
	from_broadcaster_user_login: String,
	from_broadcaster_user_name: String,
	to_broadcaster_user_login: String,
	viewers: u64,
}

#[derive(Debug, Deserialize)]
struct ChannelSubscribeEvent {
	broadcaster_user_login: String,
	user_id: String,
	user_login: String,
	user_name: String,
	tier: String,
	is_gift: bool,
}

#[derive(Debug, Deserialize)]
struct ChannelBanEvent {
	broadcaster_user_login: String,
	user_id: String,
	user_login: String,
	user_name: String,
	moderator_user_id: String,
	moderator_user_login: String,
	moderator_user_name: String,
	#[serde(default)]
	reason: Option<String>,
	#[serde(default)]
	is_permanent: bool,
}

#[derive(Debug, Deserialize)]
struct ChannelUnbanEvent {
	broadcaster_user_login: String,
	user_id: String,
	user_login: String,
	user_name: String,
	moderator_user_id: String,
	moderator_user_login: String,
	moderator_user_name: String,
}

#[derive(Debug, Deserialize)]
struct ChannelUpdateEvent {
	broadcaster_user_login: String,
	#[serde(default)]
	title: String,
	#[serde(default)]
	category_name: String,
}

#[derive(Debug, Deserialize)]
struct StreamOnlineEvent {
	broadcaster_user_login: String,
	started_at: String,
}

pub(crate) fn peek_message_type(raw_json: &str) -> anyhow::Result<String> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	Ok(peek.metadata.message_type)
}

/// Parse `session_welcome` or `session_reconnect`.
pub(crate) fn parse_session(raw_json: &str) -> anyhow::Result<EventSubSession> {
	let msg: EventSubSessionMessage = serde_json::from_str(raw_json).context("parse EventSub session message")?;
	Ok(msg.payload.session)
}

pub(crate) fn parse_revocation(raw_json: &str) -> anyhow::Result<EventSubRevokedSubscription> {
	let msg: EventSubRevocation = serde_json::from_str(raw_json).context("parse EventSub revocation")?;
	Ok(msg.payload.subscription)
}

pub(crate) fn parse_message_timestamp_system_time(ts: &str) -> anyhow::Result<SystemTime> {
	let dt = chrono::DateTime::parse_from_rfc3339(ts).with_context(|| format!("parse rfc3339 timestamp {ts:?}"))?;
	Ok(SystemTime::from(dt))
}

fn parse_notification<TEvent: DeserializeOwned>(raw_json: &str, kind: &str) -> anyhow::Result<EventSubNotification<TEvent>> {
	serde_json::from_str(raw_json).with_context(|| format!("parse {kind} notification"))
}

fn login(raw: &str) -> anyhow::Result<ChannelLogin> {
	ChannelLogin::new(raw).with_context(|| format!("construct ChannelLogin from {raw:?}"))
}

fn user(id: String, login: String, name: String) -> UserRef {
	UserRef::new(id, login).with_display(name)
}

/// Normalize a `notification` message into a `PlatformEvent`.
///
/// Returns `Ok(None)` for non-notifications and for subscription types this
/// bot does not consume.
pub(crate) fn normalize_notification(raw_json: &str) -> anyhow::Result<Option<PlatformEvent>> {
	let peek: EventSubMetadataPeek = serde_json::from_str(raw_json).context("parse EventSub metadata peek")?;
	if peek.metadata.message_type != "notification" {
		return Ok(None);
	}
	let Some(kind) = peek.metadata.subscription_type.as_deref() else {
		return Ok(None);
	};

	let ev = match kind {
		"channel.follow" => {
			let msg: EventSubNotification<ChannelFollowEvent> = parse_notification(raw_json, kind)?;
			let e = msg.payload.event;
			PlatformEvent::Follow {
				channel: login(&e.broadcaster_user_login)?,
				followed_at: parse_message_timestamp_system_time(&e.followed_at)?,
				user: user(e.user_id, e.user_login, e.user_name),
			}
		}
		"channel.raid" => {
			let msg: EventSubNotification<ChannelRaidEvent> = parse_notification(raw_json, kind)?;
			let e = msg.payload.event;
			PlatformEvent::Raid {
				channel: login(&e.to_broadcaster_user_login)?,
				from: user(
					e.from_broadcaster_user_id,
					e.from_broadcaster_user_login,
					e.from_broadcaster_user_name,
				),
				viewers: e.viewers,
			}
		}
		"channel.subscribe" => {
			let msg: EventSubNotification<ChannelSubscribeEvent> = parse_notification(raw_json, kind)?;
			let e = msg.payload.event;
			PlatformEvent::Subscribe {
				channel: login(&e.broadcaster_user_login)?,
				user: user(e.user_id, e.user_login, e.user_name),
				tier: e.tier,
				is_gift: e.is_gift,
			}
		}
		"channel.ban" => {
			let msg: EventSubNotification<ChannelBanEvent> = parse_notification(raw_json, kind)?;
			let e = msg.payload.event;
			PlatformEvent::Ban {
				channel: login(&e.broadcaster_user_login)?,
				user: user(e.user_id, e.user_login, e.user_name),
				moderator: user(e.moderator_user_id, e.moderator_user_login, e.moderator_user_name),
				reason: e.reason.filter(|r| !r.trim().is_empty()),
				permanent: e.is_permanent,
			}
		}
		"channel.unban" => {
			let msg: EventSubNotification<ChannelUnbanEvent> = parse_notification(raw_json, kind)?;
			let e = msg.payload.event;
			PlatformEvent::Unban {
				channel: login(&e.broadcaster_user_login)?,
				user: user(e.user_id, e.user_login, e.user_name),
				moderator: user(e.moderator_user_id, e.moderator_user_login, e.moderator_user_name),
			}
		}
		"channel.update" => {
			let msg: EventSubNotification<ChannelUpdateEvent> = parse_notification(raw_json, kind)?;
			let e = msg.payload.event;
			PlatformEvent::ChannelUpdate {
				channel: login(&e.broadcaster_user_login)?,
				title: e.title,
				category: e.category_name,
			}
		}
		"stream.online" => {
			let msg: EventSubNotification<StreamOnlineEvent> = parse_notification(raw_json, kind)?;
			let e = msg.payload.event;
			PlatformEvent::StreamOnline {
				channel: login(&e.broadcaster_user_login)?,
				started_at: parse_message_timestamp_system_time(&e.started_at)?,
			}
		}
		"stream.offline" => {
			let msg: EventSubNotification<BroadcasterFields> = parse_notification(raw_json, kind)?;
			PlatformEvent::StreamOffline {
				channel: login(&msg.payload.event.broadcaster_user_login)?,
				occurred_at: parse_message_timestamp_system_time(&msg.metadata.message_timestamp)?,
			}
		}
		_ => return Ok(None),
	};

	Ok(Some(ev))
}

/// Ids substituted into the topic condition maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicIds {
	pub broadcaster_id: String,
	/// The bot account, acting as moderator.
	pub moderator_id: String,
}

fn topic(name: &str, version: &str, condition: &[(&str, &str)]) -> SubscriptionTopic {
	SubscriptionTopic {
		name: name.to_string(),
		version: version.to_string(),
		condition: condition
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect::<BTreeMap<_, _>>(),
	}
}

/// Fixed subscription table created on every fresh session.
pub fn topic_table(ids: &TopicIds) -> Vec<SubscriptionTopic> {
	let b = ids.broadcaster_id.as_str();
	let m = ids.moderator_id.as_str();
	vec![
		topic("stream.online", "1", &[("broadcaster_user_id", b)]),
		topic("stream.offline", "1", &[("broadcaster_user_id", b)]),
		topic("channel.update", "2", &[("broadcaster_user_id", b)]),
		topic(
			"channel.follow",
			"2",
			&[("broadcaster_user_id", b), ("moderator_user_id", m)],
		),
		topic("channel.raid", "1", &[("to_broadcaster_user_id", b)]),
		topic("channel.subscribe", "1", &[("broadcaster_user_id", b)]),
		topic("channel.ban", "1", &[("broadcaster_user_id", b)]),
		topic("channel.unban", "1", &[("broadcaster_user_id", b)]),
	]
}
