#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relaybot_domain::ChannelIdentity;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::eventsub::{self, EventSubSession, TopicIds, topic_table};
use super::{TwitchWs, WsConnector, default_ws_connector};
use crate::{EventSession, PlatformApi, PlatformError, SessionEvent, SessionEventTx};

pub const DEFAULT_EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

const DEFAULT_KEEPALIVE_SECS: u64 = 10;

#[derive(Clone)]
pub struct EventSessionConfig {
	pub ws_url: String,
	/// Limit for the `session_welcome` after connecting (also used for reconnect URLs).
	pub welcome_timeout: Duration,
	/// Added to the server keepalive before the watchdog fires.
	pub keepalive_slack: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl Default for EventSessionConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_EVENTSUB_WS_URL.to_string(),
			welcome_timeout: Duration::from_secs(10),
			keepalive_slack: Duration::from_secs(5),
			ws_connector: None,
		}
	}
}

impl std::fmt::Debug for EventSessionConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventSessionConfig")
			.field("ws_url", &self.ws_url)
			.field("welcome_timeout", &self.welcome_timeout)
			.field("keepalive_slack", &self.keepalive_slack)
			.finish_non_exhaustive()
	}
}

impl EventSessionConfig {
	fn connector(&self) -> WsConnector {
		self.ws_connector.clone().unwrap_or_else(default_ws_connector)
	}

	fn keepalive_for(&self, session: &EventSubSession) -> Duration {
		Duration::from_secs(session.keepalive_timeout_seconds.unwrap_or(DEFAULT_KEEPALIVE_SECS)) + self.keepalive_slack
	}
}

struct SessionShared {
	identity: ChannelIdentity,
	connected: AtomicBool,
	session_id: parking_lot::Mutex<Option<String>>,
	events_tx: SessionEventTx,
}

struct ReaderTask {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

enum ReaderExit {
	Requested,
	Failed(String),
}

/// EventSub websocket session for one channel.
///
/// Failures are reported, never retried inline: the reader emits
/// `ErrorOccurred`, tears the socket down and emits `Disconnected`.
pub struct TwitchEventSession {
	cfg: EventSessionConfig,
	shared: Arc<SessionShared>,
	api: Arc<dyn PlatformApi>,
	reader: parking_lot::Mutex<Option<ReaderTask>>,
	connect_gate: tokio::sync::Mutex<()>,
}

impl TwitchEventSession {
	pub fn new(
		cfg: EventSessionConfig,
		identity: ChannelIdentity,
		api: Arc<dyn PlatformApi>,
		events_tx: SessionEventTx,
	) -> Self {
		Self {
			cfg,
			shared: Arc::new(SessionShared {
				identity,
				connected: AtomicBool::new(false),
				session_id: parking_lot::Mutex::new(None),
				events_tx,
			}),
			api,
			reader: parking_lot::Mutex::new(None),
			connect_gate: tokio::sync::Mutex::new(()),
		}
	}

	pub fn session_id(&self) -> Option<String> {
		self.shared.session_id.lock().clone()
	}

	async fn stop_reader(&self) {
		let task = self.reader.lock().take();
		if let Some(task) = task {
			task.cancel.cancel();
			let _ = task.handle.await;
		}
	}

	async fn subscribe_all(&self, session_id: &str) {
		let broadcaster_id = self.shared.identity.broadcaster_id.clone();
		let moderator_id = self.api.bot_user_id().unwrap_or_else(|| broadcaster_id.clone());
		let topics = topic_table(&TopicIds {
			broadcaster_id,
			moderator_id,
		});

		let mut failed = 0usize;
		for topic in &topics {
			if let Err(e) = self.api.create_subscription(topic, session_id).await {
				failed += 1;
				metrics::counter!("relaybot_eventsub_subscribe_failures_total", "topic" => topic.name.clone()).increment(1);
				warn!(channel = %self.shared.identity, topic = %topic.name, error = %e, "eventsub subscription failed; continuing");
			}
		}
		info!(
			channel = %self.shared.identity,
			total = topics.len(),
			failed,
			"eventsub subscriptions requested"
		);
	}
}

async fn open_session(
	connector: &WsConnector,
	url: Url,
	welcome_timeout: Duration,
) -> Result<(TwitchWs, EventSubSession), PlatformError> {
	let mut ws = timeout(welcome_timeout, connector(url))
		.await
		.map_err(|_| PlatformError::Transport("eventsub connect timed out".to_string()))?
		.map_err(|e| PlatformError::Transport(format!("eventsub connect: {e:#}")))?;

	let session = timeout(welcome_timeout, read_until_welcome(&mut ws))
		.await
		.map_err(|_| PlatformError::Transport("eventsub welcome timed out".to_string()))?
		.map_err(|e| PlatformError::Transport(format!("{e:#}")))?;

	Ok((ws, session))
}

async fn read_until_welcome(ws: &mut TwitchWs) -> anyhow::Result<EventSubSession> {
	loop {
		let Some(msg) = ws.next().await else {
			anyhow::bail!("ws closed before welcome");
		};
		let msg = msg.map_err(|e| anyhow::anyhow!("ws read: {e}"))?;

		match msg {
			Message::Text(t) => {
				if eventsub::peek_message_type(&t)? == "session_welcome" {
					return eventsub::parse_session(&t);
				}
			}
			Message::Ping(p) => {
				let _ = ws.send(Message::Pong(p)).await;
			}
			Message::Close(c) => {
				anyhow::bail!("ws closed before welcome: close={c:?}");
			}
			_ => {}
		}
	}
}

struct ReaderCtx {
	shared: Arc<SessionShared>,
	cfg: EventSessionConfig,
	cancel: CancellationToken,
}

async fn read_loop(ctx: ReaderCtx, mut ws: TwitchWs, mut keepalive: Duration) {
	let shared = &ctx.shared;
	let mut last_activity = Instant::now();

	let exit = loop {
		tokio::select! {
			_ = ctx.cancel.cancelled() => break ReaderExit::Requested,

			msg = ws.next() => {
				let Some(msg) = msg else {
					break ReaderExit::Failed("eventsub ws ended".to_string());
				};
				let msg = match msg {
					Ok(m) => m,
					Err(e) => break ReaderExit::Failed(format!("eventsub ws read error: {e}")),
				};

				match msg {
					Message::Text(t) => {
						last_activity = Instant::now();
						let ty = match eventsub::peek_message_type(&t) {
							Ok(ty) => ty,
							Err(e) => {
								warn!(channel = %shared.identity, error = %e, "unparseable eventsub frame");
								continue;
							}
						};

						match ty.as_str() {
							"session_keepalive" => debug!(channel = %shared.identity, "eventsub keepalive"),
							"notification" => match eventsub::normalize_notification(&t) {
								Ok(Some(ev)) => {
									debug!(channel = %shared.identity, kind = ev.kind(), "eventsub notification");
									if shared.events_tx.send(SessionEvent::Notification(ev)).await.is_err() {
										break ReaderExit::Requested;
									}
								}
								Ok(None) => {}
								Err(e) => warn!(channel = %shared.identity, error = %e, "failed to normalize eventsub notification"),
							},
							"session_reconnect" => {
								let target = eventsub::parse_session(&t)
									.map_err(|e| format!("{e:#}"))
									.and_then(|s| s.reconnect_url.ok_or_else(|| "session_reconnect without url".to_string()))
									.and_then(|u| Url::parse(&u).map_err(|e| format!("invalid reconnect url: {e}")));
								let url = match target {
									Ok(url) => url,
									Err(reason) => break ReaderExit::Failed(reason),
								};

								info!(channel = %shared.identity, "eventsub session_reconnect; migrating");
								match open_session(&ctx.cfg.connector(), url, ctx.cfg.welcome_timeout).await {
									Ok((new_ws, session)) => {
										let _ = ws.close(None).await;
										ws = new_ws;
										keepalive = ctx.cfg.keepalive_for(&session);
										last_activity = Instant::now();
										*shared.session_id.lock() = Some(session.id.clone());
										let _ = shared.events_tx.try_send(SessionEvent::Reconnected { session_id: session.id });
									}
									Err(e) => break ReaderExit::Failed(format!("session migration failed: {e}")),
								}
							}
							"revocation" => match eventsub::parse_revocation(&t) {
								Ok(sub) => warn!(
									channel = %shared.identity,
									subscription_id = %sub.id,
									topic = %sub.r#type,
									status = %sub.status,
									"eventsub subscription revoked"
								),
								Err(e) => warn!(channel = %shared.identity, error = %e, "unparseable revocation"),
							},
							other => debug!(channel = %shared.identity, message_type = other, "ignoring eventsub message"),
						}
					}
					Message::Ping(p) => {
						last_activity = Instant::now();
						let _ = ws.send(Message::Pong(p)).await;
					}
					Message::Close(frame) => break ReaderExit::Failed(format!("eventsub ws closed: {frame:?}")),
					_ => {}
				}
			}

			_ = sleep(keepalive) => {
				if last_activity.elapsed() >= keepalive {
					break ReaderExit::Failed("keepalive watchdog triggered".to_string());
				}
			}
		}
	};

	let _ = ws.close(None).await;
	shared.connected.store(false, Ordering::SeqCst);
	*shared.session_id.lock() = None;

	let reason = match exit {
		ReaderExit::Requested => "disconnect requested".to_string(),
		ReaderExit::Failed(reason) => {
			warn!(channel = %shared.identity, %reason, "eventsub session failed; forcing disconnect");
			let _ = shared.events_tx.try_send(SessionEvent::ErrorOccurred(reason.clone()));
			reason
		}
	};
	info!(channel = %shared.identity, %reason, "eventsub disconnected");
	let _ = shared.events_tx.try_send(SessionEvent::Disconnected { reason });
}

#[async_trait::async_trait]
impl EventSession for TwitchEventSession {
	async fn connect(&self) -> Result<(), PlatformError> {
		let _gate = self.connect_gate.lock().await;
		if self.is_connected() {
			return Ok(());
		}
		self.stop_reader().await;

		let url = Url::parse(&self.cfg.ws_url)
			.map_err(|e| PlatformError::Fatal(format!("invalid eventsub url {:?}: {e}", self.cfg.ws_url)))?;
		let (ws, session) = open_session(&self.cfg.connector(), url, self.cfg.welcome_timeout).await?;

		self.subscribe_all(&session.id).await;

		let keepalive = self.cfg.keepalive_for(&session);
		*self.shared.session_id.lock() = Some(session.id.clone());
		self.shared.connected.store(true, Ordering::SeqCst);

		info!(channel = %self.shared.identity, session_id = %session.id, ?keepalive, "eventsub connected");
		// Connected must precede anything the reader forwards.
		let _ = self.shared.events_tx.try_send(SessionEvent::Connected { session_id: session.id });

		let cancel = CancellationToken::new();
		let ctx = ReaderCtx {
			shared: Arc::clone(&self.shared),
			cfg: self.cfg.clone(),
			cancel: cancel.clone(),
		};
		let handle = tokio::spawn(read_loop(ctx, ws, keepalive));
		*self.reader.lock() = Some(ReaderTask { cancel, handle });
		Ok(())
	}

	async fn reconnect(&self) -> Result<(), PlatformError> {
		self.disconnect().await;
		self.connect().await
	}

	async fn disconnect(&self) {
		self.stop_reader().await;
		self.shared.connected.store(false, Ordering::SeqCst);
	}

	fn is_connected(&self) -> bool {
		self.shared.connected.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
