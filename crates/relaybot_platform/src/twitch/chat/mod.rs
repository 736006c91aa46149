#![forbid(unsafe_code)]

mod irc;
mod split;


use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relaybot_domain::{ChannelLogin, UserRef};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use self::irc::IrcLine;
use self::split::prepare_chunks;
use super::api::retry_once_after_refresh;
use super::{TwitchWs, WsConnector, default_ws_connector};
use crate::{
	ChatEvent, ChatEventTx, ChatMessage, ChatTarget, ChatTransport, CredentialBroker, PlatformApi, PlatformError, TokenStore,
};

pub const DEFAULT_IRC_WS_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

type WsSink = SplitSink<TwitchWs, Message>;
type WsStream = SplitStream<TwitchWs>;

/// Chat transport settings.
#[derive(Clone)]
pub struct ChatConfig {
	pub irc_ws_url: String,
	pub bot_login: String,

	/// Absolute cap for one `send`, continuation included.
	pub max_message_chars: usize,
	/// Per-line limit; longer text is split.
	pub chunk_chars: usize,
	/// Delay before each continuation line.
	pub continuation_delay: Duration,
	/// Minimum spacing between any two outgoing lines.
	pub min_send_interval: Duration,
	pub login_timeout: Duration,

	/// Optional injectable connector (tests).
	pub ws_connector: Option<WsConnector>,
}

impl ChatConfig {
	pub fn new(bot_login: impl Into<String>) -> Self {
		Self {
			irc_ws_url: DEFAULT_IRC_WS_URL.to_string(),
			bot_login: bot_login.into(),
			max_message_chars: 1000,
			chunk_chars: 480,
			continuation_delay: Duration::from_millis(1200),
			min_send_interval: Duration::from_secs(1),
			login_timeout: Duration::from_secs(10),
			ws_connector: None,
		}
	}
}

impl std::fmt::Debug for ChatConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChatConfig")
			.field("irc_ws_url", &self.irc_ws_url)
			.field("bot_login", &self.bot_login)
			.field("max_message_chars", &self.max_message_chars)
			.field("chunk_chars", &self.chunk_chars)
			.field("continuation_delay", &self.continuation_delay)
			.field("min_send_interval", &self.min_send_interval)
			.finish_non_exhaustive()
	}
}

struct ChatShared {
	channel: ChannelLogin,
	connected: AtomicBool,
	writer: tokio::sync::Mutex<Option<WsSink>>,
	last_send: tokio::sync::Mutex<Option<Instant>>,
	events_tx: ChatEventTx,
}

impl ChatShared {
	async fn write_line(&self, line: String) -> Result<(), PlatformError> {
		let mut writer = self.writer.lock().await;
		let Some(sink) = writer.as_mut() else {
			return Err(PlatformError::Transport("chat not connected".to_string()));
		};
		sink.send(Message::text(line))
			.await
			.map_err(|e| PlatformError::Transport(format!("chat write: {e}")))
	}

	async fn throttle(&self, interval: Duration) {
		let mut last = self.last_send.lock().await;
		if let Some(prev) = *last {
			let next = prev + interval;
			if next > Instant::now() {
				sleep_until(next).await;
			}
		}
		*last = Some(Instant::now());
	}
}

/// Delivers single lines; cloned into the continuation task.
#[derive(Clone)]
struct Outbox {
	shared: Arc<ChatShared>,
	api: Arc<dyn PlatformApi>,
	min_send_interval: Duration,
}

impl Outbox {
	async fn deliver(&self, target: &ChatTarget, chunk: &str) -> Result<(), PlatformError> {
		self.shared.throttle(self.min_send_interval).await;
		match target {
			ChatTarget::Channel => {
				self.shared
					.write_line(format!("PRIVMSG #{} :{}", self.shared.channel, chunk))
					.await
			}
			ChatTarget::Whisper { user_id } => self.api.send_whisper(user_id, chunk).await,
		}
	}
}

struct ReaderTask {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

/// IRC-over-websocket chat client for one channel.
pub struct TwitchChatClient {
	cfg: ChatConfig,
	shared: Arc<ChatShared>,
	broker: Arc<dyn CredentialBroker>,
	store: Option<Arc<dyn TokenStore>>,
	api: Arc<dyn PlatformApi>,
	reader: parking_lot::Mutex<Option<ReaderTask>>,
}

impl TwitchChatClient {
	pub fn new(
		cfg: ChatConfig,
		channel: ChannelLogin,
		broker: Arc<dyn CredentialBroker>,
		api: Arc<dyn PlatformApi>,
		events_tx: ChatEventTx,
	) -> Self {
		Self {
			cfg,
			shared: Arc::new(ChatShared {
				channel,
				connected: AtomicBool::new(false),
				writer: tokio::sync::Mutex::new(None),
				last_send: tokio::sync::Mutex::new(None),
				events_tx,
			}),
			broker,
			store: None,
			api,
			reader: parking_lot::Mutex::new(None),
		}
	}

	/// Persist tokens rotated by a login-triggered refresh.
	pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
		self.store = Some(store);
		self
	}

	async fn refresh_credentials(&self) -> Result<(), PlatformError> {
		let validated = self.broker.ensure_valid(false).await?;
		if validated.changed
			&& let Some(store) = self.store.as_ref()
		{
			match store.save(&validated.tokens) {
				Ok(()) => debug!(channel = %self.shared.channel, "persisted refreshed twitch tokens"),
				Err(e) => warn!(channel = %self.shared.channel, error = %e, "failed to persist refreshed twitch tokens"),
			}
		}
		Ok(())
	}

	fn outbox(&self) -> Outbox {
		Outbox {
			shared: Arc::clone(&self.shared),
			api: Arc::clone(&self.api),
			min_send_interval: self.cfg.min_send_interval,
		}
	}

	async fn stop_reader(&self) {
		let task = self.reader.lock().take();
		if let Some(task) = task {
			task.cancel.cancel();
			let _ = task.handle.await;
		}
	}

	async fn open_and_login(&self) -> Result<(WsSink, WsStream), PlatformError> {
		let token = self
			.broker
			.current()
			.access_token
			.ok_or_else(|| PlatformError::Auth("no twitch access token for chat login".to_string()))?;

		let url = Url::parse(&self.cfg.irc_ws_url)
			.map_err(|e| PlatformError::Fatal(format!("invalid chat url {:?}: {e}", self.cfg.irc_ws_url)))?;
		let connector = self.cfg.ws_connector.clone().unwrap_or_else(default_ws_connector);

		let ws = timeout(self.cfg.login_timeout, connector(url))
			.await
			.map_err(|_| PlatformError::Transport("chat connect timed out".to_string()))?
			.map_err(|e| PlatformError::Transport(format!("chat connect: {e:#}")))?;
		let (mut sink, mut stream) = ws.split();

		let login_lines = [
			"CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
			format!("PASS oauth:{}", token.expose()),
			format!("NICK {}", self.cfg.bot_login.to_ascii_lowercase()),
			format!("JOIN #{}", self.shared.channel),
		];
		for line in login_lines {
			sink.send(Message::text(line))
				.await
				.map_err(|e| PlatformError::Transport(format!("chat login write: {e}")))?;
		}

		timeout(self.cfg.login_timeout, await_welcome(&mut sink, &mut stream))
			.await
			.map_err(|_| PlatformError::Transport("chat login timed out".to_string()))??;

		Ok((sink, stream))
	}
}

async fn await_welcome(sink: &mut WsSink, stream: &mut WsStream) -> Result<(), PlatformError> {
	loop {
		let Some(msg) = stream.next().await else {
			return Err(PlatformError::Transport("chat socket closed during login".to_string()));
		};
		let msg = msg.map_err(|e| PlatformError::Transport(format!("chat login read: {e}")))?;

		match msg {
			Message::Text(t) => {
				for line in t.split("\r\n").filter_map(IrcLine::parse) {
					match line.command {
						"001" => return Ok(()),
						"PING" => {
							let pong = format!("PONG :{}", line.trailing().unwrap_or("tmi.twitch.tv"));
							let _ = sink.send(Message::text(pong)).await;
						}
						"NOTICE" => {
							let text = line.trailing().unwrap_or_default();
							if text.contains("authentication failed") || text.contains("Improperly formatted auth") {
								return Err(PlatformError::Auth(format!("chat login rejected: {text}")));
							}
						}
						_ => {}
					}
				}
			}
			Message::Close(c) => {
				return Err(PlatformError::Transport(format!("chat socket closed during login: {c:?}")));
			}
			_ => {}
		}
	}
}

fn chat_message_from_line(line: &IrcLine<'_>) -> Option<ChatMessage> {
	let channel = ChannelLogin::new(*line.params.first()?).ok()?;
	let mut text = line.trailing()?;
	if let Some(action) = text.strip_prefix("\u{1}ACTION ") {
		text = action.trim_end_matches('\u{1}');
	}

	let login = line.nick()?.to_string();
	let id = line.tag("user-id").filter(|v| !v.is_empty()).unwrap_or_else(|| login.clone());
	let mut author = UserRef::new(id, login);
	if let Some(display) = line.tag("display-name").filter(|v| !v.is_empty()) {
		author = author.with_display(display);
	}

	Some(ChatMessage {
		channel,
		author,
		text: text.to_string(),
		message_id: line.tag("id").filter(|v| !v.is_empty()),
		received_at: SystemTime::now(),
	})
}

/// Returns `Some(reason)` when the line ends the connection.
async fn handle_line(shared: &ChatShared, line: &IrcLine<'_>) -> Option<String> {
	match line.command {
		"PING" => {
			let pong = format!("PONG :{}", line.trailing().unwrap_or("tmi.twitch.tv"));
			if let Err(e) = shared.write_line(pong).await {
				return Some(format!("failed to answer PING: {e}"));
			}
		}
		"PRIVMSG" => match chat_message_from_line(line) {
			Some(msg) => {
				if shared.events_tx.send(ChatEvent::Message(msg)).await.is_err() {
					return Some("chat event receiver dropped".to_string());
				}
			}
			None => debug!(channel = %shared.channel, "ignoring malformed PRIVMSG"),
		},
		"NOTICE" => {
			let text = line.trailing().unwrap_or_default().to_string();
			let _ = shared.events_tx.try_send(ChatEvent::Notice(text));
		}
		"RECONNECT" => return Some("server requested reconnect".to_string()),
		_ => {}
	}
	None
}

async fn read_loop(shared: Arc<ChatShared>, mut stream: WsStream, cancel: CancellationToken) {
	let reason = 'outer: loop {
		tokio::select! {
			_ = cancel.cancelled() => break "disconnect requested".to_string(),
			msg = stream.next() => {
				let Some(msg) = msg else {
					break "chat socket ended".to_string();
				};
				match msg {
					Ok(Message::Text(t)) => {
						for line in t.split("\r\n").filter_map(IrcLine::parse) {
							if let Some(reason) = handle_line(&shared, &line).await {
								break 'outer reason;
							}
						}
					}
					Ok(Message::Ping(p)) => {
						let mut writer = shared.writer.lock().await;
						if let Some(sink) = writer.as_mut() {
							let _ = sink.send(Message::Pong(p)).await;
						}
					}
					Ok(Message::Close(frame)) => break format!("chat socket closed: {frame:?}"),
					Ok(_) => {}
					Err(e) => break format!("chat socket read error: {e}"),
				}
			}
		}
	};

	shared.connected.store(false, Ordering::SeqCst);
	let writer = shared.writer.lock().await.take();
	if let Some(mut sink) = writer {
		let _ = sink.close().await;
	}
	info!(channel = %shared.channel, %reason, "chat disconnected");
	let _ = shared.events_tx.try_send(ChatEvent::Disconnected { reason });
}

#[async_trait::async_trait]
impl ChatTransport for TwitchChatClient {
	async fn connect(&self) -> Result<(), PlatformError> {
		if self.is_connected() {
			return Ok(());
		}
		self.stop_reader().await;

		let (sink, stream) =
			retry_once_after_refresh("chat login", || self.open_and_login(), || self.refresh_credentials()).await?;
		*self.shared.writer.lock().await = Some(sink);
		self.shared.connected.store(true, Ordering::SeqCst);

		info!(channel = %self.shared.channel, "chat connected");
		let _ = self.shared.events_tx.try_send(ChatEvent::Connected);

		let cancel = CancellationToken::new();
		let handle = tokio::spawn(read_loop(Arc::clone(&self.shared), stream, cancel.clone()));
		*self.reader.lock() = Some(ReaderTask { cancel, handle });
		Ok(())
	}

	async fn send(&self, target: ChatTarget, text: &str) -> Result<(), PlatformError> {
		let flat = text.replace(['\r', '\n'], " ");
		let mut chunks = prepare_chunks(&flat, self.cfg.max_message_chars, self.cfg.chunk_chars).into_iter();
		let Some(first) = chunks.next() else {
			return Ok(());
		};

		let outbox = self.outbox();
		outbox.deliver(&target, &first).await?;

		let rest: Vec<String> = chunks.collect();
		if rest.is_empty() {
			return Ok(());
		}

		let delay = self.cfg.continuation_delay;
		let channel = self.shared.channel.clone();
		tokio::spawn(async move {
			for chunk in rest {
				sleep(delay).await;
				if let Err(e) = outbox.deliver(&target, &chunk).await {
					warn!(%channel, error = %e, "dropping remaining message continuation");
					break;
				}
			}
		});
		Ok(())
	}

	async fn disconnect(&self) {
		self.stop_reader().await;
		self.shared.connected.store(false, Ordering::SeqCst);
	}

	fn is_connected(&self) -> bool {
		self.shared.connected.load(Ordering::SeqCst)
	}
}
