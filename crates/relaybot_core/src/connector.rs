#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use relaybot_domain::{ChannelIdentity, ConsumerId, HookKind};
use relaybot_platform::{
	ChatEvent, ChatEventRx, ChatMessage, ChatTarget, ChatTransport, EventSession, PlatformApi, PlatformError,
	PlatformEvent, SessionEvent, SessionEventRx, StreamInfo, TransportFactory,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectorConfig;
use crate::consumers::{ConsumerEntity, ConsumerRegistry};
use crate::stream_state::{
	StreamState, StreamStateMachine, end_payload, start_payload, update_payload, within_one_shot,
};
use crate::supervisor::{ConnectionHealth, Supervised, SupervisorPolicy, run_supervisor};

/// Point-in-time view of one connector, served on the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorStatus {
	pub channel: String,
	pub broadcaster_id: String,
	pub chat_connected: bool,
	pub event_session_connected: bool,
	pub event_sub_backoff_secs: u64,
	pub online: bool,
	pub title: String,
	pub category: String,
	pub consumers: usize,
}

struct LiveLoop {
	cancel: CancellationToken,
	handle: JoinHandle<()>,
}

struct ConnectorInner {
	identity: ChannelIdentity,
	cfg: ConnectorConfig,
	policy: SupervisorPolicy,

	chat: Arc<dyn ChatTransport>,
	session: Arc<dyn EventSession>,
	api: Arc<dyn PlatformApi>,

	consumers: ConsumerRegistry,
	stream: StreamStateMachine,
	health: parking_lot::Mutex<ConnectionHealth>,

	/// Serializes stream transitions from the event session and the monitor.
	transitions: tokio::sync::Mutex<()>,

	cancel: CancellationToken,
	started: AtomicBool,
	tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
	live_loop: parking_lot::Mutex<Option<LiveLoop>>,
	receivers: parking_lot::Mutex<Option<(ChatEventRx, SessionEventRx)>>,
}

/// Per-channel bundle: transports, supervisor, stream state and consumers.
pub struct Connector {
	inner: Arc<ConnectorInner>,
}

impl Connector {
	/// `force_reconnect_after` comes from the settings of the consumer that
	/// caused the connector to be created.
	pub fn new(
		identity: ChannelIdentity,
		cfg: ConnectorConfig,
		force_reconnect_after: Duration,
		factory: &dyn TransportFactory,
		api: Arc<dyn PlatformApi>,
	) -> Self {
		let (chat_tx, chat_rx) = mpsc::channel(cfg.event_channel_capacity);
		let (session_tx, session_rx) = mpsc::channel(cfg.event_channel_capacity);
		let transports = factory.build(&identity, chat_tx, session_tx);
		let policy = SupervisorPolicy::new(&cfg.supervisor, force_reconnect_after);

		Self {
			inner: Arc::new(ConnectorInner {
				identity,
				cfg,
				policy,
				chat: transports.chat,
				session: transports.session,
				api,
				consumers: ConsumerRegistry::new(),
				stream: StreamStateMachine::new(),
				health: parking_lot::Mutex::new(ConnectionHealth::new(Instant::now())),
				transitions: tokio::sync::Mutex::new(()),
				cancel: CancellationToken::new(),
				started: AtomicBool::new(false),
				tasks: parking_lot::Mutex::new(Vec::new()),
				live_loop: parking_lot::Mutex::new(None),
				receivers: parking_lot::Mutex::new(Some((chat_rx, session_rx))),
			}),
		}
	}

	pub fn identity(&self) -> &ChannelIdentity {
		&self.inner.identity
	}

	/// Spawns the event pumps and the supervisor (which connects first).
	/// Repeated calls, or calls after `stop`, do nothing.
	pub fn start(&self) {
		let inner = &self.inner;
		if inner.started.swap(true, Ordering::SeqCst) || inner.cancel.is_cancelled() {
			return;
		}
		let Some((chat_rx, session_rx)) = inner.receivers.lock().take() else {
			return;
		};

		inner.spawn_scoped(chat_pump(Arc::clone(inner), chat_rx));
		inner.spawn_scoped(session_pump(Arc::clone(inner), session_rx));
		inner.spawn_scoped(supervise(Arc::clone(inner)));
		info!(channel = %inner.identity, "connector started");
	}

	/// Cancels every loop, closes both transports and clears the consumers.
	/// Safe to call repeatedly and concurrently with `start`.
	pub async fn stop(&self) {
		let inner = &self.inner;
		let first = !inner.cancel.is_cancelled();
		inner.cancel.cancel();

		let handles = std::mem::take(&mut *inner.tasks.lock());
		inner.stop_live_loop();
		for handle in handles {
			let _ = handle.await;
		}

		inner.chat.disconnect().await;
		inner.session.disconnect().await;
		inner.consumers.clear();
		if first {
			info!(channel = %inner.identity, "connector stopped");
		}
	}

	pub fn is_running(&self) -> bool {
		!self.inner.cancel.is_cancelled() && !self.inner.tasks.lock().is_empty()
	}

	/// `false` when the consumer id is already attached.
	pub fn add_consumer(&self, entity: Arc<ConsumerEntity>) -> bool {
		self.inner.consumers.add(entity)
	}

	pub fn remove_consumer(&self, id: &ConsumerId) -> Option<Arc<ConsumerEntity>> {
		self.inner.consumers.remove(id)
	}

	pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<ConsumerEntity>> {
		self.inner.consumers.get(id)
	}

	pub fn consumer_count(&self) -> usize {
		self.inner.consumers.len()
	}

	pub fn stream_state(&self) -> StreamState {
		self.inner.stream.snapshot()
	}

	pub fn health(&self) -> ConnectionHealth {
		self.inner.health.lock().clone()
	}

	pub fn status(&self) -> ConnectorStatus {
		let inner = &self.inner;
		let stream = inner.stream.snapshot();
		ConnectorStatus {
			channel: inner.identity.login.to_string(),
			broadcaster_id: inner.identity.broadcaster_id.clone(),
			chat_connected: inner.chat.is_connected(),
			event_session_connected: inner.session.is_connected(),
			event_sub_backoff_secs: inner.health.lock().event_sub_backoff.as_secs(),
			online: stream.is_online,
			title: stream.title,
			category: stream.category,
			consumers: inner.consumers.len(),
		}
	}

	pub async fn send_chat(&self, target: ChatTarget, text: &str) -> Result<(), PlatformError> {
		self.inner.chat.send(target, text).await
	}

	pub async fn announce(&self, text: &str) -> Result<(), PlatformError> {
		self.inner
			.api
			.send_announcement(&self.inner.identity.broadcaster_id, text)
			.await
	}

	/// Monitor saw the channel live.
	pub async fn observe_live(&self, info: &StreamInfo) {
		if self.inner.stream.is_online() {
			self.inner.apply_update(&info.title, &info.category, false).await;
		} else {
			self.inner
				.go_online(info.started_at, Some(info.title.clone()), Some(info.category.clone()))
				.await;
		}
	}

	/// Monitor found no live stream for the channel.
	pub async fn observe_offline(&self, observed_at: SystemTime) {
		if self.inner.stream.is_online() {
			warn!(channel = %self.inner.identity, "monitor found stream offline; correcting state");
			self.inner.go_offline(observed_at).await;
		}
	}
}

impl Drop for Connector {
	fn drop(&mut self) {
		// Breaks the live-loop reference cycle when `stop` was never awaited.
		self.inner.cancel.cancel();
		self.inner.stop_live_loop();
	}
}

async fn chat_pump(inner: Arc<ConnectorInner>, mut rx: ChatEventRx) {
	while let Some(ev) = rx.recv().await {
		inner.on_chat_event(ev);
	}
}

async fn session_pump(inner: Arc<ConnectorInner>, mut rx: SessionEventRx) {
	while let Some(ev) = rx.recv().await {
		inner.on_session_event(ev).await;
	}
}

async fn supervise(inner: Arc<ConnectorInner>) {
	inner.connect_all().await;
	let cfg = inner.cfg.supervisor.clone();
	run_supervisor(inner.as_ref(), &cfg, inner.policy.clone(), inner.cancel.clone()).await;
}

impl ConnectorInner {
	fn spawn_scoped<F>(&self, fut: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let cancel = self.cancel.clone();
		let handle = tokio::spawn(async move {
			tokio::select! {
				_ = cancel.cancelled() => {}
				_ = fut => {}
			}
		});

		let mut tasks = self.tasks.lock();
		if self.cancel.is_cancelled() {
			handle.abort();
			return;
		}
		tasks.push(handle);
	}

	async fn connect_all(&self) {
		if let Err(e) = self.chat.connect().await {
			warn!(channel = %self.identity, error = %e, "chat connect failed");
		}
		if let Err(e) = self.session.connect().await {
			warn!(channel = %self.identity, error = %e, "event session connect failed");
		}
	}

	fn on_chat_event(&self, ev: ChatEvent) {
		let channel = self.identity.login.to_string();
		match ev {
			ChatEvent::Connected => {
				metrics::gauge!("relaybot_chat_connected", "channel" => channel).set(1.0);
				info!(channel = %self.identity, "chat link up");
			}
			ChatEvent::Disconnected { reason } => {
				metrics::gauge!("relaybot_chat_connected", "channel" => channel).set(0.0);
				warn!(channel = %self.identity, %reason, "chat link down");
			}
			ChatEvent::Notice(text) => info!(channel = %self.identity, notice = %text, "chat notice"),
			ChatEvent::Message(msg) => self.route_chat(&msg),
		}
	}

	fn route_chat(&self, msg: &ChatMessage) {
		let targets = self.consumers.matching(&msg.channel);
		if targets.is_empty() {
			debug!(channel = %self.identity, origin = %msg.channel, "no consumer for chat message");
			return;
		}
		let now = Instant::now();
		for consumer in targets {
			consumer.on_chat_message(msg, now);
		}
	}

	async fn on_session_event(self: &Arc<Self>, ev: SessionEvent) {
		match ev {
			SessionEvent::Connected { session_id } | SessionEvent::Reconnected { session_id } => {
				self.health.lock().event_session_up();
				metrics::gauge!("relaybot_event_session_connected", "channel" => self.identity.login.to_string())
					.set(1.0);
				info!(channel = %self.identity, %session_id, "event session up; backoff reset");
			}
			SessionEvent::Disconnected { reason } => {
				self.health.lock().event_session_down();
				metrics::gauge!("relaybot_event_session_connected", "channel" => self.identity.login.to_string())
					.set(0.0);
				warn!(channel = %self.identity, %reason, "event session down");
			}
			SessionEvent::ErrorOccurred(e) => warn!(channel = %self.identity, error = %e, "event session error"),
			SessionEvent::Notification(ev) => self.on_platform_event(ev).await,
		}
	}

	async fn on_platform_event(self: &Arc<Self>, ev: PlatformEvent) {
		if *ev.channel() != self.identity.login {
			debug!(channel = %self.identity, origin = %ev.channel(), kind = ev.kind(), "event for another channel");
			return;
		}

		match ev {
			PlatformEvent::Follow { user, followed_at, .. } => {
				let now = Instant::now();
				for consumer in self.consumers.snapshot() {
					consumer.on_follow(&user, followed_at, now);
				}
			}
			PlatformEvent::Raid { from, viewers, .. } => {
				info!(channel = %self.identity, from = %from.login, viewers, "raid");
				let payload = [from.login.clone(), from.name().to_string(), viewers.to_string()];
				self.consumers.broadcast(HookKind::Raid, &payload);
			}
			PlatformEvent::Subscribe { user, tier, is_gift, .. } => {
				info!(channel = %self.identity, user = %user.login, %tier, is_gift, "subscription");
			}
			PlatformEvent::Ban {
				user,
				moderator,
				reason,
				permanent,
				..
			} => {
				for consumer in self.consumers.snapshot() {
					consumer.remove_chatter(&user.id);
				}
				info!(
					channel = %self.identity,
					user = %user.login,
					moderator = %moderator.login,
					reason = reason.as_deref().unwrap_or(""),
					permanent,
					"user banned"
				);
			}
			PlatformEvent::Unban { user, moderator, .. } => {
				info!(channel = %self.identity, user = %user.login, moderator = %moderator.login, "user unbanned");
			}
			PlatformEvent::ChannelUpdate { title, category, .. } => self.apply_update(&title, &category, true).await,
			PlatformEvent::StreamOnline { started_at, .. } => self.go_online(started_at, None, None).await,
			PlatformEvent::StreamOffline { occurred_at, .. } => self.go_offline(occurred_at).await,
		}
	}

	async fn go_online(self: &Arc<Self>, started_at: SystemTime, title: Option<String>, category: Option<String>) {
		let _gate = self.transitions.lock().await;
		let Some(mut started) = self.stream.go_online(started_at, title, category) else {
			debug!(channel = %self.identity, "already online; duplicate ignored");
			return;
		};

		if started.needs_enrichment() {
			match self.api.stream_by_login(self.identity.login.as_str()).await {
				Ok(Some(info)) => {
					let state = self.stream.fill_missing(&info.title, &info.category);
					started.title = state.title;
					started.category = state.category;
				}
				Ok(None) => debug!(channel = %self.identity, "no stream metadata to enrich with"),
				Err(e) => warn!(channel = %self.identity, error = %e, "stream metadata lookup failed"),
			}
		}

		metrics::counter!("relaybot_stream_transitions_total", "to" => "online").increment(1);
		info!(channel = %self.identity, title = %started.title, category = %started.category, "stream online");
		self.start_live_loop();

		let payload = start_payload(&self.identity.login, &started);
		let now = SystemTime::now();
		for consumer in self.consumers.snapshot() {
			consumer.reset_introductions();
			consumer.fire(HookKind::StreamStart, &payload);
			if within_one_shot(started.started_at, now, consumer.settings().one_shot_window) {
				consumer.fire(HookKind::StreamStartOneShot, &payload);
			}
		}
	}

	async fn go_offline(&self, occurred_at: SystemTime) {
		let _gate = self.transitions.lock().await;
		let Some(ended) = self.stream.go_offline(occurred_at) else {
			debug!(channel = %self.identity, "already offline; duplicate ignored");
			return;
		};
		self.stop_live_loop();

		metrics::counter!("relaybot_stream_transitions_total", "to" => "offline").increment(1);
		info!(channel = %self.identity, duration = ?ended.duration(), "stream offline");

		let payload = end_payload(&self.identity.login, &ended);
		let now = SystemTime::now();
		for consumer in self.consumers.snapshot() {
			consumer.fire(HookKind::StreamEnd, &payload);
			if within_one_shot(ended.occurred_at, now, consumer.settings().one_shot_window) {
				consumer.fire(HookKind::StreamEndOneShot, &payload);
			}
		}
	}

	/// `always` re-notifies even when title and category are unchanged.
	async fn apply_update(&self, title: &str, category: &str, always: bool) {
		let _gate = self.transitions.lock().await;
		let Some(updated) = self.stream.update(title, category) else {
			debug!(channel = %self.identity, "metadata stored while offline");
			return;
		};
		if always || updated.changed {
			self.consumers
				.broadcast(HookKind::StreamUpdate, &update_payload(&self.identity.login, &updated));
		}
	}

	fn start_live_loop(self: &Arc<Self>) {
		let cancel = self.cancel.child_token();
		let token = cancel.clone();
		let inner = Arc::clone(self);
		let period = self.cfg.live_tick_interval;

		let handle = tokio::spawn(async move {
			let mut ticker = interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = ticker.tick() => inner.reward_tick().await,
				}
			}
		});

		let previous = self.live_loop.lock().replace(LiveLoop { cancel, handle });
		if let Some(previous) = previous {
			previous.cancel.cancel();
			previous.handle.abort();
		}
	}

	fn stop_live_loop(&self) {
		if let Some(live) = self.live_loop.lock().take() {
			live.cancel.cancel();
			live.handle.abort();
		}
	}

	async fn reward_tick(&self) {
		let viewers = match self.api.chatters(&self.identity.broadcaster_id).await {
			Ok(chatters) => chatters,
			Err(e) => {
				warn!(channel = %self.identity, error = %e, "chatter lookup failed; rewarding active chatters only");
				Vec::new()
			}
		};

		let now = Instant::now();
		for consumer in self.consumers.snapshot() {
			let tick = consumer.reward_tick(&viewers, now);
			debug!(channel = %self.identity, consumer = %consumer.id(), grants = tick.grants.len(), "reward tick");
			consumer.deliver_reward_tick(&tick);
		}
		metrics::counter!("relaybot_reward_ticks_total").increment(1);
	}
}

#[async_trait::async_trait]
impl Supervised for ConnectorInner {
	fn label(&self) -> String {
		self.identity.to_string()
	}

	fn chat_connected(&self) -> bool {
		self.chat.is_connected()
	}

	fn event_session_connected(&self) -> bool {
		self.session.is_connected()
	}

	fn health(&self) -> &parking_lot::Mutex<ConnectionHealth> {
		&self.health
	}

	async fn cold_restart(&self) {
		self.chat.disconnect().await;
		self.session.disconnect().await;
		self.connect_all().await;
	}

	async fn reconnect_event_session(&self) {
		if let Err(e) = self.session.reconnect().await {
			warn!(channel = %self.identity, error = %e, "event session reconnect failed");
		}
	}
}

#[cfg(test)]
#[path = "connector_tests.rs"]
mod tests;
