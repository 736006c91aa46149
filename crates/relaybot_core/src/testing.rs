#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use relaybot_domain::{ChannelIdentity, ChannelLogin, HookKind, UserRef};
use relaybot_platform::{
	ChannelTransports, ChatEvent, ChatEventTx, ChatMessage, ChatTarget, ChatTransport, EventSession, PlatformApi,
	PlatformError, PlatformEvent, PlatformUser, SessionEvent, SessionEventTx, StreamInfo, SubscriptionTopic,
	TransportFactory,
};

use crate::hooks::{CallbackSink, CommandInvocation, HookTable, RewardTick};

/// Records every callback it receives.
pub(crate) struct RecordingSink {
	hooks: HookTable,
	calls: Arc<Mutex<Vec<(HookKind, Vec<String>)>>>,
	pub(crate) commands: Mutex<Vec<CommandInvocation>>,
	pub(crate) ticks: Mutex<Vec<RewardTick>>,
	fail: bool,
}

impl RecordingSink {
	pub(crate) fn new() -> Arc<Self> {
		Self::build(false)
	}

	/// Every callback panics or errors after recording.
	pub(crate) fn failing() -> Arc<Self> {
		Self::build(true)
	}

	fn build(fail: bool) -> Arc<Self> {
		let calls: Arc<Mutex<Vec<(HookKind, Vec<String>)>>> = Arc::default();
		let mut hooks = HookTable::new();
		for kind in HookKind::ALL {
			let calls = Arc::clone(&calls);
			hooks = hooks.on(kind, move |payload| {
				calls.lock().push((kind, payload.to_vec()));
				if fail {
					panic!("hook {kind} exploded");
				}
				Ok(())
			});
		}
		Arc::new(Self {
			hooks,
			calls,
			commands: Mutex::default(),
			ticks: Mutex::default(),
			fail,
		})
	}

	pub(crate) fn calls(&self, kind: HookKind) -> Vec<Vec<String>> {
		self.calls
			.lock()
			.iter()
			.filter(|(k, _)| *k == kind)
			.map(|(_, p)| p.clone())
			.collect()
	}

	pub(crate) fn count(&self, kind: HookKind) -> usize {
		self.calls.lock().iter().filter(|(k, _)| *k == kind).count()
	}
}

impl CallbackSink for RecordingSink {
	fn hooks(&self) -> &HookTable {
		&self.hooks
	}

	fn handle_command(&self, invocation: &CommandInvocation) -> anyhow::Result<()> {
		self.commands.lock().push(invocation.clone());
		if self.fail {
			anyhow::bail!("command handler failed");
		}
		Ok(())
	}

	fn on_reward_tick(&self, tick: &RewardTick) -> anyhow::Result<()> {
		self.ticks.lock().push(tick.clone());
		Ok(())
	}
}

pub(crate) fn login(s: &str) -> ChannelLogin {
	ChannelLogin::new(s).unwrap()
}

pub(crate) fn identity(s: &str) -> ChannelIdentity {
	ChannelIdentity::new(login(s), format!("{s}-id"))
}

pub(crate) fn chat(channel: &str, user_id: &str, name: &str, text: &str) -> ChatMessage {
	ChatMessage {
		channel: login(channel),
		author: UserRef::new(user_id, name.to_ascii_lowercase()).with_display(name),
		text: text.to_string(),
		message_id: None,
		received_at: SystemTime::now(),
	}
}

#[derive(Default)]
pub(crate) struct FakeApi {
	pub(crate) users: Mutex<HashMap<String, String>>,
	pub(crate) streams: Mutex<Vec<StreamInfo>>,
	pub(crate) fail_streams: AtomicBool,
	pub(crate) stream_calls: Mutex<Vec<Vec<String>>>,
	pub(crate) chatters: Mutex<Option<Vec<String>>>,
	pub(crate) announcements: Mutex<Vec<(String, String)>>,
	pub(crate) user_lookups: AtomicU32,
}

impl FakeApi {
	pub(crate) fn with_users(logins: &[&str]) -> Arc<Self> {
		let api = Self::default();
		for l in logins {
			api.users.lock().insert(l.to_string(), format!("{l}-id"));
		}
		Arc::new(api)
	}

	pub(crate) fn set_live(&self, login: &str, title: &str, category: &str, started_at: SystemTime) {
		let mut streams = self.streams.lock();
		streams.retain(|s| s.user_login != login);
		streams.push(StreamInfo {
			user_id: format!("{login}-id"),
			user_login: login.to_string(),
			title: title.to_string(),
			category: category.to_string(),
			started_at,
			viewer_count: 1,
		});
	}

	pub(crate) fn set_offline(&self, login: &str) {
		self.streams.lock().retain(|s| s.user_login != login);
	}
}

#[async_trait::async_trait]
impl PlatformApi for FakeApi {
	async fn users_by_login(&self, logins: &[String]) -> Result<Vec<PlatformUser>, PlatformError> {
		self.user_lookups.fetch_add(1, Ordering::SeqCst);
		let users = self.users.lock();
		Ok(logins
			.iter()
			.filter_map(|l| {
				users.get(&l.to_ascii_lowercase()).map(|id| PlatformUser {
					id: id.clone(),
					login: l.to_ascii_lowercase(),
					display_name: None,
				})
			})
			.collect())
	}

	async fn streams_by_login(&self, logins: &[String]) -> Result<Vec<StreamInfo>, PlatformError> {
		self.stream_calls.lock().push(logins.to_vec());
		if self.fail_streams.load(Ordering::SeqCst) {
			return Err(PlatformError::Transport("streams lookup failed".to_string()));
		}
		Ok(self
			.streams
			.lock()
			.iter()
			.filter(|s| logins.iter().any(|l| l.eq_ignore_ascii_case(&s.user_login)))
			.cloned()
			.collect())
	}

	async fn chatters(&self, _broadcaster_id: &str) -> Result<Vec<PlatformUser>, PlatformError> {
		match self.chatters.lock().clone() {
			Some(ids) => Ok(ids
				.into_iter()
				.map(|id| PlatformUser {
					login: id.clone(),
					id,
					display_name: None,
				})
				.collect()),
			None => Err(PlatformError::Transport("chatters lookup failed".to_string())),
		}
	}

	async fn create_subscription(&self, _topic: &SubscriptionTopic, _session_id: &str) -> Result<(), PlatformError> {
		Ok(())
	}

	async fn send_announcement(&self, broadcaster_id: &str, text: &str) -> Result<(), PlatformError> {
		self.announcements.lock().push((broadcaster_id.to_string(), text.to_string()));
		Ok(())
	}

	async fn send_whisper(&self, _to_user_id: &str, _text: &str) -> Result<(), PlatformError> {
		Ok(())
	}

	fn bot_user_id(&self) -> Option<String> {
		Some("bot-id".to_string())
	}
}

pub(crate) struct FakeChat {
	pub(crate) connected: AtomicBool,
	pub(crate) fail_connect: AtomicBool,
	pub(crate) connects: AtomicU32,
	pub(crate) disconnects: AtomicU32,
	pub(crate) sent: Mutex<Vec<(ChatTarget, String)>>,
	tx: ChatEventTx,
}

impl FakeChat {
	pub(crate) async fn inject(&self, ev: ChatEvent) {
		self.tx.send(ev).await.unwrap();
	}

	/// Simulates a dropped socket.
	pub(crate) fn drop_link(&self) {
		self.connected.store(false, Ordering::SeqCst);
	}
}

#[async_trait::async_trait]
impl ChatTransport for FakeChat {
	async fn connect(&self) -> Result<(), PlatformError> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		if self.fail_connect.load(Ordering::SeqCst) {
			return Err(PlatformError::Transport("chat refused".to_string()));
		}
		self.connected.store(true, Ordering::SeqCst);
		let _ = self.tx.try_send(ChatEvent::Connected);
		Ok(())
	}

	async fn send(&self, target: ChatTarget, text: &str) -> Result<(), PlatformError> {
		self.sent.lock().push((target, text.to_string()));
		Ok(())
	}

	async fn disconnect(&self) {
		self.disconnects.fetch_add(1, Ordering::SeqCst);
		self.connected.store(false, Ordering::SeqCst);
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}
}

pub(crate) struct FakeSession {
	pub(crate) connected: AtomicBool,
	pub(crate) fail_connect: AtomicBool,
	pub(crate) connects: AtomicU32,
	pub(crate) reconnects: AtomicU32,
	pub(crate) disconnects: AtomicU32,
	tx: SessionEventTx,
}

impl FakeSession {
	pub(crate) async fn inject(&self, ev: PlatformEvent) {
		self.tx.send(SessionEvent::Notification(ev)).await.unwrap();
	}

	pub(crate) async fn emit(&self, ev: SessionEvent) {
		self.tx.send(ev).await.unwrap();
	}

	pub(crate) fn drop_link(&self) {
		self.connected.store(false, Ordering::SeqCst);
	}

	fn open(&self) -> Result<(), PlatformError> {
		if self.fail_connect.load(Ordering::SeqCst) {
			return Err(PlatformError::Transport("eventsub refused".to_string()));
		}
		self.connected.store(true, Ordering::SeqCst);
		Ok(())
	}
}

#[async_trait::async_trait]
impl EventSession for FakeSession {
	async fn connect(&self) -> Result<(), PlatformError> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		self.open()?;
		let _ = self.tx.try_send(SessionEvent::Connected {
			session_id: "s".to_string(),
		});
		Ok(())
	}

	async fn reconnect(&self) -> Result<(), PlatformError> {
		self.reconnects.fetch_add(1, Ordering::SeqCst);
		self.open()?;
		let _ = self.tx.try_send(SessionEvent::Connected {
			session_id: "s2".to_string(),
		});
		Ok(())
	}

	async fn disconnect(&self) {
		self.disconnects.fetch_add(1, Ordering::SeqCst);
		self.connected.store(false, Ordering::SeqCst);
	}

	fn is_connected(&self) -> bool {
		self.connected.load(Ordering::SeqCst)
	}
}

/// Builds fakes and keeps them reachable by channel.
#[derive(Default)]
pub(crate) struct FakeFactory {
	built: Mutex<HashMap<ChannelLogin, (Arc<FakeChat>, Arc<FakeSession>)>>,
}

impl FakeFactory {
	pub(crate) fn chat(&self, channel: &str) -> Arc<FakeChat> {
		Arc::clone(&self.built.lock()[&login(channel)].0)
	}

	pub(crate) fn session(&self, channel: &str) -> Arc<FakeSession> {
		Arc::clone(&self.built.lock()[&login(channel)].1)
	}

	pub(crate) fn built_count(&self) -> usize {
		self.built.lock().len()
	}
}

impl TransportFactory for FakeFactory {
	fn build(&self, identity: &ChannelIdentity, chat_tx: ChatEventTx, session_tx: SessionEventTx) -> ChannelTransports {
		let chat = Arc::new(FakeChat {
			connected: AtomicBool::new(false),
			fail_connect: AtomicBool::new(false),
			connects: AtomicU32::new(0),
			disconnects: AtomicU32::new(0),
			sent: Mutex::default(),
			tx: chat_tx,
		});
		let session = Arc::new(FakeSession {
			connected: AtomicBool::new(false),
			fail_connect: AtomicBool::new(false),
			connects: AtomicU32::new(0),
			reconnects: AtomicU32::new(0),
			disconnects: AtomicU32::new(0),
			tx: session_tx,
		});
		self.built
			.lock()
			.insert(identity.login.clone(), (Arc::clone(&chat), Arc::clone(&session)));

		ChannelTransports { chat, session }
	}
}

/// Let spawned tasks drain their queues (auto-advances under paused time).
pub(crate) async fn settle() {
	tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
