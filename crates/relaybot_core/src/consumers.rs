#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use relaybot_domain::{ChannelIdentity, ChannelLogin, ConsumerId, HookKind, UserRef};
use relaybot_platform::{ChatMessage, PlatformUser};
use tokio::time::Instant;
use tracing::debug;

use crate::config::ChannelSettings;
use crate::dispatch::isolate;
use crate::hooks::{CallbackSink, CommandInvocation, RewardGrant, RewardTick, matching_prefix};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveChatter {
	pub user_id: String,
	pub name: String,
	pub last_message: Instant,
}

#[derive(Default)]
struct ConsumerState {
	/// Follow de-duplication: user id -> cooldown expiry.
	cooldowns: HashMap<String, Instant>,
	active_chatters: Vec<ActiveChatter>,
	followers: HashMap<String, SystemTime>,
	/// Users greeted since registration or the last stream start.
	introduced: HashSet<String>,
}

/// What a chat message did to a consumer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChatOutcome {
	pub introduced: bool,
	pub command: bool,
}

/// Per-consumer bookkeeping for one channel.
///
/// The state lock only guards in-memory mutations; sink callbacks run after
/// it is released.
pub struct ConsumerEntity {
	id: ConsumerId,
	channel: ChannelIdentity,
	settings: ChannelSettings,
	sink: Arc<dyn CallbackSink>,
	state: Mutex<ConsumerState>,
}

impl ConsumerEntity {
	pub fn new(id: ConsumerId, channel: ChannelIdentity, settings: ChannelSettings, sink: Arc<dyn CallbackSink>) -> Self {
		Self {
			id,
			channel,
			settings,
			sink,
			state: Mutex::new(ConsumerState::default()),
		}
	}

	pub fn id(&self) -> &ConsumerId {
		&self.id
	}

	pub fn channel(&self) -> &ChannelIdentity {
		&self.channel
	}

	pub fn settings(&self) -> &ChannelSettings {
		&self.settings
	}

	pub fn accepts(&self, channel: &ChannelLogin) -> bool {
		self.channel.login == *channel
	}

	/// Invoke one hook; `false` when unregistered or it failed.
	pub fn fire(&self, kind: HookKind, payload: &[String]) -> bool {
		let Some(handler) = self.sink.hooks().get(kind).cloned() else {
			return false;
		};
		isolate(&self.id, kind.as_str(), || handler(payload))
	}

	pub fn on_chat_message(&self, msg: &ChatMessage, now: Instant) -> ChatOutcome {
		let user_id = msg.author.id.clone();
		let first_seen = {
			let mut state = self.state.lock();
			match state.active_chatters.iter_mut().find(|c| c.user_id == user_id) {
				Some(chatter) => chatter.last_message = now,
				None => state.active_chatters.push(ActiveChatter {
					user_id: user_id.clone(),
					name: msg.author.name().to_string(),
					last_message: now,
				}),
			}
			state.introduced.insert(user_id.clone())
		};

		let mut outcome = ChatOutcome::default();
		if first_seen {
			outcome.introduced = true;
			self.fire(HookKind::UserIntro, &[user_id, msg.author.name().to_string()]);
		}

		if let Some(prefix) = matching_prefix(&self.settings.command_prefixes, &msg.text) {
			outcome.command = true;
			let invocation = CommandInvocation {
				consumer_id: self.id.clone(),
				channel: msg.channel.clone(),
				author: msg.author.clone(),
				text: msg.text.clone(),
				prefix: prefix.to_string(),
				message_id: msg.message_id.clone(),
			};
			isolate(&self.id, "handle_command", || self.sink.handle_command(&invocation));
		}
		outcome
	}

	/// Records the follow and fires `OnFollow` unless the user is cooling down.
	pub fn on_follow(&self, user: &UserRef, followed_at: SystemTime, now: Instant) -> bool {
		let fire = {
			let mut state = self.state.lock();
			state.followers.insert(user.id.clone(), followed_at);
			state.cooldowns.retain(|_, expiry| *expiry > now);
			let cooling = state.cooldowns.get(&user.id).is_some_and(|expiry| *expiry > now);
			if !cooling {
				state.cooldowns.insert(user.id.clone(), now + self.settings.follow_cooldown);
			}
			!cooling
		};

		if fire {
			self.fire(HookKind::Follow, &[user.id.clone(), user.name().to_string()]);
		} else {
			debug!(consumer = %self.id, user_id = %user.id, "follow suppressed by cooldown");
		}
		fire
	}

	pub fn remove_chatter(&self, user_id: &str) -> bool {
		let mut state = self.state.lock();
		let before = state.active_chatters.len();
		state.active_chatters.retain(|c| c.user_id != user_id);
		state.active_chatters.len() != before
	}

	/// Drops chatters idle longer than the inactivity window; returns the survivors.
	pub fn sweep_inactive(&self, now: Instant) -> Vec<ActiveChatter> {
		let window = self.settings.inactivity_window;
		let mut state = self.state.lock();
		state
			.active_chatters
			.retain(|c| now.saturating_duration_since(c.last_message) <= window);
		state.active_chatters.clone()
	}

	/// Sweep, then compute one reward round.
	///
	/// Every surviving active chatter earns base plus bonus. `viewers` is the
	/// platform's chatter list: silent viewers in it earn base only.
	pub fn reward_tick(&self, viewers: &[PlatformUser], now: Instant) -> RewardTick {
		let survivors = self.sweep_inactive(now);
		let base = self.settings.reward_base;
		let bonus = self.settings.reward_bonus;

		let mut grants: BTreeMap<String, RewardGrant> = BTreeMap::new();
		for chatter in survivors {
			grants.insert(
				chatter.user_id.clone(),
				RewardGrant {
					user_id: chatter.user_id,
					name: chatter.name,
					amount: base + bonus,
				},
			);
		}
		for viewer in viewers {
			grants.entry(viewer.id.clone()).or_insert_with(|| RewardGrant {
				user_id: viewer.id.clone(),
				name: viewer.display_name.clone().unwrap_or_else(|| viewer.login.clone()),
				amount: base,
			});
		}

		grants
			.entry(self.channel.broadcaster_id.clone())
			.or_insert_with(|| RewardGrant {
				user_id: self.channel.broadcaster_id.clone(),
				name: self.channel.login.to_string(),
				amount: base,
			});

		RewardTick {
			consumer_id: self.id.clone(),
			channel: self.channel.login.clone(),
			grants: grants.into_values().collect(),
		}
	}

	pub fn deliver_reward_tick(&self, tick: &RewardTick) -> bool {
		isolate(&self.id, "on_reward_tick", || self.sink.on_reward_tick(tick))
	}

	/// A new stream starts a new round of introductions.
	pub fn reset_introductions(&self) {
		self.state.lock().introduced.clear();
	}

	pub fn active_chatters(&self) -> Vec<ActiveChatter> {
		self.state.lock().active_chatters.clone()
	}

	pub fn follower_count(&self) -> usize {
		self.state.lock().followers.len()
	}

	pub fn cooldown_count(&self) -> usize {
		self.state.lock().cooldowns.len()
	}

	pub fn clear(&self) {
		*self.state.lock() = ConsumerState::default();
	}
}

impl std::fmt::Debug for ConsumerEntity {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ConsumerEntity")
			.field("id", &self.id)
			.field("channel", &self.channel)
			.field("hooks", self.sink.hooks())
			.finish_non_exhaustive()
	}
}

/// Observer list of consumers attached to one connector, keyed by id.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
	entities: RwLock<BTreeMap<ConsumerId, Arc<ConsumerEntity>>>,
}

impl ConsumerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// `false` when the id is already registered.
	pub fn add(&self, entity: Arc<ConsumerEntity>) -> bool {
		let mut entities = self.entities.write();
		if entities.contains_key(entity.id()) {
			return false;
		}
		entities.insert(entity.id().clone(), entity);
		true
	}

	/// Removes and clears the entity.
	pub fn remove(&self, id: &ConsumerId) -> Option<Arc<ConsumerEntity>> {
		let removed = self.entities.write().remove(id);
		if let Some(entity) = removed.as_ref() {
			entity.clear();
		}
		removed
	}

	pub fn get(&self, id: &ConsumerId) -> Option<Arc<ConsumerEntity>> {
		self.entities.read().get(id).cloned()
	}

	pub fn contains(&self, id: &ConsumerId) -> bool {
		self.entities.read().contains_key(id)
	}

	/// Point-in-time copy; callbacks run against this, never under the lock.
	pub fn snapshot(&self) -> Vec<Arc<ConsumerEntity>> {
		self.entities.read().values().cloned().collect()
	}

	pub fn matching(&self, channel: &ChannelLogin) -> Vec<Arc<ConsumerEntity>> {
		self.entities
			.read()
			.values()
			.filter(|e| e.accepts(channel))
			.cloned()
			.collect()
	}

	pub fn len(&self) -> usize {
		self.entities.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entities.read().is_empty()
	}

	/// Fire `kind` on every consumer; returns how many succeeded.
	pub fn broadcast(&self, kind: HookKind, payload: &[String]) -> usize {
		self.snapshot().iter().filter(|e| e.fire(kind, payload)).count()
	}

	pub fn clear(&self) {
		let drained = std::mem::take(&mut *self.entities.write());
		for entity in drained.values() {
			entity.clear();
		}
	}
}

#[cfg(test)]
#[path = "consumers_tests.rs"]
mod tests;
