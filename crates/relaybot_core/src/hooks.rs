#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relaybot_domain::{ChannelLogin, ConsumerId, HookKind, UserRef};

/// Hook callback; receives the positional payload for its kind.
pub type HookHandler = Arc<dyn Fn(&[String]) -> anyhow::Result<()> + Send + Sync>;

/// Explicit hook registration table.
#[derive(Clone, Default)]
pub struct HookTable {
	handlers: HashMap<HookKind, HookHandler>,
}

impl HookTable {
	pub fn new() -> Self {
		Self::default()
	}

	/// Builder-style registration.
	pub fn on<F>(mut self, kind: HookKind, handler: F) -> Self
	where
		F: Fn(&[String]) -> anyhow::Result<()> + Send + Sync + 'static,
	{
		self.handlers.insert(kind, Arc::new(handler));
		self
	}

	/// Returns the handler previously registered for `kind`.
	pub fn insert(&mut self, kind: HookKind, handler: HookHandler) -> Option<HookHandler> {
		self.handlers.insert(kind, handler)
	}

	pub fn remove(&mut self, kind: HookKind) -> Option<HookHandler> {
		self.handlers.remove(&kind)
	}

	pub fn get(&self, kind: HookKind) -> Option<&HookHandler> {
		self.handlers.get(&kind)
	}

	pub fn contains(&self, kind: HookKind) -> bool {
		self.handlers.contains_key(&kind)
	}

	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}
}

impl fmt::Debug for HookTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
		kinds.sort();
		f.debug_struct("HookTable").field("kinds", &kinds).finish()
	}
}

/// Chat text that matched one of a consumer's command prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
	pub consumer_id: ConsumerId,
	pub channel: ChannelLogin,
	pub author: UserRef,
	/// Full message text, prefix included.
	pub text: String,
	pub prefix: String,
	pub message_id: Option<String>,
}

impl CommandInvocation {
	/// Command word without the prefix (`"!points add"` -> `"points"`).
	pub fn name(&self) -> &str {
		self.body().split_whitespace().next().unwrap_or_default()
	}

	pub fn args(&self) -> impl Iterator<Item = &str> {
		self.body().split_whitespace().skip(1)
	}

	fn body(&self) -> &str {
		self.text.strip_prefix(self.prefix.as_str()).unwrap_or(&self.text)
	}
}

/// Longest prefix in `prefixes` that `text` starts with.
pub(crate) fn matching_prefix<'a>(prefixes: &'a [String], text: &str) -> Option<&'a str> {
	prefixes
		.iter()
		.filter(|p| !p.is_empty() && text.starts_with(p.as_str()))
		.max_by_key(|p| p.len())
		.map(String::as_str)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardGrant {
	pub user_id: String,
	pub name: String,
	pub amount: u64,
}

/// One reward round for a consumer, produced by the live-update loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardTick {
	pub consumer_id: ConsumerId,
	pub channel: ChannelLogin,
	pub grants: Vec<RewardGrant>,
}

impl RewardTick {
	pub fn amount_for(&self, user_id: &str) -> Option<u64> {
		self.grants.iter().find(|g| g.user_id == user_id).map(|g| g.amount)
	}
}

/// What a consumer exposes to the core. Calls are synchronous and
/// fire-and-forget; failures and panics are contained per consumer.
pub trait CallbackSink: Send + Sync + 'static {
	fn hooks(&self) -> &HookTable;

	fn handle_command(&self, invocation: &CommandInvocation) -> anyhow::Result<()>;

	fn on_reward_tick(&self, _tick: &RewardTick) -> anyhow::Result<()> {
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn invocation(text: &str, prefix: &str) -> CommandInvocation {
		CommandInvocation {
			consumer_id: ConsumerId::new("c1").unwrap(),
			channel: ChannelLogin::new("streamer").unwrap(),
			author: UserRef::new("1", "viewer"),
			text: text.to_string(),
			prefix: prefix.to_string(),
			message_id: None,
		}
	}

	#[test]
	fn invocation_splits_name_and_args() {
		let inv = invocation("!points add 10", "!");
		assert_eq!(inv.name(), "points");
		assert_eq!(inv.args().collect::<Vec<_>>(), vec!["add", "10"]);
	}

	#[test]
	fn longest_prefix_wins() {
		let prefixes = vec!["!".to_string(), "!!".to_string(), "".to_string()];
		assert_eq!(matching_prefix(&prefixes, "!!vote 1"), Some("!!"));
		assert_eq!(matching_prefix(&prefixes, "!help"), Some("!"));
		assert_eq!(matching_prefix(&prefixes, "hello"), None);
	}

	#[test]
	fn table_registration() {
		let mut table = HookTable::new().on(HookKind::Follow, |_| Ok(()));
		assert!(table.contains(HookKind::Follow));
		assert!(!table.contains(HookKind::Raid));
		assert!(table.remove(HookKind::Follow).is_some());
		assert!(table.is_empty());
	}
}
