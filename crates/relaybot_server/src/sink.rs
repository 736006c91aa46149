#![forbid(unsafe_code)]

use std::sync::Weak;

use relaybot_core::{CallbackSink, CommandInvocation, HookTable, IntegrationFacade, RewardTick};
use relaybot_domain::{ChannelLogin, ConsumerId, HookKind};
use tracing::{info, warn};

/// Built-in consumer: logs every callback and optionally announces fresh
/// stream starts.
pub struct LogSink {
	hooks: HookTable,
}

impl LogSink {
	/// `facade` is weak: the facade owns this sink through its connector.
	pub fn new(
		consumer: ConsumerId,
		channel: ChannelLogin,
		announce_on_start: Option<String>,
		facade: Weak<IntegrationFacade>,
	) -> Self {
		let mut hooks = HookTable::new();
		for kind in HookKind::ALL {
			let consumer = consumer.clone();
			hooks = hooks.on(kind, move |payload| {
				info!(%consumer, hook = %kind, payload = ?payload, "hook fired");
				Ok(())
			});
		}

		if let Some(template) = announce_on_start {
			let consumer = consumer.clone();
			hooks = hooks.on(HookKind::StreamStartOneShot, move |payload| {
				info!(%consumer, hook = %HookKind::StreamStartOneShot, payload = ?payload, "hook fired");
				let text = render_announcement(&template, payload);
				spawn_announcement(Weak::clone(&facade), channel.clone(), text)
			});
		}

		Self { hooks }
	}
}

impl CallbackSink for LogSink {
	fn hooks(&self) -> &HookTable {
		&self.hooks
	}

	fn handle_command(&self, invocation: &CommandInvocation) -> anyhow::Result<()> {
		info!(
			consumer = %invocation.consumer_id,
			channel = %invocation.channel,
			user = %invocation.author.login,
			command = invocation.name(),
			"chat command"
		);
		Ok(())
	}

	fn on_reward_tick(&self, tick: &RewardTick) -> anyhow::Result<()> {
		let total: u64 = tick.grants.iter().map(|g| g.amount).sum();
		info!(
			consumer = %tick.consumer_id,
			channel = %tick.channel,
			recipients = tick.grants.len(),
			total,
			"reward tick"
		);
		Ok(())
	}
}

/// Start payload is `[channel, title, category, started_at]`.
fn render_announcement(template: &str, payload: &[String]) -> String {
	let field = |i: usize| payload.get(i).map(String::as_str).unwrap_or_default();
	template
		.replace("{channel}", field(0))
		.replace("{title}", field(1))
		.replace("{category}", field(2))
}

fn spawn_announcement(facade: Weak<IntegrationFacade>, channel: ChannelLogin, text: String) -> anyhow::Result<()> {
	let runtime = tokio::runtime::Handle::try_current()?;
	runtime.spawn(async move {
		let Some(facade) = facade.upgrade() else {
			return;
		};
		if let Err(e) = facade.announce(&channel, &text).await {
			warn!(%channel, error = %e, "start announcement failed");
		}
	});
	Ok(())
}
