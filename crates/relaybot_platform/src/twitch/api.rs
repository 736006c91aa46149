#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tracing::{debug, warn};
use url::Url;

use super::helix::{CreateSubscriptionOutcome, HelixClient};
use crate::{
	CredentialBroker, PlatformApi, PlatformError, PlatformUser, StreamInfo, SubscriptionTopic, TokenStore,
	ValidatedTokens,
};

/// Run `op`; on any failure refresh credentials and run it exactly once more.
///
/// A failed refresh is returned as-is and the second attempt is skipped.
pub(crate) async fn retry_once_after_refresh<T, Op, OpFut, Refresh, RefreshFut>(
	label: &'static str,
	op: Op,
	refresh: Refresh,
) -> Result<T, PlatformError>
where
	Op: Fn() -> OpFut,
	OpFut: Future<Output = Result<T, PlatformError>>,
	Refresh: FnOnce() -> RefreshFut,
	RefreshFut: Future<Output = Result<(), PlatformError>>,
{
	match op().await {
		Ok(v) => Ok(v),
		Err(first) => {
			warn!(call = label, error = %first, "platform call failed; refreshing credentials and retrying once");
			metrics::counter!("relaybot_api_retries_total", "call" => label).increment(1);
			refresh().await?;
			op().await
		}
	}
}

/// Helix REST access for the bot account, with credential refresh on failure.
pub struct TwitchApi {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	broker: Arc<dyn CredentialBroker>,
	store: Option<Arc<dyn TokenStore>>,
	bot_user_id: RwLock<Option<String>>,
}

impl TwitchApi {
	pub fn new(
		helix_base_url: &str,
		client_id: impl Into<String>,
		broker: Arc<dyn CredentialBroker>,
		store: Option<Arc<dyn TokenStore>>,
	) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("relaybot/0.x (helix)")
			.timeout(Duration::from_secs(15))
			.build()
			.context("build reqwest client")?;
		let base_url = Url::parse(helix_base_url).with_context(|| format!("parse helix base url {helix_base_url:?}"))?;

		Ok(Self {
			http,
			base_url,
			client_id: client_id.into(),
			broker,
			store,
			bot_user_id: RwLock::new(None),
		})
	}

	/// Adopt a broker result: remember the bot id and persist changed tokens.
	pub fn adopt(&self, validated: &ValidatedTokens) {
		if let Some(id) = validated.user_id.as_ref() {
			*self.bot_user_id.write() = Some(id.clone());
		}
		if validated.changed
			&& let Some(store) = self.store.as_ref()
		{
			match store.save(&validated.tokens) {
				Ok(()) => debug!("persisted refreshed twitch tokens"),
				Err(e) => warn!(error = %e, "failed to persist refreshed twitch tokens"),
			}
		}
	}

	fn helix(&self) -> Result<HelixClient, PlatformError> {
		let tokens = self.broker.current();
		let Some(access) = tokens.access_token else {
			return Err(PlatformError::Auth("no twitch access token".to_string()));
		};
		Ok(HelixClient::new(
			self.http.clone(),
			self.base_url.clone(),
			self.client_id.clone(),
			access.expose().to_string(),
		))
	}

	async fn refresh(&self) -> Result<(), PlatformError> {
		let validated = self.broker.ensure_valid(false).await?;
		self.adopt(&validated);
		Ok(())
	}

	fn require_bot_id(&self) -> Result<String, PlatformError> {
		self.bot_user_id()
			.ok_or_else(|| PlatformError::Auth("bot user id unknown (token not validated yet)".to_string()))
	}

	async fn with_refresh<T, F, Fut>(&self, label: &'static str, op: F) -> Result<T, PlatformError>
	where
		F: Fn(HelixClient) -> Fut,
		Fut: Future<Output = Result<T, PlatformError>>,
	{
		let op = &op;
		let this = self;
		retry_once_after_refresh(label, move || async move { op(this.helix()?).await }, move || this.refresh()).await
	}
}

#[async_trait::async_trait]
impl PlatformApi for TwitchApi {
	async fn users_by_login(&self, logins: &[String]) -> Result<Vec<PlatformUser>, PlatformError> {
		if logins.is_empty() {
			return Ok(Vec::new());
		}
		self.with_refresh("users_by_login", |h| async move { h.get_users_by_login(logins).await })
			.await
	}

	async fn streams_by_login(&self, logins: &[String]) -> Result<Vec<StreamInfo>, PlatformError> {
		if logins.is_empty() {
			return Ok(Vec::new());
		}
		self.with_refresh("streams_by_login", |h| async move { h.get_streams_by_login(logins).await })
			.await
	}

	async fn chatters(&self, broadcaster_id: &str) -> Result<Vec<PlatformUser>, PlatformError> {
		self.with_refresh("chatters", |h| async move {
			let moderator = self.require_bot_id()?;
			h.get_chatters(broadcaster_id, &moderator).await
		})
		.await
	}

	async fn create_subscription(&self, topic: &SubscriptionTopic, session_id: &str) -> Result<(), PlatformError> {
		let outcome = self
			.with_refresh("create_subscription", |h| async move {
				h.create_eventsub_subscription(topic, session_id).await
			})
			.await?;

		match outcome {
			CreateSubscriptionOutcome::Created { id } => {
				debug!(topic = %topic.name, subscription_id = %id, "eventsub subscription created")
			}
			CreateSubscriptionOutcome::AlreadyExists => {
				debug!(topic = %topic.name, "eventsub subscription already exists")
			}
		}
		Ok(())
	}

	async fn send_announcement(&self, broadcaster_id: &str, text: &str) -> Result<(), PlatformError> {
		self.with_refresh("send_announcement", |h| async move {
			let moderator = self.require_bot_id()?;
			h.send_chat_announcement(broadcaster_id, &moderator, text).await
		})
		.await
	}

	async fn send_whisper(&self, to_user_id: &str, text: &str) -> Result<(), PlatformError> {
		self.with_refresh("send_whisper", |h| async move {
			let from = self.require_bot_id()?;
			h.send_whisper(&from, to_user_id, text).await
		})
		.await
	}

	fn bot_user_id(&self) -> Option<String> {
		self.bot_user_id.read().clone()
	}
}
