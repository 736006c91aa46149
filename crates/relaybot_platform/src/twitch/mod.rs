#![forbid(unsafe_code)]

mod api;
pub mod auth;
mod chat;
mod eventsub;
mod helix;
mod session;

#[cfg(test)]
mod test_support;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use relaybot_domain::ChannelIdentity;
use url::Url;

pub use api::TwitchApi;
pub use auth::{OAuthConfig, TwitchCredentialBroker};
pub use chat::{ChatConfig, DEFAULT_IRC_WS_URL, TwitchChatClient};
pub use eventsub::{TopicIds, topic_table};
pub use helix::DEFAULT_HELIX_BASE_URL;
pub use session::{DEFAULT_EVENTSUB_WS_URL, EventSessionConfig, TwitchEventSession};

use crate::{
	ChannelTransports, ChatEventTx, CredentialBroker, PlatformApi, SessionEventTx, TokenStore, TransportFactory,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TwitchWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<TwitchWs>> + Send + Sync>;

async fn connect_ws(url: Url) -> anyhow::Result<TwitchWs> {
	let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
		.await
		.with_context(|| format!("connect_async to {url}"))?;
	Ok(ws)
}

pub(crate) fn default_ws_connector() -> WsConnector {
	Arc::new(|url: Url| Box::pin(connect_ws(url)) as BoxFuture<'static, anyhow::Result<TwitchWs>>)
}

/// Builds a Twitch chat client and EventSub session per channel, sharing one
/// credential broker and REST client.
pub struct TwitchTransportFactory {
	chat: ChatConfig,
	session: EventSessionConfig,
	broker: Arc<dyn CredentialBroker>,
	store: Option<Arc<dyn TokenStore>>,
	api: Arc<dyn PlatformApi>,
}

impl TwitchTransportFactory {
	pub fn new(
		chat: ChatConfig,
		session: EventSessionConfig,
		broker: Arc<dyn CredentialBroker>,
		api: Arc<dyn PlatformApi>,
	) -> Self {
		Self {
			chat,
			session,
			broker,
			store: None,
			api,
		}
	}

	/// Chat clients persist tokens they refresh on login through `store`.
	pub fn with_token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
		self.store = Some(store);
		self
	}
}

impl TransportFactory for TwitchTransportFactory {
	fn build(&self, identity: &ChannelIdentity, chat_tx: ChatEventTx, session_tx: SessionEventTx) -> ChannelTransports {
		let mut chat = TwitchChatClient::new(
			self.chat.clone(),
			identity.login.clone(),
			Arc::clone(&self.broker),
			Arc::clone(&self.api),
			chat_tx,
		);
		if let Some(store) = self.store.as_ref() {
			chat = chat.with_token_store(Arc::clone(store));
		}
		let session = TwitchEventSession::new(self.session.clone(), identity.clone(), Arc::clone(&self.api), session_tx);

		ChannelTransports {
			chat: Arc::new(chat),
			session: Arc::new(session),
		}
	}
}
