#![forbid(unsafe_code)]

use std::future::Future;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{WebSocketStream, accept_async};

use crate::{
	CredentialBroker, PlatformApi, PlatformError, PlatformUser, SecretString, StreamInfo, SubscriptionTopic, Tokens,
	ValidatedTokens,
};

pub(crate) type ServerWs = WebSocketStream<TcpStream>;

/// Local websocket server; every accepted connection runs `handler`.
pub(crate) async fn ws_server<F, Fut>(handler: F) -> (String, JoinHandle<()>)
where
	F: Fn(ServerWs) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = ()> + Send + 'static,
{
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let handle = tokio::spawn(async move {
		while let Ok((tcp, _)) = listener.accept().await {
			if let Ok(ws) = accept_async(tcp).await {
				tokio::spawn(handler(ws));
			}
		}
	});
	(format!("ws://{addr}/ws"), handle)
}

#[derive(Default)]
pub(crate) struct FakeApi {
	pub(crate) bot_id: Option<String>,
	pub(crate) fail_topics: Vec<String>,
	pub(crate) subscriptions: Mutex<Vec<(SubscriptionTopic, String)>>,
	pub(crate) whispers: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl PlatformApi for FakeApi {
	async fn users_by_login(&self, _logins: &[String]) -> Result<Vec<PlatformUser>, PlatformError> {
		Ok(Vec::new())
	}

	async fn streams_by_login(&self, _logins: &[String]) -> Result<Vec<StreamInfo>, PlatformError> {
		Ok(Vec::new())
	}

	async fn chatters(&self, _broadcaster_id: &str) -> Result<Vec<PlatformUser>, PlatformError> {
		Ok(Vec::new())
	}

	async fn create_subscription(&self, topic: &SubscriptionTopic, session_id: &str) -> Result<(), PlatformError> {
		self.subscriptions.lock().push((topic.clone(), session_id.to_string()));
		if self.fail_topics.contains(&topic.name) {
			return Err(PlatformError::Transport(format!("{} rejected", topic.name)));
		}
		Ok(())
	}

	async fn send_announcement(&self, _broadcaster_id: &str, _text: &str) -> Result<(), PlatformError> {
		Ok(())
	}

	async fn send_whisper(&self, to_user_id: &str, text: &str) -> Result<(), PlatformError> {
		self.whispers.lock().push((to_user_id.to_string(), text.to_string()));
		Ok(())
	}

	fn bot_user_id(&self) -> Option<String> {
		self.bot_id.clone()
	}
}

pub(crate) struct StaticBroker(pub(crate) Tokens);

impl StaticBroker {
	pub(crate) fn with_access(token: &str) -> Self {
		Self(Tokens::new(Some(SecretString::new(token)), None))
	}
}

#[async_trait::async_trait]
impl CredentialBroker for StaticBroker {
	async fn ensure_valid(&self, _allow_interactive: bool) -> Result<ValidatedTokens, PlatformError> {
		Ok(ValidatedTokens {
			tokens: self.0.clone(),
			changed: false,
			user_id: Some("bot-1".to_string()),
			login: Some("bot".to_string()),
		})
	}

	fn current(&self) -> Tokens {
		self.0.clone()
	}
}
