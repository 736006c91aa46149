#![forbid(unsafe_code)]

mod listener;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;

use self::listener::RedirectListener;
use crate::{CredentialBroker, PlatformError, SecretString, Tokens, ValidatedTokens};

pub const TOKEN_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const AUTHORIZE_URL: &str = "https://id.twitch.tv/oauth2/authorize";

pub const DEFAULT_SCOPES: &[&str] = &[
	"chat:read",
	"chat:edit",
	"channel:moderate",
	"channel:read:subscriptions",
	"moderator:read:followers",
	"moderator:read:chatters",
	"moderator:manage:announcements",
	"user:manage:whispers",
];

/// OAuth settings for the bot account.
#[derive(Clone, Debug)]
pub struct OAuthConfig {
	pub client_id: String,
	/// Needed for refresh and code exchange.
	pub client_secret: Option<SecretString>,

	pub redirect_bind: SocketAddr,
	pub redirect_uri: String,
	pub scopes: Vec<String>,

	pub validate_url: String,
	pub token_url: String,
	pub authorize_url: String,

	/// Interactive flow: interval between redirect polls.
	pub poll_interval: Duration,
	/// Interactive flow: polls before giving up.
	pub poll_attempts: u32,
	/// Try to open the authorize URL in a browser.
	pub open_browser: bool,
}

impl OAuthConfig {
	pub fn new(client_id: impl Into<String>) -> Self {
		Self {
			client_id: client_id.into(),
			client_secret: None,
			redirect_bind: SocketAddr::from(([127, 0, 0, 1], 17563)),
			redirect_uri: "http://localhost:17563/callback".to_string(),
			scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
			validate_url: TOKEN_VALIDATE_URL.to_string(),
			token_url: TOKEN_URL.to_string(),
			authorize_url: AUTHORIZE_URL.to_string(),
			poll_interval: Duration::from_secs(5),
			poll_attempts: 20,
			open_browser: true,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwitchTokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TwitchTokenResponse {
	pub access_token: String,
	#[serde(default)]
	pub refresh_token: Option<String>,
	#[serde(default)]
	pub expires_in: Option<u64>,
}

pub async fn validate_user_token(
	http: &reqwest::Client,
	validate_url: &str,
	access_token: &str,
) -> anyhow::Result<TwitchTokenValidation> {
	let resp = http
		.get(validate_url)
		.header("Authorization", format!("OAuth {}", access_token))
		.send()
		.await
		.context("twitch validate token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch validate token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch validate token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch validate token parse json")
}

pub async fn refresh_user_token(
	http: &reqwest::Client,
	token_url: &str,
	client_id: &str,
	client_secret: &str,
	refresh_token: &str,
) -> anyhow::Result<TwitchTokenResponse> {
	let resp = http
		.post(token_url)
		.form(&[
			("grant_type", "refresh_token"),
			("client_id", client_id),
			("client_secret", client_secret),
			("refresh_token", refresh_token),
		])
		.send()
		.await
		.context("twitch refresh token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch refresh token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch refresh token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch refresh token parse json")
}

pub async fn exchange_authorization_code(
	http: &reqwest::Client,
	token_url: &str,
	client_id: &str,
	client_secret: &str,
	code: &str,
	redirect_uri: &str,
) -> anyhow::Result<TwitchTokenResponse> {
	let resp = http
		.post(token_url)
		.form(&[
			("grant_type", "authorization_code"),
			("client_id", client_id),
			("client_secret", client_secret),
			("code", code),
			("redirect_uri", redirect_uri),
		])
		.send()
		.await
		.context("twitch code exchange request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch code exchange read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch code exchange failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch code exchange parse json")
}

/// Random CSRF `state` for the authorize request.
pub fn random_state() -> String {
	rand::rng().sample_iter(Alphanumeric).take(32).map(char::from).collect()
}

pub fn authorize_url(cfg: &OAuthConfig, state: &str) -> anyhow::Result<Url> {
	let mut url = Url::parse(&cfg.authorize_url).context("parse authorize url")?;
	url.query_pairs_mut()
		.append_pair("response_type", "code")
		.append_pair("client_id", &cfg.client_id)
		.append_pair("redirect_uri", &cfg.redirect_uri)
		.append_pair("scope", &cfg.scopes.join(" "))
		.append_pair("state", state);
	Ok(url)
}

/// Twitch OAuth broker: validate, refresh, then optionally the interactive flow.
pub struct TwitchCredentialBroker {
	cfg: OAuthConfig,
	http: reqwest::Client,
	tokens: RwLock<Tokens>,
	/// Serializes `ensure_valid` so concurrent callers do not refresh twice.
	gate: Mutex<()>,
}

impl TwitchCredentialBroker {
	pub fn new(cfg: OAuthConfig, tokens: Tokens) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("relaybot/0.x (oauth)")
			.timeout(Duration::from_secs(15))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			cfg,
			http,
			tokens: RwLock::new(tokens),
			gate: Mutex::new(()),
		})
	}

	async fn validate(&self, tokens: &Tokens) -> Option<TwitchTokenValidation> {
		let access = tokens.access_token.as_ref()?;
		match validate_user_token(&self.http, &self.cfg.validate_url, access.expose()).await {
			Ok(v) => Some(v),
			Err(e) => {
				warn!(error = %e, "twitch access token failed validation");
				None
			}
		}
	}

	async fn try_refresh(&self, cached: &Tokens) -> Option<Tokens> {
		let refresh = cached.refresh_token.as_ref()?;
		let Some(secret) = self.cfg.client_secret.as_ref() else {
			warn!("twitch refresh token present but no client_secret configured; skipping refresh");
			return None;
		};

		match refresh_user_token(
			&self.http,
			&self.cfg.token_url,
			&self.cfg.client_id,
			secret.expose(),
			refresh.expose(),
		)
		.await
		{
			Ok(resp) => {
				info!(expires_in = ?resp.expires_in, "twitch access token refreshed");
				let refresh_token = resp.refresh_token.map(SecretString::new).or_else(|| cached.refresh_token.clone());
				Some(Tokens::new(Some(SecretString::new(resp.access_token)), refresh_token))
			}
			Err(e) => {
				warn!(error = %e, "twitch token refresh failed");
				None
			}
		}
	}

	async fn run_interactive(&self) -> Result<Tokens, PlatformError> {
		let Some(secret) = self.cfg.client_secret.as_ref() else {
			return Err(PlatformError::Fatal(
				"interactive auth requires a client_secret for the code exchange".to_string(),
			));
		};

		let state = random_state();
		let url = authorize_url(&self.cfg, &state).map_err(|e| PlatformError::Fatal(format!("{e:#}")))?;
		let listener = RedirectListener::bind(self.cfg.redirect_bind).await?;

		info!(url = %url, bind = %listener.local_addr(), "authorize the bot account in a browser");
		if self.cfg.open_browser
			&& let Err(e) = open::that(url.as_str())
		{
			warn!(error = %e, "failed to open browser; open the URL manually");
		}

		let redirect = listener.wait(self.cfg.poll_interval, self.cfg.poll_attempts).await?;

		if redirect.state.as_deref() != Some(state.as_str()) {
			return Err(PlatformError::Fatal("oauth redirect state mismatch".to_string()));
		}
		if let Some(err) = redirect.error {
			return Err(PlatformError::Fatal(format!("oauth authorization denied: {err}")));
		}
		let Some(code) = redirect.code else {
			return Err(PlatformError::Fatal("oauth redirect carried no code".to_string()));
		};

		let resp = exchange_authorization_code(
			&self.http,
			&self.cfg.token_url,
			&self.cfg.client_id,
			secret.expose(),
			&code,
			&self.cfg.redirect_uri,
		)
		.await
		.map_err(|e| PlatformError::Fatal(format!("{e:#}")))?;

		info!("twitch interactive authorization completed");
		Ok(Tokens::new(
			Some(SecretString::new(resp.access_token)),
			resp.refresh_token.map(SecretString::new),
		))
	}

	async fn adopt(&self, previous: &Tokens, tokens: Tokens) -> ValidatedTokens {
		let validation = self.validate(&tokens).await;
		let changed = &tokens != previous;
		*self.tokens.write() = tokens.clone();
		ValidatedTokens {
			tokens,
			changed,
			user_id: validation.as_ref().map(|v| v.user_id.clone()),
			login: validation.map(|v| v.login),
		}
	}
}

#[async_trait::async_trait]
impl CredentialBroker for TwitchCredentialBroker {
	async fn ensure_valid(&self, allow_interactive: bool) -> Result<ValidatedTokens, PlatformError> {
		let _gate = self.gate.lock().await;
		let cached = self.tokens.read().clone();

		if let Some(v) = self.validate(&cached).await {
			return Ok(ValidatedTokens {
				tokens: cached,
				changed: false,
				user_id: Some(v.user_id),
				login: Some(v.login),
			});
		}

		if let Some(refreshed) = self.try_refresh(&cached).await {
			return Ok(self.adopt(&cached, refreshed).await);
		}

		if !allow_interactive {
			return Err(PlatformError::Auth(
				"no valid twitch token and interactive authorization is disabled".to_string(),
			));
		}

		let tokens = self.run_interactive().await?;
		Ok(self.adopt(&cached, tokens).await)
	}

	fn current(&self) -> Tokens {
		self.tokens.read().clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn state_is_random_alphanumeric() {
		let a = random_state();
		let b = random_state();
		assert_eq!(a.len(), 32);
		assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
		assert_ne!(a, b);
	}

	#[test]
	fn authorize_url_carries_state_and_scopes() {
		let mut cfg = OAuthConfig::new("cid");
		cfg.scopes = vec!["chat:read".to_string(), "chat:edit".to_string()];
		let url = authorize_url(&cfg, "s123").unwrap();
		let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
		assert_eq!(pairs.get("client_id").map(String::as_str), Some("cid"));
		assert_eq!(pairs.get("state").map(String::as_str), Some("s123"));
		assert_eq!(pairs.get("scope").map(String::as_str), Some("chat:read chat:edit"));
		assert_eq!(pairs.get("response_type").map(String::as_str), Some("code"));
	}

	#[tokio::test]
	async fn without_tokens_or_interaction_is_auth_failure() {
		let mut cfg = OAuthConfig::new("cid");
		cfg.validate_url = "http://127.0.0.1:9/validate".to_string();
		let broker = TwitchCredentialBroker::new(cfg, Tokens::default()).unwrap();
		let err = broker.ensure_valid(false).await.unwrap_err();
		assert!(err.is_auth());
	}

	#[tokio::test]
	async fn interactive_without_secret_is_fatal() {
		let broker = TwitchCredentialBroker::new(OAuthConfig::new("cid"), Tokens::default()).unwrap();
		let err = broker.ensure_valid(true).await.unwrap_err();
		assert!(err.is_fatal());
	}
}
