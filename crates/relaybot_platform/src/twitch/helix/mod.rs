#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{PlatformError, PlatformUser, StreamInfo, SubscriptionTopic};

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

const EVENTSUB_SUBSCRIPTIONS_PATH: &str = "/helix/eventsub/subscriptions";
const USERS_PATH: &str = "/helix/users";
const STREAMS_PATH: &str = "/helix/streams";
const CHATTERS_PATH: &str = "/helix/chat/chatters";
const ANNOUNCEMENTS_PATH: &str = "/helix/chat/announcements";
const WHISPERS_PATH: &str = "/helix/whispers";

/// Helix accepts at most this many `login`/`user_login` query params per call.
pub(crate) const HELIX_BATCH_LIMIT: usize = 100;

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> Result<reqwest::Response, PlatformError> {
	let retry_builder = req.try_clone();
	let resp = req
		.send()
		.await
		.map_err(|e| PlatformError::Transport(format!("helix {label} send: {e}")))?;
	let status = resp.status();

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		return retry
			.send()
			.await
			.map_err(|e| PlatformError::Transport(format!("helix {label} retry send: {e}")));
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry
			.send()
			.await
			.map_err(|e| PlatformError::Transport(format!("helix {label} retry send: {e}")));
	}

	Ok(resp)
}

/// Map a non-success status to the error taxonomy.
pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap, label: &str, body: &str) -> PlatformError {
	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
			PlatformError::Auth(format!("helix {label} auth failed (status={status}) body={body}"))
		}
		StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
			retry_after: retry_delay_from_headers(headers),
		},
		s if s.is_server_error() => PlatformError::Transport(format!("helix {label} failed: status={status} body={body}")),
		_ => PlatformError::Other(anyhow::anyhow!("helix {label} failed: status={status} body={body}")),
	}
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response, label: &'static str) -> Result<T, PlatformError> {
	let status = resp.status();
	let headers = resp.headers().clone();
	let body = resp
		.text()
		.await
		.map_err(|e| PlatformError::Transport(format!("helix {label} read body: {e}")))?;

	if !status.is_success() {
		return Err(status_error(status, &headers, label, &body));
	}

	Ok(serde_json::from_str(&body).with_context(|| format!("helix {label} parse json"))?)
}

async fn expect_success(resp: reqwest::Response, label: &'static str) -> Result<(), PlatformError> {
	let status = resp.status();
	if status.is_success() {
		return Ok(());
	}
	let headers = resp.headers().clone();
	let body = resp.text().await.unwrap_or_default();
	Err(status_error(status, &headers, label, &body))
}

/// Build `?key=a&key=b` for batched lookups.
pub(crate) fn repeated_query(key: &str, values: &[String]) -> String {
	values
		.iter()
		.map(|v| format!("{key}={}", urlencoding::encode(v.trim())))
		.collect::<Vec<_>>()
		.join("&")
}

#[derive(Clone, Debug)]
pub(crate) struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: String,
}

#[derive(Debug, Serialize)]
struct HelixCreateSubscriptionRequest<'a> {
	#[serde(rename = "type")]
	r#type: &'a str,
	version: &'a str,
	condition: &'a std::collections::BTreeMap<String, String>,
	transport: HelixWebsocketTransport<'a>,
}

#[derive(Debug, Serialize)]
struct HelixWebsocketTransport<'a> {
	method: &'a str,
	session_id: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixAnnouncement<'a> {
	message: &'a str,
}

#[derive(Debug, Serialize)]
struct HelixWhisper<'a> {
	message: &'a str,
}

impl HelixClient {
	pub(crate) fn new(http: reqwest::Client, base_url: Url, client_id: String, bearer_token: String) -> Self {
		Self {
			http,
			base_url,
			client_id,
			bearer_token,
		}
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token))
	}

	fn url(&self, path_and_query: &str) -> Result<Url, PlatformError> {
		Ok(self.base_url.join(path_and_query).context("join helix url")?)
	}

	pub(crate) async fn get_users_by_login(&self, logins: &[String]) -> Result<Vec<PlatformUser>, PlatformError> {
		let mut out = Vec::with_capacity(logins.len());
		for chunk in logins.chunks(HELIX_BATCH_LIMIT) {
			let url = self.url(&format!("{USERS_PATH}?{}", repeated_query("login", chunk)))?;
			let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/users").await?;
			let parsed: HelixPage<HelixUser> = read_json(resp, "GET /helix/users").await?;
			out.extend(parsed.data.into_iter().map(PlatformUser::from));
		}
		Ok(out)
	}

	pub(crate) async fn get_streams_by_login(&self, logins: &[String]) -> Result<Vec<StreamInfo>, PlatformError> {
		let mut out = Vec::new();
		for chunk in logins.chunks(HELIX_BATCH_LIMIT) {
			let url = self.url(&format!(
				"{STREAMS_PATH}?type=live&first={HELIX_BATCH_LIMIT}&{}",
				repeated_query("user_login", chunk)
			))?;
			let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/streams").await?;
			let parsed: HelixPage<HelixStream> = read_json(resp, "GET /helix/streams").await?;
			out.extend(parsed.data.into_iter().map(HelixStream::into_stream_info));
		}
		Ok(out)
	}

	pub(crate) async fn get_chatters(
		&self,
		broadcaster_id: &str,
		moderator_id: &str,
	) -> Result<Vec<PlatformUser>, PlatformError> {
		let mut out = Vec::new();
		let mut after: Option<String> = None;

		loop {
			let mut path = format!(
				"{CHATTERS_PATH}?broadcaster_id={b}&moderator_id={m}&first=1000",
				b = urlencoding::encode(broadcaster_id),
				m = urlencoding::encode(moderator_id),
			);
			if let Some(after) = after.as_deref() {
				path.push_str("&after=");
				path.push_str(&urlencoding::encode(after));
			}

			let url = self.url(&path)?;
			let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/chat/chatters").await?;
			let page: HelixPage<HelixChatter> = read_json(resp, "GET /helix/chat/chatters").await?;

			out.extend(page.data.into_iter().map(|c| PlatformUser {
				id: c.user_id,
				login: c.user_login,
				display_name: Some(c.user_name),
			}));

			let next = page.pagination.and_then(|p| p.cursor).filter(|c| !c.is_empty());
			if next.is_none() {
				break;
			}
			after = next;
		}

		Ok(out)
	}

	pub(crate) async fn create_eventsub_subscription(
		&self,
		topic: &SubscriptionTopic,
		session_id: &str,
	) -> Result<CreateSubscriptionOutcome, PlatformError> {
		let url = self.url(EVENTSUB_SUBSCRIPTIONS_PATH)?;
		let req = HelixCreateSubscriptionRequest {
			r#type: &topic.name,
			version: &topic.version,
			condition: &topic.condition,
			transport: HelixWebsocketTransport {
				method: "websocket",
				session_id,
			},
		};

		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&req),
			"POST /helix/eventsub/subscriptions",
		)
		.await?;

		if resp.status() == StatusCode::CONFLICT {
			return Ok(CreateSubscriptionOutcome::AlreadyExists);
		}

		let parsed: HelixPage<HelixSubscriptionData> = read_json(resp, "POST /helix/eventsub/subscriptions").await?;
		let id = parsed.data.into_iter().next().map(|d| d.id).unwrap_or_default();
		Ok(CreateSubscriptionOutcome::Created { id })
	}

	pub(crate) async fn send_chat_announcement(
		&self,
		broadcaster_id: &str,
		moderator_id: &str,
		message: &str,
	) -> Result<(), PlatformError> {
		let url = self.url(&format!(
			"{ANNOUNCEMENTS_PATH}?broadcaster_id={b}&moderator_id={m}",
			b = urlencoding::encode(broadcaster_id),
			m = urlencoding::encode(moderator_id),
		))?;
		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&HelixAnnouncement { message }),
			"POST /helix/chat/announcements",
		)
		.await?;
		expect_success(resp, "POST /helix/chat/announcements").await
	}

	pub(crate) async fn send_whisper(&self, from_user_id: &str, to_user_id: &str, message: &str) -> Result<(), PlatformError> {
		let url = self.url(&format!(
			"{WHISPERS_PATH}?from_user_id={f}&to_user_id={t}",
			f = urlencoding::encode(from_user_id),
			t = urlencoding::encode(to_user_id),
		))?;
		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&HelixWhisper { message }),
			"POST /helix/whispers",
		)
		.await?;
		expect_success(resp, "POST /helix/whispers").await
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CreateSubscriptionOutcome {
	Created { id: String },
	AlreadyExists,
}

#[derive(Debug, Deserialize)]
struct HelixPage<T> {
	data: Vec<T>,
	#[serde(default)]
	pagination: Option<HelixPagination>,
}

#[derive(Debug, Deserialize)]
struct HelixPagination {
	#[serde(default)]
	cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelixUser {
	id: String,
	login: String,
	#[serde(default)]
	display_name: Option<String>,
}

impl From<HelixUser> for PlatformUser {
	fn from(u: HelixUser) -> Self {
		Self {
			id: u.id,
			login: u.login,
			display_name: u.display_name,
		}
	}
}

#[derive(Debug, Deserialize)]
struct HelixStream {
	user_id: String,
	user_login: String,
	#[serde(default)]
	game_name: String,
	#[serde(default)]
	title: String,
	#[serde(default)]
	viewer_count: u64,
	started_at: String,
}

impl HelixStream {
	fn into_stream_info(self) -> StreamInfo {
		let started_at = chrono::DateTime::parse_from_rfc3339(&self.started_at)
			.map(SystemTime::from)
			.unwrap_or_else(|_| SystemTime::now());
		StreamInfo {
			user_id: self.user_id,
			user_login: self.user_login,
			title: self.title,
			category: self.game_name,
			started_at,
			viewer_count: self.viewer_count,
		}
	}
}

#[derive(Debug, Deserialize)]
struct HelixChatter {
	user_id: String,
	user_login: String,
	user_name: String,
}

#[derive(Debug, Deserialize)]
struct HelixSubscriptionData {
	id: String,
}
