#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relaybot_core::{ConnectorStatus, IntegrationFacade};
use tokio::net::TcpListener;
use tracing::warn;

/// Supplies the `/statusz` snapshot.
#[async_trait::async_trait]
pub trait StatusSource: Send + Sync + 'static {
	async fn snapshot(&self) -> Vec<ConnectorStatus>;
}

#[async_trait::async_trait]
impl StatusSource for IntegrationFacade {
	async fn snapshot(&self) -> Vec<ConnectorStatus> {
		self.status().await
	}
}

#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	status: Arc<dyn StatusSource>,
}

impl HealthState {
	pub fn new(status: Arc<dyn StatusSource>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			status,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub async fn spawn_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let local = listener.local_addr()?;
	tokio::spawn(async move {
		if let Err(err) = run_health_server(listener, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
	Ok(local)
}

async fn run_health_server(listener: TcpListener, state: HealthState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, Bytes::new()));
	}

	match req.uri().path() {
		"/healthz" => Ok(respond(StatusCode::OK, Bytes::from_static(b"ok"))),
		"/readyz" => {
			if state.is_ready() {
				Ok(respond(StatusCode::OK, Bytes::from_static(b"ready")))
			} else {
				Ok(respond(StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")))
			}
		}
		"/statusz" => {
			let snapshot = state.status.snapshot().await;
			match serde_json::to_vec(&snapshot) {
				Ok(body) => {
					let mut resp = respond(StatusCode::OK, body);
					resp.headers_mut()
						.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
					Ok(resp)
				}
				Err(e) => {
					warn!(error = %e, "failed to serialize status snapshot");
					Ok(respond(StatusCode::INTERNAL_SERVER_ERROR, Bytes::new()))
				}
			}
		}
		_ => Ok(respond(StatusCode::NOT_FOUND, Bytes::new())),
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpStream;

	use super::*;

	struct Fixed(Vec<ConnectorStatus>);

	#[async_trait::async_trait]
	impl StatusSource for Fixed {
		async fn snapshot(&self) -> Vec<ConnectorStatus> {
			self.0.clone()
		}
	}

	async fn get(addr: SocketAddr, path: &str) -> String {
		let mut stream = TcpStream::connect(addr).await.unwrap();
		let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
		stream.write_all(req.as_bytes()).await.unwrap();
		let mut out = String::new();
		stream.read_to_string(&mut out).await.unwrap();
		out
	}

	#[tokio::test]
	async fn endpoints_report_liveness_readiness_and_status() {
		let status = ConnectorStatus {
			channel: "streamer".to_string(),
			broadcaster_id: "42".to_string(),
			chat_connected: true,
			event_session_connected: false,
			event_sub_backoff_secs: 120,
			online: true,
			title: "t".to_string(),
			category: "c".to_string(),
			consumers: 2,
		};
		let state = HealthState::new(Arc::new(Fixed(vec![status])));
		let addr = spawn_health_server(SocketAddr::from(([127, 0, 0, 1], 0)), state.clone())
			.await
			.unwrap();

		assert!(get(addr, "/healthz").await.starts_with("HTTP/1.1 200"));
		assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 503"));
		state.mark_ready();
		assert!(get(addr, "/readyz").await.starts_with("HTTP/1.1 200"));

		let body = get(addr, "/statusz").await;
		assert!(body.starts_with("HTTP/1.1 200"));
		assert!(body.contains("application/json"));
		assert!(body.contains(r#""channel":"streamer""#));
		assert!(body.contains(r#""event_sub_backoff_secs":120"#));

		assert!(get(addr, "/nope").await.starts_with("HTTP/1.1 404"));
	}
}
