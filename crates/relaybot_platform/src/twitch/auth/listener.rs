#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::PlatformError;

/// Query parameters of the OAuth redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct RedirectParams {
	pub(crate) code: Option<String>,
	pub(crate) state: Option<String>,
	pub(crate) error: Option<String>,
}

impl RedirectParams {
	fn is_complete(&self) -> bool {
		self.code.is_some() || self.error.is_some()
	}
}

pub(crate) fn parse_redirect_query(query: &str) -> RedirectParams {
	let mut out = RedirectParams::default();
	for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
		match k.as_ref() {
			"code" => out.code = Some(v.into_owned()),
			"state" => out.state = Some(v.into_owned()),
			"error" => out.error = Some(v.into_owned()),
			"error_description" if out.error.is_some() => {
				out.error = out.error.take().map(|e| format!("{e}: {v}"));
			}
			_ => {}
		}
	}
	out
}

type Captured = Arc<Mutex<Option<RedirectParams>>>;

/// Local HTTP listener that captures a single OAuth redirect.
pub(crate) struct RedirectListener {
	local_addr: SocketAddr,
	captured: Captured,
	shutdown: CancellationToken,
	task: Option<JoinHandle<()>>,
}

impl RedirectListener {
	pub(crate) async fn bind(addr: SocketAddr) -> Result<Self, PlatformError> {
		let listener = TcpListener::bind(addr)
			.await
			.map_err(|e| PlatformError::Fatal(format!("bind oauth redirect listener on {addr}: {e}")))?;
		let local_addr = listener
			.local_addr()
			.map_err(|e| PlatformError::Fatal(format!("oauth redirect listener address: {e}")))?;

		let captured: Captured = Arc::new(Mutex::new(None));
		let shutdown = CancellationToken::new();
		let task = tokio::spawn(serve(listener, Arc::clone(&captured), shutdown.clone()));

		Ok(Self {
			local_addr,
			captured,
			shutdown,
			task: Some(task),
		})
	}

	pub(crate) fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	/// Poll for the captured redirect every `poll_interval`, at most `attempts` times.
	pub(crate) async fn wait(mut self, poll_interval: Duration, attempts: u32) -> Result<RedirectParams, PlatformError> {
		for attempt in 1..=attempts {
			tokio::time::sleep(poll_interval).await;
			let captured = self.captured.lock().take();
			if let Some(params) = captured {
				debug!(attempt, "oauth redirect captured");
				self.close().await;
				return Ok(params);
			}
			debug!(attempt, attempts, "waiting for oauth redirect");
		}

		self.close().await;
		Err(PlatformError::Fatal(format!(
			"no oauth redirect after {attempts} polls of {}ms",
			poll_interval.as_millis()
		)))
	}

	async fn close(&mut self) {
		self.shutdown.cancel();
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}
}

impl Drop for RedirectListener {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn serve(listener: TcpListener, captured: Captured, shutdown: CancellationToken) {
	loop {
		let (stream, _addr) = tokio::select! {
			_ = shutdown.cancelled() => break,
			accepted = listener.accept() => match accepted {
				Ok(v) => v,
				Err(e) => {
					warn!(error = %e, "oauth redirect accept failed");
					continue;
				}
			},
		};

		let io = TokioIo::new(stream);
		let captured = Arc::clone(&captured);
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_redirect(req, Arc::clone(&captured)));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "oauth redirect connection error");
			}
		});
	}
}

async fn handle_redirect(req: Request<Incoming>, captured: Captured) -> Result<Response<Full<Bytes>>, hyper::Error> {
	if req.method() != Method::GET {
		return Ok(reply(StatusCode::METHOD_NOT_ALLOWED, ""));
	}

	let params = parse_redirect_query(req.uri().query().unwrap_or_default());
	if !params.is_complete() {
		return Ok(reply(StatusCode::NOT_FOUND, ""));
	}

	let mut slot = captured.lock();
	if slot.is_none() {
		*slot = Some(params);
	}
	Ok(reply(StatusCode::OK, "Authorization received. You can close this window."))
}

fn reply(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	resp
}
