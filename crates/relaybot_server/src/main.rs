#![forbid(unsafe_code)]

mod config;
mod health;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use relaybot_core::{ConsumerRegistration, IntegrationFacade, LivestreamMonitor};
use relaybot_platform::twitch::{ChatConfig, EventSessionConfig, OAuthConfig, TwitchApi, TwitchCredentialBroker, TwitchTransportFactory};
use relaybot_platform::{CredentialBroker, PlatformApi, TokenStore, TransportFactory};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::config::tokens::FileTokenStore;
use crate::health::{HealthState, StatusSource, spawn_health_server};
use crate::sink::LogSink;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: relaybot_server [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.relaybot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,relaybot_server=debug,relaybot_core=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("relaybot_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn oauth_config(cfg: &ServerConfig, client_id: &str) -> OAuthConfig {
	let mut oauth = OAuthConfig::new(client_id);
	oauth.client_secret = cfg.twitch.client_secret.clone();
	if let Some(bind) = cfg.twitch.redirect_bind {
		oauth.redirect_bind = bind;
	}
	if let Some(uri) = cfg.twitch.redirect_uri.clone() {
		oauth.redirect_uri = uri;
	}
	if !cfg.twitch.scopes.is_empty() {
		oauth.scopes = cfg.twitch.scopes.clone();
	}
	oauth
}

fn chat_config(cfg: &ServerConfig, bot_login: &str) -> ChatConfig {
	let mut chat = ChatConfig::new(bot_login);
	chat.irc_ws_url = cfg.twitch.irc_ws_url.clone();
	if let Some(max) = cfg.twitch.max_message_chars {
		chat.max_message_chars = max;
	}
	if let Some(chunk) = cfg.twitch.chunk_chars {
		chat.chunk_chars = chunk;
	}
	if let Some(delay) = cfg.twitch.continuation_delay {
		chat.continuation_delay = delay;
	}
	if let Some(interval) = cfg.twitch.min_send_interval {
		chat.min_send_interval = interval;
	}
	chat
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let client_id = server_cfg
		.twitch
		.client_id
		.clone()
		.ok_or_else(|| anyhow!("twitch.client_id is required"))?;
	let bot_login = server_cfg
		.twitch
		.bot_login
		.clone()
		.ok_or_else(|| anyhow!("twitch.bot_login is required"))?;

	let store = Arc::new(FileTokenStore::new(server_cfg.tokens_path.clone()));
	let tokens = match store.load()? {
		Some(persisted) => {
			info!(path = %store.path().display(), "using persisted twitch tokens");
			persisted
		}
		None => server_cfg.twitch.tokens(),
	};

	let broker: Arc<dyn CredentialBroker> = Arc::new(TwitchCredentialBroker::new(
		oauth_config(&server_cfg, &client_id),
		tokens,
	)?);
	let twitch_api = Arc::new(TwitchApi::new(
		&server_cfg.twitch.helix_base_url,
		client_id,
		Arc::clone(&broker),
		Some(Arc::clone(&store) as Arc<dyn TokenStore>),
	)?);

	let validated = broker
		.ensure_valid(server_cfg.twitch.allow_interactive_auth)
		.await
		.context("twitch credentials")?;
	twitch_api.adopt(&validated);
	if let Some(login) = validated.login.as_deref()
		&& !login.eq_ignore_ascii_case(&bot_login)
	{
		warn!(token_login = %login, %bot_login, "twitch token belongs to a different account than bot_login");
	}
	info!(bot = %bot_login, user_id = ?validated.user_id, "twitch credentials valid");

	let api: Arc<dyn PlatformApi> = twitch_api;
	let session_cfg = EventSessionConfig {
		ws_url: server_cfg.twitch.eventsub_ws_url.clone(),
		..EventSessionConfig::default()
	};
	let factory: Arc<dyn TransportFactory> = Arc::new(
		TwitchTransportFactory::new(
			chat_config(&server_cfg, &bot_login),
			session_cfg,
			Arc::clone(&broker),
			Arc::clone(&api),
		)
		.with_token_store(Arc::clone(&store) as Arc<dyn TokenStore>),
	);
	let facade = Arc::new(IntegrationFacade::new(
		Arc::clone(&api),
		factory,
		server_cfg.connector.clone(),
	));

	let health_state = HealthState::new(Arc::clone(&facade) as Arc<dyn StatusSource>);
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => match spawn_health_server(addr, health_state.clone()).await {
				Ok(local) => info!(addr = %local, "health server listening"),
				Err(e) => warn!(error = %e, %addr, "failed to start health server"),
			},
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	for consumer in &server_cfg.consumers {
		let sink = LogSink::new(
			consumer.id.clone(),
			consumer.channel.clone(),
			consumer.announce_on_start.clone(),
			Arc::downgrade(&facade),
		);
		let registration = ConsumerRegistration {
			consumer_id: consumer.id.clone(),
			channel: consumer.channel.clone(),
			settings: consumer.settings.clone(),
			sink: Arc::new(sink),
		};
		match facade.register_consumer(registration).await {
			Ok(identity) => info!(consumer = %consumer.id, channel = %identity, "consumer attached"),
			Err(e) => warn!(consumer = %consumer.id, channel = %consumer.channel, error = %e, "consumer registration failed"),
		}
	}
	if server_cfg.consumers.is_empty() {
		warn!("no [[consumers]] configured; nothing to connect");
	}

	let monitor = LivestreamMonitor::spawn(Arc::clone(&facade), Arc::clone(&api), server_cfg.monitor.clone());
	health_state.mark_ready();
	info!("relaybot_server: running");

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutdown requested");

	health_state.mark_not_ready();
	monitor.stop().await;
	facade.shutdown().await;
	info!("relaybot_server: stopped");
	Ok(())
}
