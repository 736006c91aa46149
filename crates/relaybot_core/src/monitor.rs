#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::SystemTime;

use relaybot_platform::{PlatformApi, PlatformError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::facade::IntegrationFacade;

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorReport {
	pub checked: usize,
	pub live: usize,
}

/// Periodic safety net for missed online/offline notifications.
pub struct LivestreamMonitor {
	cancel: CancellationToken,
	handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LivestreamMonitor {
	pub fn spawn(facade: Arc<IntegrationFacade>, api: Arc<dyn PlatformApi>, cfg: MonitorConfig) -> Self {
		let cancel = CancellationToken::new();
		let token = cancel.clone();

		let handle = tokio::spawn(async move {
			let mut ticker = interval_at(Instant::now() + cfg.interval, cfg.interval);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				tokio::select! {
					_ = token.cancelled() => break,
					_ = ticker.tick() => {
						match reconcile_once(&facade, api.as_ref(), cfg.batch_size).await {
							Ok(report) => debug!(checked = report.checked, live = report.live, "monitor pass complete"),
							Err(e) => {
								metrics::counter!("relaybot_monitor_failures_total").increment(1);
								warn!(error = %e, "monitor pass failed; no transitions applied");
							}
						}
					}
				}
			}
		});

		Self {
			cancel,
			handle: parking_lot::Mutex::new(Some(handle)),
		}
	}

	pub async fn stop(&self) {
		self.cancel.cancel();
		let handle = self.handle.lock().take();
		if let Some(handle) = handle {
			let _ = handle.await;
		}
	}
}

impl Drop for LivestreamMonitor {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

/// Compare every connector's cached state with the platform's live streams.
///
/// All batches are fetched before any transition is applied, so a failed
/// lookup never marks a channel offline.
pub async fn reconcile_once(
	facade: &IntegrationFacade,
	api: &dyn PlatformApi,
	batch_size: usize,
) -> Result<MonitorReport, PlatformError> {
	let connectors = facade.connectors().await;
	if connectors.is_empty() {
		return Ok(MonitorReport::default());
	}

	let logins: Vec<String> = connectors.iter().map(|c| c.identity().login.to_string()).collect();
	let mut streams = Vec::new();
	for batch in logins.chunks(batch_size.max(1)) {
		streams.extend(api.streams_by_login(batch).await?);
	}

	let observed_at = SystemTime::now();
	let mut report = MonitorReport {
		checked: connectors.len(),
		live: 0,
	};
	for connector in &connectors {
		let login = &connector.identity().login;
		match streams.iter().find(|s| login.matches(&s.user_login)) {
			Some(info) => {
				report.live += 1;
				connector.observe_live(info).await;
			}
			None => connector.observe_offline(observed_at).await,
		}
	}
	Ok(report)
}
