#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use relaybot_domain::{ChannelIdentity, ChannelLogin, ConsumerId};
use relaybot_platform::{ChatTarget, PlatformApi, PlatformError, TransportFactory};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{ChannelSettings, ConnectorConfig};
use crate::connector::{Connector, ConnectorStatus};
use crate::consumers::ConsumerEntity;
use crate::hooks::CallbackSink;

#[derive(Debug, Error)]
pub enum FacadeError {
	#[error("unknown channel: {0}")]
	UnknownChannel(ChannelLogin),

	#[error("consumer already registered: {0}")]
	DuplicateConsumer(ConsumerId),

	#[error("no connector for channel: {0}")]
	NotConnected(ChannelLogin),

	#[error("facade is shut down")]
	ShutDown,

	#[error(transparent)]
	Platform(#[from] PlatformError),
}

/// A hosted community asking for events from one channel.
pub struct ConsumerRegistration {
	pub consumer_id: ConsumerId,
	pub channel: ChannelLogin,
	pub settings: ChannelSettings,
	pub sink: Arc<dyn CallbackSink>,
}

#[derive(Default)]
struct FacadeState {
	connectors: BTreeMap<ChannelLogin, Arc<Connector>>,
	by_consumer: HashMap<ConsumerId, ChannelLogin>,
	shut_down: bool,
}

/// Entry point for consumers: owns one connector per channel and creates or
/// tears it down as consumers come and go.
pub struct IntegrationFacade {
	api: Arc<dyn PlatformApi>,
	factory: Arc<dyn TransportFactory>,
	cfg: ConnectorConfig,
	state: Mutex<FacadeState>,
}

impl IntegrationFacade {
	pub fn new(api: Arc<dyn PlatformApi>, factory: Arc<dyn TransportFactory>, cfg: ConnectorConfig) -> Self {
		Self {
			api,
			factory,
			cfg,
			state: Mutex::new(FacadeState::default()),
		}
	}

	/// Attach a consumer, creating and starting the channel's connector on
	/// first use. Returns the channel identity the consumer is bound to.
	pub async fn register_consumer(&self, reg: ConsumerRegistration) -> Result<ChannelIdentity, FacadeError> {
		let mut state = self.state.lock().await;
		if state.shut_down {
			return Err(FacadeError::ShutDown);
		}
		if state.by_consumer.contains_key(&reg.consumer_id) {
			return Err(FacadeError::DuplicateConsumer(reg.consumer_id));
		}

		let connector = match state.connectors.get(&reg.channel) {
			Some(existing) => Arc::clone(existing),
			None => {
				let identity = self.resolve(&reg.channel).await?;
				let connector = Arc::new(Connector::new(
					identity,
					self.cfg.clone(),
					reg.settings.force_reconnect_after,
					self.factory.as_ref(),
					Arc::clone(&self.api),
				));
				state.connectors.insert(reg.channel.clone(), Arc::clone(&connector));
				metrics::gauge!("relaybot_connectors").set(state.connectors.len() as f64);
				info!(channel = %connector.identity(), "connector created");
				connector
			}
		};

		let identity = connector.identity().clone();
		let entity = ConsumerEntity::new(reg.consumer_id.clone(), identity.clone(), reg.settings, reg.sink);
		if !connector.add_consumer(Arc::new(entity)) {
			return Err(FacadeError::DuplicateConsumer(reg.consumer_id));
		}
		state.by_consumer.insert(reg.consumer_id.clone(), reg.channel);
		connector.start();

		info!(consumer = %reg.consumer_id, channel = %identity, "consumer registered");
		Ok(identity)
	}

	/// Detach a consumer; the last one out stops the connector.
	/// Returns `false` when the id was not registered.
	pub async fn unregister_consumer(&self, consumer_id: &ConsumerId) -> bool {
		let orphaned = {
			let mut state = self.state.lock().await;
			let Some(channel) = state.by_consumer.remove(consumer_id) else {
				return false;
			};
			let Some(connector) = state.connectors.get(&channel).cloned() else {
				return true;
			};
			connector.remove_consumer(consumer_id);
			info!(consumer = %consumer_id, channel = %channel, "consumer unregistered");

			if connector.consumer_count() > 0 {
				None
			} else {
				state.connectors.remove(&channel);
				metrics::gauge!("relaybot_connectors").set(state.connectors.len() as f64);
				Some(connector)
			}
		};

		if let Some(connector) = orphaned {
			connector.stop().await;
			info!(channel = %connector.identity(), "last consumer left; connector stopped");
		}
		true
	}

	pub async fn connector(&self, channel: &ChannelLogin) -> Option<Arc<Connector>> {
		self.state.lock().await.connectors.get(channel).cloned()
	}

	pub async fn connectors(&self) -> Vec<Arc<Connector>> {
		self.state.lock().await.connectors.values().cloned().collect()
	}

	pub async fn status(&self) -> Vec<ConnectorStatus> {
		self.connectors().await.iter().map(|c| c.status()).collect()
	}

	pub async fn is_shut_down(&self) -> bool {
		self.state.lock().await.shut_down
	}

	pub async fn send_chat(&self, channel: &ChannelLogin, target: ChatTarget, text: &str) -> Result<(), FacadeError> {
		let connector = self
			.connector(channel)
			.await
			.ok_or_else(|| FacadeError::NotConnected(channel.clone()))?;
		connector.send_chat(target, text).await?;
		Ok(())
	}

	pub async fn announce(&self, channel: &ChannelLogin, text: &str) -> Result<(), FacadeError> {
		let connector = self
			.connector(channel)
			.await
			.ok_or_else(|| FacadeError::NotConnected(channel.clone()))?;
		connector.announce(text).await?;
		Ok(())
	}

	/// Stop every connector; later registrations fail with `ShutDown`.
	pub async fn shutdown(&self) {
		let connectors = {
			let mut state = self.state.lock().await;
			state.shut_down = true;
			state.by_consumer.clear();
			std::mem::take(&mut state.connectors)
		};
		metrics::gauge!("relaybot_connectors").set(0.0);

		for (channel, connector) in connectors {
			connector.stop().await;
			info!(%channel, "connector stopped on shutdown");
		}
	}

	async fn resolve(&self, channel: &ChannelLogin) -> Result<ChannelIdentity, FacadeError> {
		let users = self.api.users_by_login(&[channel.to_string()]).await?;
		let Some(user) = users.into_iter().find(|u| channel.matches(&u.login)) else {
			warn!(%channel, "channel login did not resolve");
			return Err(FacadeError::UnknownChannel(channel.clone()));
		};
		Ok(ChannelIdentity::new(channel.clone(), user.id))
	}
}
