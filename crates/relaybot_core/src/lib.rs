#![forbid(unsafe_code)]

//! Channel connectors, consumer bookkeeping and the facade that ties them
//! to a platform.

pub mod config;
pub mod connector;
pub mod consumers;
pub(crate) mod dispatch;
pub mod facade;
pub mod hooks;
pub mod monitor;
pub mod stream_state;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::{ChannelSettings, ConnectorConfig, MonitorConfig, SupervisorConfig};
pub use connector::{Connector, ConnectorStatus};
pub use consumers::{ActiveChatter, ChatOutcome, ConsumerEntity, ConsumerRegistry};
pub use facade::{ConsumerRegistration, FacadeError, IntegrationFacade};
pub use hooks::{CallbackSink, CommandInvocation, HookHandler, HookTable, RewardGrant, RewardTick};
pub use monitor::{LivestreamMonitor, MonitorReport, reconcile_once};
pub use stream_state::{StreamState, StreamStateMachine};
pub use supervisor::{ConnectionHealth, SupervisorPolicy};
