//! Conduit Manager - Lifecycle management for connector streams.
//!
//! Keeps one live instance per enabled consumer and producer configuration,
//! rebuilds instances when configurations change, and fans consumed
//! messages out to subscriber inboxes under credit-based backpressure.
//!
//! # Architecture
//!
//! ```text
//!  SQLite (configurations)          NATS (control plane)
//!          ↓                               ↑ ↓
//! ┌───────────────────────┐       ┌──────────────────────────┐
//! │ ConfigurationRegistry │       │ LifecycleEventPublisher  │
//! └───────────────────────┘       └──────────────────────────┘
//!          ↓                               ↑
//! ┌──────────────────────────────────────────────────────────┐
//! │ ConnectorOrchestrator                                    │
//! │  - reload / load / update / save / delete / command      │
//! │  - per-id locks, single instance per stream              │
//! └──────────────────────────────────────────────────────────┘
//!          ↓ provide                       ↓ attach
//! ┌───────────────────────┐       ┌──────────────────────────┐
//! │ ProviderLoader        │       │ FanoutMonitor            │
//! │  (protocol plugins)   │       │  - lifecycle state       │
//! └───────────────────────┘       │  - message fan-out       │
//!                                 │  - control actions       │
//!                                 └──────────────────────────┘
//!                                          ↓
//!                                 Redis (credit + overflow per inbox)
//! ```
//!
//! # Writing a provider
//!
//! Implement [`Provider`] to create instances and [`StreamInstance`] for the
//! instances themselves, then register a factory in a [`ProviderCatalog`].
//! See [`connectors::loopback`] for a complete in-process example.

pub mod command;
pub mod connectors;
pub mod error;
pub mod loader;
pub mod monitor;
pub mod orchestrator;
pub mod provider;
pub mod publisher;
pub mod registry;

pub use command::{CommandError, CommandRequest, Reply, SaveRequest};
pub use error::{ManagerError, NoticeCode};
pub use loader::{ProviderCatalog, ProviderLoader};
pub use monitor::{derive_state, FanoutMonitor, PersistRequest, StatusEntry};
pub use orchestrator::ConnectorOrchestrator;
pub use provider::{
    CommandFailure, InstanceEvent, InstanceEvents, Provider, ProviderNotices, StreamInstance,
};
pub use publisher::{EntityInfo, LifecycleEventPublisher, Notice};
pub use registry::ConfigurationRegistry;
