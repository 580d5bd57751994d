//! svcreg: client-side service registry cache
//!
//! This crate keeps a local, continuously refreshed view of a remote
//! service registry: it resolves a logical service name plus an optional
//! client-affinity key to a set of live network instances, and selects one
//! instance per request using weighted rotation.
//!
//! # Features
//!
//! - **Dual refresh paths**: a one-second pull-refresh loop and an
//!   asynchronous UDP push channel race to update the same store
//!   (last write wins, single-key atomicity)
//! - **Weighted rotation**: instances repeat `ceil(weight)` times in an
//!   expanded sequence walked by a per-service rotation cursor
//! - **Control-plane failover**: endpoint pool with cooldown refresh and
//!   uniform random selection
//! - **Warm restarts**: every fetched response body is persisted per cache
//!   key and reloaded at construction
//! - **Answer cache**: short-TTL, capacity-bounded cache of computed
//!   protocol answers for the query front end
//!
//! # Architecture
//!
//! ```text
//! Query front end ──> ServiceRegistry::select_instance ──> InstanceSelector
//!                          │  (miss: placeholder + fetch)
//!                          ▼
//!                    Store<ServiceRecord> <── pull-refresh loop (1s)
//!                          ▲
//!                          └────────────────  PushListener (UDP)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use svcreg::clock::SystemClock;
//! use svcreg::config::load_config;
//! use svcreg::fetch::{HttpFetcher, PushPort};
//! use svcreg::registry::ServiceRegistry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/svcreg/config.json")?;
//!
//! // One shared cell: the listener publishes its bound port into it and
//! // every outbound fetch advertises it as the udpPort parameter.
//! let push_port = PushPort::new();
//! let registry = ServiceRegistry::new(
//!     config,
//!     Arc::new(HttpFetcher::new(push_port.clone())),
//!     Arc::new(SystemClock),
//!     push_port,
//! )?;
//! registry.start().await?;
//!
//! let instance = registry.select_instance("my-service", "").await?;
//! println!("{}:{}", instance.ip, instance.port);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`answer_cache`]: short-TTL cache of computed protocol answers
//! - [`clock`]: injectable wall-clock for TTL bookkeeping
//! - [`compress`]: gzip sniffing and decompression for push payloads
//! - [`config`]: configuration types and loading
//! - [`error`]: error types
//! - [`fetch`]: HTTP fetch capability and push-port advertisement
//! - [`net`]: local network identity detection
//! - [`push`]: UDP push listener
//! - [`record`]: service record data model and wire parsing
//! - [`registry`]: the central cache and its refresh loops
//! - [`selector`]: weighted rotating instance selection
//! - [`server_pool`]: control-plane endpoint pool
//! - [`store`]: concurrent key-value substrate

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod answer_cache;
pub mod clock;
pub mod compress;
pub mod config;
pub mod error;
pub mod fetch;
pub mod net;
pub mod push;
pub mod record;
pub mod registry;
pub mod selector;
pub mod server_pool;
pub mod store;

// Re-export commonly used types at the crate root
pub use answer_cache::{AnswerCache, AnswerKey};
pub use clock::{Clock, SystemClock};
pub use config::{load_config, load_config_str, RegistryConfig};
pub use error::{ConfigError, RecordError, RegistryError, RegistryResult};
pub use fetch::{Fetch, HttpFetcher, PushPort};
pub use push::PushListener;
pub use record::{cache_key, parse_record, Instance, ServiceRecord};
pub use registry::ServiceRegistry;
pub use selector::InstanceSelector;
pub use server_pool::ServerPool;
pub use store::Store;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
