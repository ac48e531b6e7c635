//! Ephemeral host pools for integration tests.
//!
//! A [`HostPool`] provisions one VM per [`HostSpec`] through the infra API,
//! bootstraps the service under test on each host over a remote command
//! channel and tears everything down afterwards.
//!
//! ## Architecture
//!
//! - **Pool**: namespace ownership, provisioning fan-out, tiered bootstrap,
//!   cancellation-first teardown
//! - **Host**: per-host state machine and the sentinel-file bootstrap job
//! - **Certs**: one CA and a leaf per bootstrapped host
//! - **Status**: service health and pool summaries for test logs
//!
//! ```no_run
//! # async fn run() -> hostpool_harness::Result<()> {
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use hostpool_harness::{HarnessConfig, HostPool, Topology};
//! use hostpool_infra::RestInfraClient;
//! use hostpool_remote::OpenSshConnector;
//!
//! let config = HarnessConfig::default();
//! let infra = Arc::new(RestInfraClient::new(&config.infra)?);
//! let connector = Arc::new(OpenSshConnector::new(Duration::from_secs(10))?);
//!
//! let mut pool = HostPool::new("nightly", &Topology::ThreeNode, &config, infra, connector)?;
//! pool.start().await?;
//! // ... run tests against pool.hosts() ...
//! pool.destroy(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod certs;
pub mod config;
pub mod error;
pub mod host;
pub mod ids;
pub mod logging;
pub mod pool;
pub mod role;
pub mod status;

pub use config::{HarnessConfig, KeepPolicy, PollSettings};
pub use error::{HarnessError, Result};
pub use host::{Host, HostAddresses, HostState};
pub use ids::PoolId;
pub use pool::{HostPool, PoolState, TeardownReport};
pub use role::{HostSpec, OsFamily, Role, Topology};
pub use status::{pool_summary, wait_for_service, PoolSummary};
