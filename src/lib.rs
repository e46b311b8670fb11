//! Phantun Manager - supervisor for phantun tunnel processes
//!
//! Runs the configured phantun client and server binaries as child processes
//! and keeps the host's NAT and forwarding rules in step with them.
//!
//! # Features
//!
//! - Start/stop of every enabled client and server instance
//! - Idempotent iptables/ip6tables rule management, tagged for ownership
//! - Global purge of owned rules on stop, including orphans
//! - Removal of stale `tun*` interfaces before start
//! - Live log fan-out with replay for late subscribers
//! - JSON configuration with environment overrides
//!
//! # Example
//!
//! ```rust,no_run
//! use phantun_manager::{Config, LogHub, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = LogHub::new();
//!     phantun_manager::init_logging(&hub, "info")?;
//!
//!     let config = Config::load("/etc/phantun/config.json")?;
//!     let supervisor = Supervisor::from_system(config.into_shared(), hub);
//!
//!     supervisor.start_all().await?;
//!     tokio::signal::ctrl_c().await?;
//!     supervisor.stop_all().await;
//!
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod firewall;
pub mod hub;
pub mod instance;
pub mod janitor;
pub mod session;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use config::{BinaryPaths, Config, GeneralConfig, SharedConfig};
pub use error::{ManagerError, ManagerResult};
pub use firewall::{FirewallReconciler, FirewallStats};
pub use hub::{HubLayer, LogHub, LogRecord, Stream, Subscription};
pub use instance::{Instance, InstanceKind, InstanceSpec};
pub use janitor::InterfaceJanitor;
pub use session::{LogSession, LogSink, SessionEnd, SseSink};
pub use supervisor::{ProcessStatus, StatusReport, Supervisor};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with tracing.
///
/// Events go to stderr and to `hub` as system records. `RUST_LOG` wins over
/// `level` when set.
pub fn init_logging(hub: &LogHub, level: &str) -> ManagerResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("phantun_manager={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(HubLayer::new(hub.clone()))
        .try_init()
        .map_err(|e| ManagerError::Config(e.to_string()))?;

    Ok(())
}
