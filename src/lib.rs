//! gridpool: an endpoint pool orchestrator for on-demand Selenium
//! sessions.
//!
//! gridpool provisions, tracks, and reclaims ephemeral endpoints (Docker
//! containers, KVM clones, Openstack instances) backing WebDriver test
//! sessions, and routes session traffic into the allocated endpoint.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Platform catalog**: Discovers platforms from configured backends
//! - **Endpoint pool**: Capacity-bounded allocation with warm preloading
//! - **Session proxy**: Session-id substitution and bounded-retry
//!   forwarding
//! - **Artifact collector**: Drains logs and screencasts before endpoint
//!   teardown
//!
//! # Example
//!
//! ```no_run
//! use gridpool::app::App;
//! use gridpool::config::load_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("gridpool.toml"))?;
//!     let app = App::start(config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     app.stop().await;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod artifacts;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod matcher;
pub mod platform;
pub mod pool;
pub mod proxy;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export commonly used types
pub use app::App;
pub use config::{load_config, Config};
pub use endpoint::{Backend, Endpoint, EndpointFactory};
pub use platform::{PlatformCatalog, PlatformSource};
pub use pool::EndpointPool;
pub use session::{Session, SessionStatus};
