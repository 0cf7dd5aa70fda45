//! # hardfetch
//!
//! A resilient outbound-fetching layer for sites that actively resist
//! automated access. Given a URL, the fetcher walks an escalation
//! ladder of acquisition strategies (plain HTTP, DOM-parsing HTTP,
//! embedded-JavaScript execution, headless browser) until one succeeds,
//! rotating browser identities and pooled proxies underneath and
//! recovering from rate limits, proxy failures, and transient network
//! errors along the way.
//!
//! ## Features
//!
//! - Multi-strategy fetch orchestration, cheapest technique first
//! - Weighted identity rotation with coherent header bundles
//! - Self-healing proxy pool: health probes, cooldowns, weighted draws
//! - Exponential backoff with configurable jitter per failure class
//! - Per-domain circuit breaking
//! - Tabular-content extraction, link discovery, challenge-page detection
//! - Statistics and event hooks over every step of a fetch
//!
//! ## Example
//!
//! ```no_run
//! use hardfetch::Fetcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fetcher = Fetcher::new()?;
//!     let result = fetcher.fetch("https://example.com/standings").await?;
//!     if result.success {
//!         let payload = result.payload.unwrap();
//!         println!("{} tables via {:?}", payload.tables.len(), result.strategy);
//!     } else {
//!         eprintln!("exhausted: {}", result.error.unwrap_or_default());
//!     }
//!     Ok(())
//! }
//! ```

mod fetcher;

pub mod config;
pub mod detect;
pub mod external_deps;
pub mod extract;
pub mod modules;
pub mod strategies;

pub use crate::fetcher::{
    FetchError,
    FetchMeta,
    FetchOptions,
    FetchPayload,
    FetchResult,
    Fetcher,
    FetcherBuilder,
};

pub use crate::config::{
    BackoffConfig,
    BreakerConfig,
    ConfigError,
    FetcherConfig,
    JitterMode,
    PoolConfig,
    RotationMode,
};

pub use crate::strategies::{
    FetchStrategy,
    StrategyKind,
    StrategyRequest,
    StrategyResponse,
};

pub use crate::modules::{
    BreakerState,
    DeviceClass,
    EventDispatcher,
    EventHandler,
    FailureKind,
    FetchEvent,
    FetchFailure,
    IdentityProfile,
    IdentityRotator,
    LoggingHandler,
    PoolSummary,
    ProxyEndpoint,
    ProxyPool,
    ProxyRecord,
    ProxySource,
    StatsReport,
    StatsSnapshot,
};

pub use crate::extract::Table;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
