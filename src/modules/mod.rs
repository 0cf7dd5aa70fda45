//! Resilience building blocks.
//!
//! Identity rotation, proxy pooling, retry/backoff with circuit
//! breaking, plus the statistics and event plumbing the orchestration
//! loop feeds. Each module stands alone; the fetcher wires them
//! together.

pub mod breaker;
pub mod events;
pub mod identity;
pub mod proxy;
pub mod retry;
pub mod stats;

// Re-export commonly used types
pub use breaker::{
    Admission, BreakerConfig, BreakerRegistry, BreakerState, BreakerTransition, BreakerView,
    CircuitBreaker,
};
pub use events::{EventDispatcher, EventHandler, FetchEvent, LoggingHandler};
pub use identity::{
    DeviceClass, IdentityError, IdentityProfile, IdentityRotator, RotationMode,
};
pub use proxy::{
    OutcomeEffect, PoolConfig, PoolSummary, ProxyEndpoint, ProxyError, ProxyPool, ProxyRecord,
    ProxyRecordSummary, ProxyScheme, ProxySource,
};
pub use retry::{
    BackoffConfig, FailureKind, FetchFailure, GiveUpReason, JitterMode, RetryAttempt,
    RetryDecision, RetryEngine,
};
pub use stats::{
    DomainSlice, FetchStats, GlobalSlice, IdentitySlice, StatsReport, StatsSnapshot, StrategySlice,
};
