//! Core types for the scheduler core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (SessionId, KernelId, AgentId, ...)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the scheduler, reconciler and registry

mod config;
mod errors;
mod ids;

pub use config::{
    AgentRpcConfig, Config, DatabaseConfig, ObservabilityConfig, ReconcilerConfig, RedisConfig,
    SchedulerConfig, ServerConfig,
};
pub use errors::{Error, Result, Severity};
pub use ids::{
    AccessKey, AgentId, EndpointId, KernelId, RequestId, RouteId, ScalingGroupName, SessionId,
};
