//! # Sokovan Core — session scheduler and lifecycle orchestrator
//!
//! Takes user-submitted compute-session requests, validates them against
//! multi-tier resource policies, selects agents capable of running them,
//! reserves resources, drives containers through a lifecycle state machine,
//! and autoscales inference endpoints.
//!
//! ## Architecture
//!
//! Six cooperating subsystems, dependency order leaves first:
//! ```text
//!   Resource Model → Registry → Predicate Engine → Agent Selector
//!                                                         │
//!                         Scheduler (per-scaling-group tick) ──┐
//!                                                               ├→ events
//!                         Lifecycle Reconciler (cross-SG sweep) ┘
//! ```
//! The Registry exclusively owns mutations to persisted entities; the
//! Scheduler and Reconciler call it, never touching storage directly.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod agent_rpc;
pub mod clock;
pub mod events;
pub mod kv;
pub mod lock;
pub mod model;
pub mod predicate;
pub mod reconciler;
pub mod registry;
pub mod resource;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod storage_proxy;
pub mod types;

pub mod observability;

pub use types::{Config, Error, Result};
