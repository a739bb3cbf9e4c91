//! Registry: the transactional persistence boundary.
//!
//! Postgres is the source of truth for every entity; the fast concurrency
//! counter (Redis-backed) is an eventually-consistent cache over "how many
//! sessions does this access_key currently occupy", periodically rescanned
//! against Postgres to bound drift. `Registry` is the trait every scheduler
//! and reconciler stage codes against; `MemoryRegistry` is the in-process
//! test double, `PostgresRegistry` is the production implementor.

mod memory;
mod postgres;

pub use memory::MemoryRegistry;
pub use postgres::PostgresRegistry;

use async_trait::async_trait;

use crate::model::{
    Agent, DomainResourcePolicy, Endpoint, GroupResourcePolicy, Kernel, KeypairResourcePolicy,
    Route, RouteStatus, Session, SessionStatus, UserResourcePolicy,
};
use crate::types::{AccessKey, AgentId, EndpointId, KernelId, Result, RouteId, ScalingGroupName, SessionId};

/// Transactional persistence boundary for sessions, kernels and agents.
///
/// Implementors must make `update_session_status` and `reserve_kernel`
/// atomic with respect to concurrent callers on the same row — the
/// Postgres implementor does this with `SELECT ... FOR UPDATE` inside a
/// transaction, the in-memory implementor with an internal mutex.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn insert_session(&self, session: Session) -> Result<()>;

    async fn get_session(&self, id: &SessionId) -> Result<Session>;

    /// All sessions in `Pending` state for a scaling group, ordered by
    /// insertion — strategy-specific ordering is applied by the caller.
    async fn pending_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>>;

    /// All non-terminal sessions for a scaling group (used by the reconciler sweep).
    async fn active_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>>;

    /// Sessions in a terminal state (`Terminated`/`Cancelled`) for a scaling
    /// group, consulted by the reconciler's terminal-retention sweep.
    async fn terminated_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>>;

    /// Hard-deletes a terminal session's row once it has outlived
    /// `ReconcilerConfig::terminal_retention`.
    async fn purge_session(&self, id: &SessionId) -> Result<()>;

    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        reason: Option<String>,
    ) -> Result<()>;

    async fn record_check_failure(&self, id: &SessionId) -> Result<u32>;

    async fn reset_check_failures(&self, id: &SessionId) -> Result<()>;

    async fn insert_kernel(&self, kernel: Kernel) -> Result<()>;

    async fn get_kernel(&self, id: &KernelId) -> Result<Kernel>;

    async fn kernels_for_session(&self, session_id: &SessionId) -> Result<Vec<Kernel>>;

    async fn update_kernel_status(&self, id: &KernelId, status: SessionStatus) -> Result<()>;

    /// Atomically assigns an agent to a kernel and reserves the kernel's
    /// slots against that agent's occupied_slots. Fails with
    /// `Error::Capacity` if the agent no longer has headroom (another
    /// concurrent scheduler tick won the race).
    async fn reserve_kernel(&self, kernel_id: &KernelId, agent_id: &AgentId) -> Result<()>;

    /// Releases a kernel's reserved slots back to its agent (on termination).
    async fn release_kernel(&self, kernel_id: &KernelId) -> Result<()>;

    async fn list_agents(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Agent>>;

    async fn get_agent(&self, id: &AgentId) -> Result<Agent>;

    async fn upsert_agent(&self, agent: Agent) -> Result<()>;

    /// All endpoints in a scaling group, any lifecycle stage; Stage D filters in-memory.
    async fn list_endpoints(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Endpoint>>;

    /// Inserts or fully replaces an endpoint row (replicas, retries, lifecycle_stage, routes).
    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<()>;

    async fn delete_endpoint(&self, id: &EndpointId) -> Result<()>;

    async fn routes_for_endpoint(&self, endpoint_id: &EndpointId) -> Result<Vec<Route>>;

    async fn insert_route(&self, route: Route) -> Result<()>;

    async fn update_route_status(&self, id: &RouteId, status: RouteStatus) -> Result<()>;

    async fn delete_route(&self, id: &RouteId) -> Result<()>;

    /// Deletes every route whose `session_id` no longer resolves to an
    /// existing session, returning the count removed. Idempotent: running it
    /// twice in a row against an already-clean registry returns zero both
    /// times and touches no row.
    async fn clean_zombie_routes(&self) -> Result<u32>;

    async fn get_keypair_resource_policy(
        &self,
        access_key: &AccessKey,
    ) -> Result<Option<KeypairResourcePolicy>>;

    async fn upsert_keypair_resource_policy(&self, policy: KeypairResourcePolicy) -> Result<()>;

    async fn get_user_resource_policy(
        &self,
        access_key: &AccessKey,
    ) -> Result<Option<UserResourcePolicy>>;

    async fn upsert_user_resource_policy(&self, policy: UserResourcePolicy) -> Result<()>;

    async fn get_group_resource_policy(
        &self,
        group_name: &str,
    ) -> Result<Option<GroupResourcePolicy>>;

    async fn upsert_group_resource_policy(&self, policy: GroupResourcePolicy) -> Result<()>;

    async fn get_domain_resource_policy(
        &self,
        domain_name: &str,
    ) -> Result<Option<DomainResourcePolicy>>;

    async fn upsert_domain_resource_policy(&self, policy: DomainResourcePolicy) -> Result<()>;
}

/// Fast, eventually-consistent per-access-key concurrency counter.
///
/// Backed by Redis in production (`RedisConcurrencyCounter`); consulted by
/// Stage A admission before the slower Postgres-backed predicate checks run,
/// and periodically rescanned against `Registry::active_sessions` to bound
/// drift (see the Open Question this resolves in `DESIGN.md`).
#[async_trait]
pub trait ConcurrencyCounter: Send + Sync {
    async fn increment(&self, access_key: &crate::types::AccessKey) -> Result<u32>;
    async fn decrement(&self, access_key: &crate::types::AccessKey) -> Result<()>;
    async fn current(&self, access_key: &crate::types::AccessKey) -> Result<u32>;
    /// Overwrites the counter with an authoritative value obtained from Postgres.
    async fn rescan(&self, access_key: &crate::types::AccessKey, authoritative: u32) -> Result<()>;
}

mod redis_counter;
pub use redis_counter::RedisConcurrencyCounter;
