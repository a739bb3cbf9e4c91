//! Domain entities: sessions, kernels, agents, scaling groups, routes and endpoints.
//!
//! `SessionStatus` generalizes the Unix-process state machine pattern used
//! elsewhere in this codebase to the session lifecycle: a closed set of
//! states with an explicit transition-validity matrix, rather than a
//! freeform string field.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::ResourceSlots;
use crate::types::{AccessKey, AgentId, KernelId, ScalingGroupName, SessionId};

/// Session lifecycle state.
///
/// ```text
/// PENDING → SCHEDULED → PREPARING → PREPARED → CREATING → RUNNING → TERMINATING → TERMINATED
///    ↓          ↓           ↓          ↓           ↓                      ↑
///  CANCELLED  CANCELLED   ERROR       ERROR       ERROR ──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Scheduled,
    Preparing,
    Prepared,
    Creating,
    Running,
    Terminating,
    Terminated,
    Cancelled,
    Error,
}

impl SessionStatus {
    /// Terminal states a reconciler can skip once reached.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Terminated | SessionStatus::Cancelled)
    }

    /// Whether a session in this state is still a candidate for Stage A (Schedule).
    pub fn is_schedulable(self) -> bool {
        matches!(self, SessionStatus::Pending)
    }

    /// Whether the transition is permitted by the state machine.
    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (Pending, Scheduled) => true,
            (Pending, Cancelled) => true,
            (Scheduled, Preparing) => true,
            (Scheduled, Cancelled) => true,
            (Scheduled, Error) => true,
            (Preparing, Prepared) => true,
            (Preparing, Error) => true,
            (Preparing, Cancelled) => true,
            (Prepared, Creating) => true,
            (Prepared, Error) => true,
            (Prepared, Cancelled) => true,
            (Creating, Running) => true,
            (Creating, Error) => true,
            (Running, Terminating) => true,
            (Running, Error) => true,
            (Terminating, Terminated) => true,
            (Error, Terminating) => true,
            (Terminated, _) => false,
            (Cancelled, _) => false,
            _ => false,
        }
    }
}

/// Free-form status context recorded alongside a status transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusData {
    pub reason: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Scheduling priority; lower numeric value means higher priority, matching
/// the min-heap convention used by the scheduling strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct SchedulingPriority(pub i32);

impl Default for SchedulingPriority {
    fn default() -> Self {
        SchedulingPriority(0)
    }
}

/// Workload shape: drives which predicates and start-time gates apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionKind {
    Interactive,
    Batch,
    Inference,
}

/// Whether a session's kernels land on one agent or are spread across several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterMode {
    SingleNode,
    MultiNode,
}

/// A compute session: the admission and scheduling unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub access_key: AccessKey,
    pub domain_name: String,
    pub group_name: String,
    pub scaling_group: ScalingGroupName,
    pub status: SessionStatus,
    pub status_data: StatusData,
    pub priority: SchedulingPriority,
    pub kind: SessionKind,
    pub cluster_mode: ClusterMode,
    pub cluster_size: u32,
    pub requested_slots: ResourceSlots,
    pub kernels: Vec<KernelId>,
    pub image: String,
    /// Requested CPU architecture for this session's kernels. A single-node
    /// session's kernels must all land on one agent and therefore share this
    /// architecture; a multi-node session may still request it uniformly,
    /// but each kernel is placed independently (§4.4).
    pub architecture: String,
    pub mounts: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub preopen_ports: Vec<u16>,
    pub dependencies: Vec<SessionId>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time this (batch) session may be admitted into Stage A; `None`
    /// means eligible as soon as it is PENDING. Distinct from `running_since`.
    pub starts_at: Option<DateTime<Utc>>,
    pub running_since: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    /// Consecutive predicate failures this tick; drives the fifo skip policy.
    pub consecutive_check_failures: u32,
}

impl Session {
    pub fn new(
        access_key: AccessKey,
        scaling_group: ScalingGroupName,
        requested_slots: ResourceSlots,
        priority: SchedulingPriority,
    ) -> Self {
        Self {
            id: SessionId::new(),
            access_key,
            domain_name: String::new(),
            group_name: String::new(),
            scaling_group,
            status: SessionStatus::Pending,
            status_data: StatusData::default(),
            priority,
            kind: SessionKind::Interactive,
            cluster_mode: ClusterMode::SingleNode,
            cluster_size: 1,
            requested_slots,
            kernels: Vec::new(),
            image: String::new(),
            architecture: "x86_64".to_string(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            preopen_ports: Vec::new(),
            dependencies: Vec::new(),
            retries: 0,
            created_at: Utc::now(),
            starts_at: None,
            running_since: None,
            terminated_at: None,
            consecutive_check_failures: 0,
        }
    }

    pub fn mark_status(&mut self, status: SessionStatus, reason: Option<String>) -> Result<(), String> {
        if !self.status.can_transition_to(status) {
            return Err(format!(
                "invalid session transition {:?} -> {:?}",
                self.status, status
            ));
        }
        self.status = status;
        self.status_data.reason = reason;
        match status {
            SessionStatus::Running => self.running_since = Some(Utc::now()),
            SessionStatus::Terminated | SessionStatus::Cancelled => {
                self.terminated_at = Some(Utc::now())
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether every entry in `dependencies` refers to a terminated-successfully session.
    pub fn dependencies_satisfied(&self, dependency_statuses: &[SessionStatus]) -> bool {
        dependency_statuses
            .iter()
            .all(|s| matches!(s, SessionStatus::Terminated))
    }
}

/// A single compute kernel (container) belonging to a session, placed on one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    pub id: KernelId,
    pub session_id: SessionId,
    pub agent_id: Option<AgentId>,
    pub status: SessionStatus,
    pub occupied_slots: ResourceSlots,
    pub image: String,
    pub architecture: String,
    pub created_at: DateTime<Utc>,
}

/// Agent registration and capacity snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub addr: String,
    pub scaling_group: ScalingGroupName,
    pub architecture: String,
    pub schedulable: bool,
    pub available_slots: ResourceSlots,
    pub occupied_slots: ResourceSlots,
    pub container_limit: u32,
    pub container_count: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Remaining free capacity (available minus occupied), never negative per invariant.
    pub fn remaining_capacity(&self) -> ResourceSlots {
        self.available_slots
            .subtract(&self.occupied_slots)
            .unwrap_or_else(|_| ResourceSlots::new())
    }

    pub fn has_container_headroom(&self) -> bool {
        self.container_count < self.container_limit
    }
}

/// A named pool of agents sharing a scheduling strategy and lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingGroup {
    pub name: ScalingGroupName,
    pub scheduler_strategy: String,
    pub agent_selection_strategy: String,
}

/// Whether an unspecified policy limit means "no cap" or "nothing allowed".
/// Duck-typed policy objects collapse to this discriminated union: a missing
/// `total_resource_slots` defers to this field rather than silently meaning
/// one or the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyDefault {
    Limited,
    Unlimited,
}

impl PolicyDefault {
    /// Resolves `total_resource_slots` against this default, producing `None`
    /// for "no cap" so callers can skip the comparison uniformly.
    pub fn resolve(self, total_resource_slots: &Option<ResourceSlots>) -> Option<ResourceSlots> {
        match total_resource_slots {
            Some(slots) => Some(slots.clone()),
            None => match self {
                PolicyDefault::Unlimited => None,
                PolicyDefault::Limited => Some(ResourceSlots::new()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypairResourcePolicy {
    pub access_key: AccessKey,
    pub total_resource_slots: Option<ResourceSlots>,
    pub default_for_unspecified: PolicyDefault,
    pub max_concurrent_sessions: Option<u32>,
    pub max_pending_session_count: Option<u32>,
    pub max_pending_session_resource_slots: Option<ResourceSlots>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResourcePolicy {
    pub access_key: AccessKey,
    pub total_resource_slots: Option<ResourceSlots>,
    pub default_for_unspecified: PolicyDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResourcePolicy {
    pub group_name: String,
    pub total_resource_slots: Option<ResourceSlots>,
    pub default_for_unspecified: PolicyDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainResourcePolicy {
    pub domain_name: String,
    pub total_resource_slots: Option<ResourceSlots>,
    pub default_for_unspecified: PolicyDefault,
}

/// Lifecycle stage of an inference endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointStage {
    Created,
    Destroying,
    Destroyed,
}

/// An inference endpoint: a stable routing target fronting autoscaled sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: crate::types::EndpointId,
    pub access_key: AccessKey,
    pub scaling_group: ScalingGroupName,
    pub lifecycle_stage: EndpointStage,
    /// Desired replica count, updated by autoscaling rules each tick.
    pub replicas: u32,
    pub retries: u32,
    pub routes: Vec<crate::types::RouteId>,
}

/// Status of a single routing (one live or in-flight session backing an endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteStatus {
    Provisioning,
    Healthy,
    Unhealthy,
    Terminating,
}

impl RouteStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RouteStatus::Provisioning | RouteStatus::Healthy)
    }
}

/// A single route: one session backing an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub id: crate::types::RouteId,
    pub endpoint_id: crate::types::EndpointId,
    pub session_id: Option<SessionId>,
    pub status: RouteStatus,
    pub created_at: DateTime<Utc>,
}

/// Priority-queue item for the in-tick ready queue: min-priority first, FIFO tie-break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleItem {
    pub session_id: SessionId,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl Ord for ScheduleItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for ScheduleItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_schedule() {
        assert!(SessionStatus::Pending.can_transition_to(SessionStatus::Scheduled));
    }

    #[test]
    fn full_lifecycle_chain_is_linear() {
        use SessionStatus::*;
        let chain = [Pending, Scheduled, Preparing, Prepared, Creating, Running, Terminating, Terminated];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{pair:?} should be a valid transition");
        }
        assert!(!Preparing.can_transition_to(Running), "Preparing must not skip Prepared/Creating");
    }

    #[test]
    fn terminated_is_terminal_and_closed() {
        assert!(SessionStatus::Terminated.is_terminal());
        assert!(!SessionStatus::Terminated.can_transition_to(SessionStatus::Pending));
    }

    #[test]
    fn policy_default_resolves_missing_cap() {
        assert_eq!(PolicyDefault::Unlimited.resolve(&None), None);
        assert_eq!(
            PolicyDefault::Limited.resolve(&None),
            Some(ResourceSlots::new())
        );
    }

    #[test]
    fn schedule_item_orders_by_priority_then_fifo() {
        let now = Utc::now();
        let high = ScheduleItem {
            session_id: SessionId::new(),
            priority: 0,
            created_at: now,
        };
        let low = ScheduleItem {
            session_id: SessionId::new(),
            priority: 5,
            created_at: now,
        };
        let mut heap = std::collections::BinaryHeap::new();
        heap.push(low.clone());
        heap.push(high.clone());
        assert_eq!(heap.pop().unwrap().priority, high.priority);
    }
}
