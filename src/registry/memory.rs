//! In-process `Registry` implementation used by every scheduler, predicate
//! and reconciler unit test. Generalizes the teacher's pattern of a single
//! struct owning plain `HashMap`s behind a lock, driven entirely through
//! `&self` methods rather than a separate actor.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{
    Agent, DomainResourcePolicy, Endpoint, GroupResourcePolicy, Kernel, KeypairResourcePolicy,
    Route, RouteStatus, Session, SessionStatus, UserResourcePolicy,
};
use crate::types::{
    AccessKey, AgentId, EndpointId, Error, KernelId, Result, RouteId, ScalingGroupName, SessionId,
};

use super::Registry;

#[derive(Debug, Default)]
struct State {
    sessions: HashMap<SessionId, Session>,
    kernels: HashMap<KernelId, Kernel>,
    agents: HashMap<AgentId, Agent>,
    endpoints: HashMap<EndpointId, Endpoint>,
    routes: HashMap<RouteId, Route>,
    keypair_policies: HashMap<AccessKey, KeypairResourcePolicy>,
    user_policies: HashMap<AccessKey, UserResourcePolicy>,
    group_policies: HashMap<String, GroupResourcePolicy>,
    domain_policies: HashMap<String, DomainResourcePolicy>,
}

/// In-memory `Registry`. Not for production use — no durability, no
/// cross-process visibility — but implements the same atomicity contract
/// (all mutations go through a single mutex) so tests exercise real races.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn insert_session(&self, session: Session) -> Result<()> {
        self.lock().sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Session> {
        self.lock()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("session {id} not found")))
    }

    async fn pending_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>> {
        let state = self.lock();
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| &s.scaling_group == scaling_group && s.status.is_schedulable())
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn active_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>> {
        let state = self.lock();
        Ok(state
            .sessions
            .values()
            .filter(|s| &s.scaling_group == scaling_group && !s.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn terminated_sessions(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Session>> {
        let state = self.lock();
        Ok(state
            .sessions
            .values()
            .filter(|s| &s.scaling_group == scaling_group && s.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn purge_session(&self, id: &SessionId) -> Result<()> {
        let mut state = self.lock();
        state
            .sessions
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("session {id} not found")))?;
        state.kernels.retain(|_, k| &k.session_id != id);
        Ok(())
    }

    async fn update_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("session {id} not found")))?;
        session
            .mark_status(status, reason)
            .map_err(Error::state_transition)
    }

    async fn record_check_failure(&self, id: &SessionId) -> Result<u32> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("session {id} not found")))?;
        session.consecutive_check_failures += 1;
        Ok(session.consecutive_check_failures)
    }

    async fn reset_check_failures(&self, id: &SessionId) -> Result<()> {
        let mut state = self.lock();
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("session {id} not found")))?;
        session.consecutive_check_failures = 0;
        Ok(())
    }

    async fn insert_kernel(&self, kernel: Kernel) -> Result<()> {
        self.lock().kernels.insert(kernel.id.clone(), kernel);
        Ok(())
    }

    async fn get_kernel(&self, id: &KernelId) -> Result<Kernel> {
        self.lock()
            .kernels
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("kernel {id} not found")))
    }

    async fn kernels_for_session(&self, session_id: &SessionId) -> Result<Vec<Kernel>> {
        Ok(self
            .lock()
            .kernels
            .values()
            .filter(|k| &k.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn update_kernel_status(&self, id: &KernelId, status: SessionStatus) -> Result<()> {
        let mut state = self.lock();
        let kernel = state
            .kernels
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("kernel {id} not found")))?;
        kernel.status = status;
        Ok(())
    }

    async fn reserve_kernel(&self, kernel_id: &KernelId, agent_id: &AgentId) -> Result<()> {
        let mut state = self.lock();
        let kernel = state
            .kernels
            .get(kernel_id)
            .ok_or_else(|| Error::not_found(format!("kernel {kernel_id} not found")))?
            .clone();
        let agent = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::not_found(format!("agent {agent_id} not found")))?;

        if !kernel.occupied_slots.fits_within(&agent.remaining_capacity()) {
            return Err(Error::capacity(format!(
                "agent {agent_id} has insufficient remaining capacity for kernel {kernel_id}"
            )));
        }
        if !agent.has_container_headroom() {
            return Err(Error::capacity(format!(
                "agent {agent_id} has no container headroom"
            )));
        }

        agent.occupied_slots = agent.occupied_slots.add(&kernel.occupied_slots);
        agent.container_count += 1;

        let kernel_mut = state.kernels.get_mut(kernel_id).expect("checked above");
        kernel_mut.agent_id = Some(agent_id.clone());
        Ok(())
    }

    async fn release_kernel(&self, kernel_id: &KernelId) -> Result<()> {
        let mut state = self.lock();
        let kernel = state
            .kernels
            .get(kernel_id)
            .ok_or_else(|| Error::not_found(format!("kernel {kernel_id} not found")))?
            .clone();
        if let Some(agent_id) = &kernel.agent_id {
            if let Some(agent) = state.agents.get_mut(agent_id) {
                agent.occupied_slots = agent.occupied_slots.subtract(&kernel.occupied_slots)?;
                agent.container_count = agent.container_count.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn list_agents(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Agent>> {
        Ok(self
            .lock()
            .agents
            .values()
            .filter(|a| &a.scaling_group == scaling_group)
            .cloned()
            .collect())
    }

    async fn get_agent(&self, id: &AgentId) -> Result<Agent> {
        self.lock()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("agent {id} not found")))
    }

    async fn upsert_agent(&self, agent: Agent) -> Result<()> {
        self.lock().agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn list_endpoints(&self, scaling_group: &ScalingGroupName) -> Result<Vec<Endpoint>> {
        Ok(self
            .lock()
            .endpoints
            .values()
            .filter(|e| &e.scaling_group == scaling_group)
            .cloned()
            .collect())
    }

    async fn upsert_endpoint(&self, endpoint: Endpoint) -> Result<()> {
        self.lock().endpoints.insert(endpoint.id.clone(), endpoint);
        Ok(())
    }

    async fn delete_endpoint(&self, id: &EndpointId) -> Result<()> {
        self.lock()
            .endpoints
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("endpoint {id} not found")))?;
        Ok(())
    }

    async fn routes_for_endpoint(&self, endpoint_id: &EndpointId) -> Result<Vec<Route>> {
        Ok(self
            .lock()
            .routes
            .values()
            .filter(|r| &r.endpoint_id == endpoint_id)
            .cloned()
            .collect())
    }

    async fn insert_route(&self, route: Route) -> Result<()> {
        self.lock().routes.insert(route.id.clone(), route);
        Ok(())
    }

    async fn update_route_status(&self, id: &RouteId, status: RouteStatus) -> Result<()> {
        let mut state = self.lock();
        let route = state
            .routes
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("route {id} not found")))?;
        route.status = status;
        Ok(())
    }

    async fn delete_route(&self, id: &RouteId) -> Result<()> {
        self.lock()
            .routes
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("route {id} not found")))?;
        Ok(())
    }

    async fn clean_zombie_routes(&self) -> Result<u32> {
        let mut state = self.lock();
        let zombies: Vec<RouteId> = state
            .routes
            .values()
            .filter(|r| match &r.session_id {
                Some(session_id) => !state.sessions.contains_key(session_id),
                None => false,
            })
            .map(|r| r.id.clone())
            .collect();
        for id in &zombies {
            state.routes.remove(id);
        }
        Ok(zombies.len() as u32)
    }

    async fn get_keypair_resource_policy(
        &self,
        access_key: &AccessKey,
    ) -> Result<Option<KeypairResourcePolicy>> {
        Ok(self.lock().keypair_policies.get(access_key).cloned())
    }

    async fn upsert_keypair_resource_policy(&self, policy: KeypairResourcePolicy) -> Result<()> {
        self.lock()
            .keypair_policies
            .insert(policy.access_key.clone(), policy);
        Ok(())
    }

    async fn get_user_resource_policy(
        &self,
        access_key: &AccessKey,
    ) -> Result<Option<UserResourcePolicy>> {
        Ok(self.lock().user_policies.get(access_key).cloned())
    }

    async fn upsert_user_resource_policy(&self, policy: UserResourcePolicy) -> Result<()> {
        self.lock()
            .user_policies
            .insert(policy.access_key.clone(), policy);
        Ok(())
    }

    async fn get_group_resource_policy(
        &self,
        group_name: &str,
    ) -> Result<Option<GroupResourcePolicy>> {
        Ok(self.lock().group_policies.get(group_name).cloned())
    }

    async fn upsert_group_resource_policy(&self, policy: GroupResourcePolicy) -> Result<()> {
        self.lock()
            .group_policies
            .insert(policy.group_name.clone(), policy);
        Ok(())
    }

    async fn get_domain_resource_policy(
        &self,
        domain_name: &str,
    ) -> Result<Option<DomainResourcePolicy>> {
        Ok(self.lock().domain_policies.get(domain_name).cloned())
    }

    async fn upsert_domain_resource_policy(&self, policy: DomainResourcePolicy) -> Result<()> {
        self.lock()
            .domain_policies
            .insert(policy.domain_name.clone(), policy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SchedulingPriority;
    use crate::resource::ResourceSlots;
    use crate::types::AccessKey;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn test_agent(scaling_group: &ScalingGroupName) -> Agent {
        Agent {
            id: AgentId::from_string("agent-1".into()).unwrap(),
            addr: "http://127.0.0.1:6001".into(),
            scaling_group: scaling_group.clone(),
            architecture: "x86_64".into(),
            schedulable: true,
            available_slots: ResourceSlots::from_pairs([("cpu", Decimal::from(4))]),
            occupied_slots: ResourceSlots::new(),
            container_limit: 10,
            container_count: 0,
            last_heartbeat: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reserve_kernel_rejects_when_agent_is_full() {
        let registry = MemoryRegistry::new();
        let sg = ScalingGroupName::from_string("default".into()).unwrap();
        registry.upsert_agent(test_agent(&sg)).await.unwrap();

        let session = Session::new(
            AccessKey::from_string("ak1".into()).unwrap(),
            sg.clone(),
            ResourceSlots::from_pairs([("cpu", Decimal::from(8))]),
            SchedulingPriority::default(),
        );
        registry.insert_session(session.clone()).await.unwrap();

        let kernel = Kernel {
            id: KernelId::new(),
            session_id: session.id.clone(),
            agent_id: None,
            status: SessionStatus::Pending,
            occupied_slots: ResourceSlots::from_pairs([("cpu", Decimal::from(8))]),
            image: "python:3.11".into(),
            architecture: "x86_64".into(),
            created_at: Utc::now(),
        };
        registry.insert_kernel(kernel.clone()).await.unwrap();

        let agent_id = AgentId::from_string("agent-1".into()).unwrap();
        let result = registry.reserve_kernel(&kernel.id, &agent_id).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clean_zombie_routes_removes_only_orphans() {
        let registry = MemoryRegistry::new();
        let sg = ScalingGroupName::from_string("default".into()).unwrap();
        let session = Session::new(
            AccessKey::from_string("ak1".into()).unwrap(),
            sg,
            ResourceSlots::new(),
            SchedulingPriority::default(),
        );
        let live_session_id = session.id.clone();
        registry.insert_session(session).await.unwrap();

        let endpoint_id = crate::types::EndpointId::new();
        let live_route = Route {
            id: RouteId::new(),
            endpoint_id: endpoint_id.clone(),
            session_id: Some(live_session_id.clone()),
            status: RouteStatus::Healthy,
            created_at: Utc::now(),
        };
        let zombie_route = Route {
            id: RouteId::new(),
            endpoint_id,
            session_id: Some(SessionId::new()),
            status: RouteStatus::Healthy,
            created_at: Utc::now(),
        };
        registry.insert_route(live_route.clone()).await.unwrap();
        registry.insert_route(zombie_route.clone()).await.unwrap();

        let cleaned = registry.clean_zombie_routes().await.unwrap();
        assert_eq!(cleaned, 1);
        assert!(registry.get_session(&live_session_id).await.is_ok());
        assert_eq!(
            registry.routes_for_endpoint(&live_route.endpoint_id).await.unwrap().len(),
            1
        );

        let cleaned_again = registry.clean_zombie_routes().await.unwrap();
        assert_eq!(cleaned_again, 0);
    }
}
