//! Agent RPC client: the manager's outbound calls to a compute node.
//!
//! Modeled as a trait so the scheduler's Stage B/C/E and the reconciler's
//! zombie sweep can be tested against `MockAgentClient` without a live agent,
//! mirroring the teacher's `async-trait`-at-the-seam idiom. `TonicAgentClient`
//! is the production implementor over the generated `agent.proto` client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-harness"))]
use mockall::automock;
use tokio::sync::RwLock;

use crate::registry::Registry;
use crate::resource::ResourceSlots;
use crate::types::{AgentId, Error, KernelId, Result, SessionId};

pub mod proto {
    tonic::include_proto!("sokovan.agent.v1");
}

/// Outcome of a heartbeat pull, feeding `Registry::upsert_agent`.
#[derive(Debug, Clone)]
pub struct AgentCapacityReport {
    pub available_slots: ResourceSlots,
    pub occupied_slots: ResourceSlots,
    pub container_count: u32,
    pub container_limit: u32,
    pub schedulable: bool,
}

/// One kernel within a (possibly multi-node) `create_kernels` batch.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    pub kernel_id: KernelId,
    pub image: String,
    pub occupied_slots: ResourceSlots,
}

#[cfg_attr(any(test, feature = "test-harness"), automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Liveness check against the agent itself, independent of any kernel.
    async fn ping(&self, agent_id: &AgentId) -> Result<bool>;

    /// Stage B precondition: ensures the agent has (or pulls) the image for
    /// the given architecture before any kernel is created on it.
    async fn check_and_pull_image(&self, agent_id: &AgentId, image_ref: &str, architecture: &str) -> Result<()>;

    /// Creates every kernel of a session on this agent in one call — the
    /// agent is responsible for bringing up the whole batch atomically.
    async fn create_kernels(
        &self,
        agent_id: &AgentId,
        session_id: &SessionId,
        kernels: &[KernelSpec],
    ) -> Result<()>;

    async fn destroy_kernel(&self, agent_id: &AgentId, kernel_id: &KernelId, reason: &str) -> Result<()>;

    async fn ping_kernel(&self, agent_id: &AgentId, kernel_id: &KernelId) -> Result<bool>;

    async fn heartbeat(&self, agent_id: &AgentId) -> Result<AgentCapacityReport>;
}

fn slots_to_proto(slots: &ResourceSlots) -> Vec<proto::ResourceSlot> {
    slots
        .slots()
        .map(|(name, qty)| proto::ResourceSlot {
            name: name.to_string(),
            quantity: qty.to_string(),
        })
        .collect()
}

fn slots_from_proto(pairs: &[proto::ResourceSlot]) -> ResourceSlots {
    ResourceSlots::from_pairs(pairs.iter().filter_map(|p| {
        p.quantity
            .parse::<rust_decimal::Decimal>()
            .ok()
            .map(|q| (p.name.clone(), q))
    }))
}

/// Production `AgentClient` over a gRPC channel. One instance per agent
/// endpoint; the manager keeps a small pool keyed by `AgentId`.
pub struct TonicAgentClient {
    channel: tonic::transport::Channel,
    call_timeout: Duration,
}

impl TonicAgentClient {
    pub async fn connect(endpoint: impl Into<String>, call_timeout: Duration) -> Result<Self> {
        let channel = tonic::transport::Endpoint::from_shared(endpoint.into())
            .map_err(|e| Error::agent(format!("invalid agent endpoint: {e}")))?
            .timeout(call_timeout)
            .connect()
            .await
            .map_err(|e| Error::agent(format!("failed to connect to agent: {e}")))?;
        Ok(Self { channel, call_timeout })
    }

    fn client(&self) -> proto::agent_service_client::AgentServiceClient<tonic::transport::Channel> {
        proto::agent_service_client::AgentServiceClient::new(self.channel.clone())
    }
}

#[async_trait]
impl AgentClient for TonicAgentClient {
    async fn ping(&self, agent_id: &AgentId) -> Result<bool> {
        let request = tonic::Request::new(proto::PingRequest {
            agent_id: agent_id.to_string(),
        });
        let response = tokio::time::timeout(self.call_timeout, self.client().ping(request))
            .await
            .map_err(|_| Error::timeout(format!("ping timed out for {agent_id}")))?
            .map_err(|status| Error::agent(format!("ping rpc failed: {status}")))?
            .into_inner();
        Ok(response.alive)
    }

    async fn check_and_pull_image(
        &self,
        _agent_id: &AgentId,
        image_ref: &str,
        architecture: &str,
    ) -> Result<()> {
        let request = tonic::Request::new(proto::CheckAndPullImageRequest {
            image_ref: image_ref.to_string(),
            architecture: architecture.to_string(),
        });
        let response =
            tokio::time::timeout(self.call_timeout, self.client().check_and_pull_image(request))
                .await
                .map_err(|_| Error::timeout(format!("check_and_pull_image timed out for {image_ref}")))?
                .map_err(|status| Error::agent(format!("check_and_pull_image rpc failed: {status}")))?
                .into_inner();

        if !response.ready {
            return Err(Error::agent(format!(
                "agent could not stage image {image_ref}: {}",
                response.reason
            )));
        }
        Ok(())
    }

    async fn create_kernels(
        &self,
        _agent_id: &AgentId,
        session_id: &SessionId,
        kernels: &[KernelSpec],
    ) -> Result<()> {
        let request = tonic::Request::new(proto::CreateKernelsRequest {
            session_id: session_id.to_string(),
            kernels: kernels
                .iter()
                .map(|k| proto::KernelSpec {
                    kernel_id: k.kernel_id.to_string(),
                    image: k.image.clone(),
                    occupied_slots: slots_to_proto(&k.occupied_slots),
                })
                .collect(),
        });
        let response = tokio::time::timeout(self.call_timeout, self.client().create_kernels(request))
            .await
            .map_err(|_| Error::timeout(format!("create_kernels timed out for session {session_id}")))?
            .map_err(|status| Error::agent(format!("create_kernels rpc failed: {status}")))?
            .into_inner();

        if !response.accepted {
            return Err(Error::agent(format!(
                "agent rejected create_kernels for session {session_id}: {}",
                response.reason
            )));
        }
        Ok(())
    }

    async fn destroy_kernel(&self, _agent_id: &AgentId, kernel_id: &KernelId, reason: &str) -> Result<()> {
        let request = tonic::Request::new(proto::DestroyKernelRequest {
            kernel_id: kernel_id.to_string(),
            reason: reason.to_string(),
        });
        tokio::time::timeout(self.call_timeout, self.client().destroy_kernel(request))
            .await
            .map_err(|_| Error::timeout(format!("destroy_kernel timed out for {kernel_id}")))?
            .map_err(|status| Error::agent(format!("destroy_kernel rpc failed: {status}")))?;
        Ok(())
    }

    async fn ping_kernel(&self, _agent_id: &AgentId, kernel_id: &KernelId) -> Result<bool> {
        let request = tonic::Request::new(proto::PingKernelRequest {
            kernel_id: kernel_id.to_string(),
        });
        let response = tokio::time::timeout(self.call_timeout, self.client().ping_kernel(request))
            .await
            .map_err(|_| Error::timeout(format!("ping_kernel timed out for {kernel_id}")))?
            .map_err(|status| Error::agent(format!("ping_kernel rpc failed: {status}")))?
            .into_inner();
        Ok(response.alive)
    }

    async fn heartbeat(&self, agent_id: &AgentId) -> Result<AgentCapacityReport> {
        let request = tonic::Request::new(proto::HeartbeatRequest {
            agent_id: agent_id.to_string(),
        });
        let response = tokio::time::timeout(self.call_timeout, self.client().report_heartbeat(request))
            .await
            .map_err(|_| Error::timeout(format!("heartbeat timed out for {agent_id}")))?
            .map_err(|status| Error::agent(format!("heartbeat rpc failed: {status}")))?
            .into_inner();

        Ok(AgentCapacityReport {
            available_slots: slots_from_proto(&response.available_slots),
            occupied_slots: slots_from_proto(&response.occupied_slots),
            container_count: response.container_count,
            container_limit: response.container_limit,
            schedulable: response.schedulable,
        })
    }
}

/// Resolves an `AgentId` to a `TonicAgentClient`, dialing lazily and caching
/// the connection for reuse across ticks. Looks up each agent's RPC address
/// through the `Registry` rather than keeping its own address book, so a
/// re-registered agent (new `addr`) is picked up the next time its
/// connection is evicted or the process restarts.
pub struct PooledAgentClientResolver {
    registry: Arc<dyn Registry>,
    call_timeout: Duration,
    clients: RwLock<HashMap<AgentId, Arc<dyn AgentClient>>>,
}

impl PooledAgentClientResolver {
    pub fn new(registry: Arc<dyn Registry>, call_timeout: Duration) -> Self {
        Self {
            registry,
            call_timeout,
            clients: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl crate::scheduler::AgentClientResolver for PooledAgentClientResolver {
    async fn resolve(&self, agent_id: &AgentId) -> Result<Arc<dyn AgentClient>> {
        if let Some(client) = self.clients.read().await.get(agent_id) {
            return Ok(client.clone());
        }

        let agent = self.registry.get_agent(agent_id).await?;
        let client: Arc<dyn AgentClient> =
            Arc::new(TonicAgentClient::connect(agent.addr, self.call_timeout).await?);

        self.clients.write().await.insert(agent_id.clone(), client.clone());
        Ok(client)
    }
}
