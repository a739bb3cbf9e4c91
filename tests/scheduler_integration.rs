//! Scenario-level tests driving the scheduler and reconciler together
//! against `MemoryRegistry`, exercising the full tick lifecycle a real
//! deployment would see across several ticks: admission, precondition
//! staging, start, a stale agent being reaped, and termination cleanup.
//!
//! Run with `--features test-harness` so `MockAgentClient` is available
//! outside the crate's own `#[cfg(test)]` build.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sokovan_core::agent_rpc::{AgentClient, MockAgentClient};
use sokovan_core::clock::FixedClock;
use sokovan_core::events::InMemoryEventBus;
use sokovan_core::lock::SharedMemoryLock;
use sokovan_core::model::{Agent, SchedulingPriority, Session, SessionStatus};
use sokovan_core::registry::{ConcurrencyCounter, MemoryRegistry, Registry};
use sokovan_core::resource::ResourceSlots;
use sokovan_core::scheduler::{AgentClientResolver, Scheduler, SchedulerContext};
use sokovan_core::types::{AccessKey, AgentId, Result, ScalingGroupName};

#[derive(Default)]
struct MapCounter(std::sync::Mutex<std::collections::HashMap<AccessKey, u32>>);

#[async_trait::async_trait]
impl ConcurrencyCounter for MapCounter {
    async fn increment(&self, access_key: &AccessKey) -> Result<u32> {
        let mut map = self.0.lock().unwrap();
        let entry = map.entry(access_key.clone()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }
    async fn decrement(&self, access_key: &AccessKey) -> Result<()> {
        let mut map = self.0.lock().unwrap();
        if let Some(entry) = map.get_mut(access_key) {
            *entry = entry.saturating_sub(1);
        }
        Ok(())
    }
    async fn current(&self, access_key: &AccessKey) -> Result<u32> {
        Ok(*self.0.lock().unwrap().get(access_key).unwrap_or(&0))
    }
    async fn rescan(&self, access_key: &AccessKey, authoritative: u32) -> Result<()> {
        self.0.lock().unwrap().insert(access_key.clone(), authoritative);
        Ok(())
    }
}

struct StaticResolver(Arc<dyn AgentClient>);

#[async_trait::async_trait]
impl AgentClientResolver for StaticResolver {
    async fn resolve(&self, _agent_id: &AgentId) -> Result<Arc<dyn AgentClient>> {
        Ok(self.0.clone())
    }
}

fn test_agent(sg: &ScalingGroupName, heartbeat: chrono::DateTime<Utc>) -> Agent {
    Agent {
        id: AgentId::from_string("agent-1".into()).unwrap(),
        addr: "http://127.0.0.1:6001".into(),
        scaling_group: sg.clone(),
        architecture: "x86_64".into(),
        schedulable: true,
        available_slots: ResourceSlots::from_pairs([("cpu", Decimal::from(8))]),
        occupied_slots: ResourceSlots::new(),
        container_limit: 10,
        container_count: 0,
        last_heartbeat: heartbeat,
    }
}

fn happy_path_mock() -> MockAgentClient {
    let mut mock = MockAgentClient::new();
    mock.expect_check_and_pull_image().returning(|_, _, _| Ok(()));
    mock.expect_create_kernels().returning(|_, _, _| Ok(()));
    mock.expect_destroy_kernel().returning(|_, _, _| Ok(()));
    mock
}

fn base_context(_sg: &ScalingGroupName, now: chrono::DateTime<Utc>, mock: MockAgentClient) -> SchedulerContext {
    SchedulerContext {
        registry: Arc::new(MemoryRegistry::new()),
        concurrency_counter: Arc::new(MapCounter::default()),
        agent_clients: Arc::new(StaticResolver(Arc::new(mock))),
        event_bus: Arc::new(InMemoryEventBus::new(32)),
        lock: Arc::new(SharedMemoryLock::new()),
        clock: Arc::new(FixedClock(now)),
        concurrency_limit: 10,
        num_retries_to_skip: 0,
        scheduler_strategy: "fifo".to_string(),
        agent_selection_strategy: "round-robin".to_string(),
        zombie_grace_period: chrono::Duration::seconds(60),
    }
}

#[tokio::test]
async fn session_goes_from_pending_to_terminated_across_ticks() {
    let sg = ScalingGroupName::from_string("default".into()).unwrap();
    let now = Utc::now();

    let ctx = base_context(&sg, now, happy_path_mock());
    ctx.registry.upsert_agent(test_agent(&sg, now)).await.unwrap();

    let session = Session::new(
        AccessKey::from_string("ak1".into()).unwrap(),
        sg.clone(),
        ResourceSlots::from_pairs([("cpu", Decimal::from(2))]),
        SchedulingPriority::default(),
    );
    let session_id = session.id.clone();
    ctx.registry.insert_session(session).await.unwrap();

    let scheduler = Scheduler::new(ctx.clone());

    // Stage A's admission, Stage B's precondition check and Stage C's start
    // all run against the same committed registry state within a single
    // tick, so a session with a ready agent and no dependencies reaches
    // Running in one call.
    let tick1 = scheduler.tick(&sg).await.unwrap().unwrap();
    assert_eq!(tick1.scheduled, 1);
    assert_eq!(tick1.started, 1);
    assert_eq!(
        ctx.registry.get_session(&session_id).await.unwrap().status,
        SessionStatus::Running
    );
    assert_eq!(
        ctx.concurrency_counter
            .current(&AccessKey::from_string("ak1".into()).unwrap())
            .await
            .unwrap(),
        1
    );

    ctx.registry
        .update_session_status(&session_id, SessionStatus::Terminating, None)
        .await
        .unwrap();

    let tick2 = scheduler.tick(&sg).await.unwrap().unwrap();
    assert_eq!(tick2.terminated, 1);
    assert_eq!(
        ctx.registry.get_session(&session_id).await.unwrap().status,
        SessionStatus::Terminated
    );

    assert_eq!(
        ctx.concurrency_counter
            .current(&AccessKey::from_string("ak1".into()).unwrap())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn stale_agent_heartbeat_reaps_its_running_sessions() {
    let sg = ScalingGroupName::from_string("default".into()).unwrap();
    let now = Utc::now();
    let stale_heartbeat = now - chrono::Duration::seconds(600);

    let ctx = base_context(&sg, now, MockAgentClient::new());
    let agent = test_agent(&sg, stale_heartbeat);
    ctx.registry.upsert_agent(agent.clone()).await.unwrap();

    let mut session = Session::new(
        AccessKey::from_string("ak1".into()).unwrap(),
        sg.clone(),
        ResourceSlots::from_pairs([("cpu", Decimal::from(2))]),
        SchedulingPriority::default(),
    );
    session.status = SessionStatus::Running;
    let session_id = session.id.clone();
    ctx.registry.insert_session(session).await.unwrap();

    let kernel = sokovan_core::model::Kernel {
        id: sokovan_core::types::KernelId::new(),
        session_id: session_id.clone(),
        agent_id: Some(agent.id.clone()),
        status: SessionStatus::Running,
        occupied_slots: ResourceSlots::from_pairs([("cpu", Decimal::from(2))]),
        image: "default".into(),
        architecture: "x86_64".into(),
        created_at: now,
    };
    ctx.registry.insert_kernel(kernel).await.unwrap();

    let scheduler = Scheduler::new(ctx.clone());
    let report = scheduler.tick(&sg).await.unwrap().unwrap();

    assert_eq!(report.zombies_reaped, 1);
    assert_eq!(
        ctx.registry.get_session(&session_id).await.unwrap().status,
        SessionStatus::Error
    );
}

#[tokio::test]
async fn multi_node_session_colocates_kernels_and_reaches_running() {
    let sg = ScalingGroupName::from_string("default".into()).unwrap();
    let now = Utc::now();

    let ctx = base_context(&sg, now, happy_path_mock());
    ctx.registry.upsert_agent(test_agent(&sg, now)).await.unwrap();

    let mut session = Session::new(
        AccessKey::from_string("ak1".into()).unwrap(),
        sg.clone(),
        ResourceSlots::from_pairs([("cpu", Decimal::from(1))]),
        SchedulingPriority::default(),
    );
    session.cluster_mode = sokovan_core::model::ClusterMode::MultiNode;
    session.cluster_size = 2;
    let session_id = session.id.clone();
    ctx.registry.insert_session(session).await.unwrap();

    let scheduler = Scheduler::new(ctx.clone());
    let report = scheduler.tick(&sg).await.unwrap().unwrap();
    assert_eq!(report.started, 1);

    let persisted = ctx.registry.get_session(&session_id).await.unwrap();
    assert_eq!(persisted.status, SessionStatus::Running);
    let kernels = ctx.registry.kernels_for_session(&session_id).await.unwrap();
    assert_eq!(kernels.len(), 2);
}
