//! Scheduler tick throughput benchmark: admits and starts a batch of
//! pending sessions against an in-memory registry and a mocked agent,
//! isolating the pipeline's own overhead from storage and RPC latency.

use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rust_decimal::Decimal;
use sokovan_core::agent_rpc::{AgentClient, MockAgentClient};
use sokovan_core::clock::FixedClock;
use sokovan_core::events::InMemoryEventBus;
use sokovan_core::lock::SharedMemoryLock;
use sokovan_core::model::{Agent, SchedulingPriority, Session};
use sokovan_core::registry::{ConcurrencyCounter, MemoryRegistry, Registry};
use sokovan_core::resource::ResourceSlots;
use sokovan_core::scheduler::{AgentClientResolver, Scheduler, SchedulerContext};
use sokovan_core::types::{AccessKey, AgentId, Result, ScalingGroupName};

#[derive(Default)]
struct NullCounter;

#[async_trait::async_trait]
impl ConcurrencyCounter for NullCounter {
    async fn increment(&self, _access_key: &AccessKey) -> Result<u32> {
        Ok(0)
    }
    async fn decrement(&self, _access_key: &AccessKey) -> Result<()> {
        Ok(())
    }
    async fn current(&self, _access_key: &AccessKey) -> Result<u32> {
        Ok(0)
    }
    async fn rescan(&self, _access_key: &AccessKey, _authoritative: u32) -> Result<()> {
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

fn build_context(agent_count: usize) -> (SchedulerContext, ScalingGroupName) {
    let mut mock = MockAgentClient::new();
    mock.expect_check_and_pull_image()
        .returning(|_, _, _| Box::pin(async { Ok(()) }));
    mock.expect_create_kernels().returning(|_, _, _| Box::pin(async { Ok(()) }));

    let sg = ScalingGroupName::from_string("default".into()).unwrap();
    let ctx = SchedulerContext {
        registry: Arc::new(MemoryRegistry::new()),
        concurrency_counter: Arc::new(NullCounter),
        agent_clients: Arc::new(StaticResolver(Arc::new(mock))),
        event_bus: Arc::new(InMemoryEventBus::new(1024)),
        lock: Arc::new(SharedMemoryLock::new()),
        clock: Arc::new(FixedClock(Utc::now())),
        concurrency_limit: u32::MAX,
        num_retries_to_skip: 0,
        scheduler_strategy: "fifo".to_string(),
        agent_selection_strategy: "round-robin".to_string(),
        zombie_grace_period: chrono::Duration::seconds(600),
    };

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        for i in 0..agent_count {
            let agent = Agent {
                id: AgentId::from_string(format!("agent-{i}")).unwrap(),
                addr: format!("http://127.0.0.1:{}", 6000 + i),
                scaling_group: sg.clone(),
                architecture: "x86_64".into(),
                schedulable: true,
                available_slots: ResourceSlots::from_pairs([("cpu", Decimal::from(1_000))]),
                occupied_slots: ResourceSlots::new(),
                container_limit: 1000,
                container_count: 0,
                last_heartbeat: Utc::now(),
            };
            ctx.registry.upsert_agent(agent).await.unwrap();
        }
    });

    (ctx, sg)
}

fn bench_tick(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("scheduler_tick");

    for &batch_size in &[10usize, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            b.iter_batched(
                || {
                    let (ctx, sg) = build_context(8);
                    rt.block_on(async {
                        for _ in 0..batch_size {
                            let session = Session::new(
                                AccessKey::from_string("ak1".into()).unwrap(),
                                sg.clone(),
                                ResourceSlots::from_pairs([("cpu", Decimal::from(1))]),
                                SchedulingPriority::default(),
                            );
                            ctx.registry.insert_session(session).await.unwrap();
                        }
                    });
                    (Scheduler::new(ctx), sg)
                },
                |(scheduler, sg)| {
                    rt.block_on(async { scheduler.tick(&sg).await.unwrap() });
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tick);
criterion_main!(benches);
