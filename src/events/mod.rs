//! Event bus: anycast (single consumer-group member) and broadcast (fan-out)
//! delivery over a closed set of event types.
//!
//! The teacher's translation layer dispatched on a string event name looked
//! up in a match arm; that pattern is replaced here with a closed
//! `EventKind` enum so an unhandled or misspelled event name is a compile
//! error instead of a silent no-op at runtime.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::types::{AgentId, EndpointId, KernelId, RouteId, SessionId};

/// A closed union of every event the scheduler core can publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventKind {
    SessionScheduled { session_id: SessionId },
    SessionPreparing { session_id: SessionId },
    SessionRunning { session_id: SessionId },
    SessionTerminated { session_id: SessionId, reason: String },
    SessionCancelled { session_id: SessionId, reason: String },
    KernelCreationFailed { kernel_id: KernelId, reason: String },
    RouteCreated { route_id: RouteId, endpoint_id: EndpointId },
    RouteUnhealthy { route_id: RouteId },
    AgentLost { agent_id: AgentId },
}

/// Delivery mode: `Anycast` hands the event to exactly one member of a named
/// consumer group (round-robined); `Broadcast` fans out to every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Anycast,
    Broadcast,
}

/// Publish/subscribe seam the scheduler, reconciler and agent RPC layer code
/// against. `InMemoryEventBus` is the default implementor; a durable
/// (e.g. NATS/Redis-streams-backed) implementor can satisfy the same trait
/// without the rest of the crate changing.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, delivery: Delivery, event: EventKind);

    /// Registers a new anycast consumer-group member, returning its receiver.
    fn join_group(&self, group: &str) -> mpsc::Receiver<EventKind>;

    /// Registers a new broadcast subscriber.
    fn subscribe(&self) -> broadcast::Receiver<EventKind>;
}

/// In-process event bus: one `mpsc::Sender` per anycast consumer-group
/// member (round-robined on publish) plus one `tokio::sync::broadcast`
/// channel for fan-out subscribers — generalizes the `mpsc`/`oneshot`
/// plumbing the kernel actor uses for command dispatch to a pub/sub shape.
pub struct InMemoryEventBus {
    groups: std::sync::Mutex<std::collections::HashMap<String, GroupMembers>>,
    broadcast_tx: broadcast::Sender<EventKind>,
}

struct GroupMembers {
    senders: Vec<mpsc::Sender<EventKind>>,
    next: usize,
}

impl InMemoryEventBus {
    pub fn new(broadcast_capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(broadcast_capacity);
        Self {
            groups: std::sync::Mutex::new(std::collections::HashMap::new()),
            broadcast_tx,
        }
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, GroupMembers>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const ANYCAST_MAILBOX_CAPACITY: usize = 256;

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, delivery: Delivery, event: EventKind) {
        match delivery {
            Delivery::Broadcast => {
                // No subscribers is not an error — broadcast is fire-and-forget.
                let _ = self.broadcast_tx.send(event);
            }
            Delivery::Anycast => {
                // Pick the next member per group under the lock, then send
                // outside it so a slow/full mailbox never blocks other groups.
                let targets: Vec<mpsc::Sender<EventKind>> = {
                    let mut groups = self.lock_groups();
                    groups
                        .values_mut()
                        .filter(|m| !m.senders.is_empty())
                        .map(|members| {
                            let idx = members.next % members.senders.len();
                            members.next = members.next.wrapping_add(1);
                            members.senders[idx].clone()
                        })
                        .collect()
                };
                for sender in targets {
                    let _ = sender.send(event.clone()).await;
                }
            }
        }
    }

    fn join_group(&self, group: &str) -> mpsc::Receiver<EventKind> {
        let (tx, rx) = mpsc::channel(ANYCAST_MAILBOX_CAPACITY);
        let mut groups = self.lock_groups();
        groups
            .entry(group.to_string())
            .or_insert_with(|| GroupMembers {
                senders: Vec::new(),
                next: 0,
            })
            .senders
            .push(tx);
        rx
    }

    fn subscribe(&self) -> broadcast::Receiver<EventKind> {
        self.broadcast_tx.subscribe()
    }
}
