//! Agent selector: hard filters followed by a placement strategy.
//!
//! Hard filters (architecture match, schedulable, capacity fit, container
//! headroom) always run first and are never bypassed by strategy choice —
//! only the ordering of the surviving candidates differs between
//! round-robin, concentrated, dispersed and legacy.

use std::cmp::Ordering;

use crate::model::{Agent, ClusterMode, Kernel};
use crate::types::{AgentId, Error, Result};

/// Filters `agents` down to those that can host `kernel`, applying every
/// hard filter unconditionally (§4.4): architecture, schedulable flag,
/// capacity fit, and container-count headroom.
pub fn hard_filter<'a>(agents: &'a [Agent], kernel: &Kernel, architecture: &str) -> Vec<&'a Agent> {
    agents
        .iter()
        .filter(|a| a.architecture == architecture)
        .filter(|a| a.schedulable)
        .filter(|a| a.has_container_headroom())
        .filter(|a| kernel.occupied_slots.fits_within(&a.remaining_capacity()))
        .collect()
}

/// A placement strategy orders the hard-filtered candidate list and returns
/// the first pick.
pub trait AgentSelector: Send + Sync {
    fn name(&self) -> &'static str;
    fn select<'a>(&self, candidates: &[&'a Agent], state: &mut SelectorState) -> Option<AgentId>;
}

/// Mutable cross-call state a strategy may need (round-robin's cursor).
#[derive(Debug, Default)]
pub struct SelectorState {
    last_picked: Option<AgentId>,
}

/// Cycles through agents in id order, resuming after whichever agent was
/// picked last — even spread across a stable agent roster.
pub struct RoundRobinSelector;

impl AgentSelector for RoundRobinSelector {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select<'a>(&self, candidates: &[&'a Agent], state: &mut SelectorState) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }
        let mut sorted: Vec<&&Agent> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));

        let start = match &state.last_picked {
            Some(last) => sorted
                .iter()
                .position(|a| a.id.as_str() > last.as_str())
                .unwrap_or(0),
            None => 0,
        };
        let picked = sorted[start % sorted.len()];
        state.last_picked = Some(picked.id.clone());
        Some(picked.id.clone())
    }
}

/// Picks the candidate with the *least* remaining capacity that still fits —
/// packs sessions onto fewer agents, leaving others free to scale down.
pub struct ConcentratedSelector;

impl AgentSelector for ConcentratedSelector {
    fn name(&self) -> &'static str {
        "concentrated"
    }

    fn select<'a>(&self, candidates: &[&'a Agent], _state: &mut SelectorState) -> Option<AgentId> {
        best_by_capacity(candidates, Ordering::Less)
    }
}

/// Picks the candidate with the *most* remaining capacity — spreads load
/// evenly to reduce the blast radius of any single agent failing.
pub struct DispersedSelector;

impl AgentSelector for DispersedSelector {
    fn name(&self) -> &'static str {
        "dispersed"
    }

    fn select<'a>(&self, candidates: &[&'a Agent], _state: &mut SelectorState) -> Option<AgentId> {
        best_by_capacity(candidates, Ordering::Greater)
    }
}

/// Legacy strategy: first candidate in the order the registry returned it
/// (stable id order), matching the pre-selector-abstraction behavior kept
/// around for deployments pinned to it.
pub struct LegacySelector;

impl AgentSelector for LegacySelector {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn select<'a>(&self, candidates: &[&'a Agent], _state: &mut SelectorState) -> Option<AgentId> {
        candidates.first().map(|a| a.id.clone())
    }
}

/// Ranks candidates by the dominant dimension of their remaining capacity;
/// `want` picks whether the "best" end of that ranking is the smallest or
/// largest remaining-capacity agent.
fn best_by_capacity(candidates: &[&Agent], want: Ordering) -> Option<AgentId> {
    candidates
        .iter()
        .max_by(|a, b| {
            let a_cap = capacity_score(a);
            let b_cap = capacity_score(b);
            let cmp = a_cap.cmp(&b_cap);
            if want == Ordering::Greater {
                cmp
            } else {
                cmp.reverse()
            }
        })
        .map(|a| a.id.clone())
}

/// A coarse, comparable score for an agent's remaining capacity: the sum of
/// all slot quantities it has free. Good enough to rank candidates without
/// needing a full dominant-resource computation at placement time.
fn capacity_score(agent: &Agent) -> rust_decimal::Decimal {
    agent
        .remaining_capacity()
        .slots()
        .map(|(_, v)| v)
        .fold(rust_decimal::Decimal::ZERO, |acc, v| acc + v)
}

/// Looks up the named strategy, defaulting to round-robin for an unknown name.
pub fn strategy_by_name(name: &str) -> Box<dyn AgentSelector> {
    match name {
        "concentrated" => Box::new(ConcentratedSelector),
        "dispersed" => Box::new(DispersedSelector),
        "legacy" => Box::new(LegacySelector),
        _ => Box::new(RoundRobinSelector),
    }
}

/// Applies hard filters then a named strategy, returning the chosen agent or
/// a `Capacity` error describing why no agent qualified.
pub fn select_agent(
    agents: &[Agent],
    kernel: &Kernel,
    architecture: &str,
    strategy_name: &str,
    state: &mut SelectorState,
) -> Result<AgentId> {
    let candidates = hard_filter(agents, kernel, architecture);
    if candidates.is_empty() {
        return Err(Error::capacity(format!(
            "no agent with architecture '{architecture}' has room for kernel {}",
            kernel.id
        )));
    }
    let strategy = strategy_by_name(strategy_name);
    strategy
        .select(&candidates, state)
        .ok_or_else(|| Error::capacity("selector produced no candidate".to_string()))
}

/// Multi-node sessions may spread their kernels across agents of different
/// architectures; a single-node session's kernels must all target the same
/// architecture, since they are required to colocate on one agent (§4.4).
pub fn validate_architecture_homogeneity(
    cluster_mode: ClusterMode,
    architectures: &[String],
) -> Result<()> {
    if cluster_mode != ClusterMode::SingleNode {
        return Ok(());
    }
    let Some(first) = architectures.first() else {
        return Ok(());
    };
    if architectures.iter().any(|a| a != first) {
        return Err(Error::validation(
            "single-node session cannot mix kernel architectures",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionStatus;
    use crate::resource::ResourceSlots;
    use crate::types::{AgentId, KernelId, SessionId};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn agent(id: &str, remaining_cpu: i64) -> Agent {
        Agent {
            id: AgentId::from_string(id.into()).unwrap(),
            addr: "http://127.0.0.1:6001".into(),
            scaling_group: crate::types::ScalingGroupName::from_string("default".into()).unwrap(),
            architecture: "x86_64".into(),
            schedulable: true,
            available_slots: ResourceSlots::from_pairs([("cpu", Decimal::from(remaining_cpu))]),
            occupied_slots: ResourceSlots::new(),
            container_limit: 10,
            container_count: 0,
            last_heartbeat: Utc::now(),
        }
    }

    fn kernel(cpu: i64) -> Kernel {
        Kernel {
            id: KernelId::new(),
            session_id: SessionId::new(),
            agent_id: None,
            status: SessionStatus::Pending,
            occupied_slots: ResourceSlots::from_pairs([("cpu", Decimal::from(cpu))]),
            image: "python:3.11".into(),
            architecture: "x86_64".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn hard_filter_excludes_wrong_architecture() {
        let mut arm = agent("a1", 8);
        arm.architecture = "aarch64".into();
        let agents = vec![arm];
        assert!(hard_filter(&agents, &kernel(1), "x86_64").is_empty());
    }

    #[test]
    fn concentrated_picks_tightest_fit() {
        let agents = vec![agent("a1", 8), agent("a2", 2)];
        let mut state = SelectorState::default();
        let chosen = select_agent(&agents, &kernel(1), "x86_64", "concentrated", &mut state).unwrap();
        assert_eq!(chosen.as_str(), "a2");
    }

    #[test]
    fn dispersed_picks_roomiest() {
        let agents = vec![agent("a1", 8), agent("a2", 2)];
        let mut state = SelectorState::default();
        let chosen = select_agent(&agents, &kernel(1), "x86_64", "dispersed", &mut state).unwrap();
        assert_eq!(chosen.as_str(), "a1");
    }

    #[test]
    fn single_node_rejects_mixed_architectures() {
        let architectures = vec!["x86_64".to_string(), "aarch64".to_string()];
        assert!(validate_architecture_homogeneity(ClusterMode::SingleNode, &architectures).is_err());
    }

    #[test]
    fn multi_node_permits_mixed_architectures() {
        let architectures = vec!["x86_64".to_string(), "aarch64".to_string()];
        assert!(validate_architecture_homogeneity(ClusterMode::MultiNode, &architectures).is_ok());
    }

    #[test]
    fn no_candidate_is_a_capacity_error() {
        let agents = vec![agent("a1", 1)];
        let mut state = SelectorState::default();
        let result = select_agent(&agents, &kernel(10), "x86_64", "round-robin", &mut state);
        assert!(matches!(result, Err(Error::Capacity(_))));
    }
}
