//! Predicate engine: stateless admissibility checks over a pre-materialized
//! `ValidatorContext`. No predicate performs I/O — every value it needs is
//! gathered once per tick by the scheduler and handed in, generalizing the
//! teacher's small, independently-testable functions in `validation.rs`
//! into a trait with one implementor per check, run unconditionally so every
//! failure is visible rather than short-circuiting on the first one.
//!
//! Capacity/architecture/container-headroom are deliberately absent here:
//! those are placement filters (`crate::selector::hard_filter`), not
//! admissibility predicates — a session can be admissible and still have
//! nowhere to run this tick.

use chrono::{DateTime, Utc};

use crate::model::{Session, SessionKind, SessionStatus};
use crate::registry::ConcurrencyCounter;
use crate::resource::ResourceSlots;
use crate::types::ScalingGroupName;

/// Everything a predicate might need, gathered once per tick so predicates
/// themselves never touch the Registry, an agent, or the clock directly.
#[derive(Debug, Clone)]
pub struct ValidatorContext {
    pub scaling_group: ScalingGroupName,
    pub now: DateTime<Utc>,
    pub current_concurrency: u32,
    pub concurrency_limit: u32,

    pub keypair_occupied: ResourceSlots,
    pub keypair_limit: Option<ResourceSlots>,
    pub user_occupied: ResourceSlots,
    pub user_limit: Option<ResourceSlots>,
    pub group_occupied: ResourceSlots,
    pub group_limit: Option<ResourceSlots>,
    pub domain_occupied: ResourceSlots,
    pub domain_limit: Option<ResourceSlots>,

    pub pending_session_count: u32,
    pub max_pending_session_count: Option<u32>,
    pub pending_session_resource_slots: ResourceSlots,
    pub max_pending_session_resource_slots: Option<ResourceSlots>,

    /// Status of every session this one declares as a dependency.
    pub dependency_statuses: Vec<SessionStatus>,
}

/// A single admissibility failure. Multiple failures for the same session
/// accumulate into a `Vec<PredicateFailure>` rather than short-circuiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateFailure {
    pub predicate: &'static str,
    pub reason: String,
}

impl PredicateFailure {
    fn new(predicate: &'static str, reason: impl Into<String>) -> Self {
        Self {
            predicate,
            reason: reason.into(),
        }
    }
}

/// One admissibility rule. Implementors must not perform I/O — everything
/// needed must already be in `ValidatorContext` or the `Session`.
pub trait Predicate: Send + Sync {
    fn name(&self) -> &'static str;
    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure>;
}

/// Rejects a batch session that declares a future `starts_at` — batch
/// sessions carry their own start-time gate, distinct from admission order.
pub struct ReservedBatchSessionPredicate;

impl Predicate for ReservedBatchSessionPredicate {
    fn name(&self) -> &'static str {
        "reserved_batch_session"
    }

    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        if session.kind != SessionKind::Batch {
            return Ok(());
        }
        if let Some(starts_at) = session.starts_at {
            if ctx.now < starts_at {
                return Err(PredicateFailure::new(
                    self.name(),
                    format!("batch session reserved to start at {starts_at}, now is {}", ctx.now),
                ));
            }
        }
        Ok(())
    }
}

/// Rejects a session whose declared dependencies have not all completed
/// successfully yet.
pub struct DependenciesPredicate;

impl Predicate for DependenciesPredicate {
    fn name(&self) -> &'static str {
        "dependencies"
    }

    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        if session.dependencies.is_empty() {
            return Ok(());
        }
        if !session.dependencies_satisfied(&ctx.dependency_statuses) {
            return Err(PredicateFailure::new(
                self.name(),
                format!("{} dependencies not yet terminated", session.dependencies.len()),
            ));
        }
        Ok(())
    }
}

/// Rejects sessions when the access_key's concurrency counter is at or past
/// the configured limit.
pub struct ConcurrencyLimitPredicate;

impl Predicate for ConcurrencyLimitPredicate {
    fn name(&self) -> &'static str {
        "concurrency_limit"
    }

    fn check(&self, _session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        if ctx.current_concurrency >= ctx.concurrency_limit {
            return Err(PredicateFailure::new(
                self.name(),
                format!(
                    "concurrency limit reached: {}/{}",
                    ctx.current_concurrency, ctx.concurrency_limit
                ),
            ));
        }
        Ok(())
    }
}

/// Rejects a session when `occupancy(access_key) + requested` would exceed
/// the caller's per-keypair resource policy, when one is configured.
pub struct KeypairResourcePolicyPredicate;

impl Predicate for KeypairResourcePolicyPredicate {
    fn name(&self) -> &'static str {
        "keypair_resource_limit"
    }

    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        check_tier_limit(
            self.name(),
            &session.requested_slots,
            &ctx.keypair_occupied,
            &ctx.keypair_limit,
        )
    }
}

/// Rejects a session when the owning user's aggregate occupancy plus this
/// request would exceed the user-level resource policy.
pub struct UserResourceLimitPredicate;

impl Predicate for UserResourceLimitPredicate {
    fn name(&self) -> &'static str {
        "user_resource_limit"
    }

    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        check_tier_limit(
            self.name(),
            &session.requested_slots,
            &ctx.user_occupied,
            &ctx.user_limit,
        )
    }
}

/// Rejects a session when the owning group's aggregate occupancy plus this
/// request would exceed the group-level resource policy.
pub struct GroupResourceLimitPredicate;

impl Predicate for GroupResourceLimitPredicate {
    fn name(&self) -> &'static str {
        "group_resource_limit"
    }

    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        check_tier_limit(
            self.name(),
            &session.requested_slots,
            &ctx.group_occupied,
            &ctx.group_limit,
        )
    }
}

/// Rejects a session when the owning domain's aggregate occupancy plus this
/// request would exceed the domain-level resource policy.
pub struct DomainResourceLimitPredicate;

impl Predicate for DomainResourceLimitPredicate {
    fn name(&self) -> &'static str {
        "domain_resource_limit"
    }

    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        check_tier_limit(
            self.name(),
            &session.requested_slots,
            &ctx.domain_occupied,
            &ctx.domain_limit,
        )
    }
}

fn check_tier_limit(
    name: &'static str,
    requested: &ResourceSlots,
    occupied: &ResourceSlots,
    limit: &Option<ResourceSlots>,
) -> Result<(), PredicateFailure> {
    let Some(limit) = limit else { return Ok(()) };
    let projected = occupied.add(requested);
    if !projected.fits_within(limit) {
        return Err(PredicateFailure::new(
            name,
            format!("occupancy {occupied} + requested {requested} exceeds policy limit {limit}"),
        ));
    }
    Ok(())
}

/// Rejects a session when admitting it would push the access_key's pending
/// session count past its keypair policy's cap.
pub struct PendingSessionCountLimitPredicate;

impl Predicate for PendingSessionCountLimitPredicate {
    fn name(&self) -> &'static str {
        "pending_session_count_limit"
    }

    fn check(&self, _session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        if let Some(max) = ctx.max_pending_session_count {
            if ctx.pending_session_count >= max {
                return Err(PredicateFailure::new(
                    self.name(),
                    format!(
                        "pending session count {} at or past limit {}",
                        ctx.pending_session_count, max
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Rejects a session when the access_key's already-pending resource demand
/// plus this request would exceed the keypair policy's pending-resource cap.
pub struct PendingSessionResourceLimitPredicate;

impl Predicate for PendingSessionResourceLimitPredicate {
    fn name(&self) -> &'static str {
        "pending_session_resource_limit"
    }

    fn check(&self, session: &Session, ctx: &ValidatorContext) -> Result<(), PredicateFailure> {
        check_tier_limit(
            self.name(),
            &session.requested_slots,
            &ctx.pending_session_resource_slots,
            &ctx.max_pending_session_resource_slots,
        )
    }
}

/// Runs every registered predicate against a session and returns every
/// failure — never stops at the first one, per the admission contract.
pub struct PredicateEngine {
    predicates: Vec<Box<dyn Predicate>>,
}

impl PredicateEngine {
    pub fn new() -> Self {
        Self {
            predicates: vec![
                Box::new(ReservedBatchSessionPredicate),
                Box::new(DependenciesPredicate),
                Box::new(ConcurrencyLimitPredicate),
                Box::new(KeypairResourcePolicyPredicate),
                Box::new(UserResourceLimitPredicate),
                Box::new(GroupResourceLimitPredicate),
                Box::new(DomainResourceLimitPredicate),
                Box::new(PendingSessionCountLimitPredicate),
                Box::new(PendingSessionResourceLimitPredicate),
            ],
        }
    }

    pub fn check_all(&self, session: &Session, ctx: &ValidatorContext) -> Vec<PredicateFailure> {
        self.predicates
            .iter()
            .filter_map(|p| p.check(session, ctx).err())
            .collect()
    }
}

impl Default for PredicateEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs gathered from the Registry and policy stores, one per resource tier,
/// that `materialize_context` folds into a `ValidatorContext`.
#[derive(Debug, Clone, Default)]
pub struct TierOccupancy {
    pub keypair_occupied: ResourceSlots,
    pub user_occupied: ResourceSlots,
    pub group_occupied: ResourceSlots,
    pub domain_occupied: ResourceSlots,
}

#[derive(Debug, Clone, Default)]
pub struct TierLimits {
    pub keypair_limit: Option<ResourceSlots>,
    pub user_limit: Option<ResourceSlots>,
    pub group_limit: Option<ResourceSlots>,
    pub domain_limit: Option<ResourceSlots>,
    pub max_pending_session_count: Option<u32>,
    pub max_pending_session_resource_slots: Option<ResourceSlots>,
}

/// Builds a `ValidatorContext` from the fast concurrency counter and the
/// policy/occupancy snapshots the scheduler gathered this tick — the single
/// I/O-performing step the engine itself never does.
#[allow(clippy::too_many_arguments)]
pub async fn materialize_context(
    counter: &dyn ConcurrencyCounter,
    access_key: &crate::types::AccessKey,
    concurrency_limit: u32,
    scaling_group: ScalingGroupName,
    now: DateTime<Utc>,
    occupancy: TierOccupancy,
    limits: TierLimits,
    pending_session_count: u32,
    pending_session_resource_slots: ResourceSlots,
    dependency_statuses: Vec<SessionStatus>,
) -> crate::types::Result<ValidatorContext> {
    let current_concurrency = counter.current(access_key).await?;
    Ok(ValidatorContext {
        scaling_group,
        now,
        current_concurrency,
        concurrency_limit,
        keypair_occupied: occupancy.keypair_occupied,
        keypair_limit: limits.keypair_limit,
        user_occupied: occupancy.user_occupied,
        user_limit: limits.user_limit,
        group_occupied: occupancy.group_occupied,
        group_limit: limits.group_limit,
        domain_occupied: occupancy.domain_occupied,
        domain_limit: limits.domain_limit,
        pending_session_count,
        max_pending_session_count: limits.max_pending_session_count,
        pending_session_resource_slots,
        max_pending_session_resource_slots: limits.max_pending_session_resource_slots,
        dependency_statuses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SchedulingPriority;
    use crate::types::AccessKey;
    use rust_decimal::Decimal;

    fn ctx() -> ValidatorContext {
        ValidatorContext {
            scaling_group: ScalingGroupName::from_string("default".into()).unwrap(),
            now: Utc::now(),
            current_concurrency: 1,
            concurrency_limit: 5,
            keypair_occupied: ResourceSlots::new(),
            keypair_limit: None,
            user_occupied: ResourceSlots::new(),
            user_limit: None,
            group_occupied: ResourceSlots::new(),
            group_limit: None,
            domain_occupied: ResourceSlots::new(),
            domain_limit: None,
            pending_session_count: 0,
            max_pending_session_count: None,
            pending_session_resource_slots: ResourceSlots::new(),
            max_pending_session_resource_slots: None,
            dependency_statuses: Vec::new(),
        }
    }

    fn session(cpu: i64) -> Session {
        Session::new(
            AccessKey::from_string("ak1".into()).unwrap(),
            ScalingGroupName::from_string("default".into()).unwrap(),
            ResourceSlots::from_pairs([("cpu", Decimal::from(cpu))]),
            SchedulingPriority::default(),
        )
    }

    #[test]
    fn all_predicates_run_even_after_first_failure() {
        let mut c = ctx();
        c.current_concurrency = 5; // at limit
        c.keypair_limit = Some(ResourceSlots::from_pairs([("cpu", Decimal::from(4))]));
        let engine = PredicateEngine::new();
        let failures = engine.check_all(&session(32), &c); // also exceeds keypair limit
        assert_eq!(failures.len(), 2);
    }

    #[test]
    fn fits_within_remaining_passes() {
        let engine = PredicateEngine::new();
        let failures = engine.check_all(&session(4), &ctx());
        assert!(failures.is_empty());
    }

    #[test]
    fn keypair_limit_accounts_for_existing_occupancy() {
        let mut c = ctx();
        c.keypair_occupied = ResourceSlots::from_pairs([("cpu", Decimal::from(12))]);
        c.keypair_limit = Some(ResourceSlots::from_pairs([("cpu", Decimal::from(16))]));
        let engine = PredicateEngine::new();
        // occupied 12 + requested 8 = 20 > limit 16
        let failures = engine.check_all(&session(8), &c);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].predicate, "keypair_resource_limit");
    }

    #[test]
    fn batch_session_before_starts_at_is_rejected() {
        let mut s = session(1);
        s.kind = SessionKind::Batch;
        s.starts_at = Some(Utc::now() + chrono::Duration::hours(1));
        let engine = PredicateEngine::new();
        let failures = engine.check_all(&s, &ctx());
        assert!(failures.iter().any(|f| f.predicate == "reserved_batch_session"));
    }

    #[test]
    fn unsatisfied_dependency_is_rejected() {
        let mut s = session(1);
        s.dependencies = vec![crate::types::SessionId::new()];
        let mut c = ctx();
        c.dependency_statuses = vec![SessionStatus::Running];
        let engine = PredicateEngine::new();
        let failures = engine.check_all(&s, &c);
        assert!(failures.iter().any(|f| f.predicate == "dependencies"));
    }

    #[test]
    fn pending_session_count_limit_is_enforced() {
        let mut c = ctx();
        c.pending_session_count = 3;
        c.max_pending_session_count = Some(3);
        let engine = PredicateEngine::new();
        let failures = engine.check_all(&session(1), &c);
        assert!(failures.iter().any(|f| f.predicate == "pending_session_count_limit"));
    }
}
