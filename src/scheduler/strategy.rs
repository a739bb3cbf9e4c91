//! Scheduling strategies: fifo, lifo, drf. Each orders a scaling group's
//! pending sessions for a tick; `num_retries_to_skip` (fifo only) lets a
//! session that has failed predicates repeatedly within a tick cede its
//! place to sessions behind it, rather than blocking the whole queue.

use std::collections::BTreeMap;

use crate::model::Session;
use crate::resource::ResourceSlots;
use crate::types::AccessKey;

/// Per-access_key occupied-slots snapshot the `drf` strategy ranks against.
pub type OccupancyByAccessKey = BTreeMap<AccessKey, ResourceSlots>;

pub trait SchedulingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Orders `sessions` (already filtered to `Pending`) for this tick.
    /// `total_capacity`/`occupied_by_access_key` are only consulted by `drf`.
    fn order(
        &self,
        sessions: Vec<Session>,
        total_capacity: &ResourceSlots,
        occupied_by_access_key: &OccupancyByAccessKey,
    ) -> Vec<Session>;

    /// Whether a session that has failed `consecutive_check_failures` times
    /// this tick should be skipped to the back of the queue rather than
    /// retried immediately after.
    fn should_skip(&self, consecutive_check_failures: u32, num_retries_to_skip: u32) -> bool {
        num_retries_to_skip > 0 && consecutive_check_failures >= num_retries_to_skip
    }
}

/// First-in-first-out by `created_at`. The only strategy that honors
/// `num_retries_to_skip` — lifo/drf ignore it, per the resolved Open Question.
pub struct FifoStrategy;

impl SchedulingStrategy for FifoStrategy {
    fn name(&self) -> &'static str {
        "fifo"
    }

    fn order(
        &self,
        mut sessions: Vec<Session>,
        _total_capacity: &ResourceSlots,
        _occupied_by_access_key: &OccupancyByAccessKey,
    ) -> Vec<Session> {
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }
}

/// Last-in-first-out by `created_at`.
pub struct LifoStrategy;

impl SchedulingStrategy for LifoStrategy {
    fn name(&self) -> &'static str {
        "lifo"
    }

    fn order(
        &self,
        mut sessions: Vec<Session>,
        _total_capacity: &ResourceSlots,
        _occupied_by_access_key: &OccupancyByAccessKey,
    ) -> Vec<Session> {
        sessions.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        sessions
    }

    fn should_skip(&self, _consecutive_check_failures: u32, _num_retries_to_skip: u32) -> bool {
        false
    }
}

/// Dominant-resource-fairness: orders ascending by each access_key's
/// dominant share of the scaling group's total capacity, computed once at
/// tick start from the snapshot handed in, tying on `created_at` ascending
/// (earlier submission wins a tie, per the boundary test this strategy
/// must satisfy).
pub struct DrfStrategy;

impl SchedulingStrategy for DrfStrategy {
    fn name(&self) -> &'static str {
        "drf"
    }

    fn order(
        &self,
        mut sessions: Vec<Session>,
        total_capacity: &ResourceSlots,
        occupied_by_access_key: &OccupancyByAccessKey,
    ) -> Vec<Session> {
        let empty = ResourceSlots::new();
        let share_of = |access_key: &AccessKey| -> rust_decimal::Decimal {
            occupied_by_access_key
                .get(access_key)
                .unwrap_or(&empty)
                .dominant_share(total_capacity)
        };
        sessions.sort_by(|a, b| {
            share_of(&a.access_key)
                .cmp(&share_of(&b.access_key))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        sessions
    }

    fn should_skip(&self, _consecutive_check_failures: u32, _num_retries_to_skip: u32) -> bool {
        false
    }
}

pub fn strategy_by_name(name: &str) -> Box<dyn SchedulingStrategy> {
    match name {
        "lifo" => Box::new(LifoStrategy),
        "drf" => Box::new(DrfStrategy),
        _ => Box::new(FifoStrategy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SchedulingPriority;
    use crate::types::{AccessKey, ScalingGroupName};
    use chrono::Duration;

    fn session_at(offset_secs: i64) -> Session {
        let mut s = Session::new(
            AccessKey::from_string("ak1".into()).unwrap(),
            ScalingGroupName::from_string("default".into()).unwrap(),
            ResourceSlots::new(),
            SchedulingPriority::default(),
        );
        s.created_at += Duration::seconds(offset_secs);
        s
    }

    #[test]
    fn fifo_orders_oldest_first() {
        let sessions = vec![session_at(10), session_at(0), session_at(5)];
        let ordered = FifoStrategy.order(sessions, &ResourceSlots::new(), &OccupancyByAccessKey::new());
        assert_eq!(ordered[0].created_at, ordered.iter().map(|s| s.created_at).min().unwrap());
    }

    #[test]
    fn lifo_orders_newest_first() {
        let sessions = vec![session_at(0), session_at(10), session_at(5)];
        let ordered = LifoStrategy.order(sessions, &ResourceSlots::new(), &OccupancyByAccessKey::new());
        assert_eq!(ordered[0].created_at, ordered.iter().map(|s| s.created_at).max().unwrap());
    }

    #[test]
    fn fifo_skip_policy_requires_nonzero_threshold() {
        assert!(!FifoStrategy.should_skip(3, 0));
        assert!(FifoStrategy.should_skip(3, 3));
    }

    #[test]
    fn lifo_never_skips() {
        assert!(!LifoStrategy.should_skip(100, 1));
    }

    #[test]
    fn drf_ties_break_on_submission_order() {
        use rust_decimal::Decimal;

        let older = session_at(0);
        let newer = session_at(10);
        let total_capacity = ResourceSlots::from_pairs([("cpu", Decimal::from(10))]);
        // Same access_key for both -> identical dominant share -> tie broken by created_at.
        let ordered = DrfStrategy.order(
            vec![newer.clone(), older.clone()],
            &total_capacity,
            &OccupancyByAccessKey::new(),
        );
        assert_eq!(ordered[0].created_at, older.created_at);
    }
}
