//! Scheduler: the per-scaling-group tick pipeline and its ordering strategies.

mod pipeline;
mod strategy;

pub use pipeline::{AgentClientResolver, Scheduler, SchedulerContext, TickReport, log_tick_report};
pub use strategy::{strategy_by_name, OccupancyByAccessKey, SchedulingStrategy};
