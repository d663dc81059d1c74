//! fleetplane: lifecycle control plane for multi-cloud Kubernetes clusters
//!
//! Services:
//! - [`autoscaling`] - metric-driven node scaling with pluggable strategies
//! - [`placement`] - zone distribution of new capacity
//! - [`spot`] - spot instance requests and interruption handling
//! - [`upgrade`] - wave-based cluster version upgrades
//! - [`hooks`] - user actions bound to lifecycle events
//! - [`events`] - in-process event bus

pub mod api;
pub mod autoscaling;
pub mod cli;
pub mod config;
pub mod events;
pub mod hooks;
pub mod metrics;
pub mod placement;
pub mod registry;
pub mod spot;
pub mod upgrade;
