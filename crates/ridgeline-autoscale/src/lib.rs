//! ridgeline-autoscale — target-tracking capacity control.
//!
//! Subscribes to a utilization metric for every compute service that
//! declares a `scaling` table and adjusts its `desired_count`.
//!
//! # Scaling Algorithm
//!
//! ```text
//! desired = round(current_capacity * observed / target_value)
//! desired = clamp(desired, min_capacity, max_capacity)
//!
//! if desired > current and now - last_action >= scale_out_cooldown:
//!     ScaleTo(desired)
//! if desired < current and now - last_action >= scale_in_cooldown:
//!     ScaleTo(desired)
//! ```
//!
//! `now` is the sample's own timestamp, so evaluation is deterministic for
//! a given stream. Scale-out cooldowns are normally shorter than scale-in
//! cooldowns, which keeps capacity from oscillating.
//!
//! Each target runs on its own task and owns a mutex around its capacity
//! and last action; nothing is shared between targets. A metric gap longer
//! than the staleness window changes nothing.

pub mod error;
pub mod scaler;
pub mod target;

pub use error::{AutoscaleError, AutoscaleResult};
pub use scaler::Autoscaler;
pub use target::{ScaleDecision, ScalingState, ScalingTarget, evaluate};
