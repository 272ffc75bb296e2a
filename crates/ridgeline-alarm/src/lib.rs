//! ridgeline-alarm — threshold alarms over provider metric streams.
//!
//! Each alarm resource gets its own monitor task that subscribes to the
//! target's metric and feeds samples into an [`AlarmTracker`].
//!
//! # Architecture
//!
//! ```text
//! AlarmMonitor
//!   ├── Per-alarm background task
//!   │   ├── Provider::stream_metric(target handle, metric)
//!   │   ├── AlarmTracker (consecutive breaches / oks, state)
//!   │   ├── Provider::notify for each action on a transition
//!   │   └── AlarmRecord in the StateStore
//!   └── watch channel per task for shutdown
//! ```
//!
//! # States
//!
//! Alarms start in `INSUFFICIENT_DATA`. `evaluation_periods` consecutive
//! breaching samples move an alarm to `ALARM`; the same number of
//! consecutive non-breaching samples move it to `OK`. An alarm that has
//! seen a full window of samples without reaching `ALARM` reports `OK`
//! rather than waiting for an unbroken run. Transitions are
//! edge-triggered: repeated samples in the same state never notify again.
//! Silence longer than the alarm's staleness window forces
//! `INSUFFICIENT_DATA` whatever the previous state.

pub mod error;
pub mod monitor;
pub mod tracker;

pub use error::{AlarmError, AlarmResult};
pub use monitor::AlarmMonitor;
pub use tracker::{AlarmTracker, Transition};
