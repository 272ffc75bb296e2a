//! ridgeline-state — embedded state store for Ridgeline.
//!
//! Backed by [redb](https://docs.rs/redb), records what the engine last
//! applied so that the next `plan` can diff against it: resource records,
//! secret metadata, scaling policy runtime state and alarm state.
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns and
//! keyed by resource id (secrets by secret name). Secret plaintext is never
//! stored; [`SecretRecord`] carries only the handle, version and a digest.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
