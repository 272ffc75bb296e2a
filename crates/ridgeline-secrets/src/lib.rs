//! ridgeline-secrets — secret injection coordinator.
//!
//! Secret values enter the engine once, in a [`SecretBundle`], and leave it
//! once, through [`Provider::put_secret`]. Everything downstream sees only
//! the handle the provider returned. Consumers never receive plaintext:
//! before a consumer is created the coordinator grants its execution
//! principal read access, and the consumer's runtime resolves the handle
//! itself.
//!
//! [`SecretBundle`]: ridge_core::SecretBundle
//! [`Provider::put_secret`]: ridgeline_provider::Provider::put_secret

pub mod coordinator;
pub mod error;

pub use coordinator::{SecretCoordinator, secret_outputs};
pub use error::{SecretError, SecretResult};
