//! The secret coordinator.
//!
//! Tracks every secret the engine has stored in the state store's `secrets`
//! table: handle, current version, value digest and the principals granted
//! read access. The digest lets a re-apply tell an unchanged secret (no
//! provider call) from a rotated one (new version, same handle).

use std::sync::Arc;

use tracing::{debug, info};

use ridge_core::{Resource, ResourceKind, SecretBundle, SecretValue, Value};
use ridgeline_provider::{Outputs, Provider, RetryPolicy};
use ridgeline_state::{SecretRecord, StateStore, unix_now};

use crate::error::{SecretError, SecretResult};

/// Stores secrets with the provider and grants consumers access to them.
#[derive(Clone)]
pub struct SecretCoordinator {
    provider: Arc<dyn Provider>,
    store: StateStore,
    retry: RetryPolicy,
}

impl SecretCoordinator {
    pub fn new(provider: Arc<dyn Provider>, store: StateStore) -> Self {
        Self {
            provider,
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Store `value` under `name` and return its record.
    ///
    /// Idempotent: if the stored digest already matches, nothing is sent
    /// to the provider. A different digest rotates the secret.
    pub async fn create_secret(&self, name: &str, value: &SecretValue) -> SecretResult<SecretRecord> {
        let digest = value.digest(&self.store.digest_key()?);
        match self.store.get_secret(name)? {
            Some(existing) if existing.value_digest == digest => {
                debug!(secret = name, version = existing.version, "secret unchanged");
                Ok(existing)
            }
            Some(_) => self.rotate(name, value).await,
            None => {
                let stored = self
                    .retry
                    .run("put_secret", || self.provider.put_secret(name, value))
                    .await?;
                let record = SecretRecord {
                    name: name.to_string(),
                    handle: stored.handle,
                    version: stored.version,
                    value_digest: digest,
                    access_policy: Default::default(),
                    updated_at: unix_now(),
                };
                self.store.put_secret(&record)?;
                info!(secret = name, handle = %record.handle, "secret created");
                Ok(record)
            }
        }
    }

    /// Store a new version of an existing secret. The handle is unchanged,
    /// so consumers pick up the new value without being updated.
    pub async fn rotate(&self, name: &str, value: &SecretValue) -> SecretResult<SecretRecord> {
        let mut record = self
            .store
            .get_secret(name)?
            .ok_or_else(|| SecretError::UnknownSecret(name.to_string()))?;
        let stored = self
            .retry
            .run("put_secret", || self.provider.put_secret(name, value))
            .await?;
        record.handle = stored.handle;
        record.version = stored.version;
        record.value_digest = value.digest(&self.store.digest_key()?);
        record.updated_at = unix_now();
        self.store.put_secret(&record)?;
        info!(secret = name, version = record.version, "secret rotated");
        Ok(record)
    }

    /// Allow `principal` to read the secret behind `handle`.
    pub async fn grant_access(&self, handle: &str, principal: &str) -> SecretResult<()> {
        let mut record = self
            .store
            .find_secret_by_handle(handle)?
            .ok_or_else(|| SecretError::UnknownSecret(handle.to_string()))?;
        if record.access_policy.contains(principal) {
            return Ok(());
        }
        self.retry
            .run("grant_access", || self.provider.grant_access(handle, principal))
            .await?;
        record.access_policy.insert(principal.to_string());
        record.updated_at = unix_now();
        self.store.put_secret(&record)?;
        info!(secret = %record.name, principal, "secret access granted");
        Ok(())
    }

    /// Create or rotate the secret behind a `secret` resource and return
    /// the outputs its consumers reference (`handle`, `version`).
    pub async fn materialize(
        &self,
        resource: &Resource,
        bundle: &SecretBundle,
    ) -> SecretResult<Outputs> {
        debug_assert_eq!(resource.kind, ResourceKind::Secret);
        let name = resource
            .config
            .get("secret_name")
            .and_then(Value::as_str)
            .ok_or_else(|| SecretError::MissingName(resource.id.clone()))?;
        let value = bundle
            .get(&resource.id)
            .ok_or_else(|| SecretError::MissingValue(resource.id.clone()))?;

        let record = self.create_secret(name, value).await?;
        Ok(secret_outputs(&record))
    }

    /// Grant `consumer`'s execution principal access to each secret handle
    /// it references.
    pub async fn authorize_consumer(
        &self,
        consumer: &Resource,
        handles: &[String],
    ) -> SecretResult<()> {
        let principal = consumer.execution_principal();
        for handle in handles {
            self.grant_access(handle, &principal).await?;
        }
        Ok(())
    }

    /// Drop the record for a destroyed secret resource.
    pub fn forget(&self, name: &str) -> SecretResult<bool> {
        Ok(self.store.delete_secret(name)?)
    }
}

/// The outputs a secret resource exposes.
pub fn secret_outputs(record: &SecretRecord) -> Outputs {
    let mut outputs = Outputs::new();
    outputs.insert("handle".to_string(), Value::from(record.handle.as_str()));
    outputs.insert("version".to_string(), Value::Int(i64::from(record.version)));
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use ridge_core::{Defaults, Topology};
    use ridgeline_provider::{ProviderCall, SimulatedProvider};

    fn setup() -> (SimulatedProvider, StateStore, SecretCoordinator) {
        let sim = SimulatedProvider::new();
        let store = StateStore::open_in_memory().unwrap();
        let coordinator = SecretCoordinator::new(Arc::new(sim.clone()), store.clone())
            .with_retry(RetryPolicy::no_retry());
        (sim, store, coordinator)
    }

    fn consumer(role: Option<&str>) -> Resource {
        let mut config = BTreeMap::new();
        if let Some(role) = role {
            config.insert("execution_role".to_string(), Value::from(role));
        }
        Resource::new("app", ResourceKind::ComputeService, config, &Defaults::default()).unwrap()
    }

    #[tokio::test]
    async fn secret_round_trip_for_granted_principal() {
        let (sim, _store, coordinator) = setup();
        let record = coordinator
            .create_secret("db_password", &SecretValue::new("correct-horse"))
            .await
            .unwrap();

        coordinator
            .authorize_consumer(&consumer(Some("app-task")), &[record.handle.clone()])
            .await
            .unwrap();

        let resolved = sim.resolve_secret(&record.handle, "app-task").unwrap();
        assert_eq!(resolved.expose(), "correct-horse");
    }

    #[tokio::test]
    async fn ungranted_principal_is_denied() {
        let (sim, _store, coordinator) = setup();
        let record = coordinator
            .create_secret("db_password", &SecretValue::new("correct-horse"))
            .await
            .unwrap();
        coordinator
            .grant_access(&record.handle, "app-execution")
            .await
            .unwrap();

        assert!(sim.resolve_secret(&record.handle, "intruder").is_err());
    }

    #[tokio::test]
    async fn denied_grant_surfaces_as_access_denied() {
        let (sim, _store, coordinator) = setup();
        let record = coordinator
            .create_secret("db_password", &SecretValue::new("v"))
            .await
            .unwrap();
        sim.deny_grants_to("app-execution");

        let err = coordinator
            .authorize_consumer(&consumer(None), &[record.handle])
            .await
            .unwrap_err();
        assert!(err.is_access_denied());
    }

    #[tokio::test]
    async fn unchanged_value_makes_no_provider_call() {
        let (sim, _store, coordinator) = setup();
        let value = SecretValue::new("same");
        let first = coordinator.create_secret("key", &value).await.unwrap();
        let second = coordinator.create_secret("key", &value).await.unwrap();

        assert_eq!(first, second);
        let puts = sim
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ProviderCall::PutSecret { .. }))
            .count();
        assert_eq!(puts, 1);
    }

    #[tokio::test]
    async fn new_digest_rotates_and_keeps_handle() {
        let (sim, store, coordinator) = setup();
        let first = coordinator
            .create_secret("key", &SecretValue::new("old"))
            .await
            .unwrap();
        coordinator.grant_access(&first.handle, "app-execution").await.unwrap();

        let second = coordinator
            .create_secret("key", &SecretValue::new("new"))
            .await
            .unwrap();
        assert_eq!(second.handle, first.handle);
        assert_eq!(second.version, 2);
        assert!(second.access_policy.contains("app-execution"));
        assert_eq!(
            sim.resolve_secret(&second.handle, "app-execution").unwrap().expose(),
            "new"
        );
        assert_eq!(store.get_secret("key").unwrap(), Some(second));
    }

    #[tokio::test]
    async fn rotate_unknown_secret_fails() {
        let (_sim, _store, coordinator) = setup();
        let err = coordinator
            .rotate("missing", &SecretValue::new("v"))
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::UnknownSecret(_)));
    }

    #[tokio::test]
    async fn materialize_secret_resource_from_topology() {
        let toml_str = r#"
[[resource]]
id = "db_password"
kind = "secret"
value = "pg-pass-123"
"#;
        let (_sim, store, coordinator) = setup();
        let key = store.digest_key().unwrap();
        let topo = Topology::from_toml_str(toml_str, |_| None, &key).unwrap();

        let resource = topo.get("db_password").unwrap();
        let outputs = coordinator
            .materialize(resource, topo.secrets())
            .await
            .unwrap();
        assert_eq!(outputs["version"], Value::Int(1));
        assert!(outputs["handle"].as_str().unwrap().starts_with("secret-"));

        // Only the digest is persisted.
        let record = store.get_secret("db_password").unwrap().unwrap();
        assert_eq!(record.value_digest, SecretValue::new("pg-pass-123").digest(&key));
        assert_eq!(resource.config["value_digest"], Value::from(record.value_digest.as_str()));
        assert!(!format!("{record:?}").contains("pg-pass-123"));
    }

    #[tokio::test]
    async fn materialize_without_value_fails() {
        let (_sim, _store, coordinator) = setup();
        let mut config = BTreeMap::new();
        config.insert("secret_name".to_string(), Value::from("orphan"));
        let resource =
            Resource::new("orphan", ResourceKind::Secret, config, &Defaults::default()).unwrap();
        let err = coordinator
            .materialize(&resource, &SecretBundle::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SecretError::MissingValue(_)));
    }
}
