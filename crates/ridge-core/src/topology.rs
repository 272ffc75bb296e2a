//! `topology.toml` parser.
//!
//! A topology file declares the desired set of resources:
//!
//! ```toml
//! [defaults]
//! region = "us-west-2"
//! tags = { project = "mediacms" }
//!
//! [[resource]]
//! id = "database"
//! kind = "relational_store"
//! [resource.config]
//! engine = "postgres"
//! master_password = { ref = "db_password.handle" }
//!
//! [[resource]]
//! id = "db_password"
//! kind = "secret"
//! value_from_env = "RIDGE_DB_PASSWORD"
//! ```
//!
//! Secret plaintext is pulled out at load time into a [`SecretBundle`]; the
//! secret resource's config keeps only the value's digest.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::defaults::Defaults;
use crate::error::{CoreError, CoreResult};
use crate::policy::{AlarmSpec, ScalingPolicy};
use crate::resource::{Resource, ResourceKind};
use crate::secret::{DigestKey, SecretBundle, SecretValue};
use crate::value::Value;

/// The reference media-stack topology shipped with `ridge init`.
pub const MEDIA_STACK_TOML: &str = include_str!("../topologies/media_stack.toml");

/// On-disk shape of a topology file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyFile {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceDecl>,
}

/// One `[[resource]]` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub id: String,
    pub kind: ResourceKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Secret resources only: environment variable holding the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from_env: Option<String>,
    /// Secret resources only: literal value (demos and tests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
}

/// A loaded, validated desired topology.
#[derive(Debug, Clone)]
pub struct Topology {
    pub defaults: Defaults,
    pub engine: EngineConfig,
    resources: Vec<Resource>,
    secrets: SecretBundle,
}

impl TopologyFile {
    pub fn from_toml_str(s: &str) -> CoreResult<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Build resources, applying defaults and extracting secret values.
    ///
    /// `env` looks up environment variables; tests pass a closure. Secret
    /// values are recorded in config only as a digest under `key`.
    pub fn into_topology<F>(self, env: F, key: &DigestKey) -> CoreResult<Topology>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(self.resources.len());
        let mut secrets = SecretBundle::new();

        for decl in self.resources {
            if !seen.insert(decl.id.clone()) {
                return Err(CoreError::DuplicateId(decl.id));
            }
            let mut config = decl.config;

            if decl.kind == ResourceKind::Secret {
                let value = secret_value(&decl.id, decl.value_from_env.as_deref(), decl.value, &env)?;
                config
                    .entry("secret_name".to_string())
                    .or_insert_with(|| Value::from(decl.id.as_str()));
                config.insert("value_digest".to_string(), Value::from(value.digest(key)));
                secrets.insert(&decl.id, value);
            } else if decl.value_from_env.is_some() || decl.value.is_some() {
                return Err(CoreError::config(
                    &decl.id,
                    "value and value_from_env are only valid on secret resources",
                ));
            }

            let resource = Resource::new(&decl.id, decl.kind, config, &self.defaults)?
                .with_depends_on(decl.depends_on);

            // Surface policy mistakes at load time rather than mid-apply.
            ScalingPolicy::from_resource(&resource)?;
            if resource.kind == ResourceKind::Alarm {
                AlarmSpec::from_resource(&resource)?;
            }

            resources.push(resource);
        }

        debug!(
            resources = resources.len(),
            secrets = secrets.len(),
            "topology loaded"
        );

        Ok(Topology {
            defaults: self.defaults,
            engine: self.engine,
            resources,
            secrets,
        })
    }
}

fn secret_value<F>(
    id: &str,
    from_env: Option<&str>,
    literal: Option<String>,
    env: &F,
) -> CoreResult<SecretValue>
where
    F: Fn(&str) -> Option<String>,
{
    match (from_env, literal) {
        (Some(var), _) => env(var).map(SecretValue::new).ok_or_else(|| {
            CoreError::MissingSecretValue {
                secret: id.to_string(),
                reason: format!("environment variable {var} is not set"),
            }
        }),
        (None, Some(value)) => Ok(SecretValue::new(value)),
        (None, None) => Err(CoreError::MissingSecretValue {
            secret: id.to_string(),
            reason: "declare value_from_env or value".to_string(),
        }),
    }
}

impl Topology {
    /// Load a topology file, reading secret values from the process
    /// environment.
    pub fn from_file(path: &Path, key: &DigestKey) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content, |var| std::env::var(var).ok(), key)
    }

    pub fn from_toml_str<F>(s: &str, env: F, key: &DigestKey) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        TopologyFile::from_toml_str(s)?.into_topology(env, key)
    }

    /// Assemble a topology from already-built resources.
    pub fn new(defaults: Defaults, resources: Vec<Resource>, secrets: SecretBundle) -> Self {
        Self {
            defaults,
            engine: EngineConfig::default(),
            resources,
            secrets,
        }
    }

    /// A topology with no resources (full teardown).
    pub fn empty(defaults: Defaults) -> Self {
        Self::new(defaults, Vec::new(), SecretBundle::new())
    }

    /// Resources in declaration order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn secrets(&self) -> &SecretBundle {
        &self.secrets
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: DigestKey = DigestKey::from_bytes([7; DigestKey::LEN]);

    fn media_env(var: &str) -> Option<String> {
        match var {
            "RIDGE_DB_PASSWORD" => Some("s3cr3t-db".to_string()),
            "RIDGE_APP_SECRET_KEY" => Some("s3cr3t-app".to_string()),
            _ => None,
        }
    }

    #[test]
    fn media_stack_loads() {
        let topo = Topology::from_toml_str(MEDIA_STACK_TOML, media_env, &KEY).unwrap();
        assert_eq!(topo.len(), 10);
        assert_eq!(topo.secrets().len(), 2);
        assert_eq!(topo.engine.parallelism, 4);

        let app = topo.get("app").unwrap();
        assert_eq!(app.kind, ResourceKind::ComputeService);
        let producers = app.producers();
        for p in ["vpc", "lb", "database", "cache", "media_bucket", "db_password", "app_secret_key"] {
            assert!(producers.contains(p), "app should depend on {p}");
        }

        let tags = app.config["tags"].as_map().unwrap();
        assert_eq!(tags["project"], Value::from("mediacms"));
    }

    #[test]
    fn secret_plaintext_never_reaches_config() {
        let topo = Topology::from_toml_str(MEDIA_STACK_TOML, media_env, &KEY).unwrap();
        for r in topo.resources() {
            let json = serde_json::to_string(r).unwrap();
            assert!(!json.contains("s3cr3t"), "{} leaked a secret", r.id);
        }
        let secret = topo.get("db_password").unwrap();
        assert_eq!(
            secret.config["value_digest"],
            Value::from(SecretValue::new("s3cr3t-db").digest(&KEY))
        );
        let other = DigestKey::from_bytes([8; DigestKey::LEN]);
        assert_ne!(
            secret.config["value_digest"],
            Value::from(SecretValue::new("s3cr3t-db").digest(&other))
        );
        assert_eq!(
            topo.secrets().get("db_password").unwrap().expose(),
            "s3cr3t-db"
        );
    }

    #[test]
    fn missing_secret_env_is_an_error() {
        let err = Topology::from_toml_str(MEDIA_STACK_TOML, |_| None, &KEY).unwrap_err();
        assert!(matches!(err, CoreError::MissingSecretValue { .. }));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let toml_str = r#"
[[resource]]
id = "vpc"
kind = "network"

[[resource]]
id = "vpc"
kind = "network"
"#;
        let err = Topology::from_toml_str(toml_str, |_| None, &KEY).unwrap_err();
        assert!(matches!(err, CoreError::DuplicateId(id) if id == "vpc"));
    }

    #[test]
    fn value_on_non_secret_rejected() {
        let toml_str = r#"
[[resource]]
id = "vpc"
kind = "network"
value = "nope"
"#;
        assert!(Topology::from_toml_str(toml_str, |_| None, &KEY).is_err());
    }

    #[test]
    fn unknown_kind_rejected() {
        let toml_str = r#"
[[resource]]
id = "mainframe"
kind = "mainframe"
"#;
        assert!(matches!(
            Topology::from_toml_str(toml_str, |_| None, &KEY),
            Err(CoreError::Parse(_))
        ));
    }

    #[test]
    fn literal_secret_and_explicit_depends_on() {
        let toml_str = r#"
[[resource]]
id = "token"
kind = "secret"
value = "abc"

[[resource]]
id = "app"
kind = "compute_service"
depends_on = ["token"]
"#;
        let topo = Topology::from_toml_str(toml_str, |_| None, &KEY).unwrap();
        assert_eq!(topo.get("token").unwrap().config["secret_name"], Value::from("token"));
        assert!(topo.get("app").unwrap().depends_on.contains("token"));
    }

    #[test]
    fn file_round_trips_through_toml() {
        let file = TopologyFile::from_toml_str(MEDIA_STACK_TOML).unwrap();
        let rendered = file.to_toml_string().unwrap();
        let reparsed = TopologyFile::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.resources.len(), file.resources.len());
        assert_eq!(
            reparsed.resources[0].config,
            file.resources[0].config
        );
    }
}
