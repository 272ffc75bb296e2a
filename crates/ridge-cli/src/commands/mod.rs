pub mod apply;
pub mod init;
pub mod monitor;
pub mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, warn};

use ridge_core::topology::TopologyFile;
use ridge_core::{EngineConfig, Topology};
use ridgeline_executor::Executor;
use ridgeline_provider::SimulatedProvider;
use ridgeline_state::StateStore;

const STATE_FILE: &str = "state.redb";
const PROVIDER_FILE: &str = "provider.json";

/// Flags shared by every command.
pub struct Options {
    pub topology: PathBuf,
    pub data_dir: PathBuf,
    pub parallelism: Option<usize>,
}

impl Options {
    /// Load the topology. Secret values are digested under the
    /// workspace's key.
    pub fn load_topology(&self, ws: &Workspace) -> anyhow::Result<Topology> {
        let key = ws.store.digest_key().context("reading secret digest key")?;
        Topology::from_file(&self.topology, &key)
            .with_context(|| format!("loading topology {}", self.topology.display()))
    }

    /// `[engine]` settings of the topology, or the defaults when it cannot
    /// be read (teardown and monitoring work without one). Secret values
    /// are not needed here.
    pub fn engine_settings(&self) -> EngineConfig {
        let file = std::fs::read_to_string(&self.topology)
            .map_err(anyhow::Error::from)
            .and_then(|content| Ok(TopologyFile::from_toml_str(&content)?));
        match file {
            Ok(file) => file.engine,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "topology unavailable, using default engine settings");
                EngineConfig::default()
            }
        }
    }
}

/// State store and provider living under the data directory.
pub struct Workspace {
    pub store: StateStore,
    pub provider: SimulatedProvider,
    provider_path: PathBuf,
}

impl Workspace {
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;

        let state_path = data_dir.join(STATE_FILE);
        let store = StateStore::open(&state_path)
            .with_context(|| format!("opening state store {}", state_path.display()))?;

        let provider_path = data_dir.join(PROVIDER_FILE);
        let provider = SimulatedProvider::load(&provider_path)
            .with_context(|| format!("loading provider snapshot {}", provider_path.display()))?;
        debug!(data_dir = %data_dir.display(), live = provider.live_count(), "workspace opened");

        Ok(Self {
            store,
            provider,
            provider_path,
        })
    }

    pub fn executor(&self, engine: &EngineConfig, parallelism: Option<usize>) -> Executor {
        let executor = Executor::from_config(Arc::new(self.provider.clone()), self.store.clone(), engine);
        match parallelism {
            Some(n) => executor.with_parallelism(n),
            None => executor,
        }
    }

    /// Persist provider-side resources for the next invocation.
    pub fn save(&self) -> anyhow::Result<()> {
        self.provider
            .save(&self.provider_path)
            .with_context(|| format!("saving provider snapshot {}", self.provider_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"
[defaults]
region = "us-west-2"
tags = { project = "demo" }

[[resource]]
id = "net"
kind = "network"
[resource.config]
cidr_block = "10.0.0.0/16"

[[resource]]
id = "db_password"
kind = "secret"
value = "hunter2"

[[resource]]
id = "db"
kind = "relational_store"
[resource.config]
engine = "postgres"
subnet_ids = { ref = "net.private_subnet_ids" }
master_password = { ref = "db_password.handle" }
"#;

    fn options(dir: &Path) -> Options {
        let topology = dir.join("topology.toml");
        std::fs::write(&topology, TOPOLOGY).unwrap();
        Options {
            topology,
            data_dir: dir.join("data"),
            parallelism: Some(2),
        }
    }

    #[tokio::test]
    async fn apply_then_plan_across_runs_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let opts = options(dir.path());

        apply::apply(&opts, false).await.unwrap();

        // A fresh process reopens the same store and provider.
        let ws = Workspace::open(&opts.data_dir).unwrap();
        assert_eq!(ws.provider.live_count(), 2);
        let topology = opts.load_topology(&ws).unwrap();
        let executor = ws.executor(&topology.engine, opts.parallelism);
        let (plan, drift) = executor.plan_with_drift(&topology).await.unwrap();
        assert!(drift.is_empty());
        assert!(plan.is_noop());
        drop(executor);
        drop(ws);

        apply::destroy(&opts).await.unwrap();
        let ws = Workspace::open(&opts.data_dir).unwrap();
        assert_eq!(ws.provider.live_count(), 0);
        assert!(ws.store.list_resources().unwrap().is_empty());
    }

    #[test]
    fn missing_topology_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let opts = Options {
            topology: dir.path().join("nope.toml"),
            data_dir: dir.path().join("data"),
            parallelism: None,
        };
        let ws = Workspace::open(&opts.data_dir).unwrap();
        let err = opts.load_topology(&ws).unwrap_err();
        assert!(format!("{err:#}").contains("nope.toml"));
        assert_eq!(opts.engine_settings(), EngineConfig::default());
    }

    #[test]
    fn engine_settings_need_no_secret_values() {
        let dir = tempfile::tempdir().unwrap();
        let topology = dir.path().join("topology.toml");
        std::fs::write(
            &topology,
            "[engine]\nparallelism = 3\n\n[[resource]]\nid = \"pw\"\nkind = \"secret\"\nvalue_from_env = \"RIDGE_TEST_UNSET_VAR\"\n",
        )
        .unwrap();
        let opts = Options {
            topology,
            data_dir: dir.path().join("data"),
            parallelism: None,
        };
        assert_eq!(opts.engine_settings().parallelism, 3);
    }
}
