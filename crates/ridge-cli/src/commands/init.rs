use std::path::Path;

use anyhow::{Context, bail};

use ridge_core::topology::MEDIA_STACK_TOML;

/// Write the reference media-stack topology to `path`.
pub fn init(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, MEDIA_STACK_TOML)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("✓ Generated {}", path.display());
    println!("  secret values are read from RIDGE_DB_PASSWORD and RIDGE_APP_SECRET_KEY");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ridge_core::{DigestKey, Topology};

    #[test]
    fn writes_loadable_topology_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.toml");

        init(&path, false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let key = DigestKey::from_bytes([7; DigestKey::LEN]);
        let topology =
            Topology::from_toml_str(&content, |_| Some("hunter2".to_string()), &key).unwrap();
        assert_eq!(topology.len(), 10);

        assert!(init(&path, false).is_err());
        init(&path, true).unwrap();
    }
}
