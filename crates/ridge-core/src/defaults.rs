//! Process-wide defaults applied to every resource at graph-build time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default region and tags.
///
/// Built once when a topology is loaded and handed to every
/// [`Resource::new`](crate::Resource::new) call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_region() -> String {
    "us-west-2".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("managed_by".to_string(), "ridgeline".to_string());
        Self {
            region: default_region(),
            tags,
        }
    }
}

impl Defaults {
    /// Add or replace a default tag.
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }
}
