//! redb table definitions for the Ridgeline state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Applied resources keyed by resource id.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// Secret metadata keyed by secret name.
pub const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Scaling runtime state keyed by target resource id.
pub const SCALING_POLICIES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("scaling_policies");

/// Alarm state keyed by alarm resource id.
pub const ALARMS: TableDefinition<&str, &[u8]> = TableDefinition::new("alarms");

/// Workspace-wide settings. Values are raw bytes, not JSON.
pub const SETTINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Key under [`SETTINGS`] holding the secret digest key.
pub const DIGEST_KEY: &str = "secret_digest_key";
