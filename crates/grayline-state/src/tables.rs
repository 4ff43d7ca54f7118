//! redb table definitions for the Grayline state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Deployment records keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Application records keyed by application name.
pub const APPLICATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");

/// Diagnostic reports keyed by deployment id.
pub const REPORTS: TableDefinition<&str, &[u8]> = TableDefinition::new("reports");
