use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one streaming session (one conversation surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a fresh random session identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier for one end-to-end run attempt within a session.
///
/// Monotonically increasing per process; run 0 is reserved as "no run".
pub type RunId = u64;

/// Prefix shared by every adapter-minted provisional tool id.
pub const PROVISIONAL_TOOL_PREFIX: &str = "prov:";

/// Mints a provisional tool id for a tool invocation whose canonical id is
/// not known yet. `source` scopes the id to the minting adapter so two
/// concurrent adapters never collide.
#[must_use]
pub fn provisional_tool_id(source: &str, seq: u64) -> String {
    format!("{PROVISIONAL_TOOL_PREFIX}{source}:{seq}")
}

/// Returns true when `id` follows the provisional id scheme.
#[must_use]
pub fn is_provisional_tool_id(id: &str) -> bool {
    id.starts_with(PROVISIONAL_TOOL_PREFIX)
}
