//! Scale set snapshots and the tags the reconciler stores on them.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// Resource group tag holding the desired total node count.
pub const TOTAL_NODES_TAG_KEY: &str = "TOTAL_NODES";

/// Scale set tag refreshed every time the scale set is seen at capacity.
pub const LAST_TIME_AT_CAPACITY_TAG_KEY: &str = "LAST_TIME_AT_CAPACITY";

/// Scale set tag marking it frozen; sealed scale sets are never resized.
pub const SEALED_TAG_KEY: &str = "SEALED";

/// Provisioning state reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Succeeded,
    /// Any other state (creating, updating, failed, ...), kept verbatim.
    Other(String),
}

impl ProvisioningState {
    /// Parse the control plane's state string.
    pub fn from_api(state: &str) -> Self {
        if state.eq_ignore_ascii_case("succeeded") {
            Self::Succeeded
        } else {
            Self::Other(state.to_string())
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// One scale set as listed by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleSetSnapshot {
    /// Unique name within the resource group.
    pub name: String,

    /// Current instance count.
    pub capacity: u64,

    /// Provisioning state of the scale set resource.
    pub provisioning_state: ProvisioningState,

    /// Resource tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ScaleSetSnapshot {
    /// Create a snapshot with no tags.
    pub fn new(
        name: impl Into<String>,
        capacity: u64,
        provisioning_state: ProvisioningState,
    ) -> Self {
        Self {
            name: name.into(),
            capacity,
            provisioning_state,
            tags: BTreeMap::new(),
        }
    }

    /// Builder-style tag setter.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.tags.contains_key(SEALED_TAG_KEY)
    }

    /// The `LAST_TIME_AT_CAPACITY` tag, if present.
    ///
    /// Returns `Some(Err(_))` when the tag exists but does not parse.
    pub fn last_time_at_capacity(&self) -> Option<Result<DateTime<Utc>, ReconcileError>> {
        self.tags
            .get(LAST_TIME_AT_CAPACITY_TAG_KEY)
            .map(|value| parse_tag_time(value))
    }
}

/// Format a timestamp for storage in a tag (RFC 3339, nanosecond precision).
pub fn format_tag_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp tag written by [`format_tag_time`] or any RFC 3339 writer.
pub fn parse_tag_time(value: &str) -> Result<DateTime<Utc>, ReconcileError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ReconcileError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}
