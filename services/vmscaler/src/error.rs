//! Error types for the collaborator boundaries.

use thiserror::Error;

/// Errors returned by the fleet control plane.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// The named resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Any other request failure.
    #[error("request failed: {0}")]
    Request(String),
}

impl CloudError {
    /// Returns true if the resource was missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors reading or writing an integer tag.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TagError {
    /// The resource exists but does not carry the tag.
    #[error("no tag '{tag}' found on '{resource}'")]
    NotFound { resource: String, tag: String },

    /// The tag value is not an integer.
    #[error("tag '{tag}' has non-integer value '{value}'")]
    Malformed { tag: String, value: String },

    /// The underlying control plane call failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl TagError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors returned by the eviction queue.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue service rejected or failed the call.
    #[error("queue request failed: {0}")]
    Request(String),

    /// The pop receipt no longer matches (message redelivered or deleted).
    #[error("message '{0}' not found or receipt expired")]
    MessageNotFound(String),
}

/// Errors produced while draining eviction notices.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DrainError {
    /// The message text is not `<scale set>,<instance id>`.
    #[error("message has incorrect format '{0}'")]
    MalformedMessage(String),
}
