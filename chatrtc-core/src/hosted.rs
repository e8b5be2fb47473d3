//! Hosted conferencing client seam
//!
//! The hosted call flow hands media to a managed conferencing service
//! instead of negotiating a direct connection. Only the client surface the
//! flow needs is modelled here.

use crate::types::CallId;
use async_trait::async_trait;
use thiserror::Error;

/// Hosted service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostedError {
    /// Joining the room failed
    #[error("Failed to join hosted call {call_id}: {reason}")]
    Join {
        /// Room that was joined
        call_id: CallId,
        /// Service-provided reason
        reason: String,
    },

    /// Leaving the room failed
    #[error("Failed to leave hosted call: {0}")]
    Leave(String),
}

/// Client of a managed video conferencing service
#[async_trait]
pub trait HostedCallClient: Send + Sync {
    /// Join the room named after `call_id` with camera and microphone on
    async fn join(&self, call_id: &CallId) -> Result<(), HostedError>;

    /// Leave the current room; no-op when not joined
    async fn leave(&self) -> Result<(), HostedError>;
}
