//! Local notification collaborator.
//!
//! Fire-and-forget: notification failures have no effect on the state
//! machine.

use async_trait::async_trait;

use crate::types::CallType;

#[async_trait]
pub trait CallNotifier: Send + Sync {
    /// Show the incoming-call notification.
    async fn incoming_call(&self, caller_name: &str, call_type: CallType);

    /// Dismiss any visible call notification. May be called repeatedly.
    async fn clear(&self);
}

/// Notifier that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl CallNotifier for NoopNotifier {
    async fn incoming_call(&self, _caller_name: &str, _call_type: CallType) {}

    async fn clear(&self) {}
}
