//! Messaging client boundary.
//!
//! The gateway never speaks the messaging protocol itself. A session owns one
//! [`MessagingClient`], created by a [`ClientFactory`] from the session's merged
//! settings, and everything else goes through this trait: method calls, the
//! authorization state, and the update handler slot.

#[cfg(test)]
pub(crate) mod mock;
mod remote;

pub use remote::{RemoteClient, RemoteClientFactory};

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Callback receiving each upstream update once a handler is attached.
pub type UpdateHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Login progress of a session's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationState {
    NotLoggedIn,
    WaitingCode,
    WaitingPassword,
    WaitingSignup,
    LoggedIn,
    LoggedOut,
}

/// Something that resolves a method path (1 to 3 segments) and invokes it.
#[async_trait]
pub trait CallSurface: Send + Sync {
    async fn call(&self, path: &[&str], args: Vec<Value>) -> Result<Value>;
}

/// Handle to one authenticated (or authenticating) messaging client.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Call a high-level client method.
    async fn call(&self, path: &[&str], args: Vec<Value>) -> Result<Value>;

    /// Low-level call surface, reached through the `API` dispatch prefix.
    fn api(&self) -> &dyn CallSurface;

    async fn authorization_state(&self) -> Result<AuthorizationState>;

    /// Start routing upstream updates to `handler`. Replaces any previous handler.
    async fn set_update_handler(&self, handler: UpdateHandler) -> Result<()>;

    /// Stop routing updates. No-op when no handler is attached.
    async fn unset_update_handler(&self);

    /// Release everything the client holds. Called once, on session removal.
    async fn close(&self);
}

/// Builds clients for newly added sessions.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, name: &str, settings: &Value) -> Result<Arc<dyn MessagingClient>>;
}
