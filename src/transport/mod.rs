//! The agent backend seen from the client: connect, create sessions, submit
//! tasks, and an inbound stream of events tagged with their session id.

use crate::error::Result;
use crate::event::Event;
use crate::session::{SessionConfig, Task};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub mod http;
pub mod loopback;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event { session_id: String, event: Event },
    /// One session's stream dropped; the rest of the connection is intact.
    Closed { session_id: String, reason: String },
}

/// Ends when the connection to the backend drops.
pub type InboundStream = BoxStream<'static, Inbound>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<InboundStream>;

    async fn disconnect(&self);

    async fn create_session(&self, config: &SessionConfig) -> Result<String>;

    async fn send_task(&self, session_id: &str, task: &Task) -> Result<()>;

    /// Called when a session handle is dropped.
    fn release_session(&self, _session_id: &str) {}
}
