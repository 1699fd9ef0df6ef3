//! Streaming client for remote agent sessions.
//!
//! A [`Client`] owns the connection to an agent backend and creates
//! [`Session`]s. Handlers registered on a session see every [`Event`] in
//! order; [`Session::send_and_wait`] submits a task and resolves when the
//! session goes idle, fails, or the timeout elapses.

pub mod bus;
pub mod client;
pub mod console;
pub mod error;
pub mod event;
pub mod session;
pub mod transport;

pub use bus::{EventBus, EventHandler, HandlerId, HandlerResult};
pub use client::Client;
pub use console::ConsoleWriter;
pub use error::{Error, HandlerError, Result};
pub use event::{Event, EventKind, RawEvent};
pub use session::{Session, SessionConfig, SessionState, Task};
pub use transport::{Inbound, InboundStream, Transport};
