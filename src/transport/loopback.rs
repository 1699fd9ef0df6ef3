//! In-process agent backend.
//!
//! [`loopback`] returns the client side (a [`Transport`]) and a
//! [`LoopbackBackend`] handle that plays the backend: it sees created sessions
//! and submitted tasks, emits events, and can fail in the ways a real backend
//! does.

use super::{Inbound, InboundStream, Transport};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::session::{SessionConfig, Task};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTask {
    pub session_id: String,
    pub task: Task,
}

struct BackendState {
    reachable: bool,
    rejection: Option<String>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    connects: usize,
    sessions: Vec<(String, SessionConfig)>,
    released: Vec<String>,
}

type SharedState = Arc<Mutex<BackendState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LoopbackTransport {
    state: SharedState,
    tasks: mpsc::UnboundedSender<SubmittedTask>,
}

#[derive(Clone)]
pub struct LoopbackBackend {
    state: SharedState,
    tasks: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SubmittedTask>>>,
}

pub fn loopback() -> (LoopbackTransport, LoopbackBackend) {
    let state = Arc::new(Mutex::new(BackendState {
        reachable: true,
        rejection: None,
        inbound: None,
        connects: 0,
        sessions: Vec::new(),
        released: Vec::new(),
    }));
    let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();

    (
        LoopbackTransport {
            state: Arc::clone(&state),
            tasks: tasks_tx,
        },
        LoopbackBackend {
            state,
            tasks: Arc::new(tokio::sync::Mutex::new(tasks_rx)),
        },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self) -> Result<InboundStream> {
        let mut state = lock(&self.state);
        if !state.reachable {
            return Err(Error::Connection("agent backend is unreachable".into()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.inbound = Some(tx);
        state.connects += 1;

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) {
        lock(&self.state).inbound = None;
    }

    async fn create_session(&self, config: &SessionConfig) -> Result<String> {
        let mut state = lock(&self.state);
        if state.inbound.is_none() {
            return Err(Error::Connection("not connected".into()));
        }
        if let Some(reason) = &state.rejection {
            return Err(Error::SessionCreation(reason.clone()));
        }

        let session_id = format!("loopback-{}", Uuid::new_v4());
        state.sessions.push((session_id.clone(), config.clone()));
        Ok(session_id)
    }

    async fn send_task(&self, session_id: &str, task: &Task) -> Result<()> {
        if lock(&self.state).inbound.is_none() {
            return Err(Error::Connection("not connected".into()));
        }

        self.tasks
            .send(SubmittedTask {
                session_id: session_id.to_string(),
                task: task.clone(),
            })
            .map_err(|_| Error::Connection("agent backend is gone".into()))
    }

    fn release_session(&self, session_id: &str) {
        lock(&self.state).released.push(session_id.to_string());
    }
}

impl LoopbackBackend {
    /// Returns false when no client is connected.
    pub fn emit(&self, session_id: &str, event: Event) -> bool {
        self.push(Inbound::Event {
            session_id: session_id.to_string(),
            event,
        })
    }

    pub fn close_session(&self, session_id: &str, reason: &str) -> bool {
        self.push(Inbound::Closed {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        })
    }

    /// Ends the inbound stream as if the network went away.
    pub fn drop_connection(&self) {
        lock(&self.state).inbound = None;
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.state).reachable = reachable;
    }

    pub fn reject_sessions(&self, reason: Option<&str>) {
        lock(&self.state).rejection = reason.map(str::to_string);
    }

    /// Next task submitted by any session; `None` once the transport is gone.
    pub async fn next_task(&self) -> Option<SubmittedTask> {
        self.tasks.lock().await.recv().await
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).inbound.is_some()
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn sessions(&self) -> Vec<(String, SessionConfig)> {
        lock(&self.state).sessions.clone()
    }

    pub fn released(&self) -> Vec<String> {
        lock(&self.state).released.clone()
    }

    fn push(&self, item: Inbound) -> bool {
        match &lock(&self.state).inbound {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_reach_the_inbound_stream() {
        let (transport, backend) = loopback();
        let mut inbound = transport.connect().await.unwrap();

        assert!(backend.emit("s1", Event::SessionIdle));
        assert_eq!(
            inbound.next().await,
            Some(Inbound::Event {
                session_id: "s1".into(),
                event: Event::SessionIdle
            })
        );

        backend.drop_connection();
        assert_eq!(inbound.next().await, None);
        assert!(!backend.emit("s1", Event::SessionIdle));
    }

    #[tokio::test]
    async fn unreachable_backend_refuses_connect() {
        let (transport, backend) = loopback();
        backend.set_reachable(false);

        assert!(matches!(transport.connect().await, Err(Error::Connection(_))));
        assert_eq!(backend.connect_count(), 0);
    }

    #[tokio::test]
    async fn records_sessions_and_tasks() {
        let (transport, backend) = loopback();
        let _inbound = transport.connect().await.unwrap();

        let id = transport
            .create_session(&SessionConfig::new("x"))
            .await
            .unwrap();
        transport.send_task(&id, &Task::from("ping")).await.unwrap();

        assert_eq!(backend.sessions().len(), 1);
        let submitted = backend.next_task().await.unwrap();
        assert_eq!(submitted.session_id, id);
        assert_eq!(submitted.task.prompt, "ping");
    }
}
