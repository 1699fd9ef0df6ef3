use crate::bus::{EventBus, EventHandler, HandlerId};
use crate::client::Routes;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    pub streaming: bool,
    #[serde(default)]
    pub skill_directories: Vec<String>,
}

impl SessionConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            streaming: true,
            skill_directories: Vec::new(),
        }
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    pub fn with_skill_directory(mut self, dir: impl Into<String>) -> Self {
        self.skill_directories.push(dir.into());
        self
    }

    /// Skill directories are only checked for syntax; the backend resolves them.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("model identifier must not be empty".into()));
        }

        for dir in &self.skill_directories {
            if dir.trim().is_empty() || dir.contains('\0') {
                return Err(Error::Config(format!("invalid skill directory path {:?}", dir)));
            }
        }

        Ok(())
    }
}

/// Instruction payload submitted to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub prompt: String,
}

impl From<String> for Task {
    fn from(prompt: String) -> Self {
        Self { prompt }
    }
}

impl From<&str> for Task {
    fn from(prompt: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Idle,
    Completed,
    TimedOut,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Completed => "completed",
            SessionState::TimedOut => "timed_out",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

type Outcome = Result<()>;

struct WaitState {
    state: SessionState,
    waiter: Option<oneshot::Sender<Outcome>>,
    closed: Option<String>,
}

/// The part of a session the client's router delivers into.
pub(crate) struct SessionShared {
    id: String,
    config: SessionConfig,
    bus: EventBus,
    wait: Mutex<WaitState>,
}

impl SessionShared {
    pub(crate) fn new(id: String, config: SessionConfig) -> Self {
        Self {
            id,
            config,
            bus: EventBus::new(),
            wait: Mutex::new(WaitState {
                state: SessionState::Created,
                waiter: None,
                closed: None,
            }),
        }
    }

    /// Handlers see every event before the waiter inspects it.
    pub(crate) fn deliver(&self, event: &Event) {
        self.bus.dispatch(event);
        if !event.is_terminal() {
            return;
        }

        let outcome = match event {
            Event::SessionError(data) => Err(Error::Session(data.clone())),
            _ => Ok(()),
        };

        let mut wait = self.lock();
        if let Some(waiter) = wait.waiter.take() {
            wait.state = if outcome.is_ok() {
                SessionState::Idle
            } else {
                SessionState::Failed
            };
            let _ = waiter.send(outcome);
        }
    }

    /// Fails a pending wait, if any.
    pub(crate) fn fail(&self, err: Error) {
        let mut wait = self.lock();
        if let Some(waiter) = wait.waiter.take() {
            wait.state = SessionState::Failed;
            let _ = waiter.send(Err(err));
        }
    }

    /// Invalidates the session; later sends fail with a connection error.
    pub(crate) fn close(&self, reason: &str) {
        self.lock().closed = Some(reason.to_string());
        self.fail(Error::Connection(reason.to_string()));
    }

    fn begin(&self) -> Result<oneshot::Receiver<Outcome>> {
        let mut wait = self.lock();
        if let Some(reason) = &wait.closed {
            return Err(Error::Connection(format!(
                "session {} is closed: {}",
                self.id, reason
            )));
        }
        // A sender whose receiver is gone belongs to a call the caller dropped.
        if matches!(wait.waiter.as_ref(), Some(waiter) if !waiter.is_closed()) {
            return Err(Error::InvalidState(format!(
                "session {} already has a task in flight",
                self.id
            )));
        }

        let (tx, rx) = oneshot::channel();
        wait.waiter = Some(tx);
        wait.state = SessionState::Active;
        Ok(rx)
    }

    fn finish(&self, state: SessionState) {
        let mut wait = self.lock();
        wait.waiter = None;
        wait.state = state;
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, WaitState> {
        self.wait.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one backend session. Created by [`crate::Client::create_session`].
pub struct Session {
    shared: Arc<SessionShared>,
    transport: Arc<dyn Transport>,
    routes: Weak<Routes>,
}

impl Session {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        transport: Arc<dyn Transport>,
        routes: Weak<Routes>,
    ) -> Self {
        Self {
            shared,
            transport,
            routes,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn on(&self, handler: impl EventHandler + 'static) -> HandlerId {
        self.shared.bus.register(handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.bus.unregister(id)
    }

    /// Submits `task` and waits for the session to go idle.
    ///
    /// Deltas dispatched before a timeout or failure stay delivered. Only one
    /// call may be in flight per session; a second one fails with
    /// [`Error::InvalidState`] without disturbing the first.
    pub async fn send_and_wait(&self, task: impl Into<Task>, timeout: Duration) -> Result<()> {
        let task = task.into();
        let done = self.shared.begin()?;
        tracing::debug!(session_id = %self.id(), ?timeout, "Sending task");

        if let Err(err) = self.transport.send_task(self.id(), &task).await {
            self.shared.finish(SessionState::Failed);
            return Err(err);
        }

        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(Ok(()))) => {
                self.shared.finish(SessionState::Completed);
                Ok(())
            }
            Ok(Ok(Err(err))) => {
                tracing::debug!(session_id = %self.id(), "Task failed: {}", err);
                Err(err)
            }
            Ok(Err(_)) => {
                self.shared.finish(SessionState::Failed);
                Err(Error::Connection("session was dropped by the client".into()))
            }
            Err(_) => {
                tracing::debug!(session_id = %self.id(), "Task timed out");
                self.shared.finish(SessionState::TimedOut);
                Err(Error::Timeout(timeout))
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(routes) = self.routes.upgrade() {
            routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.shared.id);
        }
        self.transport.release_session(&self.shared.id);
    }
}
