use crate::error::{Error, Result};
use crate::session::{Session, SessionConfig, SessionShared};
use crate::transport::{Inbound, InboundStream, Transport};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// Live sessions by backend id; the router delivers into these.
pub(crate) type Routes = Mutex<HashMap<String, Arc<SessionShared>>>;

/// Connection handle and session factory.
///
/// `stop()` must run on every exit path; it fails any pending
/// `send_and_wait` with a connection error instead of leaving it hanging.
pub struct Client {
    transport: Arc<dyn Transport>,
    routes: Arc<Routes>,
    router: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            routes: Arc::new(Mutex::new(HashMap::new())),
            router: tokio::sync::Mutex::new(None),
        }
    }

    /// Fails with [`Error::InvalidState`] if already started.
    pub async fn start(&self) -> Result<()> {
        let mut router = self.router.lock().await;
        if router.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(Error::InvalidState("client is already started".into()));
        }

        let inbound = self.transport.connect().await?;
        *router = Some(tokio::spawn(route(inbound, Arc::clone(&self.routes))));
        tracing::debug!("Connected to agent backend");
        Ok(())
    }

    /// False once stopped or after the backend connection dropped.
    pub async fn is_started(&self) -> bool {
        self.router
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub async fn create_session(&self, config: SessionConfig) -> Result<Session> {
        // Held until the session is routed so a concurrent stop() sees it.
        let router = self.router.lock().await;
        if !router.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(Error::Connection("client is not started".into()));
        }
        config.validate()?;

        let session_id = self.transport.create_session(&config).await?;
        tracing::debug!(session_id = %session_id, model = %config.model, "Session created");

        let shared = Arc::new(SessionShared::new(session_id.clone(), config));
        lock_routes(&self.routes).insert(session_id, Arc::clone(&shared));
        drop(router);

        Ok(Session::new(
            shared,
            Arc::clone(&self.transport),
            Arc::downgrade(&self.routes),
        ))
    }

    /// Releases the transport and invalidates every session. No-op when not
    /// started.
    pub async fn stop(&self) {
        let Some(router) = self.router.lock().await.take() else {
            return;
        };

        let sessions: Vec<_> = lock_routes(&self.routes).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close("client stopped");
        }

        router.abort();
        self.transport.disconnect().await;
        tracing::debug!("Disconnected from agent backend");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Ok(mut router) = self.router.try_lock() {
            if let Some(handle) = router.take() {
                handle.abort();
            }
        }
    }
}

async fn route(mut inbound: InboundStream, routes: Arc<Routes>) {
    while let Some(item) = inbound.next().await {
        match item {
            Inbound::Event { session_id, event } => {
                let session = lock_routes(&routes).get(&session_id).cloned();
                match session {
                    Some(session) => session.deliver(&event),
                    None => {
                        tracing::debug!(session_id = %session_id, kind = %event.kind(), "Dropping event for unknown session");
                    }
                }
            }
            Inbound::Closed { session_id, reason } => {
                tracing::warn!(session_id = %session_id, "Session stream closed: {}", reason);
                let session = lock_routes(&routes).get(&session_id).cloned();
                if let Some(session) = session {
                    session.close(&reason);
                }
            }
        }
    }

    tracing::warn!("Connection to agent backend dropped");
    let sessions: Vec<_> = lock_routes(&routes).values().cloned().collect();
    for session in sessions {
        session.close("connection to agent backend dropped");
    }
}

fn lock_routes(routes: &Routes) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionShared>>> {
    routes.lock().unwrap_or_else(PoisonError::into_inner)
}
