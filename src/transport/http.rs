//! Agent backend over HTTP, with session events as server-sent events.
//!
//! - `POST /sessions` with the session config, answered by `{"session_id"}`
//! - `POST /sessions/{id}/messages` with the task
//! - `GET /sessions/{id}/stream`, one JSON event envelope per `data:` block

use super::{Inbound, InboundStream, Transport};
use crate::error::{Error, Result};
use crate::event::{Event, RawEvent, SessionErrorData};
use crate::session::{SessionConfig, Task};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreateResponse {
    pub session_id: String,
}

struct Link {
    inbound: mpsc::UnboundedSender<Inbound>,
    streams: HashMap<String, JoinHandle<()>>,
}

pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    http: HttpClient,
    link: Mutex<Option<Link>>,
}

/// Explicit token first, then `~/.agentline/token`.
pub fn resolve_token(explicit: Option<String>) -> Option<String> {
    explicit.or_else(|| read_token_file().ok())
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            token: config.token,
            http: HttpClient::new(),
            link: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_stream(&self, session_id: &str) -> Result<Response> {
        let response = self
            .authorized(self.http.get(format!(
                "{}/sessions/{}/stream",
                self.base_url, session_id
            )))
            .send()
            .await
            .map_err(connection_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SessionCreation(format!(
                "failed to open event stream: {} - {}",
                status, body
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<InboundStream> {
        // Any HTTP answer proves the backend is reachable.
        self.authorized(self.http.get(&self.base_url))
            .send()
            .await
            .map_err(|err| {
                Error::Connection(format!("agent backend unreachable at {}: {}", self.base_url, err))
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.link() = Some(Link {
            inbound: tx,
            streams: HashMap::new(),
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn disconnect(&self) {
        if let Some(link) = self.link().take() {
            for (_, stream) in link.streams {
                stream.abort();
            }
        }
    }

    async fn create_session(&self, config: &SessionConfig) -> Result<String> {
        if self.link().is_none() {
            return Err(Error::Connection("not connected".into()));
        }

        let response = self
            .authorized(self.http.post(format!("{}/sessions", self.base_url)))
            .json(config)
            .send()
            .await
            .map_err(connection_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SessionCreation(format!("{} - {}", status, body)));
        }

        let body: SessionCreateResponse = response
            .json()
            .await
            .map_err(|err| Error::SessionCreation(format!("malformed response: {}", err)))?;

        // Subscribe before returning so no event of the first task is missed.
        let stream = self.open_stream(&body.session_id).await?;

        let mut link = self.link();
        let Some(link) = link.as_mut() else {
            return Err(Error::Connection("disconnected while creating session".into()));
        };
        let handle = tokio::spawn(forward_events(
            body.session_id.clone(),
            stream,
            link.inbound.clone(),
        ));
        link.streams.insert(body.session_id.clone(), handle);

        Ok(body.session_id)
    }

    async fn send_task(&self, session_id: &str, task: &Task) -> Result<()> {
        let streaming = self
            .link()
            .as_ref()
            .and_then(|link| link.streams.get(session_id))
            .is_some_and(|stream| !stream.is_finished());
        if !streaming {
            return Err(Error::Connection(format!(
                "event stream for session {} is closed",
                session_id
            )));
        }

        let response = self
            .authorized(self.http.post(format!(
                "{}/sessions/{}/messages",
                self.base_url, session_id
            )))
            .json(task)
            .send()
            .await
            .map_err(connection_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Session(SessionErrorData {
                error_type: format!("http_{}", status.as_u16()),
                message: body,
                stack: None,
            }));
        }

        Ok(())
    }

    fn release_session(&self, session_id: &str) {
        if let Some(link) = self.link().as_mut() {
            if let Some(stream) = link.streams.remove(session_id) {
                stream.abort();
            }
        }
    }
}

async fn forward_events(
    session_id: String,
    response: Response,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();

    let reason = loop {
        let chunk = match stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => break err.to_string(),
            None => break "event stream ended".to_string(),
        };

        for data in decoder.push(&chunk) {
            match serde_json::from_str::<RawEvent>(&data) {
                Ok(raw) => {
                    let event = Event::from_raw(raw);
                    if inbound
                        .send(Inbound::Event {
                            session_id: session_id.clone(),
                            event,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!(session_id = %session_id, "Skipping malformed event: {}", err);
                }
            }
        }
    };

    let _ = inbound.send(Inbound::Closed { session_id, reason });
}

/// Splits an SSE byte stream into the joined `data:` payload of each event.
///
/// Bytes are buffered until an event is complete, so a multi-byte character
/// split across network chunks is decoded whole.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.contains(&b'\r') {
            self.buffer = strip_crlf(&self.buffer);
        }

        let mut events = Vec::new();
        while let Some(idx) = self.buffer.windows(2).position(|pair| pair == b"\n\n") {
            let raw_event: Vec<u8> = self.buffer.drain(..idx + 2).collect();

            if let Some(data) = extract_sse_data(&String::from_utf8_lossy(&raw_event[..idx])) {
                events.push(data);
            }
        }
        events
    }
}

/// Turns `\r\n` into `\n`. A trailing `\r` is kept until its `\n` arrives.
fn strip_crlf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(byte);
    }
    out
}

fn extract_sse_data(raw: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start().to_string());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn connection_error(err: reqwest::Error) -> Error {
    Error::Connection(err.to_string())
}

fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn read_token_file() -> std::io::Result<String> {
    let token = std::fs::read_to_string(token_path())?;
    Ok(token.trim().to_string())
}

fn token_path() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".agentline").join("token");
    }

    PathBuf::from("agentline.token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"type\":\"session").is_empty());
        let events = decoder.push(b".idle\"}\n\n:keep-alive\n\ndata: x\r\n\r\n");
        assert_eq!(events, vec![r#"{"type":"session.idle"}"#, "x"]);
    }

    #[test]
    fn decoder_keeps_characters_split_across_chunks() {
        let body = "data: {\"type\":\"assistant.message_delta\",\"data\":{\"deltaContent\":\"café，\"}}\n\n";
        let split = body.find('é').unwrap() + 1;

        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&body.as_bytes()[..split]).is_empty());
        let events = decoder.push(&body.as_bytes()[split..]);

        assert_eq!(events.len(), 1);
        let event = Event::from_json(&events[0]).unwrap();
        assert_eq!(event.delta_content(), Some("café，"));
    }

    #[test]
    fn crlf_split_across_chunks_still_ends_an_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: a\r\n\r").is_empty());
        assert_eq!(decoder.push(b"\n"), vec!["a"]);
    }

    #[test]
    fn multi_line_data_is_joined() {
        assert_eq!(
            extract_sse_data("event: message\ndata: a\ndata: b"),
            Some("a\nb".to_string())
        );
        assert_eq!(extract_sse_data(": comment"), None);
    }

    #[test]
    fn base_url_drops_trailing_slash() {
        let transport = HttpTransport::new(HttpConfig {
            base_url: "http://localhost:3000///".into(),
            token: None,
        });
        assert_eq!(transport.base_url(), "http://localhost:3000");
    }

    #[test]
    fn explicit_token_wins() {
        assert_eq!(resolve_token(Some("abc".into())), Some("abc".to_string()));
    }
}
