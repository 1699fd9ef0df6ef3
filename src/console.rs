use crate::bus::{EventHandler, HandlerResult};
use crate::event::Event;
use std::io::{self, Write};
use std::sync::Mutex;

/// Streams assistant deltas to a writer as they arrive.
pub struct ConsoleWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl ConsoleWriter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ConsoleWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventHandler for ConsoleWriter<W> {
    fn handle(&self, event: &Event) -> HandlerResult {
        let mut out = self.out.lock().map_err(|_| "console writer poisoned")?;
        match event {
            Event::AssistantMessageDelta(data) => {
                out.write_all(data.delta_content.as_bytes())?;
            }
            Event::SessionIdle => {
                out.write_all(b"\n\n")?;
            }
            Event::SessionError(data) => {
                writeln!(out, "\nerror: {}", data.message)?;
            }
            _ => return Ok(()),
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_deltas_then_blank_line() {
        let console = ConsoleWriter::new(Vec::new());
        for fragment in ["p", "o", "n", "g"] {
            console.handle(&Event::delta(fragment)).unwrap();
        }
        console.handle(&Event::SessionIdle).unwrap();

        assert_eq!(String::from_utf8(console.into_inner()).unwrap(), "pong\n\n");
    }

    #[test]
    fn ignores_other_events() {
        let console = ConsoleWriter::new(Vec::new());
        console
            .handle(&Event::Unknown {
                kind: "session.usage_info".into(),
                data: serde_json::Value::Null,
            })
            .unwrap();

        assert!(console.into_inner().is_empty());
    }

    #[test]
    fn reports_session_errors() {
        let console = ConsoleWriter::new(Vec::new());
        console.handle(&Event::error("model", "overloaded")).unwrap();

        assert_eq!(
            String::from_utf8(console.into_inner()).unwrap(),
            "\nerror: overloaded\n"
        );
    }
}
