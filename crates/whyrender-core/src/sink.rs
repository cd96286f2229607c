//! Destinations for render events.
//!
//! The tracker hands every [`RenderEvent`] to each configured sink in
//! turn. A sink error is counted and logged by the tracker; it never stops
//! the remaining sinks.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::event::RenderEvent;

pub trait RenderEventSink: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str;

    fn emit(&self, event: &RenderEvent) -> Result<()>;
}

/// Renders events as `tracing` events: `info` normally, `warn` for
/// unnecessary or frequent renders.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl RenderEventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn emit(&self, event: &RenderEvent) -> Result<()> {
        let changed_fields: Vec<&str> = event.state_changes.iter().map(|c| c.field.as_str()).collect();
        let parameters: Vec<&str> = event
            .parameter_changes
            .as_ref()
            .map(|p| p.iter().map(|(name, _)| name).collect())
            .unwrap_or_default();
        if event.is_noteworthy() {
            warn!(
                component = %event.component,
                namespace = %event.namespace,
                instance = %event.instance,
                trigger = %event.trigger,
                first_render = ?event.first_render,
                duration_ms = ?event.duration_ms,
                session_id = ?event.session_id,
                parameters = ?parameters,
                changed_fields = ?changed_fields,
                is_unnecessary = event.is_unnecessary,
                reason = ?event.unnecessary_reason,
                is_frequent = event.is_frequent,
                render_rate = ?event.render_rate,
                "wasteful render"
            );
        } else {
            info!(
                component = %event.component,
                namespace = %event.namespace,
                instance = %event.instance,
                trigger = %event.trigger,
                first_render = ?event.first_render,
                duration_ms = ?event.duration_ms,
                session_id = ?event.session_id,
                parameters = ?parameters,
                changed_fields = ?changed_fields,
                "render"
            );
        }
        Ok(())
    }
}

/// Writes each event as one JSON line.
pub struct JsonLinesSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for JsonLinesSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesSink").finish_non_exhaustive()
    }
}

impl JsonLinesSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Append to (or create) the file at `path`.
    pub fn append_to(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::new(std::io::BufWriter::new(file)))
    }

    pub fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()?;
        Ok(())
    }
}

impl RenderEventSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json-lines"
    }

    fn emit(&self, event: &RenderEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&line).map_err(|err| Error::Sink {
            sink: self.name().to_string(),
            reason: err.to_string(),
        })
    }
}

/// Keeps every event in memory; for tests and embedding hosts.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<RenderEvent>>,
}

impl CollectingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of every collected event, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<RenderEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<RenderEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every collected event.
    pub fn take(&self) -> Vec<RenderEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RenderEventSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    fn emit(&self, event: &RenderEvent) -> Result<()> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

impl<S: RenderEventSink + ?Sized> RenderEventSink for std::sync::Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn emit(&self, event: &RenderEvent) -> Result<()> {
        (**self).emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RenderTrigger;
    use crate::component::{ComponentType, InstanceRegistry};
    use std::sync::Arc;

    struct Counter;

    fn event() -> RenderEvent {
        RenderEvent::builder(
            ComponentType::new::<Counter>("Counter", "App"),
            InstanceRegistry::new().register(),
            RenderTrigger::AfterRender,
        )
        .duration_ms(Some(1.5))
        .build()
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_event() {
        let buf = SharedBuf::default();
        let sink = JsonLinesSink::new(buf.clone());
        sink.emit(&event()).unwrap();
        sink.emit(&event()).unwrap();
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["component"], "Counter");
        assert_eq!(parsed["duration_ms"], 1.5);
    }

    #[test]
    fn json_lines_sink_appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("renders.jsonl");
        let sink = JsonLinesSink::append_to(&path).unwrap();
        sink.emit(&event()).unwrap();
        sink.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn collecting_sink_keeps_events_in_order() {
        let sink = CollectingSink::new();
        sink.emit(&event()).unwrap();
        sink.emit(&event()).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.take().len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn tracing_sink_never_fails() {
        TracingSink.emit(&event()).unwrap();
    }
}
