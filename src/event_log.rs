//! Structured per-event logging, grounded on `original_source/include/event-log.h`
//! and dropped by the distillation. One record per lifecycle event lets a
//! downstream consumer correlate everything tied to a single boot or
//! install by its `boot_id`, independent of whatever else is in the
//! `tracing` output at `debug`/`info` level.

use std::fmt;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Boot,
    Install,
    Service,
    WriteSlot,
    BootSel,
}

impl EventKind {
    fn as_str(self) -> &'static str {
        match self {
            EventKind::Boot => "boot",
            EventKind::Install => "install",
            EventKind::Service => "service",
            EventKind::WriteSlot => "writeslot",
            EventKind::BootSel => "bootsel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    Readable,
    ReadableShort,
    Json,
    JsonPretty,
}

#[derive(Debug, Clone)]
pub struct Event<'a> {
    pub kind: EventKind,
    pub boot_id: &'a str,
    pub message: &'a str,
    pub fields: &'a [(&'a str, &'a str)],
}

impl<'a> Event<'a> {
    fn render(&self, format: EventFormat) -> String {
        match format {
            EventFormat::ReadableShort => format!("[{}] {}", self.kind.as_str(), self.message),
            EventFormat::Readable => {
                let mut s = format!(
                    "[{}] boot_id={} {}",
                    self.kind.as_str(),
                    self.boot_id,
                    self.message
                );
                for (k, v) in self.fields {
                    s.push(' ');
                    s.push_str(k);
                    s.push('=');
                    s.push_str(v);
                }
                s
            }
            EventFormat::Json | EventFormat::JsonPretty => {
                let mut obj = serde_json::Map::new();
                obj.insert("type".to_string(), serde_json::Value::String(self.kind.as_str().to_string()));
                obj.insert("boot_id".to_string(), serde_json::Value::String(self.boot_id.to_string()));
                obj.insert("message".to_string(), serde_json::Value::String(self.message.to_string()));
                for (k, v) in self.fields {
                    obj.insert((*k).to_string(), serde_json::Value::String((*v).to_string()));
                }
                let value = serde_json::Value::Object(obj);
                if format == EventFormat::JsonPretty {
                    serde_json::to_string_pretty(&value).unwrap_or_default()
                } else {
                    serde_json::to_string(&value).unwrap_or_default()
                }
            }
        }
    }
}

impl<'a> fmt::Display for Event<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render(EventFormat::Readable))
    }
}

/// Emits an event record through `tracing`, formatted according to the
/// configured style. Kept separate from ad-hoc `tracing::info!` calls so
/// lifecycle events are always structurally complete (kind + boot_id),
/// unlike free-form debug logging elsewhere in the crate.
pub struct EventLog {
    format: EventFormat,
}

impl EventLog {
    pub fn new(format: EventFormat) -> Self {
        EventLog { format }
    }

    pub fn emit(&self, event: Event) {
        info!(target: "event_log", "{}", event.render(self.format));
    }
}

impl Default for EventLog {
    fn default() -> Self {
        EventLog::new(EventFormat::Readable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readable_short_omits_boot_id() {
        let ev = Event {
            kind: EventKind::Install,
            boot_id: "boot-1",
            message: "started",
            fields: &[],
        };
        assert_eq!(ev.render(EventFormat::ReadableShort), "[install] started");
    }

    #[test]
    fn json_includes_all_fields() {
        let ev = Event {
            kind: EventKind::WriteSlot,
            boot_id: "boot-1",
            message: "wrote rootfs.1",
            fields: &[("slot", "rootfs.1")],
        };
        let json = ev.render(EventFormat::Json);
        assert!(json.contains("\"slot\":\"rootfs.1\""));
        assert!(json.contains("\"type\":\"writeslot\""));
    }
}
