//! Record formatters plugged into `tracing_subscriber` fmt layers.
//!
//! `tracing` fields only support static names, so the context fields of a
//! handle travel through a thread-local bound by [`scoped`] around each
//! emission. Formatters run synchronously on the emitting thread and read it
//! from there.
use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use colored::Colorize;
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::registry::LookupSpan;

/// Event field holding the `file:line` of the logging call.
pub const CALLER_FIELD: &str = "caller";

/// Context fields bound to one logger handle.
pub type Fields = Map<String, Value>;

thread_local! {
    static CONTEXT: RefCell<Option<Arc<Fields>>> = const { RefCell::new(None) };
}

struct RestoreContext(Option<Arc<Fields>>);

impl Drop for RestoreContext {
    fn drop(&mut self) {
        let previous = self.0.take();
        CONTEXT.with(|slot| *slot.borrow_mut() = previous);
    }
}

/// Run `emit` with `context` attached to every record it produces on this thread.
pub(crate) fn scoped<R>(context: &Arc<Fields>, emit: impl FnOnce() -> R) -> R {
    let previous = CONTEXT.with(|slot| slot.replace(Some(Arc::clone(context))));
    let _restore = RestoreContext(previous);
    emit()
}

fn bound_context() -> Arc<Fields> {
    CONTEXT
        .with(|slot| slot.borrow().clone())
        .unwrap_or_default()
}

/// Offset used for timestamps, resolved once while the process may still be
/// single-threaded. Falls back to UTC when the local offset is unknown.
pub fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}

/// Message and call site extracted from an event.
#[derive(Default)]
struct RecordVisitor {
    message: String,
    caller: Option<String>,
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            CALLER_FIELD => self.caller = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            CALLER_FIELD => self.caller = Some(format!("{value:?}")),
            _ => {}
        }
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

/// One JSON object per line: `level`, `time`, `caller`, context, `message`.
pub struct JsonRecord {
    offset: UtcOffset,
}

impl JsonRecord {
    /// Formatter stamping records in `offset`.
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    fn render(
        &self,
        level: &Level,
        at: OffsetDateTime,
        context: &Fields,
        visitor: RecordVisitor,
    ) -> Fields {
        let mut record = Map::new();
        record.insert("level".into(), level_name(level).into());
        if let Ok(time) = at.format(&Rfc3339) {
            record.insert("time".into(), time.into());
        }
        if let Some(caller) = visitor.caller {
            record.insert(CALLER_FIELD.into(), caller.into());
        }
        for (key, value) in context {
            record.entry(key.clone()).or_insert_with(|| value.clone());
        }
        record.insert("message".into(), visitor.message.into());
        record
    }
}

impl<S, N> FormatEvent<S, N> for JsonRecord
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let context = bound_context();
        let record = self.render(event.metadata().level(), self.now(), &context, visitor);
        let line = serde_json::to_string(&record).map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

/// Human-readable line: `<time> <LVL> <caller> > <message> key=value ...`.
pub struct ConsoleRecord {
    offset: UtcOffset,
}

impl ConsoleRecord {
    /// Formatter stamping lines in `offset`.
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }

    fn render(
        &self,
        level: &Level,
        at: OffsetDateTime,
        context: &Fields,
        visitor: RecordVisitor,
    ) -> String {
        let timestamp = at
            .format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_default();
        let tag = match *level {
            Level::TRACE => "TRC".purple(),
            Level::DEBUG => "DBG".blue(),
            Level::INFO => "INF".green(),
            Level::WARN => "WRN".yellow(),
            Level::ERROR => "ERR".red(),
        };

        let mut line = format!("{} {tag}", timestamp.dimmed());
        if let Some(caller) = visitor.caller {
            line.push_str(&format!(" {caller}"));
        }
        line.push_str(&format!(" {} {}", ">".cyan(), visitor.message));
        for (key, value) in context {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            if key == "error" {
                line.push_str(&format!(" {}", format!("{key}={rendered}").red()));
            } else {
                line.push_str(&format!(" {}{rendered}", format!("{key}=").cyan()));
            }
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for ConsoleRecord
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let context = bound_context();
        let line = self.render(event.metadata().level(), self.now(), &context, visitor);
        writeln!(writer, "{line}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::{datetime, offset};

    fn context(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("context must be an object"),
        }
    }

    fn visitor(message: &str, caller: Option<&str>) -> RecordVisitor {
        RecordVisitor {
            message: message.to_string(),
            caller: caller.map(str::to_string),
        }
    }

    #[test]
    fn json_record_orders_fixed_keys_and_context() {
        let format = JsonRecord::new(UtcOffset::UTC);
        let record = format.render(
            &Level::WARN,
            datetime!(2024-05-01 12:30:00 UTC),
            &context(json!({ "request_id": 7, "user": "ada" })),
            visitor("disk almost full", Some("src/main.rs:12")),
        );

        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, ["level", "time", "caller", "request_id", "user", "message"]);
        assert_eq!(record["level"], "warn");
        assert_eq!(record["time"], "2024-05-01T12:30:00Z");
        assert_eq!(record["request_id"], 7);
        assert_eq!(record["message"], "disk almost full");
    }

    #[test]
    fn json_record_reserved_keys_win() {
        let format = JsonRecord::new(UtcOffset::UTC);
        let record = format.render(
            &Level::INFO,
            datetime!(2024-05-01 12:30:00 UTC),
            &context(json!({ "level": "fake", "message": "fake" })),
            visitor("real", None),
        );

        assert_eq!(record["level"], "info");
        assert_eq!(record["message"], "real");
        assert!(!record.contains_key("caller"));
    }

    #[test]
    fn console_record_renders_fields() {
        colored::control::set_override(false);
        let format = ConsoleRecord::new(UtcOffset::UTC);
        let line = format.render(
            &Level::ERROR,
            datetime!(2024-05-01 08:05:09 UTC),
            &context(json!({ "user": "ada", "attempt": 2 })),
            visitor("login failed", Some("src/auth.rs:40")),
        );

        assert_eq!(
            line,
            "2024-05-01 08:05:09 ERR src/auth.rs:40 > login failed user=ada attempt=2"
        );
    }

    #[test]
    fn timestamps_keep_the_resolved_offset() {
        let resolved = offset!(+2);
        let json = JsonRecord::new(resolved);
        let console = ConsoleRecord::new(resolved);

        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| ()))
            .collect();
        assert_eq!(json.now().offset(), resolved);
        assert_eq!(console.now().offset(), resolved);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn scoped_context_is_restored_after_emission() {
        let outer = Arc::new(context(json!({ "scope": "outer" })));
        let inner = Arc::new(context(json!({ "scope": "inner" })));

        assert!(bound_context().is_empty());
        scoped(&outer, || {
            assert_eq!(bound_context()["scope"], "outer");
            scoped(&inner, || assert_eq!(bound_context()["scope"], "inner"));
            assert_eq!(bound_context()["scope"], "outer");
        });
        assert!(bound_context().is_empty());
    }
}
