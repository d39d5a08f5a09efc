//! Per-call log file routing, grounded on `call_logger.py`'s `CallLogger`:
//! every event recorded inside a call's span lands in
//! `logs/<date>/bot_<bot>/call_<key>.log` instead of (or in addition to) the
//! process-wide `logs/app.log`. `tracing-appender`'s `RollingFileAppender`
//! rotates by day but is one fixed path per writer, so fanning out to a
//! dynamic, call-keyed path needs a small custom `Layer` that opens (and
//! caches) one file per call the first time it sees that call's span.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Span fields a call's top-level span is created with; `on_new_span` reads
/// these to pick (and create) the call's log file.
pub const CALL_KEY_FIELD: &str = "call_key";
pub const BOT_ID_FIELD: &str = "bot_id";

struct CallFields {
    call_key: String,
    bot_id: String,
}

#[derive(Default)]
struct FieldVisitor {
    call_key: Option<String>,
    bot_id: Option<String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record_str(field, &format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            CALL_KEY_FIELD => self.call_key = Some(value.trim_matches('"').to_string()),
            BOT_ID_FIELD => self.bot_id = Some(value.trim_matches('"').to_string()),
            _ => {}
        }
    }
}

/// Routes events inside a call's span to `logs/<date>/bot_<bot>/call_<key>.log`.
pub struct CallFileLayer {
    root: PathBuf,
    files: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl CallFileLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), files: Mutex::new(HashMap::new()) }
    }

    fn file_for(&self, call_key: &str, bot_id: &str) -> Arc<Mutex<File>> {
        let mut files = self.files.lock().unwrap();
        match files.entry(call_key.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let today = Local::now().format("%Y-%m-%d").to_string();
                let dir = self.root.join(today).join(format!("bot_{bot_id}"));
                let _ = fs::create_dir_all(&dir);
                let path = dir.join(format!("call_{call_key}.log"));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .expect("open per-call log file");
                let handle = Arc::new(Mutex::new(file));
                entry.insert(handle.clone());
                handle
            }
        }
    }
}

impl<S> Layer<S> for CallFileLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(call_key), bot_id) = (visitor.call_key, visitor.bot_id.unwrap_or_else(|| "unknown".to_string())) {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(CallFields { call_key, bot_id });
            }
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        values.record(&mut visitor);
        if visitor.call_key.is_none() && visitor.bot_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            if let Some(fields) = extensions.get_mut::<CallFields>() {
                if let Some(call_key) = visitor.call_key {
                    fields.call_key = call_key;
                }
                if let Some(bot_id) = visitor.bot_id {
                    fields.bot_id = bot_id;
                }
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else { return };
        for span in scope.from_root() {
            let extensions = span.extensions();
            let Some(fields) = extensions.get::<CallFields>() else { continue };
            let file = self.file_for(&fields.call_key, &fields.bot_id);
            let mut visitor = MessageVisitor::default();
            event.record(&mut visitor);
            let line = format!(
                "{} {:>5} {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                event.metadata().level(),
                visitor.message.unwrap_or_default()
            );
            let mut file = file.lock().unwrap();
            let _ = file.write_all(line.as_bytes());
            return;
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn writes_events_inside_a_call_span_to_its_own_file() {
        let root = std::env::temp_dir().join(format!("voicebridge-call-log-test-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);

        let layer = CallFileLayer::new(&root);
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("call", call_key = "abc123", bot_id = "sales");
            let _guard = span.enter();
            tracing::info!("call started");
        });

        let today = Local::now().format("%Y-%m-%d").to_string();
        let expected = root.join(today).join("bot_sales").join("call_abc123.log");
        let contents = fs::read_to_string(&expected).expect("per-call log file should exist");
        assert!(contents.contains("call started"));

        let _ = fs::remove_dir_all(&root);
    }
}
