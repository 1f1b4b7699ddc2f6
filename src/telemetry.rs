use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt::{self as stdfmt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{
    self as fmt_subscriber, format::Writer, FmtContext, FormatEvent, FormatFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "courier";

pub fn init_tracing() -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("courier=info,info"));

    let stdout = std::io::stdout;
    let stderr = std::io::stderr;

    let writer = stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(false)
        .with_ansi(false)
        .event_format(KeyValueFormatter::new())
        .fmt_fields(fmt_subscriber::format::DefaultFields::new())
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

struct KeyValueFormatter {
    service_name: &'static str,
}

impl KeyValueFormatter {
    const fn new() -> Self {
        Self {
            service_name: SERVICE_NAME,
        }
    }
}

impl<S, N> FormatEvent<S, N> for KeyValueFormatter
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let metadata = event.metadata();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let message = visitor
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());

        let mut fields = visitor.fields;
        fields.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

        let mut line = String::new();
        push_field(&mut line, "ts", &timestamp);
        push_field(&mut line, "level", metadata.level().as_str());
        push_field(&mut line, "service", self.service_name);
        push_field(&mut line, "component", metadata.target());
        push_field(&mut line, "msg", &message);

        for (key, value) in fields {
            push_field(&mut line, &key, &value);
        }

        writer.write_str(&line)?;
        writer.write_char('\n')
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl FieldVisitor {
    fn record_field(&mut self, field: &Field, value: String) {
        if field.name().is_empty() {
            return;
        }
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_field(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.record_field(field, format!("{value:?}"));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_field(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_field(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_field(field, value.to_string());
    }
}

#[derive(Default)]
pub struct RuntimeCounters {
    messages_received: AtomicU64,
    source_filtered: AtomicU64,
    source_errors: AtomicU64,
    batches_split: AtomicU64,
    responses_timed_out: AtomicU64,
    queue_replayed: AtomicU64,
    destination_outcomes: DestinationOutcomeRegistry,
    queue_depth: QueueDepthRegistry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeCountersSnapshot {
    pub messages_received: u64,
    pub source_filtered: u64,
    pub source_errors: u64,
    pub batches_split: u64,
    pub responses_timed_out: u64,
    pub queue_replayed: u64,
    pub destination_outcomes: Vec<DestinationOutcomeSnapshot>,
    pub queue_depth: Vec<QueueDepthSnapshot>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DestinationOutcomeSnapshot {
    pub channel: String,
    pub destination: String,
    pub sent: u64,
    pub queued: u64,
    pub filtered: u64,
    pub errored: u64,
    pub failures_by_reason: Vec<(String, u64)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDepthSnapshot {
    pub channel: String,
    pub destination: String,
    pub depth: u64,
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

impl RuntimeCounters {
    pub fn inc_messages_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_source_filtered(&self) {
        self.source_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_source_errors(&self) {
        self.source_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches_split(&self) {
        self.batches_split.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_timed_out(&self) {
        self.responses_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_replayed(&self, items: u64) {
        self.queue_replayed.fetch_add(items, Ordering::Relaxed);
    }

    pub fn record_destination_sent(&self, channel: &str, destination: &str) {
        self.destination_outcomes.record(channel, destination, |entry| {
            entry.sent = entry.sent.saturating_add(1);
        });
    }

    pub fn record_destination_queued(&self, channel: &str, destination: &str) {
        self.destination_outcomes.record(channel, destination, |entry| {
            entry.queued = entry.queued.saturating_add(1);
        });
    }

    pub fn record_destination_filtered(&self, channel: &str, destination: &str) {
        self.destination_outcomes.record(channel, destination, |entry| {
            entry.filtered = entry.filtered.saturating_add(1);
        });
    }

    pub fn record_destination_error(&self, channel: &str, destination: &str, reason: Option<&str>) {
        let label = reason.unwrap_or("unknown").to_string();
        self.destination_outcomes.record(channel, destination, |entry| {
            entry.errored = entry.errored.saturating_add(1);
            *entry.failure_reasons.entry(label).or_insert(0) += 1;
        });
    }

    pub fn set_queue_depth(&self, channel: &str, destination: &str, depth: u64) {
        self.queue_depth.set(channel, destination, depth);
    }

    pub fn snapshot(&self) -> RuntimeCountersSnapshot {
        RuntimeCountersSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            source_filtered: self.source_filtered.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            batches_split: self.batches_split.load(Ordering::Relaxed),
            responses_timed_out: self.responses_timed_out.load(Ordering::Relaxed),
            queue_replayed: self.queue_replayed.load(Ordering::Relaxed),
            destination_outcomes: self.destination_outcomes.snapshot(),
            queue_depth: self.queue_depth.snapshot(),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct OutcomeEntry {
    sent: u64,
    queued: u64,
    filtered: u64,
    errored: u64,
    failure_reasons: BTreeMap<String, u64>,
}

#[derive(Default)]
struct DestinationOutcomeRegistry {
    inner: Mutex<BTreeMap<(String, String), OutcomeEntry>>,
}

impl DestinationOutcomeRegistry {
    fn record<F>(&self, channel: &str, destination: &str, update: F)
    where
        F: FnOnce(&mut OutcomeEntry),
    {
        let mut guard = self
            .inner
            .lock()
            .expect("destination outcome registry poisoned");
        let entry = guard
            .entry((channel.to_string(), destination.to_string()))
            .or_default();
        update(entry);
    }

    fn snapshot(&self) -> Vec<DestinationOutcomeSnapshot> {
        let guard = self
            .inner
            .lock()
            .expect("destination outcome registry poisoned");
        guard
            .iter()
            .map(|((channel, destination), entry)| DestinationOutcomeSnapshot {
                channel: channel.clone(),
                destination: destination.clone(),
                sent: entry.sent,
                queued: entry.queued,
                filtered: entry.filtered,
                errored: entry.errored,
                failures_by_reason: entry
                    .failure_reasons
                    .iter()
                    .map(|(reason, count)| (reason.clone(), *count))
                    .collect(),
            })
            .collect()
    }
}

#[derive(Default)]
struct QueueDepthRegistry {
    inner: Mutex<BTreeMap<(String, String), u64>>,
}

impl QueueDepthRegistry {
    fn set(&self, channel: &str, destination: &str, depth: u64) {
        let mut guard = self.inner.lock().expect("queue depth registry poisoned");
        guard.insert((channel.to_string(), destination.to_string()), depth);
    }

    fn snapshot(&self) -> Vec<QueueDepthSnapshot> {
        let guard = self.inner.lock().expect("queue depth registry poisoned");
        guard
            .iter()
            .map(|((channel, destination), depth)| QueueDepthSnapshot {
                channel: channel.clone(),
                destination: destination.clone(),
                depth: *depth,
            })
            .collect()
    }
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.chars().any(|c| {
        c.is_whitespace()
            || matches!(
                c,
                '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',' | '\n' | '\r' | '\t'
            )
    });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}
