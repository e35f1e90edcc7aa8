//! Envelope processor: accumulates multi-line JSON, parses, enriches, and
//! forwards canonical records to the sink.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::extract;
use crate::model::{Envelope, LogRecord, LogSink};

/// Accumulation buffers larger than this are discarded.
const MAX_ACCUM_BYTES: usize = 10 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorMode {
    /// JSON ingestion: OTEL envelopes, OTEL records, and common log shapes.
    Parse,
    /// No JSON parsing; every non-empty line becomes a fallback record.
    Passthrough,
}

impl FromStr for ProcessorMode {
    type Err = ProcessorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parse" => Ok(Self::Parse),
            "passthrough" => Ok(Self::Passthrough),
            other => Err(ProcessorError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("unknown processor mode: {0:?} (expected \"parse\" or \"passthrough\")")]
    UnknownMode(String),
}

/// Outcome of a processed envelope, carrying the first produced record.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub record: LogRecord,
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

struct AccumState {
    buf: String,
    depth: i64,
    source: String,
    accumulating: bool,
}

/// Safe for concurrent envelope ingress. The accumulation state mutex guards
/// only the buffer; the sink call happens after it is released, so sink
/// backpressure cannot stall unrelated ingress.
pub struct EnvelopeProcessor {
    mode: ProcessorMode,
    default_source: String,
    app: String,
    sink: Arc<dyn LogSink>,
    state: Mutex<AccumState>,
}

impl std::fmt::Debug for EnvelopeProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeProcessor")
            .field("mode", &self.mode)
            .field("default_source", &self.default_source)
            .field("app", &self.app)
            .finish_non_exhaustive()
    }
}

impl EnvelopeProcessor {
    pub fn new(
        mode: &str,
        default_source: impl Into<String>,
        app: impl Into<String>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, ProcessorError> {
        Ok(Self {
            mode: mode.parse()?,
            default_source: default_source.into(),
            app: app.into(),
            sink,
            state: Mutex::new(AccumState {
                buf: String::new(),
                depth: 0,
                source: String::new(),
                accumulating: false,
            }),
        })
    }

    /// Process one ingest envelope.
    ///
    /// Returns `None` while a multi-line JSON object is being accumulated,
    /// or when the line carries no recognizable log content.
    pub async fn process_envelope(&self, envelope: Envelope) -> Option<ProcessResult> {
        let source = if envelope.source.is_empty() {
            self.default_source.clone()
        } else {
            envelope.source
        };

        match self.mode {
            ProcessorMode::Passthrough => self.process_passthrough(&envelope.line, &source).await,
            ProcessorMode::Parse => self.process_parse(&envelope.line, &source).await,
        }
    }

    async fn process_passthrough(&self, line: &str, source: &str) -> Option<ProcessResult> {
        if line.trim().is_empty() {
            return None;
        }
        let mut record = extract::fallback_record(line, line);
        self.enrich(&mut record, source);
        let first = record.clone();
        self.sink.add(record).await;
        Some(ProcessResult { record: first })
    }

    async fn process_parse(&self, line: &str, source: &str) -> Option<ProcessResult> {
        // Phase 1: advance the accumulation state machine under the lock.
        let (payload, payload_source) = {
            let mut state = self
                .state
                .lock()
                .expect("processor accumulation mutex poisoned");
            step_accumulator(&mut state, line, source)?
        };

        // Phase 2: parse and extract without holding the lock.
        let value: Value = serde_json::from_str(&payload).ok()?;
        let mut records = extract::extract_json(&value, &payload);
        if records.is_empty() {
            return None;
        }
        for record in &mut records {
            self.enrich(record, &payload_source);
        }
        let first = records[0].clone();

        // Phase 3: forward to the sink, still outside the lock.
        for record in records {
            self.sink.add(record).await;
        }
        Some(ProcessResult { record: first })
    }

    fn enrich(&self, record: &mut LogRecord, source: &str) {
        if record.app.is_empty() {
            record.app = self.app.clone();
        }
        record.service = extract::derive_service(&record.attributes, &record.app);
        record.hostname = extract::derive_hostname(&record.attributes);
        if record.pid.is_none() {
            record.pid = extract::derive_pid(&record.attributes);
        }
        record.source = if source.is_empty() {
            self.default_source.clone()
        } else {
            source.to_string()
        };
    }
}

// ---------------------------------------------------------------------------
// Multi-line accumulation
// ---------------------------------------------------------------------------

/// Advance the state machine by one line. Returns the completed payload and
/// its source when an entry is ready for parsing.
fn step_accumulator(state: &mut AccumState, line: &str, source: &str) -> Option<(String, String)> {
    if !state.accumulating {
        if !line.trim_start().starts_with('{') {
            // Single-line entry.
            return Some((line.to_string(), source.to_string()));
        }
        state.buf.clear();
        state.buf.push_str(line);
        state.source = source.to_string();
        state.depth = depth_delta(line);
        if state.depth > 0 {
            state.accumulating = true;
            state.buf.push('\n');
            return None;
        }
        state.depth = 0;
        return Some((std::mem::take(&mut state.buf), state.source.clone()));
    }

    state.buf.push_str(line);
    state.depth += depth_delta(line);

    if state.buf.len() > MAX_ACCUM_BYTES {
        tracing::warn!(
            bytes = state.buf.len(),
            "discarding oversized multi-line buffer"
        );
        state.buf = String::new();
        state.depth = 0;
        state.accumulating = false;
        return None;
    }

    if state.depth > 0 {
        state.buf.push('\n');
        return None;
    }

    state.accumulating = false;
    state.depth = 0;
    Some((std::mem::take(&mut state.buf), state.source.clone()))
}

/// Net `{}[]` balance of a line, ignoring brackets inside quoted strings.
/// Valid JSON strings cannot span lines, so the in-string flag resets per
/// line.
fn depth_delta(line: &str) -> i64 {
    let mut depth = 0i64;
    let mut in_string = false;
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => depth -= 1,
            _ => {}
        }
    }
    depth
}
