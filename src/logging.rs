//! Structured logging for the experimentation engine.
//!
//! Every record is a single JSON line:
//! `ts`, `run_id`, `seq`, `lvl`, `component`, `event`, `msg`, promoted ids, `data`.
//!
//! Records always go to stderr. When `LOG_DIR` is set they are also appended to
//! `$LOG_DIR/<run_id>/events.jsonl`, with trace/debug records split into `trace.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Assign,     // Traffic gates, variant selection
    Record,     // Event log appends
    Funnel,     // Funnel aggregation
    Stats,      // Significance estimates
    Store,      // Persistence load/save
    Sink,       // Downstream analytics delivery
    Instrument, // UI event matching
    System,     // Startup, registration, config
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Assign => "assign",
            Domain::Record => "record",
            Domain::Funnel => "funnel",
            Domain::Stats => "stats",
            Domain::Store => "store",
            Domain::Sink => "sink",
            Domain::Instrument => "instrument",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_log(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let Ok(base) = std::env::var("LOG_DIR") else {
            return RunContext { run_id, events: None, trace: None };
        };
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
            return RunContext { run_id, events: None, trace: None };
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );
        RunContext {
            events: open_log(run_dir.join("events.jsonl")),
            trace: open_log(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

/// Metadata keys that must never reach a log line verbatim.
const REDACTED_KEYS: [&str; 5] = ["email", "password", "token", "authorization", "api_key"];

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in fields.iter_mut() {
        let lower = key.to_ascii_lowercase();
        if REDACTED_KEYS.iter().any(|k| lower.contains(k)) {
            *value = Value::String("[REDACTED]".to_string());
        } else if let Value::Object(inner) = value {
            *inner = sanitize_fields(std::mem::take(inner));
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["experiment_id", "funnel_id", "session_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(Ok(mut w)) = writer.as_ref().map(|m| m.lock()) {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    let line = render(level, domain.as_str(), event, fields);
    let ctx = ensure_run_context();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    eprintln!("{}", line);
}

fn render(level: Level, component: &str, event: &str, fields: Map<String, Value>) -> String {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(sanitize_fields(fields));

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry).to_string()
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_assignment(experiment_id: &str, session_id: &str, variant_id: &str, bucket: u32) {
    log(
        Level::Info,
        Domain::Assign,
        "assigned",
        obj(&[
            ("experiment_id", v_str(experiment_id)),
            ("session_id", v_str(session_id)),
            ("variant_id", v_str(variant_id)),
            ("bucket", json!(bucket)),
        ]),
    );
}

/// A traffic gate rejected the visitor.
pub fn log_gate(experiment_id: &str, session_id: &str, gate: &str) {
    log(
        Level::Debug,
        Domain::Assign,
        "gated",
        obj(&[
            ("experiment_id", v_str(experiment_id)),
            ("session_id", v_str(session_id)),
            ("gate", v_str(gate)),
        ]),
    );
}

pub fn log_recorded(kind: &str, scope_id: &str, session_id: &str, log_len: usize) {
    log(
        Level::Debug,
        Domain::Record,
        kind,
        obj(&[
            ("scope_id", v_str(scope_id)),
            ("session_id", v_str(session_id)),
            ("log_len", json!(log_len)),
        ]),
    );
}

pub fn log_persist_failure(key: &str, err: &anyhow::Error) {
    log(
        Level::Warn,
        Domain::Store,
        "persist_failed",
        obj(&[("key", v_str(key)), ("error", v_str(&format!("{:#}", err)))]),
    );
}

pub fn log_load_fallback(key: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Store,
        "load_fallback",
        obj(&[("key", v_str(key)), ("reason", v_str(reason))]),
    );
}

pub fn log_sink_failure(event_name: &str, reason: &str, consecutive: u32) {
    log(
        Level::Warn,
        Domain::Sink,
        "send_failed",
        obj(&[
            ("event_name", v_str(event_name)),
            ("reason", v_str(reason)),
            ("consecutive", json!(consecutive)),
        ]),
    );
}

fn significance_fields(experiment_id: &str, users: u64, z: Option<f64>, p_value: f64, significant: bool) -> Map<String, Value> {
    obj(&[
        ("experiment_id", v_str(experiment_id)),
        ("users", json!(users)),
        ("z", z.map_or(Value::Null, v_num)),
        ("p_value", v_num(p_value)),
        ("significant", Value::Bool(significant)),
    ])
}

/// One significance computation; `z` is absent below the sample floor.
pub fn log_significance(experiment_id: &str, users: u64, z: Option<f64>, p_value: f64, significant: bool) {
    log(
        Level::Debug,
        Domain::Stats,
        "significance",
        significance_fields(experiment_id, users, z, p_value, significant),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Tests
// =============================================================================
