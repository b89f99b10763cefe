//! Persistent record of WARN and ERROR events, keyed by the session they
//! concern so an operator can ask "what went wrong with this account".

use std::path::Path;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const WARNINGS_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS warnings (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at   TEXT NOT NULL,
        severity    INTEGER NOT NULL,
        level       TEXT NOT NULL,
        target      TEXT NOT NULL,
        message     TEXT NOT NULL,
        fields      TEXT,
        span        TEXT,
        session_id  TEXT,
        external_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_warnings_session ON warnings(session_id);
    CREATE INDEX IF NOT EXISTS idx_warnings_logged_at ON warnings(logged_at);
";

const DEFAULT_LIMIT: u32 = 100;

/// Lower is more severe, so `severity <= n` selects "n or worse".
fn severity(level: Level) -> i64 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        _ => 5,
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub logged_at: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<Value>,
    pub span: Option<String>,
    pub session_id: Option<String>,
    pub external_id: Option<String>,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let fields: Option<String> = row.get("fields")?;
        Ok(Self {
            id: row.get("id")?,
            logged_at: row.get("logged_at")?,
            level: row.get("level")?,
            target: row.get("target")?,
            message: row.get("message")?,
            fields: fields.and_then(|raw| serde_json::from_str(&raw).ok()),
            span: row.get("span")?,
            session_id: row.get("session_id")?,
            external_id: row.get("external_id")?,
        })
    }
}

/// Filter for [`SqliteLogSink::query`]. Results come back newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    /// Only this level or worse; `WARN` includes errors.
    pub min_level: Option<Level>,
    /// Substring of the event target, e.g. `reconnect`.
    pub target: Option<String>,
    pub session_id: Option<String>,
    /// RFC 3339, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut args = Vec::new();
        if let Some(level) = self.min_level {
            clauses.push("severity <= ?");
            args.push(SqlValue::Integer(severity(level)));
        }
        if let Some(target) = &self.target {
            clauses.push("target LIKE ?");
            args.push(SqlValue::Text(format!("%{target}%")));
        }
        if let Some(id) = &self.session_id {
            clauses.push("session_id = ?");
            args.push(SqlValue::Text(id.clone()));
        }
        if let Some(since) = &self.since {
            clauses.push("logged_at >= ?");
            args.push(SqlValue::Text(since.clone()));
        }
        args.push(SqlValue::Integer(i64::from(self.limit.unwrap_or(DEFAULT_LIMIT))));

        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        (format!("SELECT * FROM warnings {filter} ORDER BY id DESC LIMIT ?"), args)
    }
}

/// Ids that tie a log line to an account. Events inherit them from the
/// nearest enclosing span that recorded them.
#[derive(Clone, Debug, Default)]
struct Correlation {
    session_id: Option<String>,
    external_id: Option<String>,
}

impl Correlation {
    fn is_complete(&self) -> bool {
        self.session_id.is_some() && self.external_id.is_some()
    }

    fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.external_id.is_none()
    }

    fn inherit(&mut self, outer: &Correlation) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&outer.session_id);
        }
        if self.external_id.is_none() {
            self.external_id.clone_from(&outer.external_id);
        }
    }
}

struct Pending {
    level: Level,
    target: String,
    message: String,
    fields: Option<String>,
    span: Option<String>,
    ids: Correlation,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(path: &Path) -> rusqlite::Result<Self> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(WARNINGS_TABLE)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Failures are swallowed: a broken log file must not break the caller.
    fn write(&self, entry: Pending) {
        let result = self.conn.lock().execute(
            "INSERT INTO warnings
                 (logged_at, severity, level, target, message, fields, span, session_id, external_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                severity(entry.level),
                entry.level.as_str(),
                entry.target,
                entry.message,
                entry.fields,
                entry.span,
                entry.ids.session_id,
                entry.ids.external_id,
            ],
        );
        if let Err(e) = result {
            eprintln!("switchboard-telemetry: dropped log record: {e}");
        }
    }

    pub fn query(&self, query: &LogQuery) -> rusqlite::Result<Vec<LogRecord>> {
        let (sql, args) = query.to_sql();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), LogRecord::from_row)?;
        rows.collect()
    }

    pub fn count(&self) -> rusqlite::Result<u64> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM warnings", [], |row| row.get(0))
    }
}

/// Routes recorded fields: `message` and the correlation ids get their own
/// columns, everything else lands in the JSON `fields` blob.
#[derive(Default)]
struct Collector {
    message: Option<String>,
    ids: Correlation,
    extra: Map<String, Value>,
}

impl Collector {
    fn put(&mut self, field: &Field, value: Value) {
        match field.name() {
            "message" => self.message = Some(as_text(value)),
            "session_id" => self.ids.session_id = Some(as_text(value)),
            "external_id" => self.ids.external_id = Some(as_text(value)),
            name => {
                self.extra.insert(name.to_string(), value);
            }
        }
    }
}

fn as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Visit for Collector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    // `%` and `?` captured values arrive here; Display-formatted ids carry no quotes.
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        self.put(field, Value::from(rendered.trim_matches('"')));
    }
}

/// Layer persisting WARN and ERROR events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);
        if collector.ids.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collector.ids);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }

        let mut collector = Collector::default();
        event.record(&mut collector);

        let mut span_name = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                span_name.get_or_insert_with(|| span.name().to_string());
                if collector.ids.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Correlation>() {
                    collector.ids.inherit(outer);
                }
            }
        }

        let fields = (!collector.extra.is_empty())
            .then(|| serde_json::to_string(&collector.extra).ok())
            .flatten();

        self.sink.write(Pending {
            level: *meta.level(),
            target: meta.target().to_string(),
            message: collector.message.unwrap_or_default(),
            fields,
            span: span_name,
            ids: collector.ids,
        });
    }
}
