//! Process-wide tracing setup for catalog binaries.
//!
//! Everything is driven by environment variables:
//!
//! | Variable             | Values                       | Default                    |
//! |----------------------|------------------------------|----------------------------|
//! | `CATALOG_LOG_LEVEL`  | any `EnvFilter` directive    | `info`                     |
//! | `CATALOG_LOG_FORMAT` | `human`, `json`              | `human`                    |
//! | `CATALOG_LOG_OUTPUT` | `console`, `file`, `both`    | `console`                  |
//! | `CATALOG_LOG_FILE`   | path of the rolling log file | `/tmp/catalog-worker.log`  |
//! | `CATALOG_LOG_TAGS`   | `key:value,...`              | none                       |
//!
//! `RUST_LOG` still wins over `CATALOG_LOG_LEVEL` when set. Tags keep only
//! events emitted inside a span carrying every listed field, so
//! `CATALOG_LOG_TAGS=request_id:abc` follows a single request.

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing::{field::Visit, span, subscriber::Interest, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry,
    registry::LookupSpan,
    util::TryInitError,
    EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/tmp/catalog-worker.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    File,
    Both,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    pub file: PathBuf,
    pub tags: Vec<Tag>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let format = match lookup("CATALOG_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let output = match lookup("CATALOG_LOG_OUTPUT").as_deref() {
            Some("file") => LogOutput::File,
            Some("both") => LogOutput::Both,
            Some("none") => LogOutput::None,
            _ => LogOutput::Console,
        };

        Self {
            level: lookup("CATALOG_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            format,
            output,
            file: lookup("CATALOG_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
            tags: lookup("CATALOG_LOG_TAGS")
                .map(|raw| parse_tags(&raw))
                .unwrap_or_default(),
        }
    }
}

/// Parse `key:value,key:value`. Entries without a colon are ignored and `*`
/// matches any value.
pub fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let (key, value) = s.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some(Tag {
                key: key.to_string(),
                value: value.trim().to_string(),
            })
        })
        .collect()
}

// --- Tee writer: one event, two sinks ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

// --- Span-field filtering ---
type SpanFields = HashMap<String, String>;

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = SpanFields::new();
        attrs.record(&mut FieldVisitor(&mut fields));
        span.extensions_mut().insert(fields);
    }

    fn register_callsite(&self, _meta: &'static Metadata<'static>) -> Interest {
        // The verdict depends on the active span, so it cannot be cached.
        if self.filters.is_empty() {
            Interest::always()
        } else {
            Interest::sometimes()
        }
    }

    fn enabled(&self, meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        // Spans must exist for their fields to be matched later.
        if self.filters.is_empty() || meta.is_span() {
            return true;
        }

        let Some(scope) = ctx.current_span().id().and_then(|id| ctx.span_scope(id)) else {
            return false;
        };

        let mut all_fields = SpanFields::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<SpanFields>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| {
            all_fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut SpanFields);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

fn fmt_layer<S, W>(writer: W, format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Human => layer.pretty().boxed(),
    }
}

fn env_filter(level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    for noisy in ["tokio=warn", "hyper=warn", "sqlx=warn"] {
        if let Ok(directive) = noisy.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install the global subscriber described by `settings`.
///
/// Keep the returned guard alive for the life of the process: dropping it
/// flushes and stops the background file writer.
pub fn init_subscriber(settings: &LogSettings) -> Result<Option<WorkerGuard>, TryInitError> {
    let log_dir = settings
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let log_filename = settings
        .file
        .file_name()
        .unwrap_or_else(|| "catalog-worker.log".as_ref());

    let (output_layer, guard) = match settings.output {
        LogOutput::Console => (Some(fmt_layer(io::stdout, settings.format)), None),
        LogOutput::File => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (Some(fmt_layer(non_blocking, settings.format)), Some(guard))
        }
        LogOutput::Both => {
            let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let tee_writer = MakeTee {
                make_a: io::stdout,
                make_b: non_blocking,
            };
            (Some(fmt_layer(tee_writer, settings.format)), Some(guard))
        }
        LogOutput::None => (None, None),
    };

    registry()
        .with(env_filter(&settings.level))
        .with(TagFilterLayer {
            filters: settings.tags.clone(),
        })
        .with(output_layer)
        .try_init()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("request_id:abc, instance_id : 7,broken,:nokey");
        assert_eq!(
            tags,
            vec![
                Tag {
                    key: "request_id".to_string(),
                    value: "abc".to_string()
                },
                Tag {
                    key: "instance_id".to_string(),
                    value: "7".to_string()
                },
            ]
        );
        assert!(parse_tags("").is_empty());
    }

    #[test]
    fn test_settings_from_lookup() {
        let vars = HashMap::from([
            ("CATALOG_LOG_FORMAT", "json"),
            ("CATALOG_LOG_OUTPUT", "both"),
            ("CATALOG_LOG_FILE", "/var/log/catalog/worker.log"),
            ("CATALOG_LOG_TAGS", "request_id:*"),
        ]);
        let settings = LogSettings::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(settings.level, "info");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.file, PathBuf::from("/var/log/catalog/worker.log"));
        assert_eq!(settings.tags.len(), 1);

        let defaults = LogSettings::default();
        assert_eq!(defaults.format, LogFormat::Human);
        assert_eq!(defaults.output, LogOutput::Console);
        assert!(defaults.tags.is_empty());
    }

    #[test]
    fn test_tee_writes_both_sinks() {
        let a = Captured::default();
        let b = Captured::default();
        let make = MakeTee {
            make_a: {
                let a = a.clone();
                move || a.clone()
            },
            make_b: {
                let b = b.clone();
                move || b.clone()
            },
        };

        write!(make.make_writer(), "hello").unwrap();

        assert_eq!(a.text(), "hello");
        assert_eq!(b.text(), "hello");
    }

    #[test]
    fn test_tag_filter_keeps_matching_spans_only() {
        let captured = Captured::default();
        let subscriber = registry()
            .with(TagFilterLayer {
                filters: parse_tags("request_id:req-1"),
            })
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer({
                        let captured = captured.clone();
                        move || captured.clone()
                    }),
            );

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("outside any span");
            tracing::info_span!("op", request_id = "req-2").in_scope(|| {
                tracing::info!("other request");
            });
            tracing::info_span!("op", request_id = %"req-1").in_scope(|| {
                tracing::info_span!("inner").in_scope(|| tracing::info!("wanted request"));
            });
        });

        let text = captured.text();
        assert!(text.contains("wanted request"), "{text}");
        assert!(!text.contains("other request"), "{text}");
        assert!(!text.contains("outside any span"), "{text}");
    }
}
