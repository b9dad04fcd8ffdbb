use crate::config::{LoggingConfig, Section};
use crate::paths::home_dir::anchor;
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

// Keeps the non-blocking console worker alive for the process lifetime.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

const DEFAULT_SECTION: &str = "default";

/// `None` means the sink is off for that target.
fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" | "" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => None,
        _ => Some(LevelFilter::INFO),
    }
}

/// True if `target` is `prefix` or lives under `prefix::`.
fn matches_prefix(target: &str, prefix: &str) -> bool {
    target
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating file sinks =================

#[derive(Clone)]
struct FileSink(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl FileSink {
    fn open(section: &Section, base_dir: &Path) -> std::io::Result<Self> {
        let path = anchor(Path::new(section.file.trim()), base_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let limit = match section.max_backups {
            Some(n) => FileLimit::MaxFiles(n),
            None => FileLimit::Age(chrono::Duration::days(
                i64::from(section.max_age_days.unwrap_or(1)),
            )),
        };
        let max_bytes = section.max_size_mb.unwrap_or(100) as usize * 1024 * 1024;

        let rotate = FileRotate::new(
            &path,
            AppendTimestamp::default(limit),
            ContentLimit::BytesSurpassed(max_bytes),
            Compression::None,
            None,
        );
        Ok(Self(Arc::new(Mutex::new(rotate))))
    }
}

/// Writer for one record; `None` discards the record.
struct SinkHandle(Option<FileSink>);

impl Write for SinkHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(sink) => sink.0.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(sink) => sink.0.lock().flush(),
            None => Ok(()),
        }
    }
}

/// Sends each record to the file of the longest matching target prefix,
/// falling back to the default file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<FileSink>,
    routes: Vec<(String, FileSink)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = Self::default();
        for (name, section) in cfg {
            if section.file.trim().is_empty() {
                continue;
            }
            let sink = match FileSink::open(section, base_dir) {
                Ok(sink) => sink,
                Err(e) => {
                    eprintln!("Failed to open log file '{}' for '{name}': {e}", section.file);
                    continue;
                }
            };
            if name == DEFAULT_SECTION {
                router.default = Some(sink);
            } else {
                router.routes.push((name.clone(), sink));
            }
        }
        router.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        router
    }

    fn route(&self, target: &str) -> Option<FileSink> {
        self.routes
            .iter()
            .find(|(prefix, _)| matches_prefix(target, prefix))
            .map(|(_, sink)| sink)
            .or(self.default.as_ref())
            .cloned()
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.routes.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = SinkHandle;

    fn make_writer(&'a self) -> Self::Writer {
        SinkHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        SinkHandle(self.route(meta.target()))
    }
}

// ================= per-sink targets =================

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File { has_default_file: bool },
}

fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let level_of = |section: &Section| match sink {
        Sink::Console => parse_level(&section.console_level),
        Sink::File { .. } => parse_level(&section.file_level),
    };

    let default_level = match (sink, cfg.get(DEFAULT_SECTION)) {
        // Without a default file, untargeted records have nowhere to go.
        (Sink::File { has_default_file: false }, _) => LevelFilter::OFF,
        (_, Some(section)) => level_of(section).unwrap_or(LevelFilter::OFF),
        (_, None) => LevelFilter::INFO,
    };

    let mut targets = Targets::new().with_default(default_level);
    for (name, section) in cfg.iter().filter(|(name, _)| name.as_str() != DEFAULT_SECTION) {
        // A target only writes to files when it has a file of its own.
        if matches!(sink, Sink::File { .. }) && section.file.trim().is_empty() {
            continue;
        }
        let level = level_of(section).unwrap_or(LevelFilter::OFF);
        targets = targets.with_target(name.clone(), level);
    }
    targets
}

// ================= init =================

/// Installs the global subscriber: a human-readable console layer on stderr
/// and, when any file is configured, a JSON file layer routed by target.
///
/// `RUST_LOG`, if set, caps both sinks. Relative log paths are anchored at `base_dir`.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` records before the subscriber exists.
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    if cfg.is_empty() {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339());
        let _ = Registry::default().with(env).with(fmt_layer).try_init();
        return;
    }

    let router = FileRouter::build(cfg, base_dir);
    let console_targets = build_targets(cfg, Sink::Console);
    let file_targets = build_targets(
        cfg,
        Sink::File {
            has_default_file: router.default.is_some(),
        },
    );

    let (stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets)
    });

    let _ = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
