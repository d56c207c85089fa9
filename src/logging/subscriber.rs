//! Tracing subscriber: console formatter and log file layer.
//!
//! Events carry their kind in the target and, when replayed from a
//! concurrent batch, the environment or job they belong to in a `run`
//! field. The log file keeps that name on every line so interleaved
//! batches stay attributable; the console shows each batch as one block
//! and leaves it out.
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;

use super::utils::{format_utc_datetime, format_utc_time, log_file_path, strip_ansi};

const STAGE: &str = "envmatrix::stage";
const DRY_RUN: &str = "envmatrix::dry_run";
const OUTPUT: &str = "envmatrix::output";

/// What a log event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum EventKind {
    Stage,
    Info,
    Debug,
    Warn,
    Error,
    DryRun,
    Output,
}

impl EventKind {
    /// Emit `msg` as this kind, tagged with `run` when it belongs to one.
    pub(super) fn emit(self, msg: &str, run: Option<&str>) {
        let run = run.unwrap_or_default();
        match self {
            Self::Stage => tracing::info!(target: STAGE, run, "{msg}"),
            Self::Info => tracing::info!(run, "{msg}"),
            Self::Debug => tracing::debug!(run, "{msg}"),
            Self::Warn => tracing::warn!(run, "{msg}"),
            Self::Error => tracing::error!(run, "{msg}"),
            Self::DryRun => tracing::info!(target: DRY_RUN, run, "{msg}"),
            Self::Output => tracing::info!(target: OUTPUT, run, "{msg}"),
        }
    }

    fn of(metadata: &tracing::Metadata<'_>) -> Self {
        match (*metadata.level(), metadata.target()) {
            (Level::ERROR, _) => Self::Error,
            (Level::WARN, _) => Self::Warn,
            (Level::INFO, STAGE) => Self::Stage,
            (Level::INFO, DRY_RUN) => Self::DryRun,
            (Level::INFO, OUTPUT) => Self::Output,
            (Level::INFO, _) => Self::Info,
            _ => Self::Debug,
        }
    }

    /// Marker between timestamp and message in the log file.
    const fn file_marker(self) -> &'static str {
        match self {
            Self::Stage => "==>",
            Self::Info => "",
            Self::Debug => "[debug]",
            Self::Warn => "[warn]",
            Self::Error => "[error]",
            Self::DryRun => "[dry run]",
            Self::Output => "|",
        }
    }
}

/// The `message` and `run` fields of one event.
#[derive(Default)]
struct EventFields {
    message: String,
    run: String,
}

impl EventFields {
    fn of(event: &tracing::Event<'_>) -> Self {
        let mut fields = Self::default();
        event.record(&mut fields);
        fields
    }
}

impl tracing::field::Visit for EventFields {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "run" => self.run = value.to_string(),
            _ => {}
        }
    }
}

/// Appends every event to the command's log file.
#[derive(Debug)]
pub(super) struct FileLayer {
    file: Mutex<fs::File>,
}

impl FileLayer {
    /// Truncate the log file for `command` and write a header naming the
    /// version and the directory the command ran in.
    ///
    /// Returns `None` when the cache directory is unusable.
    pub(super) fn new(command: &str) -> Option<Self> {
        let path = log_file_path(command)?;
        let version = option_env!("ENVMATRIX_VERSION")
            .unwrap_or(concat!("dev-", env!("CARGO_PKG_VERSION")));
        let cwd = std::env::current_dir().unwrap_or_default();
        fs::write(&path, file_header(version, command, &cwd)).ok()?;
        let file = fs::OpenOptions::new().append(true).open(&path).ok()?;
        Some(Self {
            file: Mutex::new(file),
        })
    }
}

fn file_header(version: &str, command: &str, cwd: &Path) -> String {
    format!(
        "# envmatrix {version} {command}\n# started {} UTC in {}\n",
        format_utc_datetime(),
        cwd.display(),
    )
}

/// `[time] [run] marker message`, without ANSI codes; the run column is
/// left out for events outside a batch.
fn file_line(kind: EventKind, fields: &EventFields, time: &str) -> String {
    let mut line = format!("[{time}]");
    if !fields.run.is_empty() {
        line.push_str(&format!(" [{}]", fields.run));
    }
    let marker = kind.file_marker();
    if !marker.is_empty() {
        line.push(' ');
        line.push_str(marker);
    }
    line.push(' ');
    line.push_str(&strip_ansi(&fields.message));
    line
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for FileLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let kind = EventKind::of(event.metadata());
        let line = file_line(kind, &EventFields::of(event), &format_utc_time());
        if let Ok(mut f) = self.file.lock() {
            writeln!(f, "{line}").ok();
        }
    }
}

/// Console format: stage arrows, coloured warnings and errors, child
/// output passed through unstyled.
struct ConsoleFormatter;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let msg = EventFields::of(event).message;
        match EventKind::of(event.metadata()) {
            EventKind::Error => writeln!(writer, "\x1b[31mERROR\x1b[0m {msg}"),
            EventKind::Warn => writeln!(writer, "\x1b[33mWARN\x1b[0m  {msg}"),
            EventKind::Stage => writeln!(writer, "\x1b[1;34m==>\x1b[0m \x1b[1m{msg}\x1b[0m"),
            EventKind::DryRun => writeln!(writer, "  \x1b[33m[DRY RUN]\x1b[0m {msg}"),
            EventKind::Output => writeln!(writer, "{msg}"),
            EventKind::Info => writeln!(writer, "  {msg}"),
            EventKind::Debug => writeln!(writer, "  \x1b[2m{msg}\x1b[0m"),
        }
    }
}

/// Install the global subscriber.
///
/// The console shows `INFO` and above (`DEBUG` with `verbose`), warnings
/// and errors on stderr. The file layer always records `DEBUG` and above to
/// `$XDG_CACHE_HOME/envmatrix/<command>.log`. Call once at startup.
pub fn init_subscriber(verbose: bool, command: &str) {
    use tracing_subscriber::fmt::writer::MakeWriterExt as _;
    use tracing_subscriber::{
        Layer as _, filter::LevelFilter, fmt, layer::SubscriberExt as _,
        util::SubscriberInitExt as _,
    };

    let console_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let make_writer = std::io::stderr
        .with_max_level(Level::WARN)
        .and(std::io::stdout.with_min_level(Level::INFO));
    let console_layer = fmt::layer()
        .event_format(ConsoleFormatter)
        .with_writer(make_writer)
        .with_filter(console_level);
    let file_layer = FileLayer::new(command).map(|l| l.with_filter(LevelFilter::DEBUG));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
}
