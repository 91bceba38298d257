//! Terminal output: tracing formatting, secret redaction and progress bars.

use std::{
    fmt::Write as _,
    io::{self, Write as _},
    str::FromStr,
};

use clap_verbosity_flag::{InfoLevel, Verbosity};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressState, ProgressStyle};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::{
    EnvFilter,
    filter::Directive,
    fmt::{
        FmtContext, FormatEvent, FormatFields, MakeWriter,
        format::{self, Format, Writer},
    },
    prelude::*,
    registry::LookupSpan,
};

lazy_static::lazy_static! {
    // anaconda.org tokens embedded in channel urls: /t/<token>/
    static ref CONDA_TOKEN: regex::Regex =
        regex::Regex::new(r"(/t/)([a-zA-Z0-9\-]{20,})").expect("valid regex");
    // `Authorization: token <token>` headers that end up in debug output
    static ref AUTH_HEADER: regex::Regex =
        regex::Regex::new(r"(?i)(token )([a-zA-Z0-9\-_]{20,})").expect("valid regex");
}

/// Owns the progress bars and makes sure log lines do not tear through them.
#[derive(Clone, Debug, Default)]
pub struct LoggingOutputHandler {
    progress_bars: MultiProgress,
}

impl LoggingOutputHandler {
    /// Add a progress bar that is drawn below the log output.
    pub fn add_progress_bar(&self, progress_bar: ProgressBar) -> ProgressBar {
        self.progress_bars.add(progress_bar)
    }

    /// Style for a progress bar that counts downloaded bytes.
    pub fn default_bytes_style(&self) -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} {prefix:20!} [{elapsed_precise}] [{bar:40!.bright.yellow/dim.white}] {bytes:>8} @ {smoothed_bytes_per_sec:8}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━━╾─")
            .with_key(
                "smoothed_bytes_per_sec",
                |s: &ProgressState, w: &mut dyn std::fmt::Write| match (s.pos(), s.elapsed().as_millis()) {
                    (pos, elapsed_ms) if elapsed_ms > 0 => {
                        _ = write!(w, "{}/s", HumanBytes((pos as f64 * 1000_f64 / elapsed_ms as f64) as u64));
                    }
                    _ => {
                        _ = write!(w, "-");
                    }
                },
            )
    }

    fn writer(&self) -> IndicatifWriter {
        IndicatifWriter::new(self.progress_bars.clone())
    }
}

#[derive(Clone)]
pub struct IndicatifWriter {
    progress_bars: MultiProgress,
}

impl IndicatifWriter {
    pub(crate) fn new(pb: MultiProgress) -> Self {
        Self { progress_bars: pb }
    }
}

impl io::Write for IndicatifWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.progress_bars.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.progress_bars.suspend(|| io::stderr().flush())
    }
}

impl<'a> MakeWriter<'a> for IndicatifWriter {
    type Writer = IndicatifWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Prints our own INFO events as bare messages and everything else in the
/// default tracing format.
pub struct TracingFormatter;

impl<S, N> FormatEvent<S, N> for TracingFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();

        let mut buffer = String::new();
        let mut custom_writer = Writer::new(&mut buffer);

        if *metadata.level() == tracing_core::metadata::Level::INFO
            && metadata.target().starts_with("forge_mirror")
        {
            ctx.format_fields(custom_writer.by_ref(), event)?;
            writeln!(custom_writer)?;
        } else {
            let default_format = Format::default();
            default_format.format_event(ctx, custom_writer, event)?;
        }

        writer.write_str(&filter_secrets(&buffer))
    }
}

/// Redact anaconda.org tokens from a log line.
pub fn filter_secrets(line: &str) -> String {
    let line = CONDA_TOKEN.replace_all(line, "$1<token>");
    AUTH_HEADER.replace_all(&line, "$1<token>").into_owned()
}

/// The default filter: our crates at the requested level, dependencies only
/// when they have something to warn about.
pub fn get_default_env_filter(verbose: clap_verbosity_flag::log::LevelFilter) -> EnvFilter {
    let level = match verbose {
        clap_verbosity_flag::log::LevelFilter::Off => "off",
        clap_verbosity_flag::log::LevelFilter::Error => "error",
        clap_verbosity_flag::log::LevelFilter::Warn => "warn",
        clap_verbosity_flag::log::LevelFilter::Info => "info",
        clap_verbosity_flag::log::LevelFilter::Debug => "debug",
        clap_verbosity_flag::log::LevelFilter::Trace => "trace",
    };

    let mut result = EnvFilter::new(format!("forge_mirror={level}"));
    for directive in [
        format!("forge_mirror_networking={level}"),
        format!("forge_mirror_recipe_generator={level}"),
        if verbose >= clap_verbosity_flag::log::LevelFilter::Trace {
            "reqwest_retry=info".to_string()
        } else {
            "reqwest_retry=warn".to_string()
        },
    ] {
        if let Ok(directive) = Directive::from_str(&directive) {
            result = result.add_directive(directive);
        }
    }
    result
}

/// Install the global tracing subscriber. `RUST_LOG` takes precedence over
/// the verbosity flags when set.
pub fn init_logging(verbose: &Verbosity<InfoLevel>) -> LoggingOutputHandler {
    let handler = LoggingOutputHandler::default();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| get_default_env_filter(verbose.log_level_filter()));

    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .with_writer(handler.writer())
            .event_format(TracingFormatter),
    );
    if let Err(err) = registry.try_init() {
        eprintln!("failed to initialize logging: {err}");
    }

    handler
}
