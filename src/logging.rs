use anyhow::{Context, Result};
use colored::*;
use std::fmt;
use std::path::Path;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// A custom tracing event formatter for colorizing log output based on level.
///
/// The whole line is colored by severity. Active spans are printed as a
/// prefix (`rank{rank=2}: ...`) so interleaved ranks can be told apart; no
/// timestamps or level names are printed.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the line so the color applies to all of it
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(buf_writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) =
                    extensions.get::<tracing_subscriber::fmt::FormattedFields<N>>()
                {
                    if !fields.is_empty() {
                        write!(buf_writer, "{{{}}}", fields)?;
                    }
                }
                write!(buf_writer, ": ")?;
            }
        }
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_output = match *event.metadata().level() {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Default filter directive for the command-line verbosity flags
pub fn level_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber
///
/// Console output goes to stderr through [`ColorizedFormatter`]; stdout is
/// left to the report. `RUST_LOG` overrides the level picked by the flags.
/// With `log_file`, every event is also written to that file; keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init_logging(
    verbosity: u8,
    quiet: bool,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>> {
    let directive = level_directive(verbosity, quiet);
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let console = tracing_subscriber::fmt::layer()
        .event_format(ColorizedFormatter)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install the log subscriber")?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive(0, false), "info");
        assert_eq!(level_directive(1, false), "debug");
        assert_eq!(level_directive(5, false), "trace");
        assert_eq!(level_directive(3, true), "error");
    }

    #[test]
    fn test_colorized_formatter_prefixes_spans() {
        let buffer = std::sync::Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
        let sink = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(ColorizedFormatter)
            .with_writer(move || SinkWriter(sink.clone()))
            .finish();

        colored::control::set_override(false);
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("rank", rank = 3);
            let _entered = span.enter();
            tracing::info!("ring closed");
        });

        let text = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert_eq!(text.trim_end(), "rank{rank=3}: ring closed");
    }

    struct SinkWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for SinkWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
