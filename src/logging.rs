use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Tracing event formatter that colors the whole line by severity.
///
/// Meant for user-facing consolidation output: no timestamps or level
/// prefixes, just the message in a color matching its severity.
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
        // Fields are buffered first so the color can wrap the whole line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let colored_line = match *event.metadata().level() {
            Level::ERROR => buffer.red().bold(),
            Level::WARN => buffer.yellow(),
            Level::INFO => buffer.normal(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.dimmed(),
        };

        writeln!(writer, "{}", colored_line)
    }
}

/// Install a colorized subscriber filtered by `RUST_LOG`.
///
/// Convenience for embedders and examples; returns quietly when a global
/// subscriber is already set, so tests can call it repeatedly.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .event_format(ColorizedFormatter)
        .try_init();
}
