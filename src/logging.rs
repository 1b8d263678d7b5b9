use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable
pub const DEFAULT_FILTER: &str = "info";

/// Tracing event formatter that colors each line by level
///
/// Lines carry a wall-clock time prefix since harness runs are read back
/// against the statistics files. Warnings and errors also get their level
/// tag so they survive `NO_COLOR`.
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
        let level = *event.metadata().level();
        let mut buffer = match level {
            Level::WARN => String::from("WARN "),
            Level::ERROR => String::from("ERROR "),
            _ => String::new(),
        };
        ctx.format_fields(Writer::new(&mut buffer), event)?;

        let line = match level {
            Level::INFO => buffer.white(),
            Level::WARN => buffer.yellow(),
            Level::ERROR => buffer.red(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };

        let now = chrono::Local::now().format("%H:%M:%S%.3f");
        writeln!(writer, "{} {}", now.to_string().dimmed(), line)
    }
}

/// Install the global subscriber
///
/// Verbosity follows `RUST_LOG`, defaulting to [`DEFAULT_FILTER`].
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ColorizedFormatter)
        .init();
}
