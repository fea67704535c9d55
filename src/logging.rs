use blip_mux::Mailbox;
use colored::*;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;

/// Console formatter for the echo harness.
///
/// Events emitted from inside an actor closure are prefixed with the name
/// of the mailbox that is executing, so interleaved output from the
/// connection actors and echoers stays attributable. Warnings and errors
/// are highlighted; debug and trace output is dimmed.
pub struct HarnessFormatter;

impl<S, N> FormatEvent<S, N> for HarnessFormatter
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
        let mut fields = String::new();
        ctx.format_fields(Writer::new(&mut fields).by_ref(), event)?;

        if let Some(mailbox) = Mailbox::current() {
            write!(writer, "{} ", format!("[{}]", mailbox.name()).dimmed())?;
        }
        let line = match *event.metadata().level() {
            Level::ERROR => fields.red().bold(),
            Level::WARN => fields.yellow(),
            Level::INFO => fields.normal(),
            Level::DEBUG | Level::TRACE => fields.dimmed(),
        };
        writeln!(writer, "{line}")
    }
}
