use std::fmt::{self, Write as _};
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const LAYER_WIDTH: usize = 9;

/// ANSI sequences, empty when output is not a terminal
struct Palette {
    reset: &'static str,
    dim: &'static str,
    layer: &'static str,
    error: &'static str,
    warn: &'static str,
    info: &'static str,
    debug: &'static str,
}

impl Palette {
    const COLORED: Palette = Palette {
        reset: "\x1b[0m",
        dim: "\x1b[90m",
        layer: "\x1b[36m",
        error: "\x1b[91m",
        warn: "\x1b[93m",
        info: "\x1b[32m",
        debug: "\x1b[90m",
    };

    const PLAIN: Palette = Palette {
        reset: "",
        dim: "",
        layer: "",
        error: "",
        warn: "",
        info: "",
        debug: "",
    };

    fn level(&self, level: &Level) -> &'static str {
        match *level {
            Level::ERROR => self.error,
            Level::WARN => self.warn,
            Level::INFO => self.info,
            Level::DEBUG | Level::TRACE => self.debug,
        }
    }
}

/// Line format: `time level layer | message key=value ...`
///
/// The layer column names the part of the client that logged: `wire`,
/// `session`, `auth`, `connect`, `client` or the `component` field of CLI
/// events.
pub struct CastLogFormatter {
    palette: &'static Palette,
}

impl Default for CastLogFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl CastLogFormatter {
    pub fn new() -> Self {
        Self::with_color(is_terminal())
    }

    fn with_color(color: bool) -> Self {
        Self {
            palette: if color {
                &Palette::COLORED
            } else {
                &Palette::PLAIN
            },
        }
    }
}

/// Column for an event from `target`
fn layer_of<'a>(target: &'a str, component: Option<&'a str>) -> &'a str {
    if let Some(component) = component {
        return component;
    }
    let mut parts = target.split("::");
    match (parts.next(), parts.next()) {
        (Some("cast_wire"), _) => "wire",
        (Some("cast_session"), Some("connector")) => "connect",
        (Some("cast_session"), Some("transport")) => "connect",
        (Some("cast_session"), Some("auth")) => "auth",
        (Some("cast_session"), Some("client")) => "client",
        (Some("cast_session"), _) => "session",
        (Some("castv2"), Some(module)) => module,
        (Some(other), _) => other,
        (None, _) => "",
    }
}

fn level_tag(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERR",
        Level::WARN => "WRN",
        Level::INFO => "INF",
        Level::DEBUG => "DBG",
        Level::TRACE => "TRC",
    }
}

impl<S, N> FormatEvent<S, N> for CastLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let p = self.palette;
        let meta = event.metadata();

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let mut layer: String = layer_of(meta.target(), fields.component.as_deref())
            .chars()
            .take(LAYER_WIDTH)
            .collect();
        while layer.chars().count() < LAYER_WIDTH {
            layer.push(' ');
        }

        write!(
            writer,
            "{}{}{} {}{}{} {}{}{} | {}",
            p.dim,
            chrono::Local::now().format("%H:%M:%S%.3f"),
            p.reset,
            p.level(meta.level()),
            level_tag(meta.level()),
            p.reset,
            p.layer,
            layer,
            p.reset,
            fields.message,
        )?;
        if !fields.extra.is_empty() {
            write!(writer, " {}{}{}", p.dim, fields.extra, p.reset)?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: String,
}

impl FieldVisitor {
    fn record(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            "component" => self.component = Some(value),
            _ => {
                if !self.extra.is_empty() {
                    self.extra.push(' ');
                }
                let _ = write!(self.extra, "{}={}", name, value);
            }
        }
    }
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let mut rendered = format!("{:?}", value);
        if let Some(inner) = rendered.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
            rendered = inner.to_string();
        }
        self.record(field.name(), rendered);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.record(field.name(), value.to_string());
    }
}

fn is_terminal() -> bool {
    std::env::var_os("NO_COLOR").is_none()
        && std::env::var("TERM").map_or(true, |term| term != "dumb")
        && std::io::stderr().is_terminal()
}
