//! Diagnostics setup.
//!
//! The tuner logs through `tracing`. When loaded by the host, events are
//! routed to the host's debug logger under its TUNING subsystem so they
//! interleave with the host's own output; otherwise they go to stderr.
//!
//! The subscriber is process global. The first successful [`init`] wins and
//! later calls are no-ops, which matches a host that initializes one tuner
//! per communicator.

use std::ffi::{c_char, c_int, c_ulong, CString};
use std::fmt::Write as _;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::Verbosity;

/// Environment variable holding a `tracing` filter directive that overrides
/// the configured verbosity.
pub const LOG_FILTER_ENV: &str = "NCCL_TUNER_LOG";

/// Host debug logger: `(level, subsystem flags, file, line, fmt, ...)`.
pub type HostLogFn =
    unsafe extern "C" fn(c_int, c_ulong, *const c_char, c_int, *const c_char, ...);

// Host log levels and subsystem.
const HOST_LOG_WARN: c_int = 2;
const HOST_LOG_INFO: c_int = 3;
const HOST_LOG_TRACE: c_int = 5;
const HOST_SUBSYS_TUNING: c_ulong = 0x40;

impl Verbosity {
    fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Silent => LevelFilter::OFF,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Verbose => LevelFilter::TRACE,
        }
    }
}

/// Install the process-wide subscriber.
///
/// Returns false if a subscriber was already installed (by an earlier call
/// or by the embedding application).
pub fn init(verbosity: Verbosity, host_logger: Option<HostLogFn>) -> bool {
    // Silent is absolute; the override variable cannot re-enable output.
    let filter = match verbosity {
        Verbosity::Silent => EnvFilter::new("off"),
        _ => EnvFilter::builder()
            .with_default_directive(verbosity.level_filter().into())
            .with_env_var(LOG_FILTER_ENV)
            .from_env_lossy(),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match host_logger {
        Some(log_fn) => registry.with(HostLogLayer { log_fn }).try_init().is_ok(),
        None => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .is_ok(),
    }
}

/// Forwards events to the host's debug logger.
struct HostLogLayer {
    log_fn: HostLogFn,
}

impl<S: Subscriber> Layer<S> for HostLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let level = host_level(meta.level());

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let Ok(message) = CString::new(format!("BANDIT-TUNER: {}", visitor.line)) else {
            return;
        };
        let file = CString::new(meta.file().unwrap_or("")).unwrap_or_default();
        let line = meta.line().unwrap_or(0) as c_int;
        // SAFETY: the host guarantees the logger stays valid while the
        // plugin is loaded; every pointer passed is a live NUL-terminated
        // string, and "%s" consumes exactly the one vararg supplied.
        unsafe {
            (self.log_fn)(
                level,
                HOST_SUBSYS_TUNING,
                file.as_ptr(),
                line,
                c"%s".as_ptr(),
                message.as_ptr(),
            );
        }
    }
}

fn host_level(level: &Level) -> c_int {
    match *level {
        Level::ERROR | Level::WARN => HOST_LOG_WARN,
        Level::INFO => HOST_LOG_INFO,
        Level::DEBUG | Level::TRACE => HOST_LOG_TRACE,
    }
}

/// Flattens an event into `message key=value ...`.
#[derive(Default)]
struct MessageVisitor {
    line: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if !self.line.is_empty() {
            self.line.push(' ');
        }
        if field.name() == "message" {
            let _ = write!(self.line, "{:?}", value);
        } else {
            let _ = write!(self.line, "{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.record_debug(field, &format_args!("{}", value));
        } else {
            self.record_debug(field, &value);
        }
    }
}
