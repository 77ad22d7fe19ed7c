//! Subscriber setup for the `wasmhost` binary.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_DIRECTIVE: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl LogFormat {
    pub fn from_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Plain
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the global subscriber, writing to stderr so stdout stays
/// machine-readable. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    static INITIALISED: OnceLock<()> = OnceLock::new();

    INITIALISED.get_or_init(|| {
        let use_ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
        let builder = fmt::fmt()
            .with_env_filter(env_filter())
            .with_writer(std::io::stderr)
            .with_target(true);
        // another subscriber may already be installed by an embedding program
        let _ = match format {
            LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
            LogFormat::Plain => {
                tracing::subscriber::set_global_default(builder.with_ansi(use_ansi).finish())
            }
        };
    });
}
