//! Subscriber setup.
//!
//! `IX_LOG` takes an `EnvFilter` directive and wins over `-v`. `IX_LOG_FORMAT`
//! selects `text` (default) or `json`. Events go to stderr so stdout stays
//! machine-readable.

use anyhow::{bail, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Default directive for a `-v` count.
pub fn default_directive(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

pub fn parse_format(raw: Option<&str>) -> Result<LogFormat> {
    match raw.map(str::trim) {
        None | Some("") | Some("text") => Ok(LogFormat::Text),
        Some("json") => Ok(LogFormat::Json),
        Some(other) => bail!("invalid IX_LOG_FORMAT '{other}' (expected text or json)"),
    }
}

fn build_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_env("IX_LOG").unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)))
}

/// Install the global subscriber.
pub fn init(verbose: u8) -> Result<()> {
    let format = parse_format(std::env::var("IX_LOG_FORMAT").ok().as_deref());
    let registry = Registry::default().with(build_filter(verbose));
    match format {
        Ok(LogFormat::Json) => {
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_writer(std::io::stderr);
            registry.with(layer).try_init()?
        }
        Ok(LogFormat::Text) | Err(_) => {
            let layer = fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr);
            registry.with(layer).try_init()?
        }
    }
    format.map(|_| ())
}
