//! Tracing setup shared by the pool host and the unit binary.
//!
//! `RUST_LOG` wins when set. Otherwise `ISOPOOL_LOG` picks the level for the
//! crate's own targets. `LOG_FORMAT=json` switches to structured output.
//! Everything goes to stderr because stdout carries the unit protocol.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Env var selecting the crate log level when `RUST_LOG` is unset.
pub const ENV_LOG: &str = "ISOPOOL_LOG";

/// Install a global subscriber. Later calls are no-ops.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var(ENV_LOG).ok().as_deref());
        EnvFilter::new(filter_directives(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn base_level(requested: Option<&str>) -> &'static str {
    match requested {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

// Frame-level codec chatter stays off unless asked for through RUST_LOG.
fn filter_directives(level: &str) -> String {
    format!(
        "isopool={level},isopool_unit={level},closure_lint={level},isopool::bridge::codec=off"
    )
}
