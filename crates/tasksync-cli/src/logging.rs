
use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "TASKSYNC_LOG";

pub fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level(verbose)))
}

/// Interactive runs log to stderr.
pub fn init(verbose: u8) {
    let _ = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// Detached workers log to their per-PID file when asked to, and nowhere otherwise.
pub fn init_background(log_to_file: bool) {
    if !log_to_file {
        return;
    }
    let path = tasksync_core::background::log_path(std::process::id());
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    let _ = tracing_subscriber::registry()
        .with(filter(2))
        .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::default_level;

    #[test]
    fn verbosity_raises_level() {
        assert_eq!(default_level(0), "warn");
        assert_eq!(default_level(1), "info");
        assert_eq!(default_level(5), "debug");
    }
}
