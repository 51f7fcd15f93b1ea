use std::sync::Once;

use tracing::Level;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a global fmt subscriber at `level`. `RUST_LOG` overrides the
/// level when set. Later calls are no-ops, as is a call made after another
/// global subscriber was installed elsewhere.
pub fn init(level: Level) {
    INIT.call_once(|| {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter(level))
            .with_target(false)
            .try_init()
            .is_ok();
        if installed {
            tracing::info!("Tracing initialized at level = {}", level);
        }
    });
}

/// Same as `init`, with a `component` label on every line.
pub fn init_with_component(level: Level, component: &str) {
    let component = component.to_string();
    INIT.call_once(|| {
        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter(level))
            .with_target(true)
            .with_thread_names(true)
            .try_init()
            .is_ok();
        if installed {
            tracing::info!(component = %component, "Tracing initialized at level = {}", level);
        }
    });
}

/// `init` from a textual level such as `"debug"`.
pub fn init_from_str(level: &str) {
    init(parse_level(level));
}

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()))
}

pub fn parse_level(s: &str) -> Level {
    match s.trim().to_ascii_lowercase().as_str() {
        "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARNING"), Level::WARN);
        assert_eq!(parse_level(" debug "), Level::DEBUG);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(Level::DEBUG);
        init(Level::TRACE);
        init_with_component(Level::INFO, "nostr-connect");
    }
}
