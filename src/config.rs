//! Server configuration
//!
//! The listening port is resolved in priority order: explicit argument,
//! then the `PGM_SERVER_PORT` environment variable, then the built-in
//! default. An invalid candidate (non-decimal, out of range) falls
//! through to the default rather than aborting. Privileged ports are
//! downgraded to 0 so the OS picks an ephemeral one.

use std::env;
use std::path::PathBuf;
use tracing::warn;

/// Built-in fallback port.
pub const DEFAULT_PORT: u16 = 6666;

/// Environment variable consulted when no port argument is given.
pub const PORT_ENV_VAR: &str = "PGM_SERVER_PORT";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening port; 0 lets the OS pick.
    pub port: u16,
    /// Root directory holding the `<username>_user` mailbox directories.
    pub data_dir: PathBuf,
}

impl ServerConfig {
    /// Build a configuration from an optional port argument plus the
    /// environment.
    ///
    /// Reads from `.env` if present.
    #[must_use]
    pub fn from_args(port_arg: Option<&str>) -> Self {
        dotenvy::dotenv().ok();

        Self {
            port: resolve_port(port_arg, env::var(PORT_ENV_VAR).ok().as_deref()),
            data_dir: PathBuf::from("."),
        }
    }

    /// Build a configuration from the environment alone.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_args(None)
    }
}

/// Resolve the listening port from the first present candidate.
#[must_use]
pub fn resolve_port(arg: Option<&str>, env_value: Option<&str>) -> u16 {
    let candidate = arg.or(env_value);
    let port = match candidate.map(|s| s.trim().parse::<u16>()) {
        Some(Ok(port)) => port,
        Some(Err(_)) => {
            warn!(
                "invalid port {:?}, falling back to {}",
                candidate.unwrap_or_default(),
                DEFAULT_PORT
            );
            DEFAULT_PORT
        }
        None => DEFAULT_PORT,
    };

    if (1..=1023).contains(&port) {
        warn!("privileged port {port} requested, letting the OS pick instead");
        0
    } else {
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_wins_over_environment() {
        assert_eq!(resolve_port(Some("7777"), Some("8888")), 7777);
    }

    #[test]
    fn environment_wins_over_default() {
        assert_eq!(resolve_port(None, Some("8888")), 8888);
    }

    #[test]
    fn absent_candidates_fall_to_default() {
        assert_eq!(resolve_port(None, None), DEFAULT_PORT);
    }

    #[test]
    fn invalid_candidates_fall_to_default() {
        assert_eq!(resolve_port(Some("not-a-port"), None), DEFAULT_PORT);
        assert_eq!(resolve_port(Some("70000"), None), DEFAULT_PORT);
        assert_eq!(resolve_port(Some("-1"), None), DEFAULT_PORT);
        assert_eq!(resolve_port(None, Some("12x")), DEFAULT_PORT);
    }

    #[test]
    fn privileged_ports_downgrade_to_ephemeral() {
        assert_eq!(resolve_port(Some("1"), None), 0);
        assert_eq!(resolve_port(Some("80"), None), 0);
        assert_eq!(resolve_port(Some("1023"), None), 0);
        assert_eq!(resolve_port(Some("1024"), None), 1024);
    }

    #[test]
    fn zero_is_allowed() {
        assert_eq!(resolve_port(Some("0"), None), 0);
    }
}
