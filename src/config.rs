//! Listener and runtime configuration.
//!
//! Listener options map one-to-one onto the engine's endpoint model: scheme,
//! host, port, path prefix, TLS material, and an optional redirect port for
//! plain-HTTP listeners that bounce clients to the TLS endpoint. Runtime
//! options come from the environment: `PORT` (default port),
//! `WIKISERVE_DEBUG` (verbose engine traces), and `WIKISERVE_STACK_SIZE`
//! (coroutine stack size, decimal or `0x` hex).

use std::env;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8080;

/// Request-body ceiling applied when a listener does not set its own.
pub const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// `"0"` asks the OS for a port; anything unparseable falls back to the
    /// `PORT` environment variable and then 8080.
    pub port: Option<String>,
    pub host: Option<String>,
    /// Empty, or starts with `/` and does not end with `/`.
    pub prefix: String,
    pub secure: bool,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    /// When set, every request on this listener is 302-redirected to
    /// `https://<host>:<redirect><path>`.
    pub redirect: Option<u16>,
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            port: None,
            host: None,
            prefix: String::new(),
            secure: false,
            key: None,
            cert: None,
            redirect: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl ListenerConfig {
    /// Resolve the port per the listener rules: `"0"` means OS-chosen, a
    /// numeric string is parsed, and anything missing or invalid falls back
    /// to `PORT` and then 8080.
    pub fn resolve_port(&self) -> u16 {
        match self.port.as_deref() {
            Some(raw) => parse_port(raw).unwrap_or_else(env_default_port),
            None => env_default_port(),
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host(), self.resolve_port())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.prefix.is_empty() {
            if !self.prefix.starts_with('/') {
                anyhow::bail!("listener prefix {:?} must start with '/'", self.prefix);
            }
            if self.prefix.ends_with('/') {
                anyhow::bail!("listener prefix {:?} must not end with '/'", self.prefix);
            }
        }
        if self.secure && (self.key.is_none() || self.cert.is_none()) {
            anyhow::bail!("secure listener requires both key and cert paths");
        }
        Ok(())
    }
}

fn parse_port(raw: &str) -> Option<u16> {
    if raw == "0" {
        return Some(0);
    }
    raw.parse::<u16>().ok().filter(|p| *p != 0)
}

fn env_default_port() -> u16 {
    env::var("PORT")
        .ok()
        .and_then(|raw| parse_port(&raw))
        .unwrap_or(DEFAULT_PORT)
}

/// Runtime knobs loaded once at startup.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Coroutine stack size in bytes (default 64 KiB).
    pub stack_size: usize,
    /// Raises the default trace level when `RUST_LOG` is unset.
    pub debug: bool,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let stack_size = match env::var("WIKISERVE_STACK_SIZE") {
            Ok(val) => {
                if let Some(hex) = val.strip_prefix("0x") {
                    usize::from_str_radix(hex, 16).unwrap_or(0x10000)
                } else {
                    val.parse().unwrap_or(0x10000)
                }
            }
            Err(_) => 0x10000,
        };
        let debug = env::var("WIKISERVE_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        RuntimeConfig { stack_size, debug }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_zero_means_os_chosen() {
        let cfg = ListenerConfig {
            port: Some("0".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_port(), 0);
    }

    #[test]
    fn test_numeric_port_parsed() {
        let cfg = ListenerConfig {
            port: Some("3456".to_string()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_port(), 3456);
    }

    #[test]
    fn test_invalid_port_falls_back() {
        let cfg = ListenerConfig {
            port: Some("not-a-port".to_string()),
            ..Default::default()
        };
        // PORT is unset in the test environment
        if env::var("PORT").is_err() {
            assert_eq!(cfg.resolve_port(), DEFAULT_PORT);
        }
    }

    #[test]
    fn test_prefix_validation() {
        let mut cfg = ListenerConfig {
            prefix: "/wiki".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());

        cfg.prefix = "wiki".to_string();
        assert!(cfg.validate().is_err());

        cfg.prefix = "/wiki/".to_string();
        assert!(cfg.validate().is_err());

        cfg.prefix = String::new();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_secure_requires_material() {
        let cfg = ListenerConfig {
            secure: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
