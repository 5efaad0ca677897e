use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 25252;
/// Longest accepted command line, terminator excluded.
pub const DEFAULT_LINE_MAX: usize = 4095;
pub const DEFAULT_BUF_SIZE: usize = 4096;
pub const DEFAULT_MAX_EVENTS: usize = 1024;

/// Daemon settings. Every field has a default so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub max_line: usize,
    /// Scratch buffer size for one read.
    pub buf_size: usize,
    pub max_events: usize,
    /// Reads (or accepts, or signal records) one callback may consume before
    /// it yields and re-queues itself.
    pub read_budget: usize,
    /// Children reaped per signal drain.
    pub reap_budget: usize,
    /// Pending client output above which the pipeline's output is paused.
    pub outbox_high_water: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_line: DEFAULT_LINE_MAX,
            buf_size: DEFAULT_BUF_SIZE,
            max_events: DEFAULT_MAX_EVENTS,
            read_budget: 16,
            reap_budget: 64,
            outbox_high_water: 64 * 1024,
        }
    }
}

impl Config {
    /// Reads a JSON config file, or returns the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let cfg = match path {
            None => Config::default(),
            Some(p) => {
                let raw = fs::read_to_string(p).map_err(|source| ConfigError::Read { path: p.to_path_buf(), source })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::Malformed { path: p.to_path_buf(), source })?
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("max_line", self.max_line),
            ("buf_size", self.buf_size),
            ("max_events", self.max_events),
            ("read_budget", self.read_budget),
            ("reap_budget", self.reap_budget),
            ("outbox_high_water", self.outbox_high_water),
        ];
        match sizes.iter().find(|(_, v)| *v == 0) {
            Some((field, _)) => Err(ConfigError::Zero { field: *field }),
            None => Ok(()),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_listen_on_the_standard_port() {
        let cfg = Config::load(None).unwrap();
        assert_eq!(cfg.port, 25252);
        assert_eq!(cfg.max_line, 4095);
        assert_eq!(cfg.listen_addr().to_string(), "0.0.0.0:25252");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"port": 4000, "bind": "127.0.0.1", "read_budget": 2}}"#).unwrap();
        let cfg = Config::load(Some(f.path())).unwrap();
        assert_eq!(cfg.listen_addr().to_string(), "127.0.0.1:4000");
        assert_eq!(cfg.read_budget, 2);
        assert_eq!(cfg.buf_size, DEFAULT_BUF_SIZE);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"{{"prot": 4000}}"#).unwrap();
        assert!(matches!(Config::load(Some(f.path())), Err(ConfigError::Malformed { .. })));
    }

    #[test]
    fn zero_budget_is_invalid() {
        let cfg = Config { read_budget: 0, ..Config::default() };
        match cfg.validate() {
            Err(ConfigError::Zero { field }) => assert_eq!(field, "read_budget"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load(Some(Path::new("/nonexistent/unshd.json"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/unshd.json"));
    }
}
