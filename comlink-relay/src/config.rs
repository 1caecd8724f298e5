//! Load relay config from file and environment.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use comlink_core::LinkConfig;
use serde::Deserialize;
use tracing::warn;

/// Relay configuration. File: ~/.config/comlink/relay.toml or /etc/comlink/relay.toml.
/// Env overrides: COMLINK_RELAY_NAME, COMLINK_QUEUE_SIZE, COMLINK_FILE_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name the relay answers to (default "PC").
    #[serde(default = "default_name")]
    pub name: String,
    /// Accept devices dialing in on this address.
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    /// Devices the relay dials at startup, by name.
    #[serde(default)]
    pub devices: BTreeMap<String, SocketAddr>,
    #[serde(default)]
    pub link: LinkConfig,
}

fn default_name() -> String {
    "PC".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            listen: None,
            devices: BTreeMap::new(),
            link: LinkConfig::default(),
        }
    }
}

/// Load config: defaults, then the config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("COMLINK_RELAY_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    if let Ok(s) = std::env::var("COMLINK_QUEUE_SIZE") {
        match s.parse::<usize>() {
            Ok(n) if n > 0 => c.link.uplink_queue_capacity = n,
            _ => warn!(value = %s, "ignoring COMLINK_QUEUE_SIZE"),
        }
    }
    if let Ok(s) = std::env::var("COMLINK_FILE_DIR") {
        c.link.file_dir = PathBuf::from(s);
    }
    c
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/comlink/relay.toml"));
    }
    out.push(PathBuf::from("/etc/comlink/relay.toml"));
    out
}

fn load_file() -> Option<Config> {
    let p = config_paths().into_iter().find(|p| p.exists())?;
    let s = match std::fs::read_to_string(&p) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %p.display(), error = %e, "cannot read config, using defaults");
            return None;
        }
    };
    match parse(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %p.display(), error = %e, "invalid config, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.name, "PC");
        assert!(c.devices.is_empty());
        assert!(c.listen.is_none());
        assert_eq!(c.link.uplink_queue_capacity, 500);
    }

    #[test]
    fn devices_and_link_settings() {
        let c = parse(
            r#"
            name = "BASE"
            listen = "0.0.0.0:7070"

            [devices]
            NXT1 = "192.168.1.21:7070"
            NXT2 = "192.168.1.22:7070"

            [link]
            file_part_size = 1024
            close_timeout_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(c.name, "BASE");
        assert_eq!(c.listen, Some("0.0.0.0:7070".parse().unwrap()));
        assert_eq!(c.devices.keys().collect::<Vec<_>>(), ["NXT1", "NXT2"]);
        assert_eq!(c.link.file_part_size, 1024);
        assert_eq!(c.link.queue_capacity, 64);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
        assert!(parse("[link]\nqueue = 3").is_err());
    }
}
