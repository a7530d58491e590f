use anyhow::{Context, Result};
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";

/// Runtime settings, read from the environment (and `.env`). Command line
/// flags override individual values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind: String,
    pub port: u16,
    pub server_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // We use ~/.neighborly/chat.db unless told otherwise
        let db_path = match lookup("NEIGHBORLY_DB") {
            Some(path) => PathBuf::from(path),
            None => {
                let home_dir = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".neighborly").join("chat.db")
            }
        };

        let port = match lookup("NEIGHBORLY_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("NEIGHBORLY_PORT is not a valid port: {}", raw))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            db_path,
            bind: lookup("NEIGHBORLY_BIND").unwrap_or_else(|| DEFAULT_BIND.into()),
            port,
            server_url: lookup("NEIGHBORLY_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.into()),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_live_under_home() {
        let config = config_from(&[("HOME", "/home/neighbor")]).unwrap();
        assert_eq!(
            config.db_path,
            PathBuf::from("/home/neighbor/.neighborly/chat.db")
        );
        assert_eq!(config.listen_addr(), "0.0.0.0:3000");
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = config_from(&[
            ("NEIGHBORLY_DB", "/tmp/chat.db"),
            ("NEIGHBORLY_BIND", "127.0.0.1"),
            ("NEIGHBORLY_PORT", "8080"),
            ("NEIGHBORLY_URL", "http://chat.local"),
        ])
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.listen_addr(), "127.0.0.1:8080");
        assert_eq!(config.server_url, "http://chat.local");
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(config_from(&[("NEIGHBORLY_PORT", "lots")]).is_err());
    }
}
