use std::{net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use log::Level;
use serde::Deserialize;

/// A small closed set, parsed either from a CLI flag or a config file
/// value.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            other => anyhow::bail!("unknown log level: {other}"),
        })
    }
}

impl LogLevel {
    pub fn as_level(&self) -> Level {
        match self {
            Self::Error => Level::Error,
            Self::Warn => Level::Warn,
            Self::Info => Level::Info,
            Self::Debug => Level::Debug,
            Self::Trace => Level::Trace,
        }
    }
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:9000".parse().unwrap()
}

/// The relay's configuration. Unlike the agent, the relay has no
/// per-invocation rule arguments, so a flat `clap::Parser` struct doubles
/// as the whole configuration surface — no separate TOML file is
/// required, though one may be layered in via `--config`.
#[derive(Clone, Debug, Parser)]
#[command(about = "A channel-multiplexing TCP forwarding relay", version)]
pub struct Config {
    /// Address the relay's WebSocket upgrade endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:9000")]
    pub listen: SocketAddr,

    /// Optional TOML config file overlaying defaults (keys match the
    /// long flag names, kebab-case).
    #[arg(long)]
    pub config: Option<String>,

    /// Shorthand for `--log-level debug`.
    #[arg(long)]
    pub debug: bool,

    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,

    /// PEM certificate chain for TLS termination in front of the
    /// upgrade endpoint. Requires `--key` and the `ssl` build feature;
    /// TLS itself stays an optional transport concern, never a protocol
    /// one — the framed-packet core has no idea whether it is running
    /// over plain or TLS-wrapped HTTP.
    #[arg(long, requires = "key")]
    pub cert: Option<String>,

    /// PEM private key paired with `--cert`.
    #[arg(long, requires = "cert")]
    pub key: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct FileOverrides {
    listen: Option<SocketAddr>,
    log_level: Option<LogLevel>,
    cert: Option<String>,
    key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(path) = config.config.clone() {
            let text = std::fs::read_to_string(&path)?;
            let overrides: FileOverrides = toml::from_str(&text)?;

            if let Some(listen) = overrides.listen {
                config.listen = listen;
            }
            if let Some(level) = overrides.log_level {
                config.log_level = level;
            }
            if overrides.cert.is_some() {
                config.cert = overrides.cert;
            }
            if overrides.key.is_some() {
                config.key = overrides.key;
            }
        }

        if config.debug {
            config.log_level = LogLevel::Debug;
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            config: None,
            debug: false,
            log_level: LogLevel::Info,
            cert: None,
            key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn cert_requires_key_and_vice_versa() {
        assert!(Config::try_parse_from(["waypoint-relay", "--cert", "c.pem"]).is_err());
        assert!(Config::try_parse_from(["waypoint-relay", "--key", "k.pem"]).is_err());
        assert!(Config::try_parse_from([
            "waypoint-relay",
            "--cert",
            "c.pem",
            "--key",
            "k.pem"
        ])
        .is_ok());
    }
}
