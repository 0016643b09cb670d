use std::{fmt, str::FromStr};

use clap::{Parser, ValueEnum};
use codec::ForwardingRule;

/// The whole CLI surface for the agent. There is no separate
/// config-file layer — every invocation is self-contained, with rule
/// parsing returning typed results instead of panicking on malformed
/// input.
#[derive(Debug, Parser)]
#[command(about = "A TCP forwarding agent", version)]
pub struct Cli {
    pub command: Command,

    /// Base URL of the relay's WebSocket upgrade endpoint, e.g.
    /// `ws://relay.example.com:9000`.
    #[arg(long)]
    pub proxy: String,

    #[arg(long)]
    pub password: String,

    #[arg(long)]
    pub channel: String,

    /// Defaults to the machine's hostname when omitted.
    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub debug: bool,

    /// `localPort:remoteClient[:remoteHost]:remotePort`, one per peer
    /// this agent should forward to. Only meaningful for `start`.
    pub rules: Vec<RuleArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Command {
    List,
    Start,
}

/// One `--` trailing positional rule argument, already validated.
#[derive(Clone, Debug)]
pub struct RuleArg {
    pub local_port: u16,
    pub remote_client: String,
    pub remote_host: String,
    pub remote_port: u16,
}

impl From<RuleArg> for ForwardingRule {
    fn from(rule: RuleArg) -> Self {
        ForwardingRule {
            local_port: rule.local_port,
            remote_client: rule.remote_client,
            remote_host: rule.remote_host,
            remote_port: rule.remote_port,
            valid: false,
        }
    }
}

#[derive(Debug)]
pub struct RuleParseError(String);

impl fmt::Display for RuleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid forwarding rule {:?}, expected localPort:remoteClient[:remoteHost]:remotePort",
            self.0
        )
    }
}

impl std::error::Error for RuleParseError {}

impl FromStr for RuleArg {
    type Err = RuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let err = || RuleParseError(s.to_string());

        let (local_port, remote_client, remote_host, remote_port) = match parts.as_slice() {
            [local_port, remote_client, remote_port] => {
                (*local_port, *remote_client, "localhost", *remote_port)
            }
            [local_port, remote_client, remote_host, remote_port] => {
                (*local_port, *remote_client, *remote_host, *remote_port)
            }
            _ => return Err(err()),
        };

        Ok(RuleArg {
            local_port: local_port.parse().map_err(|_| err())?,
            remote_client: remote_client.to_string(),
            remote_host: remote_host.to_string(),
            remote_port: remote_port.parse().map_err(|_| err())?,
        })
    }
}

/// Checks the invariant that no two rules on this agent share a local
/// port, returning the first duplicate found.
pub fn duplicate_local_port(rules: &[ForwardingRule]) -> Option<u16> {
    let mut seen = std::collections::HashSet::new();
    rules
        .iter()
        .map(|r| r.local_port)
        .find(|port| !seen.insert(*port))
}

/// Settings kept for the lifetime of the transport and reused unchanged
/// on every reconnection attempt.
#[derive(Clone, Debug)]
pub struct AgentSettings {
    pub proxy: String,
    pub channel: String,
    pub password: String,
    pub name: String,
}

impl AgentSettings {
    pub fn from_cli(cli: &Cli) -> Self {
        let name = cli.name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown-host".to_string())
        });

        Self {
            proxy: cli.proxy.clone(),
            channel: cli.channel.clone(),
            password: cli.password.clone(),
            name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_part_rule_with_default_host() {
        let rule: RuleArg = "8080:peer:80".parse().unwrap();
        assert_eq!(rule.local_port, 8080);
        assert_eq!(rule.remote_client, "peer");
        assert_eq!(rule.remote_host, "localhost");
        assert_eq!(rule.remote_port, 80);
    }

    #[test]
    fn parses_four_part_rule_with_explicit_host() {
        let rule: RuleArg = "8080:peer:example.com:80".parse().unwrap();
        assert_eq!(rule.remote_host, "example.com");
    }

    #[test]
    fn rejects_malformed_rule() {
        assert!("not-a-rule".parse::<RuleArg>().is_err());
        assert!("8080:peer".parse::<RuleArg>().is_err());
    }

    #[test]
    fn flags_duplicate_local_ports() {
        let rules = vec![
            ForwardingRule::new(8080, "b".into(), 80),
            ForwardingRule::new(8080, "c".into(), 81),
        ];
        assert_eq!(duplicate_local_port(&rules), Some(8080));
    }

    #[test]
    fn accepts_distinct_local_ports() {
        let rules = vec![
            ForwardingRule::new(8080, "b".into(), 80),
            ForwardingRule::new(8081, "c".into(), 81),
        ];
        assert_eq!(duplicate_local_port(&rules), None);
    }
}
