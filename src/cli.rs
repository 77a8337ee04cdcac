//! # Command-Line Interface Module
//!
//! Argument parsing and configuration for the `meshline-node` demo process.
//! Uses `clap`'s derive API the same way the rest of this crate's ambient
//! stack does: a plain `Args` struct, a `defaults` module of named
//! constants, and an internal config struct built from `Args` via `From`.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Start a process that offers a demo echo service on an ephemeral port
//! meshline-node --ensemble rehearsal --offer echo
//!
//! # Start a process on a fixed port with verbose logging
//! meshline-node --ensemble rehearsal --port 29123 -vv
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::time::Duration;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// meshline-node - start one process of a messaging ensemble
///
/// Brings up a single ensemble process: binds its TCP/UDP transport,
/// optionally offers a demo service, and drives the poll loop until
/// interrupted.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Name of the ensemble this process joins
    ///
    /// Processes with the same ensemble name discover and route messages
    /// to one another; processes in different ensembles never interact.
    #[arg(short = 'e', long, default_value = crate::defaults::ENSEMBLE_NAME)]
    pub ensemble: String,

    /// TCP port to listen on (0 selects an ephemeral port)
    #[arg(short = 'p', long, default_value_t = crate::defaults::TCP_PORT)]
    pub port: u16,

    /// UDP port to listen on (0 selects an ephemeral port)
    #[arg(long, default_value_t = crate::defaults::UDP_PORT)]
    pub udp_port: u16,

    /// Local address to bind (network interface selection)
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Offer a named demo echo service under this process on startup
    ///
    /// The demo service responds to any message addressed to
    /// `/<name>/ping` by re-publishing it under `/<name>/pong`.
    #[arg(long)]
    pub offer: Option<String>,

    /// Static peer to register with discovery, as `host:tcp_port`
    ///
    /// May be repeated to seed several known peers without a real
    /// broadcast/mDNS collaborator.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// How long to run before exiting (omit to run until interrupted)
    #[arg(short = 'd', long, value_parser = parse_duration)]
    pub duration: Option<Duration>,

    /// Silence all user-facing informational output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and above: trace
    /// By default, only INFO and above is shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Write detailed logs to this file instead of a daily-rotated default
    ///
    /// Pass "stderr" to send detailed logs to stderr instead of a file.
    #[arg(long)]
    pub log_file: Option<String>,
}

/// Internal configuration derived from [`Args`], ready for `Context`
/// bring-up.
#[derive(Clone, Debug)]
pub struct EnsembleConfig {
    pub ensemble: String,
    pub host: String,
    pub port: u16,
    pub udp_port: u16,
    pub offer: Option<String>,
    pub peers: Vec<String>,
    pub duration: Option<Duration>,
}

impl From<&Args> for EnsembleConfig {
    fn from(args: &Args) -> Self {
        EnsembleConfig {
            ensemble: args.ensemble.clone(),
            host: args.host.clone(),
            port: args.port,
            udp_port: args.udp_port,
            offer: args.offer.clone(),
            peers: args.peers.clone(),
            duration: args.duration,
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

    if num < 0.0 {
        return Err("Duration cannot be negative".to_string());
    }

    let duration = match unit {
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn config_carries_offer_and_peers_through_conversion() {
        let args = Args {
            ensemble: "rehearsal".into(),
            port: 0,
            udp_port: 0,
            host: "127.0.0.1".into(),
            offer: Some("echo".into()),
            peers: vec!["127.0.0.1:9000".into()],
            duration: None,
            quiet: false,
            verbose: 0,
            log_file: None,
        };
        let config = EnsembleConfig::from(&args);
        assert_eq!(config.offer.as_deref(), Some("echo"));
        assert_eq!(config.peers, vec!["127.0.0.1:9000".to_string()]);
    }
}
