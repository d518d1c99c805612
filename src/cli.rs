use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::probe::{FailurePolicy, ProbeConfig};

#[derive(Parser, Debug)]
#[command(name = "rdpscope")]
#[command(author = "RdpScope")]
#[command(version = "0.1.0")]
#[command(about = "RDP presence and authentication fingerprinting", long_about = None)]
pub struct Cli {
    #[arg(help = "Target hostname, IP, IP range (IP1-IP2), or CIDR (10.0.0.0/24). Can be specified multiple times.")]
    pub target: Vec<String>,

    #[arg(short, long, value_delimiter = ',', help = "Ports to probe: -p3389,3390 or -p3380-3390. Defaults to 3389.")]
    pub ports: Option<Vec<String>>,

    #[arg(short = 'a', long, help = "Also check whether RDP listeners require authentication (NLA)")]
    pub auth: bool,

    #[arg(long, default_value_t = 5000, help = "Dial and handshake timeout in milliseconds")]
    pub timeout: u64,

    #[arg(long, default_value_t = 50, help = "Maximum number of probes in flight")]
    pub parallel: usize,

    #[arg(long, help = "Do not cache failed probes; let later lookups in the run probe again")]
    pub retry_failures: bool,

    #[arg(long, help = "Username sent in the mstshash routing cookie")]
    pub cookie_user: Option<String>,

    #[arg(long, help = "Run identifier (default: generated from the start time)")]
    pub run_id: Option<String>,

    #[arg(short = 'o', long, value_enum, default_value = "human", help = "Output format")]
    pub output_format: OutputFormat,

    #[arg(short = 'f', long, help = "Output file path")]
    pub output_file: Option<PathBuf>,

    #[arg(long, help = "Disable colored output")]
    pub no_color: bool,

    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

impl Cli {
    pub fn probe_config(&self) -> ProbeConfig {
        let mut config = ProbeConfig::default()
            .with_timeout(Duration::from_millis(self.timeout))
            .with_failure_policy(if self.retry_failures {
                FailurePolicy::RetryOnFailure
            } else {
                FailurePolicy::CacheFailures
            });
        if let Some(user) = &self.cookie_user {
            config.mstshash_user = user.clone();
        }
        config
    }

    pub fn ports_spec(&self) -> String {
        match &self.ports {
            Some(ports) if !ports.is_empty() => ports.join(","),
            _ => "3389".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum OutputFormat {
    #[value(name = "human", help = "Human-readable output")]
    Human,
    #[value(name = "json", help = "JSON output")]
    Json,
    #[value(name = "csv", help = "CSV output")]
    Csv,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["rdpscope", "10.0.0.5"]);
        assert_eq!(cli.target, vec!["10.0.0.5".to_string()]);
        assert_eq!(cli.ports_spec(), "3389");
        assert!(!cli.auth);

        let config = cli.probe_config();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.failure_policy, FailurePolicy::CacheFailures);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "rdpscope", "-p", "3389,3390", "--auth", "--timeout", "1500",
            "--retry-failures", "--cookie-user", "alice", "-o", "json", "acme.test",
        ]);
        assert_eq!(cli.ports_spec(), "3389,3390");
        assert!(cli.auth);
        assert_eq!(cli.output_format, OutputFormat::Json);

        let config = cli.probe_config();
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.failure_policy, FailurePolicy::RetryOnFailure);
        assert_eq!(config.mstshash_user, "alice");
    }
}
