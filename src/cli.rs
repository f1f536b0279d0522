use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{default_config_path, ManagerConfig};
use crate::DEFAULT_API_PORT;

#[derive(Parser, Debug)]
#[command(name = "bgplb")]
#[command(about = "Announce Kubernetes LoadBalancer service addresses over BGP")]
#[command(version)]
pub struct Args {
    /// Path to the config file (YAML or JSON) [default: ~/.bgplb/config.yaml]
    #[arg(short, long, env = "BGPLB_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate config and print it without starting
    #[arg(long)]
    pub dry_run: bool,

    /// Address the operator API binds to
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind: String,

    /// Port the operator API listens on
    #[arg(short, long, value_name = "PORT", default_value_t = DEFAULT_API_PORT)]
    pub port: u16,

    /// Override the number of reconcile workers
    #[arg(short, long, value_name = "N")]
    pub workers: Option<usize>,
}

impl Args {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    /// Command-line overrides applied on top of the loaded file
    pub fn apply_overrides(&self, config: &mut ManagerConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

// ============================================================================
// Pure display logic (no I/O - returns formatted strings)
// ============================================================================

/// Format the effective configuration for `--dry-run`
pub fn format_dry_run(config: &ManagerConfig, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "bgplb v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n", args.config_path().display()));
    output.push_str(&format!("API: {}\n\n", args.listen_addr()));

    output.push_str("Reconciler:\n");
    output.push_str(&format!("  Workers: {}\n", config.workers));
    output.push_str(&format!("  Sync timeout: {}s\n", config.sync_timeout_secs));
    if config.max_retries == 0 {
        output.push_str("  Max retries: unbounded\n");
    } else {
        output.push_str(&format!("  Max retries: {}\n", config.max_retries));
    }
    output.push_str(&format!(
        "  Backoff: {}ms .. {}ms\n\n",
        config.backoff.base_delay_ms, config.backoff.max_delay_ms
    ));

    output.push_str(&format!("Local ASN: {}\n", config.local_asn));
    output.push_str(&format!("Peers ({}):\n", config.peers.len()));
    for peer in &config.peers {
        output.push_str(&format!("  - {} AS{}", peer.address, peer.asn));
        if let Some(port) = peer.port {
            output.push_str(&format!(" port {}", port));
        }
        output.push('\n');
        for (key, value) in &peer.attributes {
            output.push_str(&format!("      {}: {}\n", key, value));
        }
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Remove --dry-run to start announcing.\n");

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;

    fn create_test_args() -> Args {
        Args {
            config: Some(PathBuf::from("bgplb.yaml")),
            verbose: 0,
            dry_run: true,
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_API_PORT,
            workers: None,
        }
    }

    #[test]
    fn test_format_dry_run_basic() {
        let mut peer = PeerConfig::new("192.168.1.1", 64500);
        peer.attributes
            .insert("hold_time".to_string(), "90".to_string());
        let config = ManagerConfig {
            local_asn: 64512,
            peers: vec![peer, PeerConfig::new("192.168.1.2", 64501)],
            ..ManagerConfig::default()
        };

        let output = format_dry_run(&config, &create_test_args());

        assert!(output.contains("Config: bgplb.yaml"));
        assert!(output.contains("API: 127.0.0.1:8282"));
        assert!(output.contains("Max retries: unbounded"));
        assert!(output.contains("Peers (2):"));
        assert!(output.contains("192.168.1.1 AS64500"));
        assert!(output.contains("hold_time: 90"));
        assert!(output.contains("Validation: PASSED"));
    }

    #[test]
    fn test_clap_defaults() {
        let args = Args::parse_from(["bgplb"]);
        assert!(!args.dry_run);
        assert_eq!(args.bind, "0.0.0.0");
        assert_eq!(args.port, 8282);
        assert_eq!(args.workers, None);
    }

    #[test]
    fn test_clap_dry_run() {
        let args = Args::parse_from(["bgplb", "--dry-run", "--config", "bgplb.yaml"]);
        assert!(args.dry_run);
        assert_eq!(args.config_path(), PathBuf::from("bgplb.yaml"));
    }

    #[test]
    fn test_clap_verbose() {
        let args = Args::parse_from(["bgplb", "-vvv"]);
        assert_eq!(args.verbose, 3);
    }

    #[test]
    fn test_clap_overrides() {
        let args = Args::parse_from([
            "bgplb",
            "--bind",
            "127.0.0.1",
            "--port",
            "9000",
            "--workers",
            "4",
        ]);
        assert_eq!(args.listen_addr(), "127.0.0.1:9000");

        let mut config = ManagerConfig::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.workers, 4);
    }
}
