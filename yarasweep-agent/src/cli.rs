//! CLI argument definitions for the `yarasweep` binary.
//!
//! Uses `clap` v4 derive macros. Every flag is optional and, when present,
//! takes precedence over `yarasweep.toml` and `YARASWEEP_*` environment variables.

use std::path::PathBuf;

use clap::Parser;

use yarasweep_core::config::YarasweepConfig;
use yarasweep_core::types::ScanSelector;

/// Signature-based file, image and container scanning agent.
///
/// Without `--socket-path` the agent runs a single scan of the selected
/// target and exits with a status derived from the failure thresholds.
/// With `--socket-path` it serves scan requests on a Unix socket while the
/// rule set is kept up to date in the background.
#[derive(Parser, Debug, Default)]
#[command(name = "yarasweep")]
#[command(version, about, long_about = None)]
pub struct AgentCli {
    /// Path to yarasweep.toml configuration file.
    #[arg(short, long, default_value = "/etc/yarasweep/yarasweep.toml")]
    pub config: PathBuf,

    /// Unix socket to serve scan requests on (enables service mode).
    #[arg(long)]
    pub socket_path: Option<String>,

    /// Directory holding the installed rule set.
    #[arg(long)]
    pub rules_path: Option<String>,

    /// URL of the rule-set version listing.
    #[arg(long)]
    pub rules_listing_url: Option<String>,

    /// Prefix applied to local paths when running inside a container.
    #[arg(long)]
    pub host_mount_path: Option<String>,

    /// Treat rule compilation warnings as errors.
    #[arg(long)]
    pub fail_on_compile_warning: bool,

    /// Local directory to scan.
    #[arg(long, default_value = "")]
    pub local: String,

    /// Container image to scan.
    #[arg(long, default_value = "")]
    pub image_name: String,

    /// Running container to scan.
    #[arg(long, default_value = "")]
    pub container_id: String,

    /// Console URL for result reporting.
    #[arg(long)]
    pub console_url: Option<String>,

    /// Console port.
    #[arg(long)]
    pub console_port: Option<u16>,

    /// Console access key.
    #[arg(long)]
    pub key: Option<String>,

    /// Output format (json, table).
    #[arg(short, long)]
    pub output: Option<String>,

    /// Fail when high severity findings exceed this count (<= 0 disables).
    #[arg(long, allow_negative_numbers = true)]
    pub fail_on_high_count: Option<i64>,

    /// Fail when medium severity findings exceed this count (<= 0 disables).
    #[arg(long, allow_negative_numbers = true)]
    pub fail_on_medium_count: Option<i64>,

    /// Fail when low severity findings exceed this count (<= 0 disables).
    #[arg(long, allow_negative_numbers = true)]
    pub fail_on_low_count: Option<i64>,

    /// Fail when the total number of findings exceeds this count (<= 0 disables).
    #[arg(long, allow_negative_numbers = true)]
    pub fail_on_count: Option<i64>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    #[arg(long)]
    pub log_format: Option<String>,
}

impl AgentCli {
    /// Apply the flags that were given on the command line to `config`.
    ///
    /// Must run after `apply_env_overrides` so flags win over the environment.
    pub fn apply_to(&self, config: &mut YarasweepConfig) {
        fn set<T: Clone>(target: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *target = v.clone();
            }
        }

        set(&mut config.general.log_level, &self.log_level);
        set(&mut config.general.log_format, &self.log_format);

        set(&mut config.runner.socket_path, &self.socket_path);
        set(&mut config.runner.rules_path, &self.rules_path);
        set(&mut config.runner.rules_listing_url, &self.rules_listing_url);
        set(&mut config.runner.host_mount_path, &self.host_mount_path);
        if self.fail_on_compile_warning {
            config.runner.fail_on_compile_warning = true;
        }

        set(&mut config.output.format, &self.output);

        set(&mut config.thresholds.fail_on_high_count, &self.fail_on_high_count);
        set(
            &mut config.thresholds.fail_on_medium_count,
            &self.fail_on_medium_count,
        );
        set(&mut config.thresholds.fail_on_low_count, &self.fail_on_low_count);
        set(&mut config.thresholds.fail_on_count, &self.fail_on_count);

        set(&mut config.console.url, &self.console_url);
        set(&mut config.console.port, &self.console_port);
        set(&mut config.console.key, &self.key);
    }

    /// Scan target selector built from `--local`, `--image-name` and `--container-id`.
    pub fn selector(&self) -> ScanSelector {
        ScanSelector {
            local: self.local.clone(),
            image_name: self.image_name.clone(),
            container_id: self.container_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> AgentCli {
        AgentCli::try_parse_from(std::iter::once("yarasweep").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_leave_config_untouched() {
        let cli = parse(&[]);
        assert_eq!(cli.config, PathBuf::from("/etc/yarasweep/yarasweep.toml"));

        let mut config = YarasweepConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.general.log_level, "info");
        assert!(config.runner.socket_path.is_empty());
        assert_eq!(config.runner.rules_path, "/var/lib/yarasweep/rules");
        assert_eq!(config.thresholds.fail_on_high_count, 0);
    }

    #[test]
    fn flags_override_config_values() {
        let cli = parse(&[
            "--rules-path",
            "/opt/rules",
            "--output",
            "json",
            "--fail-on-high-count",
            "1",
            "--fail-on-count",
            "-1",
            "--console-url",
            "https://console.example",
            "--console-port",
            "8443",
            "--key",
            "secret",
            "--fail-on-compile-warning",
        ]);

        let mut config = YarasweepConfig::default();
        config.thresholds.fail_on_count = 10;
        cli.apply_to(&mut config);

        assert_eq!(config.runner.rules_path, "/opt/rules");
        assert_eq!(config.output.format, "json");
        assert_eq!(config.thresholds.fail_on_high_count, 1);
        assert_eq!(config.thresholds.fail_on_count, -1);
        assert_eq!(config.console.url, "https://console.example");
        assert_eq!(config.console.port, 8443);
        assert_eq!(config.console.key, "secret");
        assert!(config.runner.fail_on_compile_warning);
    }

    #[test]
    fn absent_compile_flag_keeps_config_setting() {
        let cli = parse(&[]);
        let mut config = YarasweepConfig::default();
        config.runner.fail_on_compile_warning = true;
        cli.apply_to(&mut config);
        assert!(config.runner.fail_on_compile_warning);
    }

    #[test]
    fn selector_from_flags() {
        let cli = parse(&["--image-name", "nginx:1.27"]);
        let selector = cli.selector();
        assert_eq!(selector.image_name, "nginx:1.27");
        assert!(selector.local.is_empty());
        assert!(selector.container_id.is_empty());
    }

    #[test]
    fn socket_path_enables_service_mode() {
        let cli = parse(&["--socket-path", "/run/yarasweep.sock"]);
        let mut config = YarasweepConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.runner.socket_path, "/run/yarasweep.sock");
    }
}
