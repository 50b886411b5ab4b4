use std::path::PathBuf;

use clap::Parser;
use utils::version;

use crate::api::DEVICE_PLUGIN_PATH;
use crate::api::KUBELET_SOCKET_NAME;

/// Reserved: disables health checks in a fuller implementation. Read but
/// not acted upon.
pub const ENV_DISABLE_HEALTH_CHECKS: &str = "DP_DISABLE_HEALTHCHECKS";

/// Value of [`ENV_DISABLE_HEALTH_CHECKS`] that turns off every check.
pub const ALL_HEALTH_CHECKS: &str = "xids";

/// Names a file to additionally write logs to.
pub const ENV_LOG_PATH: &str = "FAKE_DEVICE_PLUGIN_LOG_PATH";

/// Fake Kubernetes device plugin advertising synthetic devices
#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        default_value = "nvidia.com/gpu",
        help = "Define the default resource name: nvidia.com/gpu."
    )]
    pub resource_name: String,

    #[arg(
        long,
        default_value_t = 8,
        help = "Define the default resource number: 8."
    )]
    pub resource_num: usize,
}

/// Everything the lifecycle needs to build plugin instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    pub resource_name: String,
    pub resource_count: usize,
    /// directory holding the kubelet socket and the plugin socket
    pub device_plugin_path: PathBuf,
    pub disable_health_checks: Option<String>,
}

impl PluginConfig {
    pub fn new(resource_name: impl Into<String>, resource_count: usize) -> Self {
        Self {
            resource_name: resource_name.into(),
            resource_count,
            device_plugin_path: PathBuf::from(DEVICE_PLUGIN_PATH),
            disable_health_checks: None,
        }
    }

    pub fn with_device_plugin_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.device_plugin_path = path.into();
        self
    }

    pub fn kubelet_socket(&self) -> PathBuf {
        self.device_plugin_path.join(KUBELET_SOCKET_NAME)
    }
}

impl From<Cli> for PluginConfig {
    fn from(cli: Cli) -> Self {
        Self {
            disable_health_checks: std::env::var(ENV_DISABLE_HEALTH_CHECKS).ok(),
            ..Self::new(cli.resource_name, cli.resource_num)
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_kubelet_layout() {
        let cli = Cli::parse_from(["fake-device-plugin"]);
        assert_eq!(cli.resource_name, "nvidia.com/gpu");
        assert_eq!(cli.resource_num, 8);

        let config = PluginConfig::new(cli.resource_name, cli.resource_num);
        assert_eq!(
            config.kubelet_socket(),
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "fake-device-plugin",
            "--resource-name",
            "acme.test/widget",
            "--resource-num",
            "2",
        ]);

        assert_eq!(cli.resource_name, "acme.test/widget");
        assert_eq!(cli.resource_num, 2);
    }

    #[test]
    fn negative_count_is_rejected() {
        let result = Cli::try_parse_from(["fake-device-plugin", "--resource-num", "-1"]);
        assert!(result.is_err());
    }

    #[test]
    fn device_plugin_path_can_be_redirected() {
        let config = PluginConfig::new("acme.test/widget", 1).with_device_plugin_path("/tmp/dp");
        assert_eq!(config.kubelet_socket(), PathBuf::from("/tmp/dp/kubelet.sock"));
    }
}
