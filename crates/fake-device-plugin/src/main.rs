use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fake_device_plugin::config::Cli;
use fake_device_plugin::config::ALL_HEALTH_CHECKS;
use fake_device_plugin::config::ENV_LOG_PATH;
use fake_device_plugin::watchers;
use fake_device_plugin::LifecycleManager;
use fake_device_plugin::PluginConfig;
use tokio::sync::mpsc;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init(std::env::var_os(ENV_LOG_PATH).map(PathBuf::from));

    tracing::info!("Starting fake device plugin {}", &**version::VERSION);

    let config = PluginConfig::from(cli);
    if let Some(checks) = &config.disable_health_checks {
        tracing::info!(
            "health checks disabled: {} (all: {})",
            checks,
            checks == ALL_HEALTH_CHECKS
        );
    }

    let (tx, rx) = mpsc::channel(32);

    tracing::info!("Starting FS watcher.");
    let kubelet_socket = config.kubelet_socket();
    let _watcher =
        match watchers::watch_plugin_dir(&config.device_plugin_path, &kubelet_socket, tx.clone()) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!("Failed to create FS watcher: {e:?}");
                std::process::exit(1);
            }
        };

    tracing::info!("Starting OS watcher.");
    let _signals = watchers::forward_signals(tx)
        .map_err(|e| anyhow::anyhow!("failed to watch signals: {e:?}"))?;

    LifecycleManager::new(config).run(rx).await;

    tracing::info!("fake device plugin stopped");
    Ok(())
}
