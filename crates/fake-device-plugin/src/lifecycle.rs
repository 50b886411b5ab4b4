//! Top-level loop deciding when to (re)build the plugin and when to exit.

use derive_more::Display;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::PluginConfig;
use crate::plugin::FakeDevicePlugin;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PluginSignal {
    #[display("SIGHUP")]
    Hangup,
    #[display("SIGINT")]
    Interrupt,
    #[display("SIGTERM")]
    Terminate,
    #[display("SIGQUIT")]
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The kubelet socket was (re)created, dropping every registration.
    KubeletRestarted,
    /// Any other change in the device plugin directory.
    FsActivity,
    WatchError(String),
    Signal(PluginSignal),
}

/// Owns the single live plugin instance and rebuilds it on demand.
///
/// The previous instance is always stopped before a new one is created, so
/// two instances never hold the same socket.
#[derive(Debug)]
pub struct LifecycleManager {
    config: PluginConfig,
    plugin: Option<FakeDevicePlugin>,
    needs_restart: bool,
}

impl LifecycleManager {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            plugin: None,
            needs_restart: true,
        }
    }

    pub fn needs_restart(&self) -> bool {
        self.needs_restart
    }

    /// Runs until a termination signal arrives or `events` closes.
    ///
    /// A failed bring-up is retried at the top of the next iteration, which
    /// starts as soon as any event is delivered.
    pub async fn run(mut self, mut events: mpsc::Receiver<LifecycleEvent>) {
        loop {
            if self.needs_restart {
                self.rebuild().await;
            }

            let Some(event) = events.recv().await else {
                info!("event sources closed, shutting down");
                break;
            };

            if !self.handle_event(event) {
                break;
            }
        }

        self.stop_plugin().await;
    }

    /// Applies one event. Returns `false` when the loop should exit.
    fn handle_event(&mut self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::KubeletRestarted => {
                info!(
                    "inotify: {} created, restarting.",
                    self.config.kubelet_socket().display()
                );
                self.needs_restart = true;
            }
            LifecycleEvent::FsActivity => debug!("inotify: unrelated activity"),
            LifecycleEvent::WatchError(e) => warn!("inotify: {}", e),
            LifecycleEvent::Signal(PluginSignal::Hangup) => {
                info!("Received SIGHUP, restarting.");
                self.needs_restart = true;
            }
            LifecycleEvent::Signal(signal) => {
                info!("Received signal \"{}\", shutting down.", signal);
                return false;
            }
        }
        true
    }

    async fn rebuild(&mut self) {
        self.stop_plugin().await;

        let mut plugin = FakeDevicePlugin::new(
            &self.config.resource_name,
            self.config.resource_count,
            &self.config.device_plugin_path,
        );

        match plugin.serve(&self.config.kubelet_socket()).await {
            Ok(()) => self.needs_restart = false,
            Err(e) => warn!(
                "Could not contact Kubelet, retrying. \
                 Did you enable the device plugin feature gate? {e:?}"
            ),
        }

        self.plugin = Some(plugin);
    }

    async fn stop_plugin(&mut self) {
        if let Some(mut plugin) = self.plugin.take() {
            if let Err(e) = plugin.stop().await {
                warn!("failed to stop device plugin: {e:?}");
            }
        }
    }
}
