use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::device_registry::DeviceRegistry;
use crate::error::PluginResult;
use crate::registration::register_with_kubelet;
use crate::service::DevicePluginService;
use crate::service::HealthReceiver;
use crate::supervisor::ServerSupervisor;

/// Socket path of the plugin serving `resource_name` inside `plugin_dir`.
pub fn socket_path_for(plugin_dir: &Path, resource_name: &str) -> PathBuf {
    plugin_dir.join(format!("{}-fake.sock", resource_name.replace('/', "-")))
}

/// One live device plugin: a fixed set of synthetic devices served on a
/// socket derived from the resource name.
///
/// The cancellation token and the health channel belong to this instance
/// alone; a restart builds a new instance with fresh ones.
#[derive(Debug)]
pub struct FakeDevicePlugin {
    resource_name: String,
    registry: Arc<DeviceRegistry>,
    health_tx: mpsc::Sender<String>,
    health_rx: HealthReceiver,
    cancellation_token: CancellationToken,
    supervisor: ServerSupervisor,
}

impl FakeDevicePlugin {
    pub fn new(resource_name: &str, count: usize, plugin_dir: &Path) -> Self {
        let (health_tx, health_rx) = mpsc::channel(1);
        let cancellation_token = CancellationToken::new();
        let socket_path = socket_path_for(plugin_dir, resource_name);

        Self {
            resource_name: resource_name.to_string(),
            registry: Arc::new(DeviceRegistry::new(resource_name, count)),
            health_tx,
            health_rx: Arc::new(Mutex::new(health_rx)),
            supervisor: ServerSupervisor::new(socket_path, cancellation_token.clone()),
            cancellation_token,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn socket_path(&self) -> &Path {
        self.supervisor.socket_path()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Starts the gRPC server on the plugin socket.
    pub async fn start(&mut self) -> PluginResult<()> {
        let service = DevicePluginService::new(
            self.registry.clone(),
            self.health_rx.clone(),
            self.cancellation_token.clone(),
        );
        self.supervisor.start(service).await
    }

    pub async fn stop(&mut self) -> PluginResult<()> {
        self.supervisor.stop().await
    }

    /// Registers this plugin's resource and socket with the kubelet.
    pub async fn register(&self, kubelet_socket: &Path) -> PluginResult<()> {
        let endpoint = self
            .socket_path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        register_with_kubelet(kubelet_socket, &self.resource_name, &endpoint).await
    }

    /// Starts the server, then registers with the kubelet. The server is
    /// stopped again if either step fails.
    pub async fn serve(&mut self, kubelet_socket: &Path) -> PluginResult<()> {
        if let Err(e) = self.start().await {
            warn!("Could not start device plugin: {e:?}");
            self.stop_quietly().await;
            return Err(e);
        }
        info!("Starting to serve on {}", self.socket_path().display());

        if let Err(e) = self.register(kubelet_socket).await {
            warn!("Could not register device plugin: {e:?}");
            self.stop_quietly().await;
            return Err(e);
        }
        info!("Registered device plugin with Kubelet");

        Ok(())
    }

    /// Queues `device_id` to be marked unhealthy by a `ListAndWatch` stream.
    ///
    /// Waits until the health channel has room and never times out, so it
    /// must not be called once the instance has been stopped.
    pub async fn report_unhealthy(&self, device_id: &str) {
        if self.health_tx.send(device_id.to_string()).await.is_err() {
            warn!("health channel closed, dropping report for {}", device_id);
        }
    }

    async fn stop_quietly(&mut self) {
        if let Err(e) = self.stop().await {
            warn!("failed to stop device plugin: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn socket_path_replaces_slashes() {
        let path = socket_path_for(
            Path::new("/var/lib/kubelet/device-plugins/"),
            "acme.test/widget",
        );

        assert_eq!(
            path,
            PathBuf::from("/var/lib/kubelet/device-plugins/acme.test-widget-fake.sock")
        );
    }

    #[test]
    fn socket_path_is_stable_across_instances() {
        let dir = Path::new("/tmp/plugins");
        let first = FakeDevicePlugin::new("nvidia.com/gpu", 8, dir);
        let second = FakeDevicePlugin::new("nvidia.com/gpu", 8, dir);

        assert_eq!(first.socket_path(), second.socket_path());
        assert_eq!(
            first.socket_path(),
            Path::new("/tmp/plugins/nvidia.com-gpu-fake.sock")
        );
    }

    #[test(tokio::test)]
    async fn new_instance_is_not_running() {
        let plugin = FakeDevicePlugin::new("acme.test/widget", 2, Path::new("/tmp"));

        assert!(!plugin.is_running());
        assert_eq!(plugin.resource_name(), "acme.test/widget");
        assert_eq!(plugin.registry().snapshot().await.len(), 2);
    }
}
