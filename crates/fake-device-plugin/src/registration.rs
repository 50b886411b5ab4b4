use std::path::Path;

use error_stack::ResultExt;
use tonic::Request;
use tracing::info;

use crate::api::registration_client::RegistrationClient;
use crate::api::DevicePluginOptions;
use crate::api::RegisterRequest;
use crate::api::VERSION;
use crate::error::PluginError;
use crate::error::PluginResult;
use crate::transport::dial;
use crate::transport::DIAL_TIMEOUT;

/// Announces `resource_name`, served on `endpoint` (a socket file name
/// relative to the device plugin directory), to the kubelet.
///
/// A single attempt; retrying is up to the caller.
pub async fn register_with_kubelet(
    kubelet_socket: &Path,
    resource_name: &str,
    endpoint: &str,
) -> PluginResult<()> {
    info!(
        "registering {} on endpoint {} with kubelet: {}",
        resource_name,
        endpoint,
        kubelet_socket.display()
    );

    let channel = dial(kubelet_socket, DIAL_TIMEOUT).await?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(DevicePluginOptions::default()),
    };

    client
        .register(Request::new(request))
        .await
        .change_context(PluginError::Registration {
            resource_name: resource_name.to_string(),
        })?;

    info!("successfully registered device plugin with kubelet");
    Ok(())
}
