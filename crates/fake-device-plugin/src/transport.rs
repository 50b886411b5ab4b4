//! Unix domain socket client plumbing shared by the readiness check and the
//! kubelet registration.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

use crate::error::PluginError;
use crate::error::PluginResult;

/// Upper bound for every client dial.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a gRPC channel over the Unix socket at `socket_path`.
pub async fn dial(socket_path: &Path, timeout: Duration) -> PluginResult<Channel> {
    let endpoint = socket_path.display().to_string();
    let path = socket_path.to_path_buf();

    // The URI is a placeholder, the connector ignores it.
    let channel_endpoint = Endpoint::from_static("http://tonic").connect_timeout(timeout);
    let connect = channel_endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = path.clone();
        async move {
            let stream = UnixStream::connect(path).await?;
            Ok::<_, std::io::Error>(TokioIo::new(stream))
        }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(channel) => channel.change_context(PluginError::Dial { endpoint }),
        Err(_) => Err(Report::new(PluginError::Dial { endpoint })
            .attach_printable(format!("timed out after {timeout:?}"))),
    }
}
