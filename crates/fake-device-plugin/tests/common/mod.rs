//! A stand-in kubelet exposing only the registration service.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fake_device_plugin::api::registration_server::Registration;
use fake_device_plugin::api::registration_server::RegistrationServer;
use fake_device_plugin::api::Empty;
use fake_device_plugin::api::RegisterRequest;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Status;

#[derive(Debug, Default, Clone)]
pub struct FakeKubelet {
    requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        self.requests.lock().await.push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

impl FakeKubelet {
    /// Serves the registration service on `socket` until the token is
    /// cancelled.
    pub fn serve(socket: &Path) -> (Self, CancellationToken) {
        let kubelet = Self::default();
        let token = CancellationToken::new();
        let listener = UnixListener::bind(socket).expect("should bind kubelet socket");

        let service = RegistrationServer::new(kubelet.clone());
        let shutdown = token.clone();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await;
                })
                .await
        });

        (kubelet, token)
    }

    pub async fn requests(&self) -> Vec<RegisterRequest> {
        self.requests.lock().await.clone()
    }

    /// Waits until at least `count` registrations arrived.
    pub async fn wait_for_registrations(&self, count: usize) -> Vec<RegisterRequest> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let requests = self.requests().await;
                if requests.len() >= count {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("registrations should arrive in time")
    }
}
