use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::select;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::api::device_plugin_server::DevicePlugin;
use crate::api::AllocateRequest;
use crate::api::AllocateResponse;
use crate::api::ContainerAllocateResponse;
use crate::api::DevicePluginOptions;
use crate::api::Empty;
use crate::api::ListAndWatchResponse;
use crate::api::PreStartContainerRequest;
use crate::api::PreStartContainerResponse;
use crate::api::PreferredAllocationRequest;
use crate::api::PreferredAllocationResponse;
use crate::device_registry::DeviceRegistry;

/// Environment variable carrying the allocated device ids into the container.
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

/// Receiving side of an instance's health channel.
///
/// Every `ListAndWatch` stream of the instance pulls from the same receiver,
/// so each health event reaches exactly one active stream.
pub type HealthReceiver = Arc<Mutex<mpsc::Receiver<String>>>;

/// DevicePlugin service implementation backed by a [`DeviceRegistry`]
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    registry: Arc<DeviceRegistry>,
    health: HealthReceiver,
    /// cancelled when the owning plugin instance stops
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        health: HealthReceiver,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            health,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");

        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Sends the full device list, then again after every health event,
    /// until the plugin instance stops.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let registry = self.registry.clone();
        let health = self.health.clone();
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let initial_response = ListAndWatchResponse {
                devices: registry.snapshot().await,
            };
            if tx.send(Ok(initial_response)).is_err() {
                debug!("ListAndWatch receiver dropped before initial device list");
                return;
            }

            loop {
                let next_event = async { health.lock().await.recv().await };

                select! {
                    _ = cancellation_token.cancelled() => {
                        info!("device watch task stopped");
                        break;
                    }
                    _ = tx.closed() => {
                        debug!("ListAndWatch stream closed by client");
                        break;
                    }
                    event = next_event => {
                        let Some(device_id) = event else {
                            debug!("health channel closed");
                            break;
                        };

                        if !registry.mark_unhealthy(&device_id).await {
                            warn!("health event for unknown device: {}", device_id);
                        }
                        info!("device marked unhealthy: {}", device_id);

                        let response = ListAndWatchResponse {
                            devices: registry.snapshot().await,
                        };
                        if tx.send(Ok(response)).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation: {:?}", req);

        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    /// Echoes the requested device ids back as an environment variable.
    ///
    /// Ids are not checked against the registry.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices to container: {:?}", req);

        let container_responses = req
            .container_requests
            .into_iter()
            .map(|container_req| ContainerAllocateResponse {
                envs: HashMap::from([(
                    VISIBLE_DEVICES_ENV.to_string(),
                    container_req.devices_ids.join(","),
                )]),
                ..Default::default()
            })
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.into_inner());

        Ok(Response::new(PreStartContainerResponse {}))
    }
}
