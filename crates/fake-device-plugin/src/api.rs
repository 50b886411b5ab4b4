//! Kubernetes device plugin API (v1beta1) and the constants that go with it.
#![allow(clippy::doc_markdown)]
#![allow(clippy::doc_overindented_list_items)]

tonic::include_proto!("v1beta1");

/// API version sent during registration.
pub const VERSION: &str = "v1beta1";

/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// File name of the kubelet registration socket inside [`DEVICE_PLUGIN_PATH`].
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

pub const HEALTHY: &str = "Healthy";
pub const UNHEALTHY: &str = "Unhealthy";
