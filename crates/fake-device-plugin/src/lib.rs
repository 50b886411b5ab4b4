//! A Kubernetes device plugin advertising a configurable number of synthetic
//! devices, used to exercise the kubelet device plugin path without hardware.

pub mod api;
pub mod config;
pub mod device_registry;
pub mod error;
pub mod lifecycle;
pub mod plugin;
pub mod registration;
pub mod service;
pub mod supervisor;
pub mod transport;
pub mod watchers;

pub use config::PluginConfig;
pub use lifecycle::LifecycleEvent;
pub use lifecycle::LifecycleManager;
pub use plugin::FakeDevicePlugin;
