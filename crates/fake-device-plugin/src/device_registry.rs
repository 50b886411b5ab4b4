//! In-memory inventory of synthetic devices.
//!
//! The set of devices is fixed when the registry is built. The only mutation
//! is a one-way health transition from healthy to unhealthy; there is no way
//! back.

use derive_more::Display;
use tokio::sync::RwLock;

use crate::api;

/// Health of a synthetic device, rendered the way the kubelet expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DeviceHealth {
    #[display("{}", api::HEALTHY)]
    Healthy,
    #[display("{}", api::UNHEALTHY)]
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDevice {
    pub id: String,
    pub health: DeviceHealth,
}

impl From<&FakeDevice> for api::Device {
    fn from(device: &FakeDevice) -> Self {
        api::Device {
            id: device.id.clone(),
            health: device.health.to_string(),
            topology: None,
        }
    }
}

/// Ordered list of devices owned by one plugin instance
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<FakeDevice>>,
}

impl DeviceRegistry {
    /// Builds `count` healthy devices named `<resource_name>-<index>`.
    pub fn new(resource_name: &str, count: usize) -> Self {
        let devices = (0..count)
            .map(|i| FakeDevice {
                id: format!("{resource_name}-{i}"),
                health: DeviceHealth::Healthy,
            })
            .collect();

        Self {
            devices: RwLock::new(devices),
        }
    }

    pub async fn devices(&self) -> Vec<FakeDevice> {
        self.devices.read().await.clone()
    }

    /// Current device list in wire format.
    pub async fn snapshot(&self) -> Vec<api::Device> {
        self.devices.read().await.iter().map(Into::into).collect()
    }

    /// Flips the device with `id` to unhealthy.
    ///
    /// Returns `false` when no device carries that id.
    pub async fn mark_unhealthy(&self, id: &str) -> bool {
        let mut devices = self.devices.write().await;
        match devices.iter_mut().find(|d| d.id == id) {
            Some(device) => {
                device.health = DeviceHealth::Unhealthy;
                true
            }
            None => false,
        }
    }
}
