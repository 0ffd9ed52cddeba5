//! Device identity and placement for managed buffers.
//!
//! A [`DeviceId`] names a device type the way stage provider options do
//! (`"cpu"`, `"cuda"`, ...). The [`DevicePlacement`] pairs that identity with
//! the candle [`Device`] managed tensors are allocated on. Keeping the two
//! separate lets a host-only build drive a pipeline configured for an
//! accelerator primary, which is how the device checks are tested.

use std::collections::HashSet;
use std::fmt;

use candle_core::Device;

use crate::error::{GenerationError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub const HOST: &'static str = "cpu";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().to_lowercase())
    }

    pub fn cpu() -> Self {
        Self::new(Self::HOST)
    }

    pub fn cuda() -> Self {
        Self::new("cuda")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_host(&self) -> bool {
        self.0 == Self::HOST
    }

    /// Identity of a candle device.
    pub fn of(device: &Device) -> Self {
        match device {
            Device::Cpu => Self::cpu(),
            Device::Cuda(_) => Self::cuda(),
            Device::Metal(_) => Self::new("metal"),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the session's managed buffers live.
#[derive(Debug, Clone)]
pub struct DevicePlacement {
    pub id: DeviceId,
    pub device: Device,
}

impl DevicePlacement {
    pub fn new(id: DeviceId, device: Device) -> Self {
        Self { id, device }
    }

    pub fn cpu() -> Self {
        Self::new(DeviceId::cpu(), Device::Cpu)
    }

    pub fn from_device(device: Device) -> Self {
        Self::new(DeviceId::of(&device), device)
    }
}

/// Device types a pipeline may use as its primary device.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    supported: HashSet<DeviceId>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self {
            supported: [DeviceId::cpu(), DeviceId::cuda()].into_iter().collect(),
        }
    }
}

impl DeviceRegistry {
    pub fn register(&mut self, id: DeviceId) {
        self.supported.insert(id);
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.supported.contains(id)
    }

    pub fn ensure_supported(&self, id: &DeviceId) -> Result<()> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(GenerationError::UnsupportedDeviceType(id.to_string()))
        }
    }
}
