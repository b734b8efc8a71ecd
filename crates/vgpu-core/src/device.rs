//! Boundary between the engine and the virtual GPU.
//!
//! The engine needs exactly two things from a device: accept an opaque command
//! stream for a context, and map a host memory region to a device address.
//! Submission returns once the device has accepted the bytes; execution is
//! asynchronous and only observable through [`VirtualDevice::wait_idle`].

use crate::error::VgpuError;

const MAP_BASE: u64 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSubmission {
    pub context_id: u32,
    pub stream: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("context {0} is not initialized")]
    ContextNotReady(u32),
    #[error("submission rejected: {0}")]
    Rejected(String),
    #[error("host mapping failed: {0}")]
    MapFailed(String),
}

impl From<DeviceError> for VgpuError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::ContextNotReady(_) => VgpuError::NotReady("device context not initialized"),
            other => VgpuError::Device(other.to_string()),
        }
    }
}

pub trait VirtualDevice {
    fn submit(&mut self, submission: DeviceSubmission) -> Result<(), DeviceError>;

    /// Make `host` visible to the device and return its device address.
    fn map_host_region(&mut self, host: &[u8]) -> Result<u64, DeviceError>;

    /// Whether MEMORY_BARRIER commands are executed by the device.
    fn supports_memory_barrier(&self) -> bool {
        false
    }

    /// Block until everything submitted so far has executed. There is no
    /// deadline; a stalled device stalls the caller.
    fn wait_idle(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Device that accepts everything and keeps nothing.
#[derive(Debug, Default)]
pub struct NullDevice {
    next_map: u64,
}

impl NullDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VirtualDevice for NullDevice {
    fn submit(&mut self, _submission: DeviceSubmission) -> Result<(), DeviceError> {
        Ok(())
    }

    fn map_host_region(&mut self, host: &[u8]) -> Result<u64, DeviceError> {
        let addr = MAP_BASE + self.next_map;
        self.next_map += host.len() as u64;
        Ok(addr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRegion {
    pub device_address: u64,
    pub bytes: Vec<u8>,
}

/// Device that records every submission and mapping for inspection.
#[derive(Debug, Default)]
pub struct RecordingDevice {
    pub submissions: Vec<DeviceSubmission>,
    pub mappings: Vec<MappedRegion>,
    pub wait_idle_calls: usize,
    memory_barrier: bool,
    uninitialized: Vec<u32>,
    next_map: u64,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_barrier(mut self, supported: bool) -> Self {
        self.memory_barrier = supported;
        self
    }

    /// Submissions to `context_id` fail with [`DeviceError::ContextNotReady`].
    pub fn with_uninitialized_context(mut self, context_id: u32) -> Self {
        self.uninitialized.push(context_id);
        self
    }

    pub fn submissions_for(&self, context_id: u32) -> impl Iterator<Item = &DeviceSubmission> + '_ {
        self.submissions
            .iter()
            .filter(move |s| s.context_id == context_id)
    }
}

impl VirtualDevice for RecordingDevice {
    fn submit(&mut self, submission: DeviceSubmission) -> Result<(), DeviceError> {
        if self.uninitialized.contains(&submission.context_id) {
            return Err(DeviceError::ContextNotReady(submission.context_id));
        }
        self.submissions.push(submission);
        Ok(())
    }

    fn map_host_region(&mut self, host: &[u8]) -> Result<u64, DeviceError> {
        let device_address = MAP_BASE + self.next_map;
        self.next_map += host.len() as u64;
        self.mappings.push(MappedRegion {
            device_address,
            bytes: host.to_vec(),
        });
        Ok(device_address)
    }

    fn supports_memory_barrier(&self) -> bool {
        self.memory_barrier
    }

    fn wait_idle(&mut self) -> Result<(), DeviceError> {
        self.wait_idle_calls += 1;
        Ok(())
    }
}
