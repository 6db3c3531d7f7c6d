//! Accelerator runtime abstraction
//!
//! The search core never switches an ambient "current device". Every worker
//! receives an explicit [`ExecutionContext`] naming the device and stream it
//! runs on, and memory ownership is discovered through
//! [`DeviceRuntime::pointer_attributes`].

pub mod buffer;
pub mod host;

pub use buffer::DeviceBuffer;
pub use host::{DeviceStats, HostRuntime};

use crate::Result;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Accelerator ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device:{}", self.0)
    }
}

pub type StreamId = u64;

/// Where a memory range lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    Host,
    Device,
}

/// Result of a memory introspection query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerAttributes {
    pub kind: MemoryKind,
    /// Owning device; `None` for host or unknown memory
    pub device: Option<DeviceId>,
}

impl PointerAttributes {
    pub fn host() -> Self {
        Self { kind: MemoryKind::Host, device: None }
    }

    pub fn device(device: DeviceId) -> Self {
        Self { kind: MemoryKind::Device, device: Some(device) }
    }
}

/// Options for acquiring an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    /// Work issued on the context may keep scratch memory alive between
    /// calls. Runtimes account for such contexts separately and primitives
    /// only reuse scratch buffers when this is set.
    pub temp_memory: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { temp_memory: true }
    }
}

impl ContextOptions {
    /// Unshared, short-lived context: own stream, no pooled temporary memory
    pub fn transient() -> Self {
        Self { temp_memory: false }
    }
}

/// A device + stream pair that work is issued against
///
/// Contexts handed out by a runtime hold a lease; dropping the context
/// returns the lease, so early returns and failed shards release it too.
pub struct ExecutionContext {
    device: DeviceId,
    stream: StreamId,
    options: ContextOptions,
    _lease: Option<Box<dyn Any + Send + Sync>>,
}

impl ExecutionContext {
    /// Caller-owned context with no lease (e.g. the default stream of a device)
    pub fn new(device: DeviceId, stream: StreamId) -> Self {
        Self {
            device,
            stream,
            options: ContextOptions::default(),
            _lease: None,
        }
    }

    pub(crate) fn leased(
        device: DeviceId,
        stream: StreamId,
        options: ContextOptions,
        lease: Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            device,
            stream,
            options,
            _lease: Some(lease),
        }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn options(&self) -> ContextOptions {
        self.options
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("device", &self.device)
            .field("stream", &self.stream)
            .field("options", &self.options)
            .field("leased", &self._lease.is_some())
            .finish()
    }
}

/// Device services consumed by the search core
pub trait DeviceRuntime: Send + Sync {
    /// Number of addressable devices; ids `0..device_count()` are valid
    fn device_count(&self) -> usize;

    /// Report which device (if any) owns `[addr, addr + len_bytes)`
    fn pointer_attributes(&self, addr: usize, len_bytes: usize) -> Result<PointerAttributes>;

    /// Acquire a context on `device`
    fn create_context(&self, device: DeviceId, options: ContextOptions) -> Result<ExecutionContext>;

    /// Block until all work issued on `ctx` has completed
    fn synchronize(&self, ctx: &ExecutionContext) -> Result<()>;
}

/// Introspect the memory behind a slice
pub fn slice_attributes<R, T>(runtime: &R, data: &[T]) -> Result<PointerAttributes>
where
    R: DeviceRuntime + ?Sized,
{
    runtime.pointer_attributes(data.as_ptr() as usize, std::mem::size_of_val(data))
}
