//! Scoped device allocations

use super::host::MemoryMap;
use super::DeviceId;
use std::sync::Arc;

/// Memory owned by one device of a [`HostRuntime`](super::HostRuntime)
///
/// The allocation is visible to pointer introspection for as long as the
/// buffer is alive and is unregistered when it is dropped. The backing
/// storage never reallocates, so the registered address stays valid.
pub struct DeviceBuffer<T> {
    data: Box<[T]>,
    device: DeviceId,
    map: Arc<MemoryMap>,
}

impl<T> DeviceBuffer<T> {
    pub(crate) fn register(map: Arc<MemoryMap>, device: DeviceId, data: Vec<T>) -> Self {
        let data = data.into_boxed_slice();
        if !data.is_empty() {
            map.insert(data.as_ptr() as usize, std::mem::size_of_val(&*data), device);
        }
        Self { data, device, map }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: Clone> DeviceBuffer<T> {
    /// Device-to-host copy
    pub fn to_vec(&self) -> Vec<T> {
        self.data.to_vec()
    }
}

impl<T> Drop for DeviceBuffer<T> {
    fn drop(&mut self) {
        if !self.data.is_empty() {
            self.map.remove(self.data.as_ptr() as usize);
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device)
            .field("len", &self.data.len())
            .finish()
    }
}
