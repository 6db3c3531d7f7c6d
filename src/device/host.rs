//! In-process device runtime
//!
//! Simulates a set of accelerators inside the host process: allocations are
//! tagged with the device that owns them and can be introspected by address,
//! contexts are leased per device (optionally capped), and streams execute
//! synchronously. Useful for tests and for CPU-only deployments of the
//! sharded search.

use super::buffer::DeviceBuffer;
use super::{ContextOptions, DeviceId, DeviceRuntime, ExecutionContext, PointerAttributes};
use crate::{KnnError, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
struct Region {
    len_bytes: usize,
    device: DeviceId,
}

/// Address-ordered registry of live device allocations
#[derive(Debug, Default)]
pub(crate) struct MemoryMap {
    regions: RwLock<BTreeMap<usize, Region>>,
}

impl MemoryMap {
    pub(crate) fn insert(&self, addr: usize, len_bytes: usize, device: DeviceId) {
        self.regions.write().insert(addr, Region { len_bytes, device });
    }

    pub(crate) fn remove(&self, addr: usize) {
        self.regions.write().remove(&addr);
    }

    /// Owning device of `[addr, addr + len_bytes)`, which must lie inside a single allocation
    pub(crate) fn lookup(&self, addr: usize, len_bytes: usize) -> Option<DeviceId> {
        let regions = self.regions.read();
        let (start, region) = regions.range(..=addr).next_back()?;
        let end = start.checked_add(region.len_bytes)?;
        let want_end = addr.checked_add(len_bytes)?;
        if addr < end && want_end <= end {
            Some(region.device)
        } else {
            None
        }
    }

    fn len(&self) -> usize {
        self.regions.read().len()
    }
}

#[derive(Debug)]
struct DeviceSlot {
    live: AtomicUsize,
    limit: AtomicUsize,
    created: AtomicU64,
    pooled: AtomicU64,
    syncs: AtomicU64,
}

impl DeviceSlot {
    fn new() -> Self {
        Self {
            live: AtomicUsize::new(0),
            limit: AtomicUsize::new(usize::MAX),
            created: AtomicU64::new(0),
            pooled: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        }
    }
}

/// Per-device counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub contexts_created: u64,
    /// Contexts created with pooled temporary memory
    pub pooled_contexts: u64,
    pub live_contexts: usize,
    pub synchronizations: u64,
}

/// Returned to the slot when its context is dropped
struct ContextLease {
    slot: Arc<DeviceSlot>,
    device: DeviceId,
    stream: u64,
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        self.slot.live.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(device = %self.device, stream = self.stream, "released execution context");
    }
}

/// Host-backed implementation of [`DeviceRuntime`]
#[derive(Debug)]
pub struct HostRuntime {
    map: Arc<MemoryMap>,
    slots: Vec<Arc<DeviceSlot>>,
    next_stream: AtomicU64,
}

impl HostRuntime {
    /// Create a runtime with `device_count` simulated devices
    pub fn new(device_count: usize) -> Self {
        Self {
            map: Arc::new(MemoryMap::default()),
            slots: (0..device_count).map(|_| Arc::new(DeviceSlot::new())).collect(),
            // stream 0 is the default stream of every device
            next_stream: AtomicU64::new(1),
        }
    }

    /// Cap the number of simultaneously live contexts on every device
    pub fn with_context_limit(self, limit: usize) -> Self {
        for slot in &self.slots {
            slot.limit.store(limit, Ordering::Release);
        }
        self
    }

    /// Cap (or uncap with `None`) live contexts on one device
    pub fn set_context_limit(&self, device: DeviceId, limit: Option<usize>) -> Result<()> {
        self.slot(device)?
            .limit
            .store(limit.unwrap_or(usize::MAX), Ordering::Release);
        Ok(())
    }

    /// Move `data` into memory owned by `device`
    pub fn alloc<T>(&self, device: DeviceId, data: Vec<T>) -> Result<DeviceBuffer<T>> {
        self.slot(device)?;
        Ok(DeviceBuffer::register(Arc::clone(&self.map), device, data))
    }

    /// Allocate `len` elements initialised to `value` on `device`
    pub fn alloc_filled<T: Clone>(&self, device: DeviceId, len: usize, value: T) -> Result<DeviceBuffer<T>> {
        self.alloc(device, vec![value; len])
    }

    pub fn stats(&self, device: DeviceId) -> Option<DeviceStats> {
        self.slots.get(device.0).map(|slot| DeviceStats {
            contexts_created: slot.created.load(Ordering::Acquire),
            pooled_contexts: slot.pooled.load(Ordering::Acquire),
            live_contexts: slot.live.load(Ordering::Acquire),
            synchronizations: slot.syncs.load(Ordering::Acquire),
        })
    }

    /// Number of live registered allocations
    pub fn allocation_count(&self) -> usize {
        self.map.len()
    }

    fn slot(&self, device: DeviceId) -> Result<&Arc<DeviceSlot>> {
        self.slots.get(device.0).ok_or_else(|| {
            KnnError::InvalidArgument(format!(
                "{} does not exist ({} devices available)",
                device,
                self.slots.len()
            ))
        })
    }
}

impl DeviceRuntime for HostRuntime {
    fn device_count(&self) -> usize {
        self.slots.len()
    }

    fn pointer_attributes(&self, addr: usize, len_bytes: usize) -> Result<PointerAttributes> {
        Ok(match self.map.lookup(addr, len_bytes) {
            Some(device) => PointerAttributes::device(device),
            None => PointerAttributes::host(),
        })
    }

    fn create_context(&self, device: DeviceId, options: ContextOptions) -> Result<ExecutionContext> {
        let slot = self.slot(device)?;
        let limit = slot.limit.load(Ordering::Acquire);
        slot.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .map_err(|live| {
                KnnError::ResourceExhausted(format!(
                    "{} has {} live contexts (limit {})",
                    device, live, limit
                ))
            })?;
        slot.created.fetch_add(1, Ordering::AcqRel);
        if options.temp_memory {
            slot.pooled.fetch_add(1, Ordering::AcqRel);
        }

        let stream = self.next_stream.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(device = %device, stream, pooled = options.temp_memory, "acquired execution context");

        let lease = ContextLease {
            slot: Arc::clone(slot),
            device,
            stream,
        };
        Ok(ExecutionContext::leased(device, stream, options, Box::new(lease)))
    }

    fn synchronize(&self, ctx: &ExecutionContext) -> Result<()> {
        // Host streams run inline, so there is nothing left to wait for.
        self.slot(ctx.device())?.syncs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
