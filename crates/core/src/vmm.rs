//! Growable device vector backed by virtual memory mapping
//!
//! A [`VmmVector`] reserves a virtual address range and maps physical chunks
//! into it as it grows, so the device pointer stays stable while the mapped
//! size increases. When the reservation cannot be extended in place the
//! vector moves to a fresh range: existing chunks are mapped at the new
//! address first, and only then unmapped from the old one, so a failed move
//! leaves the vector as it was.
//!
//! ```text
//! base                       base + mapped          base + reserved
//!  |-- chunk 0 --|-- chunk 1 --|......... reserved, unmapped .........|
//! ```
//!
//! The driver calls sit behind [`VmmDriver`]: [`CudaVmmDriver`] talks to the
//! CUDA driver, [`SimulatedAddressSpace`] keeps everything on the host.

use std::fmt;

use tracing::{debug, warn};

use crate::error::{ReduceError, Result};

/// Round `size` up to a multiple of `granularity`
pub fn round_up(size: usize, granularity: usize) -> usize {
    if granularity == 0 {
        return size;
    }
    size.div_ceil(granularity) * granularity
}

/// Low-level virtual memory primitives of one device
pub trait VmmDriver {
    /// Physical allocation handle
    type Handle: Copy + fmt::Debug;

    fn device_id(&self) -> usize;

    /// Minimum allocation and mapping granularity in bytes
    fn granularity(&self) -> Result<usize>;

    /// Reserve `size` bytes of address space, at `hint` if it is free
    fn reserve(&self, size: usize, hint: u64) -> Result<u64>;

    /// Free a range returned by `reserve`
    fn free_range(&self, addr: u64, size: usize) -> Result<()>;

    /// Create a physical allocation of `size` bytes
    fn create(&self, size: usize) -> Result<Self::Handle>;

    /// Release a physical allocation
    fn release(&self, handle: Self::Handle) -> Result<()>;

    /// Map `handle` at `addr`
    fn map(&self, addr: u64, size: usize, handle: Self::Handle) -> Result<()>;

    fn unmap(&self, addr: u64, size: usize) -> Result<()>;

    /// Grant the device read/write access to a mapped range
    fn set_access(&self, addr: u64, size: usize) -> Result<()>;

    fn memset(&self, addr: u64, byte: u8, size: usize) -> Result<()>;

    fn read(&self, addr: u64, out: &mut [u8]) -> Result<()>;

    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;
}

/// Device vector that grows by mapping physical chunks into a reserved range
pub struct VmmVector<D: VmmDriver> {
    driver: D,
    granularity: usize,
    base: u64,
    reserved: usize,
    mapped: usize,
    chunks: Vec<(D::Handle, usize)>,
    ranges: Vec<(u64, usize)>,
}

impl<D: VmmDriver> VmmVector<D> {
    /// Create an empty vector; nothing is reserved until the first reserve/grow
    pub fn new(driver: D) -> Result<Self> {
        let granularity = driver.granularity()?;
        if granularity == 0 {
            return Err(ReduceError::Vmm(format!(
                "device {} reported zero allocation granularity",
                driver.device_id()
            )));
        }
        Ok(Self {
            driver,
            granularity,
            base: 0,
            reserved: 0,
            mapped: 0,
            chunks: Vec::new(),
            ranges: Vec::new(),
        })
    }

    /// Device address of the first byte (0 before anything was reserved)
    pub fn pointer(&self) -> u64 {
        self.base
    }

    pub fn mapped_size(&self) -> usize {
        self.mapped
    }

    pub fn reserved_size(&self) -> usize {
        self.reserved
    }

    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Make sure at least `size` bytes of address space are reserved
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        let new_size = round_up(size, self.granularity);
        if new_size <= self.reserved {
            return Ok(());
        }

        let extra = new_size - self.reserved;
        let hint = if self.base == 0 { 0 } else { self.base + self.reserved as u64 };
        let addr = self.driver.reserve(extra, hint)?;

        if self.base == 0 {
            self.base = addr;
            self.ranges.push((addr, extra));
            self.reserved = new_size;
            debug!(device = self.driver.device_id(), size = new_size, "reserved address range at {:#x}", addr);
            return Ok(());
        }

        if addr == hint {
            self.ranges.push((addr, extra));
            self.reserved = new_size;
            debug!(device = self.driver.device_id(), size = new_size, "extended reservation in place");
            return Ok(());
        }

        // Could not extend in place; move everything to a range of the full size
        if let Err(e) = self.driver.free_range(addr, extra) {
            // Still reserved; teardown frees it with the rest
            self.ranges.push((addr, extra));
            return Err(e);
        }
        self.relocate(new_size)
    }

    fn relocate(&mut self, new_size: usize) -> Result<()> {
        let new_base = self.driver.reserve(new_size, 0)?;

        if let Err(e) = self.map_chunks_at(new_base) {
            if let Err(free_err) = self.driver.free_range(new_base, new_size) {
                warn!("failed to free abandoned reservation: {}", free_err);
            }
            return Err(e);
        }

        if self.mapped > 0 {
            if let Err(e) = self.driver.unmap(self.base, self.mapped) {
                // Old mapping intact: give up the new one
                self.abandon(new_base, new_size);
                return Err(e);
            }
        }

        // The old mapping is gone, so the vector lives at the new base from here on.
        // Old ranges that cannot be freed stay recorded for teardown.
        let old_base = self.base;
        let old_ranges = std::mem::replace(&mut self.ranges, vec![(new_base, new_size)]);
        self.base = new_base;
        self.reserved = new_size;
        debug!(
            device = self.driver.device_id(),
            size = new_size,
            "relocated mapping from {:#x} to {:#x}",
            old_base,
            new_base
        );

        let mut first_err = None;
        for (addr, size) in old_ranges {
            if let Err(e) = self.driver.free_range(addr, size) {
                self.ranges.push((addr, size));
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Undo a relocation target that was mapped but never committed to
    fn abandon(&self, new_base: u64, new_size: usize) {
        if self.mapped > 0 {
            if let Err(e) = self.driver.unmap(new_base, self.mapped) {
                warn!("failed to unmap abandoned relocation: {}", e);
            }
        }
        if let Err(e) = self.driver.free_range(new_base, new_size) {
            warn!("failed to free abandoned reservation: {}", e);
        }
    }

    /// Map every existing chunk, in order, starting at `new_base`
    fn map_chunks_at(&self, new_base: u64) -> Result<()> {
        let mut offset = 0usize;
        for &(handle, size) in &self.chunks {
            if let Err(e) = self.driver.map(new_base + offset as u64, size, handle) {
                if offset > 0 {
                    if let Err(unmap_err) = self.driver.unmap(new_base, offset) {
                        warn!("failed to undo partial remap: {}", unmap_err);
                    }
                }
                return Err(e);
            }
            offset += size;
        }
        if offset > 0 {
            if let Err(e) = self.driver.set_access(new_base, offset) {
                if let Err(unmap_err) = self.driver.unmap(new_base, offset) {
                    warn!("failed to undo remap: {}", unmap_err);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Grow the mapped region to at least `size` bytes
    pub fn grow(&mut self, size: usize) -> Result<()> {
        if size <= self.mapped {
            return Ok(());
        }
        let delta = round_up(size - self.mapped, self.granularity);
        self.reserve(self.mapped + delta)?;

        let handle = self.driver.create(delta)?;
        let at = self.base + self.mapped as u64;
        if let Err(e) = self.driver.map(at, delta, handle) {
            self.release_quietly(handle);
            return Err(e);
        }
        if let Err(e) = self.driver.set_access(self.base, self.mapped + delta) {
            if let Err(unmap_err) = self.driver.unmap(at, delta) {
                warn!("failed to unmap chunk after access error: {}", unmap_err);
            }
            self.release_quietly(handle);
            return Err(e);
        }

        self.chunks.push((handle, delta));
        self.mapped += delta;
        debug!(device = self.driver.device_id(), mapped = self.mapped, chunks = self.chunks.len(), "grew mapping");
        Ok(())
    }

    fn release_quietly(&self, handle: D::Handle) {
        if let Err(e) = self.driver.release(handle) {
            warn!("failed to release physical chunk {:?}: {}", handle, e);
        }
    }

    pub fn memset(&self, byte: u8) -> Result<()> {
        if self.mapped == 0 {
            return Ok(());
        }
        self.driver.memset(self.base, byte, self.mapped)
    }

    /// Copy the first `len` mapped bytes to the host
    pub fn read(&self, len: usize) -> Result<Vec<u8>> {
        self.check_len(len)?;
        let mut out = vec![0u8; len];
        if len > 0 {
            self.driver.read(self.base, &mut out)?;
        }
        Ok(out)
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.check_len(data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        self.driver.write(self.base, data)
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.mapped {
            return Err(ReduceError::Vmm(format!(
                "access of {} bytes beyond mapped size {}",
                len, self.mapped
            )));
        }
        Ok(())
    }

    /// Unmap, release and free everything, reporting the first failure
    pub fn free(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first_err = None;
        if self.mapped > 0 {
            if let Err(e) = self.driver.unmap(self.base, self.mapped) {
                first_err.get_or_insert(e);
            }
        }
        for (handle, _) in self.chunks.drain(..) {
            if let Err(e) = self.driver.release(handle) {
                first_err.get_or_insert(e);
            }
        }
        for (addr, size) in self.ranges.drain(..) {
            if let Err(e) = self.driver.free_range(addr, size) {
                first_err.get_or_insert(e);
            }
        }
        self.base = 0;
        self.mapped = 0;
        self.reserved = 0;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<D: VmmDriver> Drop for VmmVector<D> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("VMM teardown on device {} failed: {}", self.driver.device_id(), e);
        }
    }
}

impl<D: VmmDriver> fmt::Debug for VmmVector<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmmVector")
            .field("device_id", &self.driver.device_id())
            .field("base", &format_args!("{:#x}", self.base))
            .field("mapped", &self.mapped)
            .field("reserved", &self.reserved)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

// ============================================================================
// CUDA driver
// ============================================================================

#[cfg(feature = "cuda")]
pub use cuda_driver::CudaVmmDriver;

#[cfg(feature = "cuda")]
mod cuda_driver {
    use cudarc::driver::{result, sys};

    use super::VmmDriver;
    use crate::error::{check_cuda, Result};
    use crate::gpu::GpuDevice;

    /// VMM primitives of one CUDA device
    #[derive(Debug, Clone)]
    pub struct CudaVmmDriver {
        device: GpuDevice,
        cu_device: sys::CUdevice,
    }

    impl CudaVmmDriver {
        pub fn new(device: GpuDevice) -> Self {
            let cu_device = *device.cuda_device().cu_device();
            Self { device, cu_device }
        }

        fn allocation_prop(&self) -> sys::CUmemAllocationProp {
            // SAFETY: plain C struct, all-zero is a valid starting state
            let mut prop: sys::CUmemAllocationProp = unsafe { std::mem::zeroed() };
            prop.type_ = sys::CUmemAllocationType::CU_MEM_ALLOCATION_TYPE_PINNED;
            prop.location.type_ = sys::CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
            prop.location.id = self.cu_device;
            prop
        }
    }

    impl VmmDriver for CudaVmmDriver {
        type Handle = sys::CUmemGenericAllocationHandle;

        fn device_id(&self) -> usize {
            self.device.device_id
        }

        fn granularity(&self) -> Result<usize> {
            let prop = self.allocation_prop();
            let mut granularity = 0usize;
            // SAFETY: both pointers are valid for the duration of the call
            let res = unsafe {
                sys::cuMemGetAllocationGranularity(
                    &mut granularity,
                    &prop,
                    sys::CUmemAllocationGranularity_flags::CU_MEM_ALLOC_GRANULARITY_MINIMUM,
                )
            };
            check_cuda(res.result(), "cuMemGetAllocationGranularity")?;
            Ok(granularity)
        }

        fn reserve(&self, size: usize, hint: u64) -> Result<u64> {
            self.device.bind_to_thread()?;
            let mut ptr: sys::CUdeviceptr = 0;
            // SAFETY: ptr is a valid out-pointer
            let res = unsafe { sys::cuMemAddressReserve(&mut ptr, size, 0, hint, 0) };
            check_cuda(res.result(), "cuMemAddressReserve")?;
            Ok(ptr)
        }

        fn free_range(&self, addr: u64, size: usize) -> Result<()> {
            // SAFETY: addr/size came from a matching cuMemAddressReserve
            let res = unsafe { sys::cuMemAddressFree(addr, size) };
            check_cuda(res.result(), "cuMemAddressFree")
        }

        fn create(&self, size: usize) -> Result<Self::Handle> {
            self.device.bind_to_thread()?;
            let prop = self.allocation_prop();
            let mut handle: sys::CUmemGenericAllocationHandle = 0;
            // SAFETY: handle and prop are valid for the duration of the call
            let res = unsafe { sys::cuMemCreate(&mut handle, size, &prop, 0) };
            check_cuda(res.result(), "cuMemCreate")?;
            Ok(handle)
        }

        fn release(&self, handle: Self::Handle) -> Result<()> {
            // SAFETY: handle came from cuMemCreate and is released once
            let res = unsafe { sys::cuMemRelease(handle) };
            check_cuda(res.result(), "cuMemRelease")
        }

        fn map(&self, addr: u64, size: usize, handle: Self::Handle) -> Result<()> {
            // SAFETY: addr lies in a range reserved by this vector
            let res = unsafe { sys::cuMemMap(addr, size, 0, handle, 0) };
            check_cuda(res.result(), "cuMemMap")
        }

        fn unmap(&self, addr: u64, size: usize) -> Result<()> {
            // SAFETY: the range was mapped by this vector
            let res = unsafe { sys::cuMemUnmap(addr, size) };
            check_cuda(res.result(), "cuMemUnmap")
        }

        fn set_access(&self, addr: u64, size: usize) -> Result<()> {
            // SAFETY: plain C struct, all-zero is a valid starting state
            let mut desc: sys::CUmemAccessDesc = unsafe { std::mem::zeroed() };
            desc.location.type_ = sys::CUmemLocationType::CU_MEM_LOCATION_TYPE_DEVICE;
            desc.location.id = self.cu_device;
            desc.flags = sys::CUmemAccess_flags::CU_MEM_ACCESS_FLAGS_PROT_READWRITE;
            // SAFETY: desc is valid and the range is mapped
            let res = unsafe { sys::cuMemSetAccess(addr, size, &desc, 1) };
            check_cuda(res.result(), "cuMemSetAccess")
        }

        fn memset(&self, addr: u64, byte: u8, size: usize) -> Result<()> {
            self.device.bind_to_thread()?;
            // SAFETY: the range is mapped with read/write access
            check_cuda(unsafe { result::memset_d8_sync(addr, byte, size) }, "cudaMemset")
        }

        fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
            self.device.bind_to_thread()?;
            // SAFETY: the range is mapped and at least out.len() bytes long
            check_cuda(unsafe { result::memcpy_dtoh_sync(out, addr) }, "cudaMemcpyDeviceToHost")
        }

        fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
            self.device.bind_to_thread()?;
            // SAFETY: the range is mapped and at least data.len() bytes long
            check_cuda(unsafe { result::memcpy_htod_sync(addr, data) }, "cudaMemcpyHostToDevice")
        }
    }
}

// ============================================================================
// Host simulation
// ============================================================================

pub use sim::SimulatedAddressSpace;

mod sim {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::VmmDriver;
    use crate::error::{ReduceError, Result};

    /// First address handed out by a simulated device (keeps 0 meaning "none")
    const VA_START: u64 = 0x7f00_0000_0000;

    /// Spacing between the address spaces of different simulated devices
    const VA_DEVICE_STRIDE: u64 = 0x0010_0000_0000;

    struct Physical {
        data: Vec<u8>,
        released: bool,
        map_count: usize,
    }

    struct Mapping {
        handle: u64,
        size: usize,
        accessible: bool,
    }

    #[derive(Default)]
    struct State {
        next_va: u64,
        next_handle: u64,
        reserved: BTreeMap<u64, usize>,
        physical: HashMap<u64, Physical>,
        mappings: BTreeMap<u64, Mapping>,
        fail_next: Option<(&'static str, usize)>,
    }

    impl State {
        fn overlaps_reservation(&self, addr: u64, size: usize) -> bool {
            let end = addr + size as u64;
            self.reserved
                .range(..end)
                .any(|(&start, &len)| start + len as u64 > addr)
        }

        /// Whether [addr, addr+size) is covered by back-to-back reservations
        fn is_reserved(&self, addr: u64, size: usize) -> bool {
            let end = addr + size as u64;
            let mut cursor = addr;
            while cursor < end {
                match self.reserved.range(..=cursor).next_back() {
                    Some((&start, &len)) if start + len as u64 > cursor => cursor = start + len as u64,
                    _ => return false,
                }
            }
            true
        }

        fn overlaps_mapping(&self, addr: u64, size: usize) -> bool {
            let end = addr + size as u64;
            self.mappings
                .range(..end)
                .any(|(&start, m)| start + m.size as u64 > addr)
        }

        /// Mappings tiling [addr, addr+size) exactly, in address order
        fn tiling(&self, addr: u64, size: usize) -> Option<Vec<u64>> {
            let end = addr + size as u64;
            let mut cursor = addr;
            let mut starts = Vec::new();
            while cursor < end {
                let m = self.mappings.get(&cursor)?;
                starts.push(cursor);
                cursor += m.size as u64;
            }
            (cursor == end).then_some(starts)
        }

        /// Locate the mapping containing `addr`: (mapping start, handle, size)
        fn locate(&self, addr: u64) -> Option<(u64, u64, usize, bool)> {
            let (&start, m) = self.mappings.range(..=addr).next_back()?;
            (start + m.size as u64 > addr).then_some((start, m.handle, m.size, m.accessible))
        }

        fn drop_if_dead(&mut self, handle: u64) {
            if let Some(p) = self.physical.get(&handle) {
                if p.released && p.map_count == 0 {
                    self.physical.remove(&handle);
                }
            }
        }
    }

    /// Host-side stand-in for one device's virtual address space
    pub struct SimulatedAddressSpace {
        device_id: usize,
        granularity: usize,
        capacity: usize,
        external_used: Option<Arc<Mutex<usize>>>,
        state: Mutex<State>,
    }

    impl SimulatedAddressSpace {
        /// Unlimited physical memory
        pub fn new(device_id: usize, granularity: usize) -> Self {
            Self {
                device_id,
                granularity,
                capacity: usize::MAX,
                external_used: None,
                state: Mutex::new(State {
                    next_va: VA_START + device_id as u64 * VA_DEVICE_STRIDE,
                    next_handle: 1,
                    ..State::default()
                }),
            }
        }

        /// Physical memory limited to `capacity` bytes, shared with `external_used`
        pub fn with_budget(
            device_id: usize,
            granularity: usize,
            capacity: usize,
            external_used: Arc<Mutex<usize>>,
        ) -> Self {
            Self {
                capacity,
                external_used: Some(external_used),
                ..Self::new(device_id, granularity)
            }
        }

        /// Make the next call to `op` (e.g. "cuMemMap") fail
        pub fn fail_next(&self, op: &'static str) {
            self.fail_after(op, 0);
        }

        /// Let `skip` calls to `op` through, then fail the one after
        pub fn fail_after(&self, op: &'static str, skip: usize) {
            self.state.lock().fail_next = Some((op, skip));
        }

        /// Bytes held by live physical allocations
        pub fn physical_bytes(&self) -> usize {
            self.state.lock().physical.values().map(|p| p.data.len()).sum()
        }

        pub fn reserved_bytes(&self) -> usize {
            self.state.lock().reserved.values().sum()
        }

        pub fn mapped_bytes(&self) -> usize {
            self.state.lock().mappings.values().map(|m| m.size).sum()
        }

        /// True when nothing is reserved, mapped or allocated
        pub fn is_empty(&self) -> bool {
            let s = self.state.lock();
            s.reserved.is_empty() && s.mappings.is_empty() && s.physical.is_empty()
        }

        fn injected(&self, state: &mut State, op: &'static str) -> Result<()> {
            match state.fail_next {
                Some((target, 0)) if target == op => {
                    state.fail_next = None;
                    Err(ReduceError::cuda(op, "injected failure"))
                }
                Some((target, skip)) if target == op => {
                    state.fail_next = Some((target, skip - 1));
                    Ok(())
                }
                _ => Ok(()),
            }
        }

        fn check_aligned(&self, op: &'static str, addr: u64, size: usize) -> Result<()> {
            let g = self.granularity as u64;
            if addr % g != 0 || size == 0 || size % self.granularity != 0 {
                return Err(ReduceError::cuda(op, format!(
                    "invalid value: addr {:#x} size {} not aligned to {}",
                    addr, size, self.granularity
                )));
            }
            Ok(())
        }

        /// Walk accessible mappings over [addr, addr+len), calling `f(handle, offset, range)`
        fn for_each_span<F>(&self, op: &'static str, state: &mut State, addr: u64, len: usize, mut f: F) -> Result<()>
        where
            F: FnMut(&mut Vec<u8>, std::ops::Range<usize>, std::ops::Range<usize>),
        {
            self.injected(state, op)?;
            let mut done = 0usize;
            while done < len {
                let cursor = addr + done as u64;
                let (start, handle, size, accessible) = state
                    .locate(cursor)
                    .ok_or_else(|| ReduceError::cuda(op, format!("illegal address {:#x}", cursor)))?;
                if !accessible {
                    return Err(ReduceError::cuda(op, format!("no access to {:#x}", cursor)));
                }
                let offset = (cursor - start) as usize;
                let n = (size - offset).min(len - done);
                let phys = state
                    .physical
                    .get_mut(&handle)
                    .ok_or_else(|| ReduceError::cuda(op, "mapping refers to freed memory"))?;
                f(&mut phys.data, offset..offset + n, done..done + n);
                done += n;
            }
            Ok(())
        }
    }

    impl VmmDriver for Arc<SimulatedAddressSpace> {
        type Handle = u64;

        fn device_id(&self) -> usize {
            self.device_id
        }

        fn granularity(&self) -> Result<usize> {
            Ok(self.granularity)
        }

        fn reserve(&self, size: usize, hint: u64) -> Result<u64> {
            const OP: &str = "cuMemAddressReserve";
            let mut s = self.state.lock();
            self.injected(&mut s, OP)?;
            self.check_aligned(OP, hint, size)?;

            let addr = if hint != 0 && !s.overlaps_reservation(hint, size) {
                hint
            } else {
                let mut candidate = s.next_va;
                while s.overlaps_reservation(candidate, size) {
                    candidate += self.granularity as u64;
                }
                candidate
            };
            s.next_va = s.next_va.max(addr + size as u64);
            s.reserved.insert(addr, size);
            Ok(addr)
        }

        fn free_range(&self, addr: u64, size: usize) -> Result<()> {
            const OP: &str = "cuMemAddressFree";
            let mut s = self.state.lock();
            self.injected(&mut s, OP)?;
            if s.reserved.get(&addr) != Some(&size) {
                return Err(ReduceError::cuda(OP, format!("{:#x}+{} was not reserved", addr, size)));
            }
            if s.overlaps_mapping(addr, size) {
                return Err(ReduceError::cuda(OP, format!("{:#x}+{} is still mapped", addr, size)));
            }
            s.reserved.remove(&addr);
            Ok(())
        }

        fn create(&self, size: usize) -> Result<u64> {
            const OP: &str = "cuMemCreate";
            let mut s = self.state.lock();
            self.injected(&mut s, OP)?;
            self.check_aligned(OP, 0, size)?;
            let physical: usize = s.physical.values().map(|p| p.data.len()).sum();
            let external = self.external_used.as_ref().map(|u| *u.lock()).unwrap_or(0);
            if physical + external + size > self.capacity {
                return Err(ReduceError::cuda(OP, "out of memory"));
            }
            let handle = s.next_handle;
            s.next_handle += 1;
            s.physical.insert(
                handle,
                Physical {
                    data: vec![0u8; size],
                    released: false,
                    map_count: 0,
                },
            );
            Ok(handle)
        }

        fn release(&self, handle: u64) -> Result<()> {
            const OP: &str = "cuMemRelease";
            let mut s = self.state.lock();
            self.injected(&mut s, OP)?;
            match s.physical.get_mut(&handle) {
                Some(p) if !p.released => p.released = true,
                _ => return Err(ReduceError::cuda(OP, format!("invalid handle {}", handle))),
            }
            s.drop_if_dead(handle);
            Ok(())
        }

        fn map(&self, addr: u64, size: usize, handle: u64) -> Result<()> {
            const OP: &str = "cuMemMap";
            let mut s = self.state.lock();
            self.injected(&mut s, OP)?;
            self.check_aligned(OP, addr, size)?;
            if !s.is_reserved(addr, size) {
                return Err(ReduceError::cuda(OP, format!("{:#x}+{} is not reserved", addr, size)));
            }
            if s.overlaps_mapping(addr, size) {
                return Err(ReduceError::cuda(OP, format!("{:#x}+{} is already mapped", addr, size)));
            }
            match s.physical.get_mut(&handle) {
                Some(p) if !p.released && p.data.len() == size => p.map_count += 1,
                _ => return Err(ReduceError::cuda(OP, format!("invalid handle {} for size {}", handle, size))),
            }
            s.mappings.insert(
                addr,
                Mapping {
                    handle,
                    size,
                    accessible: false,
                },
            );
            Ok(())
        }

        fn unmap(&self, addr: u64, size: usize) -> Result<()> {
            const OP: &str = "cuMemUnmap";
            let mut s = self.state.lock();
            self.injected(&mut s, OP)?;
            let starts = s
                .tiling(addr, size)
                .ok_or_else(|| ReduceError::cuda(OP, format!("{:#x}+{} is not fully mapped", addr, size)))?;
            for start in starts {
                if let Some(m) = s.mappings.remove(&start) {
                    if let Some(p) = s.physical.get_mut(&m.handle) {
                        p.map_count -= 1;
                    }
                    s.drop_if_dead(m.handle);
                }
            }
            Ok(())
        }

        fn set_access(&self, addr: u64, size: usize) -> Result<()> {
            const OP: &str = "cuMemSetAccess";
            let mut s = self.state.lock();
            self.injected(&mut s, OP)?;
            let starts = s
                .tiling(addr, size)
                .ok_or_else(|| ReduceError::cuda(OP, format!("{:#x}+{} is not fully mapped", addr, size)))?;
            for start in starts {
                if let Some(m) = s.mappings.get_mut(&start) {
                    m.accessible = true;
                }
            }
            Ok(())
        }

        fn memset(&self, addr: u64, byte: u8, size: usize) -> Result<()> {
            let mut s = self.state.lock();
            self.for_each_span("cudaMemset", &mut s, addr, size, |data, dev, _| {
                data[dev].fill(byte);
            })
        }

        fn read(&self, addr: u64, out: &mut [u8]) -> Result<()> {
            let mut s = self.state.lock();
            let len = out.len();
            self.for_each_span("cudaMemcpyDeviceToHost", &mut s, addr, len, |data, dev, host| {
                out[host].copy_from_slice(&data[dev]);
            })
        }

        fn write(&self, addr: u64, data_in: &[u8]) -> Result<()> {
            let mut s = self.state.lock();
            self.for_each_span("cudaMemcpyHostToDevice", &mut s, addr, data_in.len(), |data, dev, host| {
                data[dev].copy_from_slice(&data_in[host]);
            })
        }
    }
}
