//! Device buffer allocation
//!
//! Buffers come from one of two strategies behind [`BufferAllocator`]:
//!
//! | Strategy | Backing | Size |
//! |----------|---------|------|
//! | [`DirectAllocator`] | one device allocation | exactly as requested |
//! | [`VmmAllocator`] | reserved range + mapped chunks | rounded up to the VMM granularity |
//!
//! Both hand out a `Box<dyn DeviceBuffer>` that frees its memory on drop.

use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::config::{AllocatorKind, RunConfig};
use crate::error::{ReduceError, Result};
use crate::gpu::GpuDevice;
use crate::vmm::{round_up, VmmVector};

#[cfg(feature = "cuda")]
use crate::error::check_cuda;

#[cfg(feature = "cuda")]
use cudarc::driver::{result, CudaSlice, DevicePtr};

#[cfg(feature = "cuda")]
type DeviceVmmDriver = crate::vmm::CudaVmmDriver;

#[cfg(not(feature = "cuda"))]
type DeviceVmmDriver = std::sync::Arc<crate::vmm::SimulatedAddressSpace>;

/// A block of device memory holding one collective operand
pub trait DeviceBuffer: fmt::Debug {
    /// Ordinal of the device holding the buffer
    fn device_id(&self) -> usize;

    /// Usable length in bytes
    fn len_bytes(&self) -> usize;

    /// Set every byte to `byte`
    fn memset(&mut self, byte: u8) -> Result<()>;

    /// Copy the buffer contents to the host
    fn read(&self) -> Result<Vec<u8>>;

    /// Overwrite the buffer from the host; `data` must be exactly `len_bytes` long
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Release the memory now, reporting failures a drop could only log
    fn free(self: Box<Self>) -> Result<()>;

    /// Device address of the first byte
    #[cfg(feature = "cuda")]
    fn device_ptr(&self) -> u64;
}

/// Buffer allocation strategy
pub trait BufferAllocator {
    fn kind(&self) -> AllocatorKind;

    /// Allocate `bytes` on `device`
    fn allocate(&self, device: &GpuDevice, bytes: usize) -> Result<Box<dyn DeviceBuffer>>;

    /// Bytes of device memory one allocation of `bytes` actually occupies
    fn footprint(&self, device: &GpuDevice, bytes: usize) -> Result<usize>;
}

/// Allocator for `kind`
pub fn allocator_for(kind: AllocatorKind) -> Box<dyn BufferAllocator> {
    match kind {
        AllocatorKind::Direct => Box::new(DirectAllocator),
        AllocatorKind::Vmm => Box::new(VmmAllocator),
    }
}

fn check_write_len(device_id: usize, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(ReduceError::InvalidConfig(format!(
            "write of {} bytes into a {} byte buffer on GPU {}",
            got, expected, device_id
        )));
    }
    Ok(())
}

// ============================================================================
// Direct allocation
// ============================================================================

/// Plain device allocation
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAllocator;

impl BufferAllocator for DirectAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Direct
    }

    fn allocate(&self, device: &GpuDevice, bytes: usize) -> Result<Box<dyn DeviceBuffer>> {
        let buffer = DirectBuffer::alloc(device, bytes)?;
        debug!(device = device.device_id, bytes, "allocated direct buffer");
        Ok(Box::new(buffer))
    }

    fn footprint(&self, _device: &GpuDevice, bytes: usize) -> Result<usize> {
        Ok(bytes)
    }
}

/// Device memory from a single allocation, freed on drop
pub struct DirectBuffer {
    #[cfg(feature = "cuda")]
    slice: CudaSlice<u8>,
    #[cfg(not(feature = "cuda"))]
    data: Vec<u8>,
    device: GpuDevice,
    len: usize,
}

#[cfg(feature = "cuda")]
impl DirectBuffer {
    #[track_caller]
    pub fn alloc(device: &GpuDevice, bytes: usize) -> Result<Self> {
        device.bind_to_thread()?;
        // SAFETY: contents are written by memset/write before being read
        let slice = check_cuda(unsafe { device.cuda_device().alloc::<u8>(bytes) }, "cudaMalloc")?;
        Ok(Self {
            slice,
            device: device.clone(),
            len: bytes,
        })
    }
}

#[cfg(not(feature = "cuda"))]
impl DirectBuffer {
    #[track_caller]
    pub fn alloc(device: &GpuDevice, bytes: usize) -> Result<Self> {
        device.sim().charge(bytes)?;
        Ok(Self {
            data: vec![0u8; bytes],
            device: device.clone(),
            len: bytes,
        })
    }
}

impl DeviceBuffer for DirectBuffer {
    fn device_id(&self) -> usize {
        self.device.device_id
    }

    fn len_bytes(&self) -> usize {
        self.len
    }

    #[cfg(feature = "cuda")]
    fn memset(&mut self, byte: u8) -> Result<()> {
        self.device.bind_to_thread()?;
        // SAFETY: the slice owns `len` bytes of device memory
        check_cuda(
            unsafe { result::memset_d8_sync(*self.slice.device_ptr(), byte, self.len) },
            "cudaMemset",
        )
    }

    #[cfg(not(feature = "cuda"))]
    fn memset(&mut self, byte: u8) -> Result<()> {
        self.data.fill(byte);
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn read(&self) -> Result<Vec<u8>> {
        self.device.bind_to_thread()?;
        check_cuda(
            self.device.cuda_device().dtoh_sync_copy(&self.slice),
            "cudaMemcpyDeviceToHost",
        )
    }

    #[cfg(not(feature = "cuda"))]
    fn read(&self) -> Result<Vec<u8>> {
        Ok(self.data.clone())
    }

    #[cfg(feature = "cuda")]
    fn write(&mut self, data: &[u8]) -> Result<()> {
        check_write_len(self.device.device_id, self.len, data.len())?;
        self.device.bind_to_thread()?;
        // SAFETY: lengths checked above
        check_cuda(
            unsafe { result::memcpy_htod_sync(*self.slice.device_ptr(), data) },
            "cudaMemcpyHostToDevice",
        )
    }

    #[cfg(not(feature = "cuda"))]
    fn write(&mut self, data: &[u8]) -> Result<()> {
        check_write_len(self.device.device_id, self.len, data.len())?;
        self.data.copy_from_slice(data);
        Ok(())
    }

    fn free(self: Box<Self>) -> Result<()> {
        // The allocation is returned when the buffer drops
        drop(self);
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn device_ptr(&self) -> u64 {
        *self.slice.device_ptr()
    }
}

#[cfg(not(feature = "cuda"))]
impl Drop for DirectBuffer {
    fn drop(&mut self) {
        self.device.sim().refund(self.len);
    }
}

impl fmt::Debug for DirectBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectBuffer")
            .field("device_id", &self.device.device_id)
            .field("len", &self.len)
            .finish()
    }
}

// ============================================================================
// VMM allocation
// ============================================================================

/// Growable mapped vector, grown once to the requested size
#[derive(Debug, Clone, Copy, Default)]
pub struct VmmAllocator;

impl VmmAllocator {
    fn driver(device: &GpuDevice) -> Result<DeviceVmmDriver> {
        if !device.supports_vmm()? {
            return Err(ReduceError::VmmUnsupported {
                device: device.device_id,
            });
        }
        #[cfg(feature = "cuda")]
        let driver = crate::vmm::CudaVmmDriver::new(device.clone());
        #[cfg(not(feature = "cuda"))]
        let driver = std::sync::Arc::clone(device.sim().address_space());
        Ok(driver)
    }
}

impl BufferAllocator for VmmAllocator {
    fn kind(&self) -> AllocatorKind {
        AllocatorKind::Vmm
    }

    fn allocate(&self, device: &GpuDevice, bytes: usize) -> Result<Box<dyn DeviceBuffer>> {
        let mut vector = VmmVector::new(Self::driver(device)?)?;
        vector.grow(bytes)?;
        debug!(
            device = device.device_id,
            bytes,
            mapped = vector.mapped_size(),
            "allocated mapped buffer"
        );
        Ok(Box::new(VmmBuffer { vector, len: bytes }))
    }

    fn footprint(&self, device: &GpuDevice, bytes: usize) -> Result<usize> {
        use crate::vmm::VmmDriver;
        let granularity = Self::driver(device)?.granularity()?;
        Ok(round_up(bytes, granularity))
    }
}

/// Buffer living in a [`VmmVector`]; the vector may map more than `len` bytes
pub struct VmmBuffer {
    vector: VmmVector<DeviceVmmDriver>,
    len: usize,
}

impl VmmBuffer {
    pub fn vector(&self) -> &VmmVector<DeviceVmmDriver> {
        &self.vector
    }
}

impl DeviceBuffer for VmmBuffer {
    fn device_id(&self) -> usize {
        use crate::vmm::VmmDriver;
        self.vector.driver().device_id()
    }

    fn len_bytes(&self) -> usize {
        self.len
    }

    fn memset(&mut self, byte: u8) -> Result<()> {
        self.vector.memset(byte)
    }

    fn read(&self) -> Result<Vec<u8>> {
        self.vector.read(self.len)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        check_write_len(self.device_id(), self.len, data.len())?;
        self.vector.write(data)
    }

    fn free(self: Box<Self>) -> Result<()> {
        let VmmBuffer { vector, .. } = *self;
        vector.free()
    }

    #[cfg(feature = "cuda")]
    fn device_ptr(&self) -> u64 {
        self.vector.pointer()
    }
}

impl fmt::Debug for VmmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmmBuffer")
            .field("len", &self.len)
            .field("vector", &self.vector)
            .finish()
    }
}

// ============================================================================
// Footprint estimation
// ============================================================================

/// Device memory one run needs on each device
#[derive(Debug, Clone, Serialize)]
pub struct MemoryEstimate {
    /// Bytes requested per buffer
    pub buffer_bytes: usize,
    /// Bytes actually occupied per buffer (after granularity rounding)
    pub footprint_bytes: usize,
    /// Send + receive footprint per device
    pub per_device_bytes: usize,
}

impl MemoryEstimate {
    pub fn for_device(config: &RunConfig, allocator: &dyn BufferAllocator, device: &GpuDevice) -> Result<Self> {
        let buffer_bytes = config.bytes_per_buffer();
        let footprint_bytes = allocator.footprint(device, buffer_bytes)?;
        Ok(Self {
            buffer_bytes,
            footprint_bytes,
            per_device_bytes: 2 * footprint_bytes,
        })
    }

    /// Fail early when the device cannot hold both buffers
    pub fn check_fits(&self, device: &GpuDevice) -> Result<()> {
        let (used, total) = device.memory_info()?;
        let available = total.saturating_sub(used);
        if self.per_device_bytes > available {
            return Err(ReduceError::InsufficientMemory {
                device: device.device_id,
                required_mb: self.per_device_bytes as f64 / (1024.0 * 1024.0),
                available_mb: available as f64 / (1024.0 * 1024.0),
            });
        }
        Ok(())
    }
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;
    use crate::gpu::{SimulatedDevice, SimulatedTopology};

    const G: usize = 64 * 1024;

    fn device(total_memory: usize, vmm_supported: bool) -> GpuDevice {
        let topology = SimulatedTopology::uniform(
            1,
            SimulatedDevice {
                total_memory,
                vmm_supported,
                granularity: G,
                ..SimulatedDevice::default()
            },
        );
        GpuDevice::with_topology(0, &topology).unwrap()
    }

    #[test]
    fn test_direct_buffer_roundtrip() {
        let dev = device(1 << 20, true);
        let mut buf = DirectAllocator.allocate(&dev, 100).unwrap();
        assert_eq!(buf.len_bytes(), 100);
        assert_eq!(buf.device_id(), 0);
        buf.memset(1).unwrap();
        assert!(buf.read().unwrap().iter().all(|&b| b == 1));

        let data: Vec<u8> = (0..100).collect();
        buf.write(&data).unwrap();
        assert_eq!(buf.read().unwrap(), data);
        assert!(buf.write(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_direct_buffer_frees_on_drop() {
        let dev = device(1 << 20, true);
        let buf = DirectAllocator.allocate(&dev, 4096).unwrap();
        assert_eq!(dev.memory_info().unwrap().0, 4096);
        drop(buf);
        assert_eq!(dev.memory_info().unwrap().0, 0);
    }

    #[test]
    fn test_direct_out_of_memory() {
        let dev = device(1000, true);
        let err = DirectAllocator.allocate(&dev, 2000).unwrap_err();
        assert!(matches!(err, ReduceError::Cuda { call: "cudaMalloc", .. }));
    }

    #[test]
    fn test_vmm_buffer_maps_rounded_size() {
        let dev = device(1 << 24, true);
        let mut buf = VmmAllocator.allocate(&dev, 1000).unwrap();
        assert_eq!(buf.len_bytes(), 1000);
        assert_eq!(dev.memory_info().unwrap().0, G);
        buf.memset(0x5a).unwrap();
        let data = buf.read().unwrap();
        assert_eq!(data.len(), 1000);
        assert!(data.iter().all(|&b| b == 0x5a));
        drop(buf);
        assert_eq!(dev.memory_info().unwrap().0, 0);
    }

    #[test]
    fn test_free_returns_memory() {
        let dev = device(1 << 24, true);
        for allocator in [allocator_for(AllocatorKind::Direct), allocator_for(AllocatorKind::Vmm)] {
            let buf = allocator.allocate(&dev, 1000).unwrap();
            assert!(dev.memory_info().unwrap().0 > 0);
            buf.free().unwrap();
            assert_eq!(dev.memory_info().unwrap().0, 0, "{}", allocator.kind());
        }
    }

    #[test]
    fn test_vmm_free_reports_driver_failure() {
        let dev = device(1 << 24, true);
        let buf = VmmAllocator.allocate(&dev, 1000).unwrap();
        dev.sim().address_space().fail_next("cuMemUnmap");
        let err = buf.free().unwrap_err();
        assert!(matches!(err, ReduceError::Cuda { call: "cuMemUnmap", .. }));
    }

    #[test]
    fn test_vmm_requires_support() {
        let dev = device(1 << 24, false);
        let err = VmmAllocator.allocate(&dev, 16).unwrap_err();
        assert!(matches!(err, ReduceError::VmmUnsupported { device: 0 }));
    }

    #[test]
    fn test_allocator_for_kind() {
        assert_eq!(allocator_for(AllocatorKind::Direct).kind(), AllocatorKind::Direct);
        assert_eq!(allocator_for(AllocatorKind::Vmm).kind(), AllocatorKind::Vmm);
    }

    #[test]
    fn test_estimate_rounds_vmm_footprint() {
        let dev = device(1 << 24, true);
        let config = RunConfig {
            count: 10,
            ..RunConfig::default()
        };
        let direct = MemoryEstimate::for_device(&config, &DirectAllocator, &dev).unwrap();
        assert_eq!(direct.per_device_bytes, 80);
        let vmm = MemoryEstimate::for_device(&config, &VmmAllocator, &dev).unwrap();
        assert_eq!(vmm.footprint_bytes, G);
        assert_eq!(vmm.per_device_bytes, 2 * G);
    }

    #[test]
    fn test_estimate_rejects_oversized_run() {
        let dev = device(1024, true);
        let config = RunConfig {
            count: 1024,
            ..RunConfig::default()
        };
        let estimate = MemoryEstimate::for_device(&config, &DirectAllocator, &dev).unwrap();
        let err = estimate.check_fits(&dev).unwrap_err();
        assert!(matches!(err, ReduceError::InsufficientMemory { device: 0, .. }));
    }
}
