//! GPU runtime surface: device selection, streams and synchronization
//!
//! With the `cuda` feature this wraps `cudarc` device handles. Without it,
//! devices are simulated on the host so the whole run can be exercised in
//! tests: each simulated device has a memory budget, a VMM capability flag and
//! its own virtual address space.

#[cfg(feature = "cuda")]
use std::sync::Arc;

use crate::error::{ReduceError, Result};

#[cfg(feature = "cuda")]
use crate::error::check_cuda;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaDevice, CudaStream};

#[cfg(not(feature = "cuda"))]
pub use host::{SimulatedDevice, SimulatedTopology};

/// GPU device wrapper
#[derive(Clone)]
pub struct GpuDevice {
    #[cfg(feature = "cuda")]
    device: Arc<CudaDevice>,
    #[cfg(not(feature = "cuda"))]
    sim: host::SimHandle,
    pub device_id: usize,
}

#[cfg(feature = "cuda")]
impl GpuDevice {
    /// Open device `device_id` (retains its primary context)
    #[track_caller]
    pub fn new(device_id: usize) -> Result<Self> {
        let device = check_cuda(CudaDevice::new(device_id), "cuDevicePrimaryCtxRetain")?;
        Ok(Self { device, device_id })
    }

    /// Make this device current on the calling thread
    #[track_caller]
    pub fn bind_to_thread(&self) -> Result<()> {
        check_cuda(self.device.bind_to_thread(), "cudaSetDevice")
    }

    #[track_caller]
    pub fn synchronize(&self) -> Result<()> {
        check_cuda(self.device.synchronize(), "cudaDeviceSynchronize")
    }

    /// Whether the device supports virtual address management
    #[track_caller]
    pub fn supports_vmm(&self) -> Result<bool> {
        use cudarc::driver::sys::CUdevice_attribute;
        let supported = check_cuda(
            self.device
                .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_VIRTUAL_ADDRESS_MANAGEMENT_SUPPORTED),
            "cuDeviceGetAttribute",
        )?;
        Ok(supported != 0)
    }

    pub fn name(&self) -> Result<String> {
        check_cuda(self.device.name(), "cuDeviceGetName")
    }

    /// Memory info (used, total) in bytes
    pub fn memory_info(&self) -> Result<(usize, usize)> {
        self.bind_to_thread()?;
        let (free, total) = check_cuda(cudarc::driver::result::mem_get_info(), "cudaMemGetInfo")?;
        Ok((total - free, total))
    }

    /// Create a new stream on this device
    #[track_caller]
    pub fn create_stream(&self) -> Result<DeviceStream> {
        let stream = check_cuda(self.device.fork_default_stream(), "cudaStreamCreate")?;
        Ok(DeviceStream {
            stream,
            device: self.clone(),
        })
    }

    /// Get the underlying CudaDevice (for advanced operations)
    pub fn cuda_device(&self) -> &Arc<CudaDevice> {
        &self.device
    }

    /// Number of visible devices
    pub fn count() -> Result<usize> {
        let n = check_cuda(CudaDevice::count(), "cudaGetDeviceCount")?;
        Ok(n.max(0) as usize)
    }
}

#[cfg(not(feature = "cuda"))]
impl GpuDevice {
    /// Open simulated device `device_id` from the default topology
    pub fn new(device_id: usize) -> Result<Self> {
        Self::with_topology(device_id, &SimulatedTopology::default())
    }

    /// Open simulated device `device_id` from `topology`
    pub fn with_topology(device_id: usize, topology: &SimulatedTopology) -> Result<Self> {
        let spec = topology
            .device(device_id)
            .ok_or(ReduceError::DeviceUnavailable { device: device_id })?;
        Ok(Self {
            sim: host::SimHandle::new(device_id, spec.clone()),
            device_id,
        })
    }

    pub fn bind_to_thread(&self) -> Result<()> {
        Ok(())
    }

    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    pub fn supports_vmm(&self) -> Result<bool> {
        Ok(self.sim.spec.vmm_supported)
    }

    pub fn name(&self) -> Result<String> {
        Ok(self.sim.spec.name.clone())
    }

    /// Memory info (used, total) in bytes
    pub fn memory_info(&self) -> Result<(usize, usize)> {
        Ok((self.sim.used_bytes(), self.sim.spec.total_memory))
    }

    pub fn create_stream(&self) -> Result<DeviceStream> {
        Ok(DeviceStream {
            device: self.clone(),
        })
    }

    /// Number of devices in the default simulated topology
    pub fn count() -> Result<usize> {
        Ok(SimulatedTopology::default().devices.len())
    }

    pub(crate) fn sim(&self) -> &host::SimHandle {
        &self.sim
    }
}

impl std::fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuDevice")
            .field("device_id", &self.device_id)
            .finish()
    }
}

/// Number of visible devices
pub fn device_count() -> Result<usize> {
    GpuDevice::count()
}

/// Command queue on one device
pub struct DeviceStream {
    #[cfg(feature = "cuda")]
    stream: CudaStream,
    device: GpuDevice,
}

impl DeviceStream {
    pub fn device(&self) -> &GpuDevice {
        &self.device
    }

    /// Block until all work queued on this stream has finished
    #[cfg(feature = "cuda")]
    #[track_caller]
    pub fn synchronize(&self) -> Result<()> {
        // SAFETY: the stream handle is owned by self and outlives the call
        let res = unsafe { cudarc::driver::result::stream::synchronize(self.stream.stream) };
        check_cuda(res, "cudaStreamSynchronize")
    }

    #[cfg(not(feature = "cuda"))]
    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// Raw stream handle for collective calls
    #[cfg(feature = "cuda")]
    pub fn raw(&self) -> cudarc::driver::sys::CUstream {
        self.stream.stream
    }
}

impl std::fmt::Debug for DeviceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceStream")
            .field("device_id", &self.device.device_id)
            .finish()
    }
}

/// The set of devices taking part in one run
pub struct MultiGpuContext {
    pub devices: Vec<GpuDevice>,
    pub num_gpus: usize,
}

impl MultiGpuContext {
    /// Open every ordinal in `ordinals`, in order
    pub fn new(ordinals: &[usize]) -> Result<Self> {
        let mut devices = Vec::with_capacity(ordinals.len());
        for &i in ordinals {
            devices.push(GpuDevice::new(i)?);
        }
        Ok(Self {
            num_gpus: devices.len(),
            devices,
        })
    }

    #[cfg(not(feature = "cuda"))]
    pub fn with_topology(ordinals: &[usize], topology: &SimulatedTopology) -> Result<Self> {
        let mut devices = Vec::with_capacity(ordinals.len());
        for &i in ordinals {
            devices.push(GpuDevice::with_topology(i, topology)?);
        }
        Ok(Self {
            num_gpus: devices.len(),
            devices,
        })
    }

    pub fn device(&self, idx: usize) -> &GpuDevice {
        assert!(
            idx < self.devices.len(),
            "GPU device index {} out of bounds (num_gpus={})",
            idx,
            self.num_gpus
        );
        &self.devices[idx]
    }

    pub fn ordinals(&self) -> Vec<usize> {
        self.devices.iter().map(|d| d.device_id).collect()
    }

    pub fn synchronize_all(&self) -> Result<()> {
        for device in &self.devices {
            device.bind_to_thread()?;
            device.synchronize()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MultiGpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiGpuContext")
            .field("num_gpus", &self.num_gpus)
            .field("ordinals", &self.ordinals())
            .finish()
    }
}

#[cfg(not(feature = "cuda"))]
mod host {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::error::{ReduceError, Result};
    use crate::vmm::SimulatedAddressSpace;

    /// Properties of one simulated device
    #[derive(Debug, Clone)]
    pub struct SimulatedDevice {
        pub name: String,
        pub total_memory: usize,
        pub vmm_supported: bool,
        /// Allocation granularity reported for VMM allocations
        pub granularity: usize,
    }

    impl Default for SimulatedDevice {
        fn default() -> Self {
            Self {
                name: "Simulated GPU".to_string(),
                total_memory: 24 * 1024 * 1024 * 1024,
                vmm_supported: true,
                granularity: 2 * 1024 * 1024,
            }
        }
    }

    /// Set of simulated devices, indexed by ordinal
    #[derive(Debug, Clone)]
    pub struct SimulatedTopology {
        pub devices: Vec<SimulatedDevice>,
    }

    impl SimulatedTopology {
        pub fn uniform(num_devices: usize, device: SimulatedDevice) -> Self {
            Self {
                devices: vec![device; num_devices],
            }
        }

        pub fn device(&self, ordinal: usize) -> Option<&SimulatedDevice> {
            self.devices.get(ordinal)
        }
    }

    impl Default for SimulatedTopology {
        fn default() -> Self {
            Self::uniform(8, SimulatedDevice::default())
        }
    }

    /// Shared state of an opened simulated device
    #[derive(Clone)]
    pub(crate) struct SimHandle {
        pub(crate) spec: SimulatedDevice,
        used: Arc<Mutex<usize>>,
        address_space: Arc<SimulatedAddressSpace>,
    }

    impl SimHandle {
        pub(crate) fn new(device_id: usize, spec: SimulatedDevice) -> Self {
            let used = Arc::new(Mutex::new(0));
            let address_space = Arc::new(SimulatedAddressSpace::with_budget(
                device_id,
                spec.granularity,
                spec.total_memory,
                Arc::clone(&used),
            ));
            Self {
                spec,
                used,
                address_space,
            }
        }

        pub(crate) fn used_bytes(&self) -> usize {
            *self.used.lock() + self.address_space.physical_bytes()
        }

        /// Account for a direct allocation, failing like cudaMalloc when out of memory
        #[track_caller]
        pub(crate) fn charge(&self, bytes: usize) -> Result<()> {
            let physical = self.address_space.physical_bytes();
            let mut used = self.used.lock();
            if *used + physical + bytes > self.spec.total_memory {
                return Err(ReduceError::cuda("cudaMalloc", "out of memory"));
            }
            *used += bytes;
            Ok(())
        }

        pub(crate) fn refund(&self, bytes: usize) {
            let mut used = self.used.lock();
            *used = used.saturating_sub(bytes);
        }

        pub(crate) fn address_space(&self) -> &Arc<SimulatedAddressSpace> {
            &self.address_space
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_context_opens_requested_ordinals() {
        let ctx = MultiGpuContext::new(&[1, 0]).unwrap();
        assert_eq!(ctx.num_gpus, 2);
        assert_eq!(ctx.ordinals(), vec![1, 0]);
        assert_eq!(ctx.device(0).device_id, 1);
        ctx.synchronize_all().unwrap();
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_missing_device_is_unavailable() {
        let topology = SimulatedTopology::uniform(1, SimulatedDevice::default());
        let err = MultiGpuContext::with_topology(&[0, 1], &topology).unwrap_err();
        assert!(matches!(err, ReduceError::DeviceUnavailable { device: 1 }));
    }

    #[test]
    #[cfg(not(feature = "cuda"))]
    fn test_simulated_memory_accounting() {
        let topology = SimulatedTopology::uniform(
            1,
            SimulatedDevice {
                total_memory: 1024,
                ..SimulatedDevice::default()
            },
        );
        let device = GpuDevice::with_topology(0, &topology).unwrap();
        device.sim().charge(1000).unwrap();
        assert_eq!(device.memory_info().unwrap(), (1000, 1024));
        let err = device.sim().charge(100).unwrap_err();
        assert!(err.to_string().contains("out of memory"));
        device.sim().refund(1000);
        assert_eq!(device.memory_info().unwrap().0, 0);
    }

    #[test]
    #[cfg(feature = "cuda")]
    fn test_gpu_device_creation() {
        let device = GpuDevice::new(0);
        assert!(device.is_ok());
    }
}
