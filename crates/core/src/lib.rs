//! gpureduce core - grouped all-reduce across the GPUs of one process
//!
//! One communicator per device is created in a single call and a single thread
//! issues every device's all-reduce inside a group bracket, then synchronizes
//! each device's stream.
//!
//! # Buffers
//!
//! | Allocator | How memory is obtained |
//! |-----------|------------------------|
//! | `direct` | one device allocation per buffer |
//! | `vmm` | reserved virtual range, physical chunks mapped on growth |
//!
//! # Backends
//!
//! With the `cuda` feature the runtime and collective calls go to the CUDA
//! driver and NCCL through `cudarc`. Without it devices are simulated on the
//! host, which keeps the whole pipeline testable on machines without GPUs.

pub mod comm;
pub mod config;
pub mod error;
pub mod gpu;
pub mod memory;
pub mod runner;
pub mod tensor;
pub mod vmm;

pub use comm::{CommGroup, GroupCall};
pub use config::{AllocatorKind, RunConfig};
pub use error::{ReduceError, Result};
pub use gpu::{device_count, DeviceStream, GpuDevice, MultiGpuContext};
pub use memory::{allocator_for, BufferAllocator, DeviceBuffer, DirectAllocator, MemoryEstimate, VmmAllocator};
pub use runner::{expected_result, AllReduceRun, Outcome, RunReport};
pub use tensor::{DType, ReduceOp};
pub use vmm::{SimulatedAddressSpace, VmmDriver, VmmVector};

#[cfg(not(feature = "cuda"))]
pub use gpu::{SimulatedDevice, SimulatedTopology};
#[cfg(feature = "cuda")]
pub use vmm::CudaVmmDriver;
